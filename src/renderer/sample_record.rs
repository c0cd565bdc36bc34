//! Per-variance-tile sample statistics driving adaptive sampling.

// std
use std::io::{Read, Write};
// others
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
// lumen
use crate::core::lumen::Float;
use crate::core::spectrum::Spectrum;

#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct SampleRecord {
    pub sample_count: u32,
    pub next_sample_count: u32,
    pub sample_index: u32,
    pub adaptive_weight: Float,
    pub mean: Float,
    pub running_variance: Float,
}

impl SampleRecord {
    /// Welford update over sample luminance.
    pub fn add_sample(&mut self, x: Float) {
        self.sample_count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.sample_count as Float;
        self.running_variance += delta * (x - self.mean);
    }

    pub fn add_spectrum(&mut self, c: &Spectrum) {
        self.add_sample(c.luminance());
    }

    pub fn variance(&self) -> Float {
        if self.sample_count < 2 {
            return 0.0;
        }
        self.running_variance / (self.sample_count - 1) as Float
    }

    /// Relative error estimate; the 1e-3 floor keeps near-black tiles from
    /// dominating the adaptive distribution.
    pub fn error_estimate(&self) -> Float {
        if self.sample_count < 2 {
            return 0.0;
        }
        self.variance() / (self.sample_count as Float * self.mean.powi(2).max(1e-3))
    }

    pub fn save_state<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_u32::<LittleEndian>(self.sample_count)?;
        out.write_u32::<LittleEndian>(self.next_sample_count)?;
        out.write_u32::<LittleEndian>(self.sample_index)?;
        out.write_f32::<LittleEndian>(self.adaptive_weight)?;
        out.write_f32::<LittleEndian>(self.mean)?;
        out.write_f32::<LittleEndian>(self.running_variance)?;
        Ok(())
    }

    pub fn load_state<R: Read>(&mut self, input: &mut R) -> std::io::Result<()> {
        self.sample_count = input.read_u32::<LittleEndian>()?;
        self.next_sample_count = input.read_u32::<LittleEndian>()?;
        self.sample_index = input.read_u32::<LittleEndian>()?;
        self.adaptive_weight = input.read_f32::<LittleEndian>()?;
        self.mean = input.read_f32::<LittleEndian>()?;
        self.running_variance = input.read_f32::<LittleEndian>()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welford_matches_two_pass_variance() {
        let values = [0.5_f32, 1.5, 0.25, 3.0, 0.75, 2.0];
        let mut record = SampleRecord::default();
        for &v in &values {
            record.add_sample(v);
        }
        let mean: Float = values.iter().sum::<Float>() / values.len() as Float;
        let var: Float = values.iter().map(|v| (v - mean).powi(2)).sum::<Float>()
            / (values.len() - 1) as Float;
        assert!((record.mean - mean).abs() < 1e-5);
        assert!((record.variance() - var).abs() < 1e-5);
        assert!(record.running_variance >= 0.0);
    }

    #[test]
    fn empty_record_is_inert() {
        let record = SampleRecord::default();
        assert_eq!(record.mean, 0.0);
        assert_eq!(record.variance(), 0.0);
        assert_eq!(record.error_estimate(), 0.0);
    }

    #[test]
    fn state_roundtrip_is_exact() {
        let mut record = SampleRecord::default();
        record.add_sample(1.25);
        record.add_sample(0.5);
        record.next_sample_count = 9;
        record.sample_index = 3;
        record.adaptive_weight = 0.125;

        let mut buf = Vec::new();
        record.save_state(&mut buf).unwrap();
        assert_eq!(buf.len(), 24);

        let mut restored = SampleRecord::default();
        restored.load_state(&mut &buf[..]).unwrap();
        assert_eq!(record, restored);
    }
}
