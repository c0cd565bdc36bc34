//! Per-path random number streams.
//!
//! Every path sample owns a generator that is `start_path`-ed once and
//! `advance_path`-d between scattering events; dimensions are grouped into
//! 16-wide per-vertex blocks so the Metropolis sampler can `seek` to the
//! block of any vertex when inverting a path.

pub mod metropolis;
pub mod sobol;
pub mod uniform;

// std
use std::io::{Read, Write};
// others
use byteorder::{ReadBytesExt, WriteBytesExt};
// lumen
use crate::core::lumen::Float;
use crate::core::rng::UniformSampler;

pub use metropolis::MetropolisSampler;
pub use sobol::SobolPathSampler;
pub use uniform::UniformPathSampler;

/// Writable view of the Metropolis sampler used by path inversion.
pub type WritableSampler = MetropolisSampler;

/// Dimensions reserved per path vertex.
pub const SAMPLE_BLOCK_SIZE: u32 = 16;

const TAG_UNIFORM: u8 = 0;
const TAG_SOBOL: u8 = 1;
const TAG_METROPOLIS: u8 = 2;

#[derive(Debug, Clone)]
pub enum PathSampleGenerator {
    Uniform(UniformPathSampler),
    Sobol(SobolPathSampler),
    Metropolis(MetropolisSampler),
}

impl PathSampleGenerator {
    pub fn uniform(seed: u64) -> Self {
        PathSampleGenerator::Uniform(UniformPathSampler::new(seed))
    }

    pub fn sobol(seed: u32) -> Self {
        PathSampleGenerator::Sobol(SobolPathSampler::new(seed))
    }

    pub fn start_path(&mut self, pixel_index: u32, sample_index: u32) {
        match self {
            PathSampleGenerator::Uniform(s) => s.start_path(pixel_index, sample_index),
            PathSampleGenerator::Sobol(s) => s.start_path(pixel_index, sample_index),
            PathSampleGenerator::Metropolis(s) => s.start_path(pixel_index, sample_index),
        }
    }

    pub fn advance_path(&mut self) {
        match self {
            PathSampleGenerator::Uniform(_) => {}
            PathSampleGenerator::Sobol(s) => s.advance_path(),
            PathSampleGenerator::Metropolis(s) => s.advance_path(),
        }
    }

    pub fn next_1d(&mut self) -> Float {
        match self {
            PathSampleGenerator::Uniform(s) => s.next_1d(),
            PathSampleGenerator::Sobol(s) => s.next_1d(),
            PathSampleGenerator::Metropolis(s) => s.next_1d(),
        }
    }

    pub fn next_2d(&mut self) -> (Float, Float) {
        let a = self.next_1d();
        let b = self.next_1d();
        (a, b)
    }

    pub fn next_boolean(&mut self, p_true: Float) -> bool {
        match self {
            // Discrete decisions never burn low-discrepancy dimensions.
            PathSampleGenerator::Sobol(s) => s.supplemental_1d() < p_true,
            _ => self.next_1d() < p_true,
        }
    }

    pub fn next_discrete(&mut self, num_choices: u32) -> u32 {
        let u = match self {
            PathSampleGenerator::Sobol(s) => s.supplemental_1d(),
            _ => self.next_1d(),
        };
        ((u * num_choices as Float) as u32).min(num_choices - 1)
    }

    /// Draw a value without recording it in the mutable sample vector.
    pub fn untracked_1d(&mut self) -> Float {
        match self {
            PathSampleGenerator::Uniform(s) => s.next_1d(),
            PathSampleGenerator::Sobol(s) => s.supplemental_1d(),
            PathSampleGenerator::Metropolis(s) => s.untracked_1d(),
        }
    }

    pub fn as_metropolis_mut(&mut self) -> Option<&mut MetropolisSampler> {
        match self {
            PathSampleGenerator::Metropolis(s) => Some(s),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            PathSampleGenerator::Uniform(_) => TAG_UNIFORM,
            PathSampleGenerator::Sobol(_) => TAG_SOBOL,
            PathSampleGenerator::Metropolis(_) => TAG_METROPOLIS,
        }
    }

    pub fn save_state<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_u8(self.tag())?;
        match self {
            PathSampleGenerator::Uniform(s) => s.save_state(out),
            PathSampleGenerator::Sobol(s) => s.save_state(out),
            PathSampleGenerator::Metropolis(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "metropolis sampler state is not checkpointable",
            )),
        }
    }

    pub fn load_state<R: Read>(&mut self, input: &mut R) -> std::io::Result<()> {
        let tag = input.read_u8()?;
        if tag != self.tag() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "sampler variant tag mismatch",
            ));
        }
        match self {
            PathSampleGenerator::Uniform(s) => s.load_state(input),
            PathSampleGenerator::Sobol(s) => s.load_state(input),
            PathSampleGenerator::Metropolis(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "metropolis sampler state is not checkpointable",
            )),
        }
    }
}

/// Per-scene sampler factory: low discrepancy or plain uniform.
pub fn new_path_sampler(use_sobol: bool, rng: &mut UniformSampler) -> PathSampleGenerator {
    use crate::core::lumen::hash_u32;
    if use_sobol {
        PathSampleGenerator::sobol(hash_u32(rng.next_u32()))
    } else {
        PathSampleGenerator::uniform(u64::from(hash_u32(rng.next_u32())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_save_load_resumes_stream() {
        let mut sampler = PathSampleGenerator::uniform(99);
        sampler.start_path(4, 2);
        sampler.next_2d();

        let mut buf = Vec::new();
        sampler.save_state(&mut buf).unwrap();
        let reference: Vec<Float> = (0..6).map(|_| sampler.next_1d()).collect();

        let mut restored = PathSampleGenerator::uniform(0);
        restored.load_state(&mut &buf[..]).unwrap();
        let resumed: Vec<Float> = (0..6).map(|_| restored.next_1d()).collect();
        assert_eq!(reference, resumed);
    }

    #[test]
    fn load_rejects_wrong_variant() {
        let sampler = PathSampleGenerator::uniform(1);
        let mut buf = Vec::new();
        sampler.save_state(&mut buf).unwrap();
        let mut other = PathSampleGenerator::sobol(1);
        assert!(other.load_state(&mut &buf[..]).is_err());
    }

    #[test]
    fn discrete_stays_in_range() {
        let mut sampler = PathSampleGenerator::uniform(5);
        sampler.start_path(0, 0);
        for _ in 0..100 {
            assert!(sampler.next_discrete(7) < 7);
        }
    }
}
