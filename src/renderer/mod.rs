//! Render driver machinery shared by the tile-based integrators: image
//! dicing, adaptive sample distribution, spp scheduling and checkpoint
//! framing.

pub mod sample_record;
pub mod thread_pool;

// std
use std::io::{Read, Write};
use std::sync::Mutex;
// others
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
// lumen
use crate::core::error::{RenderError, RenderResult};
use crate::core::lumen::Float;
use crate::core::rng::UniformSampler;
use crate::samplers::{new_path_sampler, PathSampleGenerator};

pub use sample_record::SampleRecord;
pub use thread_pool::{ideal_thread_count, parallel_for, TaskGroup, ThreadPool};

pub const TILE_SIZE: u32 = 16;
pub const VARIANCE_TILE_SIZE: u32 = 4;
pub const ADAPTIVE_THRESHOLD: u32 = 16;

const CHECKPOINT_MAGIC: u32 = 0x4C4D_4E43; // "LMNC"
const CHECKPOINT_VERSION: u16 = 1;

/// Advance the sample schedule: fixed step when configured, doubling
/// otherwise, clamped to the target.
pub fn advance_spp(current: u32, step: u32, target: u32) -> u32 {
    let next = if step > 0 {
        current + step
    } else {
        (current * 2).max(1)
    };
    next.min(target)
}

pub struct ImageTile {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub sampler: PathSampleGenerator,
    pub supplemental: PathSampleGenerator,
}

/// Tiles, per-variance-tile statistics, and the adaptive distribution that
/// decides each tile's next sample batch.
pub struct TileDriver {
    w: u32,
    h: u32,
    variance_w: u32,
    variance_h: u32,
    adaptive: bool,
    tiles: Vec<Mutex<ImageTile>>,
    records: Vec<Mutex<SampleRecord>>,
    rng: Mutex<UniformSampler>,
}

impl TileDriver {
    pub fn new(w: u32, h: u32, use_sobol: bool, adaptive: bool, seed: u32) -> Self {
        let mut rng = UniformSampler::new(u64::from(seed));
        let mut tiles = Vec::new();
        for y in (0..h).step_by(TILE_SIZE as usize) {
            for x in (0..w).step_by(TILE_SIZE as usize) {
                tiles.push(Mutex::new(ImageTile {
                    x,
                    y,
                    w: TILE_SIZE.min(w - x),
                    h: TILE_SIZE.min(h - y),
                    sampler: new_path_sampler(use_sobol, &mut rng),
                    supplemental: new_path_sampler(false, &mut rng),
                }));
            }
        }
        let variance_w = (w + VARIANCE_TILE_SIZE - 1) / VARIANCE_TILE_SIZE;
        let variance_h = (h + VARIANCE_TILE_SIZE - 1) / VARIANCE_TILE_SIZE;
        let mut records = Vec::new();
        records.resize_with((variance_w * variance_h) as usize, || {
            Mutex::new(SampleRecord::default())
        });
        TileDriver {
            w,
            h,
            variance_w,
            variance_h,
            adaptive,
            tiles,
            records,
            rng: Mutex::new(rng),
        }
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.w, self.h)
    }

    pub fn tile_count(&self) -> u32 {
        self.tiles.len() as u32
    }

    pub fn tile(&self, id: u32) -> &Mutex<ImageTile> {
        &self.tiles[id as usize]
    }

    pub fn record_count(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn record_for_pixel(&self, x: u32, y: u32) -> &Mutex<SampleRecord> {
        let idx = x / VARIANCE_TILE_SIZE + (y / VARIANCE_TILE_SIZE) * self.variance_w;
        &self.records[idx as usize]
    }

    fn error_percentile_95(&self) -> Float {
        let mut errors = Vec::with_capacity(self.records.len());
        for record in &self.records {
            let mut record = record.lock().unwrap();
            record.adaptive_weight = record.error_estimate();
            if record.adaptive_weight > 0.0 {
                errors.push(record.adaptive_weight);
            }
        }
        if errors.is_empty() {
            return 0.0;
        }
        errors.sort_by(|a, b| a.partial_cmp(b).unwrap());
        errors[(errors.len() * 95) / 100]
    }

    /// Two-pass 4-neighbourhood max, forward then backward, to avoid
    /// speckled sampling density.
    fn dilate_adaptive_weights(&self) {
        let w = self.variance_w as usize;
        let h = self.variance_h as usize;
        let mut weights: Vec<Float> = self
            .records
            .iter()
            .map(|r| r.lock().unwrap().adaptive_weight)
            .collect();
        for y in 0..h {
            for x in 0..w {
                let idx = x + y * w;
                if y + 1 < h {
                    weights[idx] = weights[idx].max(weights[idx + w]);
                }
                if x + 1 < w {
                    weights[idx] = weights[idx].max(weights[idx + 1]);
                }
            }
        }
        for y in (0..h).rev() {
            for x in (0..w).rev() {
                let idx = x + y * w;
                if y > 0 {
                    weights[idx] = weights[idx].max(weights[idx - w]);
                }
                if x > 0 {
                    weights[idx] = weights[idx].max(weights[idx - 1]);
                }
            }
        }
        for (record, weight) in self.records.iter().zip(weights) {
            record.lock().unwrap().adaptive_weight = weight;
        }
    }

    /// Distribute `(spp - 1) * w * h` samples proportionally to the
    /// adaptive weights, with deterministic fractional carryover; every
    /// variance tile receives at least one sample.
    fn distribute_adaptive_samples(&self, spp: u32) {
        let mut total_weight = 0.0_f64;
        for record in &self.records {
            total_weight += f64::from(record.lock().unwrap().adaptive_weight);
        }
        let adaptive_budget = u64::from(spp - 1) * u64::from(self.w) * u64::from(self.h);
        let budget_per_tile =
            adaptive_budget / u64::from(VARIANCE_TILE_SIZE * VARIANCE_TILE_SIZE);
        let weight_to_sample_factor = budget_per_tile as f64 / total_weight.max(1e-12);

        let mut pixel_pdf = 0.0_f64;
        for record in &self.records {
            let mut record = record.lock().unwrap();
            let fractional = f64::from(record.adaptive_weight) * weight_to_sample_factor;
            let mut samples = fractional as u64;
            pixel_pdf += fractional - samples as f64;
            if pixel_pdf >= 1.0 {
                samples += 1;
                pixel_pdf -= 1.0;
            }
            record.next_sample_count = samples as u32 + 1;
        }
    }

    /// Prepare the next segment. Returns false when the adaptive error is
    /// zero everywhere and nothing remains to refine.
    pub fn generate_work(&self, current_spp: u32, next_spp: u32) -> bool {
        for record in &self.records {
            let mut record = record.lock().unwrap();
            record.sample_index += record.next_sample_count;
        }

        let spp_count = next_spp - current_spp;
        if self.adaptive && current_spp >= ADAPTIVE_THRESHOLD {
            let max_error = self.error_percentile_95();
            if max_error == 0.0 {
                return false;
            }
            for record in &self.records {
                let mut record = record.lock().unwrap();
                let clamped = record.adaptive_weight.min(max_error);
                record.adaptive_weight = clamped;
            }
            self.dilate_adaptive_weights();
            self.distribute_adaptive_samples(spp_count);
        } else {
            for record in &self.records {
                record.lock().unwrap().next_sample_count = spp_count;
            }
        }
        true
    }

    pub fn supplemental_1d(&self) -> Float {
        self.rng.lock().unwrap().next_1d()
    }

    /// Greyscale per-pixel raster of the relative-variance estimates, for
    /// the optional variance output.
    pub fn variance_raster(&self) -> Vec<crate::core::spectrum::Spectrum> {
        let mut out = Vec::with_capacity((self.w * self.h) as usize);
        for y in 0..self.h {
            for x in 0..self.w {
                let error = self.record_for_pixel(x, y).lock().unwrap().error_estimate();
                out.push(crate::core::spectrum::Spectrum::new(error));
            }
        }
        out
    }

    /// Fixed serialization order: records, then per-tile sampler states
    /// (primary, then supplemental).
    pub fn save_state<W: Write>(&self, out: &mut W) -> RenderResult<()> {
        out.write_u32::<LittleEndian>(self.records.len() as u32)?;
        for record in &self.records {
            record.lock().unwrap().save_state(out)?;
        }
        out.write_u32::<LittleEndian>(self.tiles.len() as u32)?;
        for tile in &self.tiles {
            let tile = tile.lock().unwrap();
            tile.sampler.save_state(out)?;
            tile.supplemental.save_state(out)?;
        }
        Ok(())
    }

    pub fn load_state<R: Read>(&self, input: &mut R) -> RenderResult<()> {
        let record_count = input.read_u32::<LittleEndian>()?;
        if record_count != self.records.len() as u32 {
            return Err(RenderError::CheckpointMismatch(format!(
                "expected {} sample records, found {}",
                self.records.len(),
                record_count
            )));
        }
        for record in &self.records {
            record.lock().unwrap().load_state(input)?;
        }
        let tile_count = input.read_u32::<LittleEndian>()?;
        if tile_count != self.tiles.len() as u32 {
            return Err(RenderError::CheckpointMismatch(format!(
                "expected {} tiles, found {}",
                self.tiles.len(),
                tile_count
            )));
        }
        for tile in &self.tiles {
            let mut tile = tile.lock().unwrap();
            tile.sampler.load_state(input)?;
            tile.supplemental.load_state(input)?;
        }
        Ok(())
    }
}

/// Checkpoint header preceding the driver state.
pub fn write_checkpoint_header<W: Write>(
    out: &mut W,
    integrator_tag: u8,
    w: u32,
    h: u32,
    current_spp: u32,
) -> RenderResult<()> {
    out.write_u32::<LittleEndian>(CHECKPOINT_MAGIC)?;
    out.write_u16::<LittleEndian>(CHECKPOINT_VERSION)?;
    out.write_u8(integrator_tag)?;
    out.write_u32::<LittleEndian>(w)?;
    out.write_u32::<LittleEndian>(h)?;
    out.write_u32::<LittleEndian>(current_spp)?;
    Ok(())
}

/// Validate a checkpoint header; returns the stored spp.
pub fn read_checkpoint_header<R: Read>(
    input: &mut R,
    integrator_tag: u8,
    w: u32,
    h: u32,
) -> RenderResult<u32> {
    let magic = input.read_u32::<LittleEndian>()?;
    if magic != CHECKPOINT_MAGIC {
        return Err(RenderError::CheckpointMismatch("bad magic".into()));
    }
    let version = input.read_u16::<LittleEndian>()?;
    if version != CHECKPOINT_VERSION {
        return Err(RenderError::CheckpointMismatch(format!(
            "unsupported version {}",
            version
        )));
    }
    let tag = input.read_u8()?;
    if tag != integrator_tag {
        return Err(RenderError::CheckpointMismatch(
            "integrator kind changed".into(),
        ));
    }
    let cw = input.read_u32::<LittleEndian>()?;
    let ch = input.read_u32::<LittleEndian>()?;
    if cw != w || ch != h {
        return Err(RenderError::CheckpointMismatch(format!(
            "resolution changed: {}x{} vs {}x{}",
            cw, ch, w, h
        )));
    }
    Ok(input.read_u32::<LittleEndian>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spp_schedule_doubles_and_clamps() {
        assert_eq!(advance_spp(0, 0, 64), 1);
        assert_eq!(advance_spp(1, 0, 64), 2);
        assert_eq!(advance_spp(32, 0, 48), 48);
        assert_eq!(advance_spp(16, 8, 64), 24);
    }

    #[test]
    fn adaptive_distribution_hits_budget() {
        let mut driver = TileDriver::new(64, 64, false, true, 1);
        // seed every record with some variance
        let mut value = 0.1;
        for record in &mut driver.records {
            let mut record = record.lock().unwrap();
            for i in 0..20 {
                record.add_sample(value * (1.0 + (i % 3) as Float));
            }
            value += 0.01;
        }
        let spp = 4_u32;
        assert!(driver.generate_work(ADAPTIVE_THRESHOLD, ADAPTIVE_THRESHOLD + spp));
        let total: u64 = driver
            .records
            .iter()
            .map(|r| u64::from(r.lock().unwrap().next_sample_count))
            .sum();
        let budget = u64::from(spp - 1) * 64 * 64 / u64::from(VARIANCE_TILE_SIZE * VARIANCE_TILE_SIZE);
        let num_tiles = driver.record_count() as u64;
        // every tile gets >= 1 plus the distributed budget
        assert!((total as i64 - (budget + num_tiles) as i64).abs() <= 2);
        for record in &mut driver.records {
            assert!(record.lock().unwrap().next_sample_count >= 1);
        }
    }

    #[test]
    fn uniform_phase_assigns_flat_batches() {
        let mut driver = TileDriver::new(32, 32, false, true, 1);
        assert!(driver.generate_work(0, 4));
        for record in &mut driver.records {
            assert_eq!(record.lock().unwrap().next_sample_count, 4);
        }
    }

    #[test]
    fn dilation_spreads_maxima() {
        let mut driver = TileDriver::new(32, 32, false, true, 1);
        let idx = (driver.variance_w + 1) as usize; // (1, 1)
        driver.records[idx].lock().unwrap().adaptive_weight = 8.0;
        driver.dilate_adaptive_weights();
        let w = driver.variance_w as usize;
        for &neighbour in &[idx - 1, idx + 1, idx - w, idx + w] {
            assert_eq!(
                driver.records[neighbour].lock().unwrap().adaptive_weight,
                8.0
            );
        }
        // a far corner stays untouched
        let far = driver.records.len() - 1;
        assert_eq!(driver.records[far].lock().unwrap().adaptive_weight, 0.0);
    }

    #[test]
    fn driver_state_roundtrip() {
        let mut driver = TileDriver::new(48, 32, false, true, 7);
        driver.records[3].lock().unwrap().add_sample(0.5);
        driver.generate_work(0, 2);

        let mut buf = Vec::new();
        driver.save_state(&mut buf).unwrap();

        let mut restored = TileDriver::new(48, 32, false, true, 99);
        restored.load_state(&mut &buf[..]).unwrap();
        assert_eq!(
            *restored.records[3].lock().unwrap(),
            *driver.records[3].lock().unwrap()
        );

        // mismatched geometry refuses to resume
        let mut wrong = TileDriver::new(32, 32, false, true, 1);
        assert!(wrong.load_state(&mut &buf[..]).is_err());
    }

    #[test]
    fn checkpoint_header_roundtrip_and_mismatch() {
        let mut buf = Vec::new();
        write_checkpoint_header(&mut buf, 3, 128, 96, 17).unwrap();
        let spp = read_checkpoint_header(&mut &buf[..], 3, 128, 96).unwrap();
        assert_eq!(spp, 17);
        assert!(read_checkpoint_header(&mut &buf[..], 4, 128, 96).is_err());
        assert!(read_checkpoint_header(&mut &buf[..], 3, 64, 96).is_err());
    }
}
