//! Low-discrepancy path sampler over an Owen-scrambled Sobol' sequence.
//!
//! Dimensions past the sequence's table fall back to a companion uniform
//! sampler; without the fallback, deep paths would reuse correlated
//! dimensions and produce structured artifacts.

// std
use std::io::{Read, Write};
// others
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
// lumen
use crate::core::lumen::{hash_u32, Float, ONE_MINUS_EPSILON};
use crate::core::rng::UniformSampler;
use crate::samplers::SAMPLE_BLOCK_SIZE;

/// Dimension cap of the backing sequence tables; see DESIGN.md.
pub const SOBOL_MAX_DIMENSIONS: u32 = 256;

#[derive(Debug, Clone)]
pub struct SobolPathSampler {
    supplemental: UniformSampler,
    seed: u32,
    scramble: u32,
    index: u32,
    dimension: u32,
    cached_set: u32,
    cache: [f32; 4],
}

impl SobolPathSampler {
    pub fn new(seed: u32) -> Self {
        SobolPathSampler {
            supplemental: UniformSampler::new(u64::from(seed)),
            seed,
            scramble: 0,
            index: 0,
            dimension: 0,
            cached_set: u32::MAX,
            cache: [0.0; 4],
        }
    }

    /// Decorrelates neighbouring sample indices within a pixel without
    /// leaving the sequence.
    fn permuted_index(&self) -> u32 {
        (self.index & !0xFF) | (self.index.wrapping_add(self.scramble) & 0xFF)
    }

    pub fn start_path(&mut self, pixel_index: u32, sample_index: u32) {
        self.scramble = self.seed ^ hash_u32(pixel_index);
        self.index = sample_index;
        self.dimension = 0;
        self.cached_set = u32::MAX;
    }

    pub fn advance_path(&mut self) {
        self.dimension =
            (self.dimension / SAMPLE_BLOCK_SIZE + 1) * SAMPLE_BLOCK_SIZE;
    }

    pub fn next_1d(&mut self) -> Float {
        if self.dimension >= SOBOL_MAX_DIMENSIONS {
            return self.supplemental.next_1d();
        }
        let set = self.dimension / 4;
        if set != self.cached_set {
            self.cache = sobol_burley::sample_4d(self.permuted_index(), set, self.scramble);
            self.cached_set = set;
        }
        let value = self.cache[(self.dimension % 4) as usize];
        self.dimension += 1;
        value.min(ONE_MINUS_EPSILON)
    }

    pub fn supplemental_1d(&mut self) -> Float {
        self.supplemental.next_1d()
    }

    pub fn save_state<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_u32::<LittleEndian>(self.seed)?;
        self.supplemental.save_state(out)
    }

    pub fn load_state<R: Read>(&mut self, input: &mut R) -> std::io::Result<()> {
        self.seed = input.read_u32::<LittleEndian>()?;
        self.supplemental.load_state(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_deterministic_per_index() {
        let mut a = SobolPathSampler::new(123);
        let mut b = SobolPathSampler::new(123);
        a.start_path(17, 4);
        b.start_path(17, 4);
        for _ in 0..20 {
            assert_eq!(a.next_1d(), b.next_1d());
        }
    }

    #[test]
    fn advance_path_moves_to_fresh_block() {
        let mut sampler = SobolPathSampler::new(1);
        sampler.start_path(0, 0);
        sampler.next_1d();
        sampler.advance_path();
        assert_eq!(sampler.dimension, SAMPLE_BLOCK_SIZE);
        sampler.advance_path();
        assert_eq!(sampler.dimension, 2 * SAMPLE_BLOCK_SIZE);
    }

    #[test]
    fn dimension_overflow_falls_back_to_uniform() {
        let mut sampler = SobolPathSampler::new(7);
        sampler.start_path(0, 0);
        sampler.dimension = SOBOL_MAX_DIMENSIONS;
        for _ in 0..16 {
            let u = sampler.next_1d();
            assert!((0.0..1.0).contains(&u));
        }
    }
}
