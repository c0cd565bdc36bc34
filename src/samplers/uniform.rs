//! Plain uniform path sampler.

// std
use std::io::{Read, Write};
// lumen
use crate::core::lumen::Float;
use crate::core::rng::UniformSampler;

#[derive(Debug, Clone)]
pub struct UniformPathSampler {
    sampler: UniformSampler,
}

impl UniformPathSampler {
    pub fn new(seed: u64) -> Self {
        UniformPathSampler {
            sampler: UniformSampler::new(seed),
        }
    }

    pub fn from_sampler(sampler: UniformSampler) -> Self {
        UniformPathSampler { sampler }
    }

    pub fn start_path(&mut self, _pixel_index: u32, _sample_index: u32) {}

    pub fn next_1d(&mut self) -> Float {
        self.sampler.next_1d()
    }

    pub fn sampler(&self) -> &UniformSampler {
        &self.sampler
    }

    pub fn save_state<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        self.sampler.save_state(out)
    }

    pub fn load_state<R: Read>(&mut self, input: &mut R) -> std::io::Result<()> {
        self.sampler.load_state(input)
    }
}
