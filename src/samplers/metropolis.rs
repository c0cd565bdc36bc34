//! Primary-sample-space Metropolis sampler.
//!
//! Keeps a current and a proposed value per recorded dimension. The seed
//! path is reproduced by lazily drawing initial values from a replayed
//! uniform stream; after the chain starts, the helper generator is swapped
//! for the worker's own RNG. The writable half (`seek`/`put_*`) lets path
//! inversion overwrite the proposal with the numbers that regenerate a path
//! under a different bidirectional split.

// lumen
use crate::core::lumen::{erf_inv, Float, ONE_MINUS_EPSILON, SQRT_2};
use crate::core::rng::UniformSampler;
use crate::samplers::SAMPLE_BLOCK_SIZE;

#[derive(Debug, Default, Copy, Clone)]
struct PrimarySample {
    value: Float,
    value_backup: Float,
    last_modification: i64,
    modify_backup: i64,
}

impl PrimarySample {
    fn backup(&mut self) {
        self.value_backup = self.value;
        self.modify_backup = self.last_modification;
    }
    fn restore(&mut self) {
        self.value = self.value_backup;
        self.last_modification = self.modify_backup;
    }
}

#[derive(Debug, Clone)]
pub struct MetropolisSampler {
    gaussian_mutation: bool,
    sigma: Float,
    helper: UniformSampler,
    /// sparse: block-padding dimensions are never materialized, so lazy
    /// initialization consumes the replay stream in exact read order
    samples: Vec<Option<PrimarySample>>,
    current_iteration: i64,
    large_step: bool,
    frozen: bool,
    last_large_step_iteration: i64,
    idx: usize,
}

impl MetropolisSampler {
    /// `replay` must be positioned at the state recorded before the seed
    /// path was traced; the first evaluation then reproduces it exactly.
    pub fn new(gaussian_mutation: bool, replay: UniformSampler, reserve: usize) -> Self {
        MetropolisSampler {
            gaussian_mutation,
            sigma: 0.01,
            helper: replay,
            samples: Vec::with_capacity(reserve),
            current_iteration: 0,
            large_step: false,
            frozen: false,
            last_large_step_iteration: 0,
            idx: 0,
        }
    }

    /// Swap the replay stream for the worker's own generator once the seed
    /// state has been committed.
    pub fn set_helper_generator(&mut self, helper: UniformSampler) {
        self.helper = helper;
    }

    pub fn start_path(&mut self, _pixel_index: u32, _sample_index: u32) {
        self.idx = 0;
    }

    pub fn advance_path(&mut self) {
        self.idx = (self.idx / SAMPLE_BLOCK_SIZE as usize + 1) * SAMPLE_BLOCK_SIZE as usize;
    }

    /// Position the cursor at the dimension block of the given path vertex.
    pub fn seek(&mut self, vertex: usize) {
        self.idx = vertex * SAMPLE_BLOCK_SIZE as usize;
    }

    pub fn large_step(&mut self) {
        self.current_iteration += 1;
        self.large_step = true;
        self.frozen = false;
    }

    pub fn small_step(&mut self) {
        self.current_iteration += 1;
        self.large_step = false;
        self.frozen = false;
    }

    /// Begin a mutation that keeps current values unless `put_*` overwrites
    /// them; used by the technique-change mutation.
    pub fn freeze(&mut self) {
        self.current_iteration += 1;
        self.large_step = false;
        self.frozen = true;
    }

    pub fn set_large_step(&mut self, large: bool) {
        if large {
            self.large_step();
        } else {
            self.small_step();
        }
    }

    pub fn accept(&mut self) {
        if self.large_step {
            self.last_large_step_iteration = self.current_iteration;
        }
    }

    pub fn reject(&mut self) {
        for sample in self.samples.iter_mut().flatten() {
            if sample.last_modification == self.current_iteration {
                sample.restore();
            }
        }
        self.current_iteration -= 1;
    }

    /// Pin a dimension to an explicit value without consuming the helper
    /// stream; multiplexed MLT stores the technique index this way.
    pub fn set_random_element(&mut self, index: usize, value: Float) {
        self.put_slot(index, value);
    }

    /// Materialize a slot with an explicit value; never touches the helper.
    fn put_slot(&mut self, index: usize, value: Float) {
        while self.samples.len() <= index {
            self.samples.push(None);
        }
        match &mut self.samples[index] {
            Some(sample) => {
                if sample.last_modification < self.current_iteration {
                    sample.backup();
                }
                sample.value = value;
                sample.last_modification = self.current_iteration;
            }
            slot @ None => {
                *slot = Some(PrimarySample {
                    value,
                    value_backup: value,
                    last_modification: self.current_iteration,
                    modify_backup: self.current_iteration,
                });
            }
        }
    }

    /// Materialize a slot lazily from the helper stream on first read.
    fn ensure_value(&mut self, index: usize) {
        while self.samples.len() <= index {
            self.samples.push(None);
        }
        if self.samples[index].is_none() {
            let value = self.helper.next_1d();
            self.samples[index] = Some(PrimarySample {
                value,
                value_backup: value,
                last_modification: self.current_iteration,
                modify_backup: self.current_iteration,
            });
        }
    }

    fn mutate(&mut self, index: usize) {
        if self.sample(index).last_modification < self.last_large_step_iteration {
            let value = self.helper.next_1d();
            let last = self.last_large_step_iteration;
            let sample = self.sample_mut(index);
            sample.value = value;
            sample.last_modification = last;
        }
        self.sample_mut(index).backup();
        if self.large_step {
            let value = self.helper.next_1d();
            self.sample_mut(index).value = value;
        } else if !self.frozen {
            let n_small = self.current_iteration - self.sample(index).last_modification;
            let mut value = self.sample(index).value;
            if self.gaussian_mutation {
                let normal_sample = SQRT_2 * erf_inv(2.0 * self.helper.next_1d() - 1.0);
                let eff_sigma = self.sigma * (n_small as Float).sqrt();
                value += normal_sample * eff_sigma;
                value -= value.floor();
            } else {
                for _ in 0..n_small {
                    let u = self.helper.next_1d();
                    let (magnitude, add) = if u < 0.5 {
                        (2.0 * u, true)
                    } else {
                        (2.0 * (u - 0.5), false)
                    };
                    let s1 = 1.0 / 1024.0;
                    let s2 = 1.0 / 64.0;
                    let dv = s2 * (-((s2 / s1) as Float).ln() * magnitude).exp();
                    if add {
                        value += dv;
                    } else {
                        value -= dv;
                    }
                    value -= value.floor();
                }
            }
            self.sample_mut(index).value = value;
        }
        let iteration = self.current_iteration;
        self.sample_mut(index).last_modification = iteration;
    }

    fn sample(&self, index: usize) -> &PrimarySample {
        self.samples[index].as_ref().expect("slot materialized")
    }

    fn sample_mut(&mut self, index: usize) -> &mut PrimarySample {
        self.samples[index].as_mut().expect("slot materialized")
    }

    pub fn next_1d(&mut self) -> Float {
        let index = self.idx;
        self.idx += 1;
        let fresh = index >= self.samples.len() || self.samples[index].is_none();
        self.ensure_value(index);
        if !fresh && self.sample(index).last_modification < self.current_iteration {
            self.mutate(index);
        }
        self.sample(index).value.min(ONE_MINUS_EPSILON)
    }

    pub fn untracked_1d(&mut self) -> Float {
        self.helper.next_1d()
    }

    pub fn put_1d(&mut self, value: Float) {
        let index = self.idx;
        self.idx += 1;
        self.put_slot(index, value);
    }

    pub fn put_2d(&mut self, a: Float, b: Float) {
        self.put_1d(a);
        self.put_1d(b);
    }

    pub fn put_boolean(&mut self, p_true: Float, choice: bool) {
        let value = if choice {
            p_true * 0.5
        } else {
            p_true + (1.0 - p_true) * 0.5
        };
        self.put_1d(value);
    }

    pub fn put_discrete(&mut self, num_choices: u32, choice: u32) {
        self.put_1d((choice as Float + 0.5) / num_choices as Float);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_sampler() -> MetropolisSampler {
        MetropolisSampler::new(true, UniformSampler::new(0xBEEF), 64)
    }

    #[test]
    fn seed_evaluation_replays_uniform_stream() {
        let replay = UniformSampler::new(42);
        let mut reference = replay;
        let mut sampler = MetropolisSampler::new(false, replay, 16);
        sampler.start_path(0, 0);
        for _ in 0..8 {
            assert_eq!(sampler.next_1d(), reference.next_1d().min(ONE_MINUS_EPSILON));
        }
    }

    #[test]
    fn reject_restores_previous_values() {
        let mut sampler = seed_sampler();
        sampler.start_path(0, 0);
        let before: Vec<Float> = (0..6).map(|_| sampler.next_1d()).collect();
        sampler.accept();

        sampler.small_step();
        sampler.start_path(0, 0);
        let mutated: Vec<Float> = (0..6).map(|_| sampler.next_1d()).collect();
        assert_ne!(before, mutated);
        sampler.reject();

        sampler.small_step();
        sampler.reject();
        sampler.start_path(0, 0);
        // unrelated rejected mutations leave the committed state intact
        sampler.freeze();
        sampler.start_path(0, 0);
        let frozen: Vec<Float> = (0..6).map(|_| sampler.next_1d()).collect();
        assert_eq!(before, frozen);
    }

    #[test]
    fn put_overrides_and_replays() {
        let mut sampler = seed_sampler();
        sampler.start_path(0, 0);
        for _ in 0..4 {
            sampler.next_1d();
        }
        sampler.accept();

        sampler.freeze();
        sampler.seek(0);
        sampler.put_2d(0.25, 0.75);
        sampler.put_boolean(0.5, true);
        sampler.put_discrete(4, 2);
        sampler.start_path(0, 0);
        assert_eq!(sampler.next_1d(), 0.25);
        assert_eq!(sampler.next_1d(), 0.75);
        assert!(sampler.next_1d() < 0.5);
        assert_eq!((sampler.next_1d() * 4.0) as u32, 2);
        sampler.accept();
    }

    #[test]
    fn large_step_resamples_stale_dimensions() {
        let mut sampler = seed_sampler();
        sampler.start_path(0, 0);
        let first = sampler.next_1d();
        sampler.accept();
        sampler.large_step();
        sampler.start_path(0, 0);
        let resampled = sampler.next_1d();
        assert_ne!(first, resampled);
        sampler.accept();
    }

    #[test]
    fn block_seek_matches_advance_path() {
        let mut sampler = seed_sampler();
        sampler.start_path(0, 0);
        sampler.next_1d();
        sampler.advance_path();
        sampler.next_1d();
        sampler.accept();

        sampler.freeze();
        sampler.seek(1);
        sampler.put_1d(0.5);
        sampler.start_path(0, 0);
        sampler.next_1d();
        sampler.advance_path();
        assert_eq!(sampler.next_1d(), 0.5);
    }
}
