//! Shared Markov-chain bookkeeping: buffered splats, large-step
//! normalization statistics, and per-mutation acceptance trackers.

// std
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
// lumen
use crate::core::film::Film;
use crate::core::geometry::Point2f;
use crate::core::lumen::Float;
use crate::core::spectrum::Spectrum;
use crate::integrators::bdpt::ImagePyramid;

#[derive(Debug, Copy, Clone)]
struct Splat {
    s: u32,
    t: u32,
    pixel: Point2f,
    value: Spectrum,
}

/// Queue of the splats produced by one path sample; applied to the splat
/// buffer scaled by the Metropolis weights.
pub struct SplatQueue {
    splats: Vec<Splat>,
    total_luminance: Float,
}

impl SplatQueue {
    pub fn new(capacity: usize) -> Self {
        SplatQueue {
            splats: Vec::with_capacity(capacity),
            total_luminance: 0.0,
        }
    }

    pub fn clear(&mut self) {
        self.splats.clear();
        self.total_luminance = 0.0;
    }

    pub fn add_splat(&mut self, s: usize, t: usize, pixel: Point2f, value: Spectrum) {
        if value.is_nan() {
            return;
        }
        self.splats.push(Splat {
            s: s as u32,
            t: t as u32,
            pixel,
            value,
        });
        self.total_luminance += value.luminance();
    }

    pub fn total_luminance(&self) -> Float {
        self.total_luminance
    }

    pub fn apply(&self, film: &Film, scale: Float) {
        for splat in &self.splats {
            film.splat(splat.pixel, splat.value * scale);
        }
    }

    pub fn apply_pyramid(&self, pyramid: &ImagePyramid, scale: Float) {
        for splat in &self.splats {
            pyramid.splat(
                splat.s as usize,
                splat.t as usize,
                splat.pixel,
                splat.value * scale,
            );
        }
    }
}

/// Accumulates large-step luminance; per-length normalization factors come
/// from these statistics alone.
#[derive(Debug, Default, Copy, Clone)]
pub struct LargeStepTracker {
    cumulative_luminance: f64,
    num_large_steps: u64,
}

impl LargeStepTracker {
    pub fn add(&mut self, luminance: f64) {
        self.cumulative_luminance += luminance;
        self.num_large_steps += 1;
    }

    pub fn merge(&mut self, other: &LargeStepTracker) {
        self.cumulative_luminance += other.cumulative_luminance;
        self.num_large_steps += other.num_large_steps;
    }

    pub fn average(&self) -> f64 {
        self.cumulative_luminance / self.num_large_steps.max(1) as f64
    }

    pub fn sum(&self) -> f64 {
        self.cumulative_luminance
    }

    pub fn sample_count(&self) -> u64 {
        self.num_large_steps
    }

    pub fn set_sample_count(&mut self, count: u64) {
        self.num_large_steps = count;
    }

    pub fn clear(&mut self) {
        self.cumulative_luminance = 0.0;
        self.num_large_steps = 0;
    }
}

/// Atomic per-path-length accept/reject counters for one mutation kind.
pub struct ChainTracker {
    accepts: Vec<AtomicU64>,
    rejects: Vec<AtomicU64>,
}

impl ChainTracker {
    fn new(num_lengths: usize) -> Self {
        let mut accepts = Vec::with_capacity(num_lengths);
        let mut rejects = Vec::with_capacity(num_lengths);
        for _ in 0..num_lengths {
            accepts.push(AtomicU64::new(0));
            rejects.push(AtomicU64::new(0));
        }
        ChainTracker { accepts, rejects }
    }

    pub fn accept(&self, length: usize) {
        if let Some(counter) = self.accepts.get(length) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reject(&self, length: usize) {
        if let Some(counter) = self.rejects.get(length) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn num_mutations(&self, length: usize) -> u64 {
        self.accepts[length].load(Ordering::Relaxed) + self.rejects[length].load(Ordering::Relaxed)
    }

    pub fn acceptance_ratio(&self, length: usize) -> f64 {
        let accepts = self.accepts[length].load(Ordering::Relaxed) as f64;
        let total = self.num_mutations(length) as f64;
        if total == 0.0 {
            0.0
        } else {
            accepts / total
        }
    }
}

/// Mutation statistics for the multiplexed family of integrators.
pub struct MultiplexedStats {
    num_lengths: usize,
    large_step: ChainTracker,
    small_step: ChainTracker,
    technique_change: ChainTracker,
    inversion_failures: AtomicU32,
}

impl MultiplexedStats {
    pub fn new(max_bounces: usize) -> Self {
        let num_lengths = max_bounces + 1;
        MultiplexedStats {
            num_lengths,
            large_step: ChainTracker::new(num_lengths),
            small_step: ChainTracker::new(num_lengths),
            technique_change: ChainTracker::new(num_lengths),
            inversion_failures: AtomicU32::new(0),
        }
    }

    pub fn large_step(&self) -> &ChainTracker {
        &self.large_step
    }

    pub fn small_step(&self) -> &ChainTracker {
        &self.small_step
    }

    pub fn technique_change(&self) -> &ChainTracker {
        &self.technique_change
    }

    pub fn record_inversion_failure(&self) {
        self.inversion_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Log per-length acceptance ratios at teardown.
    pub fn report(&self) {
        for length in 0..self.num_lengths {
            let large = self.large_step.num_mutations(length);
            let small = self.small_step.num_mutations(length);
            let technique = self.technique_change.num_mutations(length);
            if large + small + technique == 0 {
                continue;
            }
            tracing::info!(
                length,
                large_attempts = large,
                large_acceptance = self.large_step.acceptance_ratio(length),
                small_attempts = small,
                small_acceptance = self.small_step.acceptance_ratio(length),
                technique_attempts = technique,
                technique_acceptance = self.technique_change.acceptance_ratio(length),
                "mutation statistics"
            );
        }
        let failures = self.inversion_failures.load(Ordering::Relaxed);
        if failures > 0 {
            tracing::info!(failures, "non-invertible technique-change proposals");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splat_queue_tracks_luminance() {
        let mut queue = SplatQueue::new(4);
        queue.add_splat(1, 2, Point2f::new(0.5, 0.5), Spectrum::new(1.0));
        queue.add_splat(0, 3, Point2f::new(1.5, 0.5), Spectrum::new(0.5));
        assert!((queue.total_luminance() - 1.5).abs() < 1e-5);
        queue.clear();
        assert_eq!(queue.total_luminance(), 0.0);
    }

    #[test]
    fn large_step_tracker_averages() {
        let mut tracker = LargeStepTracker::default();
        tracker.add(2.0);
        tracker.add(4.0);
        assert!((tracker.average() - 3.0).abs() < 1e-9);
        let mut merged = LargeStepTracker::default();
        merged.merge(&tracker);
        assert_eq!(merged.sample_count(), 2);
    }
}
