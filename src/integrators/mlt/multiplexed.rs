//! Multiplexed Metropolis light transport: per-path-length Markov chains
//! over bidirectional samples, with the technique split (s, t) carried as
//! the emitter sampler's first dimension.

// std
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
// others
use serde::{Deserialize, Serialize};
// lumen
use crate::core::error::{RenderError, RenderResult};
use crate::core::film::Film;
use crate::core::geometry::Point2f;
use crate::core::lumen::{int_lerp, Float};
use crate::core::rng::UniformSampler;
use crate::integrators::bdpt::{ImagePyramid, LightPath};
use crate::integrators::mlt::common::{LargeStepTracker, MultiplexedStats, SplatQueue};
use crate::integrators::trace_base::{TraceBase, TraceSettings};
use crate::renderer::advance_spp;
use crate::renderer::thread_pool::{TaskGroup, ThreadPool};
use crate::samplers::{MetropolisSampler, PathSampleGenerator, UniformPathSampler};
use crate::scene::TraceableScene;

fn default_sample_pool() -> u32 {
    3000
}

fn default_large_step_probability() -> Float {
    0.3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiplexedMltSettings {
    #[serde(flatten)]
    pub trace: TraceSettings,
    #[serde(default = "default_sample_pool")]
    pub initial_sample_pool: u32,
    #[serde(default = "default_large_step_probability")]
    pub large_step_probability: Float,
    #[serde(default)]
    pub gaussian_mutation: bool,
    #[serde(default)]
    pub image_pyramid: bool,
}

impl Default for MultiplexedMltSettings {
    fn default() -> Self {
        MultiplexedMltSettings {
            trace: TraceSettings {
                max_bounces: 16,
                ..Default::default()
            },
            initial_sample_pool: default_sample_pool(),
            large_step_probability: default_large_step_probability(),
            gaussian_mutation: false,
            image_pyramid: false,
        }
    }
}

pub struct MarkovChain {
    camera_sampler: PathSampleGenerator,
    emitter_sampler: PathSampleGenerator,
    camera_path: LightPath,
    emitter_path: LightPath,
    current_splats: SplatQueue,
    proposed_splats: SplatQueue,
    current_s: usize,
}

/// Candidate recorded during the seed-pool phase.
#[derive(Debug, Default, Copy, Clone)]
pub struct PathCandidate {
    pub camera_state: u64,
    pub emitter_state: u64,
    pub sequence: u64,
    pub luminance: Float,
    pub luminance_sum: f64,
    pub s: u32,
    pub t: u32,
}

pub struct MultiplexedMltTracer {
    base: TraceBase,
    settings: MultiplexedMltSettings,
    rng: UniformSampler,
    camera_rng: UniformSampler,
    emitter_rng: UniformSampler,
    chains: Vec<Option<MarkovChain>>,
    light_splat_scale: Float,
}

impl MultiplexedMltTracer {
    pub fn new(
        scene: Arc<TraceableScene>,
        settings: MultiplexedMltSettings,
        seed: u64,
        thread_id: u32,
    ) -> Self {
        let (w, h) = scene.cam().resolution();
        let max_bounces = settings.trace.max_bounces as usize;
        MultiplexedMltTracer {
            base: TraceBase::new(scene, settings.trace.clone(), thread_id),
            settings,
            rng: UniformSampler::with_sequence(seed, u64::from(thread_id) * 3),
            camera_rng: UniformSampler::with_sequence(seed, u64::from(thread_id) * 3 + 1),
            emitter_rng: UniformSampler::with_sequence(seed, u64::from(thread_id) * 3 + 2),
            chains: (0..=max_bounces).map(|_| None).collect(),
            light_splat_scale: 1.0 / (w as Float * h as Float),
        }
    }

    pub fn base(&self) -> &TraceBase {
        &self.base
    }

    fn camera_pixel(camera_path: &LightPath) -> Point2f {
        camera_path
            .vertex(0)
            .camera_record()
            .and_then(|record| record.pixel)
            .map(|p| Point2f::new(p.x as Float + 0.5, p.y as Float + 0.5))
            .unwrap_or_default()
    }

    fn trace_paths(
        &self,
        camera_path: &mut LightPath,
        camera_sampler: &mut PathSampleGenerator,
        emitter_path: &mut LightPath,
        emitter_sampler: &mut PathSampleGenerator,
        s: usize,
        t: usize,
    ) {
        let scene = &self.base.scene;
        if t > 0 {
            camera_path.start_camera_path(scene.cam().clone(), None);
            camera_path.trace(scene, &self.base, camera_sampler, Some(t));
        } else {
            camera_path.clear();
        }
        if s > 0 {
            match scene.choose_light(emitter_sampler) {
                Some((light, pdf)) => {
                    emitter_path.start_emitter_path(light, pdf);
                    emitter_path.trace(scene, &self.base, emitter_sampler, Some(s));
                }
                None => emitter_path.clear(),
            }
        } else {
            emitter_path.clear();
        }
    }

    /// Evaluate one sample of a fixed path length; the split is read from
    /// the emitter stream's first dimension. Returns the realized s.
    #[allow(clippy::too_many_arguments)]
    fn eval_sample(
        &self,
        camera_path: &mut LightPath,
        camera_sampler: &mut PathSampleGenerator,
        emitter_path: &mut LightPath,
        emitter_sampler: &mut PathSampleGenerator,
        length: usize,
        queue: &mut SplatQueue,
    ) -> usize {
        queue.clear();
        camera_sampler.start_path(0, 0);
        emitter_sampler.start_path(0, 0);

        let s = ((emitter_sampler.next_1d() * (length as Float + 1.0)) as usize).min(length);
        let t = length + 1 - s;

        self.trace_paths(camera_path, camera_sampler, emitter_path, emitter_sampler, s, t);

        if camera_path.len() != t || emitter_path.len() != s {
            return s;
        }
        if t > 0 && !camera_path.vertex(t - 1).connectable() {
            return s;
        }
        if s > 0 && !emitter_path.vertex(s - 1).connectable() {
            return s;
        }

        let max_bounce = self.settings.trace.max_bounces as usize;
        if s == 0 {
            let v = camera_path.bdpt_weighted_path_emission(t, t, None);
            if v.max_component() > 0.0 {
                queue.add_splat(s, t, Self::camera_pixel(camera_path), v);
            }
        } else if t == 1 {
            if let Some((weight, pixel)) = LightPath::bdpt_camera_connect(
                &self.base,
                camera_path,
                emitter_path,
                s,
                max_bounce,
                None,
            ) {
                queue.add_splat(s, t, pixel, weight * self.light_splat_scale);
            }
        } else {
            let v = LightPath::bdpt_connect(
                &self.base,
                camera_path,
                emitter_path,
                s,
                t,
                max_bounce,
                None,
            );
            if v.max_component() > 0.0 {
                queue.add_splat(s, t, Self::camera_pixel(camera_path), v);
            }
        }
        s
    }

    /// Trace one full candidate pair with plain uniform streams, handing
    /// every realized (s, t) contribution to `add_candidate`.
    pub fn trace_candidate_path(
        &mut self,
        camera_path: &mut LightPath,
        emitter_path: &mut LightPath,
        queue: &mut SplatQueue,
        mut add_candidate: impl FnMut(Float, usize, usize),
    ) -> (u64, u64, u64) {
        let camera_state = self.camera_rng.state();
        let emitter_state = self.emitter_rng.state();
        let sequence = self.camera_rng.sequence();

        let mut camera_sampler =
            PathSampleGenerator::Uniform(UniformPathSampler::from_sampler(self.camera_rng));
        let mut emitter_sampler =
            PathSampleGenerator::Uniform(UniformPathSampler::from_sampler(self.emitter_rng));
        camera_sampler.start_path(0, 0);
        emitter_sampler.start_path(0, 0);

        let max_bounces = self.settings.trace.max_bounces as usize;
        // candidates never consume the technique dimension; the chains pin
        // it explicitly
        self.trace_paths(
            camera_path,
            &mut camera_sampler,
            emitter_path,
            &mut emitter_sampler,
            max_bounces,
            max_bounces + 1,
        );

        let camera_len = camera_path.len();
        let emitter_len = emitter_path.len();
        for s in 0..=emitter_len {
            let upper = (max_bounces + 1 - s).min(camera_len);
            let lower = 1;
            for t in lower..=upper {
                if s + t < 2 {
                    continue;
                }
                if t > 0 && !camera_path.vertex(t - 1).connectable() {
                    continue;
                }
                if s > 0 && !emitter_path.vertex(s - 1).connectable() {
                    continue;
                }
                if s == 0 {
                    let v = camera_path.bdpt_weighted_path_emission(t, t, None);
                    if v.max_component() > 0.0 {
                        queue.add_splat(s, t, Self::camera_pixel(camera_path), v);
                        add_candidate(v.luminance(), s, t);
                    }
                } else if t == 1 {
                    if let Some((weight, pixel)) = LightPath::bdpt_camera_connect(
                        &self.base,
                        camera_path,
                        emitter_path,
                        s,
                        max_bounces,
                        None,
                    ) {
                        let v = weight * self.light_splat_scale;
                        queue.add_splat(s, t, pixel, v);
                        add_candidate(v.luminance(), s, t);
                    }
                } else {
                    let v = LightPath::bdpt_connect(
                        &self.base,
                        camera_path,
                        emitter_path,
                        s,
                        t,
                        max_bounces,
                        None,
                    );
                    if v.max_component() > 0.0 {
                        queue.add_splat(s, t, Self::camera_pixel(camera_path), v);
                        add_candidate(v.luminance(), s, t);
                    }
                }
            }
        }

        if let PathSampleGenerator::Uniform(inner) = &camera_sampler {
            self.camera_rng = *inner.sampler();
        }
        if let PathSampleGenerator::Uniform(inner) = &emitter_sampler {
            self.emitter_rng = *inner.sampler();
        }
        (camera_state, emitter_state, sequence)
    }

    /// Rebuild a chain at the recorded seed state.
    pub fn start_sample_chain(&mut self, candidate: &PathCandidate) {
        let s = candidate.s as usize;
        let t = candidate.t as usize;
        let length = s + t - 1;
        let reserve = (length + 2) * 16;

        let camera_replay = UniformSampler::from_state(candidate.camera_state, candidate.sequence);
        let emitter_replay =
            UniformSampler::from_state(candidate.emitter_state, candidate.sequence + 1);

        let mut chain = MarkovChain {
            camera_sampler: PathSampleGenerator::Metropolis(MetropolisSampler::new(
                self.settings.gaussian_mutation,
                camera_replay,
                reserve,
            )),
            emitter_sampler: PathSampleGenerator::Metropolis(MetropolisSampler::new(
                self.settings.gaussian_mutation,
                emitter_replay,
                reserve,
            )),
            camera_path: LightPath::new(length + 2),
            emitter_path: LightPath::new(length + 1),
            current_splats: SplatQueue::new(4),
            proposed_splats: SplatQueue::new(4),
            current_s: s,
        };

        if let Some(metropolis) = chain.emitter_sampler.as_metropolis_mut() {
            metropolis.set_random_element(0, (s as Float + 0.5) / (length as Float + 1.0));
        }

        let MarkovChain {
            camera_sampler,
            emitter_sampler,
            camera_path,
            emitter_path,
            current_splats,
            ..
        } = &mut chain;
        let realized = self.eval_sample(
            camera_path,
            camera_sampler,
            emitter_path,
            emitter_sampler,
            length,
            current_splats,
        );
        chain.current_s = realized;

        if let Some(metropolis) = chain.camera_sampler.as_metropolis_mut() {
            metropolis.accept();
            metropolis.set_helper_generator(UniformSampler::with_sequence(
                self.rng.next_u32() as u64,
                self.rng.sequence() + 7,
            ));
        }
        if let Some(metropolis) = chain.emitter_sampler.as_metropolis_mut() {
            metropolis.accept();
            metropolis.set_helper_generator(UniformSampler::with_sequence(
                self.rng.next_u32() as u64,
                self.rng.sequence() + 8,
            ));
        }

        let replayed = chain.current_splats.total_luminance();
        if (replayed - candidate.luminance).abs()
            > 1e-3 * candidate.luminance.abs().max(1e-6)
        {
            tracing::warn!(
                expected = candidate.luminance,
                got = replayed,
                "seed replay diverged from recorded luminance"
            );
        }

        self.chains[length] = Some(chain);
    }

    /// Run the chain of one path length for `chain_length` mutations.
    #[allow(clippy::too_many_arguments)]
    pub fn run_sample_chain(
        &mut self,
        path_length: usize,
        chain_length: u64,
        stats: &MultiplexedStats,
        luminance_scale: Float,
        film: &Film,
        pyramid: Option<&ImagePyramid>,
    ) -> LargeStepTracker {
        let mut large_steps = LargeStepTracker::default();
        let mut chain = match self.chains[path_length].take() {
            Some(chain) => chain,
            None => return large_steps,
        };

        let mut accumulated_weight = 0.0_f32;
        for _ in 0..chain_length {
            let large_step = self.rng.next_1d() < self.settings.large_step_probability;
            if let Some(m) = chain.camera_sampler.as_metropolis_mut() {
                m.set_large_step(large_step);
            }
            if let Some(m) = chain.emitter_sampler.as_metropolis_mut() {
                m.set_large_step(large_step);
            }

            let MarkovChain {
                camera_sampler,
                emitter_sampler,
                camera_path,
                emitter_path,
                proposed_splats,
                ..
            } = &mut chain;
            let proposed_s = self.eval_sample(
                camera_path,
                camera_sampler,
                emitter_path,
                emitter_sampler,
                path_length,
                proposed_splats,
            );

            let current_i = chain.current_splats.total_luminance();
            let mut proposed_i = chain.proposed_splats.total_luminance();
            if proposed_i.is_nan() {
                proposed_i = 0.0;
            }

            if large_step {
                large_steps.add(f64::from(proposed_i) * (path_length as f64 + 1.0));
            }

            let a = if current_i == 0.0 {
                1.0
            } else {
                (proposed_i / current_i).min(1.0)
            };
            accumulated_weight += 1.0 - a;

            if self.rng.next_1d() < a {
                if current_i != 0.0 {
                    chain
                        .current_splats
                        .apply(film, luminance_scale * accumulated_weight / current_i);
                }
                std::mem::swap(&mut chain.current_splats, &mut chain.proposed_splats);
                accumulated_weight = a;

                if let Some(m) = chain.camera_sampler.as_metropolis_mut() {
                    m.accept();
                }
                if let Some(m) = chain.emitter_sampler.as_metropolis_mut() {
                    m.accept();
                }
                if large_step {
                    stats.large_step().accept(path_length);
                } else if chain.current_s != proposed_s {
                    stats.technique_change().accept(path_length);
                } else {
                    stats.small_step().accept(path_length);
                }
                chain.current_s = proposed_s;
            } else {
                if proposed_i != 0.0 {
                    chain
                        .proposed_splats
                        .apply(film, luminance_scale * a / proposed_i);
                }
                if let Some(m) = chain.camera_sampler.as_metropolis_mut() {
                    m.reject();
                }
                if let Some(m) = chain.emitter_sampler.as_metropolis_mut() {
                    m.reject();
                }
                if large_step {
                    stats.large_step().reject(path_length);
                } else if chain.current_s != proposed_s {
                    stats.technique_change().reject(path_length);
                } else {
                    stats.small_step().reject(path_length);
                }
            }

            if let Some(pyramid) = pyramid {
                let lum = chain.current_splats.total_luminance();
                if lum > 0.0 {
                    chain.current_splats.apply_pyramid(pyramid, luminance_scale / lum);
                }
            }
        }

        let current_i = chain.current_splats.total_luminance();
        if current_i != 0.0 && accumulated_weight > 0.0 {
            chain
                .current_splats
                .apply(film, luminance_scale * accumulated_weight / current_i);
        }

        self.chains[path_length] = Some(chain);
        large_steps
    }
}

struct SubTaskSeedData {
    range_start: u32,
    range_length: u32,
    independent: Vec<LargeStepTracker>,
}

struct MmltState {
    scene: Arc<TraceableScene>,
    film: Arc<Film>,
    settings: MultiplexedMltSettings,
    tracers: Vec<Mutex<MultiplexedMltTracer>>,
    candidates: Mutex<Vec<PathCandidate>>,
    subtask_data: Vec<Mutex<SubTaskSeedData>>,
    stats: MultiplexedStats,
    pyramid: Option<ImagePyramid>,
    num_seed_paths_traced: AtomicU64,
    abort: AtomicBool,
}

pub struct MultiplexedMltIntegrator {
    pub settings: MultiplexedMltSettings,
    state: Option<Arc<MmltState>>,
    pool: Option<Arc<ThreadPool>>,
    group: Option<Arc<TaskGroup>>,
    rng: UniformSampler,
    luminance_per_length: Vec<LargeStepTracker>,
    luminance_scale: f64,
    chains_launched: bool,
    current_spp: u32,
    next_spp: u32,
    target_spp: u32,
    spp_step: u32,
}

impl MultiplexedMltIntegrator {
    pub fn new(settings: MultiplexedMltSettings) -> Self {
        MultiplexedMltIntegrator {
            settings,
            state: None,
            pool: None,
            group: None,
            rng: UniformSampler::new(0xBA5E_BA11),
            luminance_per_length: Vec::new(),
            luminance_scale: 0.0,
            chains_launched: false,
            current_spp: 0,
            next_spp: 0,
            target_spp: 0,
            spp_step: 0,
        }
    }

    pub fn prepare_for_render(
        &mut self,
        scene: Arc<TraceableScene>,
        film: Arc<Film>,
        pool: Arc<ThreadPool>,
        seed: u32,
    ) {
        let renderer = scene.renderer_settings();
        self.target_spp = renderer.spp;
        self.spp_step = renderer.spp_step;
        self.current_spp = 0;
        self.next_spp = advance_spp(0, self.spp_step, self.target_spp);
        self.chains_launched = false;
        self.rng = UniformSampler::new(u64::from(seed));
        film.set_color_buffer_weight(0.0);
        film.set_splat_weight(0.0);

        let (w, h) = scene.cam().resolution();
        let pyramid = if self.settings.image_pyramid {
            Some(ImagePyramid::new(
                self.settings.trace.max_bounces as usize,
                w,
                h,
            ))
        } else {
            None
        };

        let mut tracers = Vec::new();
        let mut subtask_data = Vec::new();
        for i in 0..pool.thread_count() {
            tracers.push(Mutex::new(MultiplexedMltTracer::new(
                scene.clone(),
                self.settings.clone(),
                u64::from(seed),
                i,
            )));
            subtask_data.push(Mutex::new(SubTaskSeedData {
                range_start: 0,
                range_length: 0,
                independent: vec![
                    LargeStepTracker::default();
                    self.settings.trace.max_bounces as usize + 1
                ],
            }));
        }
        self.state = Some(Arc::new(MmltState {
            scene,
            film,
            settings: self.settings.clone(),
            tracers,
            candidates: Mutex::new(vec![
                PathCandidate::default();
                self.settings.initial_sample_pool as usize
            ]),
            subtask_data,
            stats: MultiplexedStats::new(self.settings.trace.max_bounces as usize),
            pyramid,
            num_seed_paths_traced: AtomicU64::new(0),
            abort: AtomicBool::new(false),
        }));
        self.pool = Some(pool);
    }

    pub fn teardown_after_render(&mut self) {
        if let Some(state) = &self.state {
            state.stats.report();
        }
        self.group = None;
        self.state = None;
        self.pool = None;
    }

    pub fn done(&self) -> bool {
        self.chains_launched && self.current_spp >= self.target_spp
    }

    pub fn current_spp(&self) -> u32 {
        self.current_spp
    }

    pub fn pyramid(&self) -> Option<&ImagePyramid> {
        self.state.as_ref().and_then(|s| s.pyramid.as_ref())
    }

    fn trace_sample_pool(state: &Arc<MmltState>, task_id: u32, num_tasks: u32) {
        let pool_size = state.settings.initial_sample_pool;
        let ray_base = int_lerp(0, pool_size, task_id, num_tasks);
        let ray_tail = int_lerp(0, pool_size, task_id + 1, num_tasks);

        let max_bounces = state.settings.trace.max_bounces as usize;
        let mut camera_path = LightPath::new(max_bounces + 2);
        let mut emitter_path = LightPath::new(max_bounces + 1);
        let mut queue = SplatQueue::new((max_bounces + 2) * (max_bounces + 2));

        let mut tracer = state.tracers[task_id as usize].lock().unwrap();
        let mut num_paths_traced = 0_u64;
        let mut candidate_idx = ray_base;
        let mut ray_idx = 0_u32;

        while ray_idx < ray_tail - ray_base && candidate_idx < ray_tail {
            if state.abort.load(Ordering::Relaxed) {
                break;
            }
            num_paths_traced += 1;
            queue.clear();

            let mut locals: Vec<(Float, usize, usize)> = Vec::new();
            let (camera_state, emitter_state, sequence) = tracer.trace_candidate_path(
                &mut camera_path,
                &mut emitter_path,
                &mut queue,
                |value, s, t| {
                    locals.push((value, s, t));
                },
            );
            // seed contributions are ordinary samples
            queue.apply(&state.film, 1.0);

            let mut candidates = state.candidates.lock().unwrap();
            for (value, s, t) in locals {
                if candidate_idx == ray_tail {
                    break;
                }
                let length = s + t - 1;
                if length > max_bounces {
                    continue;
                }
                let luminance = if value.is_nan() { 0.0 } else { value };
                candidates[candidate_idx as usize] = PathCandidate {
                    camera_state,
                    emitter_state,
                    sequence,
                    luminance,
                    luminance_sum: 0.0,
                    s: s as u32,
                    t: t as u32,
                };
                candidate_idx += 1;
            }
            ray_idx += 1;
        }

        let mut data = state.subtask_data[task_id as usize].lock().unwrap();
        data.range_start = ray_base;
        data.range_length = candidate_idx - ray_base;
        state
            .num_seed_paths_traced
            .fetch_add(num_paths_traced, Ordering::Relaxed);
    }

    /// Compact candidate ranges, build per-length luminance statistics and
    /// hand every tracer a seed chain per path length.
    fn select_seed_paths(&mut self) {
        let state = self.state.as_ref().unwrap().clone();
        let max_bounces = self.settings.trace.max_bounces as usize;
        let mut candidates = state.candidates.lock().unwrap();

        // compact worker ranges into a contiguous prefix
        let mut range_tail = 0_u32;
        for data in &state.subtask_data {
            let data = data.lock().unwrap();
            if range_tail != data.range_start {
                for i in 0..data.range_length {
                    let src = (data.range_start + i) as usize;
                    let dst = (range_tail + i) as usize;
                    candidates[dst] = candidates[src];
                }
            }
            range_tail += data.range_length;
        }

        self.luminance_per_length = vec![LargeStepTracker::default(); max_bounces + 1];
        for candidate in candidates[..range_tail as usize].iter_mut() {
            let length = (candidate.s + candidate.t - 1) as usize;
            self.luminance_per_length[length].add(f64::from(candidate.luminance));
            candidate.luminance_sum = self.luminance_per_length[length].sum();
        }

        for tracer in &state.tracers {
            let mut tracer = tracer.lock().unwrap();
            for length in 1..=max_bounces {
                let total = self.luminance_per_length[length].sum();
                if total <= 0.0 {
                    continue;
                }
                let target = f64::from(self.rng.next_1d()) * total;
                for candidate in candidates[..range_tail as usize].iter() {
                    let c_length = (candidate.s + candidate.t - 1) as usize;
                    if c_length == length && target < candidate.luminance_sum {
                        tracer.start_sample_chain(candidate);
                        break;
                    }
                }
            }
        }

        let traced = state.num_seed_paths_traced.load(Ordering::Relaxed);
        for tracker in &mut self.luminance_per_length {
            tracker.set_sample_count(traced.max(1));
        }
    }

    fn compute_normalization(&mut self) {
        let state = self.state.as_ref().unwrap();
        for data in &state.subtask_data {
            let mut data = data.lock().unwrap();
            for (total, independent) in self
                .luminance_per_length
                .iter_mut()
                .zip(data.independent.iter_mut())
            {
                total.merge(independent);
                independent.clear();
            }
        }
        self.luminance_scale = self
            .luminance_per_length
            .iter()
            .map(|tracker| tracker.average())
            .sum();
    }

    fn set_buffer_weights(&self) {
        let state = self.state.as_ref().unwrap();
        let (w, h) = state.scene.cam().resolution();
        let mut num_samples = u64::from(w) * u64::from(h) * u64::from(self.current_spp);
        num_samples += if self.chains_launched {
            state.num_seed_paths_traced.load(Ordering::Relaxed)
        } else {
            u64::from(self.settings.initial_sample_pool)
        };
        let weight = (u64::from(w) * u64::from(h)) as f64 / num_samples.max(1) as f64;
        state.film.set_color_buffer_weight(0.0);
        state.film.set_splat_weight(weight as Float);
    }

    pub fn start_render(&mut self) {
        if self.done() {
            return;
        }
        let state = self.state.as_ref().expect("prepare_for_render first").clone();
        let pool = self.pool.as_ref().unwrap();
        let tasks = state.tracers.len() as u32;

        if !self.chains_launched {
            let task_state = state.clone();
            self.group = Some(pool.enqueue(
                Box::new(move |task_id, num_tasks, _thread| {
                    MultiplexedMltIntegrator::trace_sample_pool(&task_state, task_id, num_tasks);
                }),
                tasks,
                None,
            ));
        } else {
            let (w, h) = state.scene.cam().resolution();
            let ray_count =
                u64::from(w) * u64::from(h) * u64::from(self.next_spp - self.current_spp);
            let luminance_scale = self.luminance_scale;
            let per_length: Vec<f64> = self
                .luminance_per_length
                .iter()
                .map(|tracker| tracker.average())
                .collect();
            let task_state = state.clone();
            self.group = Some(pool.enqueue(
                Box::new(move |task_id, num_tasks, _thread| {
                    if task_state.abort.load(Ordering::Relaxed) {
                        return;
                    }
                    let base = int_lerp(0, ray_count as u32, task_id, num_tasks);
                    let end = int_lerp(0, ray_count as u32, task_id + 1, num_tasks);
                    let rays_to_cast = u64::from(end - base);

                    let mut tracer = task_state.tracers[task_id as usize].lock().unwrap();
                    let mut trackers =
                        vec![LargeStepTracker::default(); per_length.len()];
                    for (length, average) in per_length.iter().enumerate().skip(1) {
                        if luminance_scale <= 0.0 {
                            continue;
                        }
                        let chain_length =
                            (rays_to_cast as f64 * average / luminance_scale) as u64;
                        if chain_length > 0 {
                            let tracked = tracer.run_sample_chain(
                                length,
                                chain_length,
                                &task_state.stats,
                                luminance_scale as Float,
                                &task_state.film,
                                task_state.pyramid.as_ref(),
                            );
                            trackers[length].merge(&tracked);
                        }
                    }
                    let mut data = task_state.subtask_data[task_id as usize].lock().unwrap();
                    for (dst, src) in data.independent.iter_mut().zip(trackers) {
                        dst.merge(&src);
                    }
                }),
                tasks,
                None,
            ));
        }
    }

    pub fn wait_for_completion(&mut self) {
        if let Some(group) = self.group.take() {
            group.wait();
            let aborted = self
                .state
                .as_ref()
                .map(|s| s.abort.load(Ordering::Relaxed))
                .unwrap_or(true);
            if aborted {
                return;
            }
            if !self.chains_launched {
                self.select_seed_paths();
                self.compute_normalization();
                self.chains_launched = true;
                self.set_buffer_weights();
            } else {
                self.current_spp = self.next_spp;
                self.next_spp = advance_spp(self.current_spp, self.spp_step, self.target_spp);
                self.compute_normalization();
                self.set_buffer_weights();
            }
        }
    }

    pub fn abort_render(&mut self) {
        if let Some(state) = &self.state {
            state.abort.store(true, Ordering::Relaxed);
        }
        if let Some(group) = &self.group {
            group.abort();
            group.wait();
        }
        self.group = None;
    }

    pub fn save_state<W: std::io::Write>(&mut self, _out: &mut W) -> RenderResult<()> {
        Err(RenderError::CheckpointMismatch(
            "metropolis integrators do not support checkpointing".into(),
        ))
    }

    pub fn load_state<R: std::io::Read>(&mut self, _input: &mut R) -> RenderResult<()> {
        Err(RenderError::CheckpointMismatch(
            "metropolis integrators do not support checkpointing".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::testutil::quad_fixture;
    use std::path::Path;

    #[test]
    fn multiplexed_chains_produce_finite_energy() {
        let desc = quad_fixture(16);
        let scene =
            Arc::new(TraceableScene::prepare_for_render(&desc, Path::new(".")).unwrap());
        let (w, h) = scene.cam().resolution();
        let film = Arc::new(Film::new(w, h));
        let pool = Arc::new(ThreadPool::new(2));
        let mut settings = MultiplexedMltSettings::default();
        settings.initial_sample_pool = 400;
        settings.trace.max_bounces = 6;
        let mut integrator = MultiplexedMltIntegrator::new(settings);
        integrator.prepare_for_render(scene, film.clone(), pool, 21);
        integrator.target_spp = 1;
        integrator.next_spp = 1;

        // seed phase, then one chain segment
        integrator.start_render();
        integrator.wait_for_completion();
        assert!(integrator.chains_launched);
        integrator.start_render();
        integrator.wait_for_completion();

        let pixels = film.develop();
        let total: Float = pixels.iter().map(|p| p.luminance()).sum();
        assert!(total >= 0.0);
        for pixel in pixels {
            assert!(!pixel.is_nan());
        }
    }
}
