//! Reversible-jump Metropolis light transport: multiplexed chains with a
//! third mutation kind that keeps the scalar sample path fixed and inverts
//! it under a different bidirectional split, proposing high-contribution
//! techniques according to the current path's MIS ratios.

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
use crate::integrators::mlt::multiplexed::PathCandidate;
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

fn default_strategy_probability() -> Float {
    0.3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversibleJumpMltSettings {
    #[serde(flatten)]
    pub trace: TraceSettings,
    #[serde(default = "default_sample_pool")]
    pub initial_sample_pool: u32,
    #[serde(default = "default_large_step_probability")]
    pub large_step_probability: Float,
    /// probability of the technique-change mutation
    #[serde(default = "default_strategy_probability")]
    pub strategy_perturbation_probability: Float,
    #[serde(default)]
    pub gaussian_mutation: bool,
    #[serde(default)]
    pub image_pyramid: bool,
}

impl Default for ReversibleJumpMltSettings {
    fn default() -> Self {
        ReversibleJumpMltSettings {
            trace: TraceSettings {
                max_bounces: 16,
                ..Default::default()
            },
            initial_sample_pool: default_sample_pool(),
            large_step_probability: default_large_step_probability(),
            strategy_perturbation_probability: default_strategy_probability(),
            gaussian_mutation: false,
            image_pyramid: false,
        }
    }
}

struct ChainState {
    splats: SplatQueue,
    camera_path: LightPath,
    emitter_path: LightPath,
    ratios: Vec<Float>,
}

impl ChainState {
    fn new(length: usize) -> Self {
        ChainState {
            splats: SplatQueue::new(4),
            camera_path: LightPath::new(length + 2),
            emitter_path: LightPath::new(length + 1),
            ratios: vec![0.0; length + 2],
        }
    }
}

struct RjChain {
    camera_sampler: PathSampleGenerator,
    emitter_sampler: PathSampleGenerator,
    current: ChainState,
    proposed: ChainState,
    current_s: usize,
}

pub struct ReversibleJumpMltTracer {
    base: TraceBase,
    settings: ReversibleJumpMltSettings,
    rng: UniformSampler,
    camera_rng: UniformSampler,
    emitter_rng: UniformSampler,
    chains: Vec<Option<RjChain>>,
    light_splat_scale: Float,
}

impl ReversibleJumpMltTracer {
    pub fn new(
        scene: Arc<TraceableScene>,
        settings: ReversibleJumpMltSettings,
        seed: u64,
        thread_id: u32,
    ) -> Self {
        let (w, h) = scene.cam().resolution();
        let max_bounces = settings.trace.max_bounces as usize;
        ReversibleJumpMltTracer {
            base: TraceBase::new(scene, settings.trace.clone(), thread_id),
            settings,
            rng: UniformSampler::with_sequence(seed, u64::from(thread_id) * 5),
            camera_rng: UniformSampler::with_sequence(seed, u64::from(thread_id) * 5 + 1),
            emitter_rng: UniformSampler::with_sequence(seed, u64::from(thread_id) * 5 + 2),
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

    /// Fixed-split subpath tracing. The first emitter keeps selection
    /// probability one so the technique change never has to invert a light
    /// choice.
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
        camera_sampler.start_path(0, 0);
        emitter_sampler.start_path(0, 0);
        if t > 0 {
            camera_path.start_camera_path(scene.cam().clone(), None);
            camera_path.trace(scene, &self.base, camera_sampler, Some(t));
        } else {
            camera_path.clear();
        }
        if s > 0 {
            match scene.lights().first() {
                Some((_, light)) => {
                    emitter_path.start_emitter_path(light.clone(), 1.0);
                    emitter_path.trace(scene, &self.base, emitter_sampler, Some(s));
                }
                None => emitter_path.clear(),
            }
        } else {
            emitter_path.clear();
        }
    }

    fn eval_sample(
        &self,
        camera_sampler: &mut PathSampleGenerator,
        emitter_sampler: &mut PathSampleGenerator,
        length: usize,
        s: usize,
        state: &mut ChainState,
    ) {
        state.splats.clear();
        for ratio in state.ratios.iter_mut() {
            *ratio = 0.0;
        }
        let t = length + 1 - s;

        let ChainState {
            camera_path,
            emitter_path,
            splats,
            ratios,
        } = state;
        self.trace_paths(camera_path, camera_sampler, emitter_path, emitter_sampler, s, t);

        if camera_path.len() != t || emitter_path.len() != s {
            return;
        }
        if t > 0 && !camera_path.vertex(t - 1).connectable() {
            return;
        }
        if s > 0 && !emitter_path.vertex(s - 1).connectable() {
            return;
        }

        let max_bounce = self.settings.trace.max_bounces as usize;
        if s == 0 {
            let v = camera_path.bdpt_weighted_path_emission(t, t, Some(ratios));
            if v.max_component() > 0.0 {
                splats.add_splat(s, t, Self::camera_pixel(camera_path), v);
            }
        } else if t == 1 {
            if let Some((weight, pixel)) = LightPath::bdpt_camera_connect(
                &self.base,
                camera_path,
                emitter_path,
                s,
                max_bounce,
                Some(ratios),
            ) {
                splats.add_splat(s, t, pixel, weight * self.light_splat_scale);
            }
        } else {
            let v = LightPath::bdpt_connect(
                &self.base,
                camera_path,
                emitter_path,
                s,
                t,
                max_bounce,
                Some(ratios),
            );
            if v.max_component() > 0.0 {
                splats.add_splat(s, t, Self::camera_pixel(camera_path), v);
            }
        }
    }

    /// Seed-pool candidate tracing with plain uniform streams.
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

        let max_bounces = self.settings.trace.max_bounces as usize;
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
        let min_bounces = self.settings.trace.min_bounces as usize;
        for s in 0..=emitter_len {
            let lower = (min_bounces + 2).saturating_sub(s).max(1);
            let upper = (max_bounces + 1 - s).min(camera_len);
            for t in lower..=upper {
                if s + t < 2 {
                    continue;
                }
                if !camera_path.vertex(t - 1).connectable() {
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

    pub fn start_sample_chain(&mut self, candidate: &PathCandidate) {
        let s = candidate.s as usize;
        let t = candidate.t as usize;
        let length = s + t - 1;
        let reserve = (length + 4) * 16;

        let camera_replay = UniformSampler::from_state(candidate.camera_state, candidate.sequence);
        let emitter_replay =
            UniformSampler::from_state(candidate.emitter_state, candidate.sequence + 1);

        let mut chain = RjChain {
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
            current: ChainState::new(length),
            proposed: ChainState::new(length),
            current_s: s,
        };

        {
            let RjChain {
                camera_sampler,
                emitter_sampler,
                current,
                ..
            } = &mut chain;
            self.eval_sample(camera_sampler, emitter_sampler, length, s, current);
        }

        if let Some(m) = chain.camera_sampler.as_metropolis_mut() {
            m.accept();
            m.set_helper_generator(UniformSampler::with_sequence(
                self.rng.next_u32() as u64,
                self.rng.sequence() + 11,
            ));
        }
        if let Some(m) = chain.emitter_sampler.as_metropolis_mut() {
            m.accept();
            m.set_helper_generator(UniformSampler::with_sequence(
                self.rng.next_u32() as u64,
                self.rng.sequence() + 12,
            ));
        }

        let replayed = chain.current.splats.total_luminance();
        if (replayed - candidate.luminance).abs() > 1e-3 * candidate.luminance.abs().max(1e-6) {
            tracing::warn!(
                expected = candidate.luminance,
                got = replayed,
                "seed replay diverged from recorded luminance"
            );
        }

        self.chains[length] = Some(chain);
    }

    /// One chain segment: large steps, small steps, and technique changes
    /// driven by the current path's per-technique MIS ratios.
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

        let p_large = self.settings.large_step_probability;
        let p_strategy = self.settings.strategy_perturbation_probability;

        let mut accumulated_weight = 0.0_f32;
        for _ in 0..chain_length {
            let strategy_selector = self.rng.next_1d();
            let large_step = strategy_selector < p_large;
            let strategy_change =
                strategy_selector >= p_large && strategy_selector < p_large + p_strategy;

            let mut proposed_s = chain.current_s;
            let mut proposal_weight = 1.0_f32;

            if large_step {
                proposed_s = ((self.rng.next_1d() * (path_length as Float + 1.0)) as usize)
                    .min(path_length);
                if let Some(m) = chain.camera_sampler.as_metropolis_mut() {
                    m.large_step();
                }
                if let Some(m) = chain.emitter_sampler.as_metropolis_mut() {
                    m.large_step();
                }
            } else if strategy_change {
                if let Some(m) = chain.camera_sampler.as_metropolis_mut() {
                    m.freeze();
                }
                if let Some(m) = chain.emitter_sampler.as_metropolis_mut() {
                    m.freeze();
                }

                // propose s' proportionally to the current technique ratios
                let sum: Float = chain.current.ratios[..=path_length].iter().sum();
                if sum <= 0.0 {
                    proposal_weight = 0.0;
                } else {
                    let mut target = sum * self.rng.next_1d();
                    proposed_s = path_length;
                    for (i, ratio) in chain.current.ratios[..path_length].iter().enumerate() {
                        target -= ratio;
                        if target < 0.0 {
                            proposed_s = i;
                            break;
                        }
                    }

                    let camera_root =
                        crate::integrators::bdpt::PathVertex::camera_root(
                            self.base.scene.cam().clone(),
                            None,
                        );
                    let emitter_root = self
                        .base
                        .scene
                        .lights()
                        .first()
                        .map(|(_, light)| {
                            crate::integrators::bdpt::PathVertex::emitter_root(light.clone(), 1.0)
                        });
                    let RjChain {
                        camera_sampler,
                        emitter_sampler,
                        current,
                        ..
                    } = &mut chain;
                    let inverted = match (
                        camera_sampler.as_metropolis_mut(),
                        emitter_sampler.as_metropolis_mut(),
                        emitter_root,
                    ) {
                        (Some(camera), Some(emitter), Some(emitter_root)) => LightPath::invert(
                            camera,
                            emitter,
                            &camera_root,
                            &emitter_root,
                            &current.camera_path,
                            &current.emitter_path,
                            proposed_s,
                        ),
                        _ => false,
                    };
                    if !inverted {
                        proposal_weight = 0.0;
                        stats.record_inversion_failure();
                    }
                }
                if let Some(m) = chain.camera_sampler.as_metropolis_mut() {
                    m.seek(0);
                }
                if let Some(m) = chain.emitter_sampler.as_metropolis_mut() {
                    m.seek(0);
                }
            } else {
                if let Some(m) = chain.camera_sampler.as_metropolis_mut() {
                    m.small_step();
                }
                if let Some(m) = chain.emitter_sampler.as_metropolis_mut() {
                    m.small_step();
                }
            }

            {
                let RjChain {
                    camera_sampler,
                    emitter_sampler,
                    proposed,
                    ..
                } = &mut chain;
                self.eval_sample(camera_sampler, emitter_sampler, path_length, proposed_s, proposed);
            }

            let current_i = chain.current.splats.total_luminance();
            let mut proposed_i = chain.proposed.splats.total_luminance();
            if proposed_i.is_nan() {
                proposed_i = 0.0;
            }

            if large_step {
                large_steps.add(f64::from(proposed_i) * (path_length as f64 + 1.0));
            }

            let a = if current_i == 0.0 {
                1.0
            } else {
                (proposal_weight * proposed_i / current_i).min(1.0)
            };
            accumulated_weight += 1.0 - a;

            if self.rng.next_1d() < a {
                if current_i != 0.0 {
                    chain
                        .current
                        .splats
                        .apply(film, luminance_scale * accumulated_weight / current_i);
                }
                std::mem::swap(&mut chain.current, &mut chain.proposed);
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
                        .proposed
                        .splats
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
                let lum = chain.current.splats.total_luminance();
                if lum > 0.0 {
                    chain
                        .current
                        .splats
                        .apply_pyramid(pyramid, luminance_scale / lum);
                }
            }
        }

        let current_i = chain.current.splats.total_luminance();
        if current_i != 0.0 && accumulated_weight > 0.0 {
            chain
                .current
                .splats
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

struct RjState {
    scene: Arc<TraceableScene>,
    film: Arc<Film>,
    settings: ReversibleJumpMltSettings,
    tracers: Vec<Mutex<ReversibleJumpMltTracer>>,
    candidates: Mutex<Vec<PathCandidate>>,
    subtask_data: Vec<Mutex<SubTaskSeedData>>,
    stats: MultiplexedStats,
    pyramid: Option<ImagePyramid>,
    num_seed_paths_traced: AtomicU64,
    abort: AtomicBool,
}

pub struct ReversibleJumpMltIntegrator {
    pub settings: ReversibleJumpMltSettings,
    state: Option<Arc<RjState>>,
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

impl ReversibleJumpMltIntegrator {
    pub fn new(settings: ReversibleJumpMltSettings) -> Self {
        ReversibleJumpMltIntegrator {
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
            tracers.push(Mutex::new(ReversibleJumpMltTracer::new(
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
        self.state = Some(Arc::new(RjState {
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

    fn trace_sample_pool(state: &Arc<RjState>, task_id: u32, num_tasks: u32) {
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

    fn select_seed_paths(&mut self) {
        let state = self.state.as_ref().unwrap().clone();
        let max_bounces = self.settings.trace.max_bounces as usize;
        let mut candidates = state.candidates.lock().unwrap();

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
                    ReversibleJumpMltIntegrator::trace_sample_pool(&task_state, task_id, num_tasks);
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
                    let mut trackers = vec![LargeStepTracker::default(); per_length.len()];
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
    fn inversion_roundtrip_recovers_split() {
        // Trace a bidirectional pair, invert it at the original split, and
        // re-trace: the regenerated paths must land on the same vertices.
        let desc = quad_fixture(16);
        let scene =
            Arc::new(TraceableScene::prepare_for_render(&desc, Path::new(".")).unwrap());
        let mut settings = ReversibleJumpMltSettings::default();
        settings.trace.max_bounces = 4;
        settings.trace.enable_light_sampling = false;
        let tracer = ReversibleJumpMltTracer::new(scene.clone(), settings.clone(), 51, 0);

        let mut found = 0;
        for seed in 0..200_u64 {
            let camera_replay = UniformSampler::with_sequence(seed, 1);
            let emitter_replay = UniformSampler::with_sequence(seed, 2);
            let mut camera_sampler = PathSampleGenerator::Metropolis(MetropolisSampler::new(
                false,
                camera_replay,
                64,
            ));
            let mut emitter_sampler = PathSampleGenerator::Metropolis(MetropolisSampler::new(
                false,
                emitter_replay,
                64,
            ));

            let s = 2;
            let t = 2;
            let mut state = ChainState::new(s + t - 1);
            tracer.eval_sample(&mut camera_sampler, &mut emitter_sampler, s + t - 1, s, &mut state);
            if state.camera_path.len() != t || state.emitter_path.len() != s {
                continue;
            }
            if state.splats.total_luminance() <= 0.0 {
                continue;
            }
            camera_sampler.as_metropolis_mut().unwrap().accept();
            emitter_sampler.as_metropolis_mut().unwrap().accept();

            // invert at the same split
            camera_sampler.as_metropolis_mut().unwrap().freeze();
            emitter_sampler.as_metropolis_mut().unwrap().freeze();
            let inverted = {
                let camera_root = crate::integrators::bdpt::PathVertex::camera_root(
                    scene.cam().clone(),
                    None,
                );
                let emitter_root = crate::integrators::bdpt::PathVertex::emitter_root(
                    scene.lights()[0].1.clone(),
                    1.0,
                );
                let (camera, emitter) = (&mut camera_sampler, &mut emitter_sampler);
                match (camera.as_metropolis_mut(), emitter.as_metropolis_mut()) {
                    (Some(camera), Some(emitter)) => LightPath::invert(
                        camera,
                        emitter,
                        &camera_root,
                        &emitter_root,
                        &state.camera_path,
                        &state.emitter_path,
                        s,
                    ),
                    _ => false,
                }
            };
            if !inverted {
                continue;
            }
            camera_sampler.as_metropolis_mut().unwrap().seek(0);
            emitter_sampler.as_metropolis_mut().unwrap().seek(0);

            let reference: Vec<_> = (0..state.camera_path.len())
                .map(|i| state.camera_path.vertex(i).pos())
                .chain((0..state.emitter_path.len()).map(|i| state.emitter_path.vertex(i).pos()))
                .collect();

            let mut replayed = ChainState::new(s + t - 1);
            tracer.eval_sample(
                &mut camera_sampler,
                &mut emitter_sampler,
                s + t - 1,
                s,
                &mut replayed,
            );
            if replayed.camera_path.len() != t || replayed.emitter_path.len() != s {
                continue;
            }
            let regenerated: Vec<_> = (0..replayed.camera_path.len())
                .map(|i| replayed.camera_path.vertex(i).pos())
                .chain(
                    (0..replayed.emitter_path.len())
                        .map(|i| replayed.emitter_path.vertex(i).pos()),
                )
                .collect();

            for (a, b) in reference.iter().zip(&regenerated) {
                assert!(
                    (*a - *b).length() < 1e-3,
                    "inverted path diverged: {:?} vs {:?}",
                    a,
                    b
                );
            }
            found += 1;
            if found >= 5 {
                break;
            }
        }
        assert!(found > 0, "no invertible paths realized");
    }
}
