//! Light tracer: emitter-rooted paths splatted onto the camera through the
//! atomic splat buffer.

// std
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
// others
use serde::{Deserialize, Serialize};
// lumen
use crate::core::error::{RenderError, RenderResult};
use crate::core::film::Film;
use crate::core::geometry::{Point3f, Ray, Vector3f};
use crate::core::lumen::Float;
use crate::core::records::{DirectionSample, PositionSample, SurfaceScatterEvent};
use crate::core::spectrum::Spectrum;
use crate::integrators::trace_base::{TraceBase, TraceSettings};
use crate::media::{Medium, MediumState};
use crate::renderer::thread_pool::{TaskGroup, ThreadPool};
use crate::renderer::advance_spp;
use crate::samplers::{new_path_sampler, PathSampleGenerator};
use crate::scene::TraceableScene;
use crate::core::lumen::int_lerp;
use crate::core::rng::UniformSampler;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LightTracerSettings {
    #[serde(flatten)]
    pub trace: TraceSettings,
}

pub struct LightTracer {
    base: TraceBase,
    /// image-plane Jacobian 1/(W*H)
    splat_scale: Float,
}

impl LightTracer {
    pub fn new(scene: Arc<TraceableScene>, settings: TraceSettings, thread_id: u32) -> Self {
        let (w, h) = scene.cam().resolution();
        LightTracer {
            base: TraceBase::new(scene, settings, thread_id),
            splat_scale: 1.0 / (w as Float * h as Float),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn connect_to_camera(
        &self,
        film: &Film,
        p: Point3f,
        epsilon: Float,
        on_surface: bool,
        bounce: u32,
        medium: Option<Arc<Medium>>,
        eval: impl Fn(&Vector3f) -> Spectrum,
        throughput: &Spectrum,
    ) {
        let cam = self.base.scene.cam();
        let to_cam = cam.pos() - p;
        let dist_sq = to_cam.length_squared();
        if dist_sq <= 0.0 {
            return;
        }
        let dist = dist_sq.sqrt();
        let d = to_cam / dist;
        // direction from the camera toward the vertex
        let (cam_weight, pixel) = match cam.eval_direction(&-d) {
            Some(pair) => pair,
            None => return,
        };
        let f = eval(&d);
        if f.max_component() <= 0.0 {
            return;
        }
        let shadow = Ray::new_segment(p, d, epsilon, dist * (1.0 - 1e-4));
        let (tr, _, _) = self
            .base
            .generalized_shadow_ray_and_pdfs(&shadow, medium, bounce, on_surface, true);
        if tr.max_component() <= 0.0 {
            return;
        }
        let value = *throughput * f * tr * (cam_weight / dist_sq * self.splat_scale);
        if value.is_nan() {
            return;
        }
        film.splat(pixel, value);
    }

    /// Trace one emitter path, splatting a camera connection at the root
    /// and after every scattering event.
    pub fn trace_sample(&self, film: &Film, sampler: &mut PathSampleGenerator) {
        let scene = self.base.scene.clone();
        let settings = &self.base.settings;

        let (light, light_pdf) = match self.base.choose_light_adjoint(sampler) {
            Some(pair) => pair,
            None => return,
        };
        if light.is_infinite() {
            // infinite emitters gain nothing from t=1 splats
            return;
        }
        let mut point = PositionSample::default();
        if !light.sample_position(sampler, &mut point) {
            return;
        }
        let root_throughput = point.weight / light_pdf;

        // root connection (the emitter seen directly by the lens)
        self.connect_to_camera(
            film,
            point.p,
            1e-4,
            true,
            0,
            light.ext_medium(),
            |d| {
                light.eval_directional_emission(&point, d)
                    * crate::core::geometry::vec3_dot_nrmf(d, &point.ng).max(0.0)
            },
            &root_throughput,
        );

        let mut direction = DirectionSample::default();
        if !light.sample_direction(sampler, &point, &mut direction) {
            return;
        }
        let mut throughput = root_throughput * direction.weight;
        let mut ray = Ray::new_segment(point.p, direction.d, 1e-4, Float::INFINITY);
        let mut medium = light.ext_medium();
        let mut state = MediumState::default();
        state.reset();

        let mut bounce = 0_u32;
        let mut was_specular = true;
        let mut hit_surface = true;
        let mut emission = Spectrum::default();

        let mut hit = scene.intersect(&mut ray);
        while (hit.is_some() || medium.is_some()) && bounce < settings.max_bounces {
            sampler.advance_path();
            let incoming = ray.d;
            if let Some(current_medium) = medium.clone() {
                let mut medium_sample = crate::core::records::MediumSample::default();
                if !self.base.handle_volume(
                    sampler,
                    &current_medium,
                    bounce,
                    true,
                    false,
                    &mut ray,
                    &mut throughput,
                    &mut emission,
                    &mut was_specular,
                    &mut hit_surface,
                    &mut state,
                    Some(&mut medium_sample),
                ) {
                    break;
                }
                if !hit_surface && bounce + 1 >= settings.min_bounces {
                    let phase = medium_sample.phase;
                    self.connect_to_camera(
                        film,
                        medium_sample.p,
                        0.0,
                        false,
                        bounce + 1,
                        Some(current_medium.clone()),
                        |d| Spectrum::new(phase.eval(&incoming, d)),
                        &throughput,
                    );
                }
            }

            if hit_surface {
                let info = match hit {
                    Some(info) => info,
                    None => break,
                };
                let event = self.base.make_local_scatter_event(&info, &ray);
                let prim = scene.primitive(info.prim).clone();
                if !prim.bsdf.lobes().is_pure_specular()
                    && !prim.bsdf.lobes().is_forward()
                    && bounce + 1 >= settings.min_bounces
                {
                    let bsdf = prim.bsdf.clone();
                    let frame = event.frame;
                    let wi = event.wi;
                    self.connect_to_camera(
                        film,
                        info.p,
                        info.epsilon,
                        true,
                        bounce + 1,
                        medium.clone(),
                        |d| {
                            let query = SurfaceScatterEvent {
                                frame,
                                wi,
                                wo: frame.to_local(d),
                                ..event
                            };
                            bsdf.eval(&query, true)
                        },
                        &throughput,
                    );
                }
                let mut event = event;
                if !self.base.handle_surface(
                    &mut event,
                    &info,
                    sampler,
                    &mut medium,
                    bounce,
                    true,
                    false,
                    &mut ray,
                    &mut throughput,
                    &mut emission,
                    &mut was_specular,
                ) {
                    break;
                }
            }

            if throughput.max_component() == 0.0 || throughput.is_nan() {
                break;
            }

            let roulette_pdf = throughput.abs().max_component();
            if bounce > settings.rr_depth && roulette_pdf < 0.1 {
                if sampler.untracked_1d() < roulette_pdf {
                    throughput /= roulette_pdf;
                } else {
                    break;
                }
            }

            bounce += 1;
            if bounce < settings.max_bounces {
                hit = scene.intersect(&mut ray);
            }
        }
    }
}

struct LtState {
    scene: Arc<TraceableScene>,
    film: Arc<Film>,
    settings: TraceSettings,
    samplers: Vec<Mutex<PathSampleGenerator>>,
    abort: AtomicBool,
}

pub struct LightTraceIntegrator {
    pub settings: LightTracerSettings,
    state: Option<Arc<LtState>>,
    pool: Option<Arc<ThreadPool>>,
    group: Option<Arc<TaskGroup>>,
    current_spp: u32,
    next_spp: u32,
    target_spp: u32,
    spp_step: u32,
}

impl LightTraceIntegrator {
    pub fn new(settings: LightTracerSettings) -> Self {
        LightTraceIntegrator {
            settings,
            state: None,
            pool: None,
            group: None,
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
        film.set_color_buffer_weight(0.0);
        film.set_splat_weight(0.0);

        let mut rng = UniformSampler::new(u64::from(seed));
        let samplers = (0..pool.thread_count())
            .map(|_| Mutex::new(new_path_sampler(renderer.use_sobol, &mut rng)))
            .collect();
        self.state = Some(Arc::new(LtState {
            scene,
            film,
            settings: self.settings.trace.clone(),
            samplers,
            abort: AtomicBool::new(false),
        }));
        self.pool = Some(pool);
    }

    pub fn teardown_after_render(&mut self) {
        self.group = None;
        self.state = None;
        self.pool = None;
    }

    pub fn done(&self) -> bool {
        self.current_spp >= self.target_spp
    }

    pub fn current_spp(&self) -> u32 {
        self.current_spp
    }

    pub fn start_render(&mut self) {
        if self.done() {
            return;
        }
        let state = self.state.as_ref().expect("prepare_for_render first").clone();
        let pool = self.pool.as_ref().unwrap();
        let (w, h) = state.scene.cam().resolution();
        let ray_count = w * h * (self.next_spp - self.current_spp);
        let base_index = self.current_spp * w * h;
        let tasks = state.samplers.len() as u32;
        let task_state = state.clone();
        self.group = Some(pool.enqueue(
            Box::new(move |task_id, num_tasks, thread_id| {
                let ray_base = int_lerp(0, ray_count, task_id, num_tasks);
                let rays_to_cast = int_lerp(0, ray_count, task_id + 1, num_tasks) - ray_base;
                let tracer = LightTracer::new(
                    task_state.scene.clone(),
                    task_state.settings.clone(),
                    thread_id,
                );
                let mut sampler = task_state.samplers[task_id as usize].lock().unwrap();
                for i in 0..rays_to_cast {
                    if task_state.abort.load(Ordering::Relaxed) {
                        break;
                    }
                    sampler.start_path(task_id, base_index + ray_base + i);
                    tracer.trace_sample(&task_state.film, &mut sampler);
                }
            }),
            tasks,
            None,
        ));
    }

    pub fn wait_for_completion(&mut self) {
        if let Some(group) = self.group.take() {
            group.wait();
            let state = self.state.as_ref().unwrap();
            if !state.abort.load(Ordering::Relaxed) {
                self.current_spp = self.next_spp;
                self.next_spp = advance_spp(self.current_spp, self.spp_step, self.target_spp);
                state
                    .film
                    .set_splat_weight(1.0 / self.current_spp.max(1) as Float);
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
            "light tracer does not support checkpointing".into(),
        ))
    }

    pub fn load_state<R: std::io::Read>(&mut self, _input: &mut R) -> RenderResult<()> {
        Err(RenderError::CheckpointMismatch(
            "light tracer does not support checkpointing".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::testutil::quad_fixture;
    use std::path::Path;

    #[test]
    fn light_tracing_splats_energy() {
        let desc = quad_fixture(32);
        let scene =
            Arc::new(TraceableScene::prepare_for_render(&desc, Path::new(".")).unwrap());
        let (w, h) = scene.cam().resolution();
        let film = Arc::new(Film::new(w, h));
        let pool = Arc::new(ThreadPool::new(2));
        let mut integrator = LightTraceIntegrator::new(LightTracerSettings::default());
        integrator.prepare_for_render(scene, film.clone(), pool, 3);
        integrator.target_spp = 4;
        integrator.next_spp = 4;
        integrator.start_render();
        integrator.wait_for_completion();
        assert!(integrator.done());

        let pixels = film.develop();
        let total: Float = pixels.iter().map(|p| p.luminance()).sum();
        assert!(total > 0.0);
        for pixel in pixels {
            assert!(!pixel.is_nan());
        }
    }
}
