//! Unidirectional path tracer and its tiled integrator; the latter is the
//! canonical instantiation of the adaptive tile driver.

// std
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
// others
use serde::{Deserialize, Serialize};
// lumen
use crate::core::film::{Film, FilmTile};
use crate::core::geometry::{Point2i, Ray};
use crate::core::records::SurfaceScatterEvent;
use crate::core::spectrum::Spectrum;
use crate::integrators::trace_base::{TraceBase, TraceSettings};
use crate::integrators::INTEGRATOR_TAG_PATH_TRACER;
use crate::media::MediumState;
use crate::renderer::thread_pool::{TaskGroup, ThreadPool};
use crate::renderer::{advance_spp, TileDriver};
use crate::samplers::PathSampleGenerator;
use crate::scene::TraceableScene;
use crate::core::error::RenderResult;

static NAN_SAMPLE_WARNINGS: AtomicU32 = AtomicU32::new(0);
const MAX_NAN_WARNINGS: u32 = 8;

fn warn_nan_sample(pixel: Point2i) {
    let seen = NAN_SAMPLE_WARNINGS.fetch_add(1, Ordering::Relaxed);
    if seen < MAX_NAN_WARNINGS {
        tracing::warn!(x = pixel.x, y = pixel.y, "dropping NaN sample");
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PathTracerSettings {
    #[serde(flatten)]
    pub trace: TraceSettings,
}

/// Per-worker unidirectional tracer.
pub struct PathTracer {
    base: TraceBase,
}

impl PathTracer {
    pub fn new(scene: Arc<TraceableScene>, settings: TraceSettings, thread_id: u32) -> Self {
        PathTracer {
            base: TraceBase::new(scene, settings, thread_id),
        }
    }

    pub fn base(&self) -> &TraceBase {
        &self.base
    }

    /// Variant driving Russian roulette from the primary stream; the
    /// Metropolis integrators need every decision on recorded dimensions.
    pub fn trace_sample_single(
        &self,
        pixel: Point2i,
        sampler: &mut PathSampleGenerator,
    ) -> Spectrum {
        self.trace_sample_inner(pixel, sampler, None)
    }

    /// Trace one camera path; NaN failures drop the sample and return black.
    pub fn trace_sample(
        &self,
        pixel: Point2i,
        sampler: &mut PathSampleGenerator,
        supplemental: &mut PathSampleGenerator,
    ) -> Spectrum {
        self.trace_sample_inner(pixel, sampler, Some(supplemental))
    }

    fn trace_sample_inner(
        &self,
        pixel: Point2i,
        sampler: &mut PathSampleGenerator,
        mut supplemental: Option<&mut PathSampleGenerator>,
    ) -> Spectrum {
        let scene = &self.base.scene;
        let settings = &self.base.settings;

        let mut ray = Ray::default();
        if !scene.cam().generate_sample(pixel, sampler, &mut ray) {
            return Spectrum::default();
        }

        let mut throughput = Spectrum::new(1.0);
        let mut emission = Spectrum::default();
        let mut medium = scene.camera_medium();
        let mut state = MediumState::default();
        state.reset();

        let mut bounce = 0_u32;
        let mut was_specular = true;
        let mut hit_surface = true;

        let mut hit = scene.intersect(&mut ray);
        while (hit.is_some() || medium.is_some()) && bounce < settings.max_bounces {
            sampler.advance_path();
            if let Some(current_medium) = medium.clone() {
                if !self.base.handle_volume(
                    sampler,
                    &current_medium,
                    bounce,
                    false,
                    settings.enable_light_sampling,
                    &mut ray,
                    &mut throughput,
                    &mut emission,
                    &mut was_specular,
                    &mut hit_surface,
                    &mut state,
                    None,
                ) {
                    break;
                }
            }

            if hit_surface {
                let info = match hit {
                    Some(info) => info,
                    None => break,
                };
                let mut event: SurfaceScatterEvent = self.base.make_local_scatter_event(&info, &ray);
                if !self.base.handle_surface(
                    &mut event,
                    &info,
                    sampler,
                    &mut medium,
                    bounce,
                    false,
                    settings.enable_light_sampling,
                    &mut ray,
                    &mut throughput,
                    &mut emission,
                    &mut was_specular,
                ) {
                    break;
                }
            }

            if throughput.max_component() == 0.0 {
                break;
            }

            let roulette_pdf = throughput.abs().max_component();
            if bounce > settings.rr_depth && roulette_pdf < 0.1 {
                let u = match supplemental.as_mut() {
                    Some(supplemental) => supplemental.next_1d(),
                    None => sampler.next_1d(),
                };
                if u < roulette_pdf {
                    throughput /= roulette_pdf;
                } else {
                    break;
                }
            }

            if ray.d.is_nan() || ray.o.to_vec().is_nan() {
                warn_nan_sample(pixel);
                return Spectrum::default();
            }
            if throughput.is_nan() || emission.is_nan() {
                warn_nan_sample(pixel);
                return Spectrum::default();
            }

            bounce += 1;
            if bounce < settings.max_bounces {
                hit = scene.intersect(&mut ray);
            }
        }

        // environment emitters are consulted only when the final ray misses
        if hit.is_none() && medium.is_none() && bounce >= settings.min_bounces {
            if let Some(env_info) = scene.intersect_infinites(&ray) {
                let prim = scene.primitive(env_info.prim);
                if !settings.enable_light_sampling
                    || bounce == 0
                    || was_specular
                    || !prim.is_samplable()
                {
                    emission += throughput * prim.eval_direct(&env_info, &ray.d);
                }
            }
        }
        if emission.is_nan() {
            warn_nan_sample(pixel);
            return Spectrum::default();
        }
        emission
    }
}

struct PtState {
    scene: Arc<TraceableScene>,
    film: Arc<Film>,
    settings: TraceSettings,
    driver: TileDriver,
    abort: AtomicBool,
}

impl PtState {
    fn render_tile(&self, tile_id: u32, thread_id: u32) {
        let tracer = PathTracer::new(self.scene.clone(), self.settings.clone(), thread_id);
        let mut tile = self.driver.tile(tile_id).lock().unwrap();
        let tile = &mut *tile;
        let (tile_x, tile_y, tile_w, tile_h) = (tile.x, tile.y, tile.w, tile.h);
        let mut film_tile = FilmTile::new(tile_x, tile_y, tile_w, tile_h);
        let (image_w, _) = self.driver.resolution();

        'rows: for y in 0..tile_h {
            for x in 0..tile_w {
                if self.abort.load(Ordering::Relaxed) {
                    break 'rows;
                }
                let px = tile_x + x;
                let py = tile_y + y;
                let pixel_index = px + py * image_w;

                // first-hit features through the pixel center
                let mut center = crate::core::geometry::Ray::default();
                let mut probe = PathSampleGenerator::uniform(u64::from(pixel_index));
                if self
                    .scene
                    .cam()
                    .generate_sample(Point2i::new(px as i32, py as i32), &mut probe, &mut center)
                {
                    if let Some(info) = self.scene.intersect(&mut center) {
                        let prim = self.scene.primitive(info.prim);
                        let n = info.ns;
                        film_tile.set_aux(
                            x,
                            y,
                            prim.bsdf.albedo(),
                            Spectrum::rgb(
                                n.x * 0.5 + 0.5,
                                n.y * 0.5 + 0.5,
                                n.z * 0.5 + 0.5,
                            ),
                        );
                    }
                }

                let mut record = self.driver.record_for_pixel(px, py).lock().unwrap();
                let spp = record.next_sample_count;
                let base = record.sample_index;
                for i in 0..spp {
                    if self.abort.load(Ordering::Relaxed) {
                        break 'rows;
                    }
                    tile.sampler.start_path(pixel_index, base + i);
                    let c = tracer.trace_sample(
                        Point2i::new(px as i32, py as i32),
                        &mut tile.sampler,
                        &mut tile.supplemental,
                    );
                    record.add_spectrum(&c);
                    film_tile.add_sample(x, y, c);
                }
            }
        }
        self.film.merge_tile(&film_tile);
    }
}

/// Tiled, adaptively sampled, checkpointable integrator around
/// `PathTracer`.
pub struct PathTraceIntegrator {
    pub settings: PathTracerSettings,
    state: Option<Arc<PtState>>,
    pool: Option<Arc<ThreadPool>>,
    group: Option<Arc<TaskGroup>>,
    current_spp: u32,
    next_spp: u32,
    target_spp: u32,
    spp_step: u32,
}

impl PathTraceIntegrator {
    pub fn new(settings: PathTracerSettings) -> Self {
        PathTraceIntegrator {
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
        let (w, h) = scene.cam().resolution();
        let renderer = scene.renderer_settings();
        self.target_spp = renderer.spp;
        self.spp_step = renderer.spp_step;
        self.current_spp = 0;
        self.next_spp = advance_spp(0, self.spp_step, self.target_spp);
        film.set_color_buffer_weight(1.0);
        film.set_splat_weight(0.0);
        self.state = Some(Arc::new(PtState {
            scene: scene.clone(),
            film,
            settings: self.settings.trace.clone(),
            driver: TileDriver::new(w, h, renderer.use_sobol, renderer.adaptive_sampling, seed),
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
        if !state.driver.generate_work(self.current_spp, self.next_spp) {
            self.current_spp = self.next_spp;
            self.next_spp = advance_spp(self.current_spp, self.spp_step, self.target_spp);
            return;
        }
        let tiles = state.driver.tile_count();
        let task_state = state.clone();
        self.group = Some(pool.enqueue(
            Box::new(move |tile_id, _num, thread_id| {
                task_state.render_tile(tile_id, thread_id);
            }),
            tiles,
            None,
        ));
    }

    pub fn wait_for_completion(&mut self) {
        if let Some(group) = self.group.take() {
            group.wait();
            let aborted = self
                .state
                .as_ref()
                .map(|s| s.abort.load(Ordering::Relaxed))
                .unwrap_or(false);
            if !aborted {
                self.current_spp = self.next_spp;
                self.next_spp = advance_spp(self.current_spp, self.spp_step, self.target_spp);
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

    pub fn supports_resume(&self) -> bool {
        true
    }

    /// Write the adaptive-sampling variance estimate as an LDR raster.
    pub fn save_variance(&self, path: &std::path::Path) -> std::io::Result<()> {
        let state = match &self.state {
            Some(state) => state,
            None => return Ok(()),
        };
        let (w, h) = state.driver.resolution();
        let pixels = state.driver.variance_raster();
        crate::core::film::write_ldr(path, w, h, &pixels, crate::core::film::Tonemap::Reinhard)
    }

    pub fn save_state<W: std::io::Write>(&mut self, out: &mut W) -> RenderResult<()> {
        let state = self.state.as_ref().expect("prepare_for_render first");
        let (w, h) = state.driver.resolution();
        crate::renderer::write_checkpoint_header(
            out,
            INTEGRATOR_TAG_PATH_TRACER,
            w,
            h,
            self.current_spp,
        )?;
        state.driver.save_state(out)?;
        state.film.save_state(out)?;
        Ok(())
    }

    pub fn load_state<R: std::io::Read>(&mut self, input: &mut R) -> RenderResult<()> {
        let state = self.state.as_ref().expect("prepare_for_render first");
        let (w, h) = state.driver.resolution();
        let spp =
            crate::renderer::read_checkpoint_header(input, INTEGRATOR_TAG_PATH_TRACER, w, h)?;
        state.driver.load_state(input)?;
        state.film.load_state(input)?;
        self.current_spp = spp;
        self.next_spp = advance_spp(spp, self.spp_step, self.target_spp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::testutil::quad_fixture;
    use crate::scene::{SceneDescription, TraceableScene};
    use std::path::Path;

    fn render(desc: &SceneDescription, spp: u32, threads: u32) -> (Arc<Film>, Vec<Spectrum>) {
        let scene = Arc::new(TraceableScene::prepare_for_render(desc, Path::new(".")).unwrap());
        let (w, h) = scene.cam().resolution();
        let film = Arc::new(Film::new(w, h));
        let pool = Arc::new(ThreadPool::new(threads));
        let mut integrator = PathTraceIntegrator::new(PathTracerSettings::default());
        integrator.prepare_for_render(scene, film.clone(), pool, 1);
        integrator.target_spp = spp;
        integrator.next_spp = advance_spp(0, 0, spp);
        while !integrator.done() {
            integrator.start_render();
            integrator.wait_for_completion();
        }
        let pixels = film.develop();
        (film, pixels)
    }

    #[test]
    fn empty_scene_renders_black() {
        let mut desc = quad_fixture(16);
        desc.primitives.clear();
        let (_, pixels) = render(&desc, 4, 2);
        for pixel in pixels {
            assert_eq!(pixel, Spectrum::default());
        }
    }

    #[test]
    fn emitter_scene_produces_light() {
        let desc = quad_fixture(16);
        let (_, pixels) = render(&desc, 16, 2);
        let total: f32 = pixels.iter().map(|p| p.luminance()).sum();
        assert!(total > 0.0, "render must pick up emitter energy");
        for pixel in &pixels {
            assert!(!pixel.is_nan());
        }
    }

    #[test]
    fn resume_matches_uninterrupted_run() {
        let desc = quad_fixture(16);
        let make = || {
            let scene =
                Arc::new(TraceableScene::prepare_for_render(&desc, Path::new(".")).unwrap());
            let (w, h) = scene.cam().resolution();
            let film = Arc::new(Film::new(w, h));
            let pool = Arc::new(ThreadPool::new(2));
            let mut integrator = PathTraceIntegrator::new(PathTracerSettings::default());
            integrator.prepare_for_render(scene, film.clone(), pool, 77);
            integrator.target_spp = 4;
            integrator.next_spp = advance_spp(0, 0, 4);
            (integrator, film)
        };

        // uninterrupted run to 4 spp
        let (mut reference, reference_film) = make();
        while !reference.done() {
            reference.start_render();
            reference.wait_for_completion();
        }

        // run to 2 spp, checkpoint, resume in a fresh integrator+film
        let (mut first, _first_film) = make();
        while first.current_spp() < 2 {
            first.start_render();
            first.wait_for_completion();
        }
        let mut checkpoint = Vec::new();
        first.save_state(&mut checkpoint).unwrap();

        let (mut resumed, resumed_film) = make();
        resumed.load_state(&mut &checkpoint[..]).unwrap();
        assert_eq!(resumed.current_spp(), 2);
        while !resumed.done() {
            resumed.start_render();
            resumed.wait_for_completion();
        }

        // per-pixel samples are accumulated in the same order by the same
        // replayed samplers, so the frames agree exactly
        let reference_pixels = reference_film.develop();
        let resumed_pixels = resumed_film.develop();
        assert!(reference_pixels.iter().any(|p| p.luminance() > 0.0));
        for (a, b) in reference_pixels.iter().zip(&resumed_pixels) {
            assert_eq!(a, b, "resume diverged from the uninterrupted run");
        }
    }

    #[test]
    fn abort_returns_promptly() {
        let desc = quad_fixture(64);
        let scene =
            Arc::new(TraceableScene::prepare_for_render(&desc, Path::new(".")).unwrap());
        let (w, h) = scene.cam().resolution();
        let film = Arc::new(Film::new(w, h));
        let pool = Arc::new(ThreadPool::new(2));
        let mut integrator = PathTraceIntegrator::new(PathTracerSettings::default());
        integrator.prepare_for_render(scene, film, pool, 1);
        integrator.target_spp = 1 << 14;
        integrator.next_spp = 1 << 14;
        integrator.start_render();
        integrator.abort_render();
        // aborted segments never advance the schedule
        assert_eq!(integrator.current_spp(), 0);
    }
}
