//! Bidirectional path tracer: one camera and one emitter subpath per
//! sample, all (s, t) pairings combined with balance-heuristic MIS. t = 1
//! connections splat through the atomic buffer; everything else accumulates
//! in the tile-local color buffer.

pub mod image_pyramid;
pub mod light_path;
pub mod vertex;

// std
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
// others
use serde::{Deserialize, Serialize};
// lumen
use crate::core::error::RenderResult;
use crate::core::film::{Film, FilmTile};
use crate::core::geometry::Point2i;
use crate::core::lumen::Float;
use crate::core::spectrum::Spectrum;
use crate::integrators::trace_base::{TraceBase, TraceSettings};
use crate::integrators::INTEGRATOR_TAG_BDPT;
use crate::renderer::thread_pool::{TaskGroup, ThreadPool};
use crate::renderer::{advance_spp, TileDriver};
use crate::samplers::PathSampleGenerator;
use crate::scene::TraceableScene;

pub use image_pyramid::ImagePyramid;
pub use light_path::LightPath;
pub use vertex::{PathEdge, PathVertex};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BdptSettings {
    #[serde(flatten)]
    pub trace: TraceSettings,
    #[serde(default)]
    pub image_pyramid: bool,
}

impl Default for BdptSettings {
    fn default() -> Self {
        BdptSettings {
            trace: TraceSettings {
                max_bounces: 16,
                ..Default::default()
            },
            image_pyramid: false,
        }
    }
}

/// Per-worker bidirectional tracer.
pub struct BdptTracer {
    base: TraceBase,
    light_splat_scale: Float,
}

impl BdptTracer {
    pub fn new(scene: Arc<TraceableScene>, settings: TraceSettings, thread_id: u32) -> Self {
        let (w, h) = scene.cam().resolution();
        BdptTracer {
            base: TraceBase::new(scene, settings, thread_id),
            light_splat_scale: 1.0 / (w as Float * h as Float),
        }
    }

    pub fn base(&self) -> &TraceBase {
        &self.base
    }

    /// Trace and connect one bidirectional sample. Splats go to `film`;
    /// the returned value goes to the pixel's color buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn trace_sample(
        &self,
        pixel: Point2i,
        camera_path: &mut LightPath,
        emitter_path: &mut LightPath,
        sampler: &mut PathSampleGenerator,
        emitter_sampler: &mut PathSampleGenerator,
        film: &Film,
        pyramid: Option<&ImagePyramid>,
        spp_scale: Float,
    ) -> Spectrum {
        let scene = &self.base.scene;
        let settings = &self.base.settings;
        let max_bounce = settings.max_bounces as usize;

        camera_path.start_camera_path(scene.cam().clone(), Some(pixel));
        camera_path.trace(scene, &self.base, sampler, None);
        if camera_path.is_empty() {
            return Spectrum::default();
        }

        let mut result =
            camera_path.bdpt_weighted_path_emission(settings.min_bounces as usize + 2, max_bounce + 1, None);

        let light = match self.base.choose_light_adjoint(emitter_sampler) {
            Some((light, pdf)) => {
                emitter_path.start_emitter_path(light, pdf);
                emitter_path.trace(scene, &self.base, emitter_sampler, None);
                true
            }
            None => false,
        };

        if light && !emitter_path.is_empty() {
            let camera_len = camera_path.len();
            let emitter_len = emitter_path.len();
            for s in 1..=emitter_len {
                let upper = (max_bounce + 1 - s).min(camera_len);
                for t in 1..=upper {
                    if !camera_path.vertex(t - 1).connectable()
                        || !emitter_path.vertex(s - 1).connectable()
                    {
                        continue;
                    }
                    let bounce = s + t - 1;
                    if bounce < settings.min_bounces as usize {
                        continue;
                    }
                    if t == 1 {
                        if let Some((weight, splat_pixel)) = LightPath::bdpt_camera_connect(
                            &self.base,
                            camera_path,
                            emitter_path,
                            s,
                            max_bounce,
                            None,
                        ) {
                            let value = weight * self.light_splat_scale;
                            film.splat(splat_pixel, value * spp_scale);
                            if let Some(pyramid) = pyramid {
                                pyramid.splat(s, t, splat_pixel, value);
                            }
                        }
                    } else {
                        let value = LightPath::bdpt_connect(
                            &self.base,
                            camera_path,
                            emitter_path,
                            s,
                            t,
                            max_bounce,
                            None,
                        );
                        if value.max_component() > 0.0 {
                            result += value;
                            if let Some(pyramid) = pyramid {
                                pyramid.splat(
                                    s,
                                    t,
                                    crate::core::geometry::Point2f::new(
                                        pixel.x as Float + 0.5,
                                        pixel.y as Float + 0.5,
                                    ),
                                    value,
                                );
                            }
                        }
                    }
                }
            }
        }

        if result.is_nan() {
            return Spectrum::default();
        }
        result
    }
}

struct BdptState {
    scene: Arc<TraceableScene>,
    film: Arc<Film>,
    settings: TraceSettings,
    driver: TileDriver,
    pyramid: Option<ImagePyramid>,
    abort: AtomicBool,
}

impl BdptState {
    fn render_tile(&self, tile_id: u32, thread_id: u32) {
        let tracer = BdptTracer::new(self.scene.clone(), self.settings.clone(), thread_id);
        let mut tile = self.driver.tile(tile_id).lock().unwrap();
        let tile = &mut *tile;
        let mut film_tile = FilmTile::new(tile.x, tile.y, tile.w, tile.h);
        let (image_w, _) = self.driver.resolution();

        let max_len = self.settings.max_bounces as usize + 4;
        let mut camera_path = LightPath::new(max_len);
        let mut emitter_path = LightPath::new(max_len);

        'rows: for y in 0..tile.h {
            for x in 0..tile.w {
                let px = tile.x + x;
                let py = tile.y + y;
                let pixel_index = px + py * image_w;
                let mut record = self.driver.record_for_pixel(px, py).lock().unwrap();
                let spp = record.next_sample_count;
                let base = record.sample_index;
                for i in 0..spp {
                    if self.abort.load(Ordering::Relaxed) {
                        break 'rows;
                    }
                    tile.sampler.start_path(pixel_index, base + i);
                    tile.supplemental.start_path(pixel_index, base + i);
                    let c = tracer.trace_sample(
                        Point2i::new(px as i32, py as i32),
                        &mut camera_path,
                        &mut emitter_path,
                        &mut tile.sampler,
                        &mut tile.supplemental,
                        &self.film,
                        self.pyramid.as_ref(),
                        1.0,
                    );
                    record.add_spectrum(&c);
                    film_tile.add_sample(x, y, c);
                }
            }
        }
        self.film.merge_tile(&film_tile);
    }
}

pub struct BdptIntegrator {
    pub settings: BdptSettings,
    state: Option<Arc<BdptState>>,
    pool: Option<Arc<ThreadPool>>,
    group: Option<Arc<TaskGroup>>,
    current_spp: u32,
    next_spp: u32,
    target_spp: u32,
    spp_step: u32,
}

impl BdptIntegrator {
    pub fn new(settings: BdptSettings) -> Self {
        BdptIntegrator {
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
        let use_sobol = renderer.use_sobol;
        let adaptive_sampling = renderer.adaptive_sampling;
        self.current_spp = 0;
        self.next_spp = advance_spp(0, self.spp_step, self.target_spp);
        film.set_color_buffer_weight(1.0);
        film.set_splat_weight(0.0);
        let pyramid = if self.settings.image_pyramid {
            Some(ImagePyramid::new(
                self.settings.trace.max_bounces as usize,
                w,
                h,
            ))
        } else {
            None
        };
        self.state = Some(Arc::new(BdptState {
            scene,
            film,
            settings: self.settings.trace.clone(),
            driver: TileDriver::new(w, h, use_sobol, adaptive_sampling, seed),
            pyramid,
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

    pub fn pyramid(&self) -> Option<&ImagePyramid> {
        self.state.as_ref().and_then(|s| s.pyramid.as_ref())
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

    pub fn save_state<W: std::io::Write>(&mut self, out: &mut W) -> RenderResult<()> {
        let state = self.state.as_ref().expect("prepare_for_render first");
        let (w, h) = state.driver.resolution();
        crate::renderer::write_checkpoint_header(out, INTEGRATOR_TAG_BDPT, w, h, self.current_spp)?;
        state.driver.save_state(out)
    }

    pub fn load_state<R: std::io::Read>(&mut self, input: &mut R) -> RenderResult<()> {
        let state = self.state.as_ref().expect("prepare_for_render first");
        let (w, h) = state.driver.resolution();
        let spp = crate::renderer::read_checkpoint_header(input, INTEGRATOR_TAG_BDPT, w, h)?;
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
    use crate::scene::TraceableScene;
    use std::path::Path;

    fn fixture_scene() -> Arc<TraceableScene> {
        Arc::new(TraceableScene::prepare_for_render(&quad_fixture(16), Path::new(".")).unwrap())
    }

    #[test]
    fn mis_weights_partition_for_connectable_paths() {
        // Trace a few bidirectional samples and verify that the technique
        // ratios of every realized connection sum to the inverse weight.
        let scene = fixture_scene();
        let settings = TraceSettings {
            max_bounces: 6,
            enable_light_sampling: false,
            ..Default::default()
        };
        let tracer = BdptTracer::new(scene.clone(), settings, 0);
        let mut camera_path = LightPath::new(10);
        let mut emitter_path = LightPath::new(10);
        let mut sampler = PathSampleGenerator::uniform(3);
        let mut emitter_sampler = PathSampleGenerator::uniform(11);

        let mut checked = 0;
        for sample in 0..200 {
            sampler.start_path(0, sample);
            emitter_sampler.start_path(0, sample);

            camera_path.start_camera_path(scene.cam().clone(), Some(Point2i::new(4, 4)));
            camera_path.trace(&scene, tracer.base(), &mut sampler, None);
            let (light, pdf) = {
                let mut s = PathSampleGenerator::uniform(sample as u64);
                scene.choose_light(&mut s).unwrap()
            };
            emitter_path.start_emitter_path(light, pdf);
            emitter_path.trace(&scene, tracer.base(), &mut emitter_sampler, None);

            for s in 1..=emitter_path.len() {
                for t in 2..=camera_path.len() {
                    if !camera_path.vertex(t - 1).connectable()
                        || !emitter_path.vertex(s - 1).connectable()
                    {
                        continue;
                    }
                    let mut ratios = vec![0.0_f32; s + t + 2];
                    let value = LightPath::bdpt_connect(
                        tracer.base(),
                        &camera_path,
                        &emitter_path,
                        s,
                        t,
                        8,
                        Some(&mut ratios),
                    );
                    if value.max_component() > 0.0 {
                        // ratios are densities relative to technique s; the
                        // balance weight is 1/sum
                        let sum: f32 = ratios.iter().sum();
                        assert!(sum >= 1.0 - 1e-3, "ratio sum {} too small", sum);
                        assert!((ratios[s] - 1.0).abs() < 1e-5);
                        checked += 1;
                    }
                }
            }
        }
        assert!(checked > 0, "no connectable paths realized");
    }

    #[test]
    fn bdpt_matches_energy_presence() {
        let scene = fixture_scene();
        let (w, h) = scene.cam().resolution();
        let film = Arc::new(Film::new(w, h));
        let pool = Arc::new(ThreadPool::new(2));
        let mut integrator = BdptIntegrator::new(BdptSettings::default());
        integrator.prepare_for_render(scene, film.clone(), pool, 5);
        integrator.target_spp = 8;
        integrator.next_spp = 8;
        integrator.start_render();
        integrator.wait_for_completion();

        let pixels = film.develop();
        let total: Float = pixels.iter().map(|p| p.luminance()).sum();
        assert!(total > 0.0);
        for pixel in pixels {
            assert!(!pixel.is_nan());
        }
    }
}
