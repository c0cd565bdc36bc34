//! Photon-map integrator: shoot photons into per-worker ranges, compact,
//! build the lookup structures, then gather at sensor rays. Hard barriers
//! separate the phases.

pub mod photon;
pub mod tracer;

// std
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
// lumen
use crate::accelerators::bvh::{BinaryBvh, BvhPrimitive};
use crate::accelerators::frustum_grid::FrustumBinner;
use crate::accelerators::grid::{GridAccel, GridPrimitive};
use crate::accelerators::kd_tree::KdTree;
use crate::core::error::{RenderError, RenderResult};
use crate::core::film::{Film, FilmTile};
use crate::core::geometry::{vec3_cross_vec3f, Bounds3f, Point2i, Ray};
use crate::core::lumen::{cube, int_lerp, sqr, Float};
use crate::renderer::thread_pool::{TaskGroup, ThreadPool};
use crate::renderer::{advance_spp, TileDriver};
use crate::samplers::{new_path_sampler, PathSampleGenerator};
use crate::scene::TraceableScene;
use crate::core::rng::UniformSampler;

pub use photon::{
    stream_compact, PathPhoton, PathPhotonRange, Photon, PhotonBeam, PhotonPlane0D, PhotonPlane1D,
    PhotonRange, SurfacePhotonRange, VolumePhoton, VolumePhotonRange,
};
pub use tracer::{PhotonMapSettings, PhotonStructures, PhotonTracer, VolumePhotonType};

/// Radius shrink schedule for progressive iterations.
#[derive(Debug, Copy, Clone)]
pub struct ProgressiveSchedule {
    pub alpha: Float,
}

fn precompute_beam(beam: &mut PhotonBeam, p0: &PathPhoton, p1: &PathPhoton) {
    beam.p0 = p0.pos;
    beam.p1 = p1.pos;
    beam.dir = p0.dir;
    beam.length = p0.length;
    beam.power = p1.power;
    beam.bounce = p0.bounce();
    beam.valid = true;
}

fn precompute_plane_0d(
    plane: &mut PhotonPlane0D,
    p0: &PathPhoton,
    p1: &PathPhoton,
    p2: &PathPhoton,
) {
    let d1 = p1.dir * p1.sampled_length;
    *plane = PhotonPlane0D {
        p0: p0.pos,
        p1: p1.pos,
        p2: p1.pos + d1,
        p3: p0.pos + d1,
        power: p2.power * (p0.length * p1.sampled_length),
        d1: p1.dir,
        l1: p1.sampled_length,
        bounce: p1.bounce(),
        valid: true,
    };
}

fn precompute_plane_1d(
    plane: &mut PhotonPlane1D,
    p0: &PathPhoton,
    p1: &PathPhoton,
    p2: &PathPhoton,
    radius: Float,
) {
    let a = p1.pos - p0.pos;
    let b = p1.dir * p1.sampled_length;
    let axis = vec3_cross_vec3f(&a, &p1.dir);
    if axis.length_squared() < 1e-16 {
        return;
    }
    let c = axis.normalize() * (2.0 * radius);
    let det = crate::core::geometry::vec3_dot_vec3f(&a, &vec3_cross_vec3f(&b, &c)).abs();
    if !det.is_finite() || det < 1e-8 {
        return;
    }
    let inv_det = 1.0 / det;
    let u = vec3_cross_vec3f(&b, &c) * inv_det;
    let v = vec3_cross_vec3f(&c, &a) * inv_det;
    let w = vec3_cross_vec3f(&a, &b) * inv_det;

    plane.p = p0.pos - c * 0.5;
    plane.inv_det = inv_det;
    plane.inv_u = u;
    plane.inv_v = v;
    plane.inv_w = w;
    plane.bin_count = a.length() / (2.0 * radius);
    plane.center = p0.pos + a * 0.5 + b * 0.5;
    plane.a = a * 0.5;
    plane.b = b * 0.5;
    plane.c = c * 0.5;
    plane.d1 = p1.dir;
    plane.l1 = p1.sampled_length;
    plane.power = p2.power * (p0.length * p1.sampled_length * inv_det.abs());
    plane.bounce = p1.bounce();
    plane.valid = true;
}

/// Dice a beam into axis-aligned bounding segments before BVH insertion so
/// long diagonal beams do not blow up the tree quality.
fn insert_diced_beam(
    prims: &mut Vec<BvhPrimitive>,
    beam: &PhotonBeam,
    index: u32,
    radius: Float,
) {
    let abs_dir = beam.dir.abs();
    let major_axis = abs_dir.max_dimension();
    let num_steps = ((abs_dir[major_axis] * 16.0) as i32).max(1).min(64);

    for j in 0..num_steps {
        let v0 = beam.p0 + beam.dir * (beam.length * j as Float / num_steps as Float);
        let v1 = beam.p0 + beam.dir * (beam.length * (j + 1) as Float / num_steps as Float);
        let mut bounds = Bounds3f::from_point(v0);
        bounds.grow_pnt(&v1);
        bounds.expand(radius);
        prims.push(BvhPrimitive::new(bounds, bounds.center(), index));
    }
}

struct SubTaskData {
    surface: SurfacePhotonRange,
    volume: VolumePhotonRange,
    path: PathPhotonRange,
}

struct PmState {
    scene: Arc<TraceableScene>,
    film: Arc<Film>,
    pool: Arc<ThreadPool>,
    settings: PhotonMapSettings,
    progressive: Option<ProgressiveSchedule>,
    driver: TileDriver,
    tracers: Vec<Mutex<PhotonTracer>>,
    samplers: Vec<Mutex<PathSampleGenerator>>,
    structures: Mutex<Option<Arc<PhotonStructures>>>,
    depth_buffer: Mutex<Vec<Ray>>,
    total_traced_surface_paths: AtomicU32,
    total_traced_volume_paths: AtomicU32,
    total_traced_paths: AtomicU32,
    iteration: AtomicU32,
    use_frustum_grid: bool,
    abort: AtomicBool,
}

impl PmState {
    fn surface_radius(&self, iteration: u32) -> Float {
        match &self.progressive {
            None => self.settings.gather_radius,
            Some(schedule) => {
                let mut radius_sq = sqr(self.settings.gather_radius.min(1e3));
                for i in 1..=iteration {
                    radius_sq *= (i as Float + schedule.alpha) / (i as Float + 1.0);
                }
                radius_sq.sqrt()
            }
        }
    }

    fn volume_radius(&self, iteration: u32) -> Float {
        match &self.progressive {
            None => self.settings.volume_gather_radius,
            Some(schedule) => {
                let mut radius_cu = cube(self.settings.volume_gather_radius);
                for i in 1..=iteration {
                    radius_cu *= (i as Float + schedule.alpha) / (i as Float + 1.0);
                }
                radius_cu.cbrt()
            }
        }
    }

    /// Phases 1-3: shoot into disjoint worker ranges, compact, scale power
    /// by the number of emitted paths, and build the lookup structures.
    fn shoot_and_build(self: &Arc<Self>, iteration: u32) {
        let settings = &self.settings;
        let num_workers = self.tracers.len() as u32;
        let trace_paths = !matches!(settings.volume_photon_type, VolumePhotonType::Points);

        let surface_count = if settings.include_surfaces {
            settings.photon_count
        } else {
            0
        };
        let volume_count = if self.scene.media().is_empty() {
            0
        } else {
            settings.volume_photon_count
        };

        let mut surface_photons = vec![Photon::default(); surface_count as usize];
        let mut volume_photons = if trace_paths {
            Vec::new()
        } else {
            vec![VolumePhoton::default(); volume_count as usize]
        };
        let mut path_photons = if trace_paths {
            vec![PathPhoton::default(); volume_count as usize]
        } else {
            Vec::new()
        };

        self.total_traced_surface_paths.store(0, Ordering::Relaxed);
        self.total_traced_volume_paths.store(0, Ordering::Relaxed);
        self.total_traced_paths.store(0, Ordering::Relaxed);

        // per-worker disjoint write ranges into the shared arrays; the
        // arrays outlive the group because we yield on it below
        let mut task_data = Vec::new();
        for i in 0..num_workers {
            let s0 = int_lerp(0, surface_photons.len() as u32, i, num_workers);
            let s1 = int_lerp(0, surface_photons.len() as u32, i + 1, num_workers);
            let v0 = int_lerp(0, volume_count, i, num_workers);
            let v1 = int_lerp(0, volume_count, i + 1, num_workers);
            unsafe {
                task_data.push(Mutex::new(SubTaskData {
                    surface: if surface_photons.is_empty() {
                        PhotonRange::empty()
                    } else {
                        PhotonRange::new(surface_photons.as_mut_ptr(), s0, s1)
                    },
                    volume: if volume_photons.is_empty() {
                        PhotonRange::empty()
                    } else {
                        PhotonRange::new(volume_photons.as_mut_ptr(), v0, v1)
                    },
                    path: if path_photons.is_empty() {
                        PhotonRange::empty()
                    } else {
                        PhotonRange::new(path_photons.as_mut_ptr(), v0, v1)
                    },
                }));
            }
        }
        let task_data = Arc::new(task_data);

        let state = self.clone();
        let tasks = task_data.clone();
        let sample_base = iteration.wrapping_mul(settings.photon_count);
        let photon_count = settings.photon_count;
        let group = self.pool.enqueue(
            Box::new(move |task_id, num_tasks, thread_id| {
                let mut data = tasks[task_id as usize].lock().unwrap();
                let data = &mut *data;
                let mut sampler = state.samplers[task_id as usize].lock().unwrap();
                let mut tracer = state.tracers[thread_id as usize].lock().unwrap();

                let photon_base = int_lerp(0, photon_count, task_id, num_tasks);
                let photons_to_cast = int_lerp(0, photon_count, task_id + 1, num_tasks) - photon_base;

                let mut surface_cast = 0;
                let mut volume_cast = 0;
                let mut paths_cast = 0;
                for i in 0..photons_to_cast {
                    sampler.start_path(0, sample_base.wrapping_add(photon_base + i));
                    tracer.trace_photon_path(
                        &mut data.surface,
                        &mut data.volume,
                        &mut data.path,
                        &mut sampler,
                    );
                    if !data.surface.full() {
                        surface_cast += 1;
                    }
                    if !data.volume.full() {
                        volume_cast += 1;
                    }
                    if !data.path.full() {
                        paths_cast += 1;
                    }
                    if data.surface.full() && data.volume.full() && data.path.full() {
                        break;
                    }
                    if state.abort.load(Ordering::Relaxed) {
                        break;
                    }
                }
                state
                    .total_traced_surface_paths
                    .fetch_add(surface_cast, Ordering::Relaxed);
                state
                    .total_traced_volume_paths
                    .fetch_add(volume_cast, Ordering::Relaxed);
                state.total_traced_paths.fetch_add(paths_cast, Ordering::Relaxed);
            }),
            num_workers,
            None,
        );
        self.pool.yield_group(&group);
        drop(group);

        // phase 2: compaction is single threaded
        let mut surface_ranges = Vec::new();
        let mut volume_ranges = Vec::new();
        let mut path_ranges = Vec::new();
        for data in task_data.iter() {
            let mut data = data.lock().unwrap();
            let data = std::mem::replace(
                &mut *data,
                SubTaskData {
                    surface: PhotonRange::empty(),
                    volume: PhotonRange::empty(),
                    path: PhotonRange::empty(),
                },
            );
            surface_ranges.push(data.surface);
            volume_ranges.push(data.volume);
            path_ranges.push(data.path);
        }

        let surface_tail = stream_compact(&mut surface_ranges);
        let surface_paths = self.total_traced_surface_paths.load(Ordering::Relaxed).max(1);
        let scale = 1.0 / surface_paths as Float;
        for photon in &mut surface_photons[..surface_tail as usize] {
            photon.power *= scale;
        }
        tracing::debug!(
            surface = surface_tail,
            paths = surface_paths,
            "compacted surface photons"
        );

        let surface_tree = KdTree::build(surface_photons, surface_tail, Some(&self.pool));

        let mut volume_tree = None;
        let mut beam_bvh = None;
        let mut beam_grid = None;
        let mut beams = Vec::new();
        let mut planes_0d = Vec::new();
        let mut planes_1d = Vec::new();
        let mut path_photon_count = 0;

        let volume_radius = self.volume_radius(iteration);
        if !volume_photons.is_empty() {
            let tail = stream_compact(&mut volume_ranges);
            let paths = self.total_traced_volume_paths.load(Ordering::Relaxed).max(1);
            let scale = 1.0 / paths as Float;
            for photon in &mut volume_photons[..tail as usize] {
                photon.power *= scale;
            }
            let mut tree = KdTree::build(volume_photons, tail, Some(&self.pool));
            let base_radius = if self.settings.fixed_volume_radius {
                volume_radius
            } else {
                volume_radius / self.settings.volume_gather_radius.max(1e-6)
            };
            tree.build_volume_hierarchy(self.settings.fixed_volume_radius, base_radius);
            volume_tree = Some(tree);
        } else if !path_photons.is_empty() {
            let tail = stream_compact(&mut path_ranges);
            let paths = self.total_traced_paths.load(Ordering::Relaxed).max(1);
            let scale = 1.0 / paths as Float;
            for photon in &mut path_photons[..tail as usize] {
                photon.power *= scale;
            }
            // reconstruct segment directions and lengths from positions
            for i in 1..tail as usize {
                if path_photons[i].bounce() > 0 {
                    let dir = path_photons[i].pos - path_photons[i - 1].pos;
                    let length = dir.length();
                    path_photons[i - 1].length = length;
                    if length > 0.0 {
                        path_photons[i - 1].dir = dir / length;
                    }
                }
            }

            path_photons.truncate(tail as usize);
            path_photon_count = tail;
            beams = vec![PhotonBeam::default(); tail as usize];

            match self.settings.volume_photon_type {
                VolumePhotonType::Beams => {
                    if self.settings.use_grid {
                        let mut prims = Vec::new();
                        for i in 1..tail as usize {
                            if path_photons[i].bounce() == 0 {
                                continue;
                            }
                            if !path_photons[i - 1].on_surface()
                                || self.settings.low_order_scattering
                            {
                                precompute_beam(
                                    &mut beams[i],
                                    &path_photons[i - 1],
                                    &path_photons[i],
                                );
                                prims.push(GridPrimitive::beam(
                                    i as u32,
                                    path_photons[i - 1].pos,
                                    path_photons[i].pos,
                                    volume_radius,
                                ));
                            }
                        }
                        beam_grid = Some(GridAccel::new(
                            self.scene.bounds(),
                            self.settings.grid_mem_budget_kb,
                            prims,
                        ));
                    } else {
                        let mut prims = Vec::new();
                        for i in 1..tail as usize {
                            if path_photons[i].bounce() == 0 {
                                continue;
                            }
                            if !path_photons[i - 1].on_surface()
                                || self.settings.low_order_scattering
                            {
                                precompute_beam(
                                    &mut beams[i],
                                    &path_photons[i - 1],
                                    &path_photons[i],
                                );
                                let beam = beams[i];
                                insert_diced_beam(&mut prims, &beam, i as u32, volume_radius);
                            }
                        }
                        beam_bvh = Some(BinaryBvh::new(prims, 1));
                    }
                }
                VolumePhotonType::Planes | VolumePhotonType::Planes1D => {
                    let planes_1d_mode =
                        self.settings.volume_photon_type == VolumePhotonType::Planes1D;
                    if planes_1d_mode {
                        planes_1d = vec![PhotonPlane1D::default(); tail as usize];
                    } else {
                        planes_0d = vec![PhotonPlane0D::default(); tail as usize];
                    }
                    let mut bvh_prims = Vec::new();
                    let mut grid_prims = Vec::new();
                    for i in 2..tail as usize {
                        let (head, tail_slice) = path_photons.split_at(i);
                        let p0 = &head[i - 2];
                        let p1 = &head[i - 1];
                        let p2 = &tail_slice[0];

                        if p2.bounce() > 0
                            && p2.bounce() > p1.bounce()
                            && p1.on_surface()
                            && self.settings.low_order_scattering
                        {
                            precompute_beam(&mut beams[i], p1, p2);
                            if self.settings.use_grid {
                                grid_prims.push(GridPrimitive::beam(
                                    i as u32,
                                    p1.pos,
                                    p2.pos,
                                    volume_radius,
                                ));
                            } else {
                                let beam = beams[i];
                                insert_diced_beam(&mut bvh_prims, &beam, i as u32, volume_radius);
                            }
                        }
                        if p2.bounce() > 1 && !p1.on_surface() && p1.sampled_length > 0.0 {
                            if planes_1d_mode {
                                precompute_plane_1d(&mut planes_1d[i], p0, p1, p2, volume_radius);
                                if planes_1d[i].valid {
                                    if self.settings.use_grid {
                                        let plane = &planes_1d[i];
                                        let p = plane.center;
                                        grid_prims.push(GridPrimitive::quad(
                                            i as u32,
                                            p - plane.a - plane.b,
                                            p + plane.a - plane.b,
                                            p + plane.a + plane.b,
                                            p - plane.a + plane.b,
                                            volume_radius,
                                        ));
                                    } else {
                                        let bounds = planes_1d[i].bounds();
                                        bvh_prims.push(BvhPrimitive::new(
                                            bounds,
                                            bounds.center(),
                                            i as u32,
                                        ));
                                    }
                                }
                            } else {
                                precompute_plane_0d(&mut planes_0d[i], p0, p1, p2);
                                if self.settings.use_grid {
                                    let plane = &planes_0d[i];
                                    grid_prims.push(GridPrimitive::quad(
                                        i as u32,
                                        plane.p0,
                                        plane.p1,
                                        plane.p2,
                                        plane.p3,
                                        0.0,
                                    ));
                                } else {
                                    let bounds = planes_0d[i].bounds();
                                    bvh_prims.push(BvhPrimitive::new(
                                        bounds,
                                        bounds.center(),
                                        i as u32,
                                    ));
                                }
                            }
                        }
                    }
                    if self.settings.use_grid {
                        beam_grid = Some(GridAccel::new(
                            self.scene.bounds(),
                            self.settings.grid_mem_budget_kb,
                            grid_prims,
                        ));
                    } else {
                        beam_bvh = Some(BinaryBvh::new(bvh_prims, 1));
                    }
                }
                VolumePhotonType::Points => {}
            }
        }

        *self.structures.lock().unwrap() = Some(Arc::new(PhotonStructures {
            surface_tree,
            volume_tree,
            beam_bvh,
            beam_grid,
            beams,
            planes_0d,
            planes_1d,
            path_photon_count,
        }));
    }

    /// Phase 4: per-tile sensor gather.
    fn trace_pixels(
        &self,
        tile_id: u32,
        thread_id: u32,
        from_spp: u32,
        to_spp: u32,
        surface_radius: Float,
        volume_radius: Float,
    ) {
        let structures = match self.structures.lock().unwrap().clone() {
            Some(structures) => structures,
            None => return,
        };
        let mut tracer = self.tracers[thread_id as usize].lock().unwrap();
        let mut tile = self.driver.tile(tile_id).lock().unwrap();
        let tile = &mut *tile;
        let mut film_tile = FilmTile::new(tile.x, tile.y, tile.w, tile.h);
        let (image_w, _) = self.driver.resolution();
        let spp = to_spp - from_spp;

        let mut local_depth: Vec<(usize, Ray)> = Vec::new();
        'rows: for y in 0..tile.h {
            for x in 0..tile.w {
                if self.abort.load(Ordering::Relaxed) {
                    break 'rows;
                }
                let px = tile.x + x;
                let py = tile.y + y;
                let pixel_index = px + py * image_w;
                let mut depth_ray = Ray::default();
                for i in 0..spp {
                    tile.sampler.start_path(pixel_index, from_spp + i);
                    let c = tracer.trace_sensor_path(
                        Point2i::new(px as i32, py as i32),
                        &structures,
                        &mut tile.sampler,
                        surface_radius,
                        volume_radius,
                        &mut depth_ray,
                        self.use_frustum_grid,
                    );
                    film_tile.add_sample(x, y, c);
                }
                if self.use_frustum_grid {
                    local_depth.push((pixel_index as usize, depth_ray));
                }
            }
        }
        self.film.merge_tile(&film_tile);
        if self.use_frustum_grid {
            let mut depth = self.depth_buffer.lock().unwrap();
            for (idx, ray) in local_depth {
                depth[idx] = ray;
            }
        }
    }

    fn render_segment(self: &Arc<Self>, from_spp: u32, to_spp: u32) {
        let iteration = self.iteration.load(Ordering::Relaxed);
        let rebuild = self.progressive.is_some() || self.structures.lock().unwrap().is_none();
        if rebuild {
            for tracer in &self.tracers {
                tracer.lock().unwrap().clear_caches();
            }
            self.shoot_and_build(iteration);
        }
        if self.abort.load(Ordering::Relaxed) {
            return;
        }

        let surface_radius = self.surface_radius(iteration);
        let volume_radius = self.volume_radius(iteration);

        let state = self.clone();
        let tiles = self.driver.tile_count();
        let gather = self.pool.enqueue(
            Box::new(move |tile_id, _num, thread_id| {
                state.trace_pixels(
                    tile_id,
                    thread_id,
                    from_spp,
                    to_spp,
                    surface_radius,
                    volume_radius,
                );
            }),
            tiles,
            None,
        );
        self.pool.yield_group(&gather);

        if self.use_frustum_grid && !self.abort.load(Ordering::Relaxed) {
            let structures = self.structures.lock().unwrap().clone();
            if let Some(structures) = structures {
                let depth_rays: Arc<Vec<Ray>> =
                    Arc::new(self.depth_buffer.lock().unwrap().clone());
                let binner = Arc::new(FrustumBinner::new(self.scene.cam().clone()));
                let state = self.clone();
                let count = structures.path_photon_count;
                let spp = (to_spp - from_spp) as Float;
                let tracer_count = self.tracers.len() as u32;
                let splat_group = self.pool.enqueue(
                    Box::new(move |task_id, num_tasks, thread_id| {
                        let start = int_lerp(0, count, task_id, num_tasks);
                        let end = int_lerp(0, count, task_id + 1, num_tasks);
                        let mut tracer = state.tracers[thread_id as usize].lock().unwrap();
                        let mut sampler = state.samplers[task_id as usize].lock().unwrap();
                        tracer.eval_primary_rays(
                            &structures,
                            &binner,
                            start,
                            end,
                            volume_radius,
                            &depth_rays,
                            state.film.splat_buffer(),
                            &mut sampler,
                            spp,
                        );
                    }),
                    tracer_count,
                    None,
                );
                self.pool.yield_group(&splat_group);
            }
        }

        self.iteration.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct PhotonMapIntegrator {
    pub settings: PhotonMapSettings,
    progressive: Option<ProgressiveSchedule>,
    state: Option<Arc<PmState>>,
    group: Option<Arc<TaskGroup>>,
    current_spp: u32,
    next_spp: u32,
    target_spp: u32,
    spp_step: u32,
    integrator_tag: u8,
}

impl PhotonMapIntegrator {
    pub fn new(settings: PhotonMapSettings) -> Self {
        PhotonMapIntegrator {
            settings,
            progressive: None,
            state: None,
            group: None,
            current_spp: 0,
            next_spp: 0,
            target_spp: 0,
            spp_step: 0,
            integrator_tag: crate::integrators::INTEGRATOR_TAG_PHOTON_MAP,
        }
    }

    pub fn new_progressive(settings: PhotonMapSettings, alpha: Float) -> Self {
        let mut integrator = Self::new(settings);
        integrator.progressive = Some(ProgressiveSchedule { alpha });
        integrator.integrator_tag = crate::integrators::INTEGRATOR_TAG_PROGRESSIVE_PHOTON_MAP;
        integrator
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

        let use_frustum_grid = self.settings.use_frustum_grid && !scene.media().is_empty();
        let mut rng = UniformSampler::new(u64::from(seed));
        let mut tracers = Vec::new();
        let mut samplers = Vec::new();
        // one extra slot: the driver thread may execute sub-tasks while
        // yielding on a phase group
        for i in 0..=pool.thread_count() {
            tracers.push(Mutex::new(PhotonTracer::new(
                scene.clone(),
                self.settings.clone(),
                i,
            )));
            samplers.push(Mutex::new(new_path_sampler(renderer.use_sobol, &mut rng)));
        }

        self.state = Some(Arc::new(PmState {
            scene: scene.clone(),
            film,
            pool,
            settings: self.settings.clone(),
            progressive: self.progressive,
            driver: TileDriver::new(w, h, renderer.use_sobol, false, seed),
            tracers,
            samplers,
            structures: Mutex::new(None),
            depth_buffer: Mutex::new(vec![Ray::default(); (w * h) as usize]),
            total_traced_surface_paths: AtomicU32::new(0),
            total_traced_volume_paths: AtomicU32::new(0),
            total_traced_paths: AtomicU32::new(0),
            iteration: AtomicU32::new(0),
            use_frustum_grid,
            abort: AtomicBool::new(false),
        }));
    }

    pub fn teardown_after_render(&mut self) {
        self.group = None;
        self.state = None;
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
        let from = self.current_spp;
        let to = self.next_spp;
        state.driver.generate_work(from, to);
        let pool = state.pool.clone();
        let segment_state = state.clone();
        self.group = Some(pool.enqueue(
            Box::new(move |_task, _num, _thread| {
                segment_state.render_segment(from, to);
            }),
            1,
            None,
        ));
    }

    pub fn wait_for_completion(&mut self) {
        if let Some(group) = self.group.take() {
            let state = self.state.as_ref().unwrap().clone();
            state.pool.yield_group(&group);
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
            "photon map integrators do not support checkpointing".into(),
        ))
    }

    pub fn load_state<R: std::io::Read>(&mut self, _input: &mut R) -> RenderResult<()> {
        Err(RenderError::CheckpointMismatch(
            "photon map integrators do not support checkpointing".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::spectrum::Spectrum;
    use crate::scene::testutil::{medium_fixture, quad_fixture};
    use std::path::Path;

    fn run(desc: &crate::scene::SceneDescription, settings: PhotonMapSettings, spp: u32) -> Vec<Spectrum> {
        let scene =
            Arc::new(TraceableScene::prepare_for_render(desc, Path::new(".")).unwrap());
        let (w, h) = scene.cam().resolution();
        let film = Arc::new(Film::new(w, h));
        let pool = Arc::new(ThreadPool::new(2));
        let mut integrator = PhotonMapIntegrator::new(settings);
        integrator.prepare_for_render(scene, film.clone(), pool, 9);
        integrator.target_spp = spp;
        integrator.next_spp = spp;
        integrator.start_render();
        integrator.wait_for_completion();
        film.develop()
    }

    #[test]
    fn surface_gather_sees_emitter_energy() {
        let desc = quad_fixture(16);
        let settings = PhotonMapSettings {
            photon_count: 20_000,
            volume_photon_count: 0,
            gather_count: 8,
            ..Default::default()
        };
        let pixels = run(&desc, settings, 1);
        let total: Float = pixels.iter().map(|p| p.luminance()).sum();
        assert!(total > 0.0);
        for pixel in pixels {
            assert!(!pixel.is_nan());
        }
    }

    #[test]
    fn zero_photons_gathers_black_not_panic() {
        let mut desc = quad_fixture(8);
        // remove the emitter: shooting stores nothing
        desc.primitives.retain(|p| p.emission.is_none());
        let settings = PhotonMapSettings {
            photon_count: 1_000,
            ..Default::default()
        };
        let pixels = run(&desc, settings, 1);
        for pixel in pixels {
            assert_eq!(pixel, Spectrum::default());
        }
    }

    #[test]
    fn volume_points_estimate_single_scattering() {
        let desc = medium_fixture(8, 0.5);
        let settings = PhotonMapSettings {
            photon_count: 50_000,
            volume_photon_count: 50_000,
            include_surfaces: false,
            volume_photon_type: VolumePhotonType::Points,
            volume_gather_radius: 0.15,
            fixed_volume_radius: true,
            trace: crate::integrators::trace_base::TraceSettings {
                max_bounces: 8,
                ..Default::default()
            },
            ..Default::default()
        };
        let pixels = run(&desc, settings, 1);
        let total: Float = pixels.iter().map(|p| p.luminance()).sum();
        assert!(total > 0.0, "volume gather must see the point light");
    }
}
