//! Photon shooting and sensor-side density estimation: surface k-NN
//! gathers, volumetric point/beam/plane estimators, and the frustum-grid
//! direct splat pass.

// std
use std::collections::HashMap;
use std::sync::Arc;
// others
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
// lumen
use crate::accelerators::bvh::BinaryBvh;
use crate::accelerators::frustum_grid::FrustumBinner;
use crate::accelerators::grid::GridAccel;
use crate::accelerators::kd_tree::KdTree;
use crate::core::film::AtomicSplatBuffer;
use crate::core::geometry::{
    vec3_cross_vec3f, vec3_dot_vec3f, Bounds3f, Point2i, Point3f, Ray, Vector3f,
};
use crate::core::lumen::{lerp_t, sqr, Float, INV_PI};
use crate::core::records::{DirectionSample, PositionSample};
use crate::core::spectrum::Spectrum;
use crate::integrators::photon_map::photon::{
    PathPhotonRange, Photon, PhotonBeam, PhotonPlane0D, PhotonPlane1D, SurfacePhotonRange,
    VolumePhoton, VolumePhotonRange,
};
use crate::integrators::trace_base::{TraceBase, TraceSettings};
use crate::materials::BsdfLobes;
use crate::media::{Medium, MediumState};
use crate::samplers::PathSampleGenerator;
use crate::scene::TraceableScene;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VolumePhotonType {
    Points,
    Beams,
    Planes,
    Planes1D,
}

impl Default for VolumePhotonType {
    fn default() -> Self {
        VolumePhotonType::Points
    }
}

fn default_photon_count() -> u32 {
    1_000_000
}

fn default_gather_count() -> u32 {
    20
}

fn default_gather_radius() -> Float {
    1e30
}

fn default_volume_radius() -> Float {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_grid_budget() -> u64 {
    32 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotonMapSettings {
    #[serde(flatten)]
    pub trace: TraceSettings,
    #[serde(default = "default_photon_count")]
    pub photon_count: u32,
    #[serde(default = "default_photon_count")]
    pub volume_photon_count: u32,
    #[serde(default = "default_gather_count")]
    pub gather_count: u32,
    #[serde(default = "default_gather_radius")]
    pub gather_radius: Float,
    #[serde(default = "default_volume_radius")]
    pub volume_gather_radius: Float,
    #[serde(default = "default_true")]
    pub fixed_volume_radius: bool,
    #[serde(default)]
    pub volume_photon_type: VolumePhotonType,
    #[serde(default)]
    pub use_grid: bool,
    #[serde(default)]
    pub use_frustum_grid: bool,
    #[serde(default = "default_true")]
    pub low_order_scattering: bool,
    #[serde(default = "default_true")]
    pub include_surfaces: bool,
    #[serde(default = "default_grid_budget")]
    pub grid_mem_budget_kb: u64,
}

impl Default for PhotonMapSettings {
    fn default() -> Self {
        PhotonMapSettings {
            trace: TraceSettings {
                max_bounces: 16,
                ..Default::default()
            },
            photon_count: default_photon_count(),
            volume_photon_count: default_photon_count(),
            gather_count: default_gather_count(),
            gather_radius: default_gather_radius(),
            volume_gather_radius: default_volume_radius(),
            fixed_volume_radius: true,
            volume_photon_type: VolumePhotonType::Points,
            use_grid: false,
            use_frustum_grid: false,
            low_order_scattering: true,
            include_surfaces: true,
            grid_mem_budget_kb: default_grid_budget(),
        }
    }
}

/// Built photon structures; read-only during gathering.
pub struct PhotonStructures {
    pub surface_tree: KdTree<Photon>,
    pub volume_tree: Option<KdTree<VolumePhoton>>,
    pub beam_bvh: Option<BinaryBvh>,
    pub beam_grid: Option<GridAccel>,
    pub beams: Vec<PhotonBeam>,
    pub planes_0d: Vec<PhotonPlane0D>,
    pub planes_1d: Vec<PhotonPlane1D>,
    pub path_photon_count: u32,
}

fn exponential_integral(b: Spectrum, t0: Float, t1: Float) -> Spectrum {
    Spectrum::rgb(
        ((-b.r * t0).exp() - (-b.r * t1).exp()) / b.r.max(1e-12),
        ((-b.g * t0).exp() - (-b.g * t1).exp()) / b.g.max(1e-12),
        ((-b.b * t0).exp() - (-b.b * t1).exp()) / b.b.max(1e-12),
    )
}

/// Closest approach of a ray to a beam axis, clipped against the beam
/// extent, the optional leaf bounds and the ray interval.
fn intersect_beam_1d(
    beam: &PhotonBeam,
    ray: &Ray,
    bounds: Option<&Bounds3f>,
    t_min: Float,
    t_max: Float,
    radius: Float,
) -> Option<(Float, Float)> {
    let l = beam.p0 - ray.o;
    let u = vec3_cross_vec3f(&l, &beam.dir);
    let u_len = u.length();
    if u_len < 1e-9 {
        return None;
    }
    let u = u / u_len;

    let n = vec3_cross_vec3f(&beam.dir, &u);
    let denom = vec3_dot_vec3f(&n, &ray.d);
    if denom.abs() < 1e-9 {
        return None;
    }
    let t = vec3_dot_vec3f(&n, &l) / denom;
    let hit_point = ray.position(t);

    let sin_sq = (1.0 - sqr(vec3_dot_vec3f(&ray.d, &beam.dir))).max(0.0);
    if sin_sq <= 0.0 {
        return None;
    }
    let inv_sin_theta = 1.0 / sin_sq.sqrt();

    if vec3_dot_vec3f(&u, &(hit_point - beam.p0)).abs() > radius {
        return None;
    }
    if let Some(bounds) = bounds {
        if !bounds.contains(&hit_point) {
            return None;
        }
    }
    if t < t_min || t > t_max {
        return None;
    }
    let s = vec3_dot_vec3f(&beam.dir, &(hit_point - beam.p0));
    if s < 0.0 || s > beam.length {
        return None;
    }
    Some((inv_sin_theta, t))
}

fn intersect_plane_0d(
    ray: &Ray,
    t_min: Float,
    t_max: Float,
    p0: Point3f,
    p1: Point3f,
    p2: Point3f,
) -> Option<(Float, Float, Float, Float)> {
    let e1 = p1 - p0;
    let e2 = p2 - p0;
    let p = vec3_cross_vec3f(&ray.d, &e2);
    let det = vec3_dot_vec3f(&e1, &p);
    if det.abs() < 1e-5 {
        return None;
    }
    let inv_det = 1.0 / det;
    let t_vec = ray.o - p0;
    let u = vec3_dot_vec3f(&t_vec, &p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = vec3_cross_vec3f(&t_vec, &e1);
    let v = vec3_dot_vec3f(&ray.d, &q) * inv_det;
    if !(0.0..=1.0).contains(&v) {
        return None;
    }
    let far_t = vec3_dot_vec3f(&e2, &q) * inv_det;
    if far_t <= t_min || far_t >= t_max {
        return None;
    }
    Some((inv_det, far_t, u, v))
}

fn intersect_plane_1d(
    ray: &Ray,
    min_t: Float,
    max_t: Float,
    p0: Point3f,
    u: Vector3f,
    v: Vector3f,
    w: Vector3f,
) -> Option<(Vector3f, Vector3f, Float, Float)> {
    let o_world = ray.o - p0;
    let o = Vector3f::new(
        vec3_dot_vec3f(&u, &o_world),
        vec3_dot_vec3f(&v, &o_world),
        vec3_dot_vec3f(&w, &o_world),
    );
    let d = Vector3f::new(
        vec3_dot_vec3f(&u, &ray.d),
        vec3_dot_vec3f(&v, &ray.d),
        vec3_dot_vec3f(&w, &ray.d),
    );
    let mut tt_min = min_t;
    let mut tt_max = max_t;
    for axis in 0..3 {
        if d[axis].abs() < 1e-12 {
            if o[axis] < 0.0 || o[axis] > 1.0 {
                return None;
            }
            continue;
        }
        let inv = 1.0 / d[axis];
        let t0 = -o[axis] * inv;
        let t1 = (1.0 - o[axis]) * inv;
        let (t0, t1) = if t0 <= t1 { (t0, t1) } else { (t1, t0) };
        tt_min = tt_min.max(t0);
        tt_max = tt_max.min(t1);
    }
    if tt_min <= tt_max {
        Some((o, d, tt_min, tt_max))
    } else {
        None
    }
}

fn eval_beam_1d(
    beam: &PhotonBeam,
    ray: &Ray,
    medium: &Medium,
    bounds: Option<&Bounds3f>,
    t_min: Float,
    t_max: Float,
    radius: Float,
    estimate: &mut Spectrum,
) -> bool {
    if let Some((inv_sin_theta, t)) = intersect_beam_1d(beam, ray, bounds, t_min, t_max, radius) {
        let segment = Ray::new_segment(ray.o, ray.d, ray.t_min, t);
        *estimate += medium.sigma_t() * (inv_sin_theta / (2.0 * radius))
            * medium.phase_function().eval(&beam.dir, &-ray.d)
            * medium.transmittance(&segment)
            * beam.power;
        return true;
    }
    false
}

fn eval_plane_0d(
    scene: &TraceableScene,
    plane: &PhotonPlane0D,
    ray: &Ray,
    medium: &Medium,
    t_min: Float,
    t_max: Float,
    estimate: &mut Spectrum,
) -> bool {
    if let Some((inv_det, t, _u, v)) =
        intersect_plane_0d(ray, t_min, t_max, plane.p0, plane.p1, plane.p3)
    {
        let hit_point = ray.position(t);
        let shadow = Ray::new_segment(hit_point, -plane.d1, 0.0, plane.l1 * v);
        if !scene.occluded(&shadow) {
            let segment = Ray::new_segment(ray.o, ray.d, ray.t_min, t);
            let sigma_t = medium.sigma_t();
            *estimate += sigma_t * sigma_t * inv_det.abs()
                * medium.phase_function().eval(&plane.d1, &-ray.d)
                * medium.transmittance(&segment)
                * plane.power;
            return true;
        }
    }
    false
}

/// Per-(photon, bin) cache of occlusion distances along plane axes.
#[derive(Default)]
pub struct ShadowCache {
    cache: HashMap<(u32, u32), Float>,
}

impl ShadowCache {
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    fn hit_distance(&mut self, photon: u32, bin: u32, compute: impl FnOnce() -> Float) -> Float {
        *self.cache.entry((photon, bin)).or_insert_with(compute)
    }
}

/// 1-D photon plane estimator with an exponential-integral control variate
/// over the medium transmittance.
#[allow(clippy::too_many_arguments)]
fn eval_plane_1d(
    cache: &mut ShadowCache,
    scene: &TraceableScene,
    plane: &PhotonPlane1D,
    sampler: &mut PathSampleGenerator,
    ray: &Ray,
    medium: &Medium,
    t_min: Float,
    t_max: Float,
    photon_idx: u32,
    estimate: &mut Spectrum,
) -> bool {
    let (o, d, min_t, max_t) =
        match intersect_plane_1d(ray, t_min, t_max, plane.p, plane.inv_u, plane.inv_v, plane.inv_w)
        {
            Some(hit) => hit,
            None => return false,
        };
    let t = lerp_t(sampler.untracked_1d(), min_t, max_t);
    let uvw = o + d * t;
    if uvw.x < 0.0 || uvw.y < 0.0 || uvw.z < 0.0 || uvw.x > 1.0 || uvw.y > 1.0 || uvw.z > 1.0 {
        return false;
    }

    let d0 = plane.a * 2.0;
    let v0 = plane.p + plane.c;
    let v1 = v0 + d0 * uvw.x;

    let sigma_t = medium.sigma_t();
    let mut control_variate = exponential_integral(sigma_t, min_t, max_t);

    let bin = (plane.bin_count * uvw.x) as u32;
    let dist = cache.hit_distance(photon_idx, bin, || {
        let shadow = Ray::new_segment(v1, plane.d1, 0.0, plane.l1);
        scene.hit_distance(shadow)
    });

    if dist < uvw.y * plane.l1 * 0.99 {
        let segment = Ray::new_segment(ray.o, ray.d, ray.t_min, t);
        control_variate -= medium.transmittance(&segment) * (max_t - min_t);
    }

    *estimate += sigma_t
        * sigma_t
        * medium.phase_function().eval(&plane.d1, &-ray.d)
        * plane.power
        * control_variate;
    true
}

pub struct PhotonTracer {
    base: TraceBase,
    settings: PhotonMapSettings,
    mail_idx: u32,
    mailboxes: Vec<u32>,
    photon_query: Vec<u32>,
    distance_query: Vec<Float>,
    direct_cache: ShadowCache,
    indirect_cache: ShadowCache,
}

impl PhotonTracer {
    pub fn new(scene: Arc<TraceableScene>, settings: PhotonMapSettings, thread_id: u32) -> Self {
        let gather_count = settings.gather_count.max(1) as usize;
        let mailbox_count = settings.volume_photon_count as usize;
        PhotonTracer {
            base: TraceBase::new(scene, settings.trace.clone(), thread_id),
            settings,
            mail_idx: 0,
            mailboxes: vec![0; mailbox_count],
            photon_query: vec![0; gather_count],
            distance_query: vec![0.0; gather_count],
            direct_cache: ShadowCache::default(),
            indirect_cache: ShadowCache::default(),
        }
    }

    pub fn base(&self) -> &TraceBase {
        &self.base
    }

    pub fn clear_caches(&mut self) {
        self.direct_cache.clear();
        self.indirect_cache.clear();
        self.mailboxes.iter_mut().for_each(|m| *m = 0);
        self.mail_idx = 0;
    }

    /// Shoot one photon path, writing surface, volume and path photons into
    /// this worker's ranges.
    pub fn trace_photon_path(
        &mut self,
        surface_range: &mut SurfacePhotonRange,
        volume_range: &mut VolumePhotonRange,
        path_range: &mut PathPhotonRange,
        sampler: &mut PathSampleGenerator,
    ) {
        let scene = self.base.scene.clone();
        let settings = &self.settings;

        let (light, light_pdf) = match self.base.choose_light_adjoint(sampler) {
            Some(pair) => pair,
            None => return,
        };
        let mut point = PositionSample::default();
        if !light.sample_position(sampler, &mut point) {
            return;
        }
        let mut direction = DirectionSample::default();
        if !light.sample_direction(sampler, &point, &mut direction) {
            return;
        }

        let mut throughput = point.weight * direction.weight / light_pdf;
        let mut ray = Ray::new_segment(point.p, direction.d, 1e-4, Float::INFINITY);
        let mut medium = light.ext_medium();
        let mut state = MediumState::default();
        state.reset();

        if !path_range.full() {
            let photon = path_range.add_photon();
            photon.pos = point.p;
            photon.power = throughput;
            photon.set_path_info(0, true);
        }

        let trace_paths = !matches!(settings.volume_photon_type, VolumePhotonType::Points);
        let use_low_order = settings.low_order_scattering || trace_paths;

        let mut bounce = 0_u32;
        let mut was_specular = true;
        let mut emission = Spectrum::default();
        let mut hit = scene.intersect(&mut ray);

        while (hit.is_some() || medium.is_some()) && bounce + 1 < settings.trace.max_bounces {
            sampler.advance_path();
            let mut hit_surface = hit.is_some();
            bounce += 1;

            if let Some(current_medium) = medium.clone() {
                let incoming = ray.d;
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
                if !hit_surface {
                    if (bounce > 1 || use_low_order) && !volume_range.full() {
                        let photon = volume_range.add_photon();
                        photon.pos = medium_sample.p;
                        photon.dir = incoming;
                        photon.power = throughput;
                        photon.bounce = bounce;
                    }
                    if trace_paths && !path_range.full() {
                        if let Some(prev) = path_range.last_mut() {
                            prev.sampled_length = medium_sample.continued_t;
                        }
                        let photon = path_range.add_photon();
                        photon.pos = medium_sample.p;
                        photon.power = throughput;
                        photon.set_path_info(bounce, false);
                    }
                }
            }

            if hit_surface {
                let info = match hit {
                    Some(info) => info,
                    None => break,
                };
                let prim = scene.primitive(info.prim).clone();
                if !prim.bsdf.lobes().is_pure_specular()
                    && !prim.bsdf.lobes().is_forward()
                    && settings.include_surfaces
                    && !surface_range.full()
                {
                    let photon = surface_range.add_photon();
                    photon.pos = info.p;
                    photon.dir = ray.d;
                    photon.power = throughput;
                    photon.bounce = bounce;
                }
                if trace_paths && !path_range.full() {
                    let photon = path_range.add_photon();
                    photon.pos = info.p;
                    photon.power = throughput;
                    photon.set_path_info(bounce, true);
                }

                let mut event = self.base.make_local_scatter_event(&info, &ray);
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

            if surface_range.full() && volume_range.full() && path_range.full() {
                break;
            }
            if throughput.max_component() == 0.0 || throughput.is_nan() {
                break;
            }
            if ray.d.is_nan() || ray.o.to_vec().is_nan() {
                break;
            }

            if bounce < settings.trace.max_bounces {
                hit = scene.intersect(&mut ray);
            }
        }
    }

    /// Trace a camera ray and estimate radiance from the photon structures;
    /// the primary ray is recorded for the frustum pass.
    #[allow(clippy::too_many_arguments)]
    pub fn trace_sensor_path(
        &mut self,
        pixel: Point2i,
        structures: &PhotonStructures,
        sampler: &mut PathSampleGenerator,
        gather_radius: Float,
        volume_gather_radius: Float,
        depth_ray: &mut Ray,
        use_frustum_grid: bool,
    ) -> Spectrum {
        self.mail_idx += 1;
        let this = &mut *self;
        let mail_idx = this.mail_idx;
        let base = &this.base;
        let settings = &this.settings;
        let mailboxes = &mut this.mailboxes;
        let indirect_cache = &mut this.indirect_cache;
        let photon_query = &mut this.photon_query;
        let distance_query = &mut this.distance_query;

        let scene = base.scene.clone();
        let volume_type = settings.volume_photon_type;
        let min_bounces = settings.trace.min_bounces;
        let max_bounces = settings.trace.max_bounces;
        let include_surfaces = settings.include_surfaces;
        let gather_count = settings.gather_count as usize;

        let mut ray = Ray::default();
        if !scene.cam().generate_sample(pixel, sampler, &mut ray) {
            return Spectrum::default();
        }

        let mut throughput = Spectrum::new(1.0);
        let mut medium = scene.camera_medium();
        let mut result = Spectrum::default();
        let mut bounce = 0_u32;
        let mut hit = scene.intersect(&mut ray);
        *depth_ray = ray;

        while (medium.is_some() || hit.is_some()) && bounce < max_bounces {
            bounce += 1;

            if let Some(current_medium) = medium.clone() {
                // the frustum pass covers camera-segment beams directly
                if bounce > 1 || !use_frustum_grid {
                    let far_t = if ray.t_max.is_finite() { ray.t_max } else { 1e30 };
                    let mut estimate = Spectrum::default();

                    match volume_type {
                        VolumePhotonType::Points => {
                            if let Some(tree) = &structures.volume_tree {
                                tree.beam_query(ray.o, ray.d, far_t, |photon, t, dist_sq| {
                                    let full_bounce = bounce + photon.bounce - 1;
                                    if full_bounce < min_bounces || full_bounce >= max_bounces {
                                        return;
                                    }
                                    let segment = Ray::new_segment(ray.o, ray.d, ray.t_min, t);
                                    let kernel = (3.0
                                        * INV_PI
                                        * sqr(1.0 - dist_sq / photon.radius_sq))
                                        / photon.radius_sq;
                                    estimate += kernel
                                        * current_medium
                                            .phase_function()
                                            .eval(&photon.dir, &-ray.d)
                                        * current_medium.transmittance(&segment)
                                        * photon.power;
                                });
                            }
                        }
                        VolumePhotonType::Beams => {
                            let visit_beam = |idx: u32,
                                             t0: Float,
                                             t1: Float,
                                             bounds: Option<&Bounds3f>,
                                             estimate: &mut Spectrum| {
                                let beam = &structures.beams[idx as usize];
                                if !beam.valid {
                                    return;
                                }
                                let full_bounce = bounce + beam.bounce;
                                if full_bounce < min_bounces || full_bounce >= max_bounces {
                                    return;
                                }
                                eval_beam_1d(
                                    beam,
                                    &ray,
                                    &current_medium,
                                    bounds,
                                    t0,
                                    t1,
                                    volume_gather_radius,
                                    estimate,
                                );
                            };
                            if let Some(bvh) = &structures.beam_bvh {
                                bvh.trace(&ray, |idx, t0, t1, bounds| {
                                    visit_beam(idx, t0, t1, Some(bounds), &mut estimate)
                                });
                            } else if let Some(grid) = &structures.beam_grid {
                                grid.trace(&ray, |idx, t0, t1| {
                                    visit_beam(idx, t0, t1, None, &mut estimate)
                                });
                            }
                        }
                        VolumePhotonType::Planes | VolumePhotonType::Planes1D => {
                            let mut visit_plane =
                                |idx: u32,
                                 t0: Float,
                                 t1: Float,
                                 bounds: Option<&Bounds3f>,
                                 estimate: &mut Spectrum,
                                 sampler: &mut PathSampleGenerator| {
                                    let beam = &structures.beams[idx as usize];
                                    if beam.valid {
                                        let full_bounce = bounce + beam.bounce;
                                        if full_bounce < min_bounces
                                            || full_bounce >= max_bounces
                                        {
                                            return;
                                        }
                                        eval_beam_1d(
                                            beam,
                                            &ray,
                                            &current_medium,
                                            bounds,
                                            t0,
                                            t1,
                                            volume_gather_radius,
                                            estimate,
                                        );
                                    } else if volume_type == VolumePhotonType::Planes1D {
                                        let plane = &structures.planes_1d[idx as usize];
                                        if !plane.valid {
                                            return;
                                        }
                                        let full_bounce = bounce + plane.bounce;
                                        if full_bounce < min_bounces
                                            || full_bounce >= max_bounces
                                        {
                                            return;
                                        }
                                        eval_plane_1d(
                                            indirect_cache,
                                            &scene,
                                            plane,
                                            sampler,
                                            &ray,
                                            &current_medium,
                                            t0,
                                            t1,
                                            idx,
                                            estimate,
                                        );
                                    } else {
                                        let plane = &structures.planes_0d[idx as usize];
                                        if !plane.valid {
                                            return;
                                        }
                                        let full_bounce = bounce + plane.bounce;
                                        if full_bounce < min_bounces
                                            || full_bounce >= max_bounces
                                        {
                                            return;
                                        }
                                        eval_plane_0d(
                                            &scene,
                                            plane,
                                            &ray,
                                            &current_medium,
                                            t0,
                                            t1,
                                            estimate,
                                        );
                                    }
                                };
                            if let Some(bvh) = &structures.beam_bvh {
                                bvh.trace(&ray, |idx, t0, t1, bounds| {
                                    visit_plane(idx, t0, t1, Some(bounds), &mut estimate, sampler)
                                });
                            } else if let Some(grid) = &structures.beam_grid {
                                grid.trace(&ray, |idx, t0, t1| {
                                    // overlapping cells deduplicated by
                                    // per-worker mailboxes
                                    if mailboxes[idx as usize] == mail_idx {
                                        return;
                                    }
                                    mailboxes[idx as usize] = mail_idx;
                                    visit_plane(idx, t0, t1, None, &mut estimate, sampler)
                                });
                            }
                        }
                    }

                    result += throughput * estimate;
                }
                let segment = Ray::new_segment(ray.o, ray.d, ray.t_min, ray.t_max.min(1e30));
                throughput *= current_medium.transmittance(&segment);
            }

            let info = match hit {
                Some(info) => info,
                None => break,
            };
            if !include_surfaces {
                break;
            }

            // the camera walk only steps through transparency or specular
            // lobes; diffuse radiance comes from the photon gather
            let prim = scene.primitive(info.prim).clone();
            let event = base.make_local_scatter_event(&info, &ray);
            if prim.bsdf.lobes().is_forward() || prim.bsdf.lobes().is_pure_specular() {
                let mut event = event;
                event.requested_lobe = BsdfLobes::all() | BsdfLobes::FORWARD;
                if !prim.bsdf.sample(&mut event, sampler, false) {
                    break;
                }
                let wo = event.frame.to_global(&event.wo);
                throughput *= event.weight;
                medium = prim.select_medium(&info, &wo);
                ray = ray.scatter(info.p, wo, info.epsilon);
                if ray.d.is_nan() || throughput.is_nan() {
                    break;
                }
                if bounce < max_bounces {
                    hit = scene.intersect(&mut ray);
                }
                continue;
            }

            if prim.is_emissive() && bounce > min_bounces {
                result += throughput * prim.eval_direct(&info, &ray.d);
            }

            let count = structures.surface_tree.nearest_neighbours(
                info.p,
                photon_query,
                distance_query,
                gather_count,
                gather_radius,
            );
            if count == 0 {
                break;
            }
            let mut surface_estimate = Spectrum::default();
            for i in 0..count {
                let photon = &structures.surface_tree.nodes()[photon_query[i] as usize];
                let full_bounce = bounce + photon.bounce - 1;
                if full_bounce < min_bounces || full_bounce >= max_bounces {
                    continue;
                }
                let query = event.make_warped_query(event.wi, event.frame.to_local(&-photon.dir));
                let eval = prim.bsdf.eval(&query, false);
                let cos = query.wo.z.abs().max(1e-6);
                surface_estimate += photon.power * eval / cos;
            }
            let radius_sq = if count == gather_count {
                distance_query[0]
            } else {
                gather_radius * gather_radius
            };
            result += throughput * surface_estimate * (INV_PI / radius_sq.max(1e-12));
            break;
        }

        if result.is_nan() {
            return Spectrum::default();
        }
        result
    }

    /// Direct splat pass: project beams and planes onto the pixels whose
    /// recorded primary rays can hit them, bypassing the tree traversal.
    #[allow(clippy::too_many_arguments)]
    pub fn eval_primary_rays(
        &mut self,
        structures: &PhotonStructures,
        binner: &FrustumBinner,
        start: u32,
        end: u32,
        radius: Float,
        depth_rays: &[Ray],
        splat: &AtomicSplatBuffer,
        sampler: &mut PathSampleGenerator,
        scale: Float,
    ) {
        let this = &mut *self;
        let base = &this.base;
        let settings = &this.settings;
        let direct_cache = &mut this.direct_cache;

        let scene = base.scene.clone();
        let medium = match scene.camera_medium() {
            Some(medium) => medium,
            None => return,
        };
        let cam_pos = scene.cam().pos();
        let (w, h) = scene.cam().resolution();
        let min_bounce = settings.trace.min_bounces.saturating_sub(1);
        let max_bounce = settings.trace.max_bounces.saturating_sub(1);

        for i in start..end {
            let beam = &structures.beams[i as usize];
            if beam.valid && beam.bounce >= min_bounce && beam.bounce < max_bounce {
                let u = vec3_cross_vec3f(&(beam.p0 - cam_pos), &beam.dir);
                let u = if u.length_squared() > 1e-12 {
                    u.normalize()
                } else {
                    Vector3f::new(0.0, 1.0, 0.0)
                };
                binner.bin_beam(beam.p0, beam.p1, u, radius, |x, y, idx| {
                    let pixel_ray = &depth_rays[idx];
                    let mut value = Spectrum::default();
                    if eval_beam_1d(
                        beam,
                        pixel_ray,
                        &medium,
                        None,
                        pixel_ray.t_min,
                        pixel_ray.t_max,
                        radius,
                        &mut value,
                    ) {
                        splat.splat(x.min(w - 1), y.min(h - 1), value * scale);
                    }
                });
            }

            if let Some(plane) = structures.planes_0d.get(i as usize) {
                if plane.valid && plane.bounce >= min_bounce && plane.bounce < max_bounce {
                    binner.bin_plane(plane.p0, plane.p1, plane.p2, plane.p3, |x, y, idx| {
                        let pixel_ray = &depth_rays[idx];
                        let mut value = Spectrum::default();
                        if eval_plane_0d(
                            &scene,
                            plane,
                            pixel_ray,
                            &medium,
                            pixel_ray.t_min,
                            pixel_ray.t_max,
                            &mut value,
                        ) {
                            splat.splat(x.min(w - 1), y.min(h - 1), value * scale);
                        }
                    });
                }
            }

            if let Some(plane) = structures.planes_1d.get(i as usize) {
                if plane.valid && plane.bounce >= min_bounce && plane.bounce < max_bounce {
                    binner.bin_plane_1d(plane.center, plane.a, plane.b, plane.c, |x, y, idx| {
                        let pixel_ray = &depth_rays[idx];
                        let mut value = Spectrum::default();
                        if eval_plane_1d(
                            direct_cache,
                            &scene,
                            plane,
                            sampler,
                            pixel_ray,
                            &medium,
                            pixel_ray.t_min,
                            pixel_ray.t_max,
                            i,
                            &mut value,
                        ) {
                            splat.splat(x.min(w - 1), y.min(h - 1), value * scale);
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beam_kernel_respects_perpendicular_radius() {
        let beam = PhotonBeam {
            p0: Point3f::new(0.0, -1.0, 5.0),
            p1: Point3f::new(0.0, 1.0, 5.0),
            dir: Vector3f::new(0.0, 1.0, 0.0),
            length: 2.0,
            power: Spectrum::new(1.0),
            bounce: 1,
            valid: true,
        };
        let ray = Ray::new_segment(
            Point3f::default(),
            Vector3f::new(0.0, 0.0, 1.0),
            0.0,
            100.0,
        );
        let hit = intersect_beam_1d(&beam, &ray, None, 0.0, 100.0, 0.2);
        let (inv_sin_theta, t) = hit.expect("beam crosses ray");
        assert!((t - 5.0).abs() < 1e-4);
        assert!((inv_sin_theta - 1.0).abs() < 1e-4);

        // a beam displaced past the radius misses
        let mut far_beam = beam;
        far_beam.p0.x += 0.5;
        far_beam.p1.x += 0.5;
        assert!(intersect_beam_1d(&far_beam, &ray, None, 0.0, 100.0, 0.2).is_none());
    }

    #[test]
    fn plane_0d_intersection_finds_parallelogram() {
        let ray = Ray::new_segment(
            Point3f::new(0.25, 0.25, -1.0),
            Vector3f::new(0.0, 0.0, 1.0),
            0.0,
            10.0,
        );
        let hit = intersect_plane_0d(
            &ray,
            0.0,
            10.0,
            Point3f::new(0.0, 0.0, 1.0),
            Point3f::new(1.0, 0.0, 1.0),
            Point3f::new(0.0, 1.0, 1.0),
        );
        let (_inv_det, t, u, v) = hit.expect("hit");
        assert!((t - 2.0).abs() < 1e-4);
        assert!((u - 0.25).abs() < 1e-4);
        assert!((v - 0.25).abs() < 1e-4);
    }

    #[test]
    fn bounds_argument_clips_beam_hits() {
        let beam = PhotonBeam {
            p0: Point3f::new(0.0, -10.0, 5.0),
            p1: Point3f::new(0.0, 10.0, 5.0),
            dir: Vector3f::new(0.0, 1.0, 0.0),
            length: 20.0,
            power: Spectrum::new(1.0),
            bounce: 1,
            valid: true,
        };
        let ray = Ray::new_segment(
            Point3f::default(),
            Vector3f::new(0.0, 0.0, 1.0),
            0.0,
            100.0,
        );
        let clip = Bounds3f {
            p_min: Point3f::new(-1.0, 5.0, 0.0),
            p_max: Point3f::new(1.0, 10.0, 10.0),
        };
        assert!(intersect_beam_1d(&beam, &ray, Some(&clip), 0.0, 100.0, 0.2).is_none());
    }

    #[test]
    fn exponential_integral_matches_quadrature() {
        let b = Spectrum::new(0.5);
        let analytic = exponential_integral(b, 0.2, 1.7).r;
        let mut numeric = 0.0_f64;
        let steps = 10_000;
        for i in 0..steps {
            let t = 0.2 + (1.7 - 0.2) * (i as f64 + 0.5) / steps as f64;
            numeric += (-0.5 * t).exp() * (1.7 - 0.2) / steps as f64;
        }
        assert!((f64::from(analytic) - numeric).abs() < 1e-3);
    }
}
