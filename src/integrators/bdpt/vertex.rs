//! Path vertices and edges for the bidirectional integrators.
//!
//! A vertex is a tagged variant over camera, emitter, surface and volume
//! records. Each carries the accumulated throughput toward the root and two
//! scalar densities, `pdf_forward` toward the tip and `pdf_backward` toward
//! the root, converted to area measure by `LightPath::prune`.

// std
use std::sync::Arc;
// lumen
use crate::cameras::Camera;
use crate::core::geometry::{
    vec3_dot_nrmf, Normal3f, Point2i, Point3f, Ray, Vector3f,
};
use crate::core::lumen::{Float, DEFAULT_EPSILON};
use crate::core::records::{
    DirectionSample, PositionSample, SurfaceScatterEvent, VolumeScatterEvent,
};
use crate::core::spectrum::Spectrum;
use crate::integrators::trace_base::TraceBase;
use crate::media::{Medium, MediumState};
use crate::samplers::{PathSampleGenerator, WritableSampler};
use crate::scene::TraceableScene;
use crate::shapes::{IntersectionInfo, Primitive};

/// Mutable state threaded through the extension of one subpath.
pub struct TraceState<'a> {
    pub sampler: &'a mut PathSampleGenerator,
    pub medium: Option<Arc<Medium>>,
    pub medium_state: MediumState,
    pub ray: Ray,
    pub bounce: u32,
    pub was_specular: bool,
}

impl<'a> TraceState<'a> {
    pub fn new(sampler: &'a mut PathSampleGenerator) -> Self {
        TraceState {
            sampler,
            medium: None,
            medium_state: MediumState::default(),
            ray: Ray::default(),
            bounce: 0,
            was_specular: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CameraRecord {
    pub point: PositionSample,
    pub direction: DirectionSample,
    pub pixel: Option<Point2i>,
}

#[derive(Debug, Clone)]
pub struct EmitterRecord {
    pub point: PositionSample,
    pub direction: DirectionSample,
    pub emitter_pdf: Float,
}

#[derive(Debug, Clone)]
pub struct SurfaceRecord {
    pub event: SurfaceScatterEvent,
    pub info: IntersectionInfo,
    pub is_infinite: bool,
}

#[derive(Debug, Clone)]
pub struct VolumeRecord {
    pub event: VolumeScatterEvent,
    /// distance the sampler drew for the segment leaving this vertex
    pub sampled_t: Float,
    pub component: usize,
    pub first_scatter: bool,
}

#[derive(Clone)]
pub enum PathVertex {
    Camera {
        camera: Arc<Camera>,
        record: CameraRecord,
        throughput: Spectrum,
        pdf_forward: Float,
        pdf_backward: Float,
    },
    Emitter {
        emitter: Arc<Primitive>,
        record: EmitterRecord,
        throughput: Spectrum,
        pdf_forward: Float,
        pdf_backward: Float,
    },
    Surface {
        prim: Arc<Primitive>,
        record: SurfaceRecord,
        throughput: Spectrum,
        pdf_forward: Float,
        pdf_backward: Float,
    },
    Volume {
        medium: Arc<Medium>,
        record: VolumeRecord,
        throughput: Spectrum,
        pdf_forward: Float,
        pdf_backward: Float,
    },
}

#[derive(Debug, Default, Copy, Clone)]
pub struct PathEdge {
    pub d: Vector3f,
    pub r: Float,
    pub r_sq: Float,
    pub pdf_forward: Float,
    pub pdf_backward: Float,
}

impl PathEdge {
    pub fn from_direction(d: Vector3f, r: Float, r_sq: Float) -> Self {
        PathEdge {
            d,
            r,
            r_sq,
            pdf_forward: 1.0,
            pdf_backward: 1.0,
        }
    }

    pub fn between(root: &PathVertex, tip: &PathVertex) -> Self {
        let mut d = tip.pos() - root.pos();
        let r_sq = d.length_squared();
        let r = r_sq.sqrt();
        if r != 0.0 {
            d = d / r;
        }
        PathEdge {
            d,
            r,
            r_sq,
            pdf_forward: 1.0,
            pdf_backward: 1.0,
        }
    }

    pub fn reverse(&self) -> PathEdge {
        PathEdge {
            d: -self.d,
            r: self.r,
            r_sq: self.r_sq,
            pdf_forward: self.pdf_backward,
            pdf_backward: self.pdf_forward,
        }
    }
}

impl PathVertex {
    pub fn camera_root(camera: Arc<Camera>, pixel: Option<Point2i>) -> Self {
        PathVertex::Camera {
            camera,
            record: CameraRecord {
                point: PositionSample::default(),
                direction: DirectionSample::default(),
                pixel,
            },
            throughput: Spectrum::new(1.0),
            pdf_forward: 1.0,
            pdf_backward: 1.0,
        }
    }

    pub fn emitter_root(emitter: Arc<Primitive>, emitter_pdf: Float) -> Self {
        PathVertex::Emitter {
            emitter,
            record: EmitterRecord {
                point: PositionSample::default(),
                direction: DirectionSample::default(),
                emitter_pdf,
            },
            throughput: Spectrum::new(1.0),
            pdf_forward: 1.0,
            pdf_backward: 1.0,
        }
    }

    pub fn throughput(&self) -> Spectrum {
        match self {
            PathVertex::Camera { throughput, .. }
            | PathVertex::Emitter { throughput, .. }
            | PathVertex::Surface { throughput, .. }
            | PathVertex::Volume { throughput, .. } => *throughput,
        }
    }

    pub fn pdf_forward(&self) -> Float {
        match self {
            PathVertex::Camera { pdf_forward, .. }
            | PathVertex::Emitter { pdf_forward, .. }
            | PathVertex::Surface { pdf_forward, .. }
            | PathVertex::Volume { pdf_forward, .. } => *pdf_forward,
        }
    }

    pub fn pdf_backward(&self) -> Float {
        match self {
            PathVertex::Camera { pdf_backward, .. }
            | PathVertex::Emitter { pdf_backward, .. }
            | PathVertex::Surface { pdf_backward, .. }
            | PathVertex::Volume { pdf_backward, .. } => *pdf_backward,
        }
    }

    pub fn pdf_forward_mut(&mut self) -> &mut Float {
        match self {
            PathVertex::Camera { pdf_forward, .. }
            | PathVertex::Emitter { pdf_forward, .. }
            | PathVertex::Surface { pdf_forward, .. }
            | PathVertex::Volume { pdf_forward, .. } => pdf_forward,
        }
    }

    pub fn pdf_backward_mut(&mut self) -> &mut Float {
        match self {
            PathVertex::Camera { pdf_backward, .. }
            | PathVertex::Emitter { pdf_backward, .. }
            | PathVertex::Surface { pdf_backward, .. }
            | PathVertex::Volume { pdf_backward, .. } => pdf_backward,
        }
    }

    pub fn pos(&self) -> Point3f {
        match self {
            PathVertex::Camera { record, .. } => record.point.p,
            PathVertex::Emitter { record, .. } => record.point.p,
            PathVertex::Surface { record, .. } => record.info.p,
            PathVertex::Volume { record, .. } => record.event.p,
        }
    }

    pub fn normal(&self) -> Normal3f {
        match self {
            PathVertex::Camera { record, .. } => record.point.ng,
            PathVertex::Emitter { record, .. } => record.point.ng,
            PathVertex::Surface { record, .. } => record.info.ng,
            PathVertex::Volume { .. } => Normal3f::default(),
        }
    }

    pub fn cosine_factor(&self, d: &Vector3f) -> Float {
        match self {
            PathVertex::Camera { record, .. } => vec3_dot_nrmf(d, &record.point.ng).abs(),
            PathVertex::Emitter { emitter, record, .. } => {
                if emitter.is_dirac() {
                    1.0
                } else {
                    vec3_dot_nrmf(d, &record.point.ng).abs()
                }
            }
            PathVertex::Surface { record, .. } => vec3_dot_nrmf(d, &record.info.ng).abs(),
            PathVertex::Volume { .. } => 1.0,
        }
    }

    pub fn on_surface(&self) -> bool {
        match self {
            PathVertex::Camera { .. } => true,
            PathVertex::Emitter { emitter, .. } => !emitter.is_dirac() && !emitter.is_infinite(),
            PathVertex::Surface { .. } => true,
            PathVertex::Volume { .. } => false,
        }
    }

    /// Dirac vertices carry point-mass sampling densities and cannot anchor
    /// connections.
    pub fn is_dirac(&self) -> bool {
        match self {
            PathVertex::Camera { camera, .. } => camera.is_dirac(),
            PathVertex::Emitter { emitter, .. } => emitter.is_dirac(),
            PathVertex::Surface { prim, .. } => prim.bsdf.is_dirac(),
            PathVertex::Volume { .. } => false,
        }
    }

    pub fn connectable(&self) -> bool {
        match self {
            // the pinhole camera root still accepts t=1 splat connections
            PathVertex::Camera { .. } => true,
            PathVertex::Emitter { .. } => true,
            PathVertex::Surface { record, .. } => !self.is_dirac() && !record.is_infinite,
            PathVertex::Volume { .. } => true,
        }
    }

    /// Forward events are collapsed out of the path before MIS.
    pub fn is_forward(&self) -> bool {
        match self {
            PathVertex::Surface { prim, .. } => prim.bsdf.lobes().is_forward(),
            _ => false,
        }
    }

    pub fn is_infinite_emitter(&self) -> bool {
        match self {
            PathVertex::Emitter { emitter, .. } => emitter.is_infinite(),
            _ => false,
        }
    }

    pub fn is_infinite_surface(&self) -> bool {
        match self {
            PathVertex::Surface { record, .. } => record.is_infinite,
            _ => false,
        }
    }

    pub fn emitter(&self) -> Option<&Arc<Primitive>> {
        match self {
            PathVertex::Emitter { emitter, .. } => Some(emitter),
            _ => None,
        }
    }

    pub fn camera(&self) -> Option<&Arc<Camera>> {
        match self {
            PathVertex::Camera { camera, .. } => Some(camera),
            _ => None,
        }
    }

    pub fn camera_record(&self) -> Option<&CameraRecord> {
        match self {
            PathVertex::Camera { record, .. } => Some(record),
            _ => None,
        }
    }

    pub fn emitter_record(&self) -> Option<&EmitterRecord> {
        match self {
            PathVertex::Emitter { record, .. } => Some(record),
            _ => None,
        }
    }

    pub fn surface_record(&self) -> Option<&SurfaceRecord> {
        match self {
            PathVertex::Surface { record, .. } => Some(record),
            _ => None,
        }
    }

    /// Two vertices landing on the same surface produce degenerate
    /// connections; reject on vanishing mutual cosine.
    pub fn segment_connectable(&self, other: &PathVertex) -> bool {
        let edge = PathEdge::between(self, other);
        if edge.r <= 0.0 {
            return false;
        }
        self.cosine_factor(&edge.d) > 1e-5 && other.cosine_factor(&edge.d) > 1e-5
    }

    /// Medium on the side of this vertex that `d` leaves through.
    pub fn select_medium(&self, d: &Vector3f) -> Option<Arc<Medium>> {
        match self {
            PathVertex::Camera { .. } => None,
            PathVertex::Emitter { emitter, .. } => emitter.ext_medium(),
            PathVertex::Surface { prim, record, .. } => prim.select_medium(&record.info, d),
            PathVertex::Volume { medium, .. } => Some(medium.clone()),
        }
    }

    /// Sample the root's positional component. Fills throughput and the
    /// forward density in the root's native measure.
    pub fn sample_root_vertex(&mut self, state: &mut TraceState) -> bool {
        match self {
            PathVertex::Emitter {
                emitter,
                record,
                throughput,
                pdf_forward,
                ..
            } => {
                if !emitter.sample_position(state.sampler, &mut record.point) {
                    return false;
                }
                *throughput = record.point.weight / record.emitter_pdf;
                *pdf_forward = record.point.pdf * record.emitter_pdf;
                state.medium = emitter.ext_medium();
                true
            }
            PathVertex::Camera {
                camera,
                record,
                throughput,
                pdf_forward,
                ..
            } => {
                if !camera.sample_position(state.sampler, &mut record.point) {
                    return false;
                }
                *throughput = record.point.weight;
                *pdf_forward = record.point.pdf;
                true
            }
            _ => false,
        }
    }

    /// Extend the path by one vertex. Returns the new vertex and connecting
    /// edge, or None when the path terminates.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_next_vertex(
        &mut self,
        scene: &TraceableScene,
        tracer: &TraceBase,
        state: &mut TraceState,
        adjoint: bool,
        prev: Option<&mut PathVertex>,
        prev_edge: Option<&mut PathEdge>,
    ) -> Option<(PathVertex, PathEdge)> {
        let weight;
        let pdf;

        match self {
            PathVertex::Emitter { emitter, record, .. } => {
                if !emitter.sample_direction(state.sampler, &record.point, &mut record.direction) {
                    return None;
                }
                weight = record.direction.weight;
                pdf = record.direction.pdf;
                state.ray =
                    Ray::new_segment(record.point.p, record.direction.d, DEFAULT_EPSILON, Float::INFINITY);
            }
            PathVertex::Camera { camera, record, .. } => {
                let pixel = camera.sample_direction(
                    state.sampler,
                    &record.point,
                    record.pixel,
                    &mut record.direction,
                );
                match pixel {
                    Some(p) => record.pixel = Some(p),
                    None => return None,
                }
                weight = record.direction.weight;
                pdf = record.direction.pdf;
                state.ray = Ray::new(record.point.p, record.direction.d);
                state.ray.primary_ray = true;
            }
            PathVertex::Surface { prim, record, .. } => {
                if record.is_infinite {
                    return None;
                }
                let bsdf = prim.bsdf.clone();
                record.event.requested_lobe =
                    crate::materials::BsdfLobes::all() | crate::materials::BsdfLobes::FORWARD;
                if !bsdf.sample(&mut record.event, state.sampler, adjoint) {
                    return None;
                }
                // reverse solid-angle density at the previous vertex;
                // prune() converts to area measure
                if let Some(prev) = prev {
                    *prev.pdf_backward_mut() = bsdf.pdf(&record.event.make_flipped_query());
                }
                let _ = prev_edge;
                weight = record.event.weight;
                pdf = record.event.pdf;
                let wo = record.event.frame.to_global(&record.event.wo);
                state.medium = prim.select_medium(&record.info, &wo);
                state.ray = state
                    .ray
                    .scatter(record.info.p, wo, record.info.epsilon.max(DEFAULT_EPSILON));
            }
            PathVertex::Volume { medium, record, .. } => {
                let phase = medium.phase_function();
                let sample = phase.sample(&record.event.wi, state.sampler);
                record.event.wo = sample.w;
                if let Some(prev) = prev {
                    *prev.pdf_backward_mut() =
                        phase.pdf(&-record.event.wo, &-record.event.wi);
                }
                let _ = prev_edge;
                weight = sample.weight;
                pdf = sample.pdf;
                state.medium = Some(medium.clone());
                state.ray = Ray::new(record.event.p, sample.w);
                state.ray.bounce = state.bounce + 1;
            }
        }

        if pdf <= 0.0 {
            return None;
        }

        // March toward the next vertex, optionally scattering in a medium.
        let mut hit = scene.intersect(&mut state.ray);
        let throughput = self.throughput() * weight;

        if let Some(medium) = state.medium.clone() {
            let mut medium_sample = crate::core::records::MediumSample::default();
            let first_scatter = state.medium_state.first_scatter;
            if !medium.sample_distance(
                state.sampler,
                &state.ray,
                &mut state.medium_state,
                &mut medium_sample,
            ) {
                return None;
            }
            if !medium_sample.exited {
                let component = state.medium_state.component;
                let mut next = PathVertex::Volume {
                    medium: medium.clone(),
                    record: VolumeRecord {
                        event: VolumeScatterEvent {
                            p: medium_sample.p,
                            wi: state.ray.d,
                            wo: Vector3f::default(),
                            weight: medium_sample.weight,
                            pdf: medium_sample.pdf,
                        },
                        sampled_t: medium_sample.continued_t,
                        component,
                        first_scatter,
                    },
                    throughput: throughput * medium_sample.weight,
                    pdf_forward: 0.0,
                    pdf_backward: 1.0,
                };
                state.bounce += 1;
                let mut next_edge = PathEdge::between(self, &next);
                let seg = Ray::new_segment(state.ray.o, state.ray.d, 0.0, medium_sample.t);
                let (_, pf, pb) = medium.transmittance_and_pdfs(&seg, self.on_surface(), false);
                next_edge.pdf_forward = pf;
                next_edge.pdf_backward = pb;
                *next.pdf_forward_mut() = pdf;
                return Some((next, next_edge));
            }
            // fall through to the surface hit with the transmittance weight
            let hit_info = hit?;
            let seg = Ray::new_segment(state.ray.o, state.ray.d, state.ray.t_min, state.ray.t_max);
            let (_, pf, pb) = medium.transmittance_and_pdfs(&seg, self.on_surface(), true);
            let mut next = Self::surface_vertex(scene, tracer, &hit_info, &state.ray,
                throughput * medium_sample.weight);
            state.bounce += 1;
            let mut next_edge = PathEdge::between(self, &next);
            next_edge.pdf_forward = pf;
            next_edge.pdf_backward = pb;
            *next.pdf_forward_mut() = pdf;
            return Some((next, next_edge));
        }

        let next = match hit.take() {
            Some(info) => Self::surface_vertex(scene, tracer, &info, &state.ray, throughput),
            None => {
                // infinite emitters materialize as terminal surface vertices
                let info = scene.intersect_infinites(&state.ray)?;
                let prim = scene.primitive(info.prim).clone();
                let event = tracer.make_local_scatter_event(&info, &state.ray);
                PathVertex::Surface {
                    prim,
                    record: SurfaceRecord {
                        event,
                        info,
                        is_infinite: true,
                    },
                    throughput,
                    pdf_forward: 0.0,
                    pdf_backward: 1.0,
                }
            }
        };
        state.bounce += 1;
        let mut next = next;
        let next_edge = if next.is_infinite_surface() {
            PathEdge::from_direction(state.ray.d, 1.0, 1.0)
        } else {
            PathEdge::between(self, &next)
        };
        *next.pdf_forward_mut() = pdf;
        Some((next, next_edge))
    }

    fn surface_vertex(
        scene: &TraceableScene,
        tracer: &TraceBase,
        info: &IntersectionInfo,
        ray: &Ray,
        throughput: Spectrum,
    ) -> PathVertex {
        let prim = scene.primitive(info.prim).clone();
        let event = tracer.make_local_scatter_event(info, ray);
        PathVertex::Surface {
            prim,
            record: SurfaceRecord {
                event,
                info: *info,
                is_infinite: false,
            },
            throughput,
            pdf_forward: 0.0,
            pdf_backward: 1.0,
        }
    }

    /// Evaluate scattering (or emission/importance) into direction `d`.
    pub fn eval(&self, d: &Vector3f, adjoint: bool) -> Spectrum {
        match self {
            PathVertex::Emitter { emitter, record, .. } => {
                emitter.eval_directional_emission(&record.point, d)
            }
            PathVertex::Camera { .. } => Spectrum::default(),
            PathVertex::Surface { prim, record, .. } => {
                let query = record
                    .event
                    .make_warped_query(record.event.wi, record.event.frame.to_local(d));
                prim.bsdf.eval(&query, adjoint)
            }
            PathVertex::Volume { medium, record, .. } => {
                Spectrum::new(medium.phase_function().eval(&record.event.wi, d))
            }
        }
    }

    /// Recompute the forward/backward densities at a connection tip; used
    /// by MIS weighting to evaluate foreign techniques.
    pub fn eval_pdfs(
        &self,
        prev: Option<&PathVertex>,
        prev_edge: Option<&PathEdge>,
        next: &PathVertex,
        next_edge: &PathEdge,
        forward: &mut Float,
        backward: Option<&mut Float>,
    ) {
        match self {
            PathVertex::Emitter { emitter, record, .. } => {
                let geom = if next.is_infinite_surface() {
                    1.0
                } else {
                    next.cosine_factor(&next_edge.d) / next_edge.r_sq
                };
                *forward = geom * emitter.directional_pdf(&record.point, &next_edge.d);
            }
            PathVertex::Camera { camera, .. } => {
                *forward = next.cosine_factor(&next_edge.d) / next_edge.r_sq
                    * camera.direction_pdf(&next_edge.d);
            }
            PathVertex::Surface { prim, record, .. } => {
                let event = &record.event;
                let d_prev = match prev_edge {
                    Some(edge) => event.frame.to_local(&-edge.d),
                    None => event.wi,
                };
                let d_next = event.frame.to_local(&next_edge.d);
                *forward = next.cosine_factor(&next_edge.d) / next_edge.r_sq
                    * prim.bsdf.pdf(&event.make_warped_query(d_prev, d_next));
                if let (Some(backward), Some(prev), Some(prev_edge)) = (backward, prev, prev_edge) {
                    *backward = prev.cosine_factor(&prev_edge.d) / prev_edge.r_sq
                        * prim.bsdf.pdf(&event.make_warped_query(d_next, d_prev));
                }
            }
            PathVertex::Volume { medium, record, .. } => {
                let phase = medium.phase_function();
                let d_prev = match prev_edge {
                    Some(edge) => -edge.d,
                    None => record.event.wi,
                };
                *forward = next.cosine_factor(&next_edge.d) / next_edge.r_sq
                    * phase.pdf(&-d_prev, &next_edge.d);
                if let (Some(backward), Some(prev), Some(prev_edge)) = (backward, prev, prev_edge) {
                    *backward = prev.cosine_factor(&prev_edge.d) / prev_edge.r_sq
                        * phase.pdf(&-next_edge.d, &d_prev);
                }
            }
        }
    }

    /// Write back the sample-space coordinates that regenerate the root
    /// position at `target`'s location.
    pub fn invert_root_vertex(&self, sampler: &mut WritableSampler, target: &PathVertex) -> bool {
        match self {
            PathVertex::Emitter { emitter, .. } => {
                let ng = target.normal();
                emitter.invert_position(sampler, &target.pos(), &ng)
            }
            PathVertex::Camera { .. } => true,
            _ => false,
        }
    }

    /// Write back the coordinates regenerating the scatter at `current`
    /// into direction `edge.d`, including the medium distance decision of
    /// the following segment.
    pub fn invert_vertex(
        &self,
        sampler: &mut WritableSampler,
        prev_edge: Option<&PathEdge>,
        edge: &PathEdge,
        current: &PathVertex,
        next: &PathVertex,
    ) -> bool {
        let inverted = match self {
            PathVertex::Emitter { emitter, record, .. } => {
                let point = PositionSample {
                    p: current.pos(),
                    ng: current.normal(),
                    ..record.point
                };
                emitter.invert_direction(sampler, &point, &edge.d)
            }
            PathVertex::Camera { camera, .. } => camera.invert_direction(sampler, &edge.d),
            PathVertex::Surface { prim, .. } => {
                let record = match current.surface_record() {
                    Some(record) => record,
                    None => return false,
                };
                let wi = match prev_edge {
                    Some(prev) => record.event.frame.to_local(&-prev.d),
                    None => record.event.wi,
                };
                let wo = record.event.frame.to_local(&edge.d);
                let query = record.event.make_warped_query(wi, wo);
                prim.bsdf.invert(sampler, &query)
            }
            PathVertex::Volume { medium, record, .. } => {
                let wi = match prev_edge {
                    Some(prev) => prev.d,
                    None => record.event.wi,
                };
                medium.phase_function().invert(sampler, &wi, &edge.d)
            }
        };
        if !inverted {
            return false;
        }

        // regenerate the distance decision along the outgoing segment
        if let Some(medium) = current.select_medium(&edge.d) {
            let (exited, t) = match next {
                PathVertex::Volume { .. } => (false, edge.r),
                _ => (true, edge.r),
            };
            let first_scatter = match current {
                PathVertex::Volume { record, .. } => record.first_scatter,
                _ => true,
            };
            if !medium.invert_distance(sampler, 0, first_scatter, t, exited) {
                return false;
            }
        }
        true
    }
}
