//! Sample records exchanged between the integrators and the collaborator
//! layer (cameras, primitives, BSDFs, media).

use crate::core::geometry::{Normal3f, Point2f, Point3f, TangentFrame, Vector3f};
use crate::core::lumen::Float;
use crate::core::spectrum::Spectrum;
use crate::materials::BsdfLobes;
use crate::media::PhaseFunction;

/// A sampled position on a camera lens or an emitter.
#[derive(Debug, Default, Copy, Clone)]
pub struct PositionSample {
    pub p: Point3f,
    pub weight: Spectrum,
    pub pdf: Float,
    pub ng: Normal3f,
    pub uv: Point2f,
}

/// A sampled outgoing direction, conditioned on a position sample.
#[derive(Debug, Default, Copy, Clone)]
pub struct DirectionSample {
    pub d: Vector3f,
    pub weight: Spectrum,
    pub pdf: Float,
}

impl DirectionSample {
    pub fn from_direction(d: Vector3f) -> Self {
        DirectionSample {
            d,
            weight: Spectrum::new(1.0),
            pdf: 1.0,
        }
    }
}

/// Direct-illumination sample toward an emitter or the camera.
#[derive(Debug, Default, Copy, Clone)]
pub struct LightSample {
    pub d: Vector3f,
    pub dist: Float,
    pub pdf: Float,
}

/// Scatter event at a surface. Directions are expressed in the local shading
/// frame (+z along the shading normal).
#[derive(Debug, Default, Copy, Clone)]
pub struct SurfaceScatterEvent {
    pub frame: TangentFrame,
    pub wi: Vector3f,
    pub wo: Vector3f,
    pub weight: Spectrum,
    pub pdf: Float,
    pub requested_lobe: BsdfLobes,
    pub sampled_lobe: BsdfLobes,
}

impl SurfaceScatterEvent {
    /// Query with incident and outgoing directions swapped, used when
    /// evaluating reverse densities.
    pub fn make_flipped_query(&self) -> SurfaceScatterEvent {
        SurfaceScatterEvent {
            wi: self.wo,
            wo: self.wi,
            requested_lobe: BsdfLobes::all(),
            ..*self
        }
    }
    /// Query with replaced directions, keeping the frame.
    pub fn make_warped_query(&self, wi: Vector3f, wo: Vector3f) -> SurfaceScatterEvent {
        SurfaceScatterEvent {
            wi,
            wo,
            requested_lobe: BsdfLobes::all(),
            ..*self
        }
    }
    /// Straight-through query used to probe transparency lobes.
    pub fn make_forward_query(&self) -> SurfaceScatterEvent {
        SurfaceScatterEvent {
            wo: -self.wi,
            requested_lobe: BsdfLobes::FORWARD,
            ..*self
        }
    }
}

/// Distance sample along a ray through a medium.
#[derive(Debug, Default, Copy, Clone)]
pub struct MediumSample {
    pub phase: PhaseFunction,
    pub p: Point3f,
    pub t: Float,
    /// Distance the sampler would have continued to had the segment not been
    /// cut short by a surface; photon-plane construction needs it.
    pub continued_t: Float,
    pub weight: Spectrum,
    pub pdf: Float,
    pub exited: bool,
}

/// Scatter event inside a medium.
#[derive(Debug, Default, Copy, Clone)]
pub struct PhaseSample {
    pub w: Vector3f,
    pub weight: Spectrum,
    pub pdf: Float,
}

/// Volume scatter record kept on bidirectional path vertices.
#[derive(Debug, Default, Copy, Clone)]
pub struct VolumeScatterEvent {
    pub p: Point3f,
    pub wi: Vector3f,
    pub wo: Vector3f,
    pub weight: Spectrum,
    pub pdf: Float,
}
