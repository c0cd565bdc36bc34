//! BSDF collaborators. The integrator core only relies on the sampling and
//! evaluation contract exposed here; `eval` returns the BSDF value times the
//! outgoing cosine, and Dirac lobes evaluate to zero with zero pdf.

// std
use std::ops::{BitAnd, BitOr};
// others
use serde::{Deserialize, Serialize};
// lumen
use crate::core::lumen::{Float, INV_PI};
use crate::core::records::SurfaceScatterEvent;
use crate::core::sampling::{
    cosine_hemisphere_pdf, cosine_sample_hemisphere, invert_cosine_hemisphere,
};
use crate::core::spectrum::Spectrum;
use crate::core::geometry::Vector3f;
use crate::samplers::{PathSampleGenerator, WritableSampler};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct BsdfLobes(u32);

impl BsdfLobes {
    pub const GLOSSY: BsdfLobes = BsdfLobes(1);
    pub const DIFFUSE: BsdfLobes = BsdfLobes(2);
    pub const SPECULAR: BsdfLobes = BsdfLobes(4);
    pub const TRANSMISSIVE: BsdfLobes = BsdfLobes(8);
    pub const FORWARD: BsdfLobes = BsdfLobes(16);

    pub fn all() -> BsdfLobes {
        BsdfLobes(1 | 2 | 4 | 8)
    }
    pub fn empty() -> BsdfLobes {
        BsdfLobes(0)
    }
    pub fn contains(&self, other: BsdfLobes) -> bool {
        (self.0 & other.0) == other.0
    }
    pub fn intersects(&self, other: BsdfLobes) -> bool {
        (self.0 & other.0) != 0
    }
    pub fn is_pure_specular(&self) -> bool {
        self.intersects(BsdfLobes::SPECULAR) && !self.intersects(BsdfLobes::DIFFUSE | BsdfLobes::GLOSSY)
    }
    pub fn is_forward(&self) -> bool {
        self.intersects(BsdfLobes::FORWARD)
    }
}

impl BitOr for BsdfLobes {
    type Output = BsdfLobes;
    fn bitor(self, rhs: BsdfLobes) -> BsdfLobes {
        BsdfLobes(self.0 | rhs.0)
    }
}

impl BitAnd for BsdfLobes {
    type Output = BsdfLobes;
    fn bitand(self, rhs: BsdfLobes) -> BsdfLobes {
        BsdfLobes(self.0 & rhs.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Bsdf {
    Lambert { albedo: Spectrum },
    Mirror { albedo: Spectrum },
    Dielectric { ior: Float, albedo: Spectrum },
    Transparency { color: Spectrum },
}

fn fresnel_dielectric(eta: Float, cos_i: Float) -> Float {
    let cos_i = cos_i.abs();
    let sin_t_sq = eta * eta * (1.0 - cos_i * cos_i);
    if sin_t_sq >= 1.0 {
        return 1.0;
    }
    let cos_t = (1.0 - sin_t_sq).sqrt();
    let rs = (eta * cos_i - cos_t) / (eta * cos_i + cos_t);
    let rp = (eta * cos_t - cos_i) / (eta * cos_t + cos_i);
    (rs * rs + rp * rp) * 0.5
}

impl Bsdf {
    pub fn lobes(&self) -> BsdfLobes {
        match self {
            Bsdf::Lambert { .. } => BsdfLobes::DIFFUSE,
            Bsdf::Mirror { .. } => BsdfLobes::SPECULAR,
            Bsdf::Dielectric { .. } => BsdfLobes::SPECULAR | BsdfLobes::TRANSMISSIVE,
            Bsdf::Transparency { .. } => BsdfLobes::FORWARD,
        }
    }

    pub fn is_dirac(&self) -> bool {
        self.lobes().is_pure_specular() || self.lobes().is_forward()
    }

    /// Reflectance estimate for auxiliary outputs.
    pub fn albedo(&self) -> Spectrum {
        match self {
            Bsdf::Lambert { albedo }
            | Bsdf::Mirror { albedo }
            | Bsdf::Dielectric { albedo, .. } => *albedo,
            Bsdf::Transparency { color } => *color,
        }
    }

    /// Sample an outgoing direction for `event.wi`. Returns false when the
    /// requested lobes cannot produce a direction.
    pub fn sample(
        &self,
        event: &mut SurfaceScatterEvent,
        sampler: &mut PathSampleGenerator,
        adjoint: bool,
    ) -> bool {
        match self {
            Bsdf::Lambert { albedo } => {
                if !event.requested_lobe.intersects(BsdfLobes::DIFFUSE) {
                    return false;
                }
                let (u1, u2) = sampler.next_2d();
                let mut wo = cosine_sample_hemisphere(u1, u2);
                if event.wi.z < 0.0 {
                    wo.z = -wo.z;
                }
                event.wo = wo;
                event.pdf = cosine_hemisphere_pdf(wo.z.abs());
                event.weight = *albedo;
                event.sampled_lobe = BsdfLobes::DIFFUSE;
                let _ = adjoint;
                true
            }
            Bsdf::Mirror { albedo } => {
                if !event.requested_lobe.intersects(BsdfLobes::SPECULAR) {
                    return false;
                }
                event.wo = Vector3f::new(-event.wi.x, -event.wi.y, event.wi.z);
                event.pdf = 1.0;
                event.weight = *albedo;
                event.sampled_lobe = BsdfLobes::SPECULAR;
                true
            }
            Bsdf::Dielectric { ior, albedo } => {
                if !event.requested_lobe.intersects(BsdfLobes::SPECULAR) {
                    return false;
                }
                let entering = event.wi.z > 0.0;
                let eta = if entering { 1.0 / *ior } else { *ior };
                let f = fresnel_dielectric(eta, event.wi.z);
                if sampler.next_boolean(f) {
                    event.wo = Vector3f::new(-event.wi.x, -event.wi.y, event.wi.z);
                    event.pdf = f;
                    event.weight = *albedo;
                } else {
                    let sin_t_sq = eta * eta * (1.0 - event.wi.z * event.wi.z);
                    let cos_t = (1.0 - sin_t_sq).max(0.0).sqrt();
                    let z = if entering { -cos_t } else { cos_t };
                    event.wo = Vector3f::new(-event.wi.x * eta, -event.wi.y * eta, z);
                    event.pdf = 1.0 - f;
                    event.weight = if adjoint {
                        *albedo
                    } else {
                        *albedo * (eta * eta)
                    };
                }
                event.sampled_lobe = BsdfLobes::SPECULAR | BsdfLobes::TRANSMISSIVE;
                true
            }
            Bsdf::Transparency { color } => {
                event.wo = -event.wi;
                event.pdf = 1.0;
                event.weight = *color;
                event.sampled_lobe = BsdfLobes::FORWARD;
                true
            }
        }
    }

    pub fn eval(&self, event: &SurfaceScatterEvent, adjoint: bool) -> Spectrum {
        let _ = adjoint;
        match self {
            Bsdf::Lambert { albedo } => {
                if event.requested_lobe.is_forward() {
                    return Spectrum::default();
                }
                if event.wi.z * event.wo.z <= 0.0 {
                    return Spectrum::default();
                }
                *albedo * INV_PI * event.wo.z.abs()
            }
            Bsdf::Mirror { .. } | Bsdf::Dielectric { .. } => Spectrum::default(),
            Bsdf::Transparency { color } => {
                if event.requested_lobe.is_forward() {
                    *color
                } else {
                    Spectrum::default()
                }
            }
        }
    }

    pub fn pdf(&self, event: &SurfaceScatterEvent) -> Float {
        match self {
            Bsdf::Lambert { .. } => {
                if event.wi.z * event.wo.z <= 0.0 {
                    0.0
                } else {
                    cosine_hemisphere_pdf(event.wo.z.abs())
                }
            }
            Bsdf::Mirror { .. } | Bsdf::Dielectric { .. } | Bsdf::Transparency { .. } => 0.0,
        }
    }

    /// Write back into `sampler` the uniform numbers that would regenerate
    /// `event.wo` from `event.wi`. Dirac lobes cannot be inverted.
    pub fn invert(&self, sampler: &mut WritableSampler, event: &SurfaceScatterEvent) -> bool {
        match self {
            Bsdf::Lambert { .. } => {
                let mut wo = event.wo;
                if event.wi.z < 0.0 {
                    wo.z = -wo.z;
                }
                match invert_cosine_hemisphere(&wo) {
                    Some((u1, u2)) => {
                        sampler.put_2d(u1, u2);
                        true
                    }
                    None => false,
                }
            }
            Bsdf::Mirror { .. } | Bsdf::Dielectric { .. } | Bsdf::Transparency { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samplers::PathSampleGenerator;

    #[test]
    fn lambert_sample_matches_pdf_and_eval() {
        let bsdf = Bsdf::Lambert {
            albedo: Spectrum::new(0.8),
        };
        let mut sampler = PathSampleGenerator::uniform(3);
        let mut event = SurfaceScatterEvent {
            wi: Vector3f::new(0.2, -0.1, 0.9).normalize(),
            requested_lobe: BsdfLobes::all(),
            ..Default::default()
        };
        for _ in 0..50 {
            assert!(bsdf.sample(&mut event, &mut sampler, false));
            assert!(event.wo.z > 0.0);
            let pdf = bsdf.pdf(&event);
            assert!((pdf - event.pdf).abs() < 1e-6);
            // weight == eval/pdf for the cosine lobe
            let eval = bsdf.eval(&event, false);
            assert!((eval.r / pdf - event.weight.r).abs() < 1e-4);
        }
    }

    #[test]
    fn dielectric_is_dirac() {
        let bsdf = Bsdf::Dielectric {
            ior: 1.5,
            albedo: Spectrum::new(1.0),
        };
        assert!(bsdf.is_dirac());
        let event = SurfaceScatterEvent {
            wi: Vector3f::new(0.0, 0.0, 1.0),
            wo: Vector3f::new(0.0, 0.0, -1.0),
            requested_lobe: BsdfLobes::all(),
            ..Default::default()
        };
        assert_eq!(bsdf.pdf(&event), 0.0);
    }
}
