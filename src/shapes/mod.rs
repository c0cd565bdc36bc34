//! Primitive collaborators: intersectable shapes, some of which emit.
//!
//! The integrator core consumes the sampling/evaluation contract of this
//! enum and never inspects concrete shapes.

pub mod instance;
pub mod quad;
pub mod sphere;

// std
use std::sync::Arc;
// lumen
use crate::core::geometry::{
    vec3_dot_nrmf, Bounds3f, Normal3f, Point2f, Point3f, Ray, TangentFrame, Vector3f,
};
use crate::core::lumen::{Float, PI};
use crate::core::records::{DirectionSample, LightSample, PositionSample};
use crate::core::sampling::{
    invert_uniform_sphere, uniform_sample_sphere, uniform_sphere_pdf,
};
use crate::core::spectrum::Spectrum;
use crate::materials::Bsdf;
use crate::media::Medium;
use crate::samplers::{PathSampleGenerator, WritableSampler};

pub use instance::{load_instances, InstanceSet, InstanceTransform};
pub use quad::Quad;
pub use sphere::Sphere;

#[derive(Debug, Default, Copy, Clone)]
pub struct IntersectionInfo {
    pub p: Point3f,
    pub ng: Normal3f,
    pub ns: Normal3f,
    pub uv: Point2f,
    pub epsilon: Float,
    /// Index of the primitive in the scene; filled in by the scene wrapper.
    pub prim: u32,
}

#[derive(Debug)]
pub enum Shape {
    Quad(Quad),
    Sphere(Sphere),
    /// Dirac emitter; never intersectable.
    Point { pos: Point3f },
    /// Environment emitter at infinity; consulted when rays leave the scene.
    InfiniteSphere { scene_radius: Float },
    Instances(InstanceSet),
}

#[derive(Debug)]
pub struct Primitive {
    pub shape: Shape,
    pub bsdf: Arc<Bsdf>,
    pub emission: Option<Spectrum>,
    /// Medium on the side the normal points away from.
    pub int_medium: Option<Arc<Medium>>,
    pub ext_medium: Option<Arc<Medium>>,
}

impl Primitive {
    pub fn new(shape: Shape, bsdf: Arc<Bsdf>) -> Self {
        Primitive {
            shape,
            bsdf,
            emission: None,
            int_medium: None,
            ext_medium: None,
        }
    }

    pub fn with_emission(mut self, emission: Spectrum) -> Self {
        self.emission = Some(emission);
        self
    }

    pub fn is_emissive(&self) -> bool {
        self.emission.is_some()
    }

    /// Dirac emitters cannot be hit by BSDF samples.
    pub fn is_dirac(&self) -> bool {
        matches!(self.shape, Shape::Point { .. })
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self.shape, Shape::InfiniteSphere { .. })
    }

    pub fn is_samplable(&self) -> bool {
        !matches!(self.shape, Shape::Instances(_))
    }

    pub fn intersect(&self, ray: &mut Ray) -> Option<IntersectionInfo> {
        match &self.shape {
            Shape::Quad(quad) => quad.intersect(ray),
            Shape::Sphere(sphere) => sphere.intersect(ray),
            Shape::Point { .. } => None,
            Shape::InfiniteSphere { .. } => None,
            Shape::Instances(set) => set.intersect(ray),
        }
    }

    /// Infinite primitives only respond to this variant, with a synthetic
    /// hit at the far interval end.
    pub fn intersect_infinite(&self, ray: &Ray) -> Option<IntersectionInfo> {
        match &self.shape {
            Shape::InfiniteSphere { scene_radius } => Some(IntersectionInfo {
                p: ray.o + ray.d * (2.0 * scene_radius),
                ng: Normal3f::from(-ray.d),
                ns: Normal3f::from(-ray.d),
                uv: Point2f::default(),
                epsilon: 0.0,
                prim: u32::MAX,
            }),
            _ => None,
        }
    }

    pub fn occluded(&self, ray: &Ray) -> bool {
        let mut probe = *ray;
        self.intersect(&mut probe).is_some()
    }

    pub fn bounds(&self) -> Bounds3f {
        match &self.shape {
            Shape::Quad(quad) => {
                let mut b = Bounds3f::from_point(quad.base);
                b.grow_pnt(&(quad.base + quad.edge0));
                b.grow_pnt(&(quad.base + quad.edge1));
                b.grow_pnt(&(quad.base + quad.edge0 + quad.edge1));
                b
            }
            Shape::Sphere(sphere) => {
                let r = Vector3f::new(sphere.radius, sphere.radius, sphere.radius);
                Bounds3f {
                    p_min: sphere.center - r,
                    p_max: sphere.center + r,
                }
            }
            Shape::Point { pos } => Bounds3f::from_point(*pos),
            Shape::InfiniteSphere { .. } => Bounds3f::default(),
            Shape::Instances(set) => set.bounds,
        }
    }

    /// Radiance leaving the hit point along `-ray_dir`.
    pub fn eval_direct(&self, info: &IntersectionInfo, ray_dir: &Vector3f) -> Spectrum {
        let emission = match self.emission {
            Some(e) => e,
            None => return Spectrum::default(),
        };
        match &self.shape {
            Shape::InfiniteSphere { .. } => emission,
            _ => {
                if vec3_dot_nrmf(ray_dir, &info.ng) < 0.0 {
                    emission
                } else {
                    Spectrum::default()
                }
            }
        }
    }

    /// Radiance emitted from a sampled position into direction `d`.
    pub fn eval_directional_emission(&self, point: &PositionSample, d: &Vector3f) -> Spectrum {
        let emission = match self.emission {
            Some(e) => e,
            None => return Spectrum::default(),
        };
        match &self.shape {
            Shape::Quad(_) | Shape::Sphere(_) => {
                if vec3_dot_nrmf(d, &point.ng) > 0.0 {
                    emission
                } else {
                    Spectrum::default()
                }
            }
            // intensity per solid angle for the Dirac emitter
            Shape::Point { .. } => emission * (1.0 / (4.0 * PI)),
            Shape::InfiniteSphere { .. } => emission,
            Shape::Instances(_) => Spectrum::default(),
        }
    }

    pub fn sample_position(
        &self,
        sampler: &mut PathSampleGenerator,
        point: &mut PositionSample,
    ) -> bool {
        match &self.shape {
            Shape::Quad(quad) => quad.sample_position(sampler, point),
            Shape::Sphere(sphere) => sphere.sample_position(sampler, point),
            Shape::Point { pos } => {
                point.p = *pos;
                point.pdf = 1.0;
                point.weight = Spectrum::new(1.0);
                point.ng = Normal3f::default();
                true
            }
            Shape::InfiniteSphere { scene_radius } => {
                // Direction first, then a disk offset perpendicular to it;
                // the later direction sample consumes nothing.
                let (u1, u2) = sampler.next_2d();
                let d = uniform_sample_sphere(u1, u2);
                let (u3, u4) = sampler.next_2d();
                let frame = TangentFrame::from_normal(d);
                let r = 2.0 * scene_radius;
                let disk_r = u3.sqrt() * r;
                let phi = 2.0 * PI * u4;
                let offset =
                    frame.tangent * (disk_r * phi.cos()) + frame.bitangent * (disk_r * phi.sin());
                point.p = Point3f::default() - d * r + offset;
                point.ng = Normal3f::from(d);
                // solid angle measure; connections against this vertex skip
                // the 1/r^2 conversion
                point.pdf = uniform_sphere_pdf();
                point.weight = Spectrum::new(1.0 / point.pdf);
                true
            }
            Shape::Instances(_) => false,
        }
    }

    pub fn sample_direction(
        &self,
        sampler: &mut PathSampleGenerator,
        point: &PositionSample,
        direction: &mut DirectionSample,
    ) -> bool {
        let emission = self.emission.unwrap_or_default();
        match &self.shape {
            Shape::Quad(quad) => quad.sample_direction(sampler, point, &emission, direction),
            Shape::Sphere(sphere) => sphere.sample_direction(sampler, point, &emission, direction),
            Shape::Point { .. } => {
                let (u1, u2) = sampler.next_2d();
                direction.d = uniform_sample_sphere(u1, u2);
                direction.pdf = uniform_sphere_pdf();
                // intensity over the sampling density
                direction.weight = emission * (1.0 / (4.0 * PI)) / direction.pdf;
                true
            }
            Shape::InfiniteSphere { scene_radius } => {
                let r = 2.0 * scene_radius;
                direction.d = point.ng.to_vec();
                direction.pdf = 1.0 / (PI * r * r);
                direction.weight = emission / direction.pdf;
                true
            }
            Shape::Instances(_) => false,
        }
    }

    pub fn positional_pdf(&self, _point: &PositionSample) -> Float {
        match &self.shape {
            Shape::Quad(quad) => quad.positional_pdf(),
            Shape::Sphere(sphere) => sphere.positional_pdf(),
            Shape::Point { .. } => 1.0,
            Shape::InfiniteSphere { .. } => uniform_sphere_pdf(),
            Shape::Instances(_) => 0.0,
        }
    }

    pub fn directional_pdf(&self, point: &PositionSample, d: &Vector3f) -> Float {
        match &self.shape {
            Shape::Quad(quad) => quad.directional_pdf(point, d),
            Shape::Sphere(sphere) => sphere.directional_pdf(point, d),
            Shape::Point { .. } => uniform_sphere_pdf(),
            Shape::InfiniteSphere { scene_radius } => {
                let r = 2.0 * scene_radius;
                1.0 / (PI * r * r)
            }
            Shape::Instances(_) => 0.0,
        }
    }

    /// Next-event-estimation sample from `reference` toward this emitter.
    pub fn sample_direct(
        &self,
        sampler: &mut PathSampleGenerator,
        reference: &Point3f,
        sample: &mut LightSample,
    ) -> bool {
        match &self.shape {
            Shape::Quad(quad) => quad.sample_direct(sampler, reference, sample),
            Shape::Sphere(sphere) => sphere.sample_direct(sampler, reference, sample),
            Shape::Point { pos } => {
                let to_light = *pos - *reference;
                let dist = to_light.length();
                if dist <= 0.0 {
                    return false;
                }
                sample.d = to_light / dist;
                sample.dist = dist;
                sample.pdf = 1.0;
                true
            }
            Shape::InfiniteSphere { .. } => {
                let (u1, u2) = sampler.next_2d();
                sample.d = uniform_sample_sphere(u1, u2);
                sample.dist = Float::INFINITY;
                sample.pdf = uniform_sphere_pdf();
                true
            }
            Shape::Instances(_) => false,
        }
    }

    /// Radiance arriving from a direct sample; for the Dirac emitter this is
    /// intensity over squared distance.
    pub fn direct_radiance(&self, sample: &LightSample) -> Spectrum {
        let emission = match self.emission {
            Some(e) => e,
            None => return Spectrum::default(),
        };
        match &self.shape {
            Shape::Point { .. } => emission * (1.0 / (4.0 * PI)) / (sample.dist * sample.dist),
            _ => emission,
        }
    }

    /// Solid-angle density of `sample_direct` producing the given hit.
    pub fn direct_pdf(&self, info: &IntersectionInfo, reference: &Point3f) -> Float {
        match &self.shape {
            Shape::Quad(quad) => quad.direct_pdf(info, reference),
            Shape::Sphere(sphere) => sphere.direct_pdf(info, reference),
            Shape::Point { .. } => 0.0,
            Shape::InfiniteSphere { .. } => uniform_sphere_pdf(),
            Shape::Instances(_) => 0.0,
        }
    }

    pub fn invert_position(&self, sampler: &mut WritableSampler, p: &Point3f, ng: &Normal3f) -> bool {
        match &self.shape {
            Shape::Quad(quad) => quad.invert_position(sampler, p),
            Shape::Sphere(sphere) => sphere.invert_position(sampler, p),
            Shape::Point { .. } => true,
            Shape::InfiniteSphere { .. } => {
                let (u1, u2) = invert_uniform_sphere(&ng.to_vec());
                sampler.put_2d(u1, u2);
                true
            }
            Shape::Instances(_) => false,
        }
    }

    pub fn invert_direction(
        &self,
        sampler: &mut WritableSampler,
        point: &PositionSample,
        d: &Vector3f,
    ) -> bool {
        match &self.shape {
            Shape::Quad(quad) => quad.invert_direction(sampler, point, d),
            Shape::Sphere(sphere) => sphere.invert_direction(sampler, point, d),
            Shape::Point { .. } => {
                let (u1, u2) = invert_uniform_sphere(d);
                sampler.put_2d(u1, u2);
                true
            }
            // the disk offset is not recoverable from the path alone
            Shape::InfiniteSphere { .. } => false,
            Shape::Instances(_) => false,
        }
    }

    /// Rough emitted power, used to pick emitters proportionally.
    pub fn approximate_radiance(&self) -> Float {
        let emission = match self.emission {
            Some(e) => e,
            None => return 0.0,
        };
        match &self.shape {
            Shape::Quad(quad) => emission.luminance() * quad.area() * PI,
            Shape::Sphere(sphere) => emission.luminance() * sphere.area() * PI,
            Shape::Point { .. } => emission.luminance(),
            Shape::InfiniteSphere { scene_radius } => {
                let r = 2.0 * scene_radius;
                emission.luminance() * PI * r * r
            }
            Shape::Instances(_) => 0.0,
        }
    }

    /// Medium on the side of the surface that `d` points into.
    pub fn select_medium(
        &self,
        info: &IntersectionInfo,
        d: &Vector3f,
    ) -> Option<Arc<Medium>> {
        if vec3_dot_nrmf(d, &info.ng) < 0.0 {
            self.int_medium.clone()
        } else {
            self.ext_medium.clone()
        }
    }

    pub fn ext_medium(&self) -> Option<Arc<Medium>> {
        self.ext_medium.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_emitter_is_one_sided() {
        let quad = Quad::new(
            Point3f::new(-1.0, -1.0, 0.0),
            Vector3f::new(2.0, 0.0, 0.0),
            Vector3f::new(0.0, 2.0, 0.0),
        );
        let prim = Primitive::new(Shape::Quad(quad), Arc::new(Bsdf::Lambert {
            albedo: Spectrum::default(),
        }))
        .with_emission(Spectrum::new(2.0));

        let mut front = Ray::new(Point3f::new(0.0, 0.0, 2.0), Vector3f::new(0.0, 0.0, -1.0));
        let info = prim.intersect(&mut front).unwrap();
        // quad normal points +z; a ray flying toward -z sees the emissive side
        assert_eq!(prim.eval_direct(&info, &front.d), Spectrum::new(2.0));

        let mut back = Ray::new(Point3f::new(0.0, 0.0, -2.0), Vector3f::new(0.0, 0.0, 1.0));
        let info = prim.intersect(&mut back).unwrap();
        assert_eq!(prim.eval_direct(&info, &back.d), Spectrum::default());
    }

    #[test]
    fn point_light_direct_sample_is_dirac() {
        let prim = Primitive::new(
            Shape::Point {
                pos: Point3f::new(0.0, 3.0, 0.0),
            },
            Arc::new(Bsdf::Lambert {
                albedo: Spectrum::default(),
            }),
        )
        .with_emission(Spectrum::new(4.0 * PI));

        let mut sampler = PathSampleGenerator::uniform(1);
        let mut sample = LightSample::default();
        assert!(prim.sample_direct(&mut sampler, &Point3f::default(), &mut sample));
        assert_eq!(sample.pdf, 1.0);
        assert!((sample.dist - 3.0).abs() < 1e-5);
        // intensity 1 at distance 3
        let radiance = prim.direct_radiance(&sample);
        assert!((radiance.r - 1.0 / 9.0).abs() < 1e-5);
    }
}
