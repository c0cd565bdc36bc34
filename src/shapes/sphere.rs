//! Sphere primitive, usable as an area emitter.

// lumen
use crate::core::geometry::{
    vec3_dot_nrmf, vec3_dot_vec3f, Normal3f, Point2f, Point3f, Ray, TangentFrame, Vector3f,
};
use crate::core::lumen::{Float, INV_PI, PI};
use crate::core::records::{DirectionSample, LightSample, PositionSample};
use crate::core::sampling::{
    cosine_sample_hemisphere, invert_cosine_hemisphere, invert_uniform_sphere,
    uniform_sample_sphere,
};
use crate::core::spectrum::Spectrum;
use crate::samplers::{PathSampleGenerator, WritableSampler};
use crate::shapes::IntersectionInfo;

#[derive(Debug, Clone)]
pub struct Sphere {
    pub center: Point3f,
    pub radius: Float,
}

impl Sphere {
    pub fn new(center: Point3f, radius: Float) -> Self {
        Sphere { center, radius }
    }

    pub fn area(&self) -> Float {
        4.0 * PI * self.radius * self.radius
    }

    pub fn intersect(&self, ray: &mut Ray) -> Option<IntersectionInfo> {
        let oc = ray.o - self.center;
        let b = vec3_dot_vec3f(&oc, &ray.d);
        let c = oc.length_squared() - self.radius * self.radius;
        let disc = b * b - c;
        if disc < 0.0 {
            return None;
        }
        let sqrt_disc = disc.sqrt();
        let mut t = -b - sqrt_disc;
        if t <= ray.t_min || t >= ray.t_max {
            t = -b + sqrt_disc;
            if t <= ray.t_min || t >= ray.t_max {
                return None;
            }
        }
        ray.t_max = t;
        let p = ray.position(t);
        let n = Normal3f::from((p - self.center) / self.radius);
        let uv = {
            let local = (p - self.center) / self.radius;
            let phi = local.y.atan2(local.x);
            let theta = local.z.acos();
            Point2f::new((phi * INV_PI * 0.5 + 0.5).fract(), theta * INV_PI)
        };
        Some(IntersectionInfo {
            p,
            ng: n,
            ns: n,
            uv,
            epsilon: 1e-4 * self.radius.max(1.0),
            prim: u32::MAX,
        })
    }

    pub fn sample_position(
        &self,
        sampler: &mut PathSampleGenerator,
        point: &mut PositionSample,
    ) -> bool {
        let (u1, u2) = sampler.next_2d();
        let n = uniform_sample_sphere(u1, u2);
        point.p = self.center + n * self.radius;
        point.ng = Normal3f::from(n);
        point.pdf = 1.0 / self.area();
        point.weight = Spectrum::new(self.area());
        point.uv = Point2f::new(u1, u2);
        true
    }

    pub fn sample_direction(
        &self,
        sampler: &mut PathSampleGenerator,
        point: &PositionSample,
        emission: &Spectrum,
        direction: &mut DirectionSample,
    ) -> bool {
        let (u1, u2) = sampler.next_2d();
        let local = cosine_sample_hemisphere(u1, u2);
        let frame = TangentFrame::from_normal(point.ng.to_vec());
        direction.d = frame.to_global(&local);
        direction.pdf = local.z * INV_PI;
        direction.weight = *emission * PI;
        direction.pdf > 0.0
    }

    pub fn directional_pdf(&self, point: &PositionSample, d: &Vector3f) -> Float {
        vec3_dot_nrmf(d, &point.ng).max(0.0) * INV_PI
    }

    pub fn positional_pdf(&self) -> Float {
        1.0 / self.area()
    }

    pub fn sample_direct(
        &self,
        sampler: &mut PathSampleGenerator,
        reference: &Point3f,
        sample: &mut LightSample,
    ) -> bool {
        // Uniform area sampling of the visible-side conversion keeps the pdf
        // simple; cone sampling is not worth it for the scene sizes at hand.
        let (u1, u2) = sampler.next_2d();
        let n = uniform_sample_sphere(u1, u2);
        let p = self.center + n * self.radius;
        let to_light = p - *reference;
        let dist_sq = to_light.length_squared();
        let dist = dist_sq.sqrt();
        let d = to_light / dist;
        let cos_light = -vec3_dot_vec3f(&d, &n);
        if cos_light <= 0.0 {
            return false;
        }
        sample.d = d;
        sample.dist = dist;
        sample.pdf = dist_sq / (cos_light * self.area());
        true
    }

    pub fn direct_pdf(&self, info: &IntersectionInfo, reference: &Point3f) -> Float {
        let to_light = info.p - *reference;
        let dist_sq = to_light.length_squared();
        let d = to_light / dist_sq.sqrt();
        let cos_light = -vec3_dot_nrmf(&d, &info.ng);
        if cos_light <= 0.0 {
            return 0.0;
        }
        dist_sq / (cos_light * self.area())
    }

    pub fn invert_position(&self, sampler: &mut WritableSampler, p: &Point3f) -> bool {
        let n = (*p - self.center) / self.radius;
        let (u1, u2) = invert_uniform_sphere(&n);
        sampler.put_2d(u1, u2);
        true
    }

    pub fn invert_direction(
        &self,
        sampler: &mut WritableSampler,
        point: &PositionSample,
        d: &Vector3f,
    ) -> bool {
        let frame = TangentFrame::from_normal(point.ng.to_vec());
        let local = frame.to_local(d);
        match invert_cosine_hemisphere(&local) {
            Some((u1, u2)) => {
                sampler.put_2d(u1, u2);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_prefers_near_root() {
        let sphere = Sphere::new(Point3f::new(0.0, 0.0, 5.0), 1.0);
        let mut ray = Ray::new(Point3f::default(), Vector3f::new(0.0, 0.0, 1.0));
        let info = sphere.intersect(&mut ray).unwrap();
        assert!((ray.t_max - 4.0).abs() < 1e-4);
        assert!((vec3_dot_nrmf(&ray.d, &info.ng) + 1.0).abs() < 1e-4);
    }

    #[test]
    fn inside_ray_hits_far_wall() {
        let sphere = Sphere::new(Point3f::default(), 2.0);
        let mut ray = Ray::new(Point3f::default(), Vector3f::new(1.0, 0.0, 0.0));
        sphere.intersect(&mut ray).unwrap();
        assert!((ray.t_max - 2.0).abs() < 1e-4);
    }
}
