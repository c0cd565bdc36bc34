//! One-sided quad, the workhorse emitter and wall primitive.

// lumen
use crate::core::geometry::{
    vec3_cross_vec3f, vec3_dot_nrmf, vec3_dot_vec3f, Normal3f, Point2f, Point3f, Ray, TangentFrame,
    Vector3f,
};
use crate::core::lumen::{Float, INV_PI, PI};
use crate::core::records::{DirectionSample, LightSample, PositionSample};
use crate::core::sampling::{cosine_sample_hemisphere, invert_cosine_hemisphere};
use crate::core::spectrum::Spectrum;
use crate::samplers::{PathSampleGenerator, WritableSampler};
use crate::shapes::IntersectionInfo;

#[derive(Debug, Clone)]
pub struct Quad {
    pub base: Point3f,
    pub edge0: Vector3f,
    pub edge1: Vector3f,
    ng: Normal3f,
    area: Float,
    inv_area: Float,
}

impl Quad {
    pub fn new(base: Point3f, edge0: Vector3f, edge1: Vector3f) -> Self {
        let n = vec3_cross_vec3f(&edge0, &edge1);
        let area = n.length();
        Quad {
            base,
            edge0,
            edge1,
            ng: Normal3f::from(n / area),
            area,
            inv_area: 1.0 / area,
        }
    }

    pub fn normal(&self) -> Normal3f {
        self.ng
    }

    pub fn area(&self) -> Float {
        self.area
    }

    pub fn intersect(&self, ray: &mut Ray) -> Option<IntersectionInfo> {
        let n = self.ng.to_vec();
        let denom = vec3_dot_vec3f(&ray.d, &n);
        if denom.abs() < 1e-9 {
            return None;
        }
        let t = vec3_dot_vec3f(&(self.base - ray.o), &n) / denom;
        if t <= ray.t_min || t >= ray.t_max {
            return None;
        }
        let p = ray.position(t);
        let rel = p - self.base;
        let e0_sq = self.edge0.length_squared();
        let e1_sq = self.edge1.length_squared();
        let u = vec3_dot_vec3f(&rel, &self.edge0) / e0_sq;
        let v = vec3_dot_vec3f(&rel, &self.edge1) / e1_sq;
        if !(0.0..=1.0).contains(&u) || !(0.0..=1.0).contains(&v) {
            return None;
        }
        ray.t_max = t;
        Some(IntersectionInfo {
            p,
            ng: self.ng,
            ns: self.ng,
            uv: Point2f::new(u, v),
            epsilon: 1e-4,
            prim: u32::MAX,
        })
    }

    pub fn sample_position(
        &self,
        sampler: &mut PathSampleGenerator,
        point: &mut PositionSample,
    ) -> bool {
        let (u, v) = sampler.next_2d();
        point.p = self.base + self.edge0 * u + self.edge1 * v;
        point.pdf = self.inv_area;
        point.weight = Spectrum::new(self.area);
        point.ng = self.ng;
        point.uv = Point2f::new(u, v);
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
        self.inv_area
    }

    pub fn sample_direct(
        &self,
        sampler: &mut PathSampleGenerator,
        reference: &Point3f,
        sample: &mut LightSample,
    ) -> bool {
        let (u, v) = sampler.next_2d();
        let p = self.base + self.edge0 * u + self.edge1 * v;
        let to_light = p - reference;
        let dist_sq = to_light.length_squared();
        let dist = dist_sq.sqrt();
        let d = to_light / dist;
        let cos_light = -vec3_dot_nrmf(&d, &self.ng);
        if cos_light <= 0.0 {
            return false;
        }
        sample.d = d;
        sample.dist = dist;
        sample.pdf = dist_sq * self.inv_area / cos_light;
        true
    }

    /// Solid-angle density that `sample_direct` would have produced this hit.
    pub fn direct_pdf(&self, info: &IntersectionInfo, reference: &Point3f) -> Float {
        let to_light = info.p - reference;
        let dist_sq = to_light.length_squared();
        let d = to_light / dist_sq.sqrt();
        let cos_light = -vec3_dot_nrmf(&d, &self.ng);
        if cos_light <= 0.0 {
            return 0.0;
        }
        dist_sq * self.inv_area / cos_light
    }

    pub fn invert_position(&self, sampler: &mut WritableSampler, p: &Point3f) -> bool {
        let rel = *p - self.base;
        let u = vec3_dot_vec3f(&rel, &self.edge0) / self.edge0.length_squared();
        let v = vec3_dot_vec3f(&rel, &self.edge1) / self.edge1.length_squared();
        if !(0.0..=1.0).contains(&u) || !(0.0..=1.0).contains(&v) {
            return false;
        }
        sampler.put_2d(u.min(1.0 - 1e-6), v.min(1.0 - 1e-6));
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

    fn unit_quad() -> Quad {
        Quad::new(
            Point3f::new(-0.5, -0.5, 0.0),
            Vector3f::new(1.0, 0.0, 0.0),
            Vector3f::new(0.0, 1.0, 0.0),
        )
    }

    #[test]
    fn intersects_center_and_clips_outside() {
        let quad = unit_quad();
        let mut ray = Ray::new(Point3f::new(0.0, 0.0, -2.0), Vector3f::new(0.0, 0.0, 1.0));
        let info = quad.intersect(&mut ray).unwrap();
        assert!((ray.t_max - 2.0).abs() < 1e-5);
        assert!((info.p.z).abs() < 1e-5);

        let mut miss = Ray::new(Point3f::new(2.0, 0.0, -2.0), Vector3f::new(0.0, 0.0, 1.0));
        assert!(quad.intersect(&mut miss).is_none());
    }

    #[test]
    fn direct_pdf_matches_sample() {
        let quad = unit_quad();
        let reference = Point3f::new(0.2, -0.1, -1.5);
        let mut sampler = PathSampleGenerator::uniform(9);
        sampler.start_path(0, 0);
        for _ in 0..50 {
            let mut sample = LightSample::default();
            if !quad.sample_direct(&mut sampler, &reference, &mut sample) {
                continue;
            }
            let mut ray = Ray::new_segment(reference, sample.d, 0.0, sample.dist + 1e-3);
            let info = quad.intersect(&mut ray).expect("sampled point must hit");
            let pdf = quad.direct_pdf(&info, &reference);
            assert!((pdf - sample.pdf).abs() / sample.pdf < 1e-3);
        }
    }
}
