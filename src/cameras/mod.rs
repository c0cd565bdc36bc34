//! Pinhole camera collaborator. Position sampling is a Dirac point; the
//! direction contract is what the bidirectional integrators connect against.

// others
use serde::{Deserialize, Serialize};
// lumen
use crate::core::geometry::{
    vec3_cross_vec3f, vec3_dot_vec3f, Normal3f, Point2f, Point2i, Point3f, Ray, Vector3f,
};
use crate::core::lumen::{clamp_t, Float, ONE_MINUS_EPSILON};
use crate::core::records::{DirectionSample, PositionSample};
use crate::core::spectrum::Spectrum;
use crate::samplers::{PathSampleGenerator, WritableSampler};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    pub position: Point3f,
    pub look_at: Point3f,
    #[serde(default = "CameraSettings::default_up")]
    pub up: Vector3f,
    #[serde(default = "CameraSettings::default_fov")]
    pub fov_degrees: Float,
}

impl CameraSettings {
    fn default_up() -> Vector3f {
        Vector3f::new(0.0, 1.0, 0.0)
    }
    fn default_fov() -> Float {
        60.0
    }
}

#[derive(Debug, Clone)]
pub struct Camera {
    pos: Point3f,
    fwd: Vector3f,
    right: Vector3f,
    up: Vector3f,
    res_x: u32,
    res_y: u32,
    plane_w: Float,
    plane_h: Float,
    plane_area: Float,
}

impl Camera {
    pub fn new(settings: &CameraSettings, res_x: u32, res_y: u32) -> Self {
        let fwd = (settings.look_at - settings.position).normalize();
        let right = vec3_cross_vec3f(&fwd, &settings.up).normalize();
        let up = vec3_cross_vec3f(&right, &fwd);
        let plane_w = (settings.fov_degrees.to_radians() * 0.5).tan();
        let plane_h = plane_w * res_y as Float / res_x as Float;
        Camera {
            pos: settings.position,
            fwd,
            right,
            up,
            res_x,
            res_y,
            plane_w,
            plane_h,
            plane_area: 4.0 * plane_w * plane_h,
        }
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.res_x, self.res_y)
    }

    pub fn pixel_count(&self) -> u32 {
        self.res_x * self.res_y
    }

    pub fn pos(&self) -> Point3f {
        self.pos
    }

    pub fn is_dirac(&self) -> bool {
        true
    }

    /// Lens position; consumes no dimensions for a pinhole.
    pub fn sample_position(
        &self,
        _sampler: &mut PathSampleGenerator,
        point: &mut PositionSample,
    ) -> bool {
        point.p = self.pos;
        point.weight = Spectrum::new(1.0);
        point.pdf = 1.0;
        point.ng = Normal3f::from(self.fwd);
        true
    }

    fn direction_for_uv(&self, u: Float, v: Float) -> Vector3f {
        let x = (2.0 * u - 1.0) * self.plane_w;
        let y = (1.0 - 2.0 * v) * self.plane_h;
        (self.fwd + self.right * x + self.up * y).normalize()
    }

    /// Sample a direction through `pixel` when given, or through the whole
    /// image plane otherwise. The landed pixel is reported either way.
    pub fn sample_direction(
        &self,
        sampler: &mut PathSampleGenerator,
        _point: &PositionSample,
        pixel: Option<Point2i>,
        direction: &mut DirectionSample,
    ) -> Option<Point2i> {
        let (ux, uy) = sampler.next_2d();
        let (u, v) = match pixel {
            Some(p) => (
                (p.x as Float + ux) / self.res_x as Float,
                (p.y as Float + uy) / self.res_y as Float,
            ),
            None => (ux, uy),
        };
        direction.d = self.direction_for_uv(u, v);
        direction.weight = Spectrum::new(1.0);
        direction.pdf = self.direction_pdf(&direction.d);
        if direction.pdf == 0.0 {
            return None;
        }
        Some(Point2i::new(
            ((u * self.res_x as Float) as i32).min(self.res_x as i32 - 1),
            ((v * self.res_y as Float) as i32).min(self.res_y as i32 - 1),
        ))
    }

    /// Solid-angle density of image-plane direction sampling.
    pub fn direction_pdf(&self, d: &Vector3f) -> Float {
        let cos_theta = vec3_dot_vec3f(d, &self.fwd);
        if cos_theta <= 0.0 {
            return 0.0;
        }
        1.0 / (self.plane_area * cos_theta * cos_theta * cos_theta)
    }

    /// Importance of direction `d` for splatting: weight and fractional
    /// pixel coordinates. Returns None when `d` misses the image plane.
    pub fn eval_direction(&self, d: &Vector3f) -> Option<(Float, Point2f)> {
        let cos_theta = vec3_dot_vec3f(d, &self.fwd);
        if cos_theta <= 0.0 {
            return None;
        }
        let inv_cos = 1.0 / cos_theta;
        let x = vec3_dot_vec3f(d, &self.right) * inv_cos;
        let y = vec3_dot_vec3f(d, &self.up) * inv_cos;
        let u = (x / self.plane_w + 1.0) * 0.5;
        let v = (1.0 - y / self.plane_h) * 0.5;
        if !(0.0..1.0).contains(&u) || !(0.0..1.0).contains(&v) {
            return None;
        }
        let weight = self.pixel_count() as Float
            / (self.plane_area * cos_theta * cos_theta * cos_theta);
        Some((
            weight,
            Point2f::new(u * self.res_x as Float, v * self.res_y as Float),
        ))
    }

    /// Generate a primary ray for a pixel sample.
    pub fn generate_sample(
        &self,
        pixel: Point2i,
        sampler: &mut PathSampleGenerator,
        ray: &mut Ray,
    ) -> bool {
        let mut point = PositionSample::default();
        if !self.sample_position(sampler, &mut point) {
            return false;
        }
        let mut direction = DirectionSample::default();
        if self
            .sample_direction(sampler, &point, Some(pixel), &mut direction)
            .is_none()
        {
            return false;
        }
        *ray = Ray::new(point.p, direction.d);
        ray.primary_ray = true;
        true
    }

    /// Write back the image-plane sample that regenerates direction `d`.
    pub fn invert_direction(&self, sampler: &mut WritableSampler, d: &Vector3f) -> bool {
        let cos_theta = vec3_dot_vec3f(d, &self.fwd);
        if cos_theta <= 0.0 {
            return false;
        }
        let inv_cos = 1.0 / cos_theta;
        let x = vec3_dot_vec3f(d, &self.right) * inv_cos;
        let y = vec3_dot_vec3f(d, &self.up) * inv_cos;
        let u = (x / self.plane_w + 1.0) * 0.5;
        let v = (1.0 - y / self.plane_h) * 0.5;
        if !(0.0..1.0).contains(&u) || !(0.0..1.0).contains(&v) {
            return false;
        }
        sampler.put_2d(
            clamp_t(u, 0.0, ONE_MINUS_EPSILON),
            clamp_t(v, 0.0, ONE_MINUS_EPSILON),
        );
        true
    }

    /// Solid angle subtended by one pixel at the image center; used for
    /// sanity checks in tests.
    pub fn approximate_pixel_solid_angle(&self) -> Float {
        self.plane_area / (self.res_x * self.res_y) as Float
    }

    /// Project a world point to fractional pixel coordinates. Points behind
    /// the camera plane return None; points outside the image are reported
    /// with out-of-range coordinates so callers can clip footprints.
    pub fn project(&self, p: &Point3f) -> Option<Point2f> {
        let v = *p - self.pos;
        let cos_theta = vec3_dot_vec3f(&v, &self.fwd);
        if cos_theta <= 1e-6 {
            return None;
        }
        let inv_cos = 1.0 / cos_theta;
        let x = vec3_dot_vec3f(&v, &self.right) * inv_cos;
        let y = vec3_dot_vec3f(&v, &self.up) * inv_cos;
        let u = (x / self.plane_w + 1.0) * 0.5;
        let vv = (1.0 - y / self.plane_h) * 0.5;
        Some(Point2f::new(
            u * self.res_x as Float,
            vv * self.res_y as Float,
        ))
    }
}

pub fn default_camera(res_x: u32, res_y: u32) -> Camera {
    Camera::new(
        &CameraSettings {
            position: Point3f::new(0.0, 0.0, 0.0),
            look_at: Point3f::new(0.0, 0.0, 1.0),
            up: Vector3f::new(0.0, 1.0, 0.0),
            fov_degrees: 60.0,
        },
        res_x,
        res_y,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_then_eval_roundtrips_pixel() {
        let cam = default_camera(64, 48);
        let mut sampler = PathSampleGenerator::uniform(3);
        sampler.start_path(0, 0);
        let point = {
            let mut p = PositionSample::default();
            cam.sample_position(&mut sampler, &mut p);
            p
        };
        for _ in 0..50 {
            let mut dir = DirectionSample::default();
            let pixel = cam
                .sample_direction(&mut sampler, &point, None, &mut dir)
                .unwrap();
            let (weight, splat) = cam.eval_direction(&dir.d).unwrap();
            assert!(weight > 0.0);
            assert_eq!(splat.x as i32, pixel.x);
            assert_eq!(splat.y as i32, pixel.y);
        }
    }

    #[test]
    fn pixel_importance_integrates_to_one() {
        // W_pix/pdf over the sampling distribution equals the pixel count
        let cam = default_camera(32, 32);
        let mut sampler = PathSampleGenerator::uniform(11);
        sampler.start_path(0, 0);
        let point = PositionSample::default();
        let n = 20_000;
        let mut sum = 0.0_f64;
        for _ in 0..n {
            let mut dir = DirectionSample::default();
            cam.sample_direction(&mut sampler, &point, None, &mut dir)
                .unwrap();
            let (weight, _) = cam.eval_direction(&dir.d).unwrap();
            sum += f64::from(weight / dir.pdf);
        }
        let mean = sum / f64::from(n);
        let expected = f64::from(cam.pixel_count());
        assert!((mean - expected).abs() / expected < 1e-3);
    }

    #[test]
    fn direction_inversion_reproduces_direction() {
        use crate::core::rng::UniformSampler;
        let cam = default_camera(16, 16);
        let mut metro = WritableSampler::new(false, UniformSampler::new(1), 16);
        metro.start_path(0, 0);
        let d = cam.direction_for_uv(0.3, 0.7);
        metro.freeze();
        metro.seek(0);
        assert!(cam.invert_direction(&mut metro, &d));
        metro.start_path(0, 0);
        let (u, v) = (metro.next_1d(), metro.next_1d());
        let d2 = cam.direction_for_uv(u, v);
        assert!((d - d2).length() < 1e-4);
    }
}
