//! Camera-space binning of photon primitives onto the pixels whose primary
//! rays can plausibly intersect them. Used by the direct photon-splat pass
//! of the photon mapper (pinhole cameras only).

// std
use std::sync::Arc;
// lumen
use crate::cameras::Camera;
use crate::core::geometry::{Point2f, Point3f, Vector3f};
use crate::core::lumen::Float;

pub struct FrustumBinner {
    cam: Arc<Camera>,
    w: u32,
    h: u32,
}

impl FrustumBinner {
    pub fn new(cam: Arc<Camera>) -> Self {
        let (w, h) = cam.resolution();
        FrustumBinner { cam, w, h }
    }

    fn footprint<F: FnMut(u32, u32, usize)>(&self, corners: &[Point2f], mut body: F) {
        if corners.is_empty() {
            return;
        }
        let mut min_x = Float::INFINITY;
        let mut min_y = Float::INFINITY;
        let mut max_x = -Float::INFINITY;
        let mut max_y = -Float::INFINITY;
        for corner in corners {
            min_x = min_x.min(corner.x);
            min_y = min_y.min(corner.y);
            max_x = max_x.max(corner.x);
            max_y = max_y.max(corner.y);
        }
        let x0 = (min_x.floor() as i64).max(0);
        let y0 = (min_y.floor() as i64).max(0);
        let x1 = (max_x.ceil() as i64).min(i64::from(self.w) - 1);
        let y1 = (max_y.ceil() as i64).min(i64::from(self.h) - 1);
        for y in y0..=y1 {
            for x in x0..=x1 {
                body(x as u32, y as u32, (x + y * i64::from(self.w)) as usize);
            }
        }
    }

    /// Conservative pixel footprint of a beam with the given perpendicular
    /// half-extent. The beam is clipped against the camera plane.
    pub fn bin_beam<F: FnMut(u32, u32, usize)>(
        &self,
        p0: Point3f,
        p1: Point3f,
        u: Vector3f,
        radius: Float,
        body: F,
    ) {
        let mut a = p0;
        let mut b = p1;
        if self.cam.project(&a).is_none() && self.cam.project(&b).is_none() {
            return;
        }
        // walk endpoints toward the visible side until both project
        for _ in 0..16 {
            if self.cam.project(&a).is_some() {
                break;
            }
            a = a + (b - a) * 0.5;
        }
        for _ in 0..16 {
            if self.cam.project(&b).is_some() {
                break;
            }
            b = b + (a - b) * 0.5;
        }
        let offsets = [u * radius, u * -radius];
        let mut corners = Vec::with_capacity(4);
        for p in &[a, b] {
            for offset in &offsets {
                if let Some(pixel) = self.cam.project(&(*p + *offset)) {
                    corners.push(pixel);
                }
            }
        }
        self.footprint(&corners, body);
    }

    /// Conservative pixel footprint of a quad-shaped photon plane.
    pub fn bin_plane<F: FnMut(u32, u32, usize)>(
        &self,
        p0: Point3f,
        p1: Point3f,
        p2: Point3f,
        p3: Point3f,
        body: F,
    ) {
        let mut corners = Vec::with_capacity(4);
        for p in &[p0, p1, p2, p3] {
            match self.cam.project(p) {
                Some(pixel) => corners.push(pixel),
                // a corner behind the camera defeats the conservative
                // screen bound; fall back to the k-d path for this one
                None => return,
            }
        }
        self.footprint(&corners, body);
    }

    /// Footprint of a 1-D plane given center and half-axes.
    pub fn bin_plane_1d<F: FnMut(u32, u32, usize)>(
        &self,
        center: Point3f,
        a: Vector3f,
        b: Vector3f,
        c: Vector3f,
        body: F,
    ) {
        let mut corners = Vec::with_capacity(8);
        for &sa in &[-1.0, 1.0] {
            for &sb in &[-1.0, 1.0] {
                for &sc in &[-1.0, 1.0] {
                    let p = center + a * sa + b * sb + c * sc;
                    match self.cam.project(&p) {
                        Some(pixel) => corners.push(pixel),
                        None => return,
                    }
                }
            }
        }
        self.footprint(&corners, body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cameras::default_camera;

    #[test]
    fn beam_in_front_of_camera_covers_pixels() {
        let cam = Arc::new(default_camera(32, 32));
        let binner = FrustumBinner::new(cam);
        let mut cells = Vec::new();
        binner.bin_beam(
            Point3f::new(-0.2, 0.0, 2.0),
            Point3f::new(0.2, 0.0, 2.0),
            Vector3f::new(0.0, 1.0, 0.0),
            0.05,
            |x, y, idx| {
                assert_eq!(idx, (x + y * 32) as usize);
                cells.push(idx);
            },
        );
        assert!(!cells.is_empty());
        // footprint stays near the image center for a centered beam
        for idx in cells {
            let x = idx % 32;
            let y = idx / 32;
            assert!((8..24).contains(&x));
            assert!((8..24).contains(&y));
        }
    }

    #[test]
    fn primitive_behind_camera_is_skipped() {
        let cam = Arc::new(default_camera(32, 32));
        let binner = FrustumBinner::new(cam);
        let mut count = 0;
        binner.bin_beam(
            Point3f::new(0.0, 0.0, -3.0),
            Point3f::new(0.0, 1.0, -3.0),
            Vector3f::new(1.0, 0.0, 0.0),
            0.1,
            |_, _, _| count += 1,
        );
        assert_eq!(count, 0);
    }
}
