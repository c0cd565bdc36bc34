//! Points, vectors, normals, rays and axis-aligned boxes.

// std
use std::ops::{Index, IndexMut, Neg};
// others
use serde::{Deserialize, Serialize};
// lumen
use crate::core::lumen::Float;
use crate::{impl_binop_scalar_lhs, impl_binop_scalar_rhs, impl_binop_struct};

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector3f {
    pub x: Float,
    pub y: Float,
    pub z: Float,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point3f {
    pub x: Float,
    pub y: Float,
    pub z: Float,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normal3f {
    pub x: Float,
    pub y: Float,
    pub z: Float,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point2f {
    pub x: Float,
    pub y: Float,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point2i {
    pub x: i32,
    pub y: i32,
}

impl_binop_struct!(Add, add, Vector3f, Vector3f, Vector3f, |a, b| {
    Vector3f { x: a.x + b.x, y: a.y + b.y, z: a.z + b.z }
});
impl_binop_struct!(Sub, sub, Vector3f, Vector3f, Vector3f, |a, b| {
    Vector3f { x: a.x - b.x, y: a.y - b.y, z: a.z - b.z }
});
impl_binop_scalar_rhs!(Mul, mul, Vector3f, Float, Vector3f, |a, s| {
    Vector3f { x: a.x * s, y: a.y * s, z: a.z * s }
});
impl_binop_scalar_lhs!(Mul, mul, Float, Vector3f, Vector3f, |s, a| {
    Vector3f { x: a.x * s, y: a.y * s, z: a.z * s }
});
impl_binop_scalar_rhs!(Div, div, Vector3f, Float, Vector3f, |a, s| {
    let inv = 1.0 / s;
    Vector3f { x: a.x * inv, y: a.y * inv, z: a.z * inv }
});
impl_binop_struct!(Add, add, Point3f, Vector3f, Point3f, |a, v| {
    Point3f { x: a.x + v.x, y: a.y + v.y, z: a.z + v.z }
});
impl_binop_struct!(Sub, sub, Point3f, Vector3f, Point3f, |a, v| {
    Point3f { x: a.x - v.x, y: a.y - v.y, z: a.z - v.z }
});
impl_binop_struct!(Sub, sub, Point3f, Point3f, Vector3f, |a, b| {
    Vector3f { x: a.x - b.x, y: a.y - b.y, z: a.z - b.z }
});

impl Neg for Vector3f {
    type Output = Vector3f;
    fn neg(self) -> Vector3f {
        Vector3f {
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }
}

impl Index<usize> for Vector3f {
    type Output = Float;
    fn index(&self, i: usize) -> &Float {
        match i {
            0 => &self.x,
            1 => &self.y,
            _ => &self.z,
        }
    }
}

impl IndexMut<usize> for Vector3f {
    fn index_mut(&mut self, i: usize) -> &mut Float {
        match i {
            0 => &mut self.x,
            1 => &mut self.y,
            _ => &mut self.z,
        }
    }
}

impl Index<usize> for Point3f {
    type Output = Float;
    fn index(&self, i: usize) -> &Float {
        match i {
            0 => &self.x,
            1 => &self.y,
            _ => &self.z,
        }
    }
}

impl Vector3f {
    pub fn new(x: Float, y: Float, z: Float) -> Self {
        Vector3f { x, y, z }
    }
    pub fn length_squared(&self) -> Float {
        self.x * self.x + self.y * self.y + self.z * self.z
    }
    pub fn length(&self) -> Float {
        self.length_squared().sqrt()
    }
    pub fn normalize(&self) -> Vector3f {
        *self / self.length()
    }
    pub fn abs(&self) -> Vector3f {
        Vector3f {
            x: self.x.abs(),
            y: self.y.abs(),
            z: self.z.abs(),
        }
    }
    pub fn max_component(&self) -> Float {
        self.x.max(self.y.max(self.z))
    }
    pub fn max_dimension(&self) -> usize {
        if self.x > self.y {
            if self.x > self.z {
                0
            } else {
                2
            }
        } else if self.y > self.z {
            1
        } else {
            2
        }
    }
    pub fn sum(&self) -> Float {
        self.x + self.y + self.z
    }
    pub fn is_nan(&self) -> bool {
        self.x.is_nan() || self.y.is_nan() || self.z.is_nan()
    }
}

impl Point3f {
    pub fn new(x: Float, y: Float, z: Float) -> Self {
        Point3f { x, y, z }
    }
    pub fn to_vec(&self) -> Vector3f {
        Vector3f {
            x: self.x,
            y: self.y,
            z: self.z,
        }
    }
}

impl Normal3f {
    pub fn new(x: Float, y: Float, z: Float) -> Self {
        Normal3f { x, y, z }
    }
    pub fn to_vec(&self) -> Vector3f {
        Vector3f {
            x: self.x,
            y: self.y,
            z: self.z,
        }
    }
}

impl From<Vector3f> for Normal3f {
    fn from(v: Vector3f) -> Self {
        Normal3f {
            x: v.x,
            y: v.y,
            z: v.z,
        }
    }
}

impl From<Normal3f> for Vector3f {
    fn from(n: Normal3f) -> Self {
        Vector3f {
            x: n.x,
            y: n.y,
            z: n.z,
        }
    }
}

impl Neg for Normal3f {
    type Output = Normal3f;
    fn neg(self) -> Normal3f {
        Normal3f {
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }
}

impl Point2f {
    pub fn new(x: Float, y: Float) -> Self {
        Point2f { x, y }
    }
}

impl Point2i {
    pub fn new(x: i32, y: i32) -> Self {
        Point2i { x, y }
    }
}

pub fn vec3_dot_vec3f(a: &Vector3f, b: &Vector3f) -> Float {
    a.x * b.x + a.y * b.y + a.z * b.z
}

pub fn vec3_dot_nrmf(a: &Vector3f, n: &Normal3f) -> Float {
    a.x * n.x + a.y * n.y + a.z * n.z
}

pub fn vec3_abs_dot_nrmf(a: &Vector3f, n: &Normal3f) -> Float {
    vec3_dot_nrmf(a, n).abs()
}

pub fn vec3_cross_vec3f(a: &Vector3f, b: &Vector3f) -> Vector3f {
    Vector3f {
        x: a.y * b.z - a.z * b.y,
        y: a.z * b.x - a.x * b.z,
        z: a.x * b.y - a.y * b.x,
    }
}

pub fn pnt3_distance_squaredf(a: &Point3f, b: &Point3f) -> Float {
    (a - b).length_squared()
}

pub fn pnt3_distancef(a: &Point3f, b: &Point3f) -> Float {
    (a - b).length()
}

pub fn pnt3_minf(a: &Point3f, b: &Point3f) -> Point3f {
    Point3f {
        x: a.x.min(b.x),
        y: a.y.min(b.y),
        z: a.z.min(b.z),
    }
}

pub fn pnt3_maxf(a: &Point3f, b: &Point3f) -> Point3f {
    Point3f {
        x: a.x.max(b.x),
        y: a.y.max(b.y),
        z: a.z.max(b.z),
    }
}

/// Orthonormal basis with +z along the given normal.
#[derive(Debug, Default, Copy, Clone)]
pub struct TangentFrame {
    pub normal: Vector3f,
    pub tangent: Vector3f,
    pub bitangent: Vector3f,
}

impl TangentFrame {
    pub fn from_normal(normal: Vector3f) -> Self {
        let tangent = if normal.x.abs() > normal.y.abs() {
            Vector3f::new(-normal.z, 0.0, normal.x)
                / (normal.x * normal.x + normal.z * normal.z).sqrt()
        } else {
            Vector3f::new(0.0, normal.z, -normal.y)
                / (normal.y * normal.y + normal.z * normal.z).sqrt()
        };
        let bitangent = vec3_cross_vec3f(&normal, &tangent);
        TangentFrame {
            normal,
            tangent,
            bitangent,
        }
    }
    pub fn to_local(&self, v: &Vector3f) -> Vector3f {
        Vector3f {
            x: vec3_dot_vec3f(&self.tangent, v),
            y: vec3_dot_vec3f(&self.bitangent, v),
            z: vec3_dot_vec3f(&self.normal, v),
        }
    }
    pub fn to_global(&self, v: &Vector3f) -> Vector3f {
        self.tangent * v.x + self.bitangent * v.y + self.normal * v.z
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Ray {
    pub o: Point3f,
    pub d: Vector3f,
    pub t_min: Float,
    pub t_max: Float,
    pub primary_ray: bool,
    pub bounce: u32,
}

impl Default for Ray {
    fn default() -> Self {
        Ray {
            o: Point3f::default(),
            d: Vector3f::new(0.0, 0.0, 1.0),
            t_min: 0.0,
            t_max: Float::INFINITY,
            primary_ray: false,
            bounce: 0,
        }
    }
}

impl Ray {
    pub fn new(o: Point3f, d: Vector3f) -> Self {
        Ray {
            o,
            d,
            ..Default::default()
        }
    }
    pub fn new_segment(o: Point3f, d: Vector3f, t_min: Float, t_max: Float) -> Self {
        Ray {
            o,
            d,
            t_min,
            t_max,
            ..Default::default()
        }
    }
    pub fn position(&self, t: Float) -> Point3f {
        self.o + self.d * t
    }
    pub fn hit_point(&self) -> Point3f {
        self.position(self.t_max)
    }
    /// Spawn a continuation ray off the given surface point, epsilon-offset
    /// along the new direction.
    pub fn scatter(&self, o: Point3f, d: Vector3f, epsilon: Float) -> Ray {
        Ray {
            o,
            d,
            t_min: epsilon,
            t_max: Float::INFINITY,
            primary_ray: false,
            bounce: self.bounce + 1,
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct Bounds3f {
    pub p_min: Point3f,
    pub p_max: Point3f,
}

impl Default for Bounds3f {
    fn default() -> Self {
        Bounds3f {
            p_min: Point3f::new(Float::INFINITY, Float::INFINITY, Float::INFINITY),
            p_max: Point3f::new(-Float::INFINITY, -Float::INFINITY, -Float::INFINITY),
        }
    }
}

impl Bounds3f {
    pub fn from_point(p: Point3f) -> Self {
        Bounds3f { p_min: p, p_max: p }
    }
    pub fn grow_pnt(&mut self, p: &Point3f) {
        self.p_min = pnt3_minf(&self.p_min, p);
        self.p_max = pnt3_maxf(&self.p_max, p);
    }
    pub fn grow_bnd(&mut self, b: &Bounds3f) {
        self.p_min = pnt3_minf(&self.p_min, &b.p_min);
        self.p_max = pnt3_maxf(&self.p_max, &b.p_max);
    }
    pub fn expand(&mut self, delta: Float) {
        let d = Vector3f::new(delta, delta, delta);
        self.p_min = self.p_min - d;
        self.p_max = self.p_max + d;
    }
    pub fn diagonal(&self) -> Vector3f {
        self.p_max - self.p_min
    }
    pub fn center(&self) -> Point3f {
        self.p_min + self.diagonal() * 0.5
    }
    pub fn maximum_extent(&self) -> usize {
        self.diagonal().max_dimension()
    }
    pub fn surface_area(&self) -> Float {
        let d = self.diagonal();
        if d.x < 0.0 || d.y < 0.0 || d.z < 0.0 {
            return 0.0;
        }
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }
    pub fn contains(&self, p: &Point3f) -> bool {
        p.x >= self.p_min.x
            && p.x <= self.p_max.x
            && p.y >= self.p_min.y
            && p.y <= self.p_max.y
            && p.z >= self.p_min.z
            && p.z <= self.p_max.z
    }
    /// Slab test; returns the parametric overlap of the ray with the box.
    pub fn intersect_interval(&self, o: &Point3f, inv_d: &Vector3f) -> (Float, Float) {
        let mut t0 = -Float::INFINITY;
        let mut t1 = Float::INFINITY;
        for axis in 0..3 {
            let near = (self.p_min[axis] - o[axis]) * inv_d[axis];
            let far = (self.p_max[axis] - o[axis]) * inv_d[axis];
            let (near, far) = if near <= far { (near, far) } else { (far, near) };
            t0 = t0.max(near);
            t1 = t1.min(far);
        }
        (t0, t1)
    }
}

pub fn bnd3_union_bnd3f(a: &Bounds3f, b: &Bounds3f) -> Bounds3f {
    Bounds3f {
        p_min: pnt3_minf(&a.p_min, &b.p_min),
        p_max: pnt3_maxf(&a.p_max, &b.p_max),
    }
}

pub fn bnd3_union_pnt3f(a: &Bounds3f, p: &Point3f) -> Bounds3f {
    Bounds3f {
        p_min: pnt3_minf(&a.p_min, p),
        p_max: pnt3_maxf(&a.p_max, p),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tangent_frame_is_orthonormal() {
        for &n in &[
            Vector3f::new(0.0, 0.0, 1.0),
            Vector3f::new(1.0, 2.0, -0.5).normalize(),
            Vector3f::new(-3.0, 0.1, 0.1).normalize(),
        ] {
            let frame = TangentFrame::from_normal(n);
            assert!((frame.tangent.length() - 1.0).abs() < 1e-5);
            assert!((frame.bitangent.length() - 1.0).abs() < 1e-5);
            assert!(vec3_dot_vec3f(&frame.tangent, &frame.normal).abs() < 1e-5);
            let v = Vector3f::new(0.3, -0.4, 0.7);
            let roundtrip = frame.to_global(&frame.to_local(&v));
            assert!((roundtrip - v).length() < 1e-5);
        }
    }

    #[test]
    fn bounds_interval_matches_containment() {
        let mut b = Bounds3f::default();
        b.grow_pnt(&Point3f::new(-1.0, -1.0, -1.0));
        b.grow_pnt(&Point3f::new(1.0, 1.0, 1.0));
        let o = Point3f::new(0.0, 0.0, -5.0);
        let d = Vector3f::new(0.0, 0.0, 1.0);
        let inv_d = Vector3f::new(1.0 / d.x, 1.0 / d.y, 1.0 / d.z);
        let (t0, t1) = b.intersect_interval(&o, &inv_d);
        assert!((t0 - 4.0).abs() < 1e-5);
        assert!((t1 - 6.0).abs() < 1e-5);
    }
}
