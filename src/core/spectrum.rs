//! RGB spectrum type used for throughput, radiance and photon power.

// std
use std::ops::{Index, Neg};
// others
use num::Zero;
use serde::{Deserialize, Serialize};
// lumen
use crate::core::lumen::Float;
use crate::{
    impl_assignop_scalar, impl_assignop_struct, impl_binop_scalar_lhs, impl_binop_scalar_rhs,
    impl_binop_struct,
};

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    pub r: Float,
    pub g: Float,
    pub b: Float,
}

impl_binop_struct!(Add, add, Spectrum, Spectrum, Spectrum, |a, b| {
    Spectrum { r: a.r + b.r, g: a.g + b.g, b: a.b + b.b }
});
impl_binop_struct!(Sub, sub, Spectrum, Spectrum, Spectrum, |a, b| {
    Spectrum { r: a.r - b.r, g: a.g - b.g, b: a.b - b.b }
});
impl_binop_struct!(Mul, mul, Spectrum, Spectrum, Spectrum, |a, b| {
    Spectrum { r: a.r * b.r, g: a.g * b.g, b: a.b * b.b }
});
impl_binop_scalar_rhs!(Mul, mul, Spectrum, Float, Spectrum, |a, s| {
    Spectrum { r: a.r * s, g: a.g * s, b: a.b * s }
});
impl_binop_scalar_lhs!(Mul, mul, Float, Spectrum, Spectrum, |s, a| {
    Spectrum { r: a.r * s, g: a.g * s, b: a.b * s }
});
impl_binop_struct!(Div, div, Spectrum, Spectrum, Spectrum, |a, b| {
    Spectrum { r: a.r / b.r, g: a.g / b.g, b: a.b / b.b }
});
impl_binop_scalar_rhs!(Div, div, Spectrum, Float, Spectrum, |a, s| {
    let inv = 1.0 / s;
    Spectrum { r: a.r * inv, g: a.g * inv, b: a.b * inv }
});
impl_assignop_struct!(AddAssign, add_assign, Spectrum, Spectrum, |a, b| {
    a.r += b.r; a.g += b.g; a.b += b.b;
});
impl_assignop_struct!(SubAssign, sub_assign, Spectrum, Spectrum, |a, b| {
    a.r -= b.r; a.g -= b.g; a.b -= b.b;
});
impl_assignop_struct!(MulAssign, mul_assign, Spectrum, Spectrum, |a, b| {
    a.r *= b.r; a.g *= b.g; a.b *= b.b;
});
impl_assignop_scalar!(MulAssign, mul_assign, Spectrum, Float, |a, s| {
    a.r *= s; a.g *= s; a.b *= s;
});
impl_assignop_scalar!(DivAssign, div_assign, Spectrum, Float, |a, s| {
    let inv = 1.0 / s;
    a.r *= inv; a.g *= inv; a.b *= inv;
});

impl Neg for Spectrum {
    type Output = Spectrum;
    fn neg(self) -> Spectrum {
        Spectrum {
            r: -self.r,
            g: -self.g,
            b: -self.b,
        }
    }
}

impl Index<usize> for Spectrum {
    type Output = Float;
    fn index(&self, i: usize) -> &Float {
        match i {
            0 => &self.r,
            1 => &self.g,
            _ => &self.b,
        }
    }
}

impl Zero for Spectrum {
    fn zero() -> Self {
        Spectrum::default()
    }
    fn is_zero(&self) -> bool {
        self.r == 0.0 && self.g == 0.0 && self.b == 0.0
    }
}

impl Spectrum {
    pub fn new(v: Float) -> Self {
        Spectrum { r: v, g: v, b: v }
    }
    pub fn rgb(r: Float, g: Float, b: Float) -> Self {
        Spectrum { r, g, b }
    }
    pub fn luminance(&self) -> Float {
        self.r * 0.2126 + self.g * 0.7152 + self.b * 0.0722
    }
    pub fn avg(&self) -> Float {
        (self.r + self.g + self.b) * (1.0 / 3.0)
    }
    pub fn max_component(&self) -> Float {
        self.r.max(self.g.max(self.b))
    }
    pub fn min_component(&self) -> Float {
        self.r.min(self.g.min(self.b))
    }
    pub fn sum(&self) -> Float {
        self.r + self.g + self.b
    }
    pub fn abs(&self) -> Spectrum {
        Spectrum {
            r: self.r.abs(),
            g: self.g.abs(),
            b: self.b.abs(),
        }
    }
    pub fn exp(&self) -> Spectrum {
        Spectrum {
            r: self.r.exp(),
            g: self.g.exp(),
            b: self.b.exp(),
        }
    }
    pub fn is_nan(&self) -> bool {
        self.r.is_nan() || self.g.is_nan() || self.b.is_nan()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luminance_of_white_is_one() {
        assert!((Spectrum::new(1.0).luminance() - 1.0).abs() < 1e-4);
    }
}
