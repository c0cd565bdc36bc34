//! Distributions and sample warps, with the inverse warps required by
//! path-space inversion.

// std
use std::f32::consts::PI;
// lumen
use crate::core::geometry::Vector3f;
use crate::core::lumen::{clamp_t, Float, INV_2_PI, INV_4_PI, INV_PI, ONE_MINUS_EPSILON};

#[derive(Debug, Default, Clone)]
pub struct Distribution1D {
    pub func: Vec<Float>,
    pub cdf: Vec<Float>,
    pub func_int: Float,
}

impl Distribution1D {
    pub fn new(f: Vec<Float>) -> Self {
        let n = f.len();
        let mut cdf: Vec<Float> = Vec::with_capacity(n + 1);
        cdf.push(0.0);
        for i in 1..=n {
            let previous = cdf[i - 1];
            cdf.push(previous + f[i - 1] / n as Float);
        }
        let func_int = cdf[n];
        if func_int == 0.0 {
            for (i, item) in cdf.iter_mut().enumerate().skip(1).take(n) {
                *item = i as Float / n as Float;
            }
        } else {
            for item in cdf.iter_mut().skip(1).take(n) {
                *item /= func_int;
            }
        }
        Distribution1D {
            func: f,
            cdf,
            func_int,
        }
    }

    pub fn count(&self) -> usize {
        self.func.len()
    }

    fn find_interval(&self, u: Float) -> usize {
        let mut first = 0_usize;
        let mut len = self.cdf.len();
        while len > 0 {
            let half = len >> 1;
            let middle = first + half;
            if self.cdf[middle] <= u {
                first = middle + 1;
                len -= half + 1;
            } else {
                len = half;
            }
        }
        clamp_t(first as isize - 1, 0, self.cdf.len() as isize - 2) as usize
    }

    pub fn sample_discrete(&self, u: Float, pdf: Option<&mut Float>) -> usize {
        let offset = self.find_interval(u);
        if let Some(pdf) = pdf {
            *pdf = self.discrete_pdf(offset);
        }
        offset
    }

    pub fn discrete_pdf(&self, index: usize) -> Float {
        if self.func_int > 0.0 {
            self.func[index] / (self.func_int * self.count() as Float)
        } else {
            1.0 / self.count() as Float
        }
    }

    /// Remap `u` to a uniform sample within the chosen bucket, so the
    /// dimension can be reused after the discrete decision.
    pub fn sample_discrete_remapped(&self, u: Float) -> (usize, Float) {
        let offset = self.find_interval(u);
        let lo = self.cdf[offset];
        let hi = self.cdf[offset + 1];
        let remapped = if hi > lo {
            clamp_t((u - lo) / (hi - lo), 0.0, ONE_MINUS_EPSILON)
        } else {
            0.0
        };
        (offset, remapped)
    }
}

pub fn uniform_sample_sphere(u1: Float, u2: Float) -> Vector3f {
    let z = 1.0 - 2.0 * u1;
    let r = (1.0 - z * z).max(0.0).sqrt();
    let phi = 2.0 * PI * u2;
    Vector3f::new(r * phi.cos(), r * phi.sin(), z)
}

pub fn uniform_sphere_pdf() -> Float {
    INV_4_PI
}

pub fn invert_uniform_sphere(d: &Vector3f) -> (Float, Float) {
    let u1 = (1.0 - d.z) * 0.5;
    let mut phi = d.y.atan2(d.x);
    if phi < 0.0 {
        phi += 2.0 * PI;
    }
    (
        clamp_t(u1, 0.0, ONE_MINUS_EPSILON),
        clamp_t(phi * INV_2_PI, 0.0, ONE_MINUS_EPSILON),
    )
}

pub fn cosine_sample_hemisphere(u1: Float, u2: Float) -> Vector3f {
    let phi = 2.0 * PI * u1;
    let r = u2.sqrt();
    Vector3f::new(r * phi.cos(), r * phi.sin(), (1.0 - u2).max(0.0).sqrt())
}

pub fn cosine_hemisphere_pdf(cos_theta: Float) -> Float {
    cos_theta * INV_PI
}

pub fn invert_cosine_hemisphere(d: &Vector3f) -> Option<(Float, Float)> {
    if d.z <= 0.0 {
        return None;
    }
    let u2 = (1.0 - d.z * d.z).max(0.0);
    let mut phi = d.y.atan2(d.x);
    if phi < 0.0 {
        phi += 2.0 * PI;
    }
    Some((
        clamp_t(phi * INV_2_PI, 0.0, ONE_MINUS_EPSILON),
        clamp_t(u2, 0.0, ONE_MINUS_EPSILON),
    ))
}

/// Balance heuristic for two single-sample techniques.
pub fn balance_heuristic(pdf_a: Float, pdf_b: Float) -> Float {
    pdf_a / (pdf_a + pdf_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::UniformSampler;

    #[test]
    fn distribution_matches_weights() {
        let dist = Distribution1D::new(vec![1.0, 3.0, 0.0, 4.0]);
        let mut pdf = 0.0;
        let idx = dist.sample_discrete(0.05, Some(&mut pdf));
        assert_eq!(idx, 0);
        assert!((pdf - 1.0 / 8.0).abs() < 1e-6);
        assert_eq!(dist.sample_discrete(0.49, None), 1);
        assert_eq!(dist.sample_discrete(0.99, None), 3);
        assert!(dist.discrete_pdf(2) == 0.0);
        let total: Float = (0..4).map(|i| dist.discrete_pdf(i)).sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn sphere_warp_roundtrip() {
        let mut rng = UniformSampler::new(7);
        for _ in 0..100 {
            let (u1, u2) = rng.next_2d();
            let d = uniform_sample_sphere(u1, u2);
            assert!((d.length() - 1.0).abs() < 1e-4);
            let (v1, v2) = invert_uniform_sphere(&d);
            assert!((u1 - v1).abs() < 1e-4);
            assert!((u2 - v2).abs() < 1e-4);
        }
    }

    #[test]
    fn cosine_warp_roundtrip() {
        let mut rng = UniformSampler::new(11);
        for _ in 0..100 {
            let (u1, u2) = rng.next_2d();
            let d = cosine_sample_hemisphere(u1, u2);
            let (v1, v2) = invert_cosine_hemisphere(&d).unwrap();
            assert!((u1 - v1).abs() < 1e-3);
            assert!((u2 - v2).abs() < 1e-3);
        }
    }
}
