//! Scalar type, constants and small numeric helpers shared by the whole crate.

pub type Float = f32;

pub const PI: Float = std::f32::consts::PI;
pub const INV_PI: Float = std::f32::consts::FRAC_1_PI;
pub const INV_2_PI: Float = 0.159_154_94;
pub const INV_4_PI: Float = 0.079_577_47;
pub const SQRT_2: Float = std::f32::consts::SQRT_2;
pub const ONE_MINUS_EPSILON: Float = hexf::hexf32!("0x1.fffffep-1");

/// Rays spawned off a surface are offset by this fraction of the hit epsilon.
pub const DEFAULT_EPSILON: Float = 1e-4;

pub fn clamp_t<T: PartialOrd>(val: T, low: T, high: T) -> T {
    if val < low {
        low
    } else if val > high {
        high
    } else {
        val
    }
}

pub fn lerp_t(t: Float, a: Float, b: Float) -> Float {
    (1.0 - t) * a + t * b
}

pub fn sqr(x: Float) -> Float {
    x * x
}

pub fn cube(x: Float) -> Float {
    x * x * x
}

/// Integer lerp used to carve `[0, range)` into per-worker sub-ranges.
pub fn int_lerp(a: u32, b: u32, t: u32, range: u32) -> u32 {
    debug_assert!(t <= range);
    ((u64::from(a) * u64::from(range - t) + u64::from(b) * u64::from(t)) / u64::from(range)) as u32
}

/// 32-bit finalizer-style hash, used to decorrelate per-tile sampler seeds.
pub fn hash_u32(mut x: u32) -> u32 {
    x = x.wrapping_add(x << 10);
    x ^= x >> 6;
    x = x.wrapping_add(x << 3);
    x ^= x >> 11;
    x = x.wrapping_add(x << 15);
    x
}

pub fn hash_u64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

/// Inverse error function, used by the Gaussian small-step mutation.
pub fn erf_inv(x: Float) -> Float {
    let x = clamp_t(x, -0.999_99, 0.999_99);
    let mut w: Float = -((1.0 - x) * (1.0 + x)).ln();
    let mut p: Float;
    if w < 5.0 {
        w -= 2.5;
        p = 2.810_226_36e-08;
        p = 3.432_739_39e-07 + p * w;
        p = -3.523_387_7e-06 + p * w;
        p = -4.391_506_54e-06 + p * w;
        p = 0.000_218_580_87 + p * w;
        p = -0.001_253_725_03 + p * w;
        p = -0.004_177_681_640 + p * w;
        p = 0.246_640_727 + p * w;
        p = 1.501_409_41 + p * w;
    } else {
        w = w.sqrt() - 3.0;
        p = -0.000_200_214_257;
        p = 0.000_100_950_558 + p * w;
        p = 0.001_349_343_22 + p * w;
        p = -0.003_673_428_44 + p * w;
        p = 0.005_739_507_73 + p * w;
        p = -0.007_622_461_3 + p * w;
        p = 0.009_438_870_47 + p * w;
        p = 1.001_674_06 + p * w;
        p = 2.832_976_82 + p * w;
    }
    p * x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_lerp_partitions_cover_range() {
        let workers = 7_u32;
        let total = 1_000_003_u32;
        let mut covered = 0_u32;
        for i in 0..workers {
            let start = int_lerp(0, total, i, workers);
            let end = int_lerp(0, total, i + 1, workers);
            assert!(start <= end);
            covered += end - start;
        }
        assert_eq!(covered, total);
    }

    #[test]
    fn erf_inv_matches_erf() {
        // erf(erf_inv(x)) ~ x via the Abramowitz-Stegun erf approximation
        let erf = |x: Float| {
            let t = 1.0 / (1.0 + 0.327_591_1 * x.abs());
            let y = 1.0
                - (((((1.061_405_429 * t - 1.453_152_027) * t) + 1.421_413_741) * t
                    - 0.284_496_736)
                    * t
                    + 0.254_829_592)
                    * t
                    * (-x * x).exp();
            if x < 0.0 {
                -y
            } else {
                y
            }
        };
        for &x in &[-0.9, -0.5, -0.1, 0.0, 0.3, 0.7, 0.95] {
            assert!((erf(erf_inv(x)) - x).abs() < 1e-3);
        }
    }
}
