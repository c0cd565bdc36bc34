//! Per-technique accumulation buffers, indexed by (s, t). Optional debug
//! output of the bidirectional integrators.

// std
use std::path::Path;
// lumen
use crate::core::film::{write_ldr, AtomicSplatBuffer, Tonemap};
use crate::core::geometry::Point2f;
use crate::core::lumen::Float;
use crate::core::spectrum::Spectrum;

pub struct ImagePyramid {
    max_bounce: usize,
    w: u32,
    h: u32,
    buffers: Vec<AtomicSplatBuffer>,
}

impl ImagePyramid {
    pub fn new(max_bounce: usize, w: u32, h: u32) -> Self {
        let count = Self::index_of(max_bounce, max_bounce) + 1;
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            buffers.push(AtomicSplatBuffer::new(w, h));
        }
        ImagePyramid {
            max_bounce,
            w,
            h,
            buffers,
        }
    }

    /// Techniques of path length `l` occupy a contiguous run; `s` selects
    /// within it.
    fn index_of(l: usize, s: usize) -> usize {
        (l.saturating_sub(1)) * (l + 2) / 2 + s
    }

    pub fn splat(&self, s: usize, t: usize, pixel: Point2f, value: Spectrum) {
        let l = s + t - 1;
        if l == 0 || l > self.max_bounce || s > l {
            return;
        }
        self.buffers[Self::index_of(l, s)].splat_filtered(pixel, value, self.w, self.h);
    }

    pub fn save_buffers(&self, base: &Path, spp: u32) -> std::io::Result<()> {
        let scale = 1.0 / spp.max(1) as Float;
        for l in 1..=self.max_bounce {
            for s in 0..=l {
                let buffer = &self.buffers[Self::index_of(l, s)];
                let mut pixels = Vec::with_capacity((self.w * self.h) as usize);
                for y in 0..self.h {
                    for x in 0..self.w {
                        pixels.push(buffer.get(x, y) * scale);
                    }
                }
                let t = l + 1 - s;
                let name = format!(
                    "{}_s{}_t{}.png",
                    base.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "pyramid".into()),
                    s,
                    t
                );
                let path = base.with_file_name(name);
                write_ldr(&path, self.w, self.h, &pixels, Tonemap::Gamma)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn technique_indices_are_unique_and_contiguous() {
        let max = 6;
        let mut seen = Vec::new();
        for l in 1..=max {
            for s in 0..=l {
                seen.push(ImagePyramid::index_of(l, s));
            }
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), seen.len());
        assert_eq!(sorted[0], 0);
        assert_eq!(*sorted.last().unwrap(), seen.len() - 1);
    }

    #[test]
    fn splat_lands_in_matching_technique() {
        let pyramid = ImagePyramid::new(3, 4, 4);
        pyramid.splat(1, 2, Point2f::new(1.0, 1.0), Spectrum::new(2.0));
        let idx = ImagePyramid::index_of(2, 1);
        assert_eq!(pyramid.buffers[idx].get(1, 1).r, 2.0);
        assert_eq!(pyramid.buffers[ImagePyramid::index_of(2, 0)].get(1, 1).r, 0.0);
    }
}
