//! Framebuffers: a tile-merged color buffer, optional aux buffers, and a
//! concurrently written splat buffer whose float adds are bit-cast
//! compare-exchange loops.

// std
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
// others
use atomic::Atomic;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
// lumen
use crate::core::geometry::Point2f;
use crate::core::lumen::{clamp_t, Float};
use crate::core::spectrum::Spectrum;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tonemap {
    Linear,
    Gamma,
    Reinhard,
}

impl Default for Tonemap {
    fn default() -> Self {
        Tonemap::Gamma
    }
}

impl Tonemap {
    pub fn apply(&self, c: Spectrum) -> Spectrum {
        match self {
            Tonemap::Linear => c,
            Tonemap::Gamma => Spectrum::rgb(
                c.r.max(0.0).powf(1.0 / 2.2),
                c.g.max(0.0).powf(1.0 / 2.2),
                c.b.max(0.0).powf(1.0 / 2.2),
            ),
            Tonemap::Reinhard => {
                let mapped = Spectrum::rgb(
                    c.r.max(0.0) / (1.0 + c.r.max(0.0)),
                    c.g.max(0.0) / (1.0 + c.g.max(0.0)),
                    c.b.max(0.0) / (1.0 + c.b.max(0.0)),
                );
                Tonemap::Gamma.apply(mapped)
            }
        }
    }
}

/// Pixel rectangle a worker accumulates into before merging; tiles own
/// disjoint pixel sets, so the merge is the only synchronized step.
pub struct FilmTile {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    color: Vec<Spectrum>,
    counts: Vec<u32>,
    aux: Option<Box<AuxTile>>,
}

struct AuxTile {
    albedo: Vec<Spectrum>,
    normal: Vec<Spectrum>,
}

impl FilmTile {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        FilmTile {
            x,
            y,
            w,
            h,
            color: vec![Spectrum::default(); (w * h) as usize],
            counts: vec![0; (w * h) as usize],
            aux: None,
        }
    }

    pub fn add_sample(&mut self, local_x: u32, local_y: u32, c: Spectrum) {
        let idx = (local_x + local_y * self.w) as usize;
        self.color[idx] += c;
        self.counts[idx] += 1;
    }

    /// First-hit feature values for the auxiliary rasters.
    pub fn set_aux(&mut self, local_x: u32, local_y: u32, albedo: Spectrum, normal: Spectrum) {
        let size = (self.w * self.h) as usize;
        let aux = self.aux.get_or_insert_with(|| {
            Box::new(AuxTile {
                albedo: vec![Spectrum::default(); size],
                normal: vec![Spectrum::default(); size],
            })
        });
        let idx = (local_x + local_y * self.w) as usize;
        aux.albedo[idx] = albedo;
        aux.normal[idx] = normal;
    }
}

struct ColorBuffer {
    sum: Vec<Spectrum>,
    counts: Vec<u32>,
    albedo: Vec<Spectrum>,
    normal: Vec<Spectrum>,
}

pub struct AtomicSplatBuffer {
    w: u32,
    buffer: Vec<[Atomic<f32>; 3]>,
}

fn atomic_add(dst: &Atomic<f32>, add: f32) {
    let mut current = dst.load(Ordering::Relaxed);
    loop {
        let desired = current + add;
        match dst.compare_exchange_weak(current, desired, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

impl AtomicSplatBuffer {
    pub fn new(w: u32, h: u32) -> Self {
        let mut buffer = Vec::with_capacity((w * h) as usize);
        for _ in 0..w * h {
            buffer.push([Atomic::new(0.0), Atomic::new(0.0), Atomic::new(0.0)]);
        }
        AtomicSplatBuffer { w, buffer }
    }

    pub fn splat(&self, x: u32, y: u32, value: Spectrum) {
        let px = &self.buffer[(x + y * self.w) as usize];
        atomic_add(&px[0], value.r);
        atomic_add(&px[1], value.g);
        atomic_add(&px[2], value.b);
    }

    /// Box-filtered splat at fractional pixel coordinates.
    pub fn splat_filtered(&self, pixel: Point2f, value: Spectrum, w: u32, h: u32) {
        let x = clamp_t(pixel.x as i64, 0, i64::from(w) - 1) as u32;
        let y = clamp_t(pixel.y as i64, 0, i64::from(h) - 1) as u32;
        self.splat(x, y, value);
    }

    pub fn get(&self, x: u32, y: u32) -> Spectrum {
        let px = &self.buffer[(x + y * self.w) as usize];
        Spectrum::rgb(
            px[0].load(Ordering::Relaxed),
            px[1].load(Ordering::Relaxed),
            px[2].load(Ordering::Relaxed),
        )
    }
}

pub struct Film {
    w: u32,
    h: u32,
    color: Mutex<ColorBuffer>,
    splat: AtomicSplatBuffer,
    color_buffer_weight: Atomic<f32>,
    splat_weight: Atomic<f32>,
}

impl Film {
    pub fn new(w: u32, h: u32) -> Self {
        Film {
            w,
            h,
            color: Mutex::new(ColorBuffer {
                sum: vec![Spectrum::default(); (w * h) as usize],
                counts: vec![0; (w * h) as usize],
                albedo: vec![Spectrum::default(); (w * h) as usize],
                normal: vec![Spectrum::default(); (w * h) as usize],
            }),
            splat: AtomicSplatBuffer::new(w, h),
            color_buffer_weight: Atomic::new(1.0),
            splat_weight: Atomic::new(0.0),
        }
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.w, self.h)
    }

    pub fn splat_buffer(&self) -> &AtomicSplatBuffer {
        &self.splat
    }

    pub fn splat(&self, pixel: Point2f, value: Spectrum) {
        self.splat.splat_filtered(pixel, value, self.w, self.h);
    }

    pub fn merge_tile(&self, tile: &FilmTile) {
        let mut color = self.color.lock().unwrap();
        for ty in 0..tile.h {
            let dst_row = ((tile.y + ty) * self.w + tile.x) as usize;
            let src_row = (ty * tile.w) as usize;
            for tx in 0..tile.w as usize {
                color.sum[dst_row + tx] += tile.color[src_row + tx];
                color.counts[dst_row + tx] += tile.counts[src_row + tx];
            }
            if let Some(aux) = &tile.aux {
                for tx in 0..tile.w as usize {
                    color.albedo[dst_row + tx] = aux.albedo[src_row + tx];
                    color.normal[dst_row + tx] = aux.normal[src_row + tx];
                }
            }
        }
    }

    /// First-hit feature rasters (albedo, normal mapped into [0, 1]).
    pub fn aux_rasters(&self) -> (Vec<Spectrum>, Vec<Spectrum>) {
        let color = self.color.lock().unwrap();
        (color.albedo.clone(), color.normal.clone())
    }

    pub fn set_color_buffer_weight(&self, weight: Float) {
        self.color_buffer_weight.store(weight, Ordering::Relaxed);
    }

    pub fn set_splat_weight(&self, weight: Float) {
        self.splat_weight.store(weight, Ordering::Relaxed);
    }

    /// Weighted combination of both buffers, per §framebuffer-egress.
    pub fn develop(&self) -> Vec<Spectrum> {
        let color = self.color.lock().unwrap();
        let cw = self.color_buffer_weight.load(Ordering::Relaxed);
        let sw = self.splat_weight.load(Ordering::Relaxed);
        let mut out = Vec::with_capacity((self.w * self.h) as usize);
        for y in 0..self.h {
            for x in 0..self.w {
                let idx = (x + y * self.w) as usize;
                let mean = if color.counts[idx] > 0 {
                    color.sum[idx] / color.counts[idx] as Float
                } else {
                    Spectrum::default()
                };
                out.push(mean * cw + self.splat.get(x, y) * sw);
            }
        }
        out
    }

    pub fn sample_count(&self, x: u32, y: u32) -> u32 {
        self.color.lock().unwrap().counts[(x + y * self.w) as usize]
    }

    /// Serialize both buffers for checkpointing; resuming restores the
    /// partial accumulation exactly.
    pub fn save_state<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        use byteorder::{LittleEndian, WriteBytesExt};
        out.write_u32::<LittleEndian>(self.w)?;
        out.write_u32::<LittleEndian>(self.h)?;
        let color = self.color.lock().unwrap();
        for (sum, count) in color.sum.iter().zip(&color.counts) {
            out.write_f32::<LittleEndian>(sum.r)?;
            out.write_f32::<LittleEndian>(sum.g)?;
            out.write_f32::<LittleEndian>(sum.b)?;
            out.write_u32::<LittleEndian>(*count)?;
        }
        for y in 0..self.h {
            for x in 0..self.w {
                let splat = self.splat.get(x, y);
                out.write_f32::<LittleEndian>(splat.r)?;
                out.write_f32::<LittleEndian>(splat.g)?;
                out.write_f32::<LittleEndian>(splat.b)?;
            }
        }
        Ok(())
    }

    pub fn load_state<R: std::io::Read>(&self, input: &mut R) -> std::io::Result<()> {
        use byteorder::{LittleEndian, ReadBytesExt};
        let w = input.read_u32::<LittleEndian>()?;
        let h = input.read_u32::<LittleEndian>()?;
        if w != self.w || h != self.h {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "framebuffer resolution mismatch",
            ));
        }
        let mut color = self.color.lock().unwrap();
        let ColorBuffer { sum: sums, counts, .. } = &mut *color;
        for (sum, count) in sums.iter_mut().zip(counts.iter_mut()) {
            sum.r = input.read_f32::<LittleEndian>()?;
            sum.g = input.read_f32::<LittleEndian>()?;
            sum.b = input.read_f32::<LittleEndian>()?;
            *count = input.read_u32::<LittleEndian>()?;
        }
        drop(color);
        for y in 0..self.h {
            for x in 0..self.w {
                let r = input.read_f32::<LittleEndian>()?;
                let g = input.read_f32::<LittleEndian>()?;
                let b = input.read_f32::<LittleEndian>()?;
                let current = self.splat.get(x, y);
                self.splat.splat(x, y, Spectrum::rgb(r, g, b) - current);
            }
        }
        Ok(())
    }

    pub fn save_outputs(
        &self,
        base: &Path,
        tonemap: Tonemap,
        hdr: bool,
    ) -> std::io::Result<()> {
        let pixels = self.develop();
        if hdr {
            write_hdr(&base.with_extension("hdr"), self.w, self.h, &pixels)?;
        }
        write_ldr(&base.with_extension("png"), self.w, self.h, &pixels, tonemap)
    }
}

pub fn write_hdr(path: &Path, w: u32, h: u32, pixels: &[Spectrum]) -> std::io::Result<()> {
    let file = std::fs::File::create(path)?;
    let encoder = image::codecs::hdr::HDREncoder::new(std::io::BufWriter::new(file));
    let data: Vec<image::Rgb<f32>> = pixels.iter().map(|p| image::Rgb([p.r, p.g, p.b])).collect();
    encoder
        .encode(&data, w as usize, h as usize)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}

pub fn write_ldr(
    path: &Path,
    w: u32,
    h: u32,
    pixels: &[Spectrum],
    tonemap: Tonemap,
) -> std::io::Result<()> {
    let mut data = Vec::with_capacity((w * h * 3) as usize);
    for pixel in pixels {
        let mapped = tonemap.apply(*pixel);
        for c in 0..3 {
            data.push((clamp_t(mapped[c], 0.0, 1.0) * 255.0 + 0.5) as u8);
        }
    }
    image::save_buffer(path, &data, w, h, image::ColorType::Rgb8)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn concurrent_splats_accumulate_exactly() {
        let film = Arc::new(Film::new(4, 4));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let film = film.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        film.splat(Point2f::new(1.2, 2.7), Spectrum::new(1.0));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let total = film.splat_buffer().get(1, 2);
        assert_eq!(total.r, 4000.0);
        assert_eq!(total.g, 4000.0);
    }

    #[test]
    fn develop_weights_buffers() {
        let film = Film::new(2, 1);
        let mut tile = FilmTile::new(0, 0, 1, 1);
        tile.add_sample(0, 0, Spectrum::new(2.0));
        tile.add_sample(0, 0, Spectrum::new(4.0));
        film.merge_tile(&tile);
        film.splat(Point2f::new(0.0, 0.0), Spectrum::new(8.0));
        film.set_color_buffer_weight(1.0);
        film.set_splat_weight(0.5);
        let pixels = film.develop();
        // mean color 3.0 plus half the splat
        assert!((pixels[0].r - 7.0).abs() < 1e-5);
        assert_eq!(pixels[1].r, 0.0);
    }

    #[test]
    fn save_outputs_writes_rasters() {
        let dir = tempfile::tempdir().unwrap();
        let film = Film::new(4, 3);
        let mut tile = FilmTile::new(0, 0, 4, 3);
        tile.add_sample(1, 1, Spectrum::new(0.5));
        film.merge_tile(&tile);
        let base = dir.path().join("out");
        film.save_outputs(&base, Tonemap::Gamma, true).unwrap();
        assert!(base.with_extension("png").exists());
        assert!(base.with_extension("hdr").exists());
    }

    #[test]
    fn tonemap_is_monotonic() {
        for tonemap in [Tonemap::Linear, Tonemap::Gamma, Tonemap::Reinhard] {
            let lo = tonemap.apply(Spectrum::new(0.2)).r;
            let hi = tonemap.apply(Spectrum::new(0.8)).r;
            assert!(lo < hi);
        }
    }
}
