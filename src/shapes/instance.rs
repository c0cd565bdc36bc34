//! Packed instance blobs: many rigid copies of a small set of master
//! primitives, stored position-quantized on disk.
//!
//! File layout (little endian, no padding):
//!   u32 instance count
//!   u32 compression flags (bit 0: packed entries)
//!   f32[6] world AABB (min, max)
//!   per instance, packed: 3xu32 holding 3x21-bit position, 8-bit rotation
//!     angle, 12-bit axis-x, 12-bit axis-y
//!   per instance, unpacked: f32[3] position, f32[3] axis, f32 angle
//!   u8 master id per instance

// std
use std::io::Read;
// others
use byteorder::{LittleEndian, ReadBytesExt};
// lumen
use crate::core::geometry::{Bounds3f, Normal3f, Point3f, Ray, Vector3f};
use crate::core::lumen::{Float, PI};
use crate::shapes::{IntersectionInfo, Primitive};

const FLAG_PACKED: u32 = 1;
const POS_BITS: u32 = 21;
const POS_SCALE: Float = ((1u32 << POS_BITS) - 1) as Float;

#[derive(Debug, Clone)]
pub struct InstanceTransform {
    pub offset: Vector3f,
    rot: [[Float; 3]; 3],
    inv_rot: [[Float; 3]; 3],
}

impl InstanceTransform {
    pub fn new(offset: Vector3f, axis: Vector3f, angle: Float) -> Self {
        let rot = rotation_matrix(axis, angle);
        let inv_rot = transpose(&rot);
        InstanceTransform {
            offset,
            rot,
            inv_rot,
        }
    }

    fn to_local_point(&self, p: &Point3f) -> Point3f {
        let rel = p.to_vec() - self.offset;
        let v = mat_mul(&self.inv_rot, &rel);
        Point3f::new(v.x, v.y, v.z)
    }

    fn to_local_vec(&self, v: &Vector3f) -> Vector3f {
        mat_mul(&self.inv_rot, v)
    }

    fn to_world_point(&self, p: &Point3f) -> Point3f {
        let v = mat_mul(&self.rot, &p.to_vec()) + self.offset;
        Point3f::new(v.x, v.y, v.z)
    }

    fn to_world_vec(&self, v: &Vector3f) -> Vector3f {
        mat_mul(&self.rot, v)
    }
}

fn rotation_matrix(axis: Vector3f, angle: Float) -> [[Float; 3]; 3] {
    let a = if axis.length_squared() > 1e-12 {
        axis.normalize()
    } else {
        Vector3f::new(0.0, 0.0, 1.0)
    };
    let (s, c) = angle.sin_cos();
    let t = 1.0 - c;
    [
        [
            t * a.x * a.x + c,
            t * a.x * a.y - s * a.z,
            t * a.x * a.z + s * a.y,
        ],
        [
            t * a.x * a.y + s * a.z,
            t * a.y * a.y + c,
            t * a.y * a.z - s * a.x,
        ],
        [
            t * a.x * a.z - s * a.y,
            t * a.y * a.z + s * a.x,
            t * a.z * a.z + c,
        ],
    ]
}

fn transpose(m: &[[Float; 3]; 3]) -> [[Float; 3]; 3] {
    [
        [m[0][0], m[1][0], m[2][0]],
        [m[0][1], m[1][1], m[2][1]],
        [m[0][2], m[1][2], m[2][2]],
    ]
}

fn mat_mul(m: &[[Float; 3]; 3], v: &Vector3f) -> Vector3f {
    Vector3f::new(
        m[0][0] * v.x + m[0][1] * v.y + m[0][2] * v.z,
        m[1][0] * v.x + m[1][1] * v.y + m[1][2] * v.z,
        m[2][0] * v.x + m[2][1] * v.y + m[2][2] * v.z,
    )
}

/// A 96-bit cursor over the three packed words of one instance entry.
struct BitReader {
    words: [u32; 3],
    bit: u32,
}

impl BitReader {
    fn new(words: [u32; 3]) -> Self {
        BitReader { words, bit: 0 }
    }
    fn read(&mut self, bits: u32) -> u32 {
        let mut value = 0_u32;
        for i in 0..bits {
            let pos = self.bit + i;
            let word = (pos / 32) as usize;
            let offset = pos % 32;
            value |= ((self.words[word] >> offset) & 1) << i;
        }
        self.bit += bits;
        value
    }
}

pub struct InstanceFile {
    pub bounds: Bounds3f,
    pub master_ids: Vec<u8>,
    pub transforms: Vec<InstanceTransform>,
}

pub fn load_instances<R: Read>(input: &mut R) -> std::io::Result<InstanceFile> {
    let count = input.read_u32::<LittleEndian>()? as usize;
    let flags = input.read_u32::<LittleEndian>()?;
    let mut aabb = [0.0_f32; 6];
    for value in aabb.iter_mut() {
        *value = input.read_f32::<LittleEndian>()?;
    }
    let bounds = Bounds3f {
        p_min: Point3f::new(aabb[0], aabb[1], aabb[2]),
        p_max: Point3f::new(aabb[3], aabb[4], aabb[5]),
    };
    let diag = bounds.diagonal();

    let mut transforms = Vec::with_capacity(count);
    for _ in 0..count {
        if flags & FLAG_PACKED != 0 {
            let words = [
                input.read_u32::<LittleEndian>()?,
                input.read_u32::<LittleEndian>()?,
                input.read_u32::<LittleEndian>()?,
            ];
            let mut reader = BitReader::new(words);
            let qx = reader.read(POS_BITS) as Float / POS_SCALE;
            let qy = reader.read(POS_BITS) as Float / POS_SCALE;
            let qz = reader.read(POS_BITS) as Float / POS_SCALE;
            let angle = reader.read(8) as Float / 255.0 * (2.0 * PI);
            let ax = reader.read(12) as Float / 4095.0 * 2.0 - 1.0;
            let ay = reader.read(12) as Float / 4095.0 * 2.0 - 1.0;
            let az = (1.0 - ax * ax - ay * ay).max(0.0).sqrt();
            let offset = Vector3f::new(
                bounds.p_min.x + qx * diag.x,
                bounds.p_min.y + qy * diag.y,
                bounds.p_min.z + qz * diag.z,
            );
            transforms.push(InstanceTransform::new(
                offset,
                Vector3f::new(ax, ay, az),
                angle,
            ));
        } else {
            let mut values = [0.0_f32; 7];
            for value in values.iter_mut() {
                *value = input.read_f32::<LittleEndian>()?;
            }
            transforms.push(InstanceTransform::new(
                Vector3f::new(values[0], values[1], values[2]),
                Vector3f::new(values[3], values[4], values[5]),
                values[6],
            ));
        }
    }

    let mut master_ids = vec![0_u8; count];
    input.read_exact(&mut master_ids)?;

    Ok(InstanceFile {
        bounds,
        master_ids,
        transforms,
    })
}

#[derive(Debug)]
pub struct InstanceSet {
    pub masters: Vec<Box<Primitive>>,
    pub master_ids: Vec<u8>,
    pub transforms: Vec<InstanceTransform>,
    pub bounds: Bounds3f,
}

impl InstanceSet {
    pub fn intersect(&self, ray: &mut Ray) -> Option<IntersectionInfo> {
        let mut best: Option<IntersectionInfo> = None;
        for (transform, &master_id) in self.transforms.iter().zip(&self.master_ids) {
            let master = match self.masters.get(master_id as usize) {
                Some(m) => m,
                None => continue,
            };
            let mut local = *ray;
            local.o = transform.to_local_point(&ray.o);
            local.d = transform.to_local_vec(&ray.d);
            if let Some(mut info) = master.intersect(&mut local) {
                ray.t_max = local.t_max;
                info.p = transform.to_world_point(&info.p);
                info.ng = Normal3f::from(transform.to_world_vec(&info.ng.to_vec()));
                info.ns = info.ng;
                best = Some(info);
            }
        }
        best
    }

    pub fn occluded(&self, ray: &Ray) -> bool {
        let mut probe = *ray;
        self.intersect(&mut probe).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};

    fn write_bits(words: &mut [u32; 3], bit: &mut u32, value: u32, bits: u32) {
        for i in 0..bits {
            let pos = *bit + i;
            words[(pos / 32) as usize] |= ((value >> i) & 1) << (pos % 32);
        }
        *bit += bits;
    }

    #[test]
    fn packed_roundtrip_recovers_position() {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(1).unwrap();
        buf.write_u32::<LittleEndian>(FLAG_PACKED).unwrap();
        for &v in &[0.0_f32, 0.0, 0.0, 10.0, 10.0, 10.0] {
            buf.write_f32::<LittleEndian>(v).unwrap();
        }
        let mut words = [0_u32; 3];
        let mut bit = 0;
        // center of the AABB, identity-ish rotation
        let half = (1u32 << (POS_BITS - 1)) - 1;
        write_bits(&mut words, &mut bit, half, POS_BITS);
        write_bits(&mut words, &mut bit, half, POS_BITS);
        write_bits(&mut words, &mut bit, half, POS_BITS);
        write_bits(&mut words, &mut bit, 0, 8);
        write_bits(&mut words, &mut bit, 2047, 12);
        write_bits(&mut words, &mut bit, 2047, 12);
        for &w in &words {
            buf.write_u32::<LittleEndian>(w).unwrap();
        }
        buf.push(0_u8);

        let file = load_instances(&mut &buf[..]).unwrap();
        assert_eq!(file.transforms.len(), 1);
        assert_eq!(file.master_ids, vec![0]);
        let offset = file.transforms[0].offset;
        assert!((offset.x - 5.0).abs() < 0.01);
        assert!((offset.y - 5.0).abs() < 0.01);
        assert!((offset.z - 5.0).abs() < 0.01);
    }

    #[test]
    fn unpacked_entries_parse() {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(1).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        for &v in &[0.0_f32, 0.0, 0.0, 1.0, 1.0, 1.0] {
            buf.write_f32::<LittleEndian>(v).unwrap();
        }
        for &v in &[0.5_f32, 0.25, 0.125, 0.0, 0.0, 1.0, 0.0] {
            buf.write_f32::<LittleEndian>(v).unwrap();
        }
        buf.push(3_u8);

        let file = load_instances(&mut &buf[..]).unwrap();
        assert_eq!(file.master_ids, vec![3]);
        assert!((file.transforms[0].offset.x - 0.5).abs() < 1e-6);
    }
}
