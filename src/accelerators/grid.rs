//! Memory-budgeted uniform grid over photon beams and planes.
//!
//! Cell lists are built in two passes (count, prefix-sum, fill) and walked
//! with a 3-D DDA at query time. A primitive overlapping several cells is
//! reported once per cell; callers deduplicate with mailboxes.

// lumen
use crate::core::geometry::{Bounds3f, Point3f, Ray, Vector3f};
use crate::core::lumen::Float;

#[derive(Debug, Copy, Clone)]
pub struct GridPrimitive {
    pub idx: u32,
    pub p0: Point3f,
    pub p1: Point3f,
    pub p2: Point3f,
    pub p3: Point3f,
    pub r: Float,
    pub is_beam: bool,
}

impl GridPrimitive {
    pub fn beam(idx: u32, p0: Point3f, p1: Point3f, r: Float) -> Self {
        GridPrimitive {
            idx,
            p0,
            p1,
            p2: Point3f::default(),
            p3: Point3f::default(),
            r,
            is_beam: true,
        }
    }

    pub fn quad(idx: u32, p0: Point3f, p1: Point3f, p2: Point3f, p3: Point3f, r: Float) -> Self {
        GridPrimitive {
            idx,
            p0,
            p1,
            p2,
            p3,
            r,
            is_beam: false,
        }
    }
}

pub struct GridAccel {
    offset: Vector3f,
    scale: Vector3f,
    sizes: [i64; 3],
    f_sizes: Vector3f,
    y_stride: i64,
    z_stride: i64,
    list_offsets: Vec<u32>,
    lists: Vec<u32>,
}

impl GridAccel {
    pub fn new(bounds: Bounds3f, mem_budget_kb: u64, prims: Vec<GridPrimitive>) -> Self {
        let diag = {
            let mut d = bounds.diagonal();
            d.x = d.x.max(1e-4);
            d.y = d.y.max(1e-4);
            d.z = d.z.max(1e-4);
            d
        };
        let rel_diag = diag / diag.max_component();
        let max_cells = ((mem_budget_kb << 10) as f64
            / (4.0 * f64::from(rel_diag.x * rel_diag.y * rel_diag.z)))
        .cbrt() as Float;
        let sizes = [
            ((rel_diag.x * max_cells) as i64).max(1),
            ((rel_diag.y * max_cells) as i64).max(1),
            ((rel_diag.z * max_cells) as i64).max(1),
        ];
        let offset = bounds.p_min.to_vec();
        let scale = Vector3f::new(
            sizes[0] as Float / diag.x,
            sizes[1] as Float / diag.y,
            sizes[2] as Float / diag.z,
        );
        let y_stride = sizes[0];
        let z_stride = sizes[0] * sizes[1];
        let cell_count = (z_stride * sizes[2]) as usize;

        tracing::debug!(
            cells_x = sizes[0],
            cells_y = sizes[1],
            cells_z = sizes[2],
            prims = prims.len(),
            "building grid accelerator"
        );

        let mut grid = GridAccel {
            offset,
            scale,
            sizes,
            f_sizes: Vector3f::new(sizes[0] as Float, sizes[1] as Float, sizes[2] as Float),
            y_stride,
            z_stride,
            list_offsets: vec![0; cell_count + 1],
            lists: Vec::new(),
        };
        grid.build(prims, cell_count);
        grid
    }

    fn cell_idx(&self, x: i64, y: i64, z: i64) -> usize {
        (x + y * self.y_stride + z * self.z_stride) as usize
    }

    fn build(&mut self, prims: Vec<GridPrimitive>, cell_count: usize) {
        let mut counts = vec![0_u32; cell_count + 1];
        for prim in &prims {
            self.iterate_cells(prim, |idx| counts[idx] += 1);
        }
        let mut prefix = 0_u32;
        for (dst, count) in self.list_offsets.iter_mut().zip(counts.iter()) {
            prefix += *count;
            *dst = prefix;
        }
        // the last offset equals the total entry count
        let total = prefix;
        self.list_offsets[cell_count] = total;

        let mut lists = vec![0_u32; total as usize];
        let mut cursors = self.list_offsets.clone();
        for prim in &prims {
            let idx = prim.idx;
            let cursors = &mut cursors;
            let lists = &mut lists;
            self.iterate_cells(prim, |cell| {
                cursors[cell] -= 1;
                lists[cursors[cell] as usize] = idx;
            });
        }
        self.list_offsets = cursors;
        // cursors moved each cell's offset back to its list start, so
        // list_offsets[c]..list_offsets[c + 1] spans cell c
        self.list_offsets[cell_count] = total;
        self.lists = lists;
    }

    /// Conservative cell coverage of a primitive.
    fn iterate_cells<F: FnMut(usize)>(&self, prim: &GridPrimitive, mut body: F) {
        let radius = Vector3f::new(
            prim.r * self.scale.x,
            prim.r * self.scale.y,
            prim.r * self.scale.z,
        );
        let to_grid = |p: &Point3f| -> Vector3f {
            Vector3f::new(
                (p.x - self.offset.x) * self.scale.x,
                (p.y - self.offset.y) * self.scale.y,
                (p.z - self.offset.z) * self.scale.z,
            )
        };
        let mut bounds = Bounds3f::default();
        let corners: &[Point3f] = if prim.is_beam {
            &[prim.p0, prim.p1]
        } else {
            &[prim.p0, prim.p1, prim.p2, prim.p3]
        };
        for corner in corners {
            let g = to_grid(corner);
            bounds.grow_pnt(&Point3f::new(g.x - radius.x, g.y - radius.y, g.z - radius.z));
            bounds.grow_pnt(&Point3f::new(g.x + radius.x, g.y + radius.y, g.z + radius.z));
        }
        let min_i = [
            (bounds.p_min.x as i64).max(0),
            (bounds.p_min.y as i64).max(0),
            (bounds.p_min.z as i64).max(0),
        ];
        let max_i = [
            (bounds.p_max.x as i64).min(self.sizes[0] - 1),
            (bounds.p_max.y as i64).min(self.sizes[1] - 1),
            (bounds.p_max.z as i64).min(self.sizes[2] - 1),
        ];

        if prim.is_beam {
            // slab test per cell keeps long diagonal beams from flooding
            // their whole AABB
            let g0 = to_grid(&prim.p0);
            let g1 = to_grid(&prim.p1);
            let d = g1 - g0;
            for z in min_i[2]..=max_i[2] {
                for y in min_i[1]..=max_i[1] {
                    for x in min_i[0]..=max_i[0] {
                        let cell_min = Vector3f::new(x as Float, y as Float, z as Float);
                        let mut t_min = 0.0 as Float;
                        let mut t_max = 1.0 as Float;
                        let mut overlap = true;
                        for axis in 0..3 {
                            let lo = cell_min[axis] - radius[axis] - g0[axis];
                            let hi = cell_min[axis] + 1.0 + radius[axis] - g0[axis];
                            if d[axis].abs() < 1e-9 {
                                if lo > 0.0 || hi < 0.0 {
                                    overlap = false;
                                    break;
                                }
                            } else {
                                let inv = 1.0 / d[axis];
                                let (a, b) = if inv >= 0.0 {
                                    (lo * inv, hi * inv)
                                } else {
                                    (hi * inv, lo * inv)
                                };
                                t_min = t_min.max(a);
                                t_max = t_max.min(b);
                                if t_min > t_max {
                                    overlap = false;
                                    break;
                                }
                            }
                        }
                        if overlap {
                            body(self.cell_idx(x, y, z));
                        }
                    }
                }
            }
        } else {
            for z in min_i[2]..=max_i[2] {
                for y in min_i[1]..=max_i[1] {
                    for x in min_i[0]..=max_i[0] {
                        body(self.cell_idx(x, y, z));
                    }
                }
            }
        }
    }

    /// DDA walk; the visitor receives (primitive index, cell tMin, cell tMax)
    /// in world ray parameterization.
    pub fn trace<F: FnMut(u32, Float, Float)>(&self, ray: &Ray, mut visitor: F) {
        let o = Vector3f::new(
            (ray.o.x - self.offset.x) * self.scale.x,
            (ray.o.y - self.offset.y) * self.scale.y,
            (ray.o.z - self.offset.z) * self.scale.z,
        );
        let d = Vector3f::new(
            ray.d.x * self.scale.x,
            ray.d.y * self.scale.y,
            ray.d.z * self.scale.z,
        );

        let mut t_min = ray.t_min;
        let mut t_max = ray.t_max;
        for axis in 0..3 {
            if d[axis].abs() < 1e-12 {
                if o[axis] < 0.0 || o[axis] > self.f_sizes[axis] {
                    return;
                }
                continue;
            }
            let inv = 1.0 / d[axis];
            let t0 = -o[axis] * inv;
            let t1 = (self.f_sizes[axis] - o[axis]) * inv;
            let (t0, t1) = if t0 <= t1 { (t0, t1) } else { (t1, t0) };
            t_min = t_min.max(t0);
            t_max = t_max.min(t1);
        }
        if t_min > t_max {
            return;
        }

        let entry = o + d * (t_min + 1e-5);
        let mut cell = [
            (entry.x as i64).max(0).min(self.sizes[0] - 1),
            (entry.y as i64).max(0).min(self.sizes[1] - 1),
            (entry.z as i64).max(0).min(self.sizes[2] - 1),
        ];
        let step: [i64; 3] = [
            if d.x >= 0.0 { 1 } else { -1 },
            if d.y >= 0.0 { 1 } else { -1 },
            if d.z >= 0.0 { 1 } else { -1 },
        ];
        let mut t_next = [Float::INFINITY; 3];
        let mut t_delta = [Float::INFINITY; 3];
        for axis in 0..3 {
            if d[axis].abs() < 1e-12 {
                continue;
            }
            let inv = 1.0 / d[axis];
            let boundary = if step[axis] > 0 {
                cell[axis] as Float + 1.0
            } else {
                cell[axis] as Float
            };
            t_next[axis] = (boundary - o[axis]) * inv;
            t_delta[axis] = inv.abs();
        }

        let mut t_current = t_min;
        loop {
            let exit_axis = if t_next[0] < t_next[1] {
                if t_next[0] < t_next[2] {
                    0
                } else {
                    2
                }
            } else if t_next[1] < t_next[2] {
                1
            } else {
                2
            };
            let t_exit = t_next[exit_axis].min(t_max);

            let idx = self.cell_idx(cell[0], cell[1], cell[2]);
            let start = self.list_offsets[idx] as usize;
            let end = self.list_offsets[idx + 1] as usize;
            for &prim in &self.lists[start..end] {
                visitor(prim, t_current, t_exit);
            }

            if t_next[exit_axis] > t_max {
                break;
            }
            t_current = t_next[exit_axis];
            t_next[exit_axis] += t_delta[exit_axis];
            cell[exit_axis] += step[exit_axis];
            if cell[exit_axis] < 0 || cell[exit_axis] >= self.sizes[exit_axis] {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_grid(prims: Vec<GridPrimitive>) -> GridAccel {
        let bounds = Bounds3f {
            p_min: Point3f::new(0.0, 0.0, 0.0),
            p_max: Point3f::new(10.0, 10.0, 10.0),
        };
        GridAccel::new(bounds, 64, prims)
    }

    #[test]
    fn ray_through_beam_cell_reports_beam() {
        let grid = test_grid(vec![GridPrimitive::beam(
            7,
            Point3f::new(5.0, 0.5, 5.0),
            Point3f::new(5.0, 9.5, 5.0),
            0.25,
        )]);
        let ray = Ray::new_segment(
            Point3f::new(-1.0, 5.0, 5.0),
            Vector3f::new(1.0, 0.0, 0.0),
            0.0,
            20.0,
        );
        let mut seen = Vec::new();
        grid.trace(&ray, |idx, t0, t1| {
            assert!(t0 <= t1 + 1e-4);
            seen.push(idx);
        });
        assert!(seen.contains(&7));
    }

    #[test]
    fn ray_missing_all_cells_is_silent() {
        let grid = test_grid(vec![GridPrimitive::beam(
            1,
            Point3f::new(1.0, 1.0, 1.0),
            Point3f::new(2.0, 1.0, 1.0),
            0.1,
        )]);
        let ray = Ray::new_segment(
            Point3f::new(-5.0, 20.0, 20.0),
            Vector3f::new(1.0, 0.0, 0.0),
            0.0,
            10.0,
        );
        let mut count = 0;
        grid.trace(&ray, |_, _, _| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn cell_ranges_partition_entries() {
        let grid = test_grid(vec![
            GridPrimitive::beam(0, Point3f::new(1.0, 1.0, 1.0), Point3f::new(9.0, 9.0, 9.0), 0.2),
            GridPrimitive::quad(
                1,
                Point3f::new(2.0, 2.0, 2.0),
                Point3f::new(4.0, 2.0, 2.0),
                Point3f::new(4.0, 4.0, 2.0),
                Point3f::new(2.0, 4.0, 2.0),
                0.0,
            ),
        ]);
        for window in grid.list_offsets.windows(2) {
            assert!(window[0] <= window[1]);
        }
        assert_eq!(
            *grid.list_offsets.last().unwrap() as usize,
            grid.lists.len()
        );
    }
}
