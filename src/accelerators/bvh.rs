//! Binary BVH over boxed primitives (diced photon beams, photon planes).
//! SAH bucket splits, arena-allocated build nodes, flattened traversal.

// others
use typed_arena::Arena;
// lumen
use crate::core::geometry::{bnd3_union_bnd3f, bnd3_union_pnt3f, Bounds3f, Point3f, Ray, Vector3f};
use crate::core::lumen::Float;

#[derive(Debug, Default, Copy, Clone)]
pub struct BvhPrimitive {
    pub bounds: Bounds3f,
    pub centroid: Point3f,
    pub index: u32,
}

impl BvhPrimitive {
    pub fn new(bounds: Bounds3f, centroid: Point3f, index: u32) -> Self {
        BvhPrimitive {
            bounds,
            centroid,
            index,
        }
    }
}

struct BvhBuildNode<'a> {
    bounds: Bounds3f,
    children: Option<(&'a BvhBuildNode<'a>, &'a BvhBuildNode<'a>)>,
    split_axis: u8,
    first_prim_offset: u32,
    n_primitives: u32,
}

#[derive(Debug, Copy, Clone)]
struct BucketInfo {
    count: u32,
    bounds: Bounds3f,
}

impl Default for BucketInfo {
    fn default() -> Self {
        BucketInfo {
            count: 0,
            bounds: Bounds3f::default(),
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct LinearBvhNode {
    bounds: Bounds3f,
    /// primitive offset for leaves, second-child offset for interiors
    offset: u32,
    n_primitives: u16,
    axis: u8,
}

pub struct BinaryBvh {
    nodes: Vec<LinearBvhNode>,
    ordered_prims: Vec<u32>,
}

const N_BUCKETS: usize = 12;

impl BinaryBvh {
    pub fn new(mut prims: Vec<BvhPrimitive>, max_prims_in_node: u32) -> Self {
        if prims.is_empty() {
            return BinaryBvh {
                nodes: Vec::new(),
                ordered_prims: Vec::new(),
            };
        }
        let arena = Arena::new();
        let mut ordered_prims = Vec::with_capacity(prims.len());
        let mut total_nodes = 0_u32;
        let len = prims.len();
        let root = Self::recursive_build(
            &arena,
            &mut prims,
            0,
            len,
            max_prims_in_node,
            &mut total_nodes,
            &mut ordered_prims,
        );
        let mut nodes = vec![
            LinearBvhNode {
                bounds: root.bounds,
                offset: 0,
                n_primitives: 0,
                axis: 0,
            };
            total_nodes as usize
        ];
        let mut offset = 0_u32;
        Self::flatten(root, &mut nodes, &mut offset);
        BinaryBvh {
            nodes,
            ordered_prims,
        }
    }

    fn recursive_build<'a>(
        arena: &'a Arena<BvhBuildNode<'a>>,
        prims: &mut [BvhPrimitive],
        start: usize,
        end: usize,
        max_prims: u32,
        total_nodes: &mut u32,
        ordered_prims: &mut Vec<u32>,
    ) -> &'a BvhBuildNode<'a> {
        *total_nodes += 1;
        let mut bounds = prims[start].bounds;
        for prim in &prims[start + 1..end] {
            bounds = bnd3_union_bnd3f(&bounds, &prim.bounds);
        }
        let n_primitives = (end - start) as u32;

        if n_primitives == 1 {
            let first = ordered_prims.len() as u32;
            for prim in &prims[start..end] {
                ordered_prims.push(prim.index);
            }
            return arena.alloc(BvhBuildNode {
                bounds,
                children: None,
                split_axis: 0,
                first_prim_offset: first,
                n_primitives,
            });
        }

        let mut centroid_bounds = Bounds3f::from_point(prims[start].centroid);
        for prim in &prims[start + 1..end] {
            centroid_bounds = bnd3_union_pnt3f(&centroid_bounds, &prim.centroid);
        }
        let dim = centroid_bounds.maximum_extent();
        let extent = centroid_bounds.diagonal()[dim];

        let mut mid = (start + end) / 2;
        let mut split_found = false;
        if extent > 0.0 {
            // SAH over fixed buckets
            let mut buckets = [BucketInfo::default(); N_BUCKETS];
            let bucket_of = |c: &Point3f| -> usize {
                let b =
                    ((c[dim] - centroid_bounds.p_min[dim]) / extent * N_BUCKETS as Float) as usize;
                b.min(N_BUCKETS - 1)
            };
            for prim in &prims[start..end] {
                let b = bucket_of(&prim.centroid);
                buckets[b].count += 1;
                buckets[b].bounds = bnd3_union_bnd3f(&buckets[b].bounds, &prim.bounds);
            }

            let mut best_cost = Float::INFINITY;
            let mut best_split = 0;
            for i in 0..N_BUCKETS - 1 {
                let mut b0 = Bounds3f::default();
                let mut count0 = 0;
                for bucket in &buckets[..=i] {
                    b0 = bnd3_union_bnd3f(&b0, &bucket.bounds);
                    count0 += bucket.count;
                }
                let mut b1 = Bounds3f::default();
                let mut count1 = 0;
                for bucket in &buckets[i + 1..] {
                    b1 = bnd3_union_bnd3f(&b1, &bucket.bounds);
                    count1 += bucket.count;
                }
                if count0 == 0 || count1 == 0 {
                    continue;
                }
                let cost = 0.125
                    + (count0 as Float * b0.surface_area() + count1 as Float * b1.surface_area())
                        / bounds.surface_area().max(1e-12);
                if cost < best_cost {
                    best_cost = cost;
                    best_split = i;
                }
            }

            let leaf_cost = n_primitives as Float;
            if n_primitives <= max_prims && leaf_cost <= best_cost {
                let first = ordered_prims.len() as u32;
                for prim in &prims[start..end] {
                    ordered_prims.push(prim.index);
                }
                return arena.alloc(BvhBuildNode {
                    bounds,
                    children: None,
                    split_axis: 0,
                    first_prim_offset: first,
                    n_primitives,
                });
            }

            let split_at =
                start + partition(&mut prims[start..end], |p| bucket_of(&p.centroid) <= best_split);
            if split_at > start && split_at < end {
                mid = split_at;
                split_found = true;
            }
        }
        if !split_found && n_primitives <= max_prims {
            // degenerate centroids: either leaf out or split down the middle
            let first = ordered_prims.len() as u32;
            for prim in &prims[start..end] {
                ordered_prims.push(prim.index);
            }
            return arena.alloc(BvhBuildNode {
                bounds,
                children: None,
                split_axis: 0,
                first_prim_offset: first,
                n_primitives,
            });
        }

        let left = Self::recursive_build(
            arena,
            prims,
            start,
            mid,
            max_prims,
            total_nodes,
            ordered_prims,
        );
        let right =
            Self::recursive_build(arena, prims, mid, end, max_prims, total_nodes, ordered_prims);
        arena.alloc(BvhBuildNode {
            bounds: bnd3_union_bnd3f(&left.bounds, &right.bounds),
            children: Some((left, right)),
            split_axis: dim as u8,
            first_prim_offset: 0,
            n_primitives: 0,
        })
    }

    fn flatten(node: &BvhBuildNode, nodes: &mut [LinearBvhNode], offset: &mut u32) -> u32 {
        let my_offset = *offset;
        *offset += 1;
        nodes[my_offset as usize].bounds = node.bounds;
        match node.children {
            None => {
                nodes[my_offset as usize].offset = node.first_prim_offset;
                nodes[my_offset as usize].n_primitives = node.n_primitives as u16;
            }
            Some((left, right)) => {
                nodes[my_offset as usize].axis = node.split_axis;
                nodes[my_offset as usize].n_primitives = 0;
                Self::flatten(left, nodes, offset);
                let second = Self::flatten(right, nodes, offset);
                nodes[my_offset as usize].offset = second;
            }
        }
        my_offset
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Visit each primitive of every leaf whose box the ray touches; the
    /// callback receives the clipped `[t_min, t_max]` and the leaf bounds.
    pub fn trace<F: FnMut(u32, Float, Float, &Bounds3f)>(&self, ray: &Ray, mut visitor: F) {
        if self.nodes.is_empty() {
            return;
        }
        let inv_dir = Vector3f::new(1.0 / ray.d.x, 1.0 / ray.d.y, 1.0 / ray.d.z);
        let mut stack = [0_u32; 64];
        let mut stack_len = 0_usize;
        let mut current = 0_u32;
        loop {
            let node = &self.nodes[current as usize];
            let (t0, t1) = node.bounds.intersect_interval(&ray.o, &inv_dir);
            let t_min = t0.max(ray.t_min);
            let t_max = t1.min(ray.t_max);
            if t_min <= t_max {
                if node.n_primitives > 0 {
                    for i in 0..node.n_primitives as u32 {
                        let prim = self.ordered_prims[(node.offset + i) as usize];
                        visitor(prim, t_min, t_max, &node.bounds);
                    }
                } else {
                    stack[stack_len] = node.offset;
                    stack_len += 1;
                    current += 1;
                    continue;
                }
            }
            if stack_len == 0 {
                break;
            }
            stack_len -= 1;
            current = stack[stack_len];
        }
    }
}

fn partition<T, F: Fn(&T) -> bool>(slice: &mut [T], pred: F) -> usize {
    let mut first = 0;
    for i in 0..slice.len() {
        if pred(&slice[i]) {
            slice.swap(first, i);
            first += 1;
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::UniformSampler;

    fn boxes(n: usize, seed: u64) -> Vec<BvhPrimitive> {
        let mut rng = UniformSampler::new(seed);
        (0..n)
            .map(|i| {
                let c = Point3f::new(
                    rng.next_1d() * 20.0,
                    rng.next_1d() * 20.0,
                    rng.next_1d() * 20.0,
                );
                let mut b = Bounds3f::from_point(c);
                b.expand(0.25);
                BvhPrimitive::new(b, c, i as u32)
            })
            .collect()
    }

    #[test]
    fn trace_finds_every_intersected_box() {
        let prims = boxes(200, 5);
        let reference = prims.clone();
        let bvh = BinaryBvh::new(prims, 4);

        let ray = Ray::new(
            Point3f::new(-1.0, 10.0, 10.0),
            Vector3f::new(1.0, 0.02, -0.01).normalize(),
        );
        let inv_dir = Vector3f::new(1.0 / ray.d.x, 1.0 / ray.d.y, 1.0 / ray.d.z);

        let mut expected: Vec<u32> = reference
            .iter()
            .filter(|p| {
                let (t0, t1) = p.bounds.intersect_interval(&ray.o, &inv_dir);
                t0 <= t1 && t1 >= ray.t_min && t0 <= ray.t_max
            })
            .map(|p| p.index)
            .collect();
        expected.sort_unstable();

        let mut visited = Vec::new();
        bvh.trace(&ray, |idx, _, _, _| visited.push(idx));
        visited.sort_unstable();
        visited.dedup();

        // traversal may report extra candidates, but never miss one
        for idx in &expected {
            assert!(visited.contains(idx), "missing box {}", idx);
        }
    }

    #[test]
    fn empty_bvh_is_silent() {
        let bvh = BinaryBvh::new(Vec::new(), 4);
        let mut count = 0;
        bvh.trace(
            &Ray::new(Point3f::default(), Vector3f::new(0.0, 0.0, 1.0)),
            |_, _, _, _| count += 1,
        );
        assert_eq!(count, 0);
    }
}
