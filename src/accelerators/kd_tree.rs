//! In-place k-d tree over photon records.
//!
//! Nodes are the photons themselves; children occupy contiguous slots
//! addressed through the 28-bit packed child index, so the finished tree is
//! just the compacted photon array reordered. Large subtrees fork their
//! build to the thread pool.

// std
use std::sync::Arc;
// lumen
use crate::core::geometry::{Bounds3f, Point3f, Vector3f};
use crate::core::lumen::Float;
use crate::renderer::thread_pool::ThreadPool;

/// Subtrees above this size are forked to the pool during construction.
const PARALLEL_BUILD_THRESHOLD: u32 = 100_000;

pub trait TreePhoton: Copy + Send + Sync + 'static {
    fn pos(&self) -> Point3f;
    fn set_split_info(&mut self, child_idx: u32, split_dim: u32, child_count: u32);
    fn has_left_child(&self) -> bool;
    fn has_right_child(&self) -> bool;
    fn split_dim(&self) -> u32;
    fn child_idx(&self) -> u32;
}

pub trait VolumeTreePhoton: TreePhoton {
    fn radius_sq(&self) -> Float;
    fn set_radius_sq(&mut self, radius_sq: Float);
    fn bounds(&self) -> Bounds3f;
    fn set_bounds(&mut self, bounds: Bounds3f);
}

/// Raw pointer wrapper used to fork disjoint subranges to the pool. The
/// build only ever touches `dst` and `[start, end)` of a call, and sibling
/// calls receive disjoint such sets.
struct SendNodes<T>(*mut T);
unsafe impl<T> Send for SendNodes<T> {}
unsafe impl<T> Sync for SendNodes<T> {}
impl<T> Clone for SendNodes<T> {
    fn clone(&self) -> Self {
        SendNodes(self.0)
    }
}
impl<T> Copy for SendNodes<T> {}

fn recursive_tree_build<T: TreePhoton>(
    nodes: SendNodes<T>,
    dst: u32,
    start: u32,
    end: u32,
    pool: Option<&Arc<ThreadPool>>,
) {
    let slice = nodes.0;
    unsafe {
        if end == start {
            (*slice.add(dst as usize)).set_split_info(0, 0, 0);
            return;
        } else if end - start == 1 {
            if (*slice.add(dst as usize)).pos().x < (*slice.add(start as usize)).pos().x {
                std::ptr::swap(slice.add(dst as usize), slice.add(start as usize));
            }
            (*slice.add(dst as usize)).set_split_info(start, 0, 1);
            (*slice.add(start as usize)).set_split_info(0, 0, 0);
            return;
        }

        let mut bounds = Bounds3f::from_point((*slice.add(dst as usize)).pos());
        for i in start..end {
            bounds.grow_pnt(&(*slice.add(i as usize)).pos());
        }
        let split_dim = bounds.maximum_extent();

        let range = std::slice::from_raw_parts_mut(slice.add(start as usize), (end - start) as usize);
        range.sort_unstable_by(|a, b| {
            a.pos()[split_dim]
                .partial_cmp(&b.pos()[split_dim])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let split_idx = start + (end - start + 1) / 2;
        let right_plane = (*slice.add(split_idx as usize)).pos()[split_dim];
        let head_plane = (*slice.add(dst as usize)).pos()[split_dim];
        let left_plane = (*slice.add(split_idx as usize - 1)).pos()[split_dim];

        if head_plane < left_plane || head_plane > right_plane {
            let swap_idx = if head_plane > right_plane {
                split_idx
            } else {
                split_idx - 1
            };
            std::ptr::swap(slice.add(dst as usize), slice.add(swap_idx as usize));
        }

        let child_idx = start;
        if split_idx > child_idx + 1 {
            std::ptr::swap(slice.add(child_idx as usize + 1), slice.add(split_idx as usize));
        }

        let mut forked = None;
        if split_idx - start > PARALLEL_BUILD_THRESHOLD {
            if let Some(pool) = pool {
                let pool_for_child = pool.clone();
                let nodes_copy = nodes;
                forked = Some(pool.enqueue(
                    Box::new(move |_, _, _| {
                        recursive_tree_build(
                            nodes_copy,
                            child_idx,
                            start + 2,
                            split_idx + 1,
                            Some(&pool_for_child),
                        );
                    }),
                    1,
                    None,
                ));
            }
        }
        if forked.is_none() {
            recursive_tree_build(nodes, child_idx, start + 2, split_idx + 1, pool);
        }
        recursive_tree_build(nodes, child_idx + 1, split_idx + 1, end, pool);

        if let (Some(group), Some(pool)) = (forked, pool) {
            if !group.is_done() {
                pool.yield_group(&group);
            }
        }

        (*slice.add(dst as usize)).set_split_info(child_idx, split_dim as u32, 2);
    }
}

pub struct KdTree<T: TreePhoton> {
    nodes: Vec<T>,
    tree_end: u32,
}

impl<T: TreePhoton> KdTree<T> {
    /// Build over the compacted prefix `[0, range_end)` of `photons`.
    pub fn build(mut photons: Vec<T>, range_end: u32, pool: Option<&Arc<ThreadPool>>) -> Self {
        if range_end > 0 {
            let nodes = SendNodes(photons.as_mut_ptr());
            recursive_tree_build(nodes, 0, 1, range_end, pool);
        }
        KdTree {
            nodes: photons,
            tree_end: range_end,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tree_end == 0
    }

    pub fn len(&self) -> u32 {
        self.tree_end
    }

    pub fn nodes(&self) -> &[T] {
        &self.nodes[..self.tree_end as usize]
    }

    /// k-nearest query; `result`/`dist_sq` hold the best k as a max-heap
    /// keyed on distance, with the heap root at index 0.
    pub fn nearest_neighbours(
        &self,
        pos: Point3f,
        result: &mut [u32],
        dist_sq: &mut [Float],
        k: usize,
        max_dist: Float,
    ) -> usize {
        if self.tree_end == 0 || k == 0 {
            return 0;
        }
        let mut photon_count = 0_usize;
        let mut max_dist_sq = max_dist * max_dist;

        let mut stack = [0_u32; 28];
        let mut stack_len = 0_usize;
        let mut current = 0_u32;

        loop {
            let node = &self.nodes[current as usize];
            let d_sq = (node.pos() - pos).length_squared();
            if d_sq < max_dist_sq {
                if photon_count < k {
                    result[photon_count] = current;
                    dist_sq[photon_count] = d_sq;
                    photon_count += 1;
                    if photon_count == k {
                        // heapify
                        let half_k = k / 2;
                        for i in (0..half_k).rev() {
                            let mut parent = i;
                            let reloc = result[i];
                            let reloc_dist = dist_sq[i];
                            while parent < half_k {
                                let mut child = parent * 2 + 1;
                                if child < k - 1 && dist_sq[child] < dist_sq[child + 1] {
                                    child += 1;
                                }
                                if reloc_dist >= dist_sq[child] {
                                    break;
                                }
                                result[parent] = result[child];
                                dist_sq[parent] = dist_sq[child];
                                parent = child;
                            }
                            result[parent] = reloc;
                            dist_sq[parent] = reloc_dist;
                        }
                        max_dist_sq = dist_sq[0];
                    }
                } else {
                    let half_k = k / 2;
                    let mut parent = 0;
                    while parent < half_k {
                        let mut child = parent * 2 + 1;
                        if child < k - 1 && dist_sq[child] < dist_sq[child + 1] {
                            child += 1;
                        }
                        if d_sq >= dist_sq[child] {
                            break;
                        }
                        result[parent] = result[child];
                        dist_sq[parent] = dist_sq[child];
                        parent = child;
                    }
                    result[parent] = current;
                    dist_sq[parent] = d_sq;
                    max_dist_sq = dist_sq[0];
                }
            }

            let split_dim = node.split_dim() as usize;
            let plane_dist = pos[split_dim] - node.pos()[split_dim];
            let traverse_left =
                node.has_left_child() && (plane_dist <= 0.0 || plane_dist * plane_dist < max_dist_sq);
            let traverse_right = node.has_right_child()
                && (plane_dist >= 0.0 || plane_dist * plane_dist < max_dist_sq);

            let child_idx = node.child_idx();
            if traverse_left && traverse_right {
                if plane_dist <= 0.0 {
                    stack[stack_len] = child_idx + 1;
                    stack_len += 1;
                    current = child_idx;
                } else {
                    stack[stack_len] = child_idx;
                    stack_len += 1;
                    current = child_idx + 1;
                }
            } else if traverse_left {
                current = child_idx;
            } else if traverse_right {
                current = child_idx + 1;
            } else {
                if stack_len == 0 {
                    return photon_count;
                }
                stack_len -= 1;
                current = stack[stack_len];
            }
        }
    }
}

impl<T: VolumeTreePhoton> KdTree<T> {
    /// Assign gather radii (fixed, or scaled m-th-nearest-neighbour) and
    /// compute the per-node bounding volumes bottom-up.
    pub fn build_volume_hierarchy(&mut self, fixed_radius: bool, radius_scale: Float) {
        if self.tree_end == 0 {
            return;
        }
        if fixed_radius {
            for node in &mut self.nodes[..self.tree_end as usize] {
                node.set_radius_sq(radius_scale * radius_scale);
            }
        } else {
            let m = 30.min(self.tree_end as usize);
            let scale = radius_scale * ((self.tree_end as Float).sqrt() * 0.05) / m as Float;
            let mut radii = vec![0.0 as Float; self.tree_end as usize];
            let mut result = vec![0_u32; m];
            let mut dist_sq = vec![0.0 as Float; m];
            for i in 0..self.tree_end as usize {
                let found = self.nearest_neighbours(
                    self.nodes[i].pos(),
                    &mut result,
                    &mut dist_sq,
                    m,
                    1e30,
                );
                radii[i] = if found == m { dist_sq[0] * scale } else { 1e-4 };
            }
            for (node, radius) in self.nodes[..self.tree_end as usize].iter_mut().zip(radii) {
                node.set_radius_sq(radius);
            }
        }
        self.recursive_volume_bounds(0);
    }

    fn recursive_volume_bounds(&mut self, root: u32) {
        let node = self.nodes[root as usize];
        let mut bounds = Bounds3f::from_point(node.pos());
        bounds.expand(node.radius_sq().sqrt());

        let child_idx = node.child_idx();
        if node.has_left_child() {
            self.recursive_volume_bounds(child_idx);
            bounds.grow_bnd(&self.nodes[child_idx as usize].bounds());
        }
        if node.has_right_child() {
            self.recursive_volume_bounds(child_idx + 1);
            bounds.grow_bnd(&self.nodes[child_idx as usize + 1].bounds());
        }
        self.nodes[root as usize].set_bounds(bounds);
    }

    /// Visit every photon whose gather sphere overlaps the ray segment,
    /// descending only into nodes whose volume AABB the ray touches.
    pub fn beam_query<F: FnMut(&T, Float, Float)>(
        &self,
        pos: Point3f,
        dir: Vector3f,
        far_t: Float,
        mut traverser: F,
    ) {
        if self.tree_end == 0 {
            return;
        }
        let inv_dir = Vector3f::new(1.0 / dir.x, 1.0 / dir.y, 1.0 / dir.z);

        let mut stack = [0_u32; 28];
        let mut stack_len = 0_usize;
        let mut current = 0_u32;

        loop {
            let node = &self.nodes[current as usize];
            let (min_t, max_t) = node.bounds().intersect_interval(&pos, &inv_dir);

            if min_t <= max_t && min_t <= far_t && max_t >= 0.0 {
                let p = node.pos() - pos;
                let proj = p.x * dir.x + p.y * dir.y + p.z * dir.z;
                if proj >= 0.0 && proj <= far_t {
                    let dist_sq = p.length_squared() - proj * proj;
                    if dist_sq <= node.radius_sq() {
                        traverser(node, proj, dist_sq);
                    }
                }

                let child_idx = node.child_idx();
                if node.has_left_child() && node.has_right_child() {
                    stack[stack_len] = child_idx + 1;
                    stack_len += 1;
                    current = child_idx;
                    continue;
                } else if node.has_left_child() {
                    current = child_idx;
                    continue;
                } else if node.has_right_child() {
                    current = child_idx + 1;
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

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::core::rng::UniformSampler;

    #[derive(Debug, Default, Copy, Clone)]
    pub struct TestPhoton {
        pub split_data: u32,
        pub p: Point3f,
    }

    impl TreePhoton for TestPhoton {
        fn pos(&self) -> Point3f {
            self.p
        }
        fn set_split_info(&mut self, child_idx: u32, split_dim: u32, child_count: u32) {
            let child_mask = match child_count {
                0 => 0,
                1 => 1,
                _ => 3,
            };
            self.split_data = (split_dim << 30) | (child_mask << 28) | child_idx;
        }
        fn has_left_child(&self) -> bool {
            self.split_data & (1 << 28) != 0
        }
        fn has_right_child(&self) -> bool {
            self.split_data & (1 << 29) != 0
        }
        fn split_dim(&self) -> u32 {
            self.split_data >> 30
        }
        fn child_idx(&self) -> u32 {
            self.split_data & 0x0FFF_FFFF
        }
    }

    fn random_photons(n: usize, seed: u64) -> Vec<TestPhoton> {
        let mut rng = UniformSampler::new(seed);
        (0..n)
            .map(|_| TestPhoton {
                split_data: 0,
                p: Point3f::new(rng.next_1d() * 10.0, rng.next_1d() * 10.0, rng.next_1d() * 10.0),
            })
            .collect()
    }

    fn check_split_invariant(tree: &KdTree<TestPhoton>, node: u32) {
        let nodes = tree.nodes();
        let n = nodes[node as usize];
        let dim = n.split_dim() as usize;
        let child = n.child_idx();
        if n.has_left_child() {
            check_subtree_bound(tree, child, dim, n.pos()[dim], true);
            check_split_invariant(tree, child);
        }
        if n.has_right_child() {
            check_subtree_bound(tree, child + 1, dim, n.pos()[dim], false);
            check_split_invariant(tree, child + 1);
        }
    }

    fn check_subtree_bound(tree: &KdTree<TestPhoton>, node: u32, dim: usize, plane: Float, left: bool) {
        let n = tree.nodes()[node as usize];
        if left {
            assert!(n.pos()[dim] <= plane + 1e-5);
        } else {
            assert!(n.pos()[dim] >= plane - 1e-5);
        }
        let child = n.child_idx();
        if n.has_left_child() {
            check_subtree_bound(tree, child, dim, plane, left);
        }
        if n.has_right_child() {
            check_subtree_bound(tree, child + 1, dim, plane, left);
        }
    }

    #[test]
    fn build_preserves_split_invariant() {
        let photons = random_photons(500, 3);
        let tree = KdTree::build(photons, 500, None);
        check_split_invariant(&tree, 0);
    }

    #[test]
    fn knn_matches_brute_force() {
        let photons = random_photons(300, 11);
        let reference = photons.clone();
        let tree = KdTree::build(photons, 300, None);

        let query = Point3f::new(5.0, 5.0, 5.0);
        let k = 8;
        let mut result = vec![0_u32; k];
        let mut dist_sq = vec![0.0; k];
        let count = tree.nearest_neighbours(query, &mut result, &mut dist_sq, k, 1e30);
        assert_eq!(count, k);

        let mut brute: Vec<Float> = reference
            .iter()
            .map(|p| (p.p - query).length_squared())
            .collect();
        brute.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mut found: Vec<Float> = dist_sq[..count].to_vec();
        found.sort_by(|a, b| a.partial_cmp(b).unwrap());
        for (a, b) in brute[..k].iter().zip(&found) {
            assert!((a - b).abs() < 1e-4);
        }
        // heap root is the k-th nearest distance
        assert!((dist_sq[0] - brute[k - 1]).abs() < 1e-4);
    }

    #[test]
    fn single_and_empty_trees_are_safe() {
        let tree = KdTree::build(Vec::<TestPhoton>::new(), 0, None);
        let mut result = [0_u32; 4];
        let mut dist = [0.0; 4];
        assert_eq!(
            tree.nearest_neighbours(Point3f::default(), &mut result, &mut dist, 4, 1e30),
            0
        );

        let tree = KdTree::build(random_photons(1, 7), 1, None);
        assert_eq!(
            tree.nearest_neighbours(Point3f::default(), &mut result, &mut dist, 4, 1e30),
            1
        );
    }
}
