//! Auxiliary acceleration structures: a binary BVH, the photon k-d tree,
//! a memory-budgeted uniform grid and the camera frustum binner.

pub mod bvh;
pub mod frustum_grid;
pub mod grid;
pub mod kd_tree;
