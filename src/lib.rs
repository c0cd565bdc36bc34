#[macro_use]
extern crate impl_ops;

pub mod accelerators;
pub mod cameras;
pub mod core;
pub mod integrators;
pub mod materials;
pub mod media;
pub mod renderer;
pub mod samplers;
pub mod scene;
pub mod shapes;
