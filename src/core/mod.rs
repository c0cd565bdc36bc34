pub mod error;
pub mod film;
pub mod geometry;
pub mod lumen;
pub mod op_macros;
pub mod records;
pub mod rng;
pub mod sampling;
pub mod spectrum;
