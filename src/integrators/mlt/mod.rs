//! Markov-chain Monte Carlo integrators and their shared plumbing.

pub mod common;
pub mod kelemen;
pub mod multiplexed;
pub mod reversible_jump;

pub use common::{LargeStepTracker, MultiplexedStats, SplatQueue};
