//! Crate-wide error type. Local recovery happens at sample granularity
//! inside the integrators; only scene loading and persistence failures
//! surface here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("scene load failed: {0}")]
    SceneLoad(String),
    #[error("checkpoint mismatch: {0}")]
    CheckpointMismatch(String),
    #[error("render aborted")]
    Aborted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type RenderResult<T> = Result<T, RenderError>;
