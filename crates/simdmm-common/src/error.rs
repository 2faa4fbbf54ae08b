//! Error types for simdmm.
//!
//! Hot-path matmul calls treat undersized buffers as fatal programmer errors
//! and panic. The types here back the *checked* surfaces: operand value
//! objects, quantized weight descriptors, engine construction and config.

use thiserror::Error;

use crate::capabilities::MicrokernelKind;
use crate::config::ConfigError;

/// Errors returned by the checked constructors of simdmm.
#[derive(Debug, Error)]
pub enum MatMulError {
    #[error("{operand} buffer too small: need {required} elements, got {actual}")]
    BufferTooSmall {
        operand: &'static str,
        required: usize,
        actual: usize,
    },

    #[error("invalid group size {group_size} for N = {n}")]
    InvalidGroupSize { group_size: usize, n: usize },

    #[error("invalid packed weight layout: {reason}")]
    InvalidPacking { reason: String },

    #[error("microkernel {requested} unavailable: {reason}")]
    BackendUnavailable {
        requested: MicrokernelKind,
        reason: String,
    },

    #[error("worker pool construction failed: {0}")]
    PoolBuild(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MatMulError {
    /// Shorthand for [`MatMulError::BufferTooSmall`].
    pub fn too_small(operand: &'static str, required: usize, actual: usize) -> Self {
        Self::BufferTooSmall { operand, required, actual }
    }
}

/// Convenience result alias used across the workspace.
pub type Result<T> = std::result::Result<T, MatMulError>;

/// Check that `actual >= required`, naming the operand on failure.
pub fn ensure_len(operand: &'static str, required: usize, actual: usize) -> Result<()> {
    if actual < required {
        return Err(MatMulError::too_small(operand, required, actual));
    }
    Ok(())
}
