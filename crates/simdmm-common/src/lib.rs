//! Common types for the simdmm matrix-multiplication engine.
//!
//! This crate provides the foundations shared by the kernel crate: the error
//! taxonomy, engine configuration, the CPU capability registry, and the
//! scratch-buffer pool.

pub mod capabilities;
pub mod config;
pub mod error;
pub mod scratch;

pub use capabilities::{CpuCapabilities, MicrokernelKind, SimdLevel};
pub use config::{BackendPreference, ConfigError, EngineConfig};
pub use error::{MatMulError, Result, ensure_len};
pub use scratch::{PoolStats, PooledBuffer, ScratchPool};
