//! The matmul engine: one resolved microkernel plus tuning parameters.
//!
//! Algorithms live in `impl MatMulEngine` blocks across the `matmul` and
//! `quant` modules. The process-wide engine is built once, in one ordered
//! step: load config, probe capabilities, resolve the kernel.

use std::sync::{Arc, OnceLock};

use simdmm_common::{CpuCapabilities, EngineConfig, Result, ScratchPool};

use crate::KernelRegistry;
use crate::microkernel::{Microkernel, PortableKernel};
use crate::streaming::with_streaming_mode;

/// Numeric tuning knobs consumed by the algorithms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuning {
    pub small_threshold: usize,
    pub large_threshold: usize,
    pub rows_per_strip: usize,
    pub min_parallel_strips: usize,
    pub min_parallel_ops: usize,
    pub block_size: usize,
    pub pairwise_block_k: usize,
    pub klast_block_m: usize,
    pub klast_block_n: usize,
    pub klast_block_k: usize,
    pub gebp_mc: usize,
    pub gebp_kc: usize,
    pub gebp_nc: usize,
    pub hw_tile: usize,
    pub hw_min_dim: usize,
    pub min_fused_parallel_tiles: usize,
}

impl From<&EngineConfig> for Tuning {
    fn from(c: &EngineConfig) -> Self {
        Self {
            small_threshold: c.small_threshold,
            large_threshold: c.large_threshold,
            rows_per_strip: c.rows_per_strip,
            min_parallel_strips: c.min_parallel_strips,
            min_parallel_ops: c.min_parallel_ops,
            block_size: c.block_size,
            pairwise_block_k: c.pairwise_block_k,
            klast_block_m: c.klast_block_m,
            klast_block_n: c.klast_block_n,
            klast_block_k: c.klast_block_k,
            gebp_mc: c.gebp_mc,
            gebp_kc: c.gebp_kc,
            gebp_nc: c.gebp_nc,
            hw_tile: c.hw_tile,
            hw_min_dim: c.hw_min_dim,
            min_fused_parallel_tiles: c.min_fused_parallel_tiles,
        }
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// A resolved microkernel, tuning parameters, and a scratch pool.
///
/// Cheap to clone; clones share the kernel and the scratch pool.
#[derive(Clone)]
pub struct MatMulEngine {
    kernel: Arc<dyn Microkernel>,
    tuning: Tuning,
    scratch: ScratchPool,
}

static GLOBAL: OnceLock<MatMulEngine> = OnceLock::new();

impl MatMulEngine {
    /// Build an engine around an explicitly injected kernel.
    pub fn new(kernel: Arc<dyn Microkernel>, tuning: Tuning) -> Self {
        Self { kernel, tuning, scratch: ScratchPool::default() }
    }

    /// An engine on the portable kernel with default tuning.
    pub fn portable() -> Self {
        Self::new(Arc::new(PortableKernel), Tuning::default())
    }

    /// Resolve the kernel for `config.backend` on `caps`.
    pub fn from_config(config: &EngineConfig, caps: &CpuCapabilities) -> Result<Self> {
        config.validate()?;
        let registry = KernelRegistry::new(caps);
        let kernel = registry.resolve(config.backend);
        log::info!("Selected microkernel: {}", kernel.name());
        Ok(Self { kernel, tuning: Tuning::from(config), scratch: ScratchPool::new(config.scratch_pool_bytes) })
    }

    /// The process-wide engine, initialised on first use from `SIMDMM_*`
    /// environment overrides and the detected CPU capabilities.
    pub fn global() -> &'static MatMulEngine {
        GLOBAL.get_or_init(|| {
            let caps = CpuCapabilities::detect();
            let config = EngineConfig::from_env().unwrap_or_else(|e| {
                log::warn!("ignoring invalid engine configuration: {e}");
                EngineConfig::default()
            });
            Self::from_config(&config, caps).unwrap_or_else(|e| {
                log::warn!("engine initialisation failed ({e}); using defaults");
                let fallback = EngineConfig::default();
                let registry = KernelRegistry::new(caps);
                Self {
                    kernel: registry.resolve(fallback.backend),
                    tuning: Tuning::from(&fallback),
                    scratch: ScratchPool::new(fallback.scratch_pool_bytes),
                }
            })
        })
    }

    /// Same engine with different tuning.
    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn kernel(&self) -> &dyn Microkernel {
        self.kernel.as_ref()
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn scratch(&self) -> &ScratchPool {
        &self.scratch
    }

    /// Run `f` inside a [`StreamingModeGuard`](crate::StreamingModeGuard) when
    /// the kernel requires one. Every kernel body goes through here, once per
    /// serial call or parallel work item.
    pub(crate) fn kernel_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        with_streaming_mode(self.kernel.requires_streaming_mode(), f)
    }
}

impl std::fmt::Debug for MatMulEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatMulEngine")
            .field("kernel", &self.kernel.name())
            .field("tuning", &self.tuning)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simdmm_common::{BackendPreference, MicrokernelKind};

    #[test]
    fn tuning_defaults_match_config_defaults() {
        let t = Tuning::default();
        assert_eq!(t.small_threshold, 64 * 64 * 64);
        assert_eq!(t.large_threshold, 1024 * 1024 * 1024);
        assert_eq!(t.rows_per_strip, 64);
        assert_eq!(t.min_parallel_strips, 3);
        assert_eq!(t.block_size, 48);
        assert_eq!(t.pairwise_block_k, 128);
        assert_eq!((t.gebp_mc, t.gebp_kc, t.gebp_nc), (128, 256, 512));
    }

    #[test]
    fn from_config_honours_backend_preference() {
        let config = EngineConfig { backend: BackendPreference::Portable, ..Default::default() };
        let engine = MatMulEngine::from_config(&config, CpuCapabilities::detect()).unwrap();
        assert_eq!(engine.kernel().kind(), MicrokernelKind::Portable);
    }

    #[test]
    fn from_config_rejects_invalid_config() {
        let config = EngineConfig { block_size: 0, ..Default::default() };
        assert!(MatMulEngine::from_config(&config, &CpuCapabilities::portable_only()).is_err());
    }

    #[test]
    fn unavailable_backend_falls_back_to_portable() {
        let config = EngineConfig { backend: BackendPreference::HwOuterProduct, ..Default::default() };
        let engine = MatMulEngine::from_config(&config, &CpuCapabilities::portable_only()).unwrap();
        assert_eq!(engine.kernel().kind(), MicrokernelKind::Portable);
    }

    #[test]
    fn global_is_initialised_once() {
        let a = MatMulEngine::global();
        let b = MatMulEngine::global();
        assert!(std::ptr::eq(a, b));
    }
}
