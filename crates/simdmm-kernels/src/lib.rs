//! Portable SIMD matrix multiplication for inference workloads.
//!
//! The crate is organised around a [`MatMulEngine`]: an explicitly injected
//! [`Microkernel`] plus [`Tuning`] parameters. Algorithms (streaming,
//! blocked, packed GEBP, row-parallel, K-last, fused quantized) are methods
//! on the engine and run on a caller-supplied [`WorkerPool`] when parallel.
//!
//! Kernel selection happens once, from an immutable
//! [`CpuCapabilities`] snapshot, through the [`KernelRegistry`]. The free
//! functions at the crate root forward to [`MatMulEngine::global`].

#![allow(unsafe_op_in_unsafe_fn)]

pub mod element;
pub mod engine;
pub mod matmul;
pub mod microkernel;
pub mod pool;
pub mod quant;
pub mod streaming;

use std::sync::{Arc, OnceLock};

use simdmm_common::{BackendPreference, CpuCapabilities, MatMulError, MicrokernelKind, Result};

pub use element::{Accum, Element};
pub use engine::{MatMulEngine, Tuning};
pub use matmul::{Layout, MatMulOperands, MatMulStrategy};
pub use microkernel::{HwOuterProductKernel, Microkernel, PortableKernel, kernel_for};
pub use pool::{WorkQueue, WorkerPool, WorkerPoolConfig, WorkerPoolMetrics};
pub use quant::{
    Activation, AffineParams, Int8Weights, NF4_CODEBOOK, NibbleFormat, NibbleWeights, dequantize_affine,
    dequantize_i32, dequantize_u8, int8x8_matmul, int8x8_matmul_per_axis, pack_nibbles, quantize_affine,
    quantize_int4_weights, quantize_int8_weights, quantize_nf4_weights, quantize_u8, unpack_nibbles,
};
pub use streaming::StreamingModeGuard;

pub use simdmm_common as common;

/// Ordered set of microkernels permitted by a [`CpuCapabilities`] snapshot.
///
/// Providers are stored best first; [`MicrokernelKind::Portable`] is always
/// present and always last.
pub struct KernelRegistry {
    providers: Vec<Arc<dyn Microkernel>>,
    selected: OnceLock<usize>,
}

impl KernelRegistry {
    pub fn new(caps: &CpuCapabilities) -> Self {
        let providers: Vec<Arc<dyn Microkernel>> = caps.available_kinds().into_iter().map(kernel_for).collect();
        log::debug!(
            "kernel registry: [{}]",
            providers.iter().map(|p| p.name()).collect::<Vec<_>>().join(", ")
        );
        Self { providers, selected: OnceLock::new() }
    }

    /// The best available provider. The choice is cached.
    pub fn select_best(&self) -> Arc<dyn Microkernel> {
        let idx = *self.selected.get_or_init(|| {
            let idx = self.providers.iter().position(|p| p.is_available()).unwrap_or(self.providers.len() - 1);
            log::info!("Selected microkernel: {}", self.providers[idx].name());
            idx
        });
        Arc::clone(&self.providers[idx])
    }

    /// A specific provider, if the capabilities allow it.
    pub fn select(&self, kind: MicrokernelKind) -> Result<Arc<dyn Microkernel>> {
        self.providers
            .iter()
            .find(|p| p.kind() == kind && p.is_available())
            .cloned()
            .ok_or_else(|| MatMulError::BackendUnavailable {
                requested: kind,
                reason: "not permitted by the CPU capability snapshot".to_string(),
            })
    }

    /// Honour a configured backend preference, falling back to the best
    /// provider when the requested one is unavailable.
    pub fn resolve(&self, preference: BackendPreference) -> Arc<dyn Microkernel> {
        match preference.kind() {
            None => self.select_best(),
            Some(kind) => self.select(kind).unwrap_or_else(|e| {
                log::warn!("{e}; falling back");
                self.select_best()
            }),
        }
    }

    /// Name of the provider chosen by [`select_best`](Self::select_best), if
    /// it has run.
    pub fn selected_provider_name(&self) -> Option<&'static str> {
        self.selected.get().and_then(|&idx| self.providers.get(idx)).map(|p| p.name())
    }

    pub fn list_available(&self) -> Vec<&'static str> {
        self.providers.iter().filter(|p| p.is_available()).map(|p| p.name()).collect()
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new(CpuCapabilities::detect())
    }
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("providers", &self.list_available())
            .field("selected", &self.selected_provider_name())
            .finish()
    }
}

// ── Free functions on the global engine ─────────────────────────────────────

/// See [`MatMulEngine::matmul`].
pub fn matmul<T: Element>(a: &[T], b: &[T], c: &mut [T], m: usize, n: usize, k: usize) {
    MatMulEngine::global().matmul(a, b, c, m, n, k)
}

/// See [`MatMulEngine::blocked_matmul`].
pub fn blocked_matmul<T: Element>(a: &[T], b: &[T], c: &mut [T], m: usize, n: usize, k: usize) {
    MatMulEngine::global().blocked_matmul(a, b, c, m, n, k)
}

/// See [`MatMulEngine::packed_matmul`].
pub fn packed_matmul<T: Element>(a: &[T], b: &[T], c: &mut [T], m: usize, n: usize, k: usize) {
    MatMulEngine::global().packed_matmul(a, b, c, m, n, k)
}

/// See [`MatMulEngine::parallel_matmul`].
pub fn parallel_matmul<T: Element>(pool: &WorkerPool, a: &[T], b: &[T], c: &mut [T], m: usize, n: usize, k: usize) {
    MatMulEngine::global().parallel_matmul(pool, a, b, c, m, n, k)
}

/// See [`MatMulEngine::parallel_matmul_fine_grained`].
pub fn parallel_matmul_fine_grained<T: Element>(
    pool: &WorkerPool,
    a: &[T],
    b: &[T],
    c: &mut [T],
    m: usize,
    n: usize,
    k: usize,
) {
    MatMulEngine::global().parallel_matmul_fine_grained(pool, a, b, c, m, n, k)
}

/// See [`MatMulEngine::parallel_packed_matmul`].
pub fn parallel_packed_matmul<T: Element>(
    pool: &WorkerPool,
    a: &[T],
    b: &[T],
    c: &mut [T],
    m: usize,
    n: usize,
    k: usize,
) {
    MatMulEngine::global().parallel_packed_matmul(pool, a, b, c, m, n, k)
}

/// See [`MatMulEngine::matmul_auto`].
pub fn matmul_auto<T: Element>(pool: &WorkerPool, a: &[T], b: &[T], c: &mut [T], m: usize, n: usize, k: usize) {
    MatMulEngine::global().matmul_auto(pool, a, b, c, m, n, k)
}

/// See [`MatMulEngine::matmul_klast`].
pub fn matmul_klast<T: Element>(a: &[T], b: &[T], c: &mut [T], m: usize, n: usize, k: usize) {
    MatMulEngine::global().matmul_klast(a, b, c, m, n, k)
}

/// See [`MatMulEngine::blocked_matmul_klast`].
pub fn blocked_matmul_klast<T: Element>(a: &[T], b: &[T], c: &mut [T], m: usize, n: usize, k: usize) {
    MatMulEngine::global().blocked_matmul_klast(a, b, c, m, n, k)
}

/// See [`MatMulEngine::parallel_matmul_klast`].
pub fn parallel_matmul_klast<T: Element>(
    pool: &WorkerPool,
    a: &[T],
    b: &[T],
    c: &mut [T],
    m: usize,
    n: usize,
    k: usize,
) {
    MatMulEngine::global().parallel_matmul_klast(pool, a, b, c, m, n, k)
}

/// See [`MatMulEngine::parallel_matmul_klast_fine_grained`].
pub fn parallel_matmul_klast_fine_grained<T: Element>(
    pool: &WorkerPool,
    a: &[T],
    b: &[T],
    c: &mut [T],
    m: usize,
    n: usize,
    k: usize,
) {
    MatMulEngine::global().parallel_matmul_klast_fine_grained(pool, a, b, c, m, n, k)
}

/// See [`MatMulEngine::matmul_klast_auto`].
pub fn matmul_klast_auto<T: Element>(
    pool: &WorkerPool,
    a: &[T],
    b: &[T],
    c: &mut [T],
    m: usize,
    n: usize,
    k: usize,
) {
    MatMulEngine::global().matmul_klast_auto(pool, a, b, c, m, n, k)
}

/// See [`MatMulEngine::fused_int8_matmul_act`].
pub fn fused_int8_matmul_act(
    input: &[f32],
    weights: &Int8Weights<'_>,
    bias: Option<&[f32]>,
    output: &mut [f32],
    m: usize,
    activation: Activation,
) {
    MatMulEngine::global().fused_int8_matmul_act(input, weights, bias, output, m, activation)
}

/// See [`MatMulEngine::fused_int4_matmul_act`].
pub fn fused_int4_matmul_act(
    input: &[f32],
    weights: &NibbleWeights<'_>,
    bias: Option<&[f32]>,
    output: &mut [f32],
    m: usize,
    activation: Activation,
) {
    MatMulEngine::global().fused_int4_matmul_act(input, weights, bias, output, m, activation)
}

/// See [`MatMulEngine::fused_nf4_matmul_act`].
pub fn fused_nf4_matmul_act(
    input: &[f32],
    weights: &NibbleWeights<'_>,
    bias: Option<&[f32]>,
    output: &mut [f32],
    m: usize,
    activation: Activation,
) {
    MatMulEngine::global().fused_nf4_matmul_act(input, weights, bias, output, m, activation)
}
