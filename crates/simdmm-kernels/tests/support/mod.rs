//! Shared helpers for simdmm-kernels integration tests.

#![allow(dead_code)]

pub mod env_guard;

pub use env_guard::EnvVarGuard;

use simdmm_kernels::{MatMulEngine, Tuning, WorkerPool, WorkerPoolConfig};

/// Deterministic values in `[-1, 1)` from a small LCG.
pub fn lcg_values(len: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        })
        .collect()
}

/// `A·B` in `f64`, row-major `[M, K] · [K, N]`.
pub fn reference_matmul(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f64> {
    let mut c = vec![0.0f64; m * n];
    for i in 0..m {
        for p in 0..k {
            let av = a[i * k + p] as f64;
            for j in 0..n {
                c[i * n + j] += av * b[p * n + j] as f64;
            }
        }
    }
    c
}

/// `[K, N]` to `[N, K]`.
pub fn transpose(b: &[f32], k: usize, n: usize) -> Vec<f32> {
    let mut t = vec![0.0; n * k];
    for p in 0..k {
        for j in 0..n {
            t[j * k + p] = b[p * n + j];
        }
    }
    t
}

#[track_caller]
pub fn assert_close(actual: &[f32], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (&x, &y)) in actual.iter().zip(expected).enumerate() {
        assert!((x as f64 - y).abs() <= tol, "index {i}: {x} vs {y} (tol {tol})");
    }
}

pub fn pool(threads: usize) -> WorkerPool {
    WorkerPool::new(WorkerPoolConfig { num_threads: threads, ..Default::default() }).expect("worker pool")
}

/// Portable engine that parallelises every non-trivial problem.
pub fn eager_engine() -> MatMulEngine {
    MatMulEngine::portable().with_tuning(Tuning { min_parallel_ops: 0, ..Tuning::default() })
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
