//! Dense matrix multiplication, `C = A·B` in row-major layout.
//!
//! Standard layout: `A` is `[M, K]`, `B` is `[K, N]`, `C` is `[M, N]`.
//! K-last layout: `B` is `[N, K]` and the product is `A·Bᵀ`.
//!
//! Every entry point overwrites `C`. A zero dimension is a no-op that leaves
//! `C` untouched. Undersized buffers are programmer errors and panic; use
//! [`MatMulOperands`] to validate once up front instead.

mod blocked;
mod dispatch;
mod klast;
mod packed;
pub mod packing;
mod parallel;
mod streaming;

pub use dispatch::MatMulStrategy;

use std::sync::Mutex;

use simdmm_common::{Result, ensure_len};

use crate::element::Element;
use crate::engine::MatMulEngine;
use crate::pool::WorkerPool;

/// Assert the standard-layout buffer contract.
#[track_caller]
pub(crate) fn assert_dims<T>(a: &[T], b: &[T], c: &[T], m: usize, n: usize, k: usize) {
    assert!(a.len() >= m * k, "A too small: need {} elements (M={m}, K={k}), got {}", m * k, a.len());
    assert!(b.len() >= k * n, "B too small: need {} elements (K={k}, N={n}), got {}", k * n, b.len());
    assert!(c.len() >= m * n, "C too small: need {} elements (M={m}, N={n}), got {}", m * n, c.len());
}

/// Assert the K-last buffer contract (`B` is `[N, K]`).
#[track_caller]
pub(crate) fn assert_klast_dims<T>(a: &[T], b: &[T], c: &[T], m: usize, n: usize, k: usize) {
    assert!(a.len() >= m * k, "A too small: need {} elements (M={m}, K={k}), got {}", m * k, a.len());
    assert!(b.len() >= n * k, "B too small: need {} elements (N={n}, K={k}), got {}", n * k, b.len());
    assert!(c.len() >= m * n, "C too small: need {} elements (M={m}, N={n}), got {}", m * n, c.len());
}

#[inline]
pub(crate) fn is_degenerate(m: usize, n: usize, k: usize) -> bool {
    m == 0 || n == 0 || k == 0
}

/// Split a row-major `[m, n]` buffer into disjoint `(row block, column tile)`
/// regions of `rows_per_item` rows by `tile_w` columns.
///
/// Region `ri * ceil(n / tile_w) + ci` holds one slice per row of row block
/// `ri`, covering columns `ci * tile_w..` of that row. Each region is handed
/// to exactly one worker, so its lock is never contended.
pub(crate) fn split_tiles<T: Send>(
    out: &mut [T],
    m: usize,
    n: usize,
    rows_per_item: usize,
    tile_w: usize,
) -> Vec<Mutex<Vec<&mut [T]>>> {
    let (rows_per_item, tile_w) = (rows_per_item.max(1), tile_w.max(1));
    let col_tiles = n.div_ceil(tile_w);
    let mut regions: Vec<Vec<&mut [T]>> =
        (0..m.div_ceil(rows_per_item) * col_tiles).map(|_| Vec::with_capacity(rows_per_item)).collect();
    for (i, row) in out[..m * n].chunks_mut(n).enumerate() {
        let base = (i / rows_per_item) * col_tiles;
        for (ci, segment) in row.chunks_mut(tile_w).enumerate() {
            regions[base + ci].push(segment);
        }
    }
    regions.into_iter().map(Mutex::new).collect()
}

/// Operand layout of a [`MatMulOperands`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `B` is `[K, N]`.
    Standard,
    /// `B` is `[N, K]`.
    KLast,
}

/// Validated operands for one multiplication.
///
/// Construction checks every buffer length once; [`MatMulOperands::run`]
/// then dispatches without re-checking the caller's intent.
#[derive(Debug)]
pub struct MatMulOperands<'a, T: Element> {
    a: &'a [T],
    b: &'a [T],
    c: &'a mut [T],
    m: usize,
    n: usize,
    k: usize,
    layout: Layout,
}

impl<'a, T: Element> MatMulOperands<'a, T> {
    /// Standard layout operands.
    pub fn new(a: &'a [T], b: &'a [T], c: &'a mut [T], m: usize, n: usize, k: usize) -> Result<Self> {
        ensure_len("A", m * k, a.len())?;
        ensure_len("B", k * n, b.len())?;
        ensure_len("C", m * n, c.len())?;
        Ok(Self { a, b, c, m, n, k, layout: Layout::Standard })
    }

    /// K-last operands (`B` is `[N, K]`).
    pub fn new_klast(a: &'a [T], b: &'a [T], c: &'a mut [T], m: usize, n: usize, k: usize) -> Result<Self> {
        ensure_len("A", m * k, a.len())?;
        ensure_len("B", n * k, b.len())?;
        ensure_len("C", m * n, c.len())?;
        Ok(Self { a, b, c, m, n, k, layout: Layout::KLast })
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.m, self.n, self.k)
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Multiply with the auto dispatcher.
    pub fn run(self, engine: &MatMulEngine, pool: &WorkerPool) {
        let Self { a, b, c, m, n, k, layout } = self;
        match layout {
            Layout::Standard => engine.matmul_auto(pool, a, b, c, m, n, k),
            Layout::KLast => engine.matmul_klast_auto(pool, a, b, c, m, n, k),
        }
    }
}

/// Naive triple loop in `f64`, used as the reference in tests.
#[cfg(test)]
pub(crate) fn naive_matmul<T: Element>(a: &[T], b: &[T], m: usize, n: usize, k: usize) -> Vec<f64> {
    use crate::element::Accum;
    let mut c = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            c[i * n + j] = (0..k).map(|p| a[i * k + p].to_acc().to_f64() * b[p * n + j].to_acc().to_f64()).sum();
        }
    }
    c
}

#[cfg(test)]
mod tests {
    use super::*;
    use simdmm_common::MatMulError;

    #[test]
    fn operands_reject_short_buffers() {
        let a = [0.0f32; 5];
        let b = [0.0f32; 6];
        let mut c = [0.0f32; 4];
        let err = MatMulOperands::new(&a, &b, &mut c, 2, 2, 3).unwrap_err();
        assert!(matches!(err, MatMulError::BufferTooSmall { operand: "A", required: 6, actual: 5 }));
    }

    #[test]
    fn operands_run_auto_dispatch() {
        let engine = MatMulEngine::portable();
        let pool = WorkerPool::new(crate::pool::WorkerPoolConfig { num_threads: 2, ..Default::default() }).unwrap();
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let b = [5.0f32, 6.0, 7.0, 8.0];
        let mut c = [0.0f32; 4];
        MatMulOperands::new(&a, &b, &mut c, 2, 2, 2).unwrap().run(&engine, &pool);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);

        // Bᵀ of the above
        let bt = [5.0f32, 7.0, 6.0, 8.0];
        let mut c = [0.0f32; 4];
        let ops = MatMulOperands::new_klast(&a, &bt, &mut c, 2, 2, 2).unwrap();
        assert_eq!(ops.layout(), Layout::KLast);
        ops.run(&engine, &pool);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn split_tiles_covers_output_without_overlap() {
        // 5×7 output, 2-row blocks, 3-wide column tiles: 3 × 3 regions
        let mut out = [0u32; 35];
        {
            let regions = split_tiles(&mut out, 5, 7, 2, 3);
            assert_eq!(regions.len(), 9);
            for (idx, region) in regions.into_iter().enumerate() {
                let mut segments = region.into_inner().unwrap();
                assert_eq!(segments.len(), if idx / 3 == 2 { 1 } else { 2 });
                for seg in segments.iter_mut() {
                    assert_eq!(seg.len(), if idx % 3 == 2 { 1 } else { 3 });
                    seg.iter_mut().for_each(|x| *x += idx as u32 + 1);
                }
            }
        }
        for (i, &v) in out.iter().enumerate() {
            let (r, c) = (i / 7, i % 7);
            assert_eq!(v, ((r / 2) * 3 + c / 3) as u32 + 1, "element ({r}, {c})");
        }
    }
}
