//! Size- and kernel-aware strategy selection.

use std::fmt;

use super::{assert_dims, assert_klast_dims, is_degenerate};
use crate::element::Element;
use crate::engine::MatMulEngine;
use crate::pool::WorkerPool;

/// The algorithm [`MatMulEngine::matmul_auto`] picked for a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatMulStrategy {
    /// Single-threaded row streaming.
    Streaming,
    /// One parallel work item per output row.
    FineGrained,
    /// Single-threaded cache blocking.
    Blocked,
    /// Packed GEBP, parallel over row strips or column tiles.
    Packed,
    /// Cache blocking, parallel over row strips.
    ParallelBlocked,
}

impl fmt::Display for MatMulStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatMulStrategy::Streaming => "streaming",
            MatMulStrategy::FineGrained => "fine-grained",
            MatMulStrategy::Blocked => "blocked",
            MatMulStrategy::Packed => "packed",
            MatMulStrategy::ParallelBlocked => "parallel-blocked",
        };
        f.write_str(s)
    }
}

impl MatMulEngine {
    /// Strategy for a standard-layout `m × k · k × n` product.
    ///
    /// First match wins:
    /// 1. fewer than `small_threshold` multiply-adds: streaming
    /// 2. fewer rows than one strip on a kernel that likes row items: fine-grained
    /// 3. fewer strips than `min_parallel_strips`: blocked
    /// 4. at least `large_threshold` multiply-adds with a packed path: packed
    /// 5. otherwise: parallel blocked
    pub fn choose_strategy(&self, m: usize, n: usize, k: usize) -> MatMulStrategy {
        let t = self.tuning();
        let ops = m.saturating_mul(n).saturating_mul(k);
        let rps = t.rows_per_strip.max(1);
        if ops < t.small_threshold {
            MatMulStrategy::Streaming
        } else if self.kernel().prefers_fine_grained_rows() && m < rps {
            MatMulStrategy::FineGrained
        } else if m.div_ceil(rps) < t.min_parallel_strips {
            MatMulStrategy::Blocked
        } else if ops >= t.large_threshold && self.kernel().has_packed_path() {
            MatMulStrategy::Packed
        } else {
            MatMulStrategy::ParallelBlocked
        }
    }

    /// Strategy for a K-last product. Same rules without the packed branch.
    pub fn choose_klast_strategy(&self, m: usize, n: usize, k: usize) -> MatMulStrategy {
        match self.choose_strategy(m, n, k) {
            MatMulStrategy::Packed => MatMulStrategy::ParallelBlocked,
            other => other,
        }
    }

    /// `C = A·B` through the strategy [`choose_strategy`](Self::choose_strategy) picks.
    ///
    /// # Panics
    /// If `a`, `b` or `c` is shorter than its dimensions require.
    #[allow(clippy::too_many_arguments)]
    pub fn matmul_auto<T: Element>(
        &self,
        pool: &WorkerPool,
        a: &[T],
        b: &[T],
        c: &mut [T],
        m: usize,
        n: usize,
        k: usize,
    ) {
        assert_dims(a, b, c, m, n, k);
        if is_degenerate(m, n, k) {
            return;
        }
        let strategy = self.choose_strategy(m, n, k);
        log::debug!("matmul {m}x{k}x{n} via {strategy} on {}", self.kernel().name());
        match strategy {
            MatMulStrategy::Streaming => self.matmul(a, b, c, m, n, k),
            MatMulStrategy::FineGrained => self.parallel_matmul_fine_grained(pool, a, b, c, m, n, k),
            MatMulStrategy::Blocked => self.blocked_matmul(a, b, c, m, n, k),
            MatMulStrategy::Packed => self.parallel_packed_matmul(pool, a, b, c, m, n, k),
            MatMulStrategy::ParallelBlocked => self.parallel_matmul(pool, a, b, c, m, n, k),
        }
    }

    /// `C = A·Bᵀ` (`B` as `[N, K]`) through
    /// [`choose_klast_strategy`](Self::choose_klast_strategy).
    ///
    /// # Panics
    /// If `a`, `b` or `c` is shorter than its dimensions require.
    #[allow(clippy::too_many_arguments)]
    pub fn matmul_klast_auto<T: Element>(
        &self,
        pool: &WorkerPool,
        a: &[T],
        b: &[T],
        c: &mut [T],
        m: usize,
        n: usize,
        k: usize,
    ) {
        assert_klast_dims(a, b, c, m, n, k);
        if is_degenerate(m, n, k) {
            return;
        }
        let strategy = self.choose_klast_strategy(m, n, k);
        log::debug!("matmul_klast {m}x{k}x{n} via {strategy} on {}", self.kernel().name());
        match strategy {
            MatMulStrategy::Streaming => self.matmul_klast(a, b, c, m, n, k),
            MatMulStrategy::FineGrained => self.parallel_matmul_klast_fine_grained(pool, a, b, c, m, n, k),
            MatMulStrategy::Blocked => self.blocked_matmul_klast(a, b, c, m, n, k),
            MatMulStrategy::Packed | MatMulStrategy::ParallelBlocked => {
                self.parallel_matmul_klast(pool, a, b, c, m, n, k)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::microkernel::HwOuterProductKernel;
    use std::sync::Arc;

    #[test]
    fn dispatch_table() {
        let engine = MatMulEngine::portable();
        assert_eq!(engine.choose_strategy(8, 8, 8), MatMulStrategy::Streaming);
        assert_eq!(engine.choose_strategy(32, 512, 512), MatMulStrategy::FineGrained);
        assert_eq!(engine.choose_strategy(128, 256, 256), MatMulStrategy::Blocked);
        assert_eq!(engine.choose_strategy(512, 512, 512), MatMulStrategy::ParallelBlocked);
        assert_eq!(engine.choose_strategy(1024, 1024, 1024), MatMulStrategy::Packed);
    }

    #[test]
    fn klast_never_packs() {
        let engine = MatMulEngine::portable();
        assert_eq!(engine.choose_klast_strategy(1024, 1024, 1024), MatMulStrategy::ParallelBlocked);
        assert_eq!(engine.choose_klast_strategy(8, 8, 8), MatMulStrategy::Streaming);
    }

    #[test]
    fn outer_product_kernel_skips_fine_grained_and_packed() {
        let engine = MatMulEngine::new(Arc::new(HwOuterProductKernel::default()), Default::default());
        assert_eq!(engine.choose_strategy(32, 512, 512), MatMulStrategy::Blocked);
        assert_eq!(engine.choose_strategy(1024, 1024, 1024), MatMulStrategy::ParallelBlocked);
    }

    #[test]
    fn overflowing_shapes_do_not_panic() {
        let engine = MatMulEngine::portable();
        assert_eq!(engine.choose_strategy(usize::MAX, 2, 2), MatMulStrategy::Packed);
    }

    #[test]
    fn strategy_display() {
        assert_eq!(MatMulStrategy::ParallelBlocked.to_string(), "parallel-blocked");
        assert_eq!(MatMulStrategy::FineGrained.to_string(), "fine-grained");
    }
}
