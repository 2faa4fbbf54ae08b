//! Row-partitioned parallel matmul.
//!
//! Strip parallelism cuts `C` into `rows_per_strip`-row strips; fine-grained
//! parallelism makes every row its own work item. Either way workers pop
//! item indices from a shared [`WorkQueue`] and own the output rows of each
//! item exclusively, so `B` is shared read-only and `C` needs no locking
//! beyond handing each strip to exactly one worker.

use std::sync::{Mutex, PoisonError};

use super::{assert_dims, assert_klast_dims, is_degenerate};
use crate::element::Element;
use crate::engine::MatMulEngine;
use crate::pool::{WorkQueue, WorkerPool};

/// Which serial kernel a worker runs on its rows.
#[derive(Debug, Clone, Copy)]
enum RowKernel {
    Blocked,
    Streaming,
    KLast,
    BlockedKLast,
}

impl MatMulEngine {
    /// `C = A·B` with row-strip parallelism on `pool`.
    ///
    /// Falls back to [`MatMulEngine::blocked_matmul`] below
    /// `min_parallel_ops`.
    ///
    /// # Panics
    /// If `a`, `b` or `c` is shorter than its dimensions require.
    #[allow(clippy::too_many_arguments)]
    pub fn parallel_matmul<T: Element>(
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
        if self.below_parallel_threshold(m, n, k) {
            self.blocked_rows(a, b, c, m, n, k);
            return;
        }
        self.run_row_items(pool, a, b, c, (m, n, k), self.tuning().rows_per_strip, RowKernel::Blocked);
    }

    /// `C = A·B` with one work item per output row.
    ///
    /// # Panics
    /// If `a`, `b` or `c` is shorter than its dimensions require.
    #[allow(clippy::too_many_arguments)]
    pub fn parallel_matmul_fine_grained<T: Element>(
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
        if self.below_parallel_threshold(m, n, k) {
            self.blocked_rows(a, b, c, m, n, k);
            return;
        }
        self.run_row_items(pool, a, b, c, (m, n, k), 1, RowKernel::Streaming);
    }

    /// K-last counterpart of [`MatMulEngine::parallel_matmul`].
    ///
    /// # Panics
    /// If `a`, `b` or `c` is shorter than its dimensions require.
    #[allow(clippy::too_many_arguments)]
    pub fn parallel_matmul_klast<T: Element>(
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
        if self.below_parallel_threshold(m, n, k) {
            self.blocked_klast_rows(a, b, c, m, n, k);
            return;
        }
        self.run_row_items(pool, a, b, c, (m, n, k), self.tuning().rows_per_strip, RowKernel::BlockedKLast);
    }

    /// K-last counterpart of [`MatMulEngine::parallel_matmul_fine_grained`].
    ///
    /// # Panics
    /// If `a`, `b` or `c` is shorter than its dimensions require.
    #[allow(clippy::too_many_arguments)]
    pub fn parallel_matmul_klast_fine_grained<T: Element>(
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
        if self.below_parallel_threshold(m, n, k) {
            self.blocked_klast_rows(a, b, c, m, n, k);
            return;
        }
        self.run_row_items(pool, a, b, c, (m, n, k), 1, RowKernel::KLast);
    }

    fn below_parallel_threshold(&self, m: usize, n: usize, k: usize) -> bool {
        m.saturating_mul(n).saturating_mul(k) < self.tuning().min_parallel_ops
    }

    /// Split `C` into items of `rows_per_item` rows and drain them on `pool`.
    #[allow(clippy::too_many_arguments)]
    fn run_row_items<T: Element>(
        &self,
        pool: &WorkerPool,
        a: &[T],
        b: &[T],
        c: &mut [T],
        (m, n, k): (usize, usize, usize),
        rows_per_item: usize,
        kernel: RowKernel,
    ) {
        let rows_per_item = rows_per_item.max(1);
        let items: Vec<Mutex<&mut [T]>> = c[..m * n].chunks_mut(rows_per_item * n).map(Mutex::new).collect();
        let queue = WorkQueue::new(items.len());
        let workers = pool.num_threads().min(items.len());

        pool.drain(workers, &queue, |idx| {
            let mut c_item = items[idx].lock().unwrap_or_else(PoisonError::into_inner);
            let rows = c_item.len() / n;
            let row0 = idx * rows_per_item;
            let a_item = &a[row0 * k..(row0 + rows) * k];
            match kernel {
                RowKernel::Blocked => self.blocked_rows(a_item, b, &mut c_item, rows, n, k),
                RowKernel::Streaming => self.streaming_rows(a_item, b, &mut c_item, rows, n, k),
                RowKernel::KLast => self.klast_rows(a_item, b, &mut c_item, rows, n, k),
                RowKernel::BlockedKLast => self.blocked_klast_rows(a_item, b, &mut c_item, rows, n, k),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{MatMulEngine, Tuning};
    use crate::pool::{WorkerPool, WorkerPoolConfig};

    fn eager() -> MatMulEngine {
        // force the parallel paths even for small inputs
        MatMulEngine::portable().with_tuning(Tuning { min_parallel_ops: 0, rows_per_strip: 4, ..Tuning::default() })
    }

    fn pool(threads: usize) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig { num_threads: threads, ..Default::default() }).unwrap()
    }

    fn inputs(m: usize, n: usize, k: usize) -> (Vec<f32>, Vec<f32>) {
        let a = (0..m * k).map(|i| ((i % 31) as f32 * 0.1).sin()).collect();
        let b = (0..k * n).map(|i| ((i % 17) as f32 * 0.2).cos()).collect();
        (a, b)
    }

    #[test]
    fn strip_parallel_is_bitwise_equal_to_blocked() {
        let engine = eager();
        let (m, n, k) = (23, 19, 41);
        let (a, b) = inputs(m, n, k);
        let mut serial = vec![0.0; m * n];
        engine.blocked_matmul(&a, &b, &mut serial, m, n, k);
        for threads in 1..=4 {
            let mut par = vec![0.0; m * n];
            engine.parallel_matmul(&pool(threads), &a, &b, &mut par, m, n, k);
            assert_eq!(par, serial, "threads={threads}");
        }
    }

    #[test]
    fn fine_grained_is_bitwise_equal_to_streaming() {
        let engine = eager();
        let (m, n, k) = (5, 70, 33);
        let (a, b) = inputs(m, n, k);
        let mut serial = vec![0.0; m * n];
        engine.matmul(&a, &b, &mut serial, m, n, k);
        let mut par = vec![0.0; m * n];
        engine.parallel_matmul_fine_grained(&pool(3), &a, &b, &mut par, m, n, k);
        assert_eq!(par, serial);
    }

    #[test]
    fn klast_variants_match_serial() {
        let engine = eager();
        let (m, n, k) = (9, 7, 12);
        let (a, b) = inputs(m, n, k);
        let mut serial = vec![0.0; m * n];
        engine.matmul_klast(&a, &b, &mut serial, m, n, k);

        let mut fine = vec![0.0; m * n];
        engine.parallel_matmul_klast_fine_grained(&pool(2), &a, &b, &mut fine, m, n, k);
        assert_eq!(fine, serial);

        let mut strips = vec![0.0; m * n];
        engine.parallel_matmul_klast(&pool(2), &a, &b, &mut strips, m, n, k);
        for (x, y) in strips.iter().zip(&serial) {
            assert!((x - y).abs() <= 1e-4 * 12.0, "{x} vs {y}");
        }
    }

    #[test]
    fn small_problems_run_serially() {
        let engine = MatMulEngine::portable();
        let p = pool(2);
        let mut c = [0.0f32; 4];
        engine.parallel_matmul(&p, &[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0], &mut c, 2, 2, 2);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
        assert_eq!(p.metrics().jobs_completed, 0);
    }
}
