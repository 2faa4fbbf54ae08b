//! Streaming matmul: one output row at a time, the lowest fixed overhead.

use super::{assert_dims, is_degenerate};
use crate::element::{Accum, Element};
use crate::engine::MatMulEngine;

/// Widest column tile kept in accumulators.
pub(super) const MAX_TILE_W: usize = 64;
/// Rows in one register tile.
pub(super) const MICRO_ROWS: usize = 4;

/// A `rows × w` output tile anchored at `(i0, j0)`.
#[derive(Debug, Clone, Copy)]
pub(super) struct Tile {
    pub i0: usize,
    pub rows: usize,
    pub j0: usize,
    pub w: usize,
}

impl MatMulEngine {
    /// `C = A·B`, single-threaded, no cache blocking.
    ///
    /// # Panics
    /// If `a`, `b` or `c` is shorter than its dimensions require.
    pub fn matmul<T: Element>(&self, a: &[T], b: &[T], c: &mut [T], m: usize, n: usize, k: usize) {
        assert_dims(a, b, c, m, n, k);
        if is_degenerate(m, n, k) {
            return;
        }
        self.streaming_rows(a, b, c, m, n, k);
    }

    /// Streaming kernel over `rows` rows of `a` into `c`.
    pub(crate) fn streaming_rows<T: Element>(&self, a: &[T], b: &[T], c: &mut [T], rows: usize, n: usize, k: usize) {
        let tile_w = (4 * T::lanes(self.kernel())).clamp(1, MAX_TILE_W);
        self.kernel_scope(|| {
            for i0 in 0..rows {
                let mut j0 = 0;
                while j0 < n {
                    // the last tile narrows; axpy handles the sub-vector tail
                    let w = tile_w.min(n - j0);
                    self.accumulate_tile(a, b, c, n, k, Tile { i0, rows: 1, j0, w });
                    j0 += w;
                }
            }
        });
    }

    /// Compute one output tile over the whole `K` range and overwrite it in
    /// `c`.
    ///
    /// `K` is reduced in blocks of `pairwise_block_k`; each block sums into a
    /// fresh partial which is then added to the running total, keeping the
    /// rounding error growth logarithmic in `K`.
    pub(super) fn accumulate_tile<T: Element>(
        &self,
        a: &[T],
        b: &[T],
        c: &mut [T],
        n: usize,
        k: usize,
        t: Tile,
    ) {
        debug_assert!(t.rows <= MICRO_ROWS && t.w <= MAX_TILE_W);
        let kernel = self.kernel();
        let pbk = self.tuning().pairwise_block_k.max(1);
        let zero = <T::Acc as Accum>::ZERO;
        let mut total = [[zero; MAX_TILE_W]; MICRO_ROWS];
        let mut part = [[zero; MAX_TILE_W]; MICRO_ROWS];

        for kb in (0..k).step_by(pbk) {
            let ke = (kb + pbk).min(k);
            for row in part.iter_mut().take(t.rows) {
                row[..t.w].fill(zero);
            }
            for p in kb..ke {
                let b_row = &b[p * n + t.j0..p * n + t.j0 + t.w];
                for (r, acc) in part.iter_mut().take(t.rows).enumerate() {
                    T::axpy(kernel, a[(t.i0 + r) * k + p].to_acc(), b_row, &mut acc[..t.w]);
                }
            }
            for (tot, prt) in total.iter_mut().zip(&part).take(t.rows) {
                for (x, &y) in tot[..t.w].iter_mut().zip(&prt[..t.w]) {
                    *x += y;
                }
            }
        }

        for (r, tot) in total.iter().take(t.rows).enumerate() {
            let start = (t.i0 + r) * n + t.j0;
            for (o, &v) in c[start..start + t.w].iter_mut().zip(&tot[..t.w]) {
                *o = T::from_acc(v);
            }
        }
    }
}
