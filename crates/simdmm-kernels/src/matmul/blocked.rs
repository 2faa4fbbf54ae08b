//! Cache-blocked matmul with 4-row register tiles.

use super::streaming::{MAX_TILE_W, MICRO_ROWS, Tile};
use super::{assert_dims, is_degenerate};
use crate::element::Element;
use crate::engine::MatMulEngine;

impl MatMulEngine {
    /// `C = A·B`, single-threaded, tiled into `block_size` square blocks.
    ///
    /// Each block is swept by `4 × 2·lanes` register tiles; the last rows and
    /// columns of a block use narrower tiles rather than reading past the
    /// matrix edge.
    ///
    /// # Panics
    /// If `a`, `b` or `c` is shorter than its dimensions require.
    pub fn blocked_matmul<T: Element>(&self, a: &[T], b: &[T], c: &mut [T], m: usize, n: usize, k: usize) {
        assert_dims(a, b, c, m, n, k);
        if is_degenerate(m, n, k) {
            return;
        }
        self.blocked_rows(a, b, c, m, n, k);
    }

    /// Blocked kernel over `rows` rows of `a` into `c`. Used directly by the
    /// strip-parallel path on disjoint row strips.
    pub(crate) fn blocked_rows<T: Element>(&self, a: &[T], b: &[T], c: &mut [T], rows: usize, n: usize, k: usize) {
        let bs = self.tuning().block_size.max(MICRO_ROWS);
        let nr = (2 * T::lanes(self.kernel())).clamp(1, MAX_TILE_W);

        self.kernel_scope(|| {
            for ib in (0..rows).step_by(bs) {
                let ie = (ib + bs).min(rows);
                for jb in (0..n).step_by(bs) {
                    let je = (jb + bs).min(n);

                    let mut i0 = ib;
                    while i0 < ie {
                        let tile_rows = MICRO_ROWS.min(ie - i0);
                        let mut j0 = jb;
                        while j0 < je {
                            let w = nr.min(je - j0);
                            self.accumulate_tile(a, b, c, n, k, Tile { i0, rows: tile_rows, j0, w });
                            j0 += w;
                        }
                        i0 += tile_rows;
                    }
                }
            }
        });
    }
}
