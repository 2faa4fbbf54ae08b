//! K-last matmul: `B` is stored `[N, K]` and `C = A·Bᵀ`.
//!
//! Every output element is an inner product of two contiguous rows, which
//! is the natural layout for attention scores and for weights stored
//! output-major.

use super::{assert_klast_dims, is_degenerate};
use crate::element::{Accum, Element};
use crate::engine::MatMulEngine;

impl MatMulEngine {
    /// `C = A·Bᵀ` with `B` as `[N, K]`, single-threaded.
    ///
    /// # Panics
    /// If `a`, `b` or `c` is shorter than its dimensions require.
    pub fn matmul_klast<T: Element>(&self, a: &[T], b: &[T], c: &mut [T], m: usize, n: usize, k: usize) {
        assert_klast_dims(a, b, c, m, n, k);
        if is_degenerate(m, n, k) {
            return;
        }
        self.klast_rows(a, b, c, m, n, k);
    }

    /// Row-by-row K-last kernel over `rows` rows of `a`.
    pub(crate) fn klast_rows<T: Element>(&self, a: &[T], b: &[T], c: &mut [T], rows: usize, n: usize, k: usize) {
        self.kernel_scope(|| {
            for i in 0..rows {
                let a_row = &a[i * k..(i + 1) * k];
                let c_row = &mut c[i * n..(i + 1) * n];
                for (j, out) in c_row.iter_mut().enumerate() {
                    *out = T::from_acc(self.pairwise_dot(a_row, &b[j * k..(j + 1) * k]));
                }
            }
        });
    }

    /// Inner product reduced in `pairwise_block_k` blocks.
    pub(crate) fn pairwise_dot<T: Element>(&self, a: &[T], b: &[T]) -> T::Acc {
        let pbk = self.tuning().pairwise_block_k.max(1);
        let kernel = self.kernel();
        a.chunks(pbk)
            .zip(b.chunks(pbk))
            .fold(<T::Acc as Accum>::ZERO, |total, (ca, cb)| total + T::dot(kernel, ca, cb))
    }

    /// `C = A·Bᵀ`, tiled into `klast_block_m × klast_block_n` output blocks
    /// accumulated over `klast_block_k` slices of `K`.
    ///
    /// Each output block lives in a scratch accumulator tile for the whole
    /// `K` sweep and is written to `C` once.
    pub fn blocked_matmul_klast<T: Element>(&self, a: &[T], b: &[T], c: &mut [T], m: usize, n: usize, k: usize) {
        assert_klast_dims(a, b, c, m, n, k);
        if is_degenerate(m, n, k) {
            return;
        }
        self.blocked_klast_rows(a, b, c, m, n, k);
    }

    pub(crate) fn blocked_klast_rows<T: Element>(
        &self,
        a: &[T],
        b: &[T],
        c: &mut [T],
        rows: usize,
        n: usize,
        k: usize,
    ) {
        self.kernel_scope(|| self.blocked_klast_tiles(a, b, c, rows, n, k));
    }

    fn blocked_klast_tiles<T: Element>(&self, a: &[T], b: &[T], c: &mut [T], rows: usize, n: usize, k: usize) {
        let t = self.tuning();
        let (bm, bn, bk) = (t.klast_block_m.max(1), t.klast_block_n.max(1), t.klast_block_k.max(1));
        let kernel = self.kernel();

        // single-row inputs gain nothing from the tile buffer
        if rows == 1 {
            let a_row = &a[..k];
            for (j, out) in c[..n].iter_mut().enumerate() {
                let b_row = &b[j * k..(j + 1) * k];
                let acc = a_row
                    .chunks(bk)
                    .zip(b_row.chunks(bk))
                    .fold(<T::Acc as Accum>::ZERO, |s, (ca, cb)| s + T::dot(kernel, ca, cb));
                *out = T::from_acc(acc);
            }
            return;
        }

        let mut buf = self.scratch().allocate_elems::<T::Acc>(bm * bn);
        let tile = &mut buf.as_mut_slice::<T::Acc>()[..bm * bn];

        for i0 in (0..rows).step_by(bm) {
            let ie = (i0 + bm).min(rows);
            for j0 in (0..n).step_by(bn) {
                let je = (j0 + bn).min(n);
                let w = je - j0;
                tile.fill(<T::Acc as Accum>::ZERO);

                for k0 in (0..k).step_by(bk) {
                    let ke = (k0 + bk).min(k);
                    for i in i0..ie {
                        let a_slice = &a[i * k + k0..i * k + ke];
                        let tile_row = &mut tile[(i - i0) * w..(i - i0 + 1) * w];
                        for (jj, acc) in tile_row.iter_mut().enumerate() {
                            let j = j0 + jj;
                            *acc += T::dot(kernel, a_slice, &b[j * k + k0..j * k + ke]);
                        }
                    }
                }

                for i in i0..ie {
                    let tile_row = &tile[(i - i0) * w..(i - i0 + 1) * w];
                    for (out, &v) in c[i * n + j0..i * n + je].iter_mut().zip(tile_row) {
                        *out = T::from_acc(v);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{MatMulEngine, Tuning};

    fn transpose(b: &[f64], k: usize, n: usize) -> Vec<f64> {
        let mut bt = vec![0.0; n * k];
        for p in 0..k {
            for j in 0..n {
                bt[j * k + p] = b[p * n + j];
            }
        }
        bt
    }

    #[test]
    fn klast_matches_standard_layout() {
        let engine = MatMulEngine::portable();
        let (m, n, k) = (7, 9, 33);
        let a: Vec<f64> = (0..m * k).map(|i| (i % 6) as f64 - 2.0).collect();
        let b: Vec<f64> = (0..k * n).map(|i| (i % 4) as f64).collect();
        let bt = transpose(&b, k, n);
        let mut expected = vec![0.0; m * n];
        engine.matmul(&a, &b, &mut expected, m, n, k);

        let mut c = vec![0.0; m * n];
        engine.matmul_klast(&a, &bt, &mut c, m, n, k);
        assert_eq!(c, expected);

        let mut c = vec![0.0; m * n];
        engine.blocked_matmul_klast(&a, &bt, &mut c, m, n, k);
        assert_eq!(c, expected);
    }

    #[test]
    fn blocked_klast_with_small_blocks() {
        let tuning = Tuning { klast_block_m: 3, klast_block_n: 5, klast_block_k: 4, ..Tuning::default() };
        let engine = MatMulEngine::portable().with_tuning(tuning);
        let (m, n, k) = (8, 11, 10);
        let a: Vec<f64> = (0..m * k).map(|i| (i % 3) as f64).collect();
        let b: Vec<f64> = (0..n * k).map(|i| (i % 5) as f64 - 2.0).collect();
        let mut reference = vec![0.0; m * n];
        engine.matmul_klast(&a, &b, &mut reference, m, n, k);
        let mut c = vec![0.0; m * n];
        engine.blocked_matmul_klast(&a, &b, &mut c, m, n, k);
        assert_eq!(c, reference);
    }

    #[test]
    fn single_row_path() {
        let engine = MatMulEngine::portable();
        // A = [1, 2], B = [[3, 4], [5, 6], [7, 8]] (N = 3, K = 2)
        let mut c = [0.0f32; 3];
        engine.blocked_matmul_klast(&[1.0, 2.0], &[3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &mut c, 1, 3, 2);
        assert_eq!(c, [11.0, 17.0, 23.0]);
    }
}
