//! Packed GEBP matmul for large operands.
//!
//! Loop nest (outer to inner): `jc` over `gebp_nc` columns, `pc` over
//! `gebp_kc` slices of `K` (B panel packed once per slice), `ic` over
//! `gebp_mc` rows (A panel packed), then `mr × nr` micro-tiles computed by
//! the microkernel. Micro-tiles accumulate into a `T::Acc` column panel
//! across every `K` slice, so half-precision outputs round once on store.

use std::sync::{Mutex, PoisonError};

use super::packing::{
    OutputRegion, apply_packed_output_simple, pack_lhs, pack_rhs, packed_lhs_len, packed_rhs_len, zero_acc,
};
use super::{assert_dims, is_degenerate, split_tiles};
use crate::element::Element;
use crate::engine::MatMulEngine;
use crate::pool::{WorkQueue, WorkerPool};

impl MatMulEngine {
    /// `C = A·B` through the packed GEBP path, single-threaded.
    ///
    /// # Panics
    /// If `a`, `b` or `c` is shorter than its dimensions require.
    pub fn packed_matmul<T: Element>(&self, a: &[T], b: &[T], c: &mut [T], m: usize, n: usize, k: usize) {
        assert_dims(a, b, c, m, n, k);
        if is_degenerate(m, n, k) {
            return;
        }
        self.gebp_rows(a, b, c, m, n, k);
    }

    /// Parallel packed matmul.
    ///
    /// Ordinary kernels split `C` into strips of `gebp_mc` rows, each running
    /// the full GEBP nest. Streaming-mode kernels instead split `N` into
    /// `hw_tile`-wide column tiles; each worker holds its own
    /// [`StreamingModeGuard`](crate::StreamingModeGuard) while computing a
    /// tile.
    ///
    /// # Panics
    /// If `a`, `b` or `c` is shorter than its dimensions require.
    #[allow(clippy::too_many_arguments)]
    pub fn parallel_packed_matmul<T: Element>(
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
        if self.kernel().requires_streaming_mode() {
            self.parallel_column_tiles(pool, a, b, c, m, n, k);
            return;
        }

        let mc = self.tuning().gebp_mc.max(1);
        if m <= mc {
            self.gebp_rows(a, b, c, m, n, k);
            return;
        }
        let strips: Vec<Mutex<&mut [T]>> = c[..m * n].chunks_mut(mc * n).map(Mutex::new).collect();
        let queue = WorkQueue::new(strips.len());
        pool.drain(pool.num_threads(), &queue, |s| {
            let mut c_strip = strips[s].lock().unwrap_or_else(PoisonError::into_inner);
            let rows = c_strip.len() / n;
            let a_strip = &a[s * mc * k..(s * mc + rows) * k];
            self.gebp_rows(a_strip, b, &mut c_strip, rows, n, k);
        });
    }

    /// GEBP nest over `rows` rows of `a` into `c`.
    fn gebp_rows<T: Element>(&self, a: &[T], b: &[T], c: &mut [T], rows: usize, n: usize, k: usize) {
        self.kernel_scope(|| self.gebp_panels(a, b, c, rows, n, k));
    }

    /// Each `[rows, gebp_nc]` column panel accumulates in `T::Acc` across
    /// every `K` slice and is stored to `c` once.
    fn gebp_panels<T: Element>(&self, a: &[T], b: &[T], c: &mut [T], rows: usize, n: usize, k: usize) {
        let t = self.tuning();
        let (mc, kc, nc) = (t.gebp_mc.max(1), t.gebp_kc.max(1), t.gebp_nc.max(1));
        let (mr, nr) = self.kernel().micro_tile();
        let kernel = self.kernel();
        let scratch = self.scratch();

        let mut pa_buf = scratch.allocate_elems::<T>(packed_lhs_len(mc.min(rows), kc.min(k), mr));
        let mut pb_buf = scratch.allocate_elems::<T>(packed_rhs_len(kc.min(k), nc.min(n), nr));
        let mut panel_buf = scratch.allocate_elems::<T::Acc>(rows * nc.min(n));
        let mut tile_buf = scratch.allocate_elems::<T::Acc>(mr * nr);
        let pa = pa_buf.as_mut_slice::<T>();
        let pb = pb_buf.as_mut_slice::<T>();
        let panel = panel_buf.as_mut_slice::<T::Acc>();
        let tile = &mut tile_buf.as_mut_slice::<T::Acc>()[..mr * nr];

        for jc in (0..n).step_by(nc) {
            let nc_cur = nc.min(n - jc);
            for pc in (0..k).step_by(kc) {
                let kc_cur = kc.min(k - pc);
                pack_rhs(b, pb, n, pc, jc, kc_cur, nc_cur, nr);

                for ic in (0..rows).step_by(mc) {
                    let mc_cur = mc.min(rows - ic);
                    pack_lhs(a, pa, rows, k, ic, pc, mc_cur, kc_cur, mr);

                    for jr in 0..nc_cur.div_ceil(nr) {
                        let cols = nr.min(nc_cur - jr * nr);
                        let pb_panel = &pb[jr * kc_cur * nr..(jr + 1) * kc_cur * nr];
                        for ir in 0..mc_cur.div_ceil(mr) {
                            let tile_rows = mr.min(mc_cur - ir * mr);
                            let pa_panel = &pa[ir * kc_cur * mr..(ir + 1) * kc_cur * mr];
                            zero_acc(tile);
                            T::packed_tile(kernel, pa_panel, pb_panel, kc_cur, mr, nr, tile);

                            // partial tiles: only the active rows and columns
                            for r in 0..tile_rows {
                                let at = (ic + ir * mr + r) * nc_cur + jr * nr;
                                let dst = &mut panel[at..at + cols];
                                let src = &tile[r * nr..r * nr + cols];
                                if pc == 0 {
                                    dst.copy_from_slice(src);
                                } else {
                                    for (o, &v) in dst.iter_mut().zip(src) {
                                        *o += v;
                                    }
                                }
                            }
                        }
                    }
                }
            }

            let region = OutputRegion { row_offset: 0, col_offset: jc, stride: n, height: rows, width: nc_cur };
            apply_packed_output_simple(panel, nc_cur, c, region);
        }
    }

    /// Column-tile parallelism for streaming-mode kernels. Each worker owns
    /// the `hw_tile`-wide column segment of every row of its tile.
    #[allow(clippy::too_many_arguments)]
    fn parallel_column_tiles<T: Element>(
        &self,
        pool: &WorkerPool,
        a: &[T],
        b: &[T],
        c: &mut [T],
        m: usize,
        n: usize,
        k: usize,
    ) {
        let tile_n = self.tuning().hw_tile.max(1);
        let kernel = self.kernel();
        let regions = split_tiles(c, m, n, m, tile_n);
        let queue = WorkQueue::new(regions.len());

        pool.drain(pool.num_threads(), &queue, |t| {
            let j0 = t * tile_n;
            let w = tile_n.min(n - j0);
            let mut local = self.scratch().allocate_elems::<T::Acc>(m * w);
            let local = &mut local.as_mut_slice::<T::Acc>()[..m * w];

            self.kernel_scope(|| {
                for (i, acc) in local.chunks_exact_mut(w).enumerate() {
                    for p in 0..k {
                        T::axpy(kernel, a[i * k + p].to_acc(), &b[p * n + j0..p * n + j0 + w], acc);
                    }
                }
            });

            let mut region = regions[t].lock().unwrap_or_else(PoisonError::into_inner);
            for (dst, acc) in region.iter_mut().zip(local.chunks_exact(w)) {
                for (o, &v) in dst.iter_mut().zip(acc) {
                    *o = T::from_acc(v);
                }
            }
        });
    }
}
