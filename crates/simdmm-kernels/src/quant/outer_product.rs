//! Fused quantized matmul on outer-product tile backends.
//!
//! `N` is cut into `hw_tile`-wide tiles. For each tile the weights are
//! dequantized into a `[K, hw_tile]` panel, the kernel accumulates the whole
//! `[M, hw_tile]` output tile from the transposed input, and the epilogue
//! writes it out. Tile computation runs inside a
//! [`StreamingModeGuard`](crate::StreamingModeGuard).

use std::sync::PoisonError;

use super::fused::epilogue;
use super::{Activation, DequantRows};
use crate::engine::MatMulEngine;
use crate::matmul::split_tiles;
use crate::pool::{WorkQueue, WorkerPool};
use crate::streaming::StreamingModeGuard;

impl MatMulEngine {
    /// Whether the fused kernels take the tile path for this shape.
    ///
    /// Requires a streaming-mode kernel, `K` and `N` multiples of
    /// `hw_tile`, and every dimension at least `hw_min_dim`.
    pub fn outer_product_eligible(&self, m: usize, k: usize, n: usize) -> bool {
        let t = self.tuning();
        if !self.kernel().requires_streaming_mode() {
            return false;
        }
        let tile = t.hw_tile.max(1);
        let eligible = k % tile == 0 && n % tile == 0 && m >= t.hw_min_dim && k >= t.hw_min_dim && n >= t.hw_min_dim;
        if !eligible {
            log::debug!("fused {m}x{k}x{n}: shape not tile-aligned, using the row path");
        }
        eligible
    }

    /// `[M, K]` input transposed to `[K, M]`.
    fn transpose_input(&self, input: &[f32], m: usize, k: usize) -> simdmm_common::PooledBuffer {
        let mut buf = self.scratch().allocate_elems::<f32>(k * m);
        let a_t = buf.as_mut_slice::<f32>();
        for i in 0..m {
            for p in 0..k {
                a_t[p * m + i] = input[i * k + p];
            }
        }
        buf
    }

    /// Compute output tile `tile` into `out` (`[m, hw_tile]`, pre-activation).
    fn outer_product_tile<W: DequantRows>(&self, a_t: &[f32], w: &W, m: usize, tile: usize, out: &mut [f32]) {
        let (k, tn) = (w.k(), self.tuning().hw_tile.max(1));
        let mut panel_buf = self.scratch().allocate_elems::<f32>(k * tn);
        let panel = &mut panel_buf.as_mut_slice::<f32>()[..k * tn];
        for (p, row) in panel.chunks_exact_mut(tn).enumerate() {
            w.dequant_row(p, tile * tn, row);
        }
        let _guard = StreamingModeGuard::acquire();
        self.kernel().outer_product_tile_f32(a_t, panel, out, m, tn, k);
    }

    /// Epilogue of tile `tile` into its per-row output segments.
    fn write_tile<'o>(
        out_tile: &[f32],
        bias: Option<&[f32]>,
        act: Activation,
        segments: impl Iterator<Item = &'o mut [f32]>,
        (tn, tile): (usize, usize),
    ) {
        let j0 = tile * tn;
        for (src, dst) in out_tile.chunks_exact(tn).zip(segments) {
            epilogue(src, bias, j0..j0 + tn, act, dst);
        }
    }

    pub(super) fn fused_outer_product<W: DequantRows>(
        &self,
        input: &[f32],
        w: &W,
        bias: Option<&[f32]>,
        output: &mut [f32],
        m: usize,
        act: Activation,
    ) {
        let (k, n, tn) = (w.k(), w.n(), self.tuning().hw_tile.max(1));
        let a_t_buf = self.transpose_input(input, m, k);
        let a_t = a_t_buf.as_slice::<f32>();
        let mut tile_buf = self.scratch().allocate_elems::<f32>(m * tn);
        let out_tile = &mut tile_buf.as_mut_slice::<f32>()[..m * tn];

        for tile in 0..n / tn {
            self.outer_product_tile(a_t, w, m, tile, out_tile);
            let j0 = tile * tn;
            let segments = output[..m * n].chunks_exact_mut(n).map(|row| &mut row[j0..j0 + tn]);
            Self::write_tile(out_tile, bias, act, segments, (tn, tile));
        }
    }

    /// Parallel over `N` tiles once there are at least
    /// `min_fused_parallel_tiles` of them; each worker holds its own guard.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn parallel_fused_outer_product<W: DequantRows>(
        &self,
        pool: &WorkerPool,
        input: &[f32],
        w: &W,
        bias: Option<&[f32]>,
        output: &mut [f32],
        m: usize,
        act: Activation,
    ) {
        let (k, n, tn) = (w.k(), w.n(), self.tuning().hw_tile.max(1));
        let tiles = n / tn;
        if tiles < self.tuning().min_fused_parallel_tiles || pool.num_threads() <= 1 {
            self.fused_outer_product(input, w, bias, output, m, act);
            return;
        }

        let a_t_buf = self.transpose_input(input, m, k);
        let a_t = a_t_buf.as_slice::<f32>();
        // one region per column tile: `tn`-wide segments of every row
        let regions = split_tiles(output, m, n, m, tn);
        let queue = WorkQueue::new(tiles);
        pool.drain(pool.num_threads(), &queue, |tile| {
            let mut tile_buf = self.scratch().allocate_elems::<f32>(m * tn);
            let out_tile = &mut tile_buf.as_mut_slice::<f32>()[..m * tn];
            self.outer_product_tile(a_t, w, m, tile, out_tile);

            let mut region = regions[tile].lock().unwrap_or_else(PoisonError::into_inner);
            Self::write_tile(out_tile, bias, act, region.iter_mut().map(|s| &mut **s), (tn, tile));
        });
    }
}
