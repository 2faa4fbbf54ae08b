//! Fused dequantize → matmul → bias → activation.
//!
//! Weights are dequantized one `[1, DEQUANT_CHUNK]` row slice at a time,
//! immediately before the microkernel consumes it, and reused for every
//! input row in the current row block. The full-precision weight matrix is
//! never materialized. Bias and activation are applied to the accumulator
//! before the single store to `output`.

use std::ops::Range;
use std::sync::PoisonError;

use super::{Activation, DequantRows, Int8Weights, NibbleFormat, NibbleWeights};
use crate::engine::MatMulEngine;
use crate::matmul::split_tiles;
use crate::pool::{WorkQueue, WorkerPool};

/// Columns dequantized per step; lives on the stack.
pub(super) const DEQUANT_CHUNK: usize = 256;
/// Input rows sharing one dequantized weight slice.
pub(super) const ROW_BLOCK: usize = 8;

#[track_caller]
pub(super) fn assert_fused_dims(input: &[f32], bias: Option<&[f32]>, output: &[f32], m: usize, k: usize, n: usize) {
    assert!(input.len() >= m * k, "input too small: need {} elements (M={m}, K={k}), got {}", m * k, input.len());
    assert!(output.len() >= m * n, "output too small: need {} elements (M={m}, N={n}), got {}", m * n, output.len());
    if let Some(bias) = bias {
        assert!(bias.len() >= n, "bias too small: need {n} elements, got {}", bias.len());
    }
}

/// Bias then activation over one output row segment covering `cols`.
#[inline]
pub(super) fn epilogue(acc: &[f32], bias: Option<&[f32]>, cols: Range<usize>, act: Activation, out: &mut [f32]) {
    match bias {
        Some(bias) => {
            for ((o, &a), &b) in out.iter_mut().zip(acc).zip(&bias[cols]) {
                *o = act.apply(a + b);
            }
        }
        None => {
            for (o, &a) in out.iter_mut().zip(acc) {
                *o = act.apply(a);
            }
        }
    }
}

impl MatMulEngine {
    /// `acc[r, c] = Σ_p input[rows.start + r, p] · W[p, cols.start + c]`.
    ///
    /// `acc` is `[rows.len(), cols.len()]` and is overwritten.
    pub(super) fn fused_block<W: DequantRows>(
        &self,
        input: &[f32],
        w: &W,
        rows: Range<usize>,
        cols: Range<usize>,
        acc: &mut [f32],
    ) {
        self.kernel_scope(|| self.fused_block_rows(input, w, rows, cols, acc));
    }

    fn fused_block_rows<W: DequantRows>(
        &self,
        input: &[f32],
        w: &W,
        rows: Range<usize>,
        cols: Range<usize>,
        acc: &mut [f32],
    ) {
        let (k, width) = (w.k(), cols.len());
        let kernel = self.kernel();
        let acc = &mut acc[..rows.len() * width];
        acc.fill(0.0);
        let mut buf = [0.0f32; DEQUANT_CHUNK];

        for c0 in (0..width).step_by(DEQUANT_CHUNK) {
            let cw = DEQUANT_CHUNK.min(width - c0);
            let wbuf = &mut buf[..cw];
            for p in 0..k {
                w.dequant_row(p, cols.start + c0, wbuf);
                for (r, i) in rows.clone().enumerate() {
                    let dst = r * width + c0;
                    kernel.axpy_f32(input[i * k + p], wbuf, &mut acc[dst..dst + cw]);
                }
            }
        }
    }

    /// Serial fused kernel over all rows; picks the outer-product tile path
    /// when the kernel and shape allow it.
    fn fused_matmul<W: DequantRows>(
        &self,
        input: &[f32],
        w: &W,
        bias: Option<&[f32]>,
        output: &mut [f32],
        m: usize,
        act: Activation,
    ) {
        let (k, n) = (w.k(), w.n());
        assert_fused_dims(input, bias, output, m, k, n);
        if m == 0 || k == 0 || n == 0 {
            return;
        }
        if self.outer_product_eligible(m, k, n) {
            self.fused_outer_product(input, w, bias, output, m, act);
            return;
        }
        let mut buf = self.scratch().allocate_elems::<f32>(ROW_BLOCK.min(m) * n);
        let acc = buf.as_mut_slice::<f32>();
        for r0 in (0..m).step_by(ROW_BLOCK) {
            let rows = r0..(r0 + ROW_BLOCK).min(m);
            let len = rows.len() * n;
            self.fused_block(input, w, rows, 0..n, acc);
            for (src, dst) in acc[..len].chunks_exact(n).zip(output[r0 * n..r0 * n + len].chunks_exact_mut(n)) {
                epilogue(src, bias, 0..n, act, dst);
            }
        }
    }

    /// Parallel fused kernel over output tiles; see
    /// [`drain_output_tiles`](Self::drain_output_tiles).
    #[allow(clippy::too_many_arguments)]
    fn parallel_fused_matmul<W: DequantRows>(
        &self,
        pool: &WorkerPool,
        input: &[f32],
        w: &W,
        bias: Option<&[f32]>,
        output: &mut [f32],
        m: usize,
        act: Activation,
    ) {
        let (k, n) = (w.k(), w.n());
        assert_fused_dims(input, bias, output, m, k, n);
        if m == 0 || k == 0 || n == 0 {
            return;
        }
        if self.outer_product_eligible(m, k, n) {
            self.parallel_fused_outer_product(pool, input, w, bias, output, m, act);
            return;
        }
        let threads = pool.num_threads();
        if threads <= 1 || m.saturating_mul(n).saturating_mul(k) < self.tuning().min_parallel_ops {
            self.fused_matmul(input, w, bias, output, m, act);
            return;
        }

        self.drain_output_tiles(pool, output, m, n, |rows, cols, tile_out| {
            let width = cols.len();
            let mut acc_buf = self.scratch().allocate_elems::<f32>(tile_out.len());
            let acc = acc_buf.as_mut_slice::<f32>();
            self.fused_block(input, w, rows, cols.clone(), acc);
            for (src, dst) in acc.chunks_exact(width).zip(tile_out.chunks_exact_mut(width)) {
                epilogue(src, bias, cols.clone(), act, dst);
            }
        });
    }

    /// Drain `(row block, column tile)` items of an `[m, n]` output on `pool`.
    ///
    /// `compute(rows, cols, tile)` fills a row-major `[rows.len(), cols.len()]`
    /// tile, which is then copied into the item's own disjoint region of
    /// `output`. Narrow `M` is split along `N` so every worker gets a share
    /// even for a single input row.
    pub(super) fn drain_output_tiles<F>(&self, pool: &WorkerPool, output: &mut [f32], m: usize, n: usize, compute: F)
    where
        F: Fn(Range<usize>, Range<usize>, &mut [f32]) + Send + Sync,
    {
        let threads = pool.num_threads();
        let rows_per_item = m.div_ceil(threads * 2).clamp(1, ROW_BLOCK);
        let row_items = m.div_ceil(rows_per_item);
        let col_tiles = if row_items >= threads { 1 } else { threads.div_ceil(row_items).min(n.div_ceil(16)).max(1) };
        let tile_w = n.div_ceil(col_tiles);
        let col_tiles = n.div_ceil(tile_w);

        let regions = split_tiles(output, m, n, rows_per_item, tile_w);
        let queue = WorkQueue::new(row_items * col_tiles);
        pool.drain(threads, &queue, |item| {
            let (ri, ci) = (item / col_tiles, item % col_tiles);
            let rows = ri * rows_per_item..((ri + 1) * rows_per_item).min(m);
            let cols = ci * tile_w..((ci + 1) * tile_w).min(n);
            let width = cols.len();

            let len = rows.len() * width;
            let mut tile_buf = self.scratch().allocate_elems::<f32>(len);
            let tile_out = &mut tile_buf.as_mut_slice::<f32>()[..len];
            compute(rows, cols, tile_out);

            let mut region = regions[item].lock().unwrap_or_else(PoisonError::into_inner);
            for (dst, src) in region.iter_mut().zip(tile_out.chunks_exact(width)) {
                dst.copy_from_slice(src);
            }
        });
    }

    // ── Int8 ─────────────────────────────────────────────────────────

    /// `output = input · dequant(weights) + bias`.
    ///
    /// # Panics
    /// If `input`, `output` or `bias` is shorter than `m`, `K` and `N` require.
    pub fn fused_int8_matmul(&self, input: &[f32], weights: &Int8Weights<'_>, bias: Option<&[f32]>, output: &mut [f32], m: usize) {
        self.fused_matmul(input, weights, bias, output, m, Activation::None)
    }

    /// `output = act(input · dequant(weights) + bias)`.
    pub fn fused_int8_matmul_act(
        &self,
        input: &[f32],
        weights: &Int8Weights<'_>,
        bias: Option<&[f32]>,
        output: &mut [f32],
        m: usize,
        activation: Activation,
    ) {
        self.fused_matmul(input, weights, bias, output, m, activation)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn parallel_fused_int8_matmul_act(
        &self,
        pool: &WorkerPool,
        input: &[f32],
        weights: &Int8Weights<'_>,
        bias: Option<&[f32]>,
        output: &mut [f32],
        m: usize,
        activation: Activation,
    ) {
        self.parallel_fused_matmul(pool, input, weights, bias, output, m, activation)
    }

    pub fn parallel_fused_int8_matmul(
        &self,
        pool: &WorkerPool,
        input: &[f32],
        weights: &Int8Weights<'_>,
        bias: Option<&[f32]>,
        output: &mut [f32],
        m: usize,
    ) {
        self.parallel_fused_matmul(pool, input, weights, bias, output, m, Activation::None)
    }

    // ── Int4 / NF4 ───────────────────────────────────────────────────

    /// Int4 counterpart of [`fused_int8_matmul`](Self::fused_int8_matmul).
    ///
    /// # Panics
    /// If `weights` is not in [`NibbleFormat::Int4`], or a buffer is too short.
    pub fn fused_int4_matmul(&self, input: &[f32], weights: &NibbleWeights<'_>, bias: Option<&[f32]>, output: &mut [f32], m: usize) {
        self.fused_int4_matmul_act(input, weights, bias, output, m, Activation::None)
    }

    pub fn fused_int4_matmul_act(
        &self,
        input: &[f32],
        weights: &NibbleWeights<'_>,
        bias: Option<&[f32]>,
        output: &mut [f32],
        m: usize,
        activation: Activation,
    ) {
        assert_format(weights, NibbleFormat::Int4);
        self.fused_matmul(input, weights, bias, output, m, activation)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn parallel_fused_int4_matmul_act(
        &self,
        pool: &WorkerPool,
        input: &[f32],
        weights: &NibbleWeights<'_>,
        bias: Option<&[f32]>,
        output: &mut [f32],
        m: usize,
        activation: Activation,
    ) {
        assert_format(weights, NibbleFormat::Int4);
        self.parallel_fused_matmul(pool, input, weights, bias, output, m, activation)
    }

    pub fn parallel_fused_int4_matmul(
        &self,
        pool: &WorkerPool,
        input: &[f32],
        weights: &NibbleWeights<'_>,
        bias: Option<&[f32]>,
        output: &mut [f32],
        m: usize,
    ) {
        self.parallel_fused_int4_matmul_act(pool, input, weights, bias, output, m, Activation::None)
    }

    /// NF4 counterpart of [`fused_int8_matmul`](Self::fused_int8_matmul).
    ///
    /// # Panics
    /// If `weights` is not in [`NibbleFormat::Nf4`], or a buffer is too short.
    pub fn fused_nf4_matmul(&self, input: &[f32], weights: &NibbleWeights<'_>, bias: Option<&[f32]>, output: &mut [f32], m: usize) {
        self.fused_nf4_matmul_act(input, weights, bias, output, m, Activation::None)
    }

    pub fn fused_nf4_matmul_act(
        &self,
        input: &[f32],
        weights: &NibbleWeights<'_>,
        bias: Option<&[f32]>,
        output: &mut [f32],
        m: usize,
        activation: Activation,
    ) {
        assert_format(weights, NibbleFormat::Nf4);
        self.fused_matmul(input, weights, bias, output, m, activation)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn parallel_fused_nf4_matmul_act(
        &self,
        pool: &WorkerPool,
        input: &[f32],
        weights: &NibbleWeights<'_>,
        bias: Option<&[f32]>,
        output: &mut [f32],
        m: usize,
        activation: Activation,
    ) {
        assert_format(weights, NibbleFormat::Nf4);
        self.parallel_fused_matmul(pool, input, weights, bias, output, m, activation)
    }

    pub fn parallel_fused_nf4_matmul(
        &self,
        pool: &WorkerPool,
        input: &[f32],
        weights: &NibbleWeights<'_>,
        bias: Option<&[f32]>,
        output: &mut [f32],
        m: usize,
    ) {
        self.parallel_fused_nf4_matmul_act(pool, input, weights, bias, output, m, Activation::None)
    }
}

#[track_caller]
pub(super) fn assert_format(weights: &NibbleWeights<'_>, expected: NibbleFormat) {
    assert_eq!(weights.format(), expected, "weights are {:?}, kernel expects {expected:?}", weights.format());
}
