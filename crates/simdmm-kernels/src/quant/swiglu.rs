//! Fused SwiGLU: `output = SiLU(input · W_gate) * (input · W_up)`.
//!
//! Both projections are accumulated block by block and combined before
//! the store; neither intermediate `[M, N]` tensor exists.

use std::ops::Range;

use super::fused::{ROW_BLOCK, assert_format};
use super::{Activation, NibbleFormat, NibbleWeights};
use crate::engine::MatMulEngine;
use crate::pool::WorkerPool;

#[track_caller]
fn assert_swiglu(input: &[f32], gate: &NibbleWeights<'_>, up: &NibbleWeights<'_>, output: &[f32], m: usize) {
    assert!(
        gate.k() == up.k() && gate.n() == up.n(),
        "gate is {}x{} but up is {}x{}",
        gate.k(),
        gate.n(),
        up.k(),
        up.n()
    );
    let (k, n) = (gate.k(), gate.n());
    assert!(input.len() >= m * k, "input too small: need {} elements (M={m}, K={k}), got {}", m * k, input.len());
    assert!(output.len() >= m * n, "output too small: need {} elements (M={m}, N={n}), got {}", m * n, output.len());
}

impl MatMulEngine {
    /// Gate and up projections of one tile, combined into `out`.
    fn swiglu_block(
        &self,
        input: &[f32],
        gate: &NibbleWeights<'_>,
        up: &NibbleWeights<'_>,
        rows: Range<usize>,
        cols: Range<usize>,
        out: &mut [f32],
    ) {
        let len = rows.len() * cols.len();
        let mut gate_buf = self.scratch().allocate_elems::<f32>(len);
        let mut up_buf = self.scratch().allocate_elems::<f32>(len);
        let gate_acc = gate_buf.as_mut_slice::<f32>();
        let up_acc = up_buf.as_mut_slice::<f32>();
        self.fused_block(input, gate, rows.clone(), cols.clone(), gate_acc);
        self.fused_block(input, up, rows, cols, up_acc);
        for ((o, &g), &u) in out[..len].iter_mut().zip(&gate_acc[..len]).zip(&up_acc[..len]) {
            *o = Activation::Silu.apply(g) * u;
        }
    }

    fn swiglu(
        &self,
        pool: Option<&WorkerPool>,
        input: &[f32],
        gate: &NibbleWeights<'_>,
        up: &NibbleWeights<'_>,
        output: &mut [f32],
        m: usize,
    ) {
        assert_swiglu(input, gate, up, output, m);
        let (k, n) = (gate.k(), gate.n());
        if m == 0 || k == 0 || n == 0 {
            return;
        }

        let parallel = pool.filter(|p| {
            p.num_threads() > 1 && m.saturating_mul(n).saturating_mul(k) >= self.tuning().min_parallel_ops
        });
        match parallel {
            Some(pool) => self.drain_output_tiles(pool, output, m, n, |rows, cols, tile| {
                self.swiglu_block(input, gate, up, rows, cols, tile)
            }),
            None => {
                for r0 in (0..m).step_by(ROW_BLOCK) {
                    let rows = r0..(r0 + ROW_BLOCK).min(m);
                    let out = &mut output[r0 * n..rows.end * n];
                    self.swiglu_block(input, gate, up, rows, 0..n, out);
                }
            }
        }
    }

    /// Int4 SwiGLU.
    ///
    /// # Panics
    /// If either projection is not Int4, their shapes differ, or a buffer is
    /// too short.
    pub fn fused_int4_matmul_swiglu(
        &self,
        input: &[f32],
        gate: &NibbleWeights<'_>,
        up: &NibbleWeights<'_>,
        output: &mut [f32],
        m: usize,
    ) {
        assert_format(gate, NibbleFormat::Int4);
        assert_format(up, NibbleFormat::Int4);
        self.swiglu(None, input, gate, up, output, m)
    }

    /// NF4 SwiGLU.
    ///
    /// # Panics
    /// If either projection is not NF4, their shapes differ, or a buffer is
    /// too short.
    pub fn fused_nf4_matmul_swiglu(
        &self,
        input: &[f32],
        gate: &NibbleWeights<'_>,
        up: &NibbleWeights<'_>,
        output: &mut [f32],
        m: usize,
    ) {
        assert_format(gate, NibbleFormat::Nf4);
        assert_format(up, NibbleFormat::Nf4);
        self.swiglu(None, input, gate, up, output, m)
    }

    pub fn parallel_fused_int4_matmul_swiglu(
        &self,
        pool: &WorkerPool,
        input: &[f32],
        gate: &NibbleWeights<'_>,
        up: &NibbleWeights<'_>,
        output: &mut [f32],
        m: usize,
    ) {
        assert_format(gate, NibbleFormat::Int4);
        assert_format(up, NibbleFormat::Int4);
        self.swiglu(Some(pool), input, gate, up, output, m)
    }

    pub fn parallel_fused_nf4_matmul_swiglu(
        &self,
        pool: &WorkerPool,
        input: &[f32],
        gate: &NibbleWeights<'_>,
        up: &NibbleWeights<'_>,
        output: &mut [f32],
        m: usize,
    ) {
        assert_format(gate, NibbleFormat::Nf4);
        assert_format(up, NibbleFormat::Nf4);
        self.swiglu(Some(pool), input, gate, up, output, m)
    }
}
