//! Outer-product tile backend.
//!
//! Models a matrix extension with a persistent `TILE × TILE` accumulator
//! array: the accumulator is zeroed, fed one rank-1 update per `k`, then
//! stored. Every call must happen inside a
//! [`StreamingModeGuard`](crate::StreamingModeGuard); the accumulator state
//! does not survive a context switch to another core.

use super::Microkernel;
use super::portable;
use simdmm_common::MicrokernelKind;

/// Edge of the square accumulator tile, in `f32` elements.
pub const TILE: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct HwOuterProductKernel {
    tile: usize,
}

impl HwOuterProductKernel {
    /// Accumulator tile edge in `f32` elements.
    pub fn tile(&self) -> usize {
        self.tile
    }
}

impl Default for HwOuterProductKernel {
    fn default() -> Self {
        Self { tile: TILE }
    }
}

impl Microkernel for HwOuterProductKernel {
    fn name(&self) -> &'static str {
        "hw-outer-product"
    }

    fn kind(&self) -> MicrokernelKind {
        MicrokernelKind::HwOuterProduct
    }

    // The emulated tile unit runs anywhere; selection is gated by
    // `CpuCapabilities::outer_product`.
    fn is_available(&self) -> bool {
        true
    }

    fn lanes_f32(&self) -> usize {
        self.tile
    }

    fn axpy_f32(&self, a: f32, b: &[f32], acc: &mut [f32]) {
        portable::axpy(a, b, acc)
    }

    fn axpy_f64(&self, a: f64, b: &[f64], acc: &mut [f64]) {
        portable::axpy(a, b, acc)
    }

    fn dot_f32(&self, a: &[f32], b: &[f32]) -> f32 {
        portable::dot4(a, b, 0.0)
    }

    fn dot_f64(&self, a: &[f64], b: &[f64]) -> f64 {
        portable::dot4(a, b, 0.0)
    }

    fn outer_product_tile_f32(
        &self,
        a_t: &[f32],
        b_tile: &[f32],
        out: &mut [f32],
        m: usize,
        tile_n: usize,
        k: usize,
    ) {
        assert!(a_t.len() >= k * m, "a_t too small: {} < {}", a_t.len(), k * m);
        assert!(b_tile.len() >= k * tile_n, "b_tile too small: {} < {}", b_tile.len(), k * tile_n);
        assert!(out.len() >= m * tile_n, "out too small: {} < {}", out.len(), m * tile_n);

        let mut za = [[0.0f32; TILE]; TILE];
        for i0 in (0..m).step_by(TILE) {
            let rows = TILE.min(m - i0);
            for j0 in (0..tile_n).step_by(TILE) {
                let cols = TILE.min(tile_n - j0);

                // zero
                for row in za.iter_mut().take(rows) {
                    row[..cols].fill(0.0);
                }
                // rank-1 updates
                for p in 0..k {
                    let a_col = &a_t[p * m + i0..p * m + i0 + rows];
                    let b_row = &b_tile[p * tile_n + j0..p * tile_n + j0 + cols];
                    for (row, &a) in za.iter_mut().zip(a_col) {
                        for (z, &b) in row[..cols].iter_mut().zip(b_row) {
                            *z += a * b;
                        }
                    }
                }
                // store
                for (r, row) in za.iter().take(rows).enumerate() {
                    let start = (i0 + r) * tile_n + j0;
                    out[start..start + cols].copy_from_slice(&row[..cols]);
                }
            }
        }
    }

    fn prefers_fine_grained_rows(&self) -> bool {
        false
    }

    fn has_packed_path(&self) -> bool {
        false
    }
}
