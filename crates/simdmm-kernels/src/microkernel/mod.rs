//! Microkernel backends.
//!
//! A [`Microkernel`] supplies the innermost vector primitives every matmul
//! algorithm is built from: a row update (`axpy`), an inner product (`dot`),
//! a packed GEBP micro-tile, and an outer-product tile. Algorithms never
//! branch on the ISA; they receive a resolved kernel from the engine.

use simdmm_common::MicrokernelKind;
use std::sync::Arc;

mod outer_product;
mod portable;

#[cfg(all(target_arch = "x86_64", any(feature = "avx2", feature = "avx512")))]
mod x86;

#[cfg(all(target_arch = "aarch64", feature = "neon"))]
mod arm;

pub use outer_product::HwOuterProductKernel;
pub use portable::PortableKernel;

#[cfg(all(target_arch = "x86_64", feature = "avx2"))]
pub use x86::Avx2Kernel;
#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
pub use x86::Avx512Kernel;

#[cfg(all(target_arch = "aarch64", feature = "neon"))]
pub use arm::NeonKernel;

/// Innermost multiply-accumulate primitives for one instruction set.
///
/// Slices passed to `axpy_*` may be longer than `acc`; only the first
/// `acc.len()` elements of `b` are read. `dot_*` reads `min(a.len(), b.len())`
/// elements.
pub trait Microkernel: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> MicrokernelKind;
    fn is_available(&self) -> bool;

    /// `f32` elements per vector register.
    fn lanes_f32(&self) -> usize;

    /// `f64` elements per vector register.
    fn lanes_f64(&self) -> usize {
        (self.lanes_f32() / 2).max(1)
    }

    /// Register tile `(mr, nr)` used by the packed GEBP path.
    fn micro_tile(&self) -> (usize, usize) {
        (4, (2 * self.lanes_f32()).min(16))
    }

    /// `acc[j] += a * b[j]`.
    fn axpy_f32(&self, a: f32, b: &[f32], acc: &mut [f32]);
    /// `acc[j] += a * b[j]`.
    fn axpy_f64(&self, a: f64, b: &[f64], acc: &mut [f64]);

    fn dot_f32(&self, a: &[f32], b: &[f32]) -> f32;
    fn dot_f64(&self, a: &[f64], b: &[f64]) -> f64;

    /// GEBP micro-kernel over packed panels: `pa` is `[kc, mr]`, `pb` is
    /// `[kc, nr]`, `acc` is the row-major `[mr, nr]` tile.
    fn packed_tile_f32(&self, pa: &[f32], pb: &[f32], kc: usize, mr: usize, nr: usize, acc: &mut [f32]) {
        for p in 0..kc {
            let b_row = &pb[p * nr..(p + 1) * nr];
            for (r, acc_row) in acc[..mr * nr].chunks_exact_mut(nr).enumerate() {
                self.axpy_f32(pa[p * mr + r], b_row, acc_row);
            }
        }
    }

    /// `f64` counterpart of [`Microkernel::packed_tile_f32`].
    fn packed_tile_f64(&self, pa: &[f64], pb: &[f64], kc: usize, mr: usize, nr: usize, acc: &mut [f64]) {
        for p in 0..kc {
            let b_row = &pb[p * nr..(p + 1) * nr];
            for (r, acc_row) in acc[..mr * nr].chunks_exact_mut(nr).enumerate() {
                self.axpy_f64(pa[p * mr + r], b_row, acc_row);
            }
        }
    }

    /// Outer-product tile: `out[i, j] = Σ_p a_t[p, i] * b_tile[p, j]` where
    /// `a_t` is `[k, m]` (transposed A), `b_tile` is `[k, tile_n]` and `out`
    /// is `[m, tile_n]`. Overwrites `out`.
    fn outer_product_tile_f32(
        &self,
        a_t: &[f32],
        b_tile: &[f32],
        out: &mut [f32],
        m: usize,
        tile_n: usize,
        k: usize,
    ) {
        let out = &mut out[..m * tile_n];
        out.fill(0.0);
        for p in 0..k {
            let b_row = &b_tile[p * tile_n..(p + 1) * tile_n];
            let a_col = &a_t[p * m..(p + 1) * m];
            for (out_row, &a) in out.chunks_exact_mut(tile_n).zip(a_col) {
                self.axpy_f32(a, b_row, out_row);
            }
        }
    }

    /// Must run inside a [`StreamingModeGuard`](crate::StreamingModeGuard).
    fn requires_streaming_mode(&self) -> bool {
        self.kind().requires_streaming_mode()
    }

    /// Whether the dispatcher should split narrow-M problems row by row.
    fn prefers_fine_grained_rows(&self) -> bool {
        true
    }

    /// Whether the dispatcher may route very large problems to the packed
    /// GEBP path.
    fn has_packed_path(&self) -> bool {
        true
    }
}

/// Construct the kernel for `kind`. Kernels whose ISA is missing at runtime
/// still work: they report `is_available() == false` and run the portable
/// loops.
pub fn kernel_for(kind: MicrokernelKind) -> Arc<dyn Microkernel> {
    match kind {
        MicrokernelKind::Portable => Arc::new(PortableKernel),
        MicrokernelKind::HwOuterProduct => Arc::new(HwOuterProductKernel::default()),
        #[cfg(all(target_arch = "x86_64", feature = "avx2"))]
        MicrokernelKind::Avx2 => Arc::new(Avx2Kernel::new()),
        #[cfg(all(target_arch = "x86_64", feature = "avx512"))]
        MicrokernelKind::Avx512 => Arc::new(Avx512Kernel::new()),
        #[cfg(all(target_arch = "aarch64", feature = "neon"))]
        MicrokernelKind::Neon => Arc::new(NeonKernel::new()),
        #[allow(unreachable_patterns)]
        other => {
            log::debug!("{other} kernel not compiled for this target, using portable");
            Arc::new(PortableKernel)
        }
    }
}
