//! Element types accepted by the matmul engine.
//!
//! `f32` and `f64` accumulate in their own precision. `f16` and `bf16` are
//! storage formats: they are widened to `f32`, computed with the `f32`
//! microkernel entry points, and rounded once when the result is stored.

use bytemuck::Pod;
use half::{bf16, f16};
use std::fmt::Debug;
use std::ops::{Add, AddAssign, Mul, Sub};

use crate::microkernel::Microkernel;

/// Accumulator type used inside kernels.
pub trait Accum:
    Copy
    + Default
    + Debug
    + PartialEq
    + PartialOrd
    + Send
    + Sync
    + Pod
    + Add<Output = Self>
    + AddAssign
    + Sub<Output = Self>
    + Mul<Output = Self>
    + 'static
{
    const ZERO: Self;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl Accum for f32 {
    const ZERO: Self = 0.0;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Accum for f64 {
    const ZERO: Self = 0.0;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

/// A matrix element type, with dispatch into the typed microkernel entry
/// points.
pub trait Element: Copy + Default + Debug + PartialEq + Send + Sync + Pod + 'static {
    type Acc: Accum;

    /// Short type name for logs and benchmark labels.
    const NAME: &'static str;

    fn to_acc(self) -> Self::Acc;
    fn from_acc(acc: Self::Acc) -> Self;

    #[inline]
    fn zero() -> Self {
        Self::from_acc(<Self::Acc as Accum>::ZERO)
    }

    /// Vector width of `kernel` for this element type.
    fn lanes(kernel: &dyn Microkernel) -> usize;

    /// `acc[j] += a * b[j]` for every `j < acc.len()`.
    fn axpy(kernel: &dyn Microkernel, a: Self::Acc, b: &[Self], acc: &mut [Self::Acc]);

    /// Inner product of two equal-length slices.
    fn dot(kernel: &dyn Microkernel, a: &[Self], b: &[Self]) -> Self::Acc;

    /// Packed micro-tile: `acc[r * nr + c] += Σ_p pa[p * mr + r] * pb[p * nr + c]`.
    fn packed_tile(
        kernel: &dyn Microkernel,
        pa: &[Self],
        pb: &[Self],
        kc: usize,
        mr: usize,
        nr: usize,
        acc: &mut [Self::Acc],
    );
}

impl Element for f32 {
    type Acc = f32;
    const NAME: &'static str = "f32";

    #[inline]
    fn to_acc(self) -> f32 {
        self
    }

    #[inline]
    fn from_acc(acc: f32) -> Self {
        acc
    }

    #[inline]
    fn lanes(kernel: &dyn Microkernel) -> usize {
        kernel.lanes_f32()
    }

    #[inline]
    fn axpy(kernel: &dyn Microkernel, a: f32, b: &[f32], acc: &mut [f32]) {
        kernel.axpy_f32(a, b, acc);
    }

    #[inline]
    fn dot(kernel: &dyn Microkernel, a: &[f32], b: &[f32]) -> f32 {
        kernel.dot_f32(a, b)
    }

    #[inline]
    fn packed_tile(
        kernel: &dyn Microkernel,
        pa: &[f32],
        pb: &[f32],
        kc: usize,
        mr: usize,
        nr: usize,
        acc: &mut [f32],
    ) {
        kernel.packed_tile_f32(pa, pb, kc, mr, nr, acc);
    }
}

impl Element for f64 {
    type Acc = f64;
    const NAME: &'static str = "f64";

    #[inline]
    fn to_acc(self) -> f64 {
        self
    }

    #[inline]
    fn from_acc(acc: f64) -> Self {
        acc
    }

    #[inline]
    fn lanes(kernel: &dyn Microkernel) -> usize {
        kernel.lanes_f64()
    }

    #[inline]
    fn axpy(kernel: &dyn Microkernel, a: f64, b: &[f64], acc: &mut [f64]) {
        kernel.axpy_f64(a, b, acc);
    }

    #[inline]
    fn dot(kernel: &dyn Microkernel, a: &[f64], b: &[f64]) -> f64 {
        kernel.dot_f64(a, b)
    }

    #[inline]
    fn packed_tile(
        kernel: &dyn Microkernel,
        pa: &[f64],
        pb: &[f64],
        kc: usize,
        mr: usize,
        nr: usize,
        acc: &mut [f64],
    ) {
        kernel.packed_tile_f64(pa, pb, kc, mr, nr, acc);
    }
}

// ── Half-precision storage types ───────────────────────────────────

/// Widening chunk for half-precision operands.
const WIDEN_CHUNK: usize = 64;

/// Widen `src` into the front of `dst` and return the widened prefix.
#[inline]
fn widen<'a, T: Copy>(src: &[T], dst: &'a mut [f32; WIDEN_CHUNK], to_f32: fn(T) -> f32) -> &'a [f32] {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = to_f32(s);
    }
    &dst[..src.len()]
}

fn half_axpy<T: Copy>(
    kernel: &dyn Microkernel,
    a: f32,
    b: &[T],
    acc: &mut [f32],
    to_f32: fn(T) -> f32,
) {
    let mut tmp = [0.0f32; WIDEN_CHUNK];
    for (acc_chunk, b_chunk) in acc.chunks_mut(WIDEN_CHUNK).zip(b.chunks(WIDEN_CHUNK)) {
        let wide = widen(&b_chunk[..acc_chunk.len()], &mut tmp, to_f32);
        kernel.axpy_f32(a, wide, acc_chunk);
    }
}

fn half_dot<T: Copy>(kernel: &dyn Microkernel, a: &[T], b: &[T], to_f32: fn(T) -> f32) -> f32 {
    let mut ta = [0.0f32; WIDEN_CHUNK];
    let mut tb = [0.0f32; WIDEN_CHUNK];
    let mut sum = 0.0f32;
    for (ca, cb) in a.chunks(WIDEN_CHUNK).zip(b.chunks(WIDEN_CHUNK)) {
        let len = ca.len().min(cb.len());
        let wa = widen(&ca[..len], &mut ta, to_f32);
        let wb = widen(&cb[..len], &mut tb, to_f32);
        sum += kernel.dot_f32(wa, wb);
    }
    sum
}

fn half_packed_tile<T: Copy>(
    kernel: &dyn Microkernel,
    pa: &[T],
    pb: &[T],
    (kc, mr, nr): (usize, usize, usize),
    acc: &mut [f32],
    to_f32: fn(T) -> f32,
) {
    let mut tmp = [0.0f32; WIDEN_CHUNK];
    for p in 0..kc {
        let b_row = &pb[p * nr..(p + 1) * nr];
        for r in 0..mr {
            let a = to_f32(pa[p * mr + r]);
            let acc_row = &mut acc[r * nr..(r + 1) * nr];
            for (acc_chunk, b_chunk) in acc_row.chunks_mut(WIDEN_CHUNK).zip(b_row.chunks(WIDEN_CHUNK)) {
                let wide = widen(b_chunk, &mut tmp, to_f32);
                kernel.axpy_f32(a, wide, acc_chunk);
            }
        }
    }
}

macro_rules! half_element {
    ($ty:ty, $name:literal) => {
        impl Element for $ty {
            type Acc = f32;
            const NAME: &'static str = $name;

            #[inline]
            fn to_acc(self) -> f32 {
                self.to_f32()
            }

            #[inline]
            fn from_acc(acc: f32) -> Self {
                <$ty>::from_f32(acc)
            }

            #[inline]
            fn lanes(kernel: &dyn Microkernel) -> usize {
                kernel.lanes_f32()
            }

            fn axpy(kernel: &dyn Microkernel, a: f32, b: &[Self], acc: &mut [f32]) {
                half_axpy(kernel, a, b, acc, <$ty>::to_f32);
            }

            fn dot(kernel: &dyn Microkernel, a: &[Self], b: &[Self]) -> f32 {
                half_dot(kernel, a, b, <$ty>::to_f32)
            }

            fn packed_tile(
                kernel: &dyn Microkernel,
                pa: &[Self],
                pb: &[Self],
                kc: usize,
                mr: usize,
                nr: usize,
                acc: &mut [f32],
            ) {
                half_packed_tile(kernel, pa, pb, (kc, mr, nr), acc, <$ty>::to_f32);
            }
        }
    };
}

half_element!(f16, "f16");
half_element!(bf16, "bf16");
