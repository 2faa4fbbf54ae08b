//! Portable microkernel.
//!
//! Plain Rust loops written in fixed-width chunks so the autovectorizer can
//! lift them onto whatever vector unit the target has. Always available.

use super::Microkernel;
use simdmm_common::MicrokernelKind;

/// Chunk width used by the portable loops.
const CHUNK: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct PortableKernel;

impl Microkernel for PortableKernel {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn kind(&self) -> MicrokernelKind {
        MicrokernelKind::Portable
    }

    fn is_available(&self) -> bool {
        true
    }

    fn lanes_f32(&self) -> usize {
        CHUNK
    }

    fn lanes_f64(&self) -> usize {
        CHUNK / 2
    }

    #[inline]
    fn axpy_f32(&self, a: f32, b: &[f32], acc: &mut [f32]) {
        axpy(a, b, acc);
    }

    #[inline]
    fn axpy_f64(&self, a: f64, b: &[f64], acc: &mut [f64]) {
        axpy(a, b, acc);
    }

    #[inline]
    fn dot_f32(&self, a: &[f32], b: &[f32]) -> f32 {
        dot4(a, b, 0.0)
    }

    #[inline]
    fn dot_f64(&self, a: &[f64], b: &[f64]) -> f64 {
        dot4(a, b, 0.0)
    }
}

#[inline]
pub(crate) fn axpy<T>(a: T, b: &[T], acc: &mut [T])
where
    T: Copy + std::ops::Mul<Output = T> + std::ops::AddAssign,
{
    let n = acc.len();
    let b = &b[..n];
    let mut acc_chunks = acc.chunks_exact_mut(CHUNK);
    let mut b_chunks = b.chunks_exact(CHUNK);
    for (ac, bc) in (&mut acc_chunks).zip(&mut b_chunks) {
        for i in 0..CHUNK {
            ac[i] += a * bc[i];
        }
    }
    for (x, &y) in acc_chunks.into_remainder().iter_mut().zip(b_chunks.remainder()) {
        *x += a * y;
    }
}

/// Dot product with four independent partial sums.
#[inline]
pub(crate) fn dot4<T>(a: &[T], b: &[T], zero: T) -> T
where
    T: Copy + std::ops::Mul<Output = T> + std::ops::Add<Output = T>,
{
    let n = a.len().min(b.len());
    let (a, b) = (&a[..n], &b[..n]);
    let mut s = [zero; 4];
    let mut ac = a.chunks_exact(4);
    let mut bc = b.chunks_exact(4);
    for (x, y) in (&mut ac).zip(&mut bc) {
        s[0] = s[0] + x[0] * y[0];
        s[1] = s[1] + x[1] * y[1];
        s[2] = s[2] + x[2] * y[2];
        s[3] = s[3] + x[3] * y[3];
    }
    let mut tail = zero;
    for (&x, &y) in ac.remainder().iter().zip(bc.remainder()) {
        tail = tail + x * y;
    }
    (s[0] + s[1]) + (s[2] + s[3]) + tail
}
