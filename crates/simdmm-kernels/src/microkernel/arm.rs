//! ARM64 NEON microkernel.
//!
//! NEON is mandatory on AArch64, but availability is still checked at
//! construction and the portable loops are used when it is missing.
#![allow(unsafe_op_in_unsafe_fn)]

use super::Microkernel;
use super::portable;
use simdmm_common::MicrokernelKind;
use std::arch::aarch64::*;

#[derive(Debug, Clone, Copy)]
pub struct NeonKernel {
    available: bool,
}

impl NeonKernel {
    pub fn new() -> Self {
        Self { available: std::arch::is_aarch64_feature_detected!("neon") }
    }
}

impl Default for NeonKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Microkernel for NeonKernel {
    fn name(&self) -> &'static str {
        "neon"
    }

    fn kind(&self) -> MicrokernelKind {
        MicrokernelKind::Neon
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn lanes_f32(&self) -> usize {
        4
    }

    fn axpy_f32(&self, a: f32, b: &[f32], acc: &mut [f32]) {
        if self.available {
            // Safety: NEON was detected at construction.
            unsafe { axpy_f32_neon(a, b, acc) }
        } else {
            portable::axpy(a, b, acc)
        }
    }

    fn axpy_f64(&self, a: f64, b: &[f64], acc: &mut [f64]) {
        if self.available {
            unsafe { axpy_f64_neon(a, b, acc) }
        } else {
            portable::axpy(a, b, acc)
        }
    }

    fn dot_f32(&self, a: &[f32], b: &[f32]) -> f32 {
        if self.available {
            unsafe { dot_f32_neon(a, b) }
        } else {
            portable::dot4(a, b, 0.0)
        }
    }

    fn dot_f64(&self, a: &[f64], b: &[f64]) -> f64 {
        if self.available {
            unsafe { dot_f64_neon(a, b) }
        } else {
            portable::dot4(a, b, 0.0)
        }
    }

    // Row-strip parallelism outperforms per-row splitting and the packed
    // path on these cores.
    fn prefers_fine_grained_rows(&self) -> bool {
        false
    }

    fn has_packed_path(&self) -> bool {
        false
    }
}

#[target_feature(enable = "neon")]
unsafe fn axpy_f32_neon(a: f32, b: &[f32], acc: &mut [f32]) {
    let n = acc.len();
    let b = &b[..n];
    let va = vdupq_n_f32(a);
    let mut i = 0;
    while i + 4 <= n {
        let vb = vld1q_f32(b.as_ptr().add(i));
        let vc = vld1q_f32(acc.as_ptr().add(i));
        vst1q_f32(acc.as_mut_ptr().add(i), vfmaq_f32(vc, va, vb));
        i += 4;
    }
    for j in i..n {
        acc[j] = a.mul_add(b[j], acc[j]);
    }
}

#[target_feature(enable = "neon")]
unsafe fn axpy_f64_neon(a: f64, b: &[f64], acc: &mut [f64]) {
    let n = acc.len();
    let b = &b[..n];
    let va = vdupq_n_f64(a);
    let mut i = 0;
    while i + 2 <= n {
        let vb = vld1q_f64(b.as_ptr().add(i));
        let vc = vld1q_f64(acc.as_ptr().add(i));
        vst1q_f64(acc.as_mut_ptr().add(i), vfmaq_f64(vc, va, vb));
        i += 2;
    }
    for j in i..n {
        acc[j] = a.mul_add(b[j], acc[j]);
    }
}

#[target_feature(enable = "neon")]
unsafe fn dot_f32_neon(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let mut s0 = vdupq_n_f32(0.0);
    let mut s1 = vdupq_n_f32(0.0);
    let mut i = 0;
    while i + 8 <= n {
        s0 = vfmaq_f32(s0, vld1q_f32(a.as_ptr().add(i)), vld1q_f32(b.as_ptr().add(i)));
        s1 = vfmaq_f32(s1, vld1q_f32(a.as_ptr().add(i + 4)), vld1q_f32(b.as_ptr().add(i + 4)));
        i += 8;
    }
    if i + 4 <= n {
        s0 = vfmaq_f32(s0, vld1q_f32(a.as_ptr().add(i)), vld1q_f32(b.as_ptr().add(i)));
        i += 4;
    }
    let mut sum = vaddvq_f32(vaddq_f32(s0, s1));
    for j in i..n {
        sum += a[j] * b[j];
    }
    sum
}

#[target_feature(enable = "neon")]
unsafe fn dot_f64_neon(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    let mut s = vdupq_n_f64(0.0);
    let mut i = 0;
    while i + 2 <= n {
        s = vfmaq_f64(s, vld1q_f64(a.as_ptr().add(i)), vld1q_f64(b.as_ptr().add(i)));
        i += 2;
    }
    let mut sum = vaddvq_f64(s);
    for j in i..n {
        sum += a[j] * b[j];
    }
    sum
}
