//! x86_64 microkernels with AVX2+FMA and AVX-512F.
//!
//! Each kernel records at construction whether its ISA is present. When it
//! is not, every entry point runs the portable loops instead, so a kernel
//! injected on the wrong machine is slow rather than unsound.
#![allow(unsafe_op_in_unsafe_fn)]

use super::Microkernel;
use super::portable;
use simdmm_common::MicrokernelKind;
#[cfg(feature = "avx512")]
use std::arch::x86_64::*;

// ── AVX2 ────────────────────────────────────────────────────────────

#[cfg(feature = "avx2")]
#[derive(Debug, Clone, Copy)]
pub struct Avx2Kernel {
    available: bool,
}

#[cfg(feature = "avx2")]
impl Avx2Kernel {
    pub fn new() -> Self {
        Self { available: is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") }
    }
}

#[cfg(feature = "avx2")]
impl Default for Avx2Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "avx2")]
impl Microkernel for Avx2Kernel {
    fn name(&self) -> &'static str {
        "avx2"
    }

    fn kind(&self) -> MicrokernelKind {
        MicrokernelKind::Avx2
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn lanes_f32(&self) -> usize {
        8
    }

    fn axpy_f32(&self, a: f32, b: &[f32], acc: &mut [f32]) {
        if self.available {
            // Safety: AVX2 and FMA were detected at construction.
            unsafe { avx2::axpy_f32(a, b, acc) }
        } else {
            portable::axpy(a, b, acc)
        }
    }

    fn axpy_f64(&self, a: f64, b: &[f64], acc: &mut [f64]) {
        if self.available {
            unsafe { avx2::axpy_f64(a, b, acc) }
        } else {
            portable::axpy(a, b, acc)
        }
    }

    fn dot_f32(&self, a: &[f32], b: &[f32]) -> f32 {
        if self.available {
            unsafe { avx2::dot_f32(a, b) }
        } else {
            portable::dot4(a, b, 0.0)
        }
    }

    fn dot_f64(&self, a: &[f64], b: &[f64]) -> f64 {
        if self.available {
            unsafe { avx2::dot_f64(a, b) }
        } else {
            portable::dot4(a, b, 0.0)
        }
    }

    fn packed_tile_f32(&self, pa: &[f32], pb: &[f32], kc: usize, mr: usize, nr: usize, acc: &mut [f32]) {
        if self.available && mr <= 4 && (nr == 8 || nr == 16) {
            unsafe { avx2::packed_tile_f32(pa, pb, kc, mr, nr, acc) }
        } else {
            for p in 0..kc {
                let b_row = &pb[p * nr..(p + 1) * nr];
                for (r, acc_row) in acc[..mr * nr].chunks_exact_mut(nr).enumerate() {
                    self.axpy_f32(pa[p * mr + r], b_row, acc_row);
                }
            }
        }
    }
}

#[cfg(feature = "avx2")]
mod avx2 {
    use std::arch::x86_64::*;

    #[target_feature(enable = "avx2,fma")]
    pub(super) unsafe fn axpy_f32(a: f32, b: &[f32], acc: &mut [f32]) {
        let n = acc.len();
        let b = &b[..n];
        let va = _mm256_set1_ps(a);
        let mut i = 0;
        while i + 8 <= n {
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            let vc = _mm256_loadu_ps(acc.as_ptr().add(i));
            _mm256_storeu_ps(acc.as_mut_ptr().add(i), _mm256_fmadd_ps(va, vb, vc));
            i += 8;
        }
        for j in i..n {
            acc[j] = a.mul_add(b[j], acc[j]);
        }
    }

    #[target_feature(enable = "avx2,fma")]
    pub(super) unsafe fn axpy_f64(a: f64, b: &[f64], acc: &mut [f64]) {
        let n = acc.len();
        let b = &b[..n];
        let va = _mm256_set1_pd(a);
        let mut i = 0;
        while i + 4 <= n {
            let vb = _mm256_loadu_pd(b.as_ptr().add(i));
            let vc = _mm256_loadu_pd(acc.as_ptr().add(i));
            _mm256_storeu_pd(acc.as_mut_ptr().add(i), _mm256_fmadd_pd(va, vb, vc));
            i += 4;
        }
        for j in i..n {
            acc[j] = a.mul_add(b[j], acc[j]);
        }
    }

    #[target_feature(enable = "avx2,fma")]
    pub(super) unsafe fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let mut s0 = _mm256_setzero_ps();
        let mut s1 = _mm256_setzero_ps();
        let mut i = 0;
        while i + 16 <= n {
            s0 = _mm256_fmadd_ps(_mm256_loadu_ps(a.as_ptr().add(i)), _mm256_loadu_ps(b.as_ptr().add(i)), s0);
            s1 = _mm256_fmadd_ps(
                _mm256_loadu_ps(a.as_ptr().add(i + 8)),
                _mm256_loadu_ps(b.as_ptr().add(i + 8)),
                s1,
            );
            i += 16;
        }
        if i + 8 <= n {
            s0 = _mm256_fmadd_ps(_mm256_loadu_ps(a.as_ptr().add(i)), _mm256_loadu_ps(b.as_ptr().add(i)), s0);
            i += 8;
        }
        let mut sum = hsum_ps(_mm256_add_ps(s0, s1));
        for j in i..n {
            sum += a[j] * b[j];
        }
        sum
    }

    #[target_feature(enable = "avx2,fma")]
    pub(super) unsafe fn dot_f64(a: &[f64], b: &[f64]) -> f64 {
        let n = a.len().min(b.len());
        let mut s = _mm256_setzero_pd();
        let mut i = 0;
        while i + 4 <= n {
            s = _mm256_fmadd_pd(_mm256_loadu_pd(a.as_ptr().add(i)), _mm256_loadu_pd(b.as_ptr().add(i)), s);
            i += 4;
        }
        let lo = _mm256_castpd256_pd128(s);
        let hi = _mm256_extractf128_pd(s, 1);
        let pair = _mm_add_pd(lo, hi);
        let mut sum = _mm_cvtsd_f64(_mm_add_sd(pair, _mm_unpackhi_pd(pair, pair)));
        for j in i..n {
            sum += a[j] * b[j];
        }
        sum
    }

    /// Register-blocked tile for `mr <= 4` and `nr` of 8 or 16.
    #[target_feature(enable = "avx2,fma")]
    pub(super) unsafe fn packed_tile_f32(
        pa: &[f32],
        pb: &[f32],
        kc: usize,
        mr: usize,
        nr: usize,
        acc: &mut [f32],
    ) {
        assert!(pa.len() >= kc * mr && pb.len() >= kc * nr && acc.len() >= mr * nr);
        let vecs = nr / 8;
        let mut c = [[_mm256_setzero_ps(); 2]; 4];
        for r in 0..mr {
            for v in 0..vecs {
                c[r][v] = _mm256_loadu_ps(acc.as_ptr().add(r * nr + v * 8));
            }
        }
        for p in 0..kc {
            let b0 = _mm256_loadu_ps(pb.as_ptr().add(p * nr));
            let b1 = if vecs == 2 { _mm256_loadu_ps(pb.as_ptr().add(p * nr + 8)) } else { b0 };
            for r in 0..mr {
                let a = _mm256_set1_ps(*pa.get_unchecked(p * mr + r));
                c[r][0] = _mm256_fmadd_ps(a, b0, c[r][0]);
                if vecs == 2 {
                    c[r][1] = _mm256_fmadd_ps(a, b1, c[r][1]);
                }
            }
        }
        for r in 0..mr {
            for v in 0..vecs {
                _mm256_storeu_ps(acc.as_mut_ptr().add(r * nr + v * 8), c[r][v]);
            }
        }
    }

    #[target_feature(enable = "avx2")]
    unsafe fn hsum_ps(v: __m256) -> f32 {
        let lo = _mm256_castps256_ps128(v);
        let hi = _mm256_extractf128_ps(v, 1);
        let s = _mm_add_ps(lo, hi);
        let shuf = _mm_movehdup_ps(s);
        let sums = _mm_add_ps(s, shuf);
        let shuf = _mm_movehl_ps(shuf, sums);
        _mm_cvtss_f32(_mm_add_ss(sums, shuf))
    }
}

// ── AVX-512 ─────────────────────────────────────────────────────────

#[cfg(feature = "avx512")]
#[derive(Debug, Clone, Copy)]
pub struct Avx512Kernel {
    available: bool,
}

#[cfg(feature = "avx512")]
impl Avx512Kernel {
    pub fn new() -> Self {
        Self { available: is_x86_feature_detected!("avx512f") }
    }
}

#[cfg(feature = "avx512")]
impl Default for Avx512Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "avx512")]
impl Microkernel for Avx512Kernel {
    fn name(&self) -> &'static str {
        "avx512"
    }

    fn kind(&self) -> MicrokernelKind {
        MicrokernelKind::Avx512
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn lanes_f32(&self) -> usize {
        16
    }

    fn axpy_f32(&self, a: f32, b: &[f32], acc: &mut [f32]) {
        if self.available {
            // Safety: AVX-512F was detected at construction.
            unsafe { axpy_f32_avx512(a, b, acc) }
        } else {
            portable::axpy(a, b, acc)
        }
    }

    fn axpy_f64(&self, a: f64, b: &[f64], acc: &mut [f64]) {
        if self.available {
            unsafe { axpy_f64_avx512(a, b, acc) }
        } else {
            portable::axpy(a, b, acc)
        }
    }

    fn dot_f32(&self, a: &[f32], b: &[f32]) -> f32 {
        if self.available {
            unsafe { dot_f32_avx512(a, b) }
        } else {
            portable::dot4(a, b, 0.0)
        }
    }

    fn dot_f64(&self, a: &[f64], b: &[f64]) -> f64 {
        if self.available {
            unsafe { dot_f64_avx512(a, b) }
        } else {
            portable::dot4(a, b, 0.0)
        }
    }
}

#[cfg(feature = "avx512")]
#[target_feature(enable = "avx512f")]
unsafe fn axpy_f32_avx512(a: f32, b: &[f32], acc: &mut [f32]) {
    let n = acc.len();
    let b = &b[..n];
    let va = _mm512_set1_ps(a);
    let mut i = 0;
    while i + 16 <= n {
        let vb = _mm512_loadu_ps(b.as_ptr().add(i));
        let vc = _mm512_loadu_ps(acc.as_ptr().add(i));
        _mm512_storeu_ps(acc.as_mut_ptr().add(i), _mm512_fmadd_ps(va, vb, vc));
        i += 16;
    }
    for j in i..n {
        acc[j] = a.mul_add(b[j], acc[j]);
    }
}

#[cfg(feature = "avx512")]
#[target_feature(enable = "avx512f")]
unsafe fn axpy_f64_avx512(a: f64, b: &[f64], acc: &mut [f64]) {
    let n = acc.len();
    let b = &b[..n];
    let va = _mm512_set1_pd(a);
    let mut i = 0;
    while i + 8 <= n {
        let vb = _mm512_loadu_pd(b.as_ptr().add(i));
        let vc = _mm512_loadu_pd(acc.as_ptr().add(i));
        _mm512_storeu_pd(acc.as_mut_ptr().add(i), _mm512_fmadd_pd(va, vb, vc));
        i += 8;
    }
    for j in i..n {
        acc[j] = a.mul_add(b[j], acc[j]);
    }
}

#[cfg(feature = "avx512")]
#[target_feature(enable = "avx512f")]
unsafe fn dot_f32_avx512(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let mut s = _mm512_setzero_ps();
    let mut i = 0;
    while i + 16 <= n {
        s = _mm512_fmadd_ps(_mm512_loadu_ps(a.as_ptr().add(i)), _mm512_loadu_ps(b.as_ptr().add(i)), s);
        i += 16;
    }
    let mut sum = _mm512_reduce_add_ps(s);
    for j in i..n {
        sum += a[j] * b[j];
    }
    sum
}

#[cfg(feature = "avx512")]
#[target_feature(enable = "avx512f")]
unsafe fn dot_f64_avx512(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    let mut s = _mm512_setzero_pd();
    let mut i = 0;
    while i + 8 <= n {
        s = _mm512_fmadd_pd(_mm512_loadu_pd(a.as_ptr().add(i)), _mm512_loadu_pd(b.as_ptr().add(i)), s);
        i += 8;
    }
    let mut sum = _mm512_reduce_add_pd(s);
    for j in i..n {
        sum += a[j] * b[j];
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "avx2")]
    #[test]
    fn avx2_availability_matches_detection() {
        let k = Avx2Kernel::new();
        assert_eq!(k.is_available(), is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma"));
    }

    #[cfg(feature = "avx2")]
    #[test]
    fn avx2_packed_tile_matches_portable() {
        let (kc, mr, nr) = (9, 4, 16);
        let pa: Vec<f32> = (0..kc * mr).map(|i| (i % 7) as f32 - 3.0).collect();
        let pb: Vec<f32> = (0..kc * nr).map(|i| (i % 5) as f32 * 0.5).collect();
        let mut expected = vec![1.0f32; mr * nr];
        super::super::PortableKernel.packed_tile_f32(&pa, &pb, kc, mr, nr, &mut expected);
        let mut got = vec![1.0f32; mr * nr];
        Avx2Kernel::new().packed_tile_f32(&pa, &pb, kc, mr, nr, &mut got);
        assert_eq!(got, expected);
    }

    #[cfg(feature = "avx512")]
    #[test]
    fn avx512_dot_matches_portable() {
        let a: Vec<f32> = (0..53).map(|i| (i % 11) as f32).collect();
        let b: Vec<f32> = (0..53).map(|i| (i % 3) as f32 - 1.0).collect();
        let expected = portable::dot4(&a, &b, 0.0);
        assert_eq!(Avx512Kernel::new().dot_f32(&a, &b), expected);
    }
}
