//! Low-bit quantized weights and the kernels that consume them.
//!
//! Group quantization: weights are `[K, N]` row-major and every row of `K`
//! carries `ceil(N / group_size)` scales, so the scale of weight `(k, n)` is
//! `scales[k * num_groups + n / group_size]`.
//!
//! Nibble formats pack two 4-bit codes per byte; the even flattened index
//! `k * N + n` sits in the low nibble.

mod affine;
mod fused;
mod int8x8;
mod outer_product;
mod swiglu;

pub use affine::{AffineParams, dequantize_affine, dequantize_i32, dequantize_u8, quantize_affine, quantize_u8};
pub use int8x8::{int8x8_matmul, int8x8_matmul_per_axis};

use std::fmt;
use std::str::FromStr;

use simdmm_common::{MatMulError, Result, ensure_len};

// ── Activation ──────────────────────────────────────────────────────

/// Activation applied after bias in the fused kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Activation {
    /// Identity.
    #[default]
    None,
    /// x · σ(x)
    Silu,
    /// x · 0.5 · (1 + erf(x / √2))
    Gelu,
    /// x · σ(1.702 x)
    GeluApprox,
    /// max(0, x), preserving NaN
    Relu,
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::None => x,
            Activation::Silu => x * sigmoid(x),
            Activation::Gelu => x * 0.5 * (1.0 + libm::erff(x * std::f32::consts::FRAC_1_SQRT_2)),
            Activation::GeluApprox => x * sigmoid(1.702 * x),
            Activation::Relu => {
                if x.is_nan() {
                    x
                } else {
                    x.max(0.0)
                }
            }
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::None => write!(f, "none"),
            Activation::Silu => write!(f, "silu"),
            Activation::Gelu => write!(f, "gelu"),
            Activation::GeluApprox => write!(f, "gelu-approx"),
            Activation::Relu => write!(f, "relu"),
        }
    }
}

impl FromStr for Activation {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "identity" | "linear" => Ok(Self::None),
            "silu" | "swish" => Ok(Self::Silu),
            "gelu" => Ok(Self::Gelu),
            "gelu-approx" | "gelu_approx" | "quick-gelu" => Ok(Self::GeluApprox),
            "relu" => Ok(Self::Relu),
            other => Err(format!("unknown activation: {other}")),
        }
    }
}

// ── Weight descriptors ──────────────────────────────────────────────

/// NormalFloat4 levels (QLoRA), indexed by nibble.
pub const NF4_CODEBOOK: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// Interpretation of a 4-bit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NibbleFormat {
    /// Signed integer: `(nibble - 8) * scale`.
    Int4,
    /// Codebook: `NF4_CODEBOOK[nibble] * scale`.
    Nf4,
}

impl NibbleFormat {
    #[inline]
    fn decode(self, nibble: u8) -> f32 {
        match self {
            NibbleFormat::Int4 => (nibble as i32 - 8) as f32,
            NibbleFormat::Nf4 => NF4_CODEBOOK[(nibble & 0x0f) as usize],
        }
    }
}

fn check_groups(k: usize, n: usize, group_size: usize, scales: usize) -> Result<usize> {
    if group_size == 0 {
        return Err(MatMulError::InvalidGroupSize { group_size, n });
    }
    let num_groups = n.div_ceil(group_size);
    ensure_len("scales", k * num_groups, scales)?;
    Ok(num_groups)
}

/// Borrowed int8 weights `[K, N]` with per-group scales.
#[derive(Debug, Clone, Copy)]
pub struct Int8Weights<'a> {
    data: &'a [i8],
    scales: &'a [f32],
    k: usize,
    n: usize,
    group_size: usize,
    num_groups: usize,
}

impl<'a> Int8Weights<'a> {
    pub fn new(data: &'a [i8], scales: &'a [f32], k: usize, n: usize, group_size: usize) -> Result<Self> {
        ensure_len("weights", k * n, data.len())?;
        let num_groups = check_groups(k, n, group_size, scales.len())?;
        Ok(Self { data, scales, k, n, group_size, num_groups })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }
}

/// Borrowed 4-bit weights `[K, N]`, two codes per byte, with per-group scales.
#[derive(Debug, Clone, Copy)]
pub struct NibbleWeights<'a> {
    data: &'a [u8],
    scales: &'a [f32],
    k: usize,
    n: usize,
    group_size: usize,
    num_groups: usize,
    format: NibbleFormat,
}

impl<'a> NibbleWeights<'a> {
    pub fn new(
        data: &'a [u8],
        scales: &'a [f32],
        k: usize,
        n: usize,
        group_size: usize,
        format: NibbleFormat,
    ) -> Result<Self> {
        let codes = k * n;
        ensure_len("packed weights", codes.div_ceil(2), data.len())?;
        // odd code counts leave the high nibble of the last byte as padding
        if codes % 2 == 1 && data[codes / 2] >> 4 != 0 {
            return Err(MatMulError::InvalidPacking {
                reason: format!("padding nibble after {codes} codes is {:#x}, expected 0", data[codes / 2] >> 4),
            });
        }
        let num_groups = check_groups(k, n, group_size, scales.len())?;
        Ok(Self { data, scales, k, n, group_size, num_groups, format })
    }

    pub fn int4(data: &'a [u8], scales: &'a [f32], k: usize, n: usize, group_size: usize) -> Result<Self> {
        Self::new(data, scales, k, n, group_size, NibbleFormat::Int4)
    }

    pub fn nf4(data: &'a [u8], scales: &'a [f32], k: usize, n: usize, group_size: usize) -> Result<Self> {
        Self::new(data, scales, k, n, group_size, NibbleFormat::Nf4)
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn format(&self) -> NibbleFormat {
        self.format
    }
}

/// Row-wise dequantization used by the fused kernels.
pub(crate) trait DequantRows: Sync {
    fn k(&self) -> usize;
    fn n(&self) -> usize;
    /// Dequantize row `p`, columns `j0..j0 + out.len()`, into `out`.
    fn dequant_row(&self, p: usize, j0: usize, out: &mut [f32]);
}

impl DequantRows for Int8Weights<'_> {
    fn k(&self) -> usize {
        self.k
    }

    fn n(&self) -> usize {
        self.n
    }

    fn dequant_row(&self, p: usize, j0: usize, out: &mut [f32]) {
        let row = &self.data[p * self.n + j0..p * self.n + j0 + out.len()];
        let scales = &self.scales[p * self.num_groups..(p + 1) * self.num_groups];
        for (t, (o, &q)) in out.iter_mut().zip(row).enumerate() {
            *o = q as f32 * scales[(j0 + t) / self.group_size];
        }
    }
}

impl DequantRows for NibbleWeights<'_> {
    fn k(&self) -> usize {
        self.k
    }

    fn n(&self) -> usize {
        self.n
    }

    fn dequant_row(&self, p: usize, j0: usize, out: &mut [f32]) {
        let scales = &self.scales[p * self.num_groups..(p + 1) * self.num_groups];
        let base = p * self.n + j0;
        for (t, o) in out.iter_mut().enumerate() {
            let nibble = nibble_at(self.data, base + t);
            *o = self.format.decode(nibble) * scales[(j0 + t) / self.group_size];
        }
    }
}

#[inline]
fn nibble_at(packed: &[u8], idx: usize) -> u8 {
    let byte = packed[idx / 2];
    if idx % 2 == 0 { byte & 0x0f } else { byte >> 4 }
}

// ── Weight builders ─────────────────────────────────────────────────

/// Pack 4-bit codes two per byte, even index in the low nibble.
pub fn pack_nibbles(codes: &[u8]) -> Vec<u8> {
    codes
        .chunks(2)
        .map(|pair| {
            let lo = pair[0] & 0x0f;
            let hi = pair.get(1).map_or(0, |&h| h & 0x0f);
            lo | (hi << 4)
        })
        .collect()
}

/// Inverse of [`pack_nibbles`] for the first `len` codes.
pub fn unpack_nibbles(packed: &[u8], len: usize) -> Vec<u8> {
    (0..len).map(|i| nibble_at(packed, i)).collect()
}

/// Per-group absmax of each `K` row, flattened as `[K, num_groups]`.
fn group_absmax(weights: &[f32], k: usize, n: usize, group_size: usize) -> Result<(Vec<f32>, usize)> {
    ensure_len("weights", k * n, weights.len())?;
    if group_size == 0 {
        return Err(MatMulError::InvalidGroupSize { group_size, n });
    }
    let num_groups = n.div_ceil(group_size);
    let mut absmax = vec![0.0f32; k * num_groups];
    for p in 0..k {
        for (j, &w) in weights[p * n..(p + 1) * n].iter().enumerate() {
            let slot = &mut absmax[p * num_groups + j / group_size];
            *slot = slot.max(w.abs());
        }
    }
    Ok((absmax, num_groups))
}

fn scale_from(absmax: f32, levels: f32) -> f32 {
    if absmax > 0.0 { absmax / levels } else { 1.0 }
}

/// Symmetric int8 group quantization. Returns `(codes [K, N], scales)`.
pub fn quantize_int8_weights(weights: &[f32], k: usize, n: usize, group_size: usize) -> Result<(Vec<i8>, Vec<f32>)> {
    let (absmax, num_groups) = group_absmax(weights, k, n, group_size)?;
    let scales: Vec<f32> = absmax.iter().map(|&a| scale_from(a, 127.0)).collect();
    let mut codes = vec![0i8; k * n];
    for p in 0..k {
        for j in 0..n {
            let s = scales[p * num_groups + j / group_size];
            codes[p * n + j] = (weights[p * n + j] / s).round().clamp(-127.0, 127.0) as i8;
        }
    }
    Ok((codes, scales))
}

/// Symmetric int4 group quantization, packed. Returns `(packed, scales)`.
pub fn quantize_int4_weights(weights: &[f32], k: usize, n: usize, group_size: usize) -> Result<(Vec<u8>, Vec<f32>)> {
    let (absmax, num_groups) = group_absmax(weights, k, n, group_size)?;
    let scales: Vec<f32> = absmax.iter().map(|&a| scale_from(a, 7.0)).collect();
    let mut codes = vec![0u8; k * n];
    for p in 0..k {
        for j in 0..n {
            let s = scales[p * num_groups + j / group_size];
            let q = (weights[p * n + j] / s).round().clamp(-8.0, 7.0) as i32;
            codes[p * n + j] = (q + 8) as u8;
        }
    }
    Ok((pack_nibbles(&codes), scales))
}

/// NF4 group quantization (absmax scale, nearest codebook level), packed.
pub fn quantize_nf4_weights(weights: &[f32], k: usize, n: usize, group_size: usize) -> Result<(Vec<u8>, Vec<f32>)> {
    let (absmax, num_groups) = group_absmax(weights, k, n, group_size)?;
    let scales: Vec<f32> = absmax.iter().map(|&a| scale_from(a, 1.0)).collect();
    let mut codes = vec![0u8; k * n];
    for p in 0..k {
        for j in 0..n {
            let x = weights[p * n + j] / scales[p * num_groups + j / group_size];
            codes[p * n + j] = nearest_nf4(x);
        }
    }
    Ok((pack_nibbles(&codes), scales))
}

fn nearest_nf4(x: f32) -> u8 {
    let mut best = 0usize;
    for (i, &level) in NF4_CODEBOOK.iter().enumerate() {
        if (x - level).abs() < (x - NF4_CODEBOOK[best]).abs() {
            best = i;
        }
    }
    best as u8
}
