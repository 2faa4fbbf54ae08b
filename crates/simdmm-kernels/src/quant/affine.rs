//! Asymmetric `u8` quantization: `x ≈ scale · (q - zero_point)`.

/// Scale and zero point of an affine `u8` quantization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    pub scale: f32,
    pub zero_point: u8,
}

impl AffineParams {
    #[inline]
    pub fn quantize(&self, x: f32) -> u8 {
        (x / self.scale + self.zero_point as f32).round().clamp(0.0, 255.0) as u8
    }

    #[inline]
    pub fn dequantize(&self, q: u8) -> f32 {
        self.scale * (q as f32 - self.zero_point as f32)
    }
}

/// Quantize `input` over its own `[min, max]` range into `output`.
///
/// A constant tensor (including an empty one) quantizes to all zeros with
/// scale 1 and zero point 0.
///
/// The round trip is within `±scale` only when `0 ∈ [min, max]`. Otherwise
/// the zero point saturates at 0 (all-positive input) or 255 (all-negative
/// input) and values beyond the representable window clamp.
///
/// # Panics
/// If `output` is shorter than `input`.
pub fn quantize_affine(input: &[f32], output: &mut [u8]) -> AffineParams {
    assert!(output.len() >= input.len(), "output too small: need {}, got {}", input.len(), output.len());
    let (min, max) = input
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));

    if input.is_empty() || min == max {
        output[..input.len()].fill(0);
        return AffineParams { scale: 1.0, zero_point: 0 };
    }

    let scale = (max - min) / 255.0;
    let zero_point = (-min / scale).round().clamp(0.0, 255.0) as u8;
    let params = AffineParams { scale, zero_point };
    for (q, &x) in output.iter_mut().zip(input) {
        *q = params.quantize(x);
    }
    params
}

/// Inverse of [`quantize_affine`].
///
/// # Panics
/// If `output` is shorter than `input`.
pub fn dequantize_affine(input: &[u8], output: &mut [f32], params: AffineParams) {
    assert!(output.len() >= input.len(), "output too small: need {}, got {}", input.len(), output.len());
    for (o, &q) in output.iter_mut().zip(input) {
        *o = params.dequantize(q);
    }
}

/// Min-offset quantization: `q = round(clamp((x - min) / scale, 0, 255))`.
/// Processes `min(input.len(), output.len())` values.
pub fn quantize_u8(input: &[f32], output: &mut [u8], min: f32, scale: f32) {
    let inv = 1.0 / scale;
    for (q, &x) in output.iter_mut().zip(input) {
        *q = ((x - min) * inv).round().clamp(0.0, 255.0) as u8;
    }
}

/// `x = min + q · scale`. Processes `min(input.len(), output.len())` values.
pub fn dequantize_u8(input: &[u8], output: &mut [f32], min: f32, scale: f32) {
    for (o, &q) in output.iter_mut().zip(input) {
        *o = min + q as f32 * scale;
    }
}

/// Rescale `i32` accumulators: `output[i] = combined_scale · input[i]`.
pub fn dequantize_i32(input: &[i32], output: &mut [f32], combined_scale: f32) {
    for (o, &v) in output.iter_mut().zip(input) {
        *o = combined_scale * v as f32;
    }
}
