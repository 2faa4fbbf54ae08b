//! Integer `u8 × u8 → i32` matmul and the affine `u8` helpers.

use proptest::prelude::*;
use simdmm_kernels::{
    AffineParams, dequantize_affine, dequantize_i32, int8x8_matmul, int8x8_matmul_per_axis, quantize_affine,
};

fn reference(a: &[u8], b: &[u8], a_zps: &[u8], b_zps: &[u8], m: usize, k: usize, n: usize) -> Vec<i32> {
    let mut out = vec![0i64; m * n];
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = (0..k)
                .map(|p| (a[i * k + p] as i64 - a_zps[i] as i64) * (b[p * n + j] as i64 - b_zps[j] as i64))
                .sum();
        }
    }
    out.into_iter().map(|v| v as i32).collect()
}

fn operands() -> impl Strategy<Value = (usize, usize, usize, Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>)> {
    (1usize..12, 1usize..40, 1usize..12).prop_flat_map(|(m, k, n)| {
        (
            Just(m),
            Just(k),
            Just(n),
            prop::collection::vec(any::<u8>(), m * k),
            prop::collection::vec(any::<u8>(), k * n),
            prop::collection::vec(any::<u8>(), m),
            prop::collection::vec(any::<u8>(), n),
        )
    })
}

proptest! {
    #[test]
    fn prop_per_axis_matches_reference((m, k, n, a, b, a_zps, b_zps) in operands()) {
        let mut out = vec![0i32; m * n];
        int8x8_matmul_per_axis(&mut out, &a, &b, &a_zps, &b_zps, m, k, n);
        prop_assert_eq!(out, reference(&a, &b, &a_zps, &b_zps, m, k, n));
    }

    #[test]
    fn prop_uniform_per_axis_equals_scalar((m, k, n, a, b, a_zps, b_zps) in operands()) {
        let a_uniform = vec![a_zps[0]; m];
        let b_uniform = vec![b_zps[0]; n];
        let mut per_axis = vec![0i32; m * n];
        int8x8_matmul_per_axis(&mut per_axis, &a, &b, &a_uniform, &b_uniform, m, k, n);
        let mut scalar = vec![0i32; m * n];
        int8x8_matmul(&mut scalar, &a, &b, a_zps[0], b_zps[0], m, k, n);
        prop_assert_eq!(per_axis, scalar);
    }
}

#[test]
fn extreme_values_fit_i32() {
    // 255 · 255 summed 1024 times stays well inside i32.
    let (m, k, n) = (2, 1024, 3);
    let a = vec![255u8; m * k];
    let b = vec![255u8; k * n];
    let mut out = vec![0i32; m * n];
    int8x8_matmul(&mut out, &a, &b, 0, 0, m, k, n);
    assert_eq!(out, vec![255 * 255 * 1024; m * n]);
}

#[test]
#[should_panic(expected = "b_zps too small")]
fn short_zero_point_slice_panics() {
    let mut out = [0i32; 4];
    int8x8_matmul_per_axis(&mut out, &[0; 4], &[0; 4], &[0, 0], &[0], 2, 2, 2);
}

#[test]
fn quantized_attention_round_trip() {
    // Quantize Q and Kᵀ, multiply in integers, rescale, compare to f32.
    let (m, k, n) = (3, 8, 4);
    let q: Vec<f32> = (0..m * k).map(|i| (i as f32 * 0.37).sin()).collect();
    let kt: Vec<f32> = (0..k * n).map(|i| (i as f32 * 0.53).cos()).collect();

    let mut q8 = vec![0u8; m * k];
    let mut k8 = vec![0u8; k * n];
    let qp = quantize_affine(&q, &mut q8);
    let kp = quantize_affine(&kt, &mut k8);
    let mut acc = vec![0i32; m * n];
    int8x8_matmul(&mut acc, &q8, &k8, qp.zero_point, kp.zero_point, m, k, n);
    let mut scores = vec![0.0f32; m * n];
    dequantize_i32(&acc, &mut scores, qp.scale * kp.scale);

    for i in 0..m {
        for j in 0..n {
            let exact: f32 = (0..k).map(|p| q[i * k + p] * kt[p * n + j]).sum();
            assert!((scores[i * n + j] - exact).abs() < 0.1, "({i}, {j}): {} vs {exact}", scores[i * n + j]);
        }
    }
}

#[test]
fn affine_zero_maps_near_zero_point() {
    let input = [-2.0f32, -0.5, 0.0, 1.0, 6.0];
    let mut q = [0u8; 5];
    let params = quantize_affine(&input, &mut q);
    assert_eq!(q[2], params.zero_point);

    let mut back = [0.0f32; 5];
    dequantize_affine(&q, &mut back, params);
    assert_eq!(back[2], 0.0);
    for (x, y) in input.iter().zip(&back) {
        assert!((x - y).abs() <= params.scale);
    }
    assert_eq!(quantize_affine(&[], &mut []), AffineParams { scale: 1.0, zero_point: 0 });
}
