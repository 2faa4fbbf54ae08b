//! Integer-only `u8 × u8 → i32` matmul with zero-point subtraction.
//!
//! `output[i, j] = Σ_p (a[i, p] - a_zp) · (b[p, j] - b_zp)`, accumulated in
//! `i32` with wrapping adds. Building block for quantized attention.

#[track_caller]
fn assert_int8x8_dims(output: &[i32], a: &[u8], b: &[u8], m: usize, k: usize, n: usize) {
    assert!(a.len() >= m * k, "A too small: need {} elements (M={m}, K={k}), got {}", m * k, a.len());
    assert!(b.len() >= k * n, "B too small: need {} elements (K={k}, N={n}), got {}", k * n, b.len());
    assert!(output.len() >= m * n, "output too small: need {} elements (M={m}, N={n}), got {}", m * n, output.len());
}

/// One output row: `acc = Σ_p a_row[p] · (b[p, :] - b_zp[:])`.
#[inline]
fn accumulate_row(acc: &mut [i32], a_row: &[u8], a_zp: i32, b: &[u8], b_zp: impl Fn(usize) -> i32) {
    let n = acc.len();
    acc.fill(0);
    for (p, &av) in a_row.iter().enumerate() {
        let av = av as i32 - a_zp;
        for (j, (o, &bv)) in acc.iter_mut().zip(&b[p * n..(p + 1) * n]).enumerate() {
            *o = o.wrapping_add(av * (bv as i32 - b_zp(j)));
        }
    }
}

/// `[M, K] · [K, N]` with scalar zero points. Overwrites `output`.
///
/// # Panics
/// If `output`, `a` or `b` is shorter than its dimensions require.
#[allow(clippy::too_many_arguments)]
pub fn int8x8_matmul(output: &mut [i32], a: &[u8], b: &[u8], a_zp: u8, b_zp: u8, m: usize, k: usize, n: usize) {
    assert_int8x8_dims(output, a, b, m, k, n);
    if m == 0 || k == 0 || n == 0 {
        return;
    }
    let b_zp = b_zp as i32;
    for (i, acc) in output[..m * n].chunks_exact_mut(n).enumerate() {
        accumulate_row(acc, &a[i * k..(i + 1) * k], a_zp as i32, b, |_| b_zp);
    }
}

/// Per-axis variant: `a_zps[i]` for row `i` of `A`, `b_zps[j]` for column
/// `j` of `B`.
///
/// # Panics
/// If a buffer or zero-point slice is shorter than its dimensions require.
#[allow(clippy::too_many_arguments)]
pub fn int8x8_matmul_per_axis(
    output: &mut [i32],
    a: &[u8],
    b: &[u8],
    a_zps: &[u8],
    b_zps: &[u8],
    m: usize,
    k: usize,
    n: usize,
) {
    assert_int8x8_dims(output, a, b, m, k, n);
    assert!(a_zps.len() >= m, "a_zps too small: need {m}, got {}", a_zps.len());
    assert!(b_zps.len() >= n, "b_zps too small: need {n}, got {}", b_zps.len());
    if m == 0 || k == 0 || n == 0 {
        return;
    }
    for (i, acc) in output[..m * n].chunks_exact_mut(n).enumerate() {
        accumulate_row(acc, &a[i * k..(i + 1) * k], a_zps[i] as i32, b, |j| b_zps[j] as i32);
    }
}
