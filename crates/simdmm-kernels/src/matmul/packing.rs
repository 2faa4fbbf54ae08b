//! Panel packing for the GEBP path.
//!
//! An LHS panel is stored as consecutive micro-panels of `mr` rows; inside
//! a micro-panel the `mr` values of one `k` are contiguous. An RHS panel is
//! stored as micro-panels of `nr` columns with the `nr` values of one `k`
//! contiguous. A final partial micro-panel is zero-padded so the
//! micro-kernel always reads full-width rows.

use crate::element::{Accum, Element};

/// Elements needed to pack a `panel_rows × panel_k` LHS panel.
pub fn packed_lhs_len(panel_rows: usize, panel_k: usize, mr: usize) -> usize {
    panel_rows.div_ceil(mr) * panel_k * mr
}

/// Elements needed to pack a `panel_k × panel_cols` RHS panel.
pub fn packed_rhs_len(panel_k: usize, panel_cols: usize, nr: usize) -> usize {
    panel_cols.div_ceil(nr) * panel_k * nr
}

/// Pack rows `row_start..row_start + panel_rows` and columns
/// `col_start..col_start + panel_k` of the `[m, k]` matrix `a`.
///
/// Returns the number of active rows in the last micro-panel.
///
/// # Panics
/// If the panel exceeds `a`'s bounds or `packed` is too short.
#[allow(clippy::too_many_arguments)]
pub fn pack_lhs<T: Element>(
    a: &[T],
    packed: &mut [T],
    m: usize,
    k: usize,
    row_start: usize,
    col_start: usize,
    panel_rows: usize,
    panel_k: usize,
    mr: usize,
) -> usize {
    assert!(mr > 0, "mr must be positive");
    assert!(row_start + panel_rows <= m && col_start + panel_k <= k, "LHS panel out of bounds");
    let len = packed_lhs_len(panel_rows, panel_k, mr);
    assert!(packed.len() >= len, "packed LHS buffer too small: need {len}, got {}", packed.len());

    let panels = panel_rows.div_ceil(mr);
    for ip in 0..panels {
        let base = ip * panel_k * mr;
        let active = mr.min(panel_rows - ip * mr);
        for p in 0..panel_k {
            let dst = &mut packed[base + p * mr..base + (p + 1) * mr];
            for (r, d) in dst.iter_mut().enumerate() {
                *d = if r < active { a[(row_start + ip * mr + r) * k + col_start + p] } else { T::zero() };
            }
        }
    }
    if panels == 0 { 0 } else { panel_rows - (panels - 1) * mr }
}

/// Pack rows `row_start..row_start + panel_k` and columns
/// `col_start..col_start + panel_cols` of the `[_, n]` matrix `b`.
///
/// Returns the number of active columns in the last micro-panel.
///
/// # Panics
/// If the panel exceeds `b`'s bounds or `packed` is too short.
#[allow(clippy::too_many_arguments)]
pub fn pack_rhs<T: Element>(
    b: &[T],
    packed: &mut [T],
    n: usize,
    row_start: usize,
    col_start: usize,
    panel_k: usize,
    panel_cols: usize,
    nr: usize,
) -> usize {
    assert!(nr > 0, "nr must be positive");
    assert!(col_start + panel_cols <= n, "RHS panel out of bounds");
    assert!(b.len() >= (row_start + panel_k) * n, "RHS panel out of bounds");
    let len = packed_rhs_len(panel_k, panel_cols, nr);
    assert!(packed.len() >= len, "packed RHS buffer too small: need {len}, got {}", packed.len());

    let panels = panel_cols.div_ceil(nr);
    for jp in 0..panels {
        let base = jp * panel_k * nr;
        let col0 = col_start + jp * nr;
        let active = nr.min(panel_cols - jp * nr);
        for p in 0..panel_k {
            let src = &b[(row_start + p) * n + col0..(row_start + p) * n + col0 + active];
            let dst = &mut packed[base + p * nr..base + (p + 1) * nr];
            dst[..active].copy_from_slice(src);
            dst[active..].fill(T::zero());
        }
    }
    if panels == 0 { 0 } else { panel_cols - (panels - 1) * nr }
}

/// Inverse of [`pack_lhs`]: write the packed panel back as a row-major
/// `[panel_rows, panel_k]` matrix.
pub fn unpack_lhs<T: Element>(packed: &[T], out: &mut [T], panel_rows: usize, panel_k: usize, mr: usize) {
    assert!(out.len() >= panel_rows * panel_k, "unpack LHS output too small");
    for i in 0..panel_rows {
        let (ip, r) = (i / mr, i % mr);
        for p in 0..panel_k {
            out[i * panel_k + p] = packed[ip * panel_k * mr + p * mr + r];
        }
    }
}

/// Inverse of [`pack_rhs`]: write the packed panel back as a row-major
/// `[panel_k, panel_cols]` matrix.
pub fn unpack_rhs<T: Element>(packed: &[T], out: &mut [T], panel_k: usize, panel_cols: usize, nr: usize) {
    assert!(out.len() >= panel_k * panel_cols, "unpack RHS output too small");
    for p in 0..panel_k {
        for j in 0..panel_cols {
            let (jp, cc) = (j / nr, j % nr);
            out[p * panel_cols + j] = packed[jp * panel_k * nr + p * nr + cc];
        }
    }
}

/// Destination rectangle of a packed output block inside a row-major matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputRegion {
    pub row_offset: usize,
    pub col_offset: usize,
    /// Row stride of the destination matrix.
    pub stride: usize,
    pub height: usize,
    pub width: usize,
}

impl OutputRegion {
    #[track_caller]
    fn check<T, A>(&self, packed: &[A], packed_stride: usize, out: &[T]) {
        if self.height == 0 || self.width == 0 {
            return;
        }
        assert!(self.width <= packed_stride, "region wider than packed stride");
        assert!(
            packed.len() >= (self.height - 1) * packed_stride + self.width,
            "packed output too small for {}×{} region",
            self.height,
            self.width
        );
        assert!(
            out.len() >= (self.row_offset + self.height - 1) * self.stride + self.col_offset + self.width,
            "destination too small for region"
        );
    }

    fn rows(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.height).map(move |r| (r, (self.row_offset + r) * self.stride + self.col_offset))
    }
}

/// `out = α·packed + β·out` over `region`.
pub fn apply_packed_output<T: Element>(
    packed: &[T::Acc],
    packed_stride: usize,
    out: &mut [T],
    region: OutputRegion,
    alpha: T::Acc,
    beta: T::Acc,
) {
    region.check(packed, packed_stride, out);
    for (r, dst) in region.rows() {
        let src = &packed[r * packed_stride..r * packed_stride + region.width];
        for (o, &v) in out[dst..dst + region.width].iter_mut().zip(src) {
            *o = T::from_acc(beta * o.to_acc() + alpha * v);
        }
    }
}

/// `out = packed` over `region`.
pub fn apply_packed_output_simple<T: Element>(
    packed: &[T::Acc],
    packed_stride: usize,
    out: &mut [T],
    region: OutputRegion,
) {
    region.check(packed, packed_stride, out);
    for (r, dst) in region.rows() {
        let src = &packed[r * packed_stride..r * packed_stride + region.width];
        for (o, &v) in out[dst..dst + region.width].iter_mut().zip(src) {
            *o = T::from_acc(v);
        }
    }
}

/// `out += packed` over `region`.
pub fn apply_packed_output_accum<T: Element>(
    packed: &[T::Acc],
    packed_stride: usize,
    out: &mut [T],
    region: OutputRegion,
) {
    region.check(packed, packed_stride, out);
    for (r, dst) in region.rows() {
        let src = &packed[r * packed_stride..r * packed_stride + region.width];
        for (o, &v) in out[dst..dst + region.width].iter_mut().zip(src) {
            *o = T::from_acc(o.to_acc() + v);
        }
    }
}

/// Zero an accumulator slice.
#[inline]
pub(crate) fn zero_acc<A: Accum>(buf: &mut [A]) {
    buf.fill(A::ZERO);
}
