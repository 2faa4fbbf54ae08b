//! CPU capability registry: the single source of truth for which
//! microkernel backends may be used.
//!
//! Hardware is probed once per process into an immutable [`CpuCapabilities`]
//! snapshot. Kernel selection reads that snapshot; nothing swaps function
//! pointers behind the caller's back.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// SIMD instruction set level available at compile or runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum SimdLevel {
    /// No SIMD; scalar fallback only.
    Scalar,
    /// ARM NEON (128-bit).
    Neon,
    /// x86 SSE4.2 (128-bit).
    Sse42,
    /// x86 AVX2 (256-bit).
    Avx2,
    /// x86 AVX-512 (512-bit).
    Avx512,
}

impl fmt::Display for SimdLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimdLevel::Scalar => write!(f, "scalar"),
            SimdLevel::Neon => write!(f, "neon"),
            SimdLevel::Sse42 => write!(f, "sse4.2"),
            SimdLevel::Avx2 => write!(f, "avx2"),
            SimdLevel::Avx512 => write!(f, "avx512"),
        }
    }
}

/// The microkernel implementation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicrokernelKind {
    /// Portable Rust loops, available everywhere.
    Portable,
    /// x86 AVX2 + FMA.
    Avx2,
    /// x86 AVX-512F.
    Avx512,
    /// ARM NEON.
    Neon,
    /// Matrix-extension outer-product tiles with persistent accumulator state.
    HwOuterProduct,
}

impl MicrokernelKind {
    /// All kinds, best first. `Portable` is always last.
    pub const PREFERENCE_ORDER: [MicrokernelKind; 5] = [
        MicrokernelKind::HwOuterProduct,
        MicrokernelKind::Avx512,
        MicrokernelKind::Avx2,
        MicrokernelKind::Neon,
        MicrokernelKind::Portable,
    ];

    /// True when the backend holds accumulator state outside the normal
    /// register file and must run under a streaming-mode guard.
    pub fn requires_streaming_mode(self) -> bool {
        matches!(self, MicrokernelKind::HwOuterProduct)
    }
}

impl fmt::Display for MicrokernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MicrokernelKind::Portable => write!(f, "portable"),
            MicrokernelKind::Avx2 => write!(f, "avx2"),
            MicrokernelKind::Avx512 => write!(f, "avx512"),
            MicrokernelKind::Neon => write!(f, "neon"),
            MicrokernelKind::HwOuterProduct => write!(f, "hw-outer-product"),
        }
    }
}

impl FromStr for MicrokernelKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "portable" | "scalar" | "fallback" => Ok(Self::Portable),
            "avx2" => Ok(Self::Avx2),
            "avx512" => Ok(Self::Avx512),
            "neon" => Ok(Self::Neon),
            "hw-outer-product" | "outer-product" | "sme" => Ok(Self::HwOuterProduct),
            other => Err(format!("unknown microkernel: {other}")),
        }
    }
}

/// Snapshot of the CPU features relevant to kernel selection.
///
/// Runtime feature detection is treated as a hint: every backend keeps a
/// portable fallback, and the outer-product backend is never enabled by
/// detection alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuCapabilities {
    /// Best SIMD level found.
    pub simd_level: SimdLevel,
    /// Fused multiply-add (x86 `fma`; implied on aarch64).
    pub fma: bool,
    /// x86 AVX2.
    pub avx2: bool,
    /// x86 AVX-512 Foundation.
    pub avx512f: bool,
    /// ARM NEON / AdvSIMD.
    pub neon: bool,
    /// Hardware outer-product tiles are allowed. Opt-in only.
    pub outer_product: bool,
    /// Logical CPUs visible to the process.
    pub logical_cpus: usize,
}

static DETECTED: OnceLock<CpuCapabilities> = OnceLock::new();

impl CpuCapabilities {
    /// Probe the running CPU. Prefer [`CpuCapabilities::detect`], which
    /// caches the result for the process lifetime.
    pub fn probe() -> Self {
        #[cfg(target_arch = "x86_64")]
        let (avx2, avx512f, fma) = (
            is_x86_feature_detected!("avx2"),
            is_x86_feature_detected!("avx512f"),
            is_x86_feature_detected!("fma"),
        );
        #[cfg(not(target_arch = "x86_64"))]
        let (avx2, avx512f, fma) = (false, false, cfg!(target_arch = "aarch64"));

        #[cfg(target_arch = "aarch64")]
        let neon = std::arch::is_aarch64_feature_detected!("neon");
        #[cfg(not(target_arch = "aarch64"))]
        let neon = false;

        #[cfg(target_arch = "x86_64")]
        let sse42 = is_x86_feature_detected!("sse4.2");
        #[cfg(not(target_arch = "x86_64"))]
        let sse42 = false;

        let simd_level = if avx512f {
            SimdLevel::Avx512
        } else if avx2 {
            SimdLevel::Avx2
        } else if sse42 {
            SimdLevel::Sse42
        } else if neon {
            SimdLevel::Neon
        } else {
            SimdLevel::Scalar
        };

        Self {
            simd_level,
            fma,
            avx2,
            avx512f,
            neon,
            outer_product: false,
            logical_cpus: num_cpus::get().max(1),
        }
    }

    /// Probe once and return the cached snapshot.
    pub fn detect() -> &'static CpuCapabilities {
        DETECTED.get_or_init(|| {
            let caps = Self::probe();
            log::info!("CPU capabilities: {}", caps.summary());
            caps
        })
    }

    /// Build from compile-time target features (no runtime probing).
    pub fn from_compile_time() -> Self {
        let simd_level = compile_time_simd_level();
        Self {
            simd_level,
            fma: cfg!(target_feature = "fma") || cfg!(target_arch = "aarch64"),
            avx2: cfg!(target_feature = "avx2"),
            avx512f: cfg!(target_feature = "avx512f"),
            neon: cfg!(target_arch = "aarch64"),
            outer_product: false,
            logical_cpus: num_cpus::get().max(1),
        }
    }

    /// Capabilities that allow only the portable backend.
    pub fn portable_only() -> Self {
        Self {
            simd_level: SimdLevel::Scalar,
            fma: false,
            avx2: false,
            avx512f: false,
            neon: false,
            outer_product: false,
            logical_cpus: num_cpus::get().max(1),
        }
    }

    /// Return a copy with the outer-product backend explicitly allowed or denied.
    pub fn with_outer_product(mut self, enabled: bool) -> Self {
        self.outer_product = enabled;
        self
    }

    /// Whether `kind` may be selected on this CPU.
    pub fn supports(&self, kind: MicrokernelKind) -> bool {
        match kind {
            MicrokernelKind::Portable => true,
            MicrokernelKind::Avx2 => self.avx2 && self.fma,
            MicrokernelKind::Avx512 => self.avx512f,
            MicrokernelKind::Neon => self.neon,
            MicrokernelKind::HwOuterProduct => self.outer_product,
        }
    }

    /// Supported kinds in preference order (best first). Always ends with
    /// [`MicrokernelKind::Portable`].
    pub fn available_kinds(&self) -> Vec<MicrokernelKind> {
        MicrokernelKind::PREFERENCE_ORDER
            .iter()
            .copied()
            .filter(|&k| self.supports(k))
            .collect()
    }

    /// The most preferred supported kind.
    pub fn best_kind(&self) -> MicrokernelKind {
        self.available_kinds().first().copied().unwrap_or(MicrokernelKind::Portable)
    }

    /// Human-readable summary for logs.
    pub fn summary(&self) -> String {
        let kinds: Vec<String> = self.available_kinds().iter().map(|k| k.to_string()).collect();
        format!(
            "simd={} fma={} cpus={} kernels=[{}]",
            self.simd_level,
            self.fma,
            self.logical_cpus,
            kinds.join(",")
        )
    }
}

/// Detect the best SIMD level available at compile time.
const fn compile_time_simd_level() -> SimdLevel {
    #[cfg(target_feature = "avx512f")]
    return SimdLevel::Avx512;
    #[cfg(all(target_feature = "avx2", not(target_feature = "avx512f")))]
    return SimdLevel::Avx2;
    #[cfg(all(target_feature = "sse4.2", not(target_feature = "avx2")))]
    return SimdLevel::Sse42;
    #[cfg(all(target_arch = "aarch64", not(target_feature = "sse4.2")))]
    return SimdLevel::Neon;
    #[cfg(not(any(
        target_feature = "avx512f",
        target_feature = "avx2",
        target_feature = "sse4.2",
        target_arch = "aarch64",
    )))]
    SimdLevel::Scalar
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(avx2: bool, avx512f: bool, neon: bool) -> CpuCapabilities {
        CpuCapabilities {
            simd_level: SimdLevel::Scalar,
            fma: avx2,
            avx2,
            avx512f,
            neon,
            outer_product: false,
            logical_cpus: 4,
        }
    }

    #[test]
    fn simd_level_ordering() {
        assert!(SimdLevel::Scalar < SimdLevel::Neon);
        assert!(SimdLevel::Neon < SimdLevel::Sse42);
        assert!(SimdLevel::Sse42 < SimdLevel::Avx2);
        assert!(SimdLevel::Avx2 < SimdLevel::Avx512);
    }

    #[test]
    fn kind_display_round_trips_through_from_str() {
        for kind in MicrokernelKind::PREFERENCE_ORDER {
            let parsed: MicrokernelKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("tpu".parse::<MicrokernelKind>().is_err());
    }

    #[test]
    fn portable_is_always_available_and_last() {
        for c in [caps(false, false, false), caps(true, true, false), caps(false, false, true)] {
            let kinds = c.available_kinds();
            assert_eq!(kinds.last(), Some(&MicrokernelKind::Portable));
        }
    }

    #[test]
    fn best_kind_prefers_widest_vectors() {
        assert_eq!(caps(true, true, false).best_kind(), MicrokernelKind::Avx512);
        assert_eq!(caps(true, false, false).best_kind(), MicrokernelKind::Avx2);
        assert_eq!(caps(false, false, true).best_kind(), MicrokernelKind::Neon);
        assert_eq!(caps(false, false, false).best_kind(), MicrokernelKind::Portable);
    }

    #[test]
    fn avx2_requires_fma() {
        let mut c = caps(true, false, false);
        c.fma = false;
        assert!(!c.supports(MicrokernelKind::Avx2));
    }

    #[test]
    fn outer_product_is_opt_in() {
        let probed = CpuCapabilities::probe();
        assert!(!probed.outer_product);
        assert!(!probed.supports(MicrokernelKind::HwOuterProduct));

        let enabled = probed.with_outer_product(true);
        assert_eq!(enabled.best_kind(), MicrokernelKind::HwOuterProduct);
    }

    #[test]
    fn detect_is_cached() {
        let a = CpuCapabilities::detect();
        let b = CpuCapabilities::detect();
        assert!(std::ptr::eq(a, b));
        assert!(a.logical_cpus >= 1);
    }

    #[test]
    fn summary_mentions_simd_and_kernels() {
        let s = caps(true, false, false).summary();
        assert!(s.contains("kernels=[avx2,portable]"), "summary: {s}");
    }

    #[test]
    fn streaming_mode_only_for_outer_product() {
        for kind in MicrokernelKind::PREFERENCE_ORDER {
            assert_eq!(kind.requires_streaming_mode(), kind == MicrokernelKind::HwOuterProduct);
        }
    }
}
