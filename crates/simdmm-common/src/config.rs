//! Engine configuration for simdmm.
//!
//! Loads [`EngineConfig`] from a TOML file with environment variable
//! overrides via `SIMDMM_*` prefixed variables. Every field has a default,
//! so a partial file (or no file at all) is valid.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::capabilities::MicrokernelKind;

/// Which microkernel backend the engine should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendPreference {
    /// Best backend the capability probe reports.
    #[default]
    Auto,
    Portable,
    Avx2,
    Avx512,
    Neon,
    HwOuterProduct,
}

impl BackendPreference {
    /// The explicitly requested kind, or `None` for `auto`.
    pub fn kind(self) -> Option<MicrokernelKind> {
        match self {
            Self::Auto => None,
            Self::Portable => Some(MicrokernelKind::Portable),
            Self::Avx2 => Some(MicrokernelKind::Avx2),
            Self::Avx512 => Some(MicrokernelKind::Avx512),
            Self::Neon => Some(MicrokernelKind::Neon),
            Self::HwOuterProduct => Some(MicrokernelKind::HwOuterProduct),
        }
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            None => write!(f, "auto"),
            Some(kind) => write!(f, "{kind}"),
        }
    }
}

impl FromStr for BackendPreference {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        Ok(match s.parse::<MicrokernelKind>()? {
            MicrokernelKind::Portable => Self::Portable,
            MicrokernelKind::Avx2 => Self::Avx2,
            MicrokernelKind::Avx512 => Self::Avx512,
            MicrokernelKind::Neon => Self::Neon,
            MicrokernelKind::HwOuterProduct => Self::HwOuterProduct,
        })
    }
}

/// Matmul engine configuration loaded from TOML with environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Microkernel backend.
    /// Override: `SIMDMM_BACKEND`
    pub backend: BackendPreference,

    /// Below this many multiply-adds the streaming kernel is used.
    /// Override: `SIMDMM_SMALL_THRESHOLD`
    pub small_threshold: usize,

    /// At or above this many multiply-adds the packed path is eligible.
    /// Override: `SIMDMM_LARGE_THRESHOLD`
    pub large_threshold: usize,

    /// Rows per parallel work strip.
    /// Override: `SIMDMM_ROWS_PER_STRIP`
    pub rows_per_strip: usize,

    /// Minimum strip count before strip parallelism pays off.
    pub min_parallel_strips: usize,

    /// Below this many multiply-adds parallel entry points run serially.
    pub min_parallel_ops: usize,

    /// Edge of the square cache block used by the blocked kernel.
    /// Override: `SIMDMM_BLOCK_SIZE`
    pub block_size: usize,

    /// Reduction block for pairwise summation.
    /// Override: `SIMDMM_PAIRWISE_BLOCK_K`
    pub pairwise_block_k: usize,

    pub klast_block_m: usize,
    pub klast_block_n: usize,
    pub klast_block_k: usize,

    /// Packed (GEBP) cache blocking: rows of A per packed block.
    pub gebp_mc: usize,
    /// Packed (GEBP) cache blocking: reduction depth per packed block.
    pub gebp_kc: usize,
    /// Packed (GEBP) cache blocking: columns of B per packed block.
    pub gebp_nc: usize,

    /// Hardware outer-product tile width.
    pub hw_tile: usize,
    /// Minimum M, K and N for the hardware outer-product path.
    pub hw_min_dim: usize,
    /// Minimum N tiles before the fused outer-product path goes parallel.
    pub min_fused_parallel_tiles: usize,

    /// Worker threads (0 = available parallelism).
    /// Override: `SIMDMM_NUM_THREADS`
    pub num_threads: usize,

    /// Pin workers to cores (best effort, Linux only).
    /// Override: `SIMDMM_PIN_THREADS`
    pub pin_threads: bool,

    /// Prefix for worker thread names.
    pub thread_name_prefix: String,

    /// Idle bytes the scratch pool may keep cached.
    /// Override: `SIMDMM_SCRATCH_POOL_BYTES`
    pub scratch_pool_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            small_threshold: 64 * 64 * 64,
            large_threshold: 1024 * 1024 * 1024,
            rows_per_strip: 64,
            min_parallel_strips: 3,
            min_parallel_ops: 64 * 64 * 64,
            block_size: 48,
            pairwise_block_k: 128,
            klast_block_m: 64,
            klast_block_n: 64,
            klast_block_k: 256,
            gebp_mc: 128,
            gebp_kc: 256,
            gebp_nc: 512,
            hw_tile: 16,
            hw_min_dim: 64,
            min_fused_parallel_tiles: 4,
            num_threads: 0,
            pin_threads: false,
            thread_name_prefix: "simdmm-worker".to_string(),
            scratch_pool_bytes: 64 << 20,
        }
    }
}

/// Errors that can occur when loading or validating an [`EngineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride {
        key: String,
        value: String,
        reason: String,
    },
}

impl EngineConfig {
    /// Render the default configuration as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: EngineConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Worker count with `0` resolved to the available parallelism.
    pub fn resolved_threads(&self) -> usize {
        if self.num_threads == 0 { num_cpus::get().max(1) } else { self.num_threads }
    }

    /// Validate the configuration, returning a descriptive error on failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("block_size", self.block_size),
            ("pairwise_block_k", self.pairwise_block_k),
            ("rows_per_strip", self.rows_per_strip),
            ("min_parallel_strips", self.min_parallel_strips),
            ("klast_block_m", self.klast_block_m),
            ("klast_block_n", self.klast_block_n),
            ("klast_block_k", self.klast_block_k),
            ("gebp_mc", self.gebp_mc),
            ("gebp_kc", self.gebp_kc),
            ("gebp_nc", self.gebp_nc),
            ("hw_tile", self.hw_tile),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} must be > 0")));
            }
        }
        if !self.block_size.is_multiple_of(4) {
            return Err(ConfigError::Validation(format!(
                "block_size must be a multiple of 4, got {}",
                self.block_size
            )));
        }
        if self.small_threshold > self.large_threshold {
            return Err(ConfigError::Validation(format!(
                "small_threshold ({}) must not exceed large_threshold ({})",
                self.small_threshold, self.large_threshold
            )));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::Validation("thread_name_prefix must not be empty".into()));
        }
        if self.thread_name_prefix.len() > 32 {
            return Err(ConfigError::Validation(
                "thread_name_prefix must be <= 32 characters".into(),
            ));
        }
        Ok(())
    }

    /// Apply `SIMDMM_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse::<BackendPreference>("SIMDMM_BACKEND")? {
            self.backend = v;
        }
        if let Some(v) = env_parse::<usize>("SIMDMM_NUM_THREADS")? {
            self.num_threads = v;
        }
        if let Ok(val) = std::env::var("SIMDMM_PIN_THREADS") {
            self.pin_threads = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = env_parse::<usize>("SIMDMM_BLOCK_SIZE")? {
            self.block_size = v;
        }
        if let Some(v) = env_parse::<usize>("SIMDMM_PAIRWISE_BLOCK_K")? {
            self.pairwise_block_k = v;
        }
        if let Some(v) = env_parse::<usize>("SIMDMM_SMALL_THRESHOLD")? {
            self.small_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("SIMDMM_LARGE_THRESHOLD")? {
            self.large_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("SIMDMM_ROWS_PER_STRIP")? {
            self.rows_per_strip = v;
        }
        if let Some(v) = env_parse::<usize>("SIMDMM_SCRATCH_POOL_BYTES")? {
            self.scratch_pool_bytes = v;
        }
        Ok(())
    }
}

/// Parse an optional environment variable, mapping parse failures to
/// [`ConfigError::EnvOverride`].
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value.trim().parse::<T>().map(Some).map_err(|e| ConfigError::EnvOverride {
            key: key.to_string(),
            value: value.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const ALL_VARS: [&str; 9] = [
        "SIMDMM_BACKEND",
        "SIMDMM_NUM_THREADS",
        "SIMDMM_PIN_THREADS",
        "SIMDMM_BLOCK_SIZE",
        "SIMDMM_PAIRWISE_BLOCK_K",
        "SIMDMM_SMALL_THRESHOLD",
        "SIMDMM_LARGE_THRESHOLD",
        "SIMDMM_ROWS_PER_STRIP",
        "SIMDMM_SCRATCH_POOL_BYTES",
    ];

    fn clear_env() {
        for var in ALL_VARS {
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.small_threshold, 262_144);
        assert_eq!(cfg.large_threshold, 1_073_741_824);
        assert_eq!(cfg.block_size, 48);
        assert_eq!(cfg.pairwise_block_k, 128);
    }

    #[test]
    fn test_default_toml_round_trips() {
        let toml_str = EngineConfig::default_toml().unwrap();
        let cfg: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_toml_partial_uses_defaults() {
        clear_env();
        let cfg = EngineConfig::from_toml(
            r#"
backend = "portable"
block_size = 64
num_threads = 3
"#,
        )
        .unwrap();
        assert_eq!(cfg.backend, BackendPreference::Portable);
        assert_eq!(cfg.block_size, 64);
        assert_eq!(cfg.num_threads, 3);
        assert_eq!(cfg.rows_per_strip, 64);
        assert_eq!(cfg.resolved_threads(), 3);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backend = \"hw-outer-product\"\nhw_tile = 16\npin_threads = true").unwrap();
        let cfg = EngineConfig::load(file.path()).unwrap();
        assert_eq!(cfg.backend, BackendPreference::HwOuterProduct);
        assert!(cfg.pin_threads);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = EngineConfig::load(Path::new("/nonexistent/simdmm.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = EngineConfig::from_toml("block_size = \"big\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation_block_size_zero() {
        let cfg = EngineConfig { block_size: 0, ..Default::default() };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("block_size must be > 0"));
    }

    #[test]
    fn test_validation_block_size_not_multiple_of_four() {
        let cfg = EngineConfig { block_size: 50, ..Default::default() };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("multiple of 4"));
    }

    #[test]
    fn test_validation_thresholds_ordered() {
        let cfg = EngineConfig { small_threshold: 10, large_threshold: 5, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_apply() {
        clear_env();
        unsafe {
            std::env::set_var("SIMDMM_BACKEND", "avx2");
            std::env::set_var("SIMDMM_NUM_THREADS", "6");
            std::env::set_var("SIMDMM_PIN_THREADS", "yes");
            std::env::set_var("SIMDMM_PAIRWISE_BLOCK_K", "256");
        }
        let cfg = EngineConfig::from_env().unwrap();
        clear_env();
        assert_eq!(cfg.backend, BackendPreference::Avx2);
        assert_eq!(cfg.num_threads, 6);
        assert!(cfg.pin_threads);
        assert_eq!(cfg.pairwise_block_k, 256);
    }

    #[test]
    #[serial]
    fn test_env_override_bad_value() {
        clear_env();
        unsafe {
            std::env::set_var("SIMDMM_BLOCK_SIZE", "forty-eight");
        }
        let err = EngineConfig::from_env().unwrap_err();
        clear_env();
        match err {
            ConfigError::EnvOverride { key, value, .. } => {
                assert_eq!(key, "SIMDMM_BLOCK_SIZE");
                assert_eq!(value, "forty-eight");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_backend_preference_parse() {
        assert_eq!("auto".parse::<BackendPreference>().unwrap(), BackendPreference::Auto);
        assert_eq!("NEON".parse::<BackendPreference>().unwrap(), BackendPreference::Neon);
        assert_eq!(BackendPreference::HwOuterProduct.to_string(), "hw-outer-product");
        assert!("cuda".parse::<BackendPreference>().is_err());
        assert_eq!(BackendPreference::Auto.kind(), None);
    }
}
