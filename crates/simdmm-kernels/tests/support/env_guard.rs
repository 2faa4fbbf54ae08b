//! Scoped environment variable overrides for tests.

use std::env;
use std::sync::{Mutex, OnceLock};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> &'static Mutex<()> {
    ENV_LOCK.get_or_init(|| Mutex::new(()))
}

/// Sets a variable and restores its prior value on drop. Combine with
/// `#[serial(simdmm_env)]`.
pub struct EnvVarGuard {
    key: &'static str,
    prior: Option<String>,
}

impl EnvVarGuard {
    pub fn set(key: &'static str, val: &str) -> Self {
        let _lock = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        let prior = env::var(key).ok();
        // SAFETY: mutation is serialised by ENV_LOCK and #[serial].
        unsafe { env::set_var(key, val) };
        Self { key, prior }
    }

    pub fn remove(key: &'static str) -> Self {
        let _lock = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        let prior = env::var(key).ok();
        // SAFETY: as above.
        unsafe { env::remove_var(key) };
        Self { key, prior }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        let _lock = env_lock().lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: as above.
        unsafe {
            match &self.prior {
                Some(v) => env::set_var(self.key, v),
                None => env::remove_var(self.key),
            }
        }
    }
}
