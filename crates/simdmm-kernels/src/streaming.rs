//! RAII guard for kernels that keep accumulator state outside the normal
//! register file.
//!
//! While a [`StreamingModeGuard`] is alive the calling thread
//!
//! * has the preemption signal (`SIGURG` by default) blocked, so no signal
//!   handler runs in the middle of a tile, and
//! * is pinned to the CPU it is currently running on, so the scheduler cannot
//!   migrate it mid-tile.
//!
//! Dropping the guard restores the previous affinity mask first and the
//! previous signal mask second, on every exit path including unwinding.
//! Guards nest; each restores exactly the state it observed.
//!
//! On targets other than Linux the guard only tracks nesting depth.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Signals blocked by [`StreamingModeGuard::acquire`].
#[cfg(target_os = "linux")]
pub const DEFAULT_BLOCKED_SIGNALS: &[libc::c_int] = &[libc::SIGURG];

#[cfg(target_os = "linux")]
struct SavedState {
    old_mask: libc::sigset_t,
    old_affinity: Option<libc::cpu_set_t>,
}

#[cfg(target_os = "linux")]
impl SavedState {
    /// Affinity first, then the signal mask.
    fn restore(&self) {
        // SAFETY: restores masks captured by `acquire_blocking` on this same
        // thread (the guard is !Send).
        unsafe {
            if let Some(old) = self.old_affinity.as_ref() {
                libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), old);
            }
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old_mask, std::ptr::null_mut());
        }
    }
}

/// Thread-pinning, signal-masking scope guard. Not `Send`: it must be dropped
/// on the thread that created it.
#[must_use = "the guard restores thread state when dropped"]
pub struct StreamingModeGuard {
    #[cfg(target_os = "linux")]
    saved: SavedState,
    pinned: bool,
    _not_send: PhantomData<*const ()>,
}

impl StreamingModeGuard {
    /// Enter streaming mode on the current thread.
    pub fn acquire() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::acquire_blocking(DEFAULT_BLOCKED_SIGNALS)
        }
        #[cfg(not(target_os = "linux"))]
        {
            DEPTH.with(|d| d.set(d.get() + 1));
            Self { pinned: false, _not_send: PhantomData }
        }
    }

    /// Enter streaming mode, blocking `signals` instead of the default set.
    #[cfg(target_os = "linux")]
    pub fn acquire_blocking(signals: &[libc::c_int]) -> Self {
        // SAFETY: sigset_t and cpu_set_t are plain C structs for which the
        // all-zero pattern is valid; every pointer passed below refers to a
        // live local of the expected type.
        let (old_mask, old_affinity, pinned) = unsafe {
            let mut block: libc::sigset_t = std::mem::zeroed();
            let mut old_mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut block);
            for &sig in signals {
                libc::sigaddset(&mut block, sig);
            }
            if libc::pthread_sigmask(libc::SIG_BLOCK, &block, &mut old_mask) != 0 {
                log::warn!("pthread_sigmask failed; streaming tile may be preempted");
            }

            let set_size = std::mem::size_of::<libc::cpu_set_t>();
            let mut old_affinity: libc::cpu_set_t = std::mem::zeroed();
            let have_affinity = libc::sched_getaffinity(0, set_size, &mut old_affinity) == 0;

            let cpu = libc::sched_getcpu();
            let mut pinned = false;
            if have_affinity && cpu >= 0 {
                let mut one: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_SET(cpu as usize, &mut one);
                pinned = libc::sched_setaffinity(0, set_size, &one) == 0;
                if !pinned {
                    log::debug!("could not pin streaming thread to cpu {cpu}");
                }
            }

            (old_mask, have_affinity.then_some(old_affinity), pinned)
        };

        DEPTH.with(|d| d.set(d.get() + 1));
        Self { saved: SavedState { old_mask, old_affinity }, pinned, _not_send: PhantomData }
    }

    /// Whether the current thread holds at least one guard.
    pub fn is_active() -> bool {
        DEPTH.with(|d| d.get() > 0)
    }

    /// Nesting depth of guards on the current thread.
    pub fn depth() -> usize {
        DEPTH.with(Cell::get)
    }

    /// Whether this guard pinned the thread to a single CPU.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

impl Drop for StreamingModeGuard {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        self.saved.restore();
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

impl std::fmt::Debug for StreamingModeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingModeGuard").field("pinned", &self.pinned).finish()
    }
}

/// Run `f` inside a guard when `required`, otherwise run it directly.
pub(crate) fn with_streaming_mode<R>(required: bool, f: impl FnOnce() -> R) -> R {
    if required {
        let _guard = StreamingModeGuard::acquire();
        f()
    } else {
        f()
    }
}
