//! Scratch-buffer pool for packing panels, packed outputs and dequantization
//! tiles.
//!
//! A thread-safe, size-bucketed free list. Requests are rounded up to the
//! nearest power-of-two *size class*, so repeated calls with similar shapes
//! reuse the same allocations. Recycled buffers are zeroed before they are
//! handed out again.

use bytemuck::Pod;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Backing storage is word-sized so typed views of any element up to
/// 8-byte alignment are valid.
type Word = u64;
const WORD: usize = std::mem::size_of::<Word>();

// ── Statistics ───────────────────────────────────────────────────────

/// Cumulative statistics for a [`ScratchPool`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of times `allocate` returned a recycled buffer.
    pub hits: u64,
    /// Number of times `allocate` had to create a new buffer.
    pub misses: u64,
    /// Bytes currently held *inside the pool* (not lent out).
    pub pooled_bytes: usize,
    /// Bytes currently lent out via live `PooledBuffer` handles.
    pub active_bytes: usize,
}

impl PoolStats {
    /// Total `allocate` calls (`hits + misses`).
    pub fn total_allocations(&self) -> u64 {
        self.hits + self.misses
    }
}

// ── Pool internals ──────────────────────────────────────────────────

struct PoolInner {
    max_idle_bytes: usize,
    buckets: HashMap<usize, Vec<Vec<Word>>>,
    stats: PoolStats,
}

fn lock(inner: &Mutex<PoolInner>) -> MutexGuard<'_, PoolInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── ScratchPool ─────────────────────────────────────────────────────

/// Thread-safe, size-bucketed pool of zeroed scratch buffers.
///
/// When a [`PooledBuffer`] is dropped its memory returns to the matching
/// bucket, unless the pool already caches `max_idle_bytes`, in which case
/// the buffer is freed.
#[derive(Clone)]
pub struct ScratchPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl ScratchPool {
    /// Create a pool that caches at most `max_idle_bytes` of idle memory.
    pub fn new(max_idle_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                max_idle_bytes,
                buckets: HashMap::new(),
                stats: PoolStats::default(),
            })),
        }
    }

    /// Allocate a zeroed buffer of *at least* `size` bytes.
    ///
    /// The buffer's length is the size class: a power of two, minimum 64.
    pub fn allocate(&self, size: usize) -> PooledBuffer {
        let bucket_size = bucket_for(size);
        let recycled = {
            let mut inner = lock(&self.inner);
            let recycled = inner.buckets.get_mut(&bucket_size).and_then(Vec::pop);
            if recycled.is_some() {
                inner.stats.hits += 1;
                inner.stats.pooled_bytes -= bucket_size;
            } else {
                inner.stats.misses += 1;
            }
            inner.stats.active_bytes += bucket_size;
            recycled
        };

        // zeroing and fresh allocation happen outside the lock
        let buf = match recycled {
            Some(mut v) => {
                v.fill(0);
                v
            }
            None => vec![0; bucket_size / WORD],
        };
        PooledBuffer { buf: Some(buf), pool: Arc::clone(&self.inner) }
    }

    /// Allocate a zeroed buffer holding at least `count` values of `T`.
    pub fn allocate_elems<T: Pod>(&self, count: usize) -> PooledBuffer {
        self.allocate(count * std::mem::size_of::<T>())
    }

    /// Snapshot of current pool statistics.
    pub fn stats(&self) -> PoolStats {
        lock(&self.inner).stats.clone()
    }

    /// Drop all cached buffers.
    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.buckets.clear();
        inner.stats.pooled_bytes = 0;
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new(64 << 20)
    }
}

impl std::fmt::Debug for ScratchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchPool").field("stats", &self.stats()).finish()
    }
}

/// Round `size` up to the next power of two, with a minimum of 64 bytes.
fn bucket_for(size: usize) -> usize {
    let min = 64;
    if size <= min {
        return min;
    }
    size.next_power_of_two()
}

// ── PooledBuffer ────────────────────────────────────────────────────

/// RAII scratch buffer that returns its memory to a [`ScratchPool`] on drop.
pub struct PooledBuffer {
    buf: Option<Vec<Word>>,
    pool: Arc<Mutex<PoolInner>>,
}

impl PooledBuffer {
    fn words(&self) -> &[Word] {
        self.buf.as_deref().unwrap_or(&[])
    }

    fn words_mut(&mut self) -> &mut [Word] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    /// View the buffer as a slice of `T`.
    ///
    /// # Panics
    /// Panics if `T` needs more than 8-byte alignment.
    pub fn as_slice<T: Pod>(&self) -> &[T] {
        assert!(std::mem::align_of::<T>() <= WORD, "scratch views support alignment <= 8");
        bytemuck::cast_slice(self.words())
    }

    /// View the buffer as a mutable slice of `T`.
    ///
    /// # Panics
    /// Panics if `T` needs more than 8-byte alignment.
    pub fn as_mut_slice<T: Pod>(&mut self) -> &mut [T] {
        assert!(std::mem::align_of::<T>() <= WORD, "scratch views support alignment <= 8");
        bytemuck::cast_slice_mut(self.words_mut())
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        bytemuck::cast_slice(self.words())
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(self.words_mut())
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let bucket_size = buf.len() * WORD;
            let mut inner = lock(&self.pool);
            inner.stats.active_bytes = inner.stats.active_bytes.saturating_sub(bucket_size);

            if inner.stats.pooled_bytes + bucket_size <= inner.max_idle_bytes {
                inner.stats.pooled_bytes += bucket_size;
                inner.buckets.entry(bucket_size).or_default().push(buf);
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
