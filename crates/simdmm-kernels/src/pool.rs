//! Worker pool for the parallel matmul strategies.
//!
//! Wraps [`rayon::ThreadPool`] with named worker threads, optional core
//! pinning, and live metrics. Parallel algorithms either spawn a fixed
//! number of workers that drain a shared [`WorkQueue`], or use
//! [`WorkerPool::parallel_for`] over an index range.

use simdmm_common::{EngineConfig, MatMulError, Result};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Configuration for [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads.
    pub num_threads: usize,
    /// Pin worker `i` to core `i % cpus` (best-effort, Linux only).
    pub pin_threads: bool,
    /// Prefix for worker thread names.
    pub name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { num_threads: num_cpus::get().max(1), pin_threads: false, name_prefix: "simdmm-worker".to_string() }
    }
}

impl From<&EngineConfig> for WorkerPoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            num_threads: config.resolved_threads(),
            pin_threads: config.pin_threads,
            name_prefix: config.thread_name_prefix.clone(),
        }
    }
}

/// Live metrics snapshot from the pool.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolMetrics {
    /// Workers currently executing a job.
    pub active_workers: usize,
    /// Jobs (one per `run_workers`, `drain` or `parallel_for` call) completed.
    pub jobs_completed: u64,
    /// Work items handed out by [`WorkQueue`]s of completed jobs.
    pub items_processed: u64,
    /// Busy time over wall time times threads, in `[0.0, 1.0]`.
    pub utilization: f64,
}

#[derive(Debug)]
struct MetricsInner {
    active: AtomicUsize,
    jobs: AtomicU64,
    items: AtomicU64,
    busy_ns: AtomicU64,
    wall_start: Instant,
    num_threads: usize,
}

impl MetricsInner {
    fn new(num_threads: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            jobs: AtomicU64::new(0),
            items: AtomicU64::new(0),
            busy_ns: AtomicU64::new(0),
            wall_start: Instant::now(),
            num_threads,
        }
    }

    fn snapshot(&self) -> WorkerPoolMetrics {
        let wall_ns = self.wall_start.elapsed().as_nanos().max(1) as f64;
        let busy = self.busy_ns.load(Ordering::Relaxed) as f64;
        WorkerPoolMetrics {
            active_workers: self.active.load(Ordering::Relaxed),
            jobs_completed: self.jobs.load(Ordering::Relaxed),
            items_processed: self.items.load(Ordering::Relaxed),
            utilization: (busy / (wall_ns * self.num_threads as f64)).min(1.0),
        }
    }
}

/// Tracks one worker's busy time.
struct WorkerGuard<'a> {
    metrics: &'a MetricsInner,
    start: Instant,
}

impl<'a> WorkerGuard<'a> {
    fn new(metrics: &'a MetricsInner) -> Self {
        metrics.active.fetch_add(1, Ordering::Relaxed);
        Self { metrics, start: Instant::now() }
    }
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_nanos() as u64;
        self.metrics.busy_ns.fetch_add(elapsed, Ordering::Relaxed);
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
    }
}

// ── WorkQueue ───────────────────────────────────────────────────────

/// Lock-free dispenser of item indices `0..len`. Each index is returned by
/// [`WorkQueue::pop`] exactly once across all threads.
#[derive(Debug)]
pub struct WorkQueue {
    next: AtomicUsize,
    len: usize,
}

impl WorkQueue {
    pub fn new(len: usize) -> Self {
        Self { next: AtomicUsize::new(0), len }
    }

    /// Claim the next unprocessed index.
    pub fn pop(&self) -> Option<usize> {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        (i < self.len).then_some(i)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// ── WorkerPool ──────────────────────────────────────────────────────

/// Persistent worker threads shared by the parallel matmul strategies.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    metrics: Arc<MetricsInner>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Result<Self> {
        let num_threads = config.num_threads.max(1);
        let prefix = config.name_prefix.clone();
        let pin = config.pin_threads;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(move |idx| format!("{prefix}-{idx}"))
            .start_handler(move |idx| {
                if pin {
                    pin_thread_best_effort(idx);
                }
            })
            .build()
            .map_err(|e| MatMulError::PoolBuild(e.to_string()))?;

        log::debug!("worker pool '{}' started with {num_threads} threads", config.name_prefix);
        Ok(Self { pool, metrics: Arc::new(MetricsInner::new(num_threads)), config })
    }

    /// A pool with one thread per logical CPU.
    pub fn with_defaults() -> Result<Self> {
        Self::new(WorkerPoolConfig::default())
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn metrics(&self) -> WorkerPoolMetrics {
        self.metrics.snapshot()
    }

    /// Fork `workers` tasks on the pool, calling `f(worker_id)` in each, and
    /// join them before returning.
    pub fn run_workers<F>(&self, workers: usize, f: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        let workers = workers.max(1);
        let metrics = &*self.metrics;
        self.pool.install(|| {
            rayon::scope(|s| {
                for id in 0..workers {
                    let f = &f;
                    s.spawn(move |_| {
                        let _guard = WorkerGuard::new(metrics);
                        f(id);
                    });
                }
            });
        });
        metrics.jobs.fetch_add(1, Ordering::Relaxed);
    }

    /// Spawn `workers` tasks on the pool; each drains `queue`, calling
    /// `f(item)` for every index it claims. Returns when all items are done.
    pub fn drain<F>(&self, workers: usize, queue: &WorkQueue, f: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        if queue.is_empty() {
            return;
        }
        let metrics = &*self.metrics;
        self.run_workers(workers.clamp(1, queue.len()), |_| {
            let mut done = 0u64;
            while let Some(item) = queue.pop() {
                f(item);
                done += 1;
            }
            metrics.items.fetch_add(done, Ordering::Relaxed);
        });
    }

    /// Apply `f` to every index in `range` in chunks of `chunk_size`.
    pub fn parallel_for<F>(&self, range: Range<usize>, chunk_size: usize, f: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        let chunk = chunk_size.max(1);
        let chunks = range.len().div_ceil(chunk);
        let queue = WorkQueue::new(chunks);
        let start = range.start;
        let end = range.end;
        self.drain(self.num_threads(), &queue, |c| {
            let lo = start + c * chunk;
            let hi = (lo + chunk).min(end);
            for i in lo..hi {
                f(i);
            }
        });
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_threads", &self.num_threads())
            .field("name_prefix", &self.config.name_prefix)
            .field("pin_threads", &self.config.pin_threads)
            .finish()
    }
}

/// Best-effort thread-to-core pinning via `sched_setaffinity` on Linux.
fn pin_thread_best_effort(thread_index: usize) {
    #[cfg(target_os = "linux")]
    {
        let core = thread_index % num_cpus::get().max(1);
        // SAFETY: a zeroed cpu_set_t is valid and we pass its exact size for
        // the calling thread (tid 0).
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(core, &mut set);
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                log::debug!("failed to pin worker {thread_index} to core {core}");
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = thread_index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn test_pool(threads: usize) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig { num_threads: threads, name_prefix: "test".into(), ..Default::default() })
            .expect("failed to build test pool")
    }

    #[test]
    fn pool_respects_thread_count() {
        let pool = test_pool(3);
        assert_eq!(pool.num_threads(), 3);
        assert_eq!(pool.config().name_prefix, "test");
    }

    #[test]
    fn zero_threads_is_clamped_to_one() {
        assert_eq!(test_pool(0).num_threads(), 1);
    }

    #[test]
    fn work_queue_hands_out_each_index_once() {
        let q = WorkQueue::new(3);
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn drain_visits_every_item_exactly_once() {
        let pool = test_pool(4);
        let hits: Vec<AtomicUsize> = (0..97).map(|_| AtomicUsize::new(0)).collect();
        let queue = WorkQueue::new(hits.len());
        pool.drain(8, &queue, |i| {
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
        let m = pool.metrics();
        assert_eq!(m.items_processed, 97);
        assert_eq!(m.jobs_completed, 1);
        assert_eq!(m.active_workers, 0);
    }

    #[test]
    fn drain_empty_queue_is_noop() {
        let pool = test_pool(2);
        pool.drain(2, &WorkQueue::new(0), |_| panic!("no items"));
        assert_eq!(pool.metrics().jobs_completed, 0);
    }

    #[test]
    fn run_workers_passes_distinct_ids() {
        let pool = test_pool(3);
        let seen: Vec<AtomicUsize> = (0..5).map(|_| AtomicUsize::new(0)).collect();
        pool.run_workers(5, |id| {
            seen[id].fetch_add(1, Ordering::Relaxed);
        });
        assert!(seen.iter().all(|s| s.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn parallel_for_covers_range() {
        let pool = test_pool(4);
        let out = Mutex::new(vec![0usize; 50]);
        pool.parallel_for(10..50, 7, |i| {
            out.lock().unwrap()[i] = i * 2;
        });
        let out = out.into_inner().unwrap();
        for (i, &v) in out.iter().enumerate() {
            assert_eq!(v, if i >= 10 { i * 2 } else { 0 });
        }
    }

    #[test]
    fn worker_threads_are_named() {
        let pool = test_pool(2);
        let name = Mutex::new(String::new());
        pool.drain(1, &WorkQueue::new(1), |_| {
            *name.lock().unwrap() = std::thread::current().name().unwrap_or_default().to_string();
        });
        assert!(name.into_inner().unwrap().starts_with("test-"));
    }

    #[test]
    fn from_engine_config() {
        let cfg = EngineConfig { num_threads: 3, pin_threads: true, ..Default::default() };
        let pc = WorkerPoolConfig::from(&cfg);
        assert_eq!(pc.num_threads, 3);
        assert!(pc.pin_threads);
    }
}
