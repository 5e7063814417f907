//! Parallel executor for async entries.
//!
//! An unbounded pool of worker threads fed by a lock-free queue. Threads
//! are spawned lazily when work arrives and every worker is busy, and
//! retire after sitting idle past a threshold, so a quiet process holds
//! no threads at all.
//!
//! The pool has daemon semantics: dropping an [`Executor`] signals
//! shutdown but never joins, matching the expectation that async entry
//! execution must not block the thread that owned the pool. Tests that
//! want determinism use [`shutdown_and_wait`](Executor::shutdown_and_wait).

use crossbeam_queue::SegQueue;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

/// Default idle timeout before a worker retires.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Configuration options for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Idle time after which a worker thread exits.
    pub idle_timeout: Duration,
    /// Thread name prefix.
    pub thread_name_prefix: String,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            thread_name_prefix: "runloop".to_string(),
        }
    }
}

struct ExecutorInner {
    /// Work queue.
    queue: SegQueue<Job>,
    /// Current number of live worker threads.
    active_threads: AtomicUsize,
    /// Number of workers currently executing a job.
    busy_threads: AtomicUsize,
    /// Number of jobs waiting in the queue.
    pending_count: AtomicUsize,
    /// Monotonic source for worker names.
    next_worker_id: AtomicUsize,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Condition variable for worker parking.
    condvar: Condvar,
    /// Mutex for the condition variable.
    mutex: Mutex<()>,
    options: ExecutorOptions,
}

/// The unbounded parallel worker pool.
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    /// Creates an executor with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(ExecutorOptions::default())
    }

    /// Creates an executor with custom options.
    #[must_use]
    pub fn with_options(options: ExecutorOptions) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                queue: SegQueue::new(),
                active_threads: AtomicUsize::new(0),
                busy_threads: AtomicUsize::new(0),
                pending_count: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                condvar: Condvar::new(),
                mutex: Mutex::new(()),
                options,
            }),
        }
    }

    /// The process-wide default executor.
    ///
    /// Loopers built without an explicit executor share this one.
    pub fn global() -> &'static Arc<Executor> {
        static GLOBAL: OnceLock<Arc<Executor>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Executor::new()))
    }

    /// Submits a job for execution on some worker thread.
    ///
    /// A panicking job is caught and logged; it never takes its worker
    /// down. Jobs submitted after shutdown are dropped with a warning.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            tracing::warn!("job submitted after executor shutdown; dropped");
            return;
        }
        self.inner.queue.push(Box::new(f));
        self.inner.pending_count.fetch_add(1, Ordering::Relaxed);
        maybe_spawn_worker(&self.inner);
        self.notify_one();
    }

    /// Returns the number of jobs waiting in the queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Returns the number of workers currently executing a job.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.inner.busy_threads.load(Ordering::Relaxed)
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Requests shutdown. Queued jobs still run; workers exit once the
    /// queue drains.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.notify_all();
    }

    /// Shuts down and waits for every worker to exit.
    ///
    /// Returns `true` if the pool drained within `timeout`.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();
        let deadline = std::time::Instant::now() + timeout;
        while self.inner.active_threads.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.notify_all();
            thread::sleep(Duration::from_millis(5).min(remaining));
        }
        true
    }

    fn notify_one(&self) {
        let _guard = self.inner.mutex.lock().expect("executor lock poisoned");
        self.inner.condvar.notify_one();
    }

    fn notify_all(&self) {
        let _guard = self.inner.mutex.lock().expect("executor lock poisoned");
        self.inner.condvar.notify_all();
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Daemon semantics: signal, never join.
        self.shutdown();
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("active_threads", &self.active_threads())
            .field("busy_threads", &self.busy_threads())
            .field("pending_count", &self.pending_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Spawn a worker if there is pending work and nobody free to take it.
fn maybe_spawn_worker(inner: &Arc<ExecutorInner>) {
    let active = inner.active_threads.load(Ordering::Relaxed);
    let busy = inner.busy_threads.load(Ordering::Relaxed);
    let pending = inner.pending_count.load(Ordering::Relaxed);
    if busy >= active && pending > 0 {
        spawn_worker(inner);
    }
}

fn spawn_worker(inner: &Arc<ExecutorInner>) {
    let worker = Arc::clone(inner);
    let id = inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-async-{id}", inner.options.thread_name_prefix);
    inner.active_threads.fetch_add(1, Ordering::Relaxed);

    let spawned = thread::Builder::new().name(name).spawn(move || {
        worker_loop(&worker);
        worker.active_threads.fetch_sub(1, Ordering::Relaxed);
    });
    if let Err(err) = spawned {
        inner.active_threads.fetch_sub(1, Ordering::Relaxed);
        tracing::error!(error = %err, "failed to spawn executor worker");
    }
}

fn worker_loop(inner: &ExecutorInner) {
    loop {
        if let Some(job) = inner.queue.pop() {
            inner.pending_count.fetch_sub(1, Ordering::Relaxed);
            inner.busy_threads.fetch_add(1, Ordering::Relaxed);
            if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                tracing::error!(
                    panic = crate::sink::panic_message(&payload),
                    "executor job panicked"
                );
            }
            inner.busy_threads.fetch_sub(1, Ordering::Relaxed);
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        // Park with timeout; retire if the pool stayed idle.
        let guard = inner.mutex.lock().expect("executor lock poisoned");
        let (guard, result) = inner
            .condvar
            .wait_timeout(guard, inner.options.idle_timeout)
            .expect("executor lock poisoned");
        drop(guard);
        if result.timed_out() && inner.queue.is_empty() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn submitted_jobs_run() {
        let executor = Executor::new();
        let counter = Arc::new(AtomicI32::new(0));

        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            executor.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        assert!(executor.shutdown_and_wait(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn pool_scales_up_under_concurrent_load() {
        let executor = Executor::new();
        let barrier = Arc::new(std::sync::Barrier::new(4));

        // Submit one blocked job at a time so each spawn decision sees
        // every earlier worker already busy.
        for i in 0..3 {
            let barrier = Arc::clone(&barrier);
            executor.submit(move || {
                barrier.wait();
            });
            while executor.busy_threads() < i + 1 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        assert!(executor.active_threads() >= 3);
        barrier.wait();
        assert!(executor.shutdown_and_wait(Duration::from_secs(5)));
    }

    #[test]
    fn idle_workers_retire() {
        let executor = Executor::with_options(ExecutorOptions {
            idle_timeout: Duration::from_millis(20),
            ..ExecutorOptions::default()
        });
        executor.submit(|| {});

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while executor.active_threads() > 0 {
            assert!(std::time::Instant::now() < deadline, "workers never retired");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn panicking_job_does_not_poison_the_pool() {
        let executor = Executor::new();
        executor.submit(|| panic!("intentional"));

        let counter = Arc::new(AtomicI32::new(0));
        let c = Arc::clone(&counter);
        executor.submit(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });

        assert!(executor.shutdown_and_wait(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn submit_after_shutdown_is_dropped() {
        let executor = Executor::new();
        executor.shutdown();
        let counter = Arc::new(AtomicI32::new(0));
        let c = Arc::clone(&counter);
        executor.submit(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(executor.pending_count(), 0);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let executor = Executor::new();
        executor.submit(|| {});
        executor.shutdown();
        assert!(executor.is_shutdown());
        executor.shutdown();
        assert!(executor.shutdown_and_wait(Duration::from_secs(5)));
    }
}
