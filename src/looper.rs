//! The thread-bound loop driver.
//!
//! A [`Looper`] owns one [`Queue`] and is driven by the thread that calls
//! [`join_loop`](Looper::join_loop). Each iteration polls the queue,
//! dispatches at most one entry (inline, or on the parallel executor for
//! async entries), accounts for iteration time, and yields the remainder
//! of the iteration floor so a hot loop cannot monopolize a core.
//!
//! Cross-thread interaction is limited to posting (through a
//! [`Handler`](crate::handler::Handler)), waking, and quitting; everything
//! else happens on the loop thread.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, Thread, ThreadId};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::{apply_env_overrides, ConfigError, LooperConfig};
use crate::entry::{next_unique_id, Entry, Work};
use crate::executor::Executor;
use crate::queue::{Next, Queue};
use crate::registry::Registry;
use crate::sink::{ExceptionSink, LoggingSink};

/// Looper property flags, fixed while the loop is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Dispatch every entry through the parallel executor, async or not.
    Async,
    /// Let the queue suspend inside `next` while empty. Default on any
    /// non-SYSTEM looper, to save CPU time.
    Blocking,
    /// The looper carries internal system work: it cannot be destroyed
    /// and only quits from the primary thread.
    System,
    /// The looper belongs to a plugin owner; like SYSTEM, the flag is
    /// assigned at construction and never toggled afterwards.
    Plugin,
    /// Begin quitting as soon as a poll reports the queue empty. Only
    /// meaningful on non-blocking loopers; a blocking poll never
    /// returns empty while the loop is healthy.
    AutoQuit,
}

impl Flag {
    const fn bit(self) -> u8 {
        match self {
            Self::Async => 1,
            Self::Blocking => 2,
            Self::System => 4,
            Self::Plugin => 8,
            Self::AutoQuit => 16,
        }
    }
}

const STATE_POLLING: u8 = 1;
const STATE_STALLED: u8 = 2;
const STATE_QUITTING: u8 = 4;

/// EWMA smoothing: the average moves an eighth of the distance to each
/// new sample, reaching steady state in about sixteen iterations.
const AVERAGE_SMOOTHING_SHIFT: i64 = 8;

/// Extra pause injected while overloaded.
const OVERLOAD_YIELD_MS: u64 = 20;

struct IdleHandler {
    id: u64,
    callback: Box<dyn FnMut(&Looper) -> bool + Send>,
}

#[derive(Default)]
struct IdleHandlers {
    handlers: Vec<IdleHandler>,
    /// Ids unregistered while their handler was checked out for a run.
    pending_remove: Vec<u64>,
}

/// Parks the loop thread between iterations; posted wakes cut the pause
/// short.
struct Parker {
    lock: Mutex<bool>,
    cvar: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            lock: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    fn park_timeout(&self, duration: Duration) {
        let mut notified = self.lock.lock().expect("parker lock poisoned");
        if !*notified {
            let (guard, _) = self
                .cvar
                .wait_timeout(notified, duration)
                .expect("parker lock poisoned");
            notified = guard;
        }
        *notified = false;
    }

    fn unpark(&self) {
        let mut notified = self.lock.lock().expect("parker lock poisoned");
        *notified = true;
        self.cvar.notify_one();
    }
}

/// Builder for a [`Looper`].
pub struct LooperBuilder {
    flags: u8,
    blocking: Option<bool>,
    clock: Option<Arc<dyn Clock>>,
    config: LooperConfig,
    executor: Option<Arc<Executor>>,
    sink: Option<Arc<dyn ExceptionSink>>,
}

impl LooperBuilder {
    /// Starts a builder with no flags and default collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flags: 0,
            blocking: None,
            clock: None,
            config: LooperConfig::default(),
            executor: None,
            sink: None,
        }
    }

    /// Adds a construction-time flag. SYSTEM and PLUGIN may only be set
    /// here.
    #[must_use]
    pub fn flag(mut self, flag: Flag) -> Self {
        self.flags |= flag.bit();
        self
    }

    /// Overrides the BLOCKING default (on for non-SYSTEM loopers).
    #[must_use]
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = Some(blocking);
        self
    }

    /// Uses the given clock instead of a fresh [`SystemClock`].
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Uses the given configuration.
    #[must_use]
    pub fn config(mut self, config: LooperConfig) -> Self {
        self.config = config;
        self
    }

    /// Applies `RUNLOOP_*` environment overrides to the configuration.
    pub fn from_env(mut self) -> Result<Self, ConfigError> {
        apply_env_overrides(&mut self.config)?;
        Ok(self)
    }

    /// Uses the given executor instead of the process-wide default.
    #[must_use]
    pub fn executor(mut self, executor: Arc<Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Uses the given exception sink instead of [`LoggingSink`].
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn ExceptionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the looper.
    #[must_use]
    pub fn build(self) -> Arc<Looper> {
        let mut config = self.config;
        config.normalize();

        let mut flags = self.flags;
        let blocking = self
            .blocking
            .unwrap_or(flags & Flag::System.bit() == 0);
        if blocking {
            flags |= Flag::Blocking.bit();
        } else {
            flags &= !Flag::Blocking.bit();
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let queue = Arc::new(Queue::new(Arc::clone(&clock), blocking));
        let executor = self.executor.unwrap_or_else(|| Arc::clone(Executor::global()));
        let sink = self.sink.unwrap_or_else(|| Arc::new(LoggingSink));

        Arc::new(Looper {
            queue,
            clock,
            config,
            executor,
            sink,
            flags: AtomicU8::new(flags),
            states: AtomicU8::new(0),
            thread: Mutex::new(None),
            alias_threads: Mutex::new(Vec::new()),
            idle_handlers: Mutex::new(IdleHandlers::default()),
            parker: Parker::new(),
            last_polled_millis: AtomicU64::new(0),
            average_polled_millis: AtomicU64::new(0),
            overloaded: AtomicBool::new(false),
            drop_all_quit: AtomicBool::new(false),
            registry: Mutex::new(Weak::new()),
        })
    }
}

impl Default for LooperBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread-bound cooperative scheduler driving one queue.
pub struct Looper {
    queue: Arc<Queue>,
    clock: Arc<dyn Clock>,
    config: LooperConfig,
    executor: Arc<Executor>,
    sink: Arc<dyn ExceptionSink>,
    flags: AtomicU8,
    states: AtomicU8,
    /// The thread running the loop. None until `join_loop`, reset on exit.
    thread: Mutex<Option<Thread>>,
    /// Executor threads currently running this looper's async entries.
    alias_threads: Mutex<Vec<ThreadId>>,
    idle_handlers: Mutex<IdleHandlers>,
    parker: Parker,
    last_polled_millis: AtomicU64,
    average_polled_millis: AtomicU64,
    overloaded: AtomicBool,
    drop_all_quit: AtomicBool,
    registry: Mutex<Weak<Registry>>,
}

impl Looper {
    /// The queue this looper drives.
    #[must_use]
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// The clock due-times are measured against.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The looper's configuration.
    #[must_use]
    pub const fn config(&self) -> &LooperConfig {
        &self.config
    }

    /// A diagnostic name derived from the bound thread.
    #[must_use]
    pub fn name(&self) -> String {
        let guard = self.thread.lock().expect("looper thread slot poisoned");
        guard.as_ref().map_or_else(
            || "Looper (unbound)".to_string(),
            |t| format!("Looper ({})", t.name().unwrap_or("unnamed")),
        )
    }

    /// True if the looper carries `flag`.
    #[must_use]
    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.load(Ordering::Acquire) & flag.bit() != 0
    }

    /// Adds a flag.
    ///
    /// # Panics
    ///
    /// While the loop is running, or for SYSTEM / PLUGIN (those are
    /// assigned at construction).
    pub fn add_flag(&self, flag: Flag) {
        self.check_flag_mutable(flag);
        self.flags.fetch_or(flag.bit(), Ordering::AcqRel);
        if flag == Flag::Blocking {
            self.queue.set_blocking_enabled(true);
        }
    }

    /// Removes a flag. Same restrictions as [`add_flag`](Self::add_flag).
    pub fn remove_flag(&self, flag: Flag) {
        self.check_flag_mutable(flag);
        self.flags.fetch_and(!flag.bit(), Ordering::AcqRel);
        if flag == Flag::Blocking {
            self.queue.set_blocking_enabled(false);
        }
    }

    fn check_flag_mutable(&self, flag: Flag) {
        assert!(
            !self.is_running(),
            "can't modify looper flags while it's running"
        );
        assert!(
            !matches!(flag, Flag::System | Flag::Plugin),
            "SYSTEM and PLUGIN are assigned at construction"
        );
    }

    /// True while a thread is inside [`join_loop`](Self::join_loop).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.lock().expect("looper thread slot poisoned").is_some()
    }

    /// True if the calling thread is the loop thread or one of its
    /// async alias threads.
    #[must_use]
    pub fn is_current_thread(&self) -> bool {
        let current = thread::current().id();
        let bound = self
            .thread
            .lock()
            .expect("looper thread slot poisoned")
            .as_ref()
            .is_some_and(|t| t.id() == current);
        if bound {
            return true;
        }
        self.alias_threads
            .lock()
            .expect("alias threads poisoned")
            .contains(&current)
    }

    /// True once quitting has begun; the queue accepts no more entries.
    #[must_use]
    pub fn is_quitting(&self) -> bool {
        self.states.load(Ordering::Acquire) & STATE_QUITTING != 0
    }

    /// True while the loop thread is parked between iterations.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.states.load(Ordering::Acquire) & STATE_STALLED != 0
    }

    /// Duration of the most recent iteration, in milliseconds.
    #[must_use]
    pub fn last_polled_millis(&self) -> u64 {
        self.last_polled_millis.load(Ordering::Acquire)
    }

    /// Smoothed iteration duration, in milliseconds.
    #[must_use]
    pub fn average_polled_millis(&self) -> u64 {
        self.average_polled_millis.load(Ordering::Acquire)
    }

    /// True while the smoothed iteration time exceeds the configured
    /// overload threshold.
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Acquire)
    }

    /// Registers a predicate that runs whenever an iteration finds no
    /// deliverable entry. Returning `false` unregisters it.
    ///
    /// Returns an id for [`remove_idle_handler`](Self::remove_idle_handler).
    pub fn register_idle_handler(
        &self,
        callback: impl FnMut(&Looper) -> bool + Send + 'static,
    ) -> u64 {
        let id = next_unique_id();
        let mut guard = self.idle_handlers.lock().expect("idle handlers poisoned");
        guard.handlers.push(IdleHandler {
            id,
            callback: Box::new(callback),
        });
        id
    }

    /// Unregisters an idle handler by id. Returns `true` if it was found.
    ///
    /// A handler removed from inside an idle pass is dropped once the
    /// pass completes.
    pub fn remove_idle_handler(&self, id: u64) -> bool {
        let mut guard = self.idle_handlers.lock().expect("idle handlers poisoned");
        let before = guard.handlers.len();
        guard.handlers.retain(|h| h.id != id);
        if guard.handlers.len() < before {
            return true;
        }
        guard.pending_remove.push(id);
        false
    }

    /// Wakes the loop thread out of any pause so it re-polls immediately.
    pub fn wake(&self) {
        self.queue.wake();
        self.parker.unpark();
    }

    /// Runs the dispatch loop on the calling thread until the looper
    /// quits.
    ///
    /// # Panics
    ///
    /// If the loop is already running.
    pub fn join_loop(self: &Arc<Self>) {
        {
            let mut slot = self.thread.lock().expect("looper thread slot poisoned");
            if slot.is_some() {
                // Panic without the guard held so the running loop's
                // mutex is not poisoned.
                drop(slot);
                panic!("looper is already running");
            }
            *slot = Some(thread::current());
        }
        self.add_state(STATE_POLLING);
        tracing::debug!(looper = %self.name(), "loop started");

        // Throttle stamps so overload noise stays bounded. None means
        // never fired, so the first overload warns and yields promptly.
        let mut last_warning_millis: Option<u64> = None;
        let mut last_overload_millis: Option<u64> = None;

        loop {
            let loop_start = self.clock.now_millis();
            let mut polled_empty = false;

            match self.queue.next(loop_start) {
                Next::Success(mut entry) => {
                    entry.mark_finalized();
                    if entry.is_async() || self.has_flag(Flag::Async) {
                        self.dispatch_async(entry);
                    } else {
                        self.dispatch_inline(entry);
                    }
                    self.queue.clear_active();
                }
                Next::Empty => {
                    polled_empty = true;
                    if self.has_flag(Flag::AutoQuit) && !self.is_quitting() {
                        tracing::debug!(looper = %self.name(), "auto-quit on empty queue");
                        self.quit(false);
                    }
                    self.run_idle_handlers();
                    self.idle_pause(None);
                }
                Next::Stalled => {
                    self.run_idle_handlers();
                    self.idle_pause(None);
                }
                Next::Waiting { next_when } => {
                    self.run_idle_handlers();
                    self.idle_pause(Some(next_when));
                }
            }

            let now = self.clock.now_millis();
            let elapsed = if now < loop_start {
                tracing::warn!(
                    looper = %self.name(),
                    "time ran backwards, did the system clock change?"
                );
                0
            } else {
                now - loop_start
            };
            self.last_polled_millis.store(elapsed, Ordering::Release);

            let average = self.smooth_average(elapsed);
            if average > self.config.overload_threshold_ms {
                self.overloaded.store(true, Ordering::Release);
                let warning_due = last_warning_millis.map_or(true, |stamp| {
                    loop_start.saturating_sub(stamp) >= self.config.overload_warning_interval_ms
                });
                if self.config.warn_on_overload && warning_due {
                    tracing::warn!(
                        looper = %self.name(),
                        average_ms = average,
                        "can't keep up, is the looper overloaded?"
                    );
                    last_warning_millis = Some(loop_start);
                }
            } else {
                self.overloaded.store(false, Ordering::Release);
            }

            // Short iterations yield the remainder of the floor.
            if elapsed < self.config.iteration_floor_ms && !self.is_quitting() {
                self.pause(Duration::from_millis(self.config.iteration_floor_ms - elapsed));
            }

            let yield_due = last_overload_millis.map_or(true, |stamp| {
                loop_start.saturating_sub(stamp) > self.config.overload_yield_interval_ms
            });
            if self.is_overloaded() && yield_due {
                self.pause(Duration::from_millis(OVERLOAD_YIELD_MS));
                last_overload_millis = Some(loop_start);
            }

            if self.is_quitting()
                && (polled_empty
                    || self.drop_all_quit.load(Ordering::Acquire)
                    || !self.queue.has_pending_entries())
            {
                break;
            }
        }

        self.remove_state(STATE_POLLING);
        *self.thread.lock().expect("looper thread slot poisoned") = None;
        tracing::debug!("loop exited");
    }

    /// Quits once every entry already due has been delivered. Entries
    /// with a due-time still in the future are dropped.
    pub fn quit_safely(&self) {
        self.quit(false);
    }

    /// Quits immediately, dropping every pending entry, and removes the
    /// looper from its registry.
    ///
    /// # Panics
    ///
    /// While the loop is still running.
    pub fn quit_and_destroy(&self) {
        self.quit(true);
        assert!(!self.is_running(), "looper can't be destroyed while running");
        if let Some(registry) = self.registry().upgrade() {
            registry.deregister(self);
        }
    }

    /// Begins the quit protocol.
    ///
    /// # Panics
    ///
    /// When a SYSTEM looper is quit from any thread but the registry's
    /// primary thread.
    pub(crate) fn quit(&self, drop_all: bool) {
        if self.has_flag(Flag::System) {
            let on_primary = self
                .registry()
                .upgrade()
                .is_some_and(|r| r.is_primary_thread());
            assert!(
                on_primary,
                "SYSTEM loopers only quit from the primary thread"
            );
        }
        if self.is_quitting() {
            return;
        }
        tracing::debug!(looper = %self.name(), drop_all, "quitting");
        self.add_state(STATE_QUITTING);
        if drop_all {
            self.drop_all_quit.store(true, Ordering::Release);
        }
        self.queue.quit(drop_all);
        self.parker.unpark();
    }

    pub(crate) fn set_registry(&self, registry: Weak<Registry>) {
        *self.registry.lock().expect("registry slot poisoned") = registry;
    }

    fn registry(&self) -> Weak<Registry> {
        self.registry.lock().expect("registry slot poisoned").clone()
    }

    fn add_state(&self, bit: u8) {
        self.states.fetch_or(bit, Ordering::AcqRel);
    }

    fn remove_state(&self, bit: u8) {
        self.states.fetch_and(!bit, Ordering::AcqRel);
    }

    /// Moves the average an eighth of the way toward the latest sample.
    ///
    /// Integer division alone would leave a dead zone of ±7 ms where the
    /// update truncates to zero and the average never converges, so any
    /// nonzero distance moves at least one millisecond.
    fn smooth_average(&self, elapsed: u64) -> u64 {
        let average = self.average_polled_millis.load(Ordering::Acquire) as i64;
        let sample = elapsed as i64;
        let mut delta = (sample - average) / AVERAGE_SMOOTHING_SHIFT;
        if delta == 0 && sample != average {
            delta = if sample > average { 1 } else { -1 };
        }
        let next = (average + delta).max(0) as u64;
        self.average_polled_millis.store(next, Ordering::Release);
        next
    }

    fn dispatch_inline(&self, entry: Entry) {
        self.run_entry(entry);
    }

    /// Hands the entry to the executor, enrolling the executing thread
    /// as an alias for the duration so `Registry::obtain` still finds
    /// this looper from inside the callback.
    fn dispatch_async(self: &Arc<Self>, entry: Entry) {
        let looper = Arc::clone(self);
        self.executor.submit(move || {
            let alias = thread::current().id();
            looper.add_alias_thread(alias);
            looper.run_entry(entry);
            looper.remove_alias_thread(alias);
        });
    }

    /// Runs one finalized entry and recycles it. Panics from user code
    /// go to the exception sink; the loop is unaffected.
    fn run_entry(&self, mut entry: Entry) {
        let target = entry.target().cloned();
        let outcome = match entry.take_work() {
            Work::Task(callable) => catch_unwind(AssertUnwindSafe(callable)),
            Work::Message(mut message) => match target {
                Some(handler) => catch_unwind(AssertUnwindSafe(move || {
                    handler.dispatch_message(&mut message);
                })),
                None => Ok(()),
            },
            Work::None => Ok(()),
        };
        if let Err(payload) = outcome {
            self.sink.handle(&self.name(), payload);
        }
        entry.recycle();
    }

    fn run_idle_handlers(&self) {
        let mut checked_out = {
            let mut guard = self.idle_handlers.lock().expect("idle handlers poisoned");
            std::mem::take(&mut guard.handlers)
        };
        if checked_out.is_empty() {
            return;
        }
        checked_out.retain_mut(|handler| (handler.callback)(self));

        let mut guard = self.idle_handlers.lock().expect("idle handlers poisoned");
        // Registrations made during the pass landed in the emptied list;
        // survivors keep their earlier position.
        let added = std::mem::take(&mut guard.handlers);
        guard.handlers = checked_out;
        guard.handlers.extend(added);
        if !guard.pending_remove.is_empty() {
            let pending = std::mem::take(&mut guard.pending_remove);
            guard.handlers.retain(|h| !pending.contains(&h.id));
        }
    }

    /// Sleeps after an idle poll: the iteration floor, shortened to the
    /// next due-time. Skipped while quitting, and never less than the
    /// queue already waited (a BLOCKING poll returns idle results only
    /// when quitting).
    fn idle_pause(&self, next_when: Option<u64>) {
        if self.is_quitting() {
            return;
        }
        let floor = self.config.iteration_floor_ms;
        let wait = match next_when {
            Some(due) => floor.min(due.saturating_sub(self.clock.now_millis())),
            None => floor,
        };
        if wait > 0 {
            self.pause(Duration::from_millis(wait));
        }
    }

    fn pause(&self, duration: Duration) {
        self.add_state(STATE_STALLED);
        self.parker.park_timeout(duration);
        self.remove_state(STATE_STALLED);
    }

    fn add_alias_thread(&self, id: ThreadId) {
        self.alias_threads
            .lock()
            .expect("alias threads poisoned")
            .push(id);
    }

    fn remove_alias_thread(&self, id: ThreadId) {
        let mut guard = self.alias_threads.lock().expect("alias threads poisoned");
        if let Some(pos) = guard.iter().position(|t| *t == id) {
            guard.swap_remove(pos);
        }
    }
}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("name", &self.name())
            .field("running", &self.is_running())
            .field("quitting", &self.is_quitting())
            .field("overloaded", &self.is_overloaded())
            .field("last_polled_ms", &self.last_polled_millis())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn fast_config() -> LooperConfig {
        LooperConfig {
            iteration_floor_ms: 1,
            ..LooperConfig::default()
        }
    }

    fn spawn_loop(looper: &Arc<Looper>) -> thread::JoinHandle<()> {
        let looper = Arc::clone(looper);
        thread::Builder::new()
            .name("looper-test".into())
            .spawn(move || looper.join_loop())
            .expect("failed to spawn loop thread")
    }

    #[test]
    fn blocking_defaults_follow_the_system_flag() {
        let plain = LooperBuilder::new().build();
        assert!(plain.has_flag(Flag::Blocking));

        let system = LooperBuilder::new().flag(Flag::System).build();
        assert!(!system.has_flag(Flag::Blocking));
        assert!(system.has_flag(Flag::System));

        let opted_out = LooperBuilder::new().blocking(false).build();
        assert!(!opted_out.has_flag(Flag::Blocking));
    }

    #[test]
    fn flags_are_frozen_while_running() {
        let looper = LooperBuilder::new().config(fast_config()).build();
        let join = spawn_loop(&looper);
        while !looper.is_running() {
            thread::sleep(Duration::from_millis(1));
        }

        let result = catch_unwind(AssertUnwindSafe(|| looper.add_flag(Flag::AutoQuit)));
        assert!(result.is_err());

        looper.quit_safely();
        join.join().expect("loop thread panicked");

        // Not running any more: mutation is allowed again.
        looper.add_flag(Flag::AutoQuit);
        assert!(looper.has_flag(Flag::AutoQuit));
    }

    #[test]
    fn system_and_plugin_flags_cannot_be_toggled() {
        let looper = LooperBuilder::new().build();
        assert!(catch_unwind(AssertUnwindSafe(|| looper.add_flag(Flag::System))).is_err());
        assert!(catch_unwind(AssertUnwindSafe(|| looper.remove_flag(Flag::Plugin))).is_err());
    }

    #[test]
    fn joining_twice_is_fatal() {
        let looper = LooperBuilder::new().config(fast_config()).build();
        let join = spawn_loop(&looper);
        while !looper.is_running() {
            thread::sleep(Duration::from_millis(1));
        }

        let second = Arc::clone(&looper);
        let result = catch_unwind(AssertUnwindSafe(move || second.join_loop()));
        assert!(result.is_err());

        looper.quit_safely();
        join.join().expect("loop thread panicked");
        assert!(!looper.is_running());
    }

    #[test]
    fn current_thread_covers_loop_and_alias_threads() {
        let looper = LooperBuilder::new().config(fast_config()).build();
        assert!(!looper.is_current_thread());
        let join = spawn_loop(&looper);

        let handler = Handler::new(Arc::clone(&looper));
        let (tx, rx) = mpsc::channel();

        let inline_looper = Arc::clone(&looper);
        let inline_tx = tx.clone();
        handler.post(move || {
            inline_tx
                .send(inline_looper.is_current_thread())
                .expect("send failed");
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).expect("no inline reply"));

        let async_handler = Handler::builder(Arc::clone(&looper)).set_async(true).build();
        let async_looper = Arc::clone(&looper);
        async_handler.post(move || {
            tx.send(async_looper.is_current_thread()).expect("send failed");
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).expect("no async reply"));

        looper.quit_safely();
        join.join().expect("loop thread panicked");
    }

    #[test]
    fn panicking_callback_reaches_the_sink_and_loop_survives() {
        struct Recorder(Arc<AtomicUsize>);
        impl ExceptionSink for Recorder {
            fn handle(&self, _looper: &str, _payload: crate::sink::PanicPayload) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let caught = Arc::new(AtomicUsize::new(0));
        let looper = LooperBuilder::new()
            .config(fast_config())
            .sink(Arc::new(Recorder(Arc::clone(&caught))))
            .build();
        let join = spawn_loop(&looper);

        let handler = Handler::new(Arc::clone(&looper));
        handler.post(|| panic!("intentional"));

        let (tx, rx) = mpsc::channel();
        handler.post(move || tx.send(()).expect("send failed"));
        rx.recv_timeout(Duration::from_secs(5)).expect("loop died after panic");
        assert_eq!(caught.load(Ordering::SeqCst), 1);

        looper.quit_safely();
        join.join().expect("loop thread panicked");
    }

    #[test]
    fn auto_quit_ends_the_loop_once_drained() {
        let looper = LooperBuilder::new()
            .config(fast_config())
            .blocking(false)
            .flag(Flag::AutoQuit)
            .build();
        let handler = Handler::new(Arc::clone(&looper));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_task = Arc::clone(&ran);
        handler.post(move || {
            ran_in_task.fetch_add(1, Ordering::SeqCst);
        });

        let join = spawn_loop(&looper);
        join.join().expect("loop thread panicked");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(looper.is_quitting());
    }

    #[test]
    fn idle_handlers_run_and_self_unregister() {
        let looper = LooperBuilder::new()
            .config(fast_config())
            .blocking(false)
            .build();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_handler = Arc::clone(&runs);
        looper.register_idle_handler(move |_| {
            // Stay registered for two passes, then drop out.
            runs_in_handler.fetch_add(1, Ordering::SeqCst) < 1
        });

        let join = spawn_loop(&looper);
        while runs.load(Ordering::SeqCst) < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        looper.quit_safely();
        join.join().expect("loop thread panicked");
    }

    #[test]
    fn remove_idle_handler_by_id() {
        let looper = LooperBuilder::new().build();
        let id = looper.register_idle_handler(|_| true);
        assert!(looper.remove_idle_handler(id));
        assert!(!looper.remove_idle_handler(id));
    }

    #[test]
    fn destroy_while_running_is_fatal() {
        let looper = LooperBuilder::new().config(fast_config()).build();
        let join = spawn_loop(&looper);

        // Pin the loop thread inside a dispatched task so it is
        // provably still running when destroy is attempted.
        let handler = Handler::new(Arc::clone(&looper));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        handler.post(move || {
            entered_tx.send(()).expect("send failed");
            let _ = gate_rx.recv();
        });
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("task never started");

        let target = Arc::clone(&looper);
        let result = catch_unwind(AssertUnwindSafe(move || target.quit_and_destroy()));
        assert!(result.is_err());

        // quit(true) already went through, so the loop exits on its own.
        gate_tx.send(()).expect("send failed");
        join.join().expect("loop thread panicked");
    }

    #[test]
    fn overload_flag_rises_under_load_and_clears_when_idle() {
        // Non-blocking so idle iterations keep running and the average
        // can decay once the load stops.
        let looper = LooperBuilder::new()
            .config(LooperConfig {
                iteration_floor_ms: 1,
                overload_threshold_ms: 5,
                warn_on_overload: false,
                ..LooperConfig::default()
            })
            .blocking(false)
            .build();
        let join = spawn_loop(&looper);
        let handler = Handler::new(Arc::clone(&looper));

        // Saturate: every dispatch sleeps well past the threshold.
        for _ in 0..24 {
            handler.post(|| thread::sleep(Duration::from_millis(20)));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !looper.is_overloaded() {
            assert!(std::time::Instant::now() < deadline, "never became overloaded");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(looper.average_polled_millis() > 5);

        // Idle iterations decay the average back under the threshold.
        let deadline = std::time::Instant::now() + Duration::from_secs(20);
        while looper.is_overloaded() {
            assert!(std::time::Instant::now() < deadline, "never recovered");
            thread::sleep(Duration::from_millis(10));
        }

        looper.quit_safely();
        join.join().expect("loop thread panicked");
    }
}
