//! The time-ordered, barrier-aware entry store.
//!
//! One mutex guards the store; a condvar on that mutex serves both the
//! empty-queue wait and the timed wait for a future due-time. Dispatch
//! happens with the lock released, so a callback posting back to its own
//! queue never deadlocks. Observable state (`polling`, `blocking`,
//! `quitting`, the active result code) lives in atomics so readers never
//! contend with the loop.
//!
//! # Ordering
//!
//! Entries are keyed `(when, id)` ascending: earliest due-time first,
//! post order within a due-time. Barriers always carry `when = 0`, so a
//! barrier sits behind everything already queued at `when = 0` and ahead
//! of every later post — which is exactly the window of entries it is
//! meant to withhold. Async entries bypass barriers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::Clock;
use crate::entry::Entry;
use crate::error::{Error, ErrorKind, Result};

const LOCK_POISONED: &str = "queue lock poisoned";

static LOCK_TOKEN_COUNTER: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static LOCK_TOKEN: u64 = LOCK_TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
}

fn current_lock_token() -> u64 {
    LOCK_TOKEN.with(|t| *t)
}

/// The result code left behind by the most recent poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PollResult {
    /// The queue is new, or the last delivered entry has been cleared.
    None = 0,
    /// The queue had no entries.
    Empty = 1,
    /// A barrier is in the way and no async entry could bypass it.
    Stalled = 2,
    /// An entry was promoted and returned.
    Success = 3,
    /// The earliest entry is still in the future.
    Waiting = 4,
}

impl PollResult {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Empty,
            2 => Self::Stalled,
            3 => Self::Success,
            4 => Self::Waiting,
            _ => Self::None,
        }
    }
}

/// The outcome of a single [`Queue::next`] call.
#[derive(Debug)]
pub(crate) enum Next {
    /// A ready entry, removed from the store and owned by the caller.
    Success(Entry),
    /// Nothing queued.
    Empty,
    /// A barrier is withholding every ready entry.
    Stalled,
    /// The earliest entry becomes due at `next_when`.
    Waiting {
        /// Due-time of the earliest queued entry.
        next_when: u64,
    },
}

/// A post rejected because the queue is quitting.
///
/// Carries the entry back so the poster can recycle it.
pub struct PostError {
    entry: Entry,
}

impl PostError {
    pub(crate) fn new(entry: Entry) -> Self {
        Self { entry }
    }

    pub(crate) fn into_entry(self) -> Entry {
        self.entry
    }
}

impl fmt::Debug for PostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostError").field("entry", &self.entry).finish()
    }
}

impl fmt::Display for PostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue is quitting; entry {} rejected", self.entry.id())
    }
}

impl std::error::Error for PostError {}

/// Snapshot of the entry currently held for dispatch.
#[derive(Debug, Clone, Copy)]
struct ActiveEntry {
    id: u64,
    when: u64,
}

struct QueueInner {
    entries: BTreeMap<(u64, u64), Entry>,
    active: Option<ActiveEntry>,
    barriers: BTreeSet<u64>,
}

enum Polled {
    Ready(Entry),
    Stalled,
    Future(u64),
    Nothing,
}

/// The ordered entry store owned by one looper.
pub struct Queue {
    clock: Arc<dyn Clock>,
    blocking_enabled: AtomicBool,
    inner: Mutex<QueueInner>,
    cond: Condvar,
    polling: AtomicBool,
    blocking: AtomicBool,
    quitting: AtomicBool,
    result: AtomicU8,
    lock_owner: AtomicU64,
}

impl Queue {
    pub(crate) fn new(clock: Arc<dyn Clock>, blocking_enabled: bool) -> Self {
        Self {
            clock,
            blocking_enabled: AtomicBool::new(blocking_enabled),
            inner: Mutex::new(QueueInner {
                entries: BTreeMap::new(),
                active: None,
                barriers: BTreeSet::new(),
            }),
            cond: Condvar::new(),
            polling: AtomicBool::new(false),
            blocking: AtomicBool::new(false),
            quitting: AtomicBool::new(false),
            result: AtomicU8::new(PollResult::None as u8),
            lock_owner: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        let guard = self.inner.lock().expect(LOCK_POISONED);
        self.lock_owner.store(current_lock_token(), Ordering::Relaxed);
        guard
    }

    fn unlock(&self, guard: MutexGuard<'_, QueueInner>) {
        self.lock_owner.store(0, Ordering::Relaxed);
        drop(guard);
    }

    fn set_result(&self, result: PollResult) {
        self.result.store(result as u8, Ordering::Release);
    }

    /// Inserts `entry` at `when`. Fails if the queue is quitting; the
    /// rejected entry travels back inside the error for recycling.
    pub(crate) fn post(&self, mut entry: Entry, when: u64) -> std::result::Result<u64, PostError> {
        debug_assert!(!entry.is_barrier(), "barriers go through post_barrier");
        let mut guard = self.lock();
        if self.quitting.load(Ordering::Acquire) {
            self.unlock(guard);
            return Err(PostError::new(entry));
        }
        entry.set_when(when);
        let id = entry.id();
        let key = (when, id);
        let now_earliest = guard.entries.first_key_value().map_or(true, |(k, _)| key < *k);
        guard.entries.insert(key, entry);
        if now_earliest && self.blocking.load(Ordering::Acquire) {
            self.cond.notify_all();
        }
        self.unlock(guard);
        Ok(id)
    }

    /// Inserts a barrier and returns its token.
    ///
    /// The barrier withholds every synchronous entry queued behind it
    /// until [`remove_barrier`](Self::remove_barrier) is called with the
    /// token. Async entries are not affected.
    pub fn post_barrier(&self) -> Result<u64> {
        let mut guard = self.lock();
        if self.quitting.load(Ordering::Acquire) {
            self.unlock(guard);
            return Err(Error::new(ErrorKind::Quitting).with_context("barrier rejected"));
        }
        let token = crate::entry::next_unique_id();
        let entry = Entry::barrier(token);
        let key = (0, entry.id());
        let now_earliest = guard.entries.first_key_value().map_or(true, |(k, _)| key < *k);
        guard.barriers.insert(token);
        guard.entries.insert(key, entry);
        if now_earliest && self.blocking.load(Ordering::Acquire) {
            self.cond.notify_all();
        }
        self.unlock(guard);
        Ok(token)
    }

    /// Removes the barrier identified by `token`.
    ///
    /// Returns `false` if no such barrier is live. Signals the loop when
    /// the removal exposes a now-ready entry.
    pub fn remove_barrier(&self, token: u64) -> bool {
        let mut guard = self.lock();
        if !guard.barriers.remove(&token) {
            self.unlock(guard);
            return false;
        }
        let key = guard
            .entries
            .iter()
            .find(|(_, e)| e.barrier_token() == Some(token))
            .map(|(k, _)| *k);
        if let Some(key) = key {
            if let Some(entry) = guard.entries.remove(&key) {
                entry.recycle();
            }
        }
        let now = self.clock.now_millis();
        let exposed_ready = guard
            .entries
            .first_key_value()
            .is_some_and(|((when, _), e)| !e.is_barrier() && *when <= now);
        if exposed_ready && self.blocking.load(Ordering::Acquire) {
            self.cond.notify_all();
        }
        self.unlock(guard);
        true
    }

    /// Removes and recycles every non-barrier entry matching `predicate`.
    ///
    /// The predicate runs with the queue lock held: it must not call
    /// back into the queue. Returns the number of entries removed.
    pub fn remove_if<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&Entry) -> bool,
    {
        let mut guard = self.lock();
        let keys: Vec<(u64, u64)> = guard
            .entries
            .iter()
            .filter(|(_, e)| !e.is_barrier() && predicate(e))
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            if let Some(entry) = guard.entries.remove(key) {
                entry.recycle();
            }
        }
        self.unlock(guard);
        keys.len()
    }

    /// Polls for the next deliverable entry.
    ///
    /// Called only by the looper thread. With the BLOCKING flag the call
    /// suspends internally on an empty queue (untimed) or a future
    /// due-time (timed) and re-polls with a fresh clock reading; without
    /// it the call returns `Empty` / `Waiting` immediately. A quitting
    /// queue never suspends.
    pub(crate) fn next(&self, now: u64) -> Next {
        self.polling.store(true, Ordering::Release);
        let next = self.next_inner(now);
        self.polling.store(false, Ordering::Release);
        next
    }

    fn next_inner(&self, mut now: u64) -> Next {
        let mut guard = self.lock();
        loop {
            debug_assert!(guard.active.is_none(), "next() while an entry is active");
            match Self::poll_ready(&mut guard, now) {
                Polled::Ready(entry) => {
                    guard.active = Some(ActiveEntry {
                        id: entry.id(),
                        when: entry.when(),
                    });
                    self.set_result(PollResult::Success);
                    self.unlock(guard);
                    return Next::Success(entry);
                }
                Polled::Stalled => {
                    self.set_result(PollResult::Stalled);
                    self.unlock(guard);
                    return Next::Stalled;
                }
                Polled::Future(next_when) => {
                    self.set_result(PollResult::Waiting);
                    if self.blocking_allowed() {
                        guard = self.await_signal(guard, Some(next_when.saturating_sub(now)));
                        now = self.clock.now_millis();
                        continue;
                    }
                    self.unlock(guard);
                    return Next::Waiting { next_when };
                }
                Polled::Nothing => {
                    self.set_result(PollResult::Empty);
                    if self.blocking_allowed() {
                        guard = self.await_signal(guard, None);
                        now = self.clock.now_millis();
                        continue;
                    }
                    self.unlock(guard);
                    return Next::Empty;
                }
            }
        }
    }

    fn blocking_allowed(&self) -> bool {
        self.blocking_enabled.load(Ordering::Acquire) && !self.quitting.load(Ordering::Acquire)
    }

    /// Mirrors the looper's BLOCKING flag; only touched while the loop
    /// is not running.
    pub(crate) fn set_blocking_enabled(&self, enabled: bool) {
        self.blocking_enabled.store(enabled, Ordering::Release);
    }

    /// Suspends on the condvar, untimed or for `timeout_ms`.
    fn await_signal<'a>(
        &'a self,
        guard: MutexGuard<'a, QueueInner>,
        timeout_ms: Option<u64>,
    ) -> MutexGuard<'a, QueueInner> {
        self.blocking.store(true, Ordering::Release);
        self.lock_owner.store(0, Ordering::Relaxed);
        let guard = match timeout_ms {
            Some(ms) => {
                self.cond
                    .wait_timeout(guard, Duration::from_millis(ms))
                    .expect(LOCK_POISONED)
                    .0
            }
            None => self.cond.wait(guard).expect(LOCK_POISONED),
        };
        self.lock_owner.store(current_lock_token(), Ordering::Relaxed);
        self.blocking.store(false, Ordering::Release);
        guard
    }

    fn poll_ready(inner: &mut QueueInner, now: u64) -> Polled {
        let Some((&first_key, first)) = inner.entries.first_key_value() else {
            return Polled::Nothing;
        };
        if first.is_barrier() {
            // Only a ready async entry may jump a barrier.
            let bypass = inner
                .entries
                .iter()
                .take_while(|((when, _), _)| *when <= now)
                .find(|(_, e)| e.is_async() && !e.is_barrier())
                .map(|(k, _)| *k);
            return match bypass {
                Some(key) => Polled::Ready(inner.entries.remove(&key).expect("bypass key vanished")),
                None => Polled::Stalled,
            };
        }
        let (when, _) = first_key;
        if when <= now {
            Polled::Ready(inner.entries.remove(&first_key).expect("first key vanished"))
        } else {
            Polled::Future(when)
        }
    }

    /// Clears the active snapshot after the looper finishes a dispatch.
    pub(crate) fn clear_active(&self) {
        let mut guard = self.lock();
        guard.active = None;
        self.set_result(PollResult::None);
        self.unlock(guard);
    }

    /// Signals the condvar, but only if a thread is suspended on it.
    pub fn wake(&self) {
        if !self.blocking.load(Ordering::Acquire) {
            return;
        }
        let guard = self.lock();
        self.cond.notify_all();
        self.unlock(guard);
    }

    /// Transitions the queue to quitting and drains it.
    ///
    /// With `drop_all` every entry goes; otherwise only entries with a
    /// due-time still in the future. Live barriers are dropped in both
    /// modes so the remaining drain cannot stall. Drained entries are
    /// recycled.
    pub(crate) fn quit(&self, drop_all: bool) {
        let mut guard = self.lock();
        if self.quitting.swap(true, Ordering::AcqRel) {
            self.unlock(guard);
            return;
        }
        let now = self.clock.now_millis();
        let keys: Vec<(u64, u64)> = guard
            .entries
            .iter()
            .filter(|((when, _), e)| drop_all || e.is_barrier() || *when > now)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(entry) = guard.entries.remove(&key) {
                if let Some(token) = entry.barrier_token() {
                    guard.barriers.remove(&token);
                }
                entry.recycle();
            }
        }
        self.cond.notify_all();
        self.unlock(guard);
    }

    /// True once [`quit`](Self::quit) has been called.
    #[must_use]
    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::Acquire)
    }

    /// True while the looper thread is inside [`next`](Self::next).
    ///
    /// A good signal that the loop is alive rather than stuck in a
    /// callback. Always false once quitting.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        !self.is_quitting() && self.polling.load(Ordering::Acquire)
    }

    /// True while a thread is suspended on the condvar.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }

    /// The result code of the most recent poll.
    #[must_use]
    pub fn active_result(&self) -> PollResult {
        PollResult::from_u8(self.result.load(Ordering::Acquire))
    }

    /// `(id, when)` of the entry currently held for dispatch, if any.
    #[must_use]
    pub fn active_entry(&self) -> Option<(u64, u64)> {
        let guard = self.lock();
        let active = guard.active.map(|a| (a.id, a.when));
        self.unlock(guard);
        active
    }

    /// True if the last poll found the queue empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active_result() == PollResult::Empty
    }

    /// True if the looper has no entry due for processing.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self.active_result(), PollResult::Empty | PollResult::Waiting)
    }

    /// True if the last poll stalled on a barrier.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.active_result() == PollResult::Stalled
    }

    /// True if the last poll found only future-due entries.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.active_result() == PollResult::Waiting
    }

    /// True if any entry (including barriers) is queued.
    #[must_use]
    pub fn has_pending_entries(&self) -> bool {
        let guard = self.lock();
        let pending = !guard.entries.is_empty();
        self.unlock(guard);
        pending
    }

    /// Number of queued entries, barriers included.
    #[must_use]
    pub fn len(&self) -> usize {
        let guard = self.lock();
        let len = guard.entries.len();
        self.unlock(guard);
        len
    }

    /// Due-time of the earliest queued entry.
    #[must_use]
    pub fn earliest_when(&self) -> Option<u64> {
        let guard = self.lock();
        let when = guard.entries.first_key_value().map(|((when, _), _)| *when);
        self.unlock(guard);
        when
    }

    /// Due-time of the latest queued entry.
    #[must_use]
    pub fn latest_when(&self) -> Option<u64> {
        let guard = self.lock();
        let when = guard.entries.last_key_value().map(|((when, _), _)| *when);
        self.unlock(guard);
        when
    }

    /// True if the calling thread currently holds the queue lock.
    ///
    /// Diagnostic only; dispatch runs with the lock released, so user
    /// callbacks should always observe `false`.
    #[must_use]
    pub fn is_locked_by_current_thread(&self) -> bool {
        self.lock_owner.load(Ordering::Relaxed) == current_lock_token()
    }

    #[cfg(test)]
    fn post_task(&self, when: u64, f: impl FnOnce() + Send + 'static) -> u64 {
        self.post(Entry::task(Box::new(f)), when).expect("queue quitting")
    }

    #[cfg(test)]
    fn post_async_task(&self, when: u64, f: impl FnOnce() + Send + 'static) -> u64 {
        let mut entry = Entry::task(Box::new(f));
        entry.set_async(true);
        self.post(entry, when).expect("queue quitting")
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("blocking_enabled", &self.blocking_enabled.load(Ordering::Relaxed))
            .field("quitting", &self.is_quitting())
            .field("result", &self.active_result())
            .field("len", &self.len())
            .finish()
    }
}
