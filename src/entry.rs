//! Enqueueable units: tasks, messages, and barriers.
//!
//! An [`Entry`] is owned by exactly one place at a time: the queue from
//! post to promotion, then the looper until the user callback returns,
//! at which point it is recycled. The `finalized` and `recycled` markers
//! trace that lifecycle; ownership makes double-dispatch and
//! recycle-after-dispatch unrepresentable.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::handler::Handler;

/// Counter behind [`next_unique_id`].
static UNIQUE: AtomicU64 = AtomicU64::new(0);

/// Returns a process-wide unique, monotonically increasing id.
///
/// Entry ids, barrier tokens, and idle-handler ids all draw from this
/// counter. Wraps to zero if the counter is ever exhausted.
#[must_use]
pub fn next_unique_id() -> u64 {
    let id = UNIQUE.fetch_add(1, Ordering::Relaxed);
    if id == u64::MAX {
        UNIQUE.store(0, Ordering::Relaxed);
    }
    id
}

/// A boxed callable dispatched by the loop.
pub type Callable = Box<dyn FnOnce() + Send + 'static>;

/// A tagged data carrier delivered to a handler.
pub struct Message {
    what: i32,
    payload: Option<Box<dyn Any + Send>>,
    callback: Option<Callable>,
}

impl Message {
    /// Creates an empty message carrying only its `what` tag.
    #[must_use]
    pub fn new(what: i32) -> Self {
        Self {
            what,
            payload: None,
            callback: None,
        }
    }

    /// Attaches an opaque payload.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Any + Send) -> Self {
        self.payload = Some(Box::new(payload));
        self
    }

    /// Attaches a callable that runs instead of the handler callback.
    #[must_use]
    pub fn with_callback(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// The message tag.
    #[must_use]
    pub const fn what(&self) -> i32 {
        self.what
    }

    /// Borrows the payload downcast to `T`, if present and of that type.
    #[must_use]
    pub fn payload_ref<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|payload| payload.downcast_ref::<T>())
    }

    /// Takes the payload out of the message.
    pub fn take_payload(&mut self) -> Option<Box<dyn Any + Send>> {
        self.payload.take()
    }

    pub(crate) fn take_callback(&mut self) -> Option<Callable> {
        self.callback.take()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("what", &self.what)
            .field("payload", &self.payload.is_some())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

pub(crate) enum EntryKind {
    Task(Option<Callable>),
    Message(Option<Message>),
    Barrier { token: u64 },
}

/// The work carried by an entry, taken out at dispatch.
pub(crate) enum Work {
    Task(Callable),
    Message(Message),
    None,
}

/// A single dispatchable unit: a task, a message, or a barrier.
pub struct Entry {
    id: u64,
    when: u64,
    kind: EntryKind,
    is_async: bool,
    target: Option<Handler>,
    finalized: bool,
    recycled: bool,
}

impl Entry {
    fn new(kind: EntryKind) -> Self {
        Self {
            id: next_unique_id(),
            when: 0,
            kind,
            is_async: false,
            target: None,
            finalized: false,
            recycled: false,
        }
    }

    pub(crate) fn task(callable: Callable) -> Self {
        Self::new(EntryKind::Task(Some(callable)))
    }

    pub(crate) fn message(message: Message) -> Self {
        Self::new(EntryKind::Message(Some(message)))
    }

    pub(crate) fn barrier(token: u64) -> Self {
        Self::new(EntryKind::Barrier { token })
    }

    /// The globally unique entry id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The monotonic due-time in milliseconds; `0` means as soon as possible.
    #[must_use]
    pub const fn when(&self) -> u64 {
        self.when
    }

    /// True if this entry bypasses barriers and runs on the executor.
    #[must_use]
    pub const fn is_async(&self) -> bool {
        self.is_async
    }

    /// True if this entry is a barrier sentinel.
    #[must_use]
    pub const fn is_barrier(&self) -> bool {
        matches!(self.kind, EntryKind::Barrier { .. })
    }

    /// True if this entry carries a plain task callable.
    #[must_use]
    pub const fn is_task(&self) -> bool {
        matches!(self.kind, EntryKind::Task(_))
    }

    /// True if this entry carries a message.
    #[must_use]
    pub const fn is_message(&self) -> bool {
        matches!(self.kind, EntryKind::Message(_))
    }

    /// The message tag, for message entries.
    #[must_use]
    pub fn what(&self) -> Option<i32> {
        match &self.kind {
            EntryKind::Message(Some(message)) => Some(message.what()),
            _ => None,
        }
    }

    /// The barrier token, for barrier entries.
    #[must_use]
    pub const fn barrier_token(&self) -> Option<u64> {
        match self.kind {
            EntryKind::Barrier { token } => Some(token),
            _ => None,
        }
    }

    /// The handler this entry was posted through, if any.
    #[must_use]
    pub const fn target(&self) -> Option<&Handler> {
        self.target.as_ref()
    }

    /// True once the entry has been handed to user code.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// True once the entry has reached its terminal state.
    #[must_use]
    pub const fn is_recycled(&self) -> bool {
        self.recycled
    }

    pub(crate) fn set_when(&mut self, when: u64) {
        self.when = when;
    }

    pub(crate) fn set_async(&mut self, is_async: bool) {
        self.is_async = is_async;
    }

    pub(crate) fn set_target(&mut self, target: Handler) {
        self.target = Some(target);
    }

    /// Marks the entry as handed to user code.
    ///
    /// Once finalized an entry is immutable; finalizing twice is a
    /// lifecycle violation.
    pub(crate) fn mark_finalized(&mut self) {
        assert!(
            !self.finalized && !self.recycled,
            "entry {} finalized twice or after recycle",
            self.id
        );
        self.finalized = true;
    }

    /// Takes the dispatchable work out of the entry.
    pub(crate) fn take_work(&mut self) -> Work {
        match &mut self.kind {
            EntryKind::Task(callable) => callable.take().map_or(Work::None, Work::Task),
            EntryKind::Message(message) => message.take().map_or(Work::None, Work::Message),
            EntryKind::Barrier { .. } => Work::None,
        }
    }

    /// Retires the entry. Terminal; a recycled entry never re-enters a queue.
    pub(crate) fn recycle(mut self) {
        self.recycled = true;
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            EntryKind::Task(_) => "task",
            EntryKind::Message(_) => "message",
            EntryKind::Barrier { .. } => "barrier",
        };
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("when", &self.when)
            .field("kind", &kind)
            .field("async", &self.is_async)
            .field("finalized", &self.finalized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_ids_increase() {
        let a = next_unique_id();
        let b = next_unique_id();
        assert!(b > a);
    }

    #[test]
    fn task_entry_carries_its_callable() {
        let mut entry = Entry::task(Box::new(|| {}));
        assert!(entry.is_task());
        assert!(!entry.is_barrier());
        assert!(matches!(entry.take_work(), Work::Task(_)));
        assert!(matches!(entry.take_work(), Work::None));
    }

    #[test]
    fn message_payload_downcasts() {
        let mut message = Message::new(7).with_payload(String::from("hello"));
        assert_eq!(message.what(), 7);
        assert_eq!(message.payload_ref::<String>().map(String::as_str), Some("hello"));
        assert!(message.payload_ref::<u32>().is_none());
        assert!(message.take_payload().is_some());
        assert!(message.take_payload().is_none());
    }

    #[test]
    fn finalize_is_single_shot() {
        let mut entry = Entry::message(Message::new(1));
        assert!(!entry.is_finalized());
        entry.mark_finalized();
        assert!(entry.is_finalized());
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            entry.mark_finalized();
        }));
        assert!(outcome.is_err());
    }

    #[test]
    fn barrier_exposes_its_token() {
        let entry = Entry::barrier(42);
        assert!(entry.is_barrier());
        assert_eq!(entry.barrier_token(), Some(42));
        assert_eq!(entry.when(), 0);
        assert_eq!(entry.what(), None);
    }
}
