//! The user-facing posting façade.
//!
//! A [`Handler`] is bound to exactly one [`Looper`] at construction and
//! never rebound. It stamps, posts, and cancels entries against that
//! looper's queue, and receives message callbacks at dispatch time.
//!
//! The *post* methods enqueue plain callables; the *send_message*
//! methods enqueue a [`Message`] that comes back through the handler's
//! callback chain on the loop thread.

use std::fmt;
use std::sync::Arc;

use crate::entry::{Entry, Message};
use crate::error::Result;
use crate::looper::{Flag, Looper};

/// Receives messages that were not consumed by the handler callback.
pub trait MessageReceiver: Send + Sync {
    /// Handles a delivered message.
    fn handle_message(&self, message: &mut Message);
}

type MessageCallback = Box<dyn Fn(&mut Message) -> bool + Send + Sync>;

struct HandlerInner {
    looper: Arc<Looper>,
    callback: Option<MessageCallback>,
    receiver: Option<Box<dyn MessageReceiver>>,
    is_async: bool,
}

/// Builder for a [`Handler`].
pub struct HandlerBuilder {
    inner: HandlerInner,
}

impl HandlerBuilder {
    /// Installs a message callback.
    ///
    /// The callback runs before [`MessageReceiver::handle_message`];
    /// returning `true` suppresses the receiver.
    #[must_use]
    pub fn callback(mut self, callback: impl Fn(&mut Message) -> bool + Send + Sync + 'static) -> Self {
        self.inner.callback = Some(Box::new(callback));
        self
    }

    /// Installs the terminal message receiver.
    #[must_use]
    pub fn receiver(mut self, receiver: impl MessageReceiver + 'static) -> Self {
        self.inner.receiver = Some(Box::new(receiver));
        self
    }

    /// Stamps every posted entry async, exempting it from barriers and
    /// moving its execution to the parallel executor.
    #[must_use]
    pub fn set_async(mut self, is_async: bool) -> Self {
        self.inner.is_async = is_async;
        self
    }

    /// Builds the handler.
    #[must_use]
    pub fn build(self) -> Handler {
        Handler {
            inner: Arc::new(self.inner),
        }
    }
}

/// Posts and dispatches entries against one looper's queue.
///
/// Cloning is cheap and yields the same logical handler: clones share
/// identity for cancellation purposes.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<HandlerInner>,
}

impl Handler {
    /// Creates a plain handler bound to `looper`.
    #[must_use]
    pub fn new(looper: Arc<Looper>) -> Self {
        Self::builder(looper).build()
    }

    /// Starts building a handler bound to `looper`.
    #[must_use]
    pub fn builder(looper: Arc<Looper>) -> HandlerBuilder {
        HandlerBuilder {
            inner: HandlerInner {
                looper,
                callback: None,
                receiver: None,
                is_async: false,
            },
        }
    }

    /// The looper this handler posts to.
    #[must_use]
    pub fn looper(&self) -> &Arc<Looper> {
        &self.inner.looper
    }

    /// True if this handler stamps every entry async.
    #[must_use]
    pub fn is_async(&self) -> bool {
        self.inner.is_async
    }

    /// True if `other` is a clone of this handler.
    #[must_use]
    pub fn same_handler(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Posts a callable for delivery as soon as possible.
    ///
    /// Returns `false` if the queue is quitting.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) -> bool {
        let now = self.inner.looper.clock().now_millis();
        self.enqueue(Entry::task(Box::new(f)), now)
    }

    /// Posts a callable for delivery after `delay_ms`.
    pub fn post_delayed(&self, delay_ms: u64, f: impl FnOnce() + Send + 'static) -> bool {
        let when = self.inner.looper.clock().now_millis().saturating_add(delay_ms);
        self.enqueue(Entry::task(Box::new(f)), when)
    }

    /// Posts a callable for delivery at the absolute monotonic time
    /// `when_ms`. A time in the past is treated as immediately due.
    pub fn post_at_time(&self, when_ms: u64, f: impl FnOnce() + Send + 'static) -> bool {
        self.enqueue(Entry::task(Box::new(f)), when_ms)
    }

    /// Posts a callable at the front of the queue (`when = 0`).
    ///
    /// This jumps ahead of every pending entry and can easily starve
    /// the queue or invert orderings; reserve it for very special
    /// circumstances.
    pub fn post_at_front(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.enqueue(Entry::task(Box::new(f)), 0)
    }

    /// Sends a message for delivery as soon as possible.
    pub fn send_message(&self, message: Message) -> bool {
        let now = self.inner.looper.clock().now_millis();
        self.enqueue(Entry::message(message), now)
    }

    /// Sends a message for delivery after `delay_ms`.
    pub fn send_message_delayed(&self, delay_ms: u64, message: Message) -> bool {
        let when = self.inner.looper.clock().now_millis().saturating_add(delay_ms);
        self.enqueue(Entry::message(message), when)
    }

    /// Sends a message for delivery at the absolute monotonic time `when_ms`.
    pub fn send_message_at_time(&self, when_ms: u64, message: Message) -> bool {
        self.enqueue(Entry::message(message), when_ms)
    }

    /// Sends a message carrying only `what`.
    pub fn send_empty_message(&self, what: i32) -> bool {
        self.send_message(Message::new(what))
    }

    /// Sends a message carrying only `what` after `delay_ms`.
    pub fn send_empty_message_delayed(&self, what: i32, delay_ms: u64) -> bool {
        self.send_message_delayed(delay_ms, Message::new(what))
    }

    /// Sends a message carrying only `what` at the absolute time `when_ms`.
    pub fn send_empty_message_at_time(&self, what: i32, when_ms: u64) -> bool {
        self.send_message_at_time(when_ms, Message::new(what))
    }

    /// Inserts a barrier into the looper's queue.
    pub fn post_barrier(&self) -> Result<u64> {
        self.inner.looper.queue().post_barrier()
    }

    /// Removes a barrier by token.
    pub fn remove_barrier(&self, token: u64) -> bool {
        self.inner.looper.queue().remove_barrier(token)
    }

    /// Cancels every pending message from this handler with the given tag.
    ///
    /// Returns the number of entries removed.
    pub fn remove_messages(&self, what: i32) -> usize {
        self.remove_if(|e| e.what() == Some(what))
    }

    /// Cancels every pending entry posted through this handler.
    pub fn remove_callbacks_and_messages(&self) -> usize {
        self.remove_if(|_| true)
    }

    /// Cancels pending entries from this handler matching `predicate`.
    ///
    /// The predicate runs with the queue lock held and must not call
    /// back into the queue or this handler.
    pub fn remove_if(&self, mut predicate: impl FnMut(&Entry) -> bool) -> usize {
        self.inner.looper.queue().remove_if(|e| {
            e.target().is_some_and(|t| t.same_handler(self)) && predicate(e)
        })
    }

    /// Diagnostic name for an entry, mirroring what dispatch would do
    /// with it.
    #[must_use]
    pub fn message_name(&self, entry: &Entry) -> String {
        if entry.is_barrier() {
            "barrier".to_string()
        } else if entry.is_task() {
            "task".to_string()
        } else {
            entry.what().map_or_else(|| "message".to_string(), |what| format!("0x{what:x}"))
        }
    }

    /// Delivers a message through the callback chain.
    ///
    /// Called on the loop thread (or an executor thread for async
    /// entries). Order: the message's own callable, then the handler
    /// callback (returning `true` suppresses the rest), then the
    /// receiver.
    pub(crate) fn dispatch_message(&self, message: &mut Message) {
        if let Some(callback) = message.take_callback() {
            callback();
            return;
        }
        if let Some(filter) = &self.inner.callback {
            if filter(message) {
                return;
            }
        }
        if let Some(receiver) = &self.inner.receiver {
            receiver.handle_message(message);
        }
    }

    fn enqueue(&self, mut entry: Entry, when: u64) -> bool {
        entry.set_target(self.clone());
        if self.inner.is_async {
            entry.set_async(true);
        }
        match self.inner.looper.queue().post(entry, when) {
            Ok(_) => true,
            Err(rejected) => {
                let entry = rejected.into_entry();
                let entry_id = entry.id();
                entry.recycle();
                assert!(
                    !self.inner.looper.has_flag(Flag::System),
                    "posted to the quitting queue of SYSTEM looper {}",
                    self.inner.looper.name()
                );
                tracing::warn!(
                    looper = %self.inner.looper.name(),
                    entry_id,
                    "post rejected: queue is quitting"
                );
                false
            }
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("looper", &self.inner.looper.name())
            .field("async", &self.inner.is_async)
            .field("callback", &self.inner.callback.is_some())
            .field("receiver", &self.inner.receiver.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::looper::LooperBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn idle_looper() -> (Arc<ManualClock>, Arc<Looper>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let looper = LooperBuilder::new()
            .clock(clock.clone())
            .blocking(false)
            .build();
        (clock, looper)
    }

    #[test]
    fn post_variants_stamp_expected_due_times() {
        let (_, looper) = idle_looper();
        let handler = Handler::new(Arc::clone(&looper));

        assert!(handler.post(|| {}));
        assert_eq!(looper.queue().earliest_when(), Some(1_000));

        assert!(handler.post_delayed(500, || {}));
        assert_eq!(looper.queue().latest_when(), Some(1_500));

        assert!(handler.post_at_front(|| {}));
        assert_eq!(looper.queue().earliest_when(), Some(0));

        assert!(handler.post_at_time(1_200, || {}));
        assert_eq!(looper.queue().len(), 4);
    }

    #[test]
    fn async_handler_stamps_async_entries() {
        let (_, looper) = idle_looper();
        let handler = Handler::builder(Arc::clone(&looper)).set_async(true).build();
        assert!(handler.send_empty_message(9));
        let removed = looper.queue().remove_if(|e| {
            assert!(e.is_async());
            true
        });
        assert_eq!(removed, 1);
    }

    #[test]
    fn removal_is_scoped_to_the_posting_handler() {
        let (_, looper) = idle_looper();
        let ours = Handler::new(Arc::clone(&looper));
        let theirs = Handler::new(Arc::clone(&looper));

        ours.send_empty_message(1);
        ours.send_empty_message(2);
        theirs.send_empty_message(1);

        assert_eq!(ours.remove_messages(1), 1);
        assert_eq!(looper.queue().len(), 2);
        assert_eq!(ours.remove_callbacks_and_messages(), 1);
        assert_eq!(theirs.remove_callbacks_and_messages(), 1);
        assert_eq!(looper.queue().len(), 0);
    }

    #[test]
    fn dispatch_prefers_the_message_callable() {
        let (_, looper) = idle_looper();
        let filtered = Arc::new(AtomicUsize::new(0));
        let filtered_in_cb = Arc::clone(&filtered);
        let handler = Handler::builder(looper)
            .callback(move |_| {
                filtered_in_cb.fetch_add(1, Ordering::SeqCst);
                true
            })
            .build();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_msg = Arc::clone(&ran);
        let mut message = Message::new(5).with_callback(move || {
            ran_in_msg.fetch_add(1, Ordering::SeqCst);
        });
        handler.dispatch_message(&mut message);

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(filtered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_true_suppresses_the_receiver() {
        struct Recorder(Arc<AtomicUsize>);
        impl MessageReceiver for Recorder {
            fn handle_message(&self, _message: &mut Message) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (_, looper) = idle_looper();
        let received = Arc::new(AtomicUsize::new(0));
        let handler = Handler::builder(looper)
            .callback(|message| message.what() == 1)
            .receiver(Recorder(Arc::clone(&received)))
            .build();

        handler.dispatch_message(&mut Message::new(1));
        assert_eq!(received.load(Ordering::SeqCst), 0);

        handler.dispatch_message(&mut Message::new(2));
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn posts_to_a_quitting_queue_report_false() {
        let (_, looper) = idle_looper();
        let handler = Handler::new(Arc::clone(&looper));
        looper.quit_safely();
        assert!(!handler.post(|| {}));
        assert!(!handler.send_empty_message(1));
        assert!(handler.post_barrier().is_err());
    }

    #[test]
    fn message_names_follow_entry_kind() {
        let (_, looper) = idle_looper();
        let handler = Handler::new(looper);
        let task = Entry::task(Box::new(|| {}));
        assert_eq!(handler.message_name(&task), "task");
        let message = Entry::message(Message::new(26));
        assert_eq!(handler.message_name(&message), "0x1a");
        let barrier = Entry::barrier(1);
        assert_eq!(handler.message_name(&barrier), "barrier");
    }
}
