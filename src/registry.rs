//! Process-scoped looper registry.
//!
//! A [`Registry`] associates threads with the loopers they host, so
//! [`obtain`](Registry::obtain) from anywhere inside a callback finds
//! the looper driving the current thread (alias threads running async
//! entries included). A process-wide default instance exists for
//! applications; tests create a fresh registry per case.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use crate::error::{Error, ErrorKind, Result};
use crate::looper::{Looper, LooperBuilder};

/// Thread-to-looper association table.
pub struct Registry {
    loopers: Mutex<Vec<(ThreadId, Arc<Looper>)>>,
    primary: OnceLock<ThreadId>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            loopers: Mutex::new(Vec::new()),
            primary: OnceLock::new(),
        })
    }

    /// The process-wide default registry.
    pub fn global() -> &'static Arc<Registry> {
        static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    /// Records the calling thread as the primary thread.
    ///
    /// SYSTEM loopers registered here may only quit from that thread.
    /// Returns `false` if a primary thread was already adopted.
    pub fn adopt_primary(&self) -> bool {
        self.primary.set(thread::current().id()).is_ok()
    }

    /// True if the calling thread is the adopted primary thread.
    #[must_use]
    pub fn is_primary_thread(&self) -> bool {
        self.primary.get() == Some(&thread::current().id())
    }

    /// Returns the looper associated with the calling thread, creating
    /// and registering a default (BLOCKING) looper if none exists.
    pub fn obtain(self: &Arc<Self>) -> Arc<Looper> {
        self.obtain_or_else(|| LooperBuilder::new().build(), |_| true)
    }

    /// Like [`obtain`](Self::obtain), but replaces the associated looper
    /// when it fails `predicate`.
    ///
    /// Used to re-request a looper with different flags; the replaced
    /// looper is dropped from the table but not quit.
    pub fn obtain_where(
        self: &Arc<Self>,
        predicate: impl Fn(&Looper) -> bool,
    ) -> Arc<Looper> {
        self.obtain_or_else(|| LooperBuilder::new().build(), predicate)
    }

    /// The general form: `supplier` builds the replacement, `predicate`
    /// decides whether an existing association is kept.
    pub fn obtain_or_else(
        self: &Arc<Self>,
        supplier: impl FnOnce() -> Arc<Looper>,
        predicate: impl Fn(&Looper) -> bool,
    ) -> Arc<Looper> {
        let current = thread::current().id();
        let mut table = self.loopers.lock();
        let found = table
            .iter()
            .position(|(owner, looper)| *owner == current || looper.is_current_thread());
        match found {
            Some(index) => {
                let existing = Arc::clone(&table[index].1);
                if predicate(&existing) {
                    existing
                } else {
                    table.remove(index);
                    let fresh = supplier();
                    fresh.set_registry(Arc::downgrade(self));
                    table.push((current, Arc::clone(&fresh)));
                    fresh
                }
            }
            None => {
                let looper = supplier();
                looper.set_registry(Arc::downgrade(self));
                table.push((current, Arc::clone(&looper)));
                looper
            }
        }
    }

    /// Returns the calling thread's looper without creating one.
    #[must_use]
    pub fn peek(&self) -> Option<Arc<Looper>> {
        let current = thread::current().id();
        let table = self.loopers.lock();
        table
            .iter()
            .find(|(owner, looper)| *owner == current || looper.is_current_thread())
            .map(|(_, looper)| Arc::clone(looper))
    }

    /// The strict form of [`peek`](Self::peek): errors instead of
    /// creating when the calling thread has no looper.
    pub fn require(&self) -> Result<Arc<Looper>> {
        self.peek().ok_or_else(|| {
            Error::new(ErrorKind::NoLooper)
                .with_context("no looper is associated with the calling thread")
        })
    }

    /// Snapshot of every registered looper.
    #[must_use]
    pub fn loopers(&self) -> Vec<Arc<Looper>> {
        self.loopers
            .lock()
            .iter()
            .map(|(_, looper)| Arc::clone(looper))
            .collect()
    }

    /// Quits and destroys the calling thread's looper.
    ///
    /// Returns whether a looper was found and destroyed.
    ///
    /// # Panics
    ///
    /// If the looper is still running (the same rule as
    /// [`Looper::quit_and_destroy`]).
    pub fn destroy(&self) -> bool {
        match self.peek() {
            Some(looper) => {
                looper.quit_and_destroy();
                true
            }
            None => false,
        }
    }

    /// Number of registered loopers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.loopers.lock().len()
    }

    /// True if no looper is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loopers.lock().is_empty()
    }

    pub(crate) fn deregister(&self, looper: &Looper) {
        self.loopers
            .lock()
            .retain(|(_, registered)| !std::ptr::eq(Arc::as_ptr(registered), looper));
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("loopers", &self.len())
            .field("primary", &self.primary.get().is_some())
            .finish()
    }
}
