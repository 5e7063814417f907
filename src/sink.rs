//! Exception sink for panics escaping dispatched user code.
//!
//! The loop never lets a user panic kill its thread: the payload is
//! caught at the dispatch boundary and handed to the looper's
//! [`ExceptionSink`]. The default sink logs and moves on.

use std::any::Any;

/// The payload of a caught panic.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// Receives panics that escape dispatched callbacks.
pub trait ExceptionSink: Send + Sync {
    /// Handles a panic raised while dispatching an entry.
    ///
    /// `looper_name` identifies the loop the entry was dispatched on.
    fn handle(&self, looper_name: &str, payload: PanicPayload);
}

/// The default sink: log the panic at error level and continue.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl ExceptionSink for LoggingSink {
    fn handle(&self, looper_name: &str, payload: PanicPayload) {
        tracing::error!(
            looper = looper_name,
            panic = panic_message(&payload),
            "dispatched callback panicked"
        );
    }
}

/// Extracts a human-readable message from a panic payload.
#[must_use]
pub fn panic_message(payload: &PanicPayload) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
