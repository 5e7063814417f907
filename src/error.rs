//! Error types for the message loop.
//!
//! Error handling follows three rules:
//!
//! - Recoverable conditions are explicit and typed (no stringly-typed
//!   errors); callers get a [`Result`] or a boolean they can act on.
//! - Programming faults (joining a loop twice, mutating flags while
//!   running, destroying a running looper) panic at the call site.
//! - Panics escaping dispatched user code never kill the loop thread;
//!   they are forwarded to the [`ExceptionSink`](crate::sink::ExceptionSink).

use core::fmt;
use std::sync::Arc;

/// The kind of recoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The target queue is quitting and no longer accepts entries.
    Quitting,
    /// No looper is associated with the calling thread.
    NoLooper,
    /// Internal invariant violation (a bug in this crate).
    Internal,
}

/// The main error type for loop operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if the error reports a quitting queue.
    #[must_use]
    pub const fn is_quitting(&self) -> bool {
        matches!(self.kind, ErrorKind::Quitting)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// A specialized result type for loop operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::Quitting).with_context("post rejected");
        assert!(err.is_quitting());
        assert_eq!(err.to_string(), "Quitting: post rejected");
    }

    #[test]
    fn source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = Error::new(ErrorKind::Internal).with_source(io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
