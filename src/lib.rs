//! Runloop: thread-affine message loops with time-ordered scheduling.
//!
//! # Overview
//!
//! A [`Looper`] binds one OS thread and drives a [`Queue`] of entries in
//! `(due-time, post-order)` order. User code talks to the loop through
//! [`Handler`]s, which post callables and tagged messages for immediate,
//! delayed, or absolute-time delivery. Barriers withhold synchronous
//! work until released; async entries bypass them and run on a shared
//! parallel [`Executor`]. Quitting is cooperative, in two flavors:
//! drain-what-is-due or drop-everything.
//!
//! # Core Guarantees
//!
//! - **Ordering**: entries with distinct due-times deliver in due-time
//!   order; ties deliver in post order.
//! - **Thread affinity**: synchronous entries run on the loop thread;
//!   `post` happens-before the matching dispatch.
//! - **Isolation**: a panic in dispatched user code is routed to the
//!   [`ExceptionSink`]; the loop keeps running.
//! - **Cooperative pacing**: short iterations yield the remainder of the
//!   iteration floor, and a sustained-slow loop reports itself
//!   overloaded.
//!
//! # Module Structure
//!
//! - [`clock`]: monotonic time sources (system and manual)
//! - [`entry`]: tasks, messages, barriers, and the unique-id counter
//! - [`queue`]: the time-ordered, barrier-aware store and its poll protocol
//! - [`handler`]: the posting/dispatch façade bound to one looper
//! - [`looper`]: the thread-bound loop driver, flags, and quit protocol
//! - [`registry`]: thread-to-looper association and `obtain`
//! - [`executor`]: the unbounded parallel pool for async entries
//! - [`config`]: looper configuration and environment overrides
//! - [`error`]: error types
//! - [`sink`]: panic routing for dispatched callbacks
//!
//! # Example
//!
//! ```
//! use runloop::{Handler, LooperBuilder};
//! use std::sync::Arc;
//!
//! let looper = LooperBuilder::new().build();
//! let handler = Handler::new(Arc::clone(&looper));
//!
//! let worker = {
//!     let looper = Arc::clone(&looper);
//!     std::thread::spawn(move || looper.join_loop())
//! };
//!
//! handler.post(|| println!("on the loop thread"));
//! handler.post_delayed(10, || println!("a little later"));
//!
//! looper.quit_safely();
//! worker.join().unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod executor;
pub mod handler;
pub mod looper;
pub mod queue;
pub mod registry;
pub mod sink;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{apply_env_overrides, ConfigError, LooperConfig};
pub use entry::{next_unique_id, Callable, Entry, Message};
pub use error::{Error, ErrorKind, Result};
pub use executor::{Executor, ExecutorOptions};
pub use handler::{Handler, HandlerBuilder, MessageReceiver};
pub use looper::{Flag, Looper, LooperBuilder};
pub use queue::{PollResult, Queue};
pub use registry::Registry;
pub use sink::{ExceptionSink, LoggingSink, PanicPayload};
