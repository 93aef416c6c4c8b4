//! # Core Engine Module
//!
//! The routing engine behind the change stream. Everything here is
//! asynchronous, shared through `Arc`, and safe to use from many tasks.
//!
//! ## Core Components:
//!
//! - **`cursor_store`**: the last observed event timestamp, held in memory and
//!   flushed to disk on a timer so a restarted process resumes where it left off.
//!
//! - **`registry`**: validates the static route list and runs each route's
//!   one-time `init`, exposing a per-route readiness signal.
//!
//! - **`dispatcher`**: zero-copy fan-out of each event to every route through
//!   a dedicated queue per route, with filter and worker failures contained.
//!
//! - **`health_monitor`**: forces a reconnect when the stream stays silent
//!   longer than the grace period.
//!
//! - **`stream_engine`**: builds and wires all of the above plus the stream
//!   connector.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Last-seen timestamp with periodic persistence and resume policy.
pub mod cursor_store;
/// Per-route queues and failure-isolated delivery.
pub mod dispatcher;
/// Engine-wide error type.
pub mod error;
/// The change record and its helpers.
pub mod event;
/// Stall detection and forced restart.
pub mod health_monitor;
/// Route validation and initialization.
pub mod registry;
/// Route definitions built by the host.
pub mod route;
/// Engine entry point.
#[cfg(feature = "ingestors")]
pub mod stream_engine;

// --- Public API Re-exports ---
pub use cursor_store::CursorStore;
pub use dispatcher::{DispatchFrame, Dispatcher};
pub use error::{StreamError, StreamResult};
pub use event::{CategoryChange, ChangeEvent, EventMeta};
pub use health_monitor::{HealthMonitor, Restart};
pub use registry::{Readiness, RegisteredRoute, RouteRegistry};
pub use route::{Route, RouteSpec};
#[cfg(feature = "ingestors")]
pub use stream_engine::{start, start_with_shutdown, StreamEngine};
