//! # Data Ingestors Module
//!
//! Clients that pull data from an upstream and hand it to the core engine.
//!
//! ## Contained Modules:
//! - **`sse`**: an incremental `text/event-stream` decoder.
//! - **`eventstreams_sse`**: the resilient connector for the Wikimedia
//!   EventStreams `recentchange` feed, with cursor resume, transport
//!   reconnects and rate-limit backoff.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// The change stream connector.
pub mod eventstreams_sse;
/// Server-Sent Events wire decoder.
pub mod sse;

// --- Public API Re-exports ---
pub use eventstreams_sse::{ConnectionState, ConnectorStats, StreamConnector};
pub use sse::{SseDecoder, SseMessage};
