//! # lib_common
//!
//! Resilient routing of a public change stream to independent handlers.
//! Modules are feature gated; `full` (the default) enables all of them.

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "ingestors")]
pub mod ingestors;
#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(feature = "ingestors")]
pub use crate::core::{start, start_with_shutdown};
