//! # Configuration Modules
//!
//! This module aggregates the configuration types consumed by the stream
//! engine. Loading (files, env, CLI) is left to the host binary.

/// Engine configuration: upstream, cursor persistence, health checks and logging.
pub mod config_stream;

pub use config_stream::{ConfigError, StreamConfig};
