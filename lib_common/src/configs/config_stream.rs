//! # Stream Engine Configuration
//!
//! `StreamConfig` carries every knob the routing engine recognizes: where the
//! upstream lives, where the cursor is persisted, how often the cursor is
//! flushed, how the health monitor decides that the stream has stalled and
//! where logs go.
//!
//! The struct is plain serde data so hosts can load it from a JSON file and
//! overlay CLI/env values on top (see `servers/src/rcstream_logic/config.rs`).
//! Field names are `camelCase` on the wire.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default upstream: the public wiki recent-change event stream.
pub const DEFAULT_STREAM_URL: &str = "https://stream.wikimedia.org/v2/stream/recentchange";

/// Seven days, the usual replay buffer kept by the upstream.
pub const DEFAULT_RECENCY_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

/// Errors raised while validating a `StreamConfig`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The stream URL could not be parsed as an absolute URL.
    #[error("invalid stream url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// An interval that drives a timer was configured as zero.
    #[error("'{0}' must be greater than zero")]
    ZeroInterval(&'static str),

    /// The cursor path is empty.
    #[error("cursor path must not be empty")]
    EmptyCursorPath,
}

/// # Stream Config
///
/// Configuration accepted by `stream_engine::start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    /// SSE endpoint of the upstream change stream.
    pub stream_url: String,
    /// Sent as `User-Agent` on every request. Public upstreams reject anonymous clients.
    pub user_agent: String,
    /// Plain-text file holding the decimal unix timestamp of the last observed event.
    pub cursor_path: PathBuf,
    /// How often the in-memory cursor is written to `cursor_path`.
    pub persist_interval_ms: u64,
    /// How often the health monitor looks for a stalled stream.
    pub health_check_interval_secs: u64,
    /// Silence longer than this is treated as a stall.
    pub health_grace_secs: u64,
    /// Stored cursors older than this are ignored and the stream resumes from now.
    pub recency_window_secs: u64,
    /// Delay before restarting after the upstream answered "rate limited".
    pub rate_limit_backoff_ms: u64,
    /// Delay before the transport reopens a dropped connection.
    pub reconnect_delay_ms: u64,
    /// Ceiling for the doubling reconnect delay after consecutive failed attempts.
    pub reconnect_max_delay_ms: u64,
    /// Upper bound for a route's `init`. `0` waits forever.
    pub route_init_timeout_secs: u64,
    /// Ignore any stored cursor on the first connect.
    pub start_fresh: bool,
    /// Directory for log files. `None` logs to stdout only.
    pub log_dir: Option<PathBuf>,
    /// trace, debug, info, warn or error.
    pub log_level: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_url: DEFAULT_STREAM_URL.to_string(),
            user_agent: format!("rcstream/{} (lib_common)", env!("CARGO_PKG_VERSION")),
            cursor_path: PathBuf::from("./data/cursor.txt"),
            persist_interval_ms: 1000,
            health_check_interval_secs: 120,
            health_grace_secs: 120,
            recency_window_secs: DEFAULT_RECENCY_WINDOW_SECS,
            rate_limit_backoff_ms: 5000,
            reconnect_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            route_init_timeout_secs: 300,
            start_fresh: false,
            log_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl StreamConfig {
    /// Checks the values that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(&self.stream_url).map_err(|e| ConfigError::InvalidUrl {
            url: self.stream_url.clone(),
            reason: e.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(ConfigError::InvalidUrl {
                url: self.stream_url.clone(),
                reason: "not an absolute url".to_string(),
            });
        }
        if self.cursor_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyCursorPath);
        }

        let intervals = [
            ("persistIntervalMs", self.persist_interval_ms),
            ("healthCheckIntervalSecs", self.health_check_interval_secs),
            ("healthGraceSecs", self.health_grace_secs),
            ("recencyWindowSecs", self.recency_window_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        Ok(())
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_grace(&self) -> Duration {
        Duration::from_secs(self.health_grace_secs)
    }

    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.recency_window_secs)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms.max(self.reconnect_delay_ms))
    }

    /// `None` when init is allowed to take forever.
    pub fn route_init_timeout(&self) -> Option<Duration> {
        (self.route_init_timeout_secs > 0).then(|| Duration::from_secs(self.route_init_timeout_secs))
    }
}

impl fmt::Display for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamConfig
    Stream url: {},
    Cursor path: {},
    Persist interval: {}ms,
    Health check: every {}s, grace {}s,
    Recency window: {}s,
    Start fresh: {},
    Log dir: {:?}, level: {}
",
            self.stream_url,
            self.cursor_path.display(),
            self.persist_interval_ms,
            self.health_check_interval_secs,
            self.health_grace_secs,
            self.recency_window_secs,
            self.start_fresh,
            self.log_dir,
            self.log_level
        )
    }
}
