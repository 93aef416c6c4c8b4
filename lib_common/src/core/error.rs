//! # Stream Errors
//!
//! One error enum for the whole engine. Nothing in here is fatal to the host:
//! every variant is caught close to where it happens and turned into a log
//! line plus a corrective action (reconnect, route disablement, retry).

use thiserror::Error;

use crate::configs::ConfigError;

/// Result alias used across the engine.
pub type StreamResult<T> = Result<T, StreamError>;

/// # Stream Error
#[derive(Debug, Error)]
pub enum StreamError {
    /// The HTTP client failed to connect or to read the body.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The upstream answered 429.
    #[error("rate limited by upstream")]
    RateLimited,

    /// The upstream answered with a non-success status other than 429.
    #[error("upstream answered HTTP {0}")]
    HttpStatus(u16),

    /// The body closed cleanly; the upstream drops long-lived connections on a fixed cadence.
    #[error("upstream closed the stream")]
    StreamClosed,

    /// A message payload was not a valid change record.
    #[error("malformed change record: {0}")]
    Parse(#[from] serde_json::Error),

    /// The stream URL could not be built.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Reading or writing the cursor file failed.
    #[error("cursor persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    /// The cursor file holds something that is not a decimal timestamp.
    #[error("cursor file holds '{0}', expected decimal unix seconds")]
    InvalidCursor(String),

    /// A route definition was rejected at startup.
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    /// A route's one-time initializer failed, panicked or timed out.
    #[error("route '{route}' failed to initialize: {reason}")]
    RouteInit { route: String, reason: String },

    /// The engine configuration did not validate.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StreamError {
    /// Rate limiting gets a fixed backoff followed by a full restart.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, StreamError::RateLimited)
    }

    /// The periodic upstream disconnect is expected and only worth an info line.
    pub fn is_benign_disconnect(&self) -> bool {
        matches!(self, StreamError::StreamClosed)
    }
}
