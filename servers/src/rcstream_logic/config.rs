use anyhow::{Context, Result};
use clap::Parser;
use lib_common::configs::StreamConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "server_rcstream.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Routes the Wikimedia recent-changes stream to local handlers", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RCSTREAM_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RCSTREAM_URL", help = "Upstream SSE endpoint.")]
    pub stream_url: Option<String>,

    #[clap(long, env = "RCSTREAM_USER_AGENT", help = "User-Agent sent to the upstream (include contact info).")]
    pub user_agent: Option<String>,

    #[clap(long, env = "RCSTREAM_CURSOR_PATH", help = "File holding the last observed event timestamp.")]
    pub cursor_path: Option<PathBuf>,

    #[clap(long, env = "RCSTREAM_PERSIST_INTERVAL_MS", help = "How often the cursor is written to disk.")]
    pub persist_interval_ms: Option<u64>,

    #[clap(long, env = "RCSTREAM_HEALTH_CHECK_INTERVAL_SECS", help = "Interval between stall checks.")]
    pub health_check_interval_secs: Option<u64>,

    #[clap(long, env = "RCSTREAM_HEALTH_GRACE_SECS", help = "Seconds of silence before the stream is restarted.")]
    pub health_grace_secs: Option<u64>,

    #[clap(long, env = "RCSTREAM_RECENCY_WINDOW_SECS", help = "Oldest cursor age still used for resume.")]
    pub recency_window_secs: Option<u64>,

    #[clap(long, env = "RCSTREAM_RATE_LIMIT_BACKOFF_MS", help = "Wait after HTTP 429 before restarting.")]
    pub rate_limit_backoff_ms: Option<u64>,

    #[clap(long, env = "RCSTREAM_RECONNECT_DELAY_MS", help = "Base delay for transport reconnects.")]
    pub reconnect_delay_ms: Option<u64>,

    #[clap(long, env = "RCSTREAM_RECONNECT_MAX_DELAY_MS", help = "Maximum delay for transport reconnects.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "RCSTREAM_ROUTE_INIT_TIMEOUT_SECS", help = "Upper bound for route initialization (0 = none).")]
    pub route_init_timeout_secs: Option<u64>,

    #[clap(long, env = "RCSTREAM_START_FRESH", help = "Ignore the stored cursor on startup (true/false).")]
    pub start_fresh: Option<bool>,

    #[clap(long, env = "RCSTREAM_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RCSTREAM_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "RCSTREAM_WATCH_CATEGORIES", value_delimiter = ',', help = "Comma separated categories to watch.")]
    pub watch_categories: Option<Vec<String>>,

    #[clap(long, env = "RCSTREAM_COUNTS_PATH", help = "Snapshot file for the per-wiki edit counter.")]
    pub counts_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            stream_url: other.stream_url.or(self.stream_url),
            user_agent: other.user_agent.or(self.user_agent),
            cursor_path: other.cursor_path.or(self.cursor_path),
            persist_interval_ms: other.persist_interval_ms.or(self.persist_interval_ms),
            health_check_interval_secs: other.health_check_interval_secs.or(self.health_check_interval_secs),
            health_grace_secs: other.health_grace_secs.or(self.health_grace_secs),
            recency_window_secs: other.recency_window_secs.or(self.recency_window_secs),
            rate_limit_backoff_ms: other.rate_limit_backoff_ms.or(self.rate_limit_backoff_ms),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            route_init_timeout_secs: other.route_init_timeout_secs.or(self.route_init_timeout_secs),
            start_fresh: other.start_fresh.or(self.start_fresh),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            watch_categories: other.watch_categories.or(self.watch_categories),
            counts_path: other.counts_path.or(self.counts_path),
        }
    }

    /// Engine configuration: library defaults overridden by every value set here.
    pub fn stream_config(&self) -> StreamConfig {
        let mut stream = StreamConfig::default();
        if let Some(v) = &self.stream_url {
            stream.stream_url = v.clone();
        }
        if let Some(v) = &self.user_agent {
            stream.user_agent = v.clone();
        }
        if let Some(v) = &self.cursor_path {
            stream.cursor_path = v.clone();
        }
        if let Some(v) = self.persist_interval_ms {
            stream.persist_interval_ms = v;
        }
        if let Some(v) = self.health_check_interval_secs {
            stream.health_check_interval_secs = v;
        }
        if let Some(v) = self.health_grace_secs {
            stream.health_grace_secs = v;
        }
        if let Some(v) = self.recency_window_secs {
            stream.recency_window_secs = v;
        }
        if let Some(v) = self.rate_limit_backoff_ms {
            stream.rate_limit_backoff_ms = v;
        }
        if let Some(v) = self.reconnect_delay_ms {
            stream.reconnect_delay_ms = v;
        }
        if let Some(v) = self.reconnect_max_delay_ms {
            stream.reconnect_max_delay_ms = v;
        }
        if let Some(v) = self.route_init_timeout_secs {
            stream.route_init_timeout_secs = v;
        }
        if let Some(v) = self.start_fresh {
            stream.start_fresh = v;
        }
        if self.log_dir.is_some() {
            stream.log_dir = self.log_dir.clone();
        }
        if let Some(v) = &self.log_level {
            stream.log_level = v.clone();
        }
        stream
    }

    pub fn watch_categories(&self) -> Vec<String> {
        self.watch_categories.clone().unwrap_or_default()
    }

    pub fn counts_path(&self) -> PathBuf {
        self.counts_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("./data/edit_counts.json"))
    }
}

fn defaults() -> Config {
    Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ..Default::default()
    }
}

/// Defaults, then the JSON file, then environment variables and CLI arguments.
pub fn load_config() -> Result<Config> {
    load_from(Config::parse())
}

pub fn load_from(cli: Config) -> Result<Config> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = defaults();
    if config_file_path.exists() {
        current_config = current_config.merge(read_config_file(&config_file_path)?);
    }
    Ok(current_config.merge(cli))
}

fn read_config_file(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse config file {}", path.display()))
}
