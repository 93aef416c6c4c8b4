//! # Stream Engine
//!
//! Wires the components together and owns their background tasks:
//!
//! 1. validate the configuration and install logging,
//! 2. load the route registry (route initializers start running here),
//! 3. build the dispatcher, cursor store and stream connector,
//! 4. start the persistence timer and the health monitor,
//! 5. open the first connection from the resume point.
//!
//! Routes whose `init` is still running simply queue their events; the
//! stream is not held back for them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configs::StreamConfig;
use crate::core::cursor_store::CursorStore;
use crate::core::dispatcher::Dispatcher;
use crate::core::error::StreamResult;
use crate::core::health_monitor::{HealthMonitor, Restart};
use crate::core::registry::RouteRegistry;
use crate::core::route::RouteSpec;
use crate::ingestors::eventstreams_sse::StreamConnector;
use crate::loggers::{setup_logging, LoggerSetupError};

/// Name used for log files.
pub const APP_NAME: &str = "rcstream";

/// How long shutdown waits for queued events and running workers.
const DRAIN_LIMIT: Duration = Duration::from_secs(10);

/// # Stream Engine
///
/// A running engine. Dropping it does not stop the background tasks; call
/// `shutdown`.
pub struct StreamEngine {
    pub registry: Arc<RouteRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub cursor: Arc<CursorStore>,
    pub connector: StreamConnector,
    monitor_stop: CancellationToken,
    monitor_task: JoinHandle<()>,
    persist_stop: CancellationToken,
    persist_task: JoinHandle<()>,
}

impl StreamEngine {
    /// Builds every component and opens the first connection.
    pub async fn launch(routes: Vec<RouteSpec>, config: StreamConfig) -> StreamResult<Self> {
        config.validate()?;
        init_logging(&config)?;
        log::info!("Starting change stream engine\n{}", config);

        let registry = Arc::new(RouteRegistry::load(routes, config.route_init_timeout()));
        if registry.routes().is_empty() {
            log::warn!("No valid routes registered; events will only advance the cursor");
        }

        let dispatcher = Arc::new(Dispatcher::new(&registry));
        let cursor = Arc::new(CursorStore::new(config.cursor_path.clone()));
        let connector = StreamConnector::new(config.clone(), Arc::clone(&cursor), Arc::clone(&dispatcher))?;

        let persist_stop = CancellationToken::new();
        let persist_task = cursor.spawn_persistence(config.persist_interval(), persist_stop.clone());

        let restart_target: Arc<dyn Restart> = Arc::new(connector.clone());
        let monitor = HealthMonitor::new(
            Arc::clone(&cursor),
            restart_target,
            config.health_check_interval(),
            config.health_grace(),
        );
        let monitor_stop = CancellationToken::new();
        let monitor_task = monitor.spawn(monitor_stop.clone());

        let since = cursor
            .resume_point(config.start_fresh, Utc::now(), config.recency_window())
            .await;
        connector.connect(since).await;

        Ok(Self {
            registry,
            dispatcher,
            cursor,
            connector,
            monitor_stop,
            monitor_task,
            persist_stop,
            persist_task,
        })
    }

    /// Stops the monitor, closes the stream, lets routes drain, and flushes
    /// the cursor, in that order.
    pub async fn shutdown(self) {
        log::info!("Shutting down change stream engine");

        // A restart racing with close would reopen the stream.
        self.monitor_stop.cancel();
        if let Err(e) = self.monitor_task.await {
            log::error!("Health monitor ended abnormally: {}", e);
        }
        self.connector.close().await;

        if !self.dispatcher.wait_idle(DRAIN_LIMIT).await {
            log::warn!(
                "Routes still busy after {}s ({} worker(s) running); continuing shutdown",
                DRAIN_LIMIT.as_secs(),
                self.dispatcher.in_flight()
            );
        }

        self.persist_stop.cancel();
        if let Err(e) = self.persist_task.await {
            log::error!("Cursor persistence ended abnormally: {}", e);
        }

        let stats = self.connector.stats();
        log::info!(
            "Engine stopped: {} event(s) forwarded, {} canary, {} malformed, {} connect(s), cursor {:?}",
            stats.forwarded,
            stats.canaries,
            stats.malformed,
            stats.connects,
            self.cursor.peek()
        );
    }
}

/// Runs the engine forever.
pub async fn start(routes: Vec<RouteSpec>, config: StreamConfig) -> StreamResult<()> {
    start_with_shutdown(routes, config, CancellationToken::new()).await
}

/// Runs the engine until `shutdown` fires, then stops it cleanly.
pub async fn start_with_shutdown(
    routes: Vec<RouteSpec>,
    config: StreamConfig,
    shutdown: CancellationToken,
) -> StreamResult<()> {
    let engine = StreamEngine::launch(routes, config).await?;
    shutdown.cancelled().await;
    engine.shutdown().await;
    Ok(())
}

fn init_logging(config: &StreamConfig) -> StreamResult<()> {
    match setup_logging(config.log_dir.as_deref(), &config.log_level, APP_NAME) {
        Ok(Some(path)) => {
            log::info!("Logging to {}", path.display());
            Ok(())
        }
        Ok(None) => Ok(()),
        // The host installed its own logger; keep it.
        Err(LoggerSetupError::AlreadyInitialized) => Ok(()),
        Err(LoggerSetupError::Io(e)) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestors::eventstreams_sse::ConnectionState;
    use tempfile::tempdir;

    #[tokio::test]
    async fn invalid_config_is_rejected_before_anything_starts() {
        let dir = tempdir().unwrap();
        let config = StreamConfig {
            cursor_path: dir.path().join("cursor.txt"),
            persist_interval_ms: 0,
            ..Default::default()
        };
        let result = StreamEngine::launch(Vec::new(), config).await;
        assert!(matches!(result, Err(crate::core::error::StreamError::Config(_))));
    }

    #[tokio::test]
    async fn unreachable_upstream_still_shuts_down_cleanly() {
        let dir = tempdir().unwrap();
        let cursor_path = dir.path().join("cursor.txt");
        let config = StreamConfig {
            // Nothing listens on the discard port.
            stream_url: "http://127.0.0.1:9/v2/stream/recentchange".to_string(),
            cursor_path: cursor_path.clone(),
            persist_interval_ms: 20,
            ..Default::default()
        };
        let routes = vec![RouteSpec::new("noop").filter(|_| true).worker(|_| async { Ok(()) })];

        let engine = StreamEngine::launch(routes, config).await.unwrap();
        assert_eq!(engine.dispatcher.route_names(), vec!["noop".to_string()]);

        engine.cursor.update(1_714_557_600);
        let connector = engine.connector.clone();
        engine.shutdown().await;
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        assert_eq!(std::fs::read_to_string(&cursor_path).unwrap(), "1714557600");
    }
}
