//! # Health Monitor
//!
//! The only guard against a connection that stays open but stops
//! delivering. On a fixed interval it compares the wall clock with the last
//! sign of life recorded by the `CursorStore`; silence longer than the
//! grace period forces a full reconnect through `Restart::restart`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::cursor_store::CursorStore;

/// Anything that can tear down and reopen the stream.
pub trait Restart: Send + Sync {
    fn restart(&self) -> BoxFuture<'_, ()>;
}

/// # Health Monitor
pub struct HealthMonitor {
    cursor: Arc<CursorStore>,
    target: Arc<dyn Restart>,
    check_interval: Duration,
    grace: Duration,
    /// Baseline while no event has been seen yet (unix seconds).
    started_at: i64,
}

impl HealthMonitor {
    pub fn new(cursor: Arc<CursorStore>, target: Arc<dyn Restart>, check_interval: Duration, grace: Duration) -> Self {
        Self {
            cursor,
            target,
            check_interval,
            grace,
            started_at: Utc::now().timestamp(),
        }
    }

    /// Most recent sign of life in unix seconds.
    pub fn last_seen(&self) -> i64 {
        self.cursor.last_activity().unwrap_or(self.started_at).max(self.started_at)
    }

    /// Whether the stream counts as stalled at `now` (unix seconds).
    pub fn is_stalled_at(&self, now: i64) -> bool {
        now - self.last_seen() > self.grace.as_secs() as i64
    }

    /// One health check. Restarts the stream when it is stalled.
    ///
    /// # Returns
    /// `true` when a restart was triggered.
    pub async fn check_at(&self, now: i64) -> bool {
        if !self.is_stalled_at(now) {
            log::debug!("Stream healthy, last activity {}s ago", now - self.last_seen());
            return false;
        }

        log::error!(
            "No events for {}s (grace {}s, cursor {:?}); stream looks stalled, forcing restart",
            now - self.last_seen(),
            self.grace.as_secs(),
            self.cursor.peek()
        );
        self.target.restart().await;
        true
    }

    /// Runs the check loop until `shutdown` fires. The first check happens
    /// one full interval after start.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.check_interval, self.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!(
                "Health monitor started: check every {}s, grace {}s",
                self.check_interval.as_secs(),
                self.grace.as_secs()
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        log::info!("Health monitor received shutdown signal.");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.check_at(Utc::now().timestamp()).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRestart {
        calls: AtomicUsize,
    }

    impl Restart for CountingRestart {
        fn restart(&self) -> BoxFuture<'_, ()> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }
    }

    const GRACE: Duration = Duration::from_secs(120);

    fn monitor() -> (HealthMonitor, Arc<CursorStore>, Arc<CountingRestart>) {
        let cursor = Arc::new(CursorStore::new("unused-cursor.txt"));
        let counter = Arc::new(CountingRestart::default());
        let target: Arc<dyn Restart> = counter.clone();
        let monitor = HealthMonitor::new(Arc::clone(&cursor), target, Duration::from_secs(120), GRACE);
        (monitor, cursor, counter)
    }

    #[tokio::test]
    async fn silence_past_grace_triggers_exactly_one_restart() {
        let (monitor, cursor, counter) = monitor();
        cursor.update(Utc::now().timestamp());
        let last = monitor.last_seen();

        assert!(monitor.check_at(last + 121).await);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn activity_within_grace_does_nothing() {
        let (monitor, cursor, counter) = monitor();
        cursor.update(Utc::now().timestamp());
        let last = monitor.last_seen();

        assert!(!monitor.check_at(last + 60).await);
        assert!(!monitor.check_at(last + 120).await);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_cursor_uses_start_time_as_baseline() {
        let (monitor, _cursor, counter) = monitor();
        let started = monitor.last_seen();

        assert!(!monitor.check_at(started + 30).await);
        assert!(monitor.check_at(started + 121).await);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replayed_old_events_count_as_activity() {
        let (monitor, cursor, counter) = monitor();
        let now = Utc::now().timestamp();
        // Catching up after an outage: event time is an hour old, receipt is now.
        cursor.update(now - 3600);

        assert!(!monitor.check_at(now + 60).await);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_on_shutdown() {
        let (monitor, _cursor, counter) = monitor();
        let shutdown = CancellationToken::new();
        let handle = monitor.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
    }
}
