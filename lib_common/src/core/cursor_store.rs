//! # Cursor Store
//!
//! Owns the "last seen" timestamp of the stream. The connector writes it on
//! every event, the health monitor reads it to detect silence, and a
//! fixed-interval timer flushes it to a plain-text file so a restarted
//! process can resume where the previous one stopped.
//!
//! ## Design:
//! - **Lock-free**: the value lives in an `AtomicI64`. Readers may observe a
//!   slightly stale value; nothing depends on exact freshness.
//! - **Off the hot path**: `update` never touches the disk. Persistence runs
//!   on its own timer, so a slow disk never delays stream consumption. A
//!   crash between flushes only replays a few seconds of events.
//! - **Bounded resume**: the upstream keeps a limited replay buffer, so a
//!   cursor older than the recency window is ignored and the stream
//!   resumes from now.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::error::{StreamError, StreamResult};

/// Sentinel for "no cursor in memory".
const ABSENT: i64 = i64::MIN;

/// # Cursor Store
pub struct CursorStore {
    path: PathBuf,
    current: AtomicI64,
    persisted: AtomicI64,
    /// Local wall clock (unix seconds) of the last `update`.
    touched: AtomicI64,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: AtomicI64::new(ABSENT),
            persisted: AtomicI64::new(ABSENT),
            touched: AtomicI64::new(ABSENT),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// In-memory value only; never touches the disk.
    pub fn peek(&self) -> Option<i64> {
        match self.current.load(Ordering::Acquire) {
            ABSENT => None,
            ts => Some(ts),
        }
    }

    /// Best-known cursor: memory first, then the persisted file.
    ///
    /// A missing, unreadable or malformed file yields `None`.
    pub async fn get(&self) -> Option<i64> {
        if let Some(ts) = self.peek() {
            return Some(ts);
        }

        match self.read_persisted().await {
            Ok(Some(ts)) => {
                // Seed memory so later reads skip the disk. Lose the race quietly
                // if an event arrived in the meantime.
                if self
                    .current
                    .compare_exchange(ABSENT, ts, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.persisted.store(ts, Ordering::Release);
                }
                self.peek()
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Could not read cursor from {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Records the timestamp of the event just observed.
    pub fn update(&self, ts: i64) {
        self.current.store(ts, Ordering::Release);
        self.touched.store(Utc::now().timestamp(), Ordering::Release);
    }

    /// Latest sign of life: the event time or, when replaying old events,
    /// the local time they were received.
    pub fn last_activity(&self) -> Option<i64> {
        let touched = match self.touched.load(Ordering::Acquire) {
            ABSENT => None,
            ts => Some(ts),
        };
        match (self.peek(), touched) {
            (Some(ts), Some(at)) => Some(ts.max(at)),
            (ts, at) => ts.or(at),
        }
    }

    /// Writes the in-memory value if it changed since the last write.
    ///
    /// # Returns
    /// `true` when something was written.
    pub async fn persist(&self) -> StreamResult<bool> {
        let ts = self.current.load(Ordering::Acquire);
        if ts == ABSENT || ts == self.persisted.load(Ordering::Acquire) {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so a crash never leaves a truncated cursor.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, ts.to_string()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        self.persisted.store(ts, Ordering::Release);
        log::trace!("Cursor {} persisted to {}", ts, self.path.display());
        Ok(true)
    }

    /// Spawns the persistence timer.
    ///
    /// Failed writes are logged and retried on the next tick. When `shutdown`
    /// fires, one last flush runs before the task ends.
    pub fn spawn_persistence(self: &Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        if let Err(e) = store.persist().await {
                            log::error!("Final cursor flush to {} failed: {}", store.path.display(), e);
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = store.persist().await {
                            log::error!("Cursor write to {} failed, retrying next tick: {}", store.path.display(), e);
                        }
                    }
                }
            }
        })
    }

    /// Where the next connection should start. `None` means "from now".
    pub async fn resume_point(&self, start_fresh: bool, now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
        if start_fresh {
            log::info!("Fresh start requested, ignoring stored cursor");
            return None;
        }
        resume_from(self.get().await, now, window)
    }

    async fn read_persisted(&self) -> StreamResult<Option<i64>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse::<i64>()
            .map(Some)
            .map_err(|_| StreamError::InvalidCursor(trimmed.to_string()))
    }
}

/// Resume policy: a cursor inside the recency window is used as is; a
/// missing, stale or future cursor means "from now".
pub fn resume_from(cursor: Option<i64>, now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    let ts = cursor?;
    let age = now.timestamp() - ts;

    if age < 0 {
        log::warn!("Stored cursor {} is ahead of the local clock, resuming from now", ts);
        return None;
    }
    if age as u64 > window.as_secs() {
        log::info!(
            "Stored cursor {} is {}s old (window {}s), resuming from now",
            ts,
            age,
            window.as_secs()
        );
        return None;
    }
    DateTime::from_timestamp(ts, 0)
}
