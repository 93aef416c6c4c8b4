//! # EventStreams SSE Connector
//!
//! Long-lived HTTP connection to a Wikimedia-style `recentchange` stream.
//! Each `data:` payload is parsed into a `ChangeEvent`, canaries are dropped,
//! the cursor is advanced and the event is handed to the `Dispatcher`.
//!
//! ## Connection lifecycle:
//! `Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting ...`
//!
//! - **Single connection**: `connect` always tears down the previous
//!   connection first, so two streams never feed the dispatcher at once.
//! - **Transport reconnect**: transient failures and the upstream's periodic
//!   disconnect are retried inside the connection task. The retry resends
//!   `Last-Event-ID` when the stream supplied one, and otherwise the
//!   initial `since`.
//! - **Rate limiting**: an HTTP 429 stops the connection task. After
//!   `rate_limit_backoff` the connector restarts from the cursor.
//! - **Stalls**: an open but silent stream is invisible here. The
//!   `HealthMonitor` detects it and calls `restart` through the `Restart`
//!   trait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::StatusCode;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::configs::StreamConfig;
use crate::core::cursor_store::CursorStore;
use crate::core::dispatcher::Dispatcher;
use crate::core::error::{StreamError, StreamResult};
use crate::core::event::ChangeEvent;
use crate::core::health_monitor::Restart;
use crate::ingestors::sse::SseDecoder;

const LAST_EVENT_ID: &str = "last-event-id";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Connection state as seen from outside the connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Counters since the connector was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectorStats {
    /// Events handed to the dispatcher.
    pub forwarded: u64,
    pub canaries: u64,
    pub malformed: u64,
    /// Successful HTTP opens, including transport reconnects.
    pub connects: u64,
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    canaries: AtomicU64,
    malformed: AtomicU64,
    connects: AtomicU64,
}

/// The live connection task and the token that stops it.
struct Connection {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Per-connection resume state, kept across transport reconnects.
struct Session {
    since: Option<DateTime<Utc>>,
    last_event_id: Option<String>,
    retry: Duration,
    failures: u32,
}

struct Inner {
    config: StreamConfig,
    client: reqwest::Client,
    cursor: Arc<CursorStore>,
    dispatcher: Arc<Dispatcher>,
    connection: Mutex<Option<Connection>>,
    state: watch::Sender<ConnectionState>,
    /// Bumped on every connect and close; stale delayed restarts compare against it.
    generation: AtomicU64,
    counters: Counters,
}

/// # Stream Connector
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct StreamConnector {
    inner: Arc<Inner>,
}

impl StreamConnector {
    pub fn new(config: StreamConfig, cursor: Arc<CursorStore>, dispatcher: Arc<Dispatcher>) -> StreamResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client,
                cursor,
                dispatcher,
                connection: Mutex::new(None),
                state,
                generation: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn stats(&self) -> ConnectorStats {
        let c = &self.inner.counters;
        ConnectorStats {
            forwarded: c.forwarded.load(Ordering::Relaxed),
            canaries: c.canaries.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            connects: c.connects.load(Ordering::Relaxed),
        }
    }

    /// Opens a new connection, closing any existing one first.
    ///
    /// `since` asks the upstream to replay from that instant; `None` means
    /// "from now". Returns once the connection task is running; the HTTP
    /// handshake happens in the background.
    pub async fn connect(&self, since: Option<DateTime<Utc>>) {
        self.open(since, None).await;
    }

    /// Full reconnect from the cursor, honoring the recency window.
    ///
    /// Never applies `start_fresh`; that flag only affects the first connect.
    pub async fn restart(&self) {
        self.restart_if(None).await;
    }

    /// Restart that is dropped when the generation moved away from `expected`
    /// while the resume point was being read.
    async fn restart_if(&self, expected: Option<u64>) -> bool {
        let since = self
            .inner
            .cursor
            .resume_point(false, Utc::now(), self.inner.config.recency_window())
            .await;
        log::info!("Restarting change stream {}", describe_since(since));
        self.open(since, expected).await
    }

    /// Swaps in a new connection task. With `expected` set, the generation is
    /// compared under the connection lock so a concurrent `close` always wins.
    async fn open(&self, since: Option<DateTime<Utc>>, expected: Option<u64>) -> bool {
        let mut slot = self.inner.connection.lock().await;
        if let Some(expected) = expected {
            if self.inner.generation.load(Ordering::Acquire) != expected {
                log::debug!("Delayed restart superseded, skipping");
                return false;
            }
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;

        if let Some(previous) = slot.take() {
            stop(previous).await;
            log::info!("Previous stream connection closed");
        }

        self.set_state(ConnectionState::Connecting);
        log::info!("Opening change stream {}", describe_since(since));

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let this = self.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = this.run(since, generation) => {}
            }
        });

        *slot = Some(Connection { token, task });
        true
    }

    /// Closes the connection. Pending delayed restarts become no-ops.
    pub async fn close(&self) {
        let mut slot = self.inner.connection.lock().await;
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(previous) = slot.take() {
            stop(previous).await;
            log::info!("Change stream closed");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Processes one message payload.
    ///
    /// Malformed payloads and canary events are skipped. Everything else
    /// advances the cursor and is dispatched to the routes.
    ///
    /// # Returns
    /// `true` when the event was forwarded.
    pub fn handle_message(&self, raw: &str) -> bool {
        let counters = &self.inner.counters;
        let event = match ChangeEvent::from_json(raw) {
            Ok(event) => event,
            Err(e) => {
                counters.malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Skipping malformed change record: {}", e);
                log::debug!("Offending payload: {}", raw);
                return false;
            }
        };

        if event.is_canary() {
            counters.canaries.fetch_add(1, Ordering::Relaxed);
            log::debug!("Skipping canary event {}", event.dedup_key());
            return false;
        }

        self.inner.cursor.update(event.timestamp);
        counters.forwarded.fetch_add(1, Ordering::Relaxed);
        self.inner.dispatcher.dispatch(event);
        true
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            log::debug!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    /// Connection task body: stream, and on failure wait and stream again.
    async fn run(&self, since: Option<DateTime<Utc>>, generation: u64) {
        let config = &self.inner.config;
        let mut session = Session {
            since,
            last_event_id: None,
            retry: config.reconnect_delay(),
            failures: 0,
        };

        loop {
            let outcome = match self.stream_once(&mut session).await {
                Ok(()) => StreamError::StreamClosed,
                Err(e) => e,
            };

            match outcome {
                e if e.is_rate_limited() => {
                    let backoff = config.rate_limit_backoff();
                    log::warn!(
                        "Upstream rate limited the connection, restarting in {}ms",
                        backoff.as_millis()
                    );
                    self.set_state(ConnectionState::Reconnecting);
                    self.schedule_restart(generation, backoff);
                    return;
                }
                e if e.is_benign_disconnect() => {
                    log::info!("Upstream closed the stream, reconnecting");
                }
                e => {
                    session.failures += 1;
                    log::error!("Change stream failed (attempt {}): {}", session.failures, e);
                }
            }

            self.set_state(ConnectionState::Reconnecting);
            let wait = reconnect_backoff(session.retry, config.reconnect_max_delay(), session.failures);
            tokio::time::sleep(wait).await;
            self.set_state(ConnectionState::Connecting);
        }
    }

    /// One HTTP request, consumed until the body ends or fails.
    async fn stream_once(&self, session: &mut Session) -> StreamResult<()> {
        // An event id is more precise than a timestamp; `since` only applies until one is seen.
        let since = if session.last_event_id.is_none() { session.since } else { None };
        let url = build_url(&self.inner.config.stream_url, since)?;

        let mut request = self
            .inner
            .client
            .get(url.clone())
            .header(ACCEPT, "text/event-stream");
        if let Some(id) = session.last_event_id.as_deref() {
            match HeaderValue::from_str(id) {
                Ok(value) => request = request.header(LAST_EVENT_ID, value),
                Err(_) => log::warn!("Last event id is not a valid header value, resuming without it"),
            }
        }

        log::debug!("GET {}", url);
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(StreamError::RateLimited);
        }
        if !status.is_success() {
            return Err(StreamError::HttpStatus(status.as_u16()));
        }

        self.inner.counters.connects.fetch_add(1, Ordering::Relaxed);
        session.failures = 0;
        self.set_state(ConnectionState::Connected);
        log::info!("Connected to {}", url);

        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for message in decoder.feed(&chunk) {
                if let Some(ms) = message.retry {
                    session.retry = server_retry(ms, self.inner.config.reconnect_delay());
                }
                if message.data.is_empty() {
                    continue;
                }
                if !message.is_message() {
                    log::debug!("Ignoring '{}' event", message.event.as_deref().unwrap_or_default());
                    continue;
                }
                self.handle_message(&message.data);
            }
            if let Some(id) = decoder.last_event_id() {
                if session.last_event_id.as_deref() != Some(id) {
                    session.last_event_id = Some(id.to_string());
                }
            }
        }
        Ok(())
    }

    /// Restarts after `delay` unless another connect or close happened meanwhile.
    fn schedule_restart(&self, generation: u64, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.inner.generation.load(Ordering::Acquire) != generation {
                log::debug!("Delayed restart superseded, skipping");
                return;
            }
            this.restart_if(Some(generation)).await;
        });
    }
}

impl Restart for StreamConnector {
    fn restart(&self) -> BoxFuture<'_, ()> {
        Box::pin(StreamConnector::restart(self))
    }
}

async fn stop(connection: Connection) {
    connection.token.cancel();
    if let Err(e) = connection.task.await {
        if e.is_panic() {
            log::error!("Connection task panicked: {}", e);
        }
    }
}

/// Stream URL with an optional `since` parameter in ISO-8601 UTC.
pub fn build_url(base: &str, since: Option<DateTime<Utc>>) -> StreamResult<Url> {
    let mut url = Url::parse(base)?;
    if let Some(since) = since {
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "since")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(retained)
            .append_pair("since", &since.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    Ok(url)
}

/// Reconnect delay requested by the server, never below the configured one.
fn server_retry(ms: u64, floor: Duration) -> Duration {
    Duration::from_millis(ms).max(floor)
}

/// Doubles `base` per consecutive failure, capped at `max`.
fn reconnect_backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    if failures <= 1 {
        return base.min(max);
    }
    let factor = 1u32 << (failures - 1).min(16);
    base.saturating_mul(factor).min(max)
}

fn describe_since(since: Option<DateTime<Utc>>) -> String {
    match since {
        Some(ts) => format!("since {}", ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
        None => "from now".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::RouteRegistry;
    use crate::core::route::RouteSpec;
    use std::sync::Mutex as StdMutex;

    fn canary(ts: i64) -> String {
        format!(
            r#"{{"wiki":"canarywiki","type":"edit","title":"Canary","user":"bot","comment":"","timestamp":{},"meta":{{"domain":"canary"}}}}"#,
            ts
        )
    }

    fn edit(title: &str, ts: i64) -> String {
        format!(
            r#"{{"wiki":"enwiki","type":"edit","title":"{}","user":"Tester","comment":"typo","timestamp":{},"meta":{{"domain":"en.wikipedia.org","id":"{}-{}"}}}}"#,
            title, ts, title, ts
        )
    }

    fn categorize(title: &str, ts: i64) -> String {
        format!(
            r#"{{"wiki":"enwiki","type":"categorize","title":"{}","user":"Tester","comment":"[[:Foo]] added to category","timestamp":{},"meta":{{"domain":"en.wikipedia.org"}}}}"#,
            title, ts
        )
    }

    type Seen = Arc<StdMutex<Vec<(String, String)>>>;

    fn recording(name: &'static str, seen: &Seen, accept: fn(&ChangeEvent) -> bool) -> RouteSpec {
        let seen = Arc::clone(seen);
        RouteSpec::new(name).filter(accept).worker(move |ev| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push((name.to_string(), ev.title.clone()));
                Ok(())
            }
        })
    }

    fn connector(specs: Vec<RouteSpec>) -> (StreamConnector, Arc<CursorStore>, Arc<Dispatcher>) {
        let registry = RouteRegistry::load(specs, None);
        let dispatcher = Arc::new(Dispatcher::new(&registry));
        let cursor = Arc::new(CursorStore::new("unused-cursor.txt"));
        let connector =
            StreamConnector::new(StreamConfig::default(), Arc::clone(&cursor), Arc::clone(&dispatcher)).unwrap();
        (connector, cursor, dispatcher)
    }

    #[tokio::test]
    async fn events_are_routed_and_canaries_dropped() {
        let seen: Seen = Arc::default();
        let (connector, cursor, dispatcher) = connector(vec![
            recording("alpha", &seen, |ev| ev.kind == "edit"),
            recording("beta", &seen, |ev| ev.kind == "categorize"),
        ]);

        assert!(connector.handle_message(&edit("Foo", 1_714_557_600)));
        assert!(connector.handle_message(&categorize("Category:Bar", 1_714_557_601)));
        assert!(!connector.handle_message(&canary(1_714_557_602)));
        assert!(dispatcher.wait_idle(Duration::from_secs(2)).await);

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("alpha".to_string(), "Foo".to_string()),
                ("beta".to_string(), "Category:Bar".to_string()),
            ]
        );
        // The canary never advances the cursor.
        assert_eq!(cursor.peek(), Some(1_714_557_601));
        assert_eq!(
            connector.stats(),
            ConnectorStats {
                forwarded: 2,
                canaries: 1,
                malformed: 0,
                connects: 0
            }
        );
    }

    fn change(kind: &str, title: &str, ts: i64) -> String {
        format!(
            r#"{{"wiki":"enwiki","type":"{}","title":"{}","user":"Tester","comment":"","timestamp":{},"meta":{{"domain":"en.wikipedia.org"}}}}"#,
            kind, title, ts
        )
    }

    fn timestamps(name: &'static str, filter: fn(&ChangeEvent) -> bool) -> (RouteSpec, Arc<StdMutex<Vec<i64>>>) {
        let seen: Arc<StdMutex<Vec<i64>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let spec = RouteSpec::new(name).filter(filter).worker(move |ev| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(ev.timestamp);
                Ok(())
            }
        });
        (spec, seen)
    }

    #[tokio::test]
    async fn catch_all_route_gets_every_kind_but_never_canaries() {
        let (alpha, alpha_seen) = timestamps("alpha", |ev| ev.kind == "edit");
        let (beta, beta_seen) = timestamps("beta", |_| true);
        let (connector, cursor, dispatcher) = connector(vec![alpha, beta]);

        assert!(connector.handle_message(&change("edit", "Foo", 100)));
        assert!(connector.handle_message(&change("log", "Special:Log/block", 101)));
        assert!(!connector.handle_message(&canary(102)));
        assert!(dispatcher.wait_idle(Duration::from_secs(2)).await);

        assert_eq!(*alpha_seen.lock().unwrap(), vec![100]);
        assert_eq!(*beta_seen.lock().unwrap(), vec![100, 101]);
        assert_eq!(cursor.peek(), Some(101));
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped() {
        let seen: Seen = Arc::default();
        let (connector, cursor, dispatcher) = connector(vec![recording("all", &seen, |_| true)]);

        assert!(!connector.handle_message("{not json"));
        assert!(!connector.handle_message(r#"{"wiki":"enwiki","type":"edit"}"#));
        assert!(connector.handle_message(&edit("After", 10)));
        assert!(dispatcher.wait_idle(Duration::from_secs(2)).await);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(cursor.peek(), Some(10));
        assert_eq!(connector.stats().malformed, 2);
    }

    #[tokio::test]
    async fn close_without_connection_is_disconnected() {
        let (connector, _cursor, _dispatcher) = connector(Vec::new());
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        connector.close().await;
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_restart_after_close_stays_closed() {
        let (connector, _cursor, _dispatcher) = connector(Vec::new());
        let generation = connector.inner.generation.load(Ordering::Acquire);

        connector.schedule_restart(generation, Duration::from_secs(5));
        connector.close().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(connector.state(), ConnectionState::Disconnected);
        assert!(connector.inner.connection.lock().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_restart_reads_cursor_wins() {
        let (connector, _cursor, _dispatcher) = connector(Vec::new());
        let generation = connector.inner.generation.load(Ordering::Acquire);

        // Hold the slot the way `close` does, and bump the generation under it.
        let slot = connector.inner.connection.lock().await;
        let pending = tokio::spawn({
            let connector = connector.clone();
            async move { connector.restart_if(Some(generation)).await }
        });
        connector.inner.generation.fetch_add(1, Ordering::AcqRel);
        drop(slot);

        assert!(!pending.await.unwrap());
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        assert!(connector.inner.connection.lock().await.is_none());
    }

    #[test]
    fn server_retry_never_drops_below_configured_delay() {
        let floor = Duration::from_millis(1000);
        assert_eq!(server_retry(0, floor), floor);
        assert_eq!(server_retry(250, floor), floor);
        assert_eq!(server_retry(5000, floor), Duration::from_millis(5000));
    }

    #[test]
    fn url_carries_since_in_utc_seconds() {
        let since = DateTime::from_timestamp(1_714_557_600, 0).unwrap();
        let url = build_url("https://stream.example.org/v2/stream/recentchange", Some(since)).unwrap();
        assert_eq!(
            url.as_str(),
            "https://stream.example.org/v2/stream/recentchange?since=2024-05-01T10%3A00%3A00Z"
        );

        let url = build_url("https://stream.example.org/v2/stream/recentchange", None).unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn url_replaces_existing_since() {
        let since = DateTime::from_timestamp(0, 0).unwrap();
        let url = build_url("https://stream.example.org/s?since=old&x=1", Some(since)).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
        assert_eq!(
            pairs,
            vec![
                ("x".to_string(), "1".to_string()),
                ("since".to_string(), "1970-01-01T00:00:00Z".to_string()),
            ]
        );
    }

    #[test]
    fn reconnect_backoff_doubles_up_to_ceiling() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert_eq!(reconnect_backoff(base, max, 0), base);
        assert_eq!(reconnect_backoff(base, max, 1), base);
        assert_eq!(reconnect_backoff(base, max, 3), Duration::from_secs(4));
        assert_eq!(reconnect_backoff(base, max, 10), max);
        assert_eq!(reconnect_backoff(base, max, 200), max);
    }
}
