//! Shared fixtures for the integration tests: a scriptable local upstream
//! speaking Server-Sent Events, and small builders for change records.

use axum::Router;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const STREAM_PATH: &str = "/v2/stream/recentchange";

/// What the upstream saw on one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub since: Option<String>,
    pub last_event_id: Option<String>,
    pub user_agent: Option<String>,
    pub accept: Option<String>,
}

/// Scripted answer for one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Plain status code with an empty body.
    Status(u16),
    /// SSE frames; `hold_open` keeps the body open after the last frame.
    Events { frames: Vec<String>, hold_open: bool },
}

#[derive(Default)]
struct MockState {
    requests: Mutex<Vec<RecordedRequest>>,
    script: Mutex<VecDeque<Reply>>,
}

/// # Mock Upstream
///
/// Answers requests with the scripted replies in order. Once the script is
/// exhausted every request gets an idle, open stream.
pub struct MockUpstream {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    server: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start(script: Vec<Reply>) -> anyhow::Result<Self> {
        let state = Arc::new(MockState {
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
        });
        let app = Router::new()
            .route(STREAM_PATH, get(serve_stream))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("Mock upstream stopped: {}", e);
            }
        });
        Ok(Self { addr, state, server })
    }

    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, STREAM_PATH)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve_stream(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let header_value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    state.requests.lock().unwrap().push(RecordedRequest {
        since: params.get("since").cloned(),
        last_event_id: header_value("last-event-id"),
        user_agent: header_value("user-agent"),
        accept: header_value("accept"),
    });

    let reply = state.script.lock().unwrap().pop_front().unwrap_or(Reply::Events {
        frames: Vec::new(),
        hold_open: true,
    });

    match reply {
        Reply::Status(code) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        Reply::Events { frames, hold_open } => {
            let chunks = stream::iter(frames.into_iter().map(|f| Ok::<_, Infallible>(Bytes::from(f))));
            let body = if hold_open {
                Body::from_stream(chunks.chain(stream::pending()))
            } else {
                Body::from_stream(chunks)
            };
            ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
        }
    }
}

/// One SSE frame carrying `data`, optionally with an `id:` line.
pub fn sse_frame(id: Option<&str>, data: &serde_json::Value) -> String {
    match id {
        Some(id) => format!("id: {}\nevent: message\ndata: {}\n\n", id, data),
        None => format!("event: message\ndata: {}\n\n", data),
    }
}

pub fn edit_event(title: &str, ts: i64) -> serde_json::Value {
    json!({
        "wiki": "enwiki",
        "type": "edit",
        "title": title,
        "user": "Tester",
        "comment": "copyedit",
        "timestamp": ts,
        "namespace": 0,
        "bot": false,
        "meta": { "domain": "en.wikipedia.org", "id": format!("edit-{}-{}", title, ts), "stream": "mediawiki.recentchange" }
    })
}

pub fn categorize_event(category: &str, page: &str, ts: i64) -> serde_json::Value {
    json!({
        "wiki": "enwiki",
        "type": "categorize",
        "title": category,
        "user": "Tester",
        "comment": format!("[[:{}]] added to category", page),
        "timestamp": ts,
        "meta": { "domain": "en.wikipedia.org", "id": format!("cat-{}-{}", page, ts) }
    })
}

pub fn canary_event(ts: i64) -> serde_json::Value {
    json!({
        "wiki": "canarywiki",
        "type": "edit",
        "title": "Canary",
        "user": "canary",
        "comment": "",
        "timestamp": ts,
        "meta": { "domain": "canary" }
    })
}

/// Polls `check` every 10ms until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
