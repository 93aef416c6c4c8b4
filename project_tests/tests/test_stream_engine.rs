use chrono::{SecondsFormat, Utc};
use lib_common::configs::StreamConfig;
use lib_common::core::{ChangeEvent, Readiness, RouteSpec, StreamEngine};
use lib_common::ingestors::ConnectionState;
use project_tests::{
    MockUpstream, Reply, canary_event, categorize_event, edit_event, sse_frame, wait_until,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

const USER_AGENT: &str = "rcstream-tests/0.1 (ops@example.org)";

fn test_config(upstream: &MockUpstream, dir: &Path) -> StreamConfig {
    StreamConfig {
        stream_url: upstream.url(),
        user_agent: USER_AGENT.to_string(),
        cursor_path: dir.join("cursor.txt"),
        persist_interval_ms: 20,
        reconnect_delay_ms: 20,
        reconnect_max_delay_ms: 100,
        rate_limit_backoff_ms: 50,
        log_level: "warn".to_string(),
        ..Default::default()
    }
}

type Seen = Arc<Mutex<Vec<String>>>;

fn recording_route(name: &str, seen: &Seen, accept: fn(&ChangeEvent) -> bool) -> RouteSpec {
    let seen = Arc::clone(seen);
    RouteSpec::new(name).filter(accept).worker(move |ev| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push(ev.title.clone());
            Ok(())
        }
    })
}

#[tokio::test]
async fn first_connect_resumes_from_stored_cursor() {
    let dir = tempdir().unwrap();
    let upstream = MockUpstream::start(Vec::new()).await.unwrap();
    let config = test_config(&upstream, dir.path());

    let stored = Utc::now().timestamp() - 3600;
    std::fs::write(&config.cursor_path, stored.to_string()).unwrap();

    let engine = StreamEngine::launch(Vec::new(), config).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || upstream.request_count() == 1).await);
    assert!(wait_until(Duration::from_secs(5), || engine.connector.state() == ConnectionState::Connected).await);

    let request = &upstream.requests()[0];
    let expected = chrono::DateTime::from_timestamp(stored, 0)
        .unwrap()
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    assert_eq!(request.since.as_deref(), Some(expected.as_str()));
    assert_eq!(request.user_agent.as_deref(), Some(USER_AGENT));
    assert_eq!(request.accept.as_deref(), Some("text/event-stream"));
    assert_eq!(request.last_event_id, None);

    engine.shutdown().await;
}

#[tokio::test]
async fn stale_cursor_and_fresh_start_connect_from_now() {
    let dir = tempdir().unwrap();
    let upstream = MockUpstream::start(Vec::new()).await.unwrap();
    let config = test_config(&upstream, dir.path());
    let eight_days_ago = Utc::now().timestamp() - 8 * 24 * 3600;
    std::fs::write(&config.cursor_path, eight_days_ago.to_string()).unwrap();

    let engine = StreamEngine::launch(Vec::new(), config.clone()).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || upstream.request_count() == 1).await);
    assert_eq!(upstream.requests()[0].since, None);
    engine.shutdown().await;

    std::fs::write(&config.cursor_path, (Utc::now().timestamp() - 60).to_string()).unwrap();
    let fresh = StreamConfig {
        start_fresh: true,
        ..config
    };
    let engine = StreamEngine::launch(Vec::new(), fresh).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || upstream.request_count() == 2).await);
    assert_eq!(upstream.requests()[1].since, None);
    engine.shutdown().await;
}

#[tokio::test]
async fn events_reach_matching_routes_and_canaries_are_dropped() {
    let dir = tempdir().unwrap();
    let t0 = Utc::now().timestamp() - 30;
    let upstream = MockUpstream::start(vec![Reply::Events {
        frames: vec![
            sse_frame(Some("1"), &edit_event("Foo", t0)),
            sse_frame(Some("2"), &categorize_event("Category:Bar", "Foo", t0 + 1)),
            sse_frame(Some("3"), &canary_event(t0 + 2)),
        ],
        hold_open: true,
    }])
    .await
    .unwrap();
    let config = test_config(&upstream, dir.path());
    let cursor_path = config.cursor_path.clone();

    let alpha: Seen = Arc::default();
    let beta: Seen = Arc::default();
    let routes = vec![
        recording_route("alpha", &alpha, |ev| ev.kind == "edit"),
        recording_route("beta", &beta, |ev| ev.kind == "categorize"),
    ];

    let engine = StreamEngine::launch(routes, config).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            alpha.lock().unwrap().len() == 1 && beta.lock().unwrap().len() == 1
        })
        .await
    );
    // Give a stray canary delivery a chance to show up.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*alpha.lock().unwrap(), vec!["Foo".to_string()]);
    assert_eq!(*beta.lock().unwrap(), vec!["Category:Bar".to_string()]);
    assert_eq!(engine.cursor.peek(), Some(t0 + 1));
    assert_eq!(engine.connector.stats().canaries, 1);

    engine.shutdown().await;
    assert_eq!(std::fs::read_to_string(&cursor_path).unwrap(), (t0 + 1).to_string());
}

#[tokio::test]
async fn failed_init_disables_only_that_route() {
    let dir = tempdir().unwrap();
    let t0 = Utc::now().timestamp() - 10;
    let upstream = MockUpstream::start(vec![Reply::Events {
        frames: vec![
            sse_frame(None, &edit_event("One", t0)),
            sse_frame(None, &edit_event("Two", t0 + 1)),
        ],
        hold_open: true,
    }])
    .await
    .unwrap();
    let config = test_config(&upstream, dir.path());

    let healthy: Seen = Arc::default();
    let broken: Seen = Arc::default();
    let routes = vec![
        recording_route("healthy", &healthy, |_| true),
        recording_route("broken", &broken, |_| true).init(|| async { Err(anyhow::anyhow!("no database")) }),
    ];

    let engine = StreamEngine::launch(routes, config).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || healthy.lock().unwrap().len() == 2).await);

    assert_eq!(engine.registry.readiness("broken"), Some(Readiness::Failed));
    assert_eq!(engine.registry.active_count(), 1);
    assert!(broken.lock().unwrap().is_empty());
    assert_eq!(*healthy.lock().unwrap(), vec!["One".to_string(), "Two".to_string()]);

    engine.shutdown().await;
}

#[tokio::test]
async fn events_wait_for_slow_init_and_arrive_in_order() {
    let dir = tempdir().unwrap();
    let t0 = Utc::now().timestamp() - 10;
    let upstream = MockUpstream::start(vec![Reply::Events {
        frames: (0..5).map(|i| sse_frame(None, &edit_event(&format!("E{}", i), t0 + i))).collect(),
        hold_open: true,
    }])
    .await
    .unwrap();
    let config = test_config(&upstream, dir.path());

    let gate = Arc::new(tokio::sync::Notify::new());
    let init_gate = Arc::clone(&gate);
    let seen: Seen = Arc::default();
    let routes = vec![recording_route("slow", &seen, |_| true).init(move || {
        let gate = Arc::clone(&init_gate);
        async move {
            gate.notified().await;
            Ok(())
        }
    })];

    let engine = StreamEngine::launch(routes, config).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || engine.connector.stats().forwarded == 5).await);
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(engine.dispatcher.queue_len("slow"), Some(5));

    gate.notify_one();
    assert!(wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() == 5).await);
    let expected: Vec<String> = (0..5).map(|i| format!("E{}", i)).collect();
    assert_eq!(*seen.lock().unwrap(), expected);

    engine.shutdown().await;
}
