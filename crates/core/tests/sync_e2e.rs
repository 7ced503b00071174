//! End-to-end sync tests against a local HTTP server.
//!
//! Each test starts an `axum` server on `127.0.0.1:0` serving a ping sync
//! endpoint, builds a [`SyncEngine`] from a TOML config pointing at it, and
//! runs real passes into an on-disk SQLite database. Both storage backends
//! are covered. No external network I/O.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tempfile::TempDir;

use meldestelle_sync_core::config::AppConfig;
use meldestelle_sync_core::errors::{SyncError, TransportError};
use meldestelle_sync_core::models::{CursorToken, PingEvent};
use meldestelle_sync_core::sync_engine::SyncEngine;

// ===========================================================================
// Helpers
// ===========================================================================

#[derive(Default)]
struct ServerState {
    events: Mutex<Vec<PingEvent>>,
    cursors: Mutex<Vec<Option<String>>>,
    auth: Mutex<Vec<Option<String>>>,
}

impl ServerState {
    fn publish(&self, event: PingEvent) {
        let mut events = self.events.lock().unwrap();
        events.retain(|e| e.id != event.id);
        events.push(event);
    }

    fn cursors(&self) -> Vec<Option<String>> {
        self.cursors.lock().unwrap().clone()
    }
}

#[derive(Deserialize)]
struct SyncQuery {
    since: Option<String>,
}

async fn ping_sync(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(query): Query<SyncQuery>,
) -> Json<Vec<PingEvent>> {
    state.cursors.lock().unwrap().push(query.since.clone());
    state.auth.lock().unwrap().push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );

    let mut newer: Vec<PingEvent> = state
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| query.since.as_deref().map_or(true, |since| e.id.as_str() > since))
        .cloned()
        .collect();
    newer.sort_by_key(|e| e.last_modified);
    Json(newer)
}

async fn broken() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "database on fire").into_response()
}

async fn not_an_array() -> Json<serde_json::Value> {
    Json(serde_json::json!({"events": []}))
}

async fn start_server(state: Arc<ServerState>) -> SocketAddr {
    let app = Router::new()
        .route("/api/ping/sync", get(ping_sync))
        .route("/broken", get(broken))
        .route("/object", get(not_an_array))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn config(addr: SocketAddr, data_dir: &Path, backend: &str, extra: &str) -> AppConfig {
    let toml_str = format!(
        r#"
[remote]
base_url = "http://{addr}"
timeout_secs = 5
{extra}

[storage]
backend = "{backend}"
data_dir = "{data_dir}"
request_timeout_ms = 5000
"#,
        data_dir = data_dir.display().to_string().replace('\\', "/"),
    );
    let mut config: AppConfig = toml::from_str(&toml_str).unwrap();
    config.resolve_env_vars().unwrap();
    config.validate().unwrap();
    config
}

async fn full_sync_cycle(backend: &str) {
    let state = Arc::new(ServerState::default());
    state.publish(PingEvent::new("e1", "Ping 1", 1000));
    state.publish(PingEvent::new("e2", "Ping 2", 2000));
    let addr = start_server(state.clone()).await;
    let dir = TempDir::new().unwrap();

    let engine = SyncEngine::from_config(config(addr, dir.path(), backend, ""))
        .await
        .unwrap();

    // First pass pulls everything.
    let reports = engine.run_pass().await.unwrap();
    assert_eq!(reports[0].written, 2);
    assert_eq!(reports[0].cursor_after, Some(CursorToken::from("e2")));
    assert_eq!(
        engine.ping_events().list().await.unwrap(),
        vec![
            PingEvent::new("e1", "Ping 1", 1000),
            PingEvent::new("e2", "Ping 2", 2000),
        ]
    );

    // Nothing new: zero writes.
    let reports = engine.run_pass().await.unwrap();
    assert_eq!(reports[0].fetched, 0);
    assert_eq!(reports[0].written, 0);

    // A new event is picked up from the stored cursor.
    state.publish(PingEvent::new("e3", "Ping 3", 3000));
    let reports = engine.run_pass().await.unwrap();
    assert_eq!(reports[0].written, 1);

    let status = engine.status().await.unwrap();
    assert_eq!(status.entities[0].rows, 3);
    assert_eq!(status.entities[0].cursor, Some(CursorToken::from("e3")));
    assert_eq!(status.database_path, dir.path().join("app.db"));

    assert_eq!(
        state.cursors(),
        vec![None, Some("e2".to_string()), Some("e2".to_string())]
    );
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn test_native_backend_full_cycle() {
    full_sync_cycle("native").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_backend_full_cycle() {
    full_sync_cycle("worker").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_store_survives_restart() {
    let state = Arc::new(ServerState::default());
    state.publish(PingEvent::new("e1", "Ping 1", 1000));
    let addr = start_server(state.clone()).await;
    let dir = TempDir::new().unwrap();

    {
        let engine = SyncEngine::from_config(config(addr, dir.path(), "worker", ""))
            .await
            .unwrap();
        engine.run_pass().await.unwrap();
        assert!(engine.status().await.unwrap().storage.contains("persistent"));
    }

    // A fresh engine resumes from the durable file, not from memory.
    let engine = SyncEngine::from_config(config(addr, dir.path(), "worker", ""))
        .await
        .unwrap();
    let status = engine.status().await.unwrap();
    assert_eq!(status.entities[0].rows, 1);
    engine.run_pass().await.unwrap();
    assert_eq!(state.cursors().last(), Some(&Some("e1".to_string())));
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    std::env::set_var("E2E_MELDESTELLE_TOKEN", "tok_e2e");
    let state = Arc::new(ServerState::default());
    let addr = start_server(state.clone()).await;
    let dir = TempDir::new().unwrap();

    let engine = SyncEngine::from_config(config(
        addr,
        dir.path(),
        "native",
        r#"token_env = "E2E_MELDESTELLE_TOKEN""#,
    ))
    .await
    .unwrap();
    engine.run_pass().await.unwrap();

    assert_eq!(
        *state.auth.lock().unwrap(),
        vec![Some("Bearer tok_e2e".to_string())]
    );
    std::env::remove_var("E2E_MELDESTELLE_TOKEN");
}

#[tokio::test]
async fn test_server_error_aborts_without_writes() {
    let state = Arc::new(ServerState::default());
    let addr = start_server(state).await;
    let dir = TempDir::new().unwrap();

    let mut cfg = config(addr, dir.path(), "native", "");
    cfg.endpoints.ping.path = "/broken".into();
    let engine = SyncEngine::from_config(cfg).await.unwrap();

    let result = engine.run_pass().await;
    match result {
        Err(SyncError::Transport(TransportError::Status { status, body })) => {
            assert_eq!(status, 500);
            assert_eq!(body, "database on fire");
        }
        other => panic!("expected status error, got {:?}", other),
    }
    assert_eq!(engine.ping_events().count().await.unwrap(), 0);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_non_array_body_is_a_decode_error() {
    let state = Arc::new(ServerState::default());
    let addr = start_server(state).await;
    let dir = TempDir::new().unwrap();

    let mut cfg = config(addr, dir.path(), "native", "");
    cfg.endpoints.ping.path = "/object".into();
    let engine = SyncEngine::from_config(cfg).await.unwrap();

    let result = engine.run_pass().await;
    assert!(matches!(
        result,
        Err(SyncError::Transport(TransportError::Decode(_)))
    ));
}
