use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use askama::Template;
use axum::{Json, Router};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use futures_util::StreamExt as _;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use vudash_core::poller::{Poller, PollerConfig, RunStatus};
use vudash_core::token::Token;
use vudash_store::{Snapshot, SnapshotStore, TokenRegistry};

use crate::cli::Cli;
use crate::monitor::Monitor;

struct App {
    registry: Arc<TokenRegistry>,
    snapshots: Arc<SnapshotStore>,
    monitor: Arc<Monitor>,
    client: reqwest::Client,
    poll_interval: Duration,
    stall_threshold: u32,
    active: Mutex<Option<ActivePoll>>,
}

/// At most one dashboard is polled at a time; selecting another one
/// replaces this.
struct ActivePoll {
    id: String,
    poller: Poller,
}

pub async fn serve(cli: Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("failed to create data dir {}", cli.data_dir.display()))?;

    let registry = Arc::new(
        TokenRegistry::open(cli.data_dir.join("tokens.json"), !cli.keep_data)
            .context("failed to open token registry")?,
    );
    let snapshots = Arc::new(SnapshotStore::open(
        cli.data_dir.join("dashboard-data.json"),
        !cli.keep_data,
    ));
    let monitor = Arc::new(Monitor::restore(snapshots.read()));

    let state = Arc::new(App {
        registry: registry.clone(),
        snapshots: snapshots.clone(),
        monitor,
        client: reqwest::Client::new(),
        poll_interval: cli.poll_interval,
        stall_threshold: cli.stall_threshold,
        active: Mutex::new(None),
    });

    let listener = TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    let addr = listener
        .local_addr()
        .context("failed to resolve bound address")?;

    tracing::info!(%addr, "dashboard server listening");
    // Machine-readable line for callers that spawn the server with an
    // ephemeral port.
    eprintln!("listening=http://{addr}");

    let app = router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Shutdown order: stop the poller first so nothing writes to the
    // stores while they flush.
    if let Some(active) = state.active.lock().await.take() {
        active.poller.shutdown().await;
    }
    if let Err(err) = snapshots.close() {
        tracing::warn!(error = %err, "failed to finalize snapshot file");
    }
    if let Err(err) = registry.close() {
        tracing::warn!(error = %err, "failed to finalize token registry");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}

fn router(state: Arc<App>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/load", get(list_tokens).post(create_token))
        .route("/api/load/{id}", delete(delete_token))
        .route(
            "/api/dashboard-data",
            get(get_dashboard_data).post(put_dashboard_data),
        )
        .route("/api/select/{id}", post(select_dashboard))
        .route("/api/select", delete(deselect_dashboard))
        .route("/api/summary/{id}", get(dashboard_summary))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Store errors mapped onto the HTTP surface.
struct ApiError(vudash_store::Error);

impl From<vudash_store::Error> for ApiError {
    fn from(err: vudash_store::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use vudash_store::Error;

        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Io(_) | Error::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "success": false, "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

async fn index() -> Html<String> {
    let tpl = IndexTemplate {};
    let html = match tpl.render() {
        Ok(v) => v,
        Err(_) => "template render failed".to_string(),
    };
    Html(html)
}

async fn list_tokens(State(state): State<Arc<App>>) -> Json<Vec<Token>> {
    Json(state.registry.list())
}

async fn create_token(
    State(state): State<Arc<App>>,
    Json(payload): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    // The title check happens before deserialization so a missing field
    // reports a field error, not a shape error.
    let title = payload
        .get("title")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or_default();
    if title.is_empty() {
        return Err(vudash_store::Error::Validation("Title is required".to_string()).into());
    }

    let mut token: Token = serde_json::from_value(payload)
        .map_err(|err| vudash_store::Error::Validation(err.to_string()))?;
    if token.id.trim().is_empty() {
        token.id = generated_id();
    }
    if token.time.trim().is_empty() {
        token.time = humantime::format_rfc3339_seconds(SystemTime::now()).to_string();
    }

    let token = state.registry.create(token)?;
    tracing::info!(id = %token.id, title = %token.title, "token registered");

    let body = serde_json::json!({
        "success": true,
        "id": token.id,
        "title": token.title,
    });
    Ok((StatusCode::CREATED, Json(body)))
}

async fn delete_token(
    State(state): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Stop the poller first if this token is the one being watched.
    {
        let mut active = state.active.lock().await;
        if active.as_ref().is_some_and(|a| a.id == id) {
            if let Some(prev) = active.take() {
                prev.poller.shutdown().await;
            }
        }
    }

    state.registry.delete(&id)?;
    tracing::info!(%id, "token deleted");
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn get_dashboard_data(State(state): State<Arc<App>>) -> Json<Snapshot> {
    Json(state.monitor.snapshot())
}

async fn put_dashboard_data(
    State(state): State<Arc<App>>,
    Json(snapshot): Json<Snapshot>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.snapshots.write(&snapshot)?;
    state.monitor.replace(snapshot);
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn select_dashboard(
    State(state): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = state
        .registry
        .get(&id)
        .ok_or_else(|| vudash_store::Error::NotFound(id.clone()))?;

    let mut active = state.active.lock().await;
    if let Some(prev) = active.take() {
        prev.poller.shutdown().await;
        tracing::debug!(id = %prev.id, "previous poller cancelled");
    }

    let status = state.monitor.status(&token);
    if status == RunStatus::Stopped {
        // The run already ended; there is nothing to poll.
        return Ok(Json(serde_json::json!({
            "success": true,
            "id": token.id,
            "status": status.to_string(),
        })));
    }

    let config = PollerConfig {
        url: token.url.clone(),
        interval: state.poll_interval,
        stall_threshold: state.stall_threshold,
    };
    let events = state
        .monitor
        .clone()
        .event_fn(&token, state.registry.clone(), state.snapshots.clone());
    let poller = Poller::spawn(state.client.clone(), config, token.created_at(), events);

    *active = Some(ActivePoll {
        id: token.id.clone(),
        poller,
    });
    tracing::info!(id = %token.id, url = %token.url, %status, "dashboard selected, polling started");

    Ok(Json(serde_json::json!({
        "success": true,
        "id": token.id,
        "status": status.to_string(),
    })))
}

async fn deselect_dashboard(State(state): State<Arc<App>>) -> Json<serde_json::Value> {
    let mut active = state.active.lock().await;
    if let Some(prev) = active.take() {
        prev.poller.shutdown().await;
        tracing::info!(id = %prev.id, "dashboard deselected, polling stopped");
    }
    Json(serde_json::json!({ "success": true }))
}

async fn dashboard_summary(
    State(state): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<crate::monitor::DashboardSummary>, ApiError> {
    let token = state
        .registry
        .get(&id)
        .ok_or_else(|| vudash_store::Error::NotFound(id.clone()))?;
    Ok(Json(state.monitor.summary(&token)))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<App>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: Arc<App>) {
    let snapshot_msg = state.monitor.snapshot_message_json();
    if socket
        .send(Message::Text(snapshot_msg.into()))
        .await
        .is_err()
    {
        return;
    }

    let mut rx = state.monitor.subscribe();

    loop {
        tokio::select! {
            recv = rx.recv() => {
                let Ok(text) = recv else {
                    break;
                };
                if socket
                    .send(Message::Text(text.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            incoming = socket.next() => {
                let Some(Ok(msg)) = incoming else {
                    break;
                };
                match msg {
                    Message::Close(_) => break,
                    Message::Ping(payload) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    _ => {}
                }
            }
        }
    }
}

fn generated_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    format!("{nanos:x}")
}

#[derive(askama::Template)]
#[template(path = "index.html")]
struct IndexTemplate {}
