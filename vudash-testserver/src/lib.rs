use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub const PATH_METRICS: &str = "/metrics";

/// What the `/metrics` endpoint serves next. Tests flip this at runtime to
/// drive the dashboard's polling loop through its states.
#[derive(Debug, Clone)]
pub enum ResponseMode {
    /// Serialize the given value as the response body.
    Json(serde_json::Value),

    /// Serve the string verbatim (for malformed-body cases).
    Raw(String),

    /// Respond with a bare status code and empty body.
    Status(u16),
}

impl Default for ResponseMode {
    fn default() -> Self {
        ResponseMode::Json(serde_json::Value::Array(Vec::new()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsState {
    mode: Arc<Mutex<ResponseMode>>,
    requests_total: Arc<AtomicU64>,
}

impl MetricsState {
    pub fn set_mode(&self, mode: ResponseMode) {
        let mut guard = self
            .mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = mode;
    }

    pub fn set_reports(&self, reports: serde_json::Value) {
        self.set_mode(ResponseMode::Json(reports));
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    fn current_mode(&self) -> ResponseMode {
        let guard = self
            .mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }
}

async fn handle_metrics(State(state): State<MetricsState>) -> (StatusCode, String) {
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    match state.current_mode() {
        ResponseMode::Json(value) => match serde_json::to_string(&value) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "encode error".to_string()),
        },
        ResponseMode::Raw(body) => (StatusCode::OK, body),
        ResponseMode::Status(code) => (
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            String::new(),
        ),
    }
}

pub fn router(state: MetricsState) -> Router {
    Router::new()
        .route(PATH_METRICS, get(handle_metrics))
        .with_state(state)
}

/// A loopback stand-in for the external load tool's metrics endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    state: MetricsState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl MetricsServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = MetricsState::default();
        let app = router(state.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = serve.await;
        });

        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn metrics_url(&self) -> String {
        format!("http://{}{}", self.addr, PATH_METRICS)
    }

    pub fn state(&self) -> &MetricsState {
        &self.state
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// A small plausible report batch for demos and smoke tests.
pub fn sample_reports(tick: u64) -> serde_json::Value {
    let jitter = |base: u64| (base + tick * 137 % 900) * 10_000;
    serde_json::json!([
        {
            "vu_id": 1,
            "ts_exec_count": 10 + tick,
            "ts_exec_failure": tick / 7,
            "ts_exec_time": [jitter(150), jitter(210)],
            "steps": [
                {
                    "step_name": "login",
                    "step_count": 5 + tick,
                    "step_failure": 0,
                    "step_response_time": [jitter(120), jitter(180)],
                    "step_bytes_in": 2048 + tick * 16,
                    "step_bytes_out": 512
                },
                {
                    "step_name": "browse",
                    "step_count": 5 + tick,
                    "step_failure": tick / 9,
                    "step_response_time": [jitter(300)],
                    "step_bytes_in": 8192,
                    "step_bytes_out": 1024
                }
            ]
        },
        {
            "vu_id": 2,
            "ts_exec_count": 9 + tick,
            "ts_exec_failure": 0,
            "ts_exec_time": [jitter(170)],
            "steps": [
                {
                    "step_name": "login",
                    "step_count": 4 + tick,
                    "step_failure": 0,
                    "step_response_time": [jitter(140)],
                    "step_bytes_in": 1024,
                    "step_bytes_out": 256
                }
            ]
        }
    ])
}
