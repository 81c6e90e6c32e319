use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;

use vudash_core::agg;
use vudash_core::history::ChartHistory;
use vudash_core::poller::{EventFn, PollEvent, RunStatus};
use vudash_core::report::VuReport;
use vudash_core::thresholds::{self, ThresholdViolation};
use vudash_core::token::{Threshold, Token};
use vudash_store::{Snapshot, SnapshotStore, TokenRegistry};

/// In-memory hub for everything the presentation layer reads: latest data,
/// chart histories and stop times per dashboard, plus a broadcast channel
/// fanning live updates out to websocket clients.
///
/// Histories live in one map keyed by dashboard id, so switching the active
/// dashboard never cross-contaminates series, and every update happens under
/// one write lock so a reader in the same tick never sees a half-applied
/// batch.
pub struct Monitor {
    inner: RwLock<MonitorState>,
    tx: broadcast::Sender<String>,
}

#[derive(Default)]
struct MonitorState {
    data: BTreeMap<String, Vec<VuReport>>,
    histories: BTreeMap<String, ChartHistory>,
    stop_times: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsMessage {
    Snapshot {
        snapshot: Snapshot,
    },
    Update {
        dashboard: String,
        timestamp: u64,
        row: TickRow,
    },
    Stopped {
        dashboard: String,
        stop_time: String,
    },
}

/// One websocket row per polling tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickRow {
    pub vus: usize,
    pub exec_total: u64,
    pub exec_failures: u64,
    pub mean_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub bytes_in_mb: f64,
    pub bytes_out_mb: f64,
    pub violations: Vec<ThresholdViolation>,
}

/// Table-shaped aggregates for one dashboard, served by `/api/summary/{id}`.
#[derive(Debug, Serialize)]
pub struct DashboardSummary {
    pub status: RunStatus,
    pub stop_time: Option<String>,
    pub vus: Vec<VuRow>,
    pub steps: Vec<StepRow>,
}

#[derive(Debug, Serialize)]
pub struct VuRow {
    pub vu_id: u64,
    pub ts_exec_count: u64,
    pub ts_exec_failure: u64,
    pub avg_exec_ms: String,
    pub step_exec_count: u64,
}

#[derive(Debug, Serialize)]
pub struct StepRow {
    pub step_name: String,
    pub step_count: u64,
    pub step_failure: u64,
    /// Average of per-VU averages, not the flat mean.
    pub avg_response_ms: String,
    /// P95 over the flat concatenated samples.
    pub p95_ms: String,
    pub bytes_in_mb: f64,
    pub bytes_out_mb: f64,
}

impl Monitor {
    /// Seeds the monitor from the last persisted snapshot so a server
    /// restart (with `--keep-data`) picks up where it left off.
    pub fn restore(snapshot: Snapshot) -> Self {
        let (tx, _rx) = broadcast::channel::<String>(1024);
        Self {
            inner: RwLock::new(MonitorState {
                data: snapshot.dashboard_data,
                histories: snapshot.chart_histories,
                stop_times: snapshot.dashboard_stop_times,
            }),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn status(&self, token: &Token) -> RunStatus {
        if !token.is_running() {
            return RunStatus::Stopped;
        }
        let state = self.read();
        if state.stop_times.contains_key(&token.id) {
            RunStatus::Stopped
        } else {
            RunStatus::Running
        }
    }

    /// The event sink handed to a freshly spawned poller for `token`.
    pub fn event_fn(
        self: Arc<Self>,
        token: &Token,
        registry: Arc<TokenRegistry>,
        snapshots: Arc<SnapshotStore>,
    ) -> EventFn {
        let monitor = self;
        let id = token.id.clone();
        let thresholds: Vec<Threshold> = token.thresholds().to_vec();

        Arc::new(move |event| match event {
            PollEvent::Tick {
                reports,
                timestamp_ms,
            } => monitor.on_tick(&id, reports, timestamp_ms, &thresholds),
            PollEvent::Stalled { stop_time } => {
                monitor.on_stalled(&id, &stop_time, &registry, &snapshots);
            }
        })
    }

    fn on_tick(
        &self,
        id: &str,
        reports: Vec<VuReport>,
        timestamp_ms: u64,
        thresholds: &[Threshold],
    ) {
        let summary = agg::summarize(&reports);
        let violations = thresholds::evaluate(thresholds, &summary);
        for v in &violations {
            tracing::warn!(
                dashboard = id,
                metric = %v.metric,
                observed = ?v.observed,
                expected = v.expected,
                "threshold violated"
            );
        }

        let row = TickRow {
            vus: summary.vus,
            exec_total: summary.exec_total,
            exec_failures: summary.exec_failures,
            mean_latency_ms: summary.mean_latency_ns.map(agg::ns_to_ms),
            p95_latency_ms: summary.p95_latency_ns.map(agg::ns_to_ms),
            bytes_in_mb: agg::bytes_to_mb(summary.bytes_in_total),
            bytes_out_mb: agg::bytes_to_mb(summary.bytes_out_total),
            violations,
        };

        {
            let mut state = self.write();
            state
                .histories
                .entry(id.to_string())
                .or_default()
                .record_batch(timestamp_ms, &reports);
            state.data.insert(id.to_string(), reports);
        }

        self.broadcast(&WsMessage::Update {
            dashboard: id.to_string(),
            timestamp: timestamp_ms,
            row,
        });
    }

    fn on_stalled(
        &self,
        id: &str,
        stop_time: &str,
        registry: &TokenRegistry,
        snapshots: &SnapshotStore,
    ) {
        {
            let mut state = self.write();
            if state.stop_times.contains_key(id) {
                // Already stalled once; the stop time is frozen.
                return;
            }
            state
                .stop_times
                .insert(id.to_string(), stop_time.to_string());
        }

        if let Err(err) = registry.set_end_at(id, stop_time) {
            tracing::error!(dashboard = id, error = %err, "failed to record stop time on token");
        }

        // One snapshot write covering every dashboard known so far.
        let snapshot = self.snapshot();
        if let Err(err) = snapshots.write(&snapshot) {
            tracing::error!(dashboard = id, error = %err, "failed to persist final snapshot");
        }

        self.broadcast(&WsMessage::Stopped {
            dashboard: id.to_string(),
            stop_time: stop_time.to_string(),
        });
    }

    /// Replaces the whole in-memory state with a client-pushed snapshot.
    pub fn replace(&self, snapshot: Snapshot) {
        let mut state = self.write();
        state.data = snapshot.dashboard_data;
        state.histories = snapshot.chart_histories;
        state.stop_times = snapshot.dashboard_stop_times;
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.read();
        Snapshot {
            dashboard_data: state.data.clone(),
            chart_histories: state.histories.clone(),
            dashboard_stop_times: state.stop_times.clone(),
        }
    }

    pub fn snapshot_message_json(&self) -> String {
        serde_json::to_string(&WsMessage::Snapshot {
            snapshot: self.snapshot(),
        })
        .unwrap_or_else(|_| r#"{"type":"snapshot","snapshot":{}}"#.to_string())
    }

    pub fn summary(&self, token: &Token) -> DashboardSummary {
        let status = self.status(token);
        let state = self.read();
        let reports = state.data.get(&token.id).cloned().unwrap_or_default();
        let stop_time = state.stop_times.get(&token.id).cloned();
        drop(state);

        let vus = reports
            .iter()
            .map(|vu| VuRow {
                vu_id: vu.vu_id,
                ts_exec_count: vu.ts_exec_count,
                ts_exec_failure: vu.ts_exec_failure,
                avg_exec_ms: agg::fmt_ms(agg::mean(&vu.ts_exec_time)),
                step_exec_count: vu
                    .steps
                    .iter()
                    .fold(0u64, |sum, s| sum.saturating_add(s.step_count)),
            })
            .collect();

        let steps = agg::aggregate_steps(&reports)
            .into_iter()
            .map(|step| StepRow {
                avg_response_ms: agg::fmt_ms(step.mean_of_vu_means()),
                p95_ms: agg::fmt_ms(step.p95()),
                bytes_in_mb: agg::bytes_to_mb(step.step_bytes_in),
                bytes_out_mb: agg::bytes_to_mb(step.step_bytes_out),
                step_name: step.step_name,
                step_count: step.step_count,
                step_failure: step.step_failure,
            })
            .collect();

        DashboardSummary {
            status,
            stop_time,
            vus,
            steps,
        }
    }

    fn broadcast(&self, message: &WsMessage) {
        let Ok(text) = serde_json::to_string(message) else {
            return;
        };
        let _ = self.tx.send(text);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MonitorState> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MonitorState> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
