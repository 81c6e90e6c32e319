use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::elapsed::format_elapsed;
use crate::report::{self, ParsedBatch, VuReport};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_STALL_THRESHOLD: u32 = 3;

/// Explicit per-dashboard run state, persisted alongside the data instead of
/// being inferred from whether a timer happens to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum RunStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub url: String,
    pub interval: Duration,
    pub stall_threshold: u32,
}

#[derive(Debug, Clone)]
pub enum PollEvent {
    /// A tick that produced at least one valid VU report.
    Tick {
        reports: Vec<VuReport>,
        timestamp_ms: u64,
    },

    /// The stall threshold was reached; emitted exactly once, then the
    /// poller exits.
    Stalled { stop_time: String },
}

pub type EventFn = Arc<dyn Fn(PollEvent) + Send + Sync>;

pub type Result<T> = std::result::Result<T, FetchError>;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("metrics request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Parse(#[from] report::Error),
}

/// The poll-and-detect-stall loop for one dashboard.
///
/// One poller is live per process at a time; selecting another dashboard
/// cancels this one. Cancellation does not abort an in-flight fetch, so the
/// loop re-checks the live flag after every await and discards late
/// responses instead of applying them.
pub struct Poller {
    live: Arc<AtomicBool>,
    cancel_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Poller {
    pub fn spawn(
        client: reqwest::Client,
        config: PollerConfig,
        created_at: Option<SystemTime>,
        events: EventFn,
    ) -> Self {
        let live = Arc::new(AtomicBool::new(true));
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(poll_loop(
            client,
            config,
            created_at,
            events,
            live.clone(),
            cancel_rx,
        ));

        Self {
            live,
            cancel_tx: Some(cancel_tx),
            task,
        }
    }

    /// Stops the loop and marks any in-flight fetch as stale.
    pub fn cancel(&mut self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }

    pub async fn shutdown(mut self) {
        self.cancel();
        let _ = self.task.await;
    }
}

async fn poll_loop(
    client: reqwest::Client,
    config: PollerConfig,
    created_at: Option<SystemTime>,
    events: EventFn,
    live: Arc<AtomicBool>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let started = Instant::now();
    // `tokio::time::interval` panics on a zero period.
    let period = config.interval.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = &mut cancel_rx => break,
            _ = interval.tick() => {}
        }

        // Raced against cancellation so shutdown never waits out a fetch
        // against an endpoint that accepted the connection but will never
        // answer.
        let outcome = tokio::select! {
            _ = &mut cancel_rx => break,
            outcome = fetch_batch(&client, &config.url) => outcome,
        };
        if !live.load(Ordering::SeqCst) {
            // The dashboard was switched away while this fetch was in
            // flight; the response is no longer relevant.
            break;
        }

        match outcome {
            Ok(batch) if !batch.accepted.is_empty() => {
                failures = 0;
                for rejected in &batch.rejected {
                    tracing::debug!(
                        index = rejected.index,
                        reason = %rejected.reason,
                        "dropping malformed vu report"
                    );
                }
                events(PollEvent::Tick {
                    reports: batch.accepted,
                    timestamp_ms: unix_millis(),
                });
            }
            Ok(_) => {
                failures += 1;
                tracing::debug!(failures, url = %config.url, "poll returned no usable reports");
            }
            Err(err) => {
                failures += 1;
                tracing::debug!(failures, url = %config.url, error = %err, "poll failed");
            }
        }

        if failures >= config.stall_threshold {
            let elapsed = created_at
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .unwrap_or_else(|| started.elapsed());
            // "0s" is the still-running sentinel, so a stall inside the
            // first second still reports at least one second.
            let stop_time = format_elapsed(elapsed.max(Duration::from_secs(1)));
            tracing::info!(%stop_time, url = %config.url, "run appears stopped, giving up polling");
            events(PollEvent::Stalled { stop_time });
            break;
        }
    }
}

async fn fetch_batch(client: &reqwest::Client, url: &str) -> Result<ParsedBatch> {
    let response = client.get(url).send().await?.error_for_status()?;
    let body = response.text().await?;
    Ok(report::parse_batch(&body)?)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
