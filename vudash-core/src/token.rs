use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Sentinel `end_at` value for a run that is still active.
pub const STILL_RUNNING: &str = "0s";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadStage {
    #[serde(rename = "Target")]
    pub target: u64,

    #[serde(rename = "Duration")]
    pub duration: String,
}

/// Alert threshold carried on a token, e.g.
/// `{ "Metric": "avg_latency_ms", "Condition": "<", "Severity": "critical", "Value": 200 }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    #[serde(rename = "Metric")]
    pub metric: String,

    #[serde(rename = "Condition")]
    pub condition: String,

    #[serde(rename = "Severity", default)]
    pub severity: String,

    #[serde(rename = "Value")]
    pub value: f64,
}

/// Load profile registered alongside a token. The capitalized wire names are
/// what external load tools post; keep them stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadOptions {
    #[serde(rename = "Profile", default)]
    pub profile: String,

    #[serde(rename = "VUs", default)]
    pub vus: u64,

    #[serde(rename = "Duration", default)]
    pub duration: String,

    #[serde(rename = "RPS", default)]
    pub rps: u64,

    #[serde(rename = "Stages", default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<LoadStage>>,

    #[serde(
        rename = "Thresholds",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub thresholds: Option<Vec<Threshold>>,
}

/// A registered load-test run: the registry owns these; the poll loop only
/// ever reads them. `end_at` starts as `"0s"` and is written exactly once
/// when polling gives the run up for dead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub title: String,
    pub url: String,

    /// Creation timestamp as posted by the load tool (RFC 3339).
    #[serde(default)]
    pub time: String,

    #[serde(default)]
    pub description: String,

    #[serde(rename = "loadOptions", default)]
    pub load_options: LoadOptions,

    #[serde(default = "default_end_at")]
    pub end_at: String,
}

fn default_end_at() -> String {
    STILL_RUNNING.to_string()
}

impl Token {
    pub fn is_running(&self) -> bool {
        self.end_at == STILL_RUNNING
    }

    /// Parses the creation timestamp; `None` when absent or unparseable,
    /// in which case the poller falls back to its own start instant.
    pub fn created_at(&self) -> Option<SystemTime> {
        let raw = self.time.trim();
        if raw.is_empty() {
            return None;
        }
        humantime::parse_rfc3339(raw)
            .or_else(|_| humantime::parse_rfc3339_weak(raw))
            .ok()
    }

    pub fn thresholds(&self) -> &[Threshold] {
        self.load_options.thresholds.as_deref().unwrap_or(&[])
    }
}
