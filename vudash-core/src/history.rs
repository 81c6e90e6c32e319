use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agg;
use crate::report::VuReport;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: u64,
    pub value: f64,
}

/// Overall series points keep the original `avg_latency` field name so the
/// persisted snapshot stays byte-compatible with what the browser wrote.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverallPoint {
    pub timestamp: u64,
    pub avg_latency: f64,
}

/// Append-only time series for one dashboard: one overall latency series,
/// one per step name, one per VU id. Never truncated or compacted; the
/// buffers grow for the lifetime of the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartHistory {
    #[serde(default)]
    pub overall: Vec<OverallPoint>,

    #[serde(default, rename = "perStep")]
    pub per_step: BTreeMap<String, Vec<HistoryPoint>>,

    #[serde(default, rename = "perVU")]
    pub per_vu: BTreeMap<String, Vec<HistoryPoint>>,
}

impl ChartHistory {
    /// Appends exactly one point to `overall` and one per distinct step name
    /// and VU id observed in the batch. An empty batch appends nothing.
    ///
    /// All chart values are flat means over the relevant concatenated sample
    /// set, converted to milliseconds here because these points are
    /// presentation output, not aggregation input.
    pub fn record_batch(&mut self, timestamp: u64, reports: &[VuReport]) {
        if reports.is_empty() {
            return;
        }

        let avg_latency = agg::overall_mean(reports)
            .map(agg::ns_to_ms)
            .unwrap_or(0.0);
        self.overall.push(OverallPoint {
            timestamp,
            avg_latency,
        });

        for step in agg::aggregate_steps(reports) {
            let value = agg::mean(&step.samples).map(agg::ns_to_ms).unwrap_or(0.0);
            self.per_step
                .entry(step.step_name)
                .or_default()
                .push(HistoryPoint { timestamp, value });
        }

        for vu in reports {
            let samples: Vec<f64> = vu
                .steps
                .iter()
                .flat_map(|s| s.step_response_time.iter().copied())
                .collect();
            let value = agg::mean(&samples).map(agg::ns_to_ms).unwrap_or(0.0);
            self.per_vu
                .entry(vu.vu_id.to_string())
                .or_default()
                .push(HistoryPoint { timestamp, value });
        }
    }
}
