use std::collections::HashMap;

use crate::report::VuReport;

/// Latencies arrive in nanoseconds and stay in nanoseconds through every
/// aggregation pass; division happens once, at the point of presentation.
pub const NS_PER_MS: f64 = 1_000_000.0;
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// 95th percentile via sort-and-index: `floor(0.95 * (n - 1))`.
pub fn p95(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = (0.95 * (sorted.len() - 1) as f64).floor() as usize;
    sorted.get(idx).copied()
}

pub fn ns_to_ms(ns: f64) -> f64 {
    ns / NS_PER_MS
}

/// Presentation form of a latency value: milliseconds to two decimal places,
/// `"-"` for the no-data sentinel.
pub fn fmt_ms(ns: Option<f64>) -> String {
    match ns {
        Some(v) => format!("{:.2}", ns_to_ms(v)),
        None => "-".to_string(),
    }
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Every latency sample across all steps of all VUs, concatenated.
pub fn flatten_latencies(reports: &[VuReport]) -> Vec<f64> {
    reports
        .iter()
        .flat_map(|vu| vu.steps.iter())
        .flat_map(|step| step.step_response_time.iter().copied())
        .collect()
}

pub fn overall_mean(reports: &[VuReport]) -> Option<f64> {
    mean(&flatten_latencies(reports))
}

/// Cross-VU aggregate for one step name.
///
/// Counts and bytes are summed. The flat concatenated sample list feeds P95;
/// the per-VU means feed the table's "average of per-VU averages". The two
/// deliberately disagree: the mean weights each VU equally, P95 weights each
/// sample equally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedStep {
    pub step_name: String,
    pub step_count: u64,
    pub step_failure: u64,
    pub step_bytes_in: u64,
    pub step_bytes_out: u64,
    pub samples: Vec<f64>,
    pub vu_means: Vec<f64>,
}

impl AggregatedStep {
    pub fn mean_of_vu_means(&self) -> Option<f64> {
        mean(&self.vu_means)
    }

    pub fn p95(&self) -> Option<f64> {
        p95(&self.samples)
    }
}

/// Groups steps by name across all VUs, in first-appearance order.
/// Steps with an empty name are skipped (the name is the grouping key).
pub fn aggregate_steps(reports: &[VuReport]) -> Vec<AggregatedStep> {
    let mut out: Vec<AggregatedStep> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for vu in reports {
        for step in &vu.steps {
            if step.step_name.is_empty() {
                continue;
            }
            let slot = match index.get(&step.step_name) {
                Some(&i) => i,
                None => {
                    index.insert(step.step_name.clone(), out.len());
                    out.push(AggregatedStep {
                        step_name: step.step_name.clone(),
                        ..AggregatedStep::default()
                    });
                    out.len() - 1
                }
            };

            let agg = &mut out[slot];
            agg.step_count = agg.step_count.saturating_add(step.step_count);
            agg.step_failure = agg.step_failure.saturating_add(step.step_failure);
            agg.step_bytes_in = agg.step_bytes_in.saturating_add(step.step_bytes_in);
            agg.step_bytes_out = agg.step_bytes_out.saturating_add(step.step_bytes_out);
            agg.samples.extend_from_slice(&step.step_response_time);
            if let Some(vu_mean) = mean(&step.step_response_time) {
                agg.vu_means.push(vu_mean);
            }
        }
    }

    out
}

/// Whole-batch roll-up for one polling tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub vus: usize,
    pub exec_total: u64,
    pub exec_failures: u64,
    pub step_count_total: u64,
    pub step_failure_total: u64,
    pub bytes_in_total: u64,
    pub bytes_out_total: u64,
    pub mean_latency_ns: Option<f64>,
    pub p95_latency_ns: Option<f64>,
}

impl TickSummary {
    /// Step failures over step executions, 0.0 when nothing ran.
    pub fn error_rate(&self) -> f64 {
        if self.step_count_total == 0 {
            return 0.0;
        }
        self.step_failure_total as f64 / self.step_count_total as f64
    }
}

pub fn summarize(reports: &[VuReport]) -> TickSummary {
    let mut summary = TickSummary {
        vus: reports.len(),
        ..TickSummary::default()
    };

    for vu in reports {
        summary.exec_total = summary.exec_total.saturating_add(vu.ts_exec_count);
        summary.exec_failures = summary.exec_failures.saturating_add(vu.ts_exec_failure);
        for step in &vu.steps {
            summary.step_count_total = summary.step_count_total.saturating_add(step.step_count);
            summary.step_failure_total =
                summary.step_failure_total.saturating_add(step.step_failure);
            summary.bytes_in_total = summary.bytes_in_total.saturating_add(step.step_bytes_in);
            summary.bytes_out_total = summary.bytes_out_total.saturating_add(step.step_bytes_out);
        }
    }

    let samples = flatten_latencies(reports);
    summary.mean_latency_ns = mean(&samples);
    summary.p95_latency_ns = p95(&samples);
    summary
}
