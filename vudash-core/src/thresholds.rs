use serde::Serialize;

use crate::agg::{TickSummary, ns_to_ms};
use crate::token::Threshold;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdMetric {
    AvgLatencyMs,
    P95LatencyMs,
    ErrorRate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdViolation {
    pub metric: String,
    pub condition: String,
    pub severity: String,
    pub expected: f64,
    pub observed: Option<f64>,
}

pub fn parse_op(raw: &str) -> Result<ThresholdOp, String> {
    match raw.trim() {
        "<" => Ok(ThresholdOp::Lt),
        "<=" => Ok(ThresholdOp::Lte),
        ">" => Ok(ThresholdOp::Gt),
        ">=" => Ok(ThresholdOp::Gte),
        other => Err(format!(
            "unknown threshold condition `{other}` (expected <, <=, >, >=)"
        )),
    }
}

pub fn parse_metric(raw: &str) -> Result<ThresholdMetric, String> {
    match raw.trim() {
        "avg_latency_ms" => Ok(ThresholdMetric::AvgLatencyMs),
        "p95_latency_ms" => Ok(ThresholdMetric::P95LatencyMs),
        "error_rate" => Ok(ThresholdMetric::ErrorRate),
        other => Err(format!("unknown threshold metric `{other}`")),
    }
}

fn observed_value(metric: ThresholdMetric, summary: &TickSummary) -> Option<f64> {
    match metric {
        ThresholdMetric::AvgLatencyMs => summary.mean_latency_ns.map(ns_to_ms),
        ThresholdMetric::P95LatencyMs => summary.p95_latency_ns.map(ns_to_ms),
        ThresholdMetric::ErrorRate => Some(summary.error_rate()),
    }
}

fn compare(observed: f64, op: ThresholdOp, expected: f64) -> bool {
    match op {
        ThresholdOp::Lt => observed < expected,
        ThresholdOp::Lte => observed <= expected,
        ThresholdOp::Gt => observed > expected,
        ThresholdOp::Gte => observed >= expected,
    }
}

/// Evaluates a token's alert thresholds against one tick's summary.
///
/// A threshold passes when its condition holds; a missing observed value
/// (no-data tick) fails it. Malformed metric/condition strings become
/// violations with a logged reason rather than errors, so a badly registered
/// token cannot break the polling loop.
pub fn evaluate(thresholds: &[Threshold], summary: &TickSummary) -> Vec<ThresholdViolation> {
    let mut out = Vec::new();

    for t in thresholds {
        let violation = ThresholdViolation {
            metric: t.metric.clone(),
            condition: t.condition.clone(),
            severity: t.severity.clone(),
            expected: t.value,
            observed: None,
        };

        let metric = match parse_metric(&t.metric) {
            Ok(v) => v,
            Err(reason) => {
                tracing::debug!(%reason, "skipping unevaluable threshold");
                out.push(violation);
                continue;
            }
        };
        let op = match parse_op(&t.condition) {
            Ok(v) => v,
            Err(reason) => {
                tracing::debug!(%reason, "skipping unevaluable threshold");
                out.push(violation);
                continue;
            }
        };

        let observed = observed_value(metric, summary);
        let passed = observed.is_some_and(|v| compare(v, op, t.value));
        if !passed {
            out.push(ThresholdViolation {
                observed,
                ..violation
            });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(metric: &str, condition: &str, value: f64) -> Threshold {
        Threshold {
            metric: metric.to_string(),
            condition: condition.to_string(),
            severity: "warn".to_string(),
            value,
        }
    }

    fn summary_with_latency(mean_ns: f64, p95_ns: f64) -> TickSummary {
        TickSummary {
            mean_latency_ns: Some(mean_ns),
            p95_latency_ns: Some(p95_ns),
            step_count_total: 10,
            step_failure_total: 1,
            ..TickSummary::default()
        }
    }

    #[test]
    fn passing_thresholds_produce_no_violations() {
        let summary = summary_with_latency(2_000_000.0, 5_000_000.0);
        let thresholds = vec![
            threshold("avg_latency_ms", "<", 3.0),
            threshold("p95_latency_ms", "<=", 5.0),
            threshold("error_rate", "<", 0.2),
        ];
        assert!(evaluate(&thresholds, &summary).is_empty());
    }

    #[test]
    fn failing_threshold_reports_observed_value() {
        let summary = summary_with_latency(4_000_000.0, 5_000_000.0);
        let violations = evaluate(&[threshold("avg_latency_ms", "<", 3.0)], &summary);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].observed, Some(4.0));
        assert_eq!(violations[0].expected, 3.0);
    }

    #[test]
    fn no_data_fails_latency_thresholds() {
        let summary = TickSummary::default();
        let violations = evaluate(&[threshold("p95_latency_ms", "<", 100.0)], &summary);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].observed, None);
    }

    #[test]
    fn malformed_thresholds_never_panic() {
        let summary = summary_with_latency(1.0, 1.0);
        let thresholds = vec![
            threshold("made_up_metric", "<", 1.0),
            threshold("avg_latency_ms", "~=", 1.0),
        ];
        let violations = evaluate(&thresholds, &summary);
        assert_eq!(violations.len(), 2);
    }
}
