use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("metrics body is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("metrics body is not a json array")]
    NotAnArray,
}

/// One named step's summary within a VU report, as produced by the external
/// load tool. Latencies are nanoseconds; conversion to milliseconds happens
/// only at presentation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    #[serde(default)]
    pub step_name: String,

    #[serde(default, deserialize_with = "lenient_u64")]
    pub step_count: u64,

    #[serde(default, deserialize_with = "lenient_u64")]
    pub step_failure: u64,

    #[serde(default, deserialize_with = "lenient_samples")]
    pub step_response_time: Vec<f64>,

    #[serde(default, deserialize_with = "lenient_u64")]
    pub step_bytes_in: u64,

    #[serde(default, deserialize_with = "lenient_u64")]
    pub step_bytes_out: u64,
}

/// One virtual user's execution summary for a polling tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VuReport {
    #[serde(default, deserialize_with = "lenient_u64")]
    pub vu_id: u64,

    #[serde(default, deserialize_with = "lenient_u64")]
    pub ts_exec_count: u64,

    #[serde(default, deserialize_with = "lenient_u64")]
    pub ts_exec_failure: u64,

    #[serde(default, deserialize_with = "lenient_samples")]
    pub ts_exec_time: Vec<f64>,

    #[serde(default, deserialize_with = "lenient_steps")]
    pub steps: Vec<StepReport>,
}

/// An array item that did not validate as a VU report, with the reason it
/// was dropped so callers can log it instead of discarding it invisibly.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedReport {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBatch {
    pub accepted: Vec<VuReport>,
    pub rejected: Vec<RejectedReport>,
}

/// Permissive parse of a metrics response body.
///
/// The body must be a JSON array; items that are not objects or lack a
/// numeric `vu_id` are rejected (with a reason), never fatal. Within an
/// accepted item, missing or non-numeric counts/bytes degrade to zero and
/// non-numeric latency entries are skipped.
pub fn parse_batch(body: &str) -> Result<ParsedBatch> {
    let value: Value = serde_json::from_str(body)?;
    let Value::Array(items) = value else {
        return Err(Error::NotAnArray);
    };

    let mut batch = ParsedBatch::default();
    for (index, item) in items.into_iter().enumerate() {
        if !item.is_object() {
            batch.rejected.push(RejectedReport {
                index,
                reason: "not a json object".to_string(),
            });
            continue;
        }
        if !item.get("vu_id").is_some_and(Value::is_number) {
            batch.rejected.push(RejectedReport {
                index,
                reason: "missing or non-numeric vu_id".to_string(),
            });
            continue;
        }

        match serde_json::from_value::<VuReport>(item) {
            Ok(report) => batch.accepted.push(report),
            Err(err) => batch.rejected.push(RejectedReport {
                index,
                reason: err.to_string(),
            }),
        }
    }

    Ok(batch)
}

fn number_as_u64(value: &Value) -> u64 {
    let Value::Number(n) = value else {
        return 0;
    };
    if let Some(v) = n.as_u64() {
        return v;
    }
    // Negative or fractional numbers degrade rather than error out.
    n.as_f64()
        .filter(|f| f.is_finite() && *f > 0.0)
        .map_or(0, |f| f as u64)
}

fn lenient_u64<'de, D>(de: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(de)?;
    Ok(number_as_u64(&value))
}

fn lenient_samples<'de, D>(de: D) -> std::result::Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(de)?;
    let Value::Array(items) = value else {
        return Ok(Vec::new());
    };
    Ok(items
        .iter()
        .filter_map(Value::as_f64)
        .filter(|f| f.is_finite())
        .collect())
}

fn lenient_steps<'de, D>(de: D) -> std::result::Result<Vec<StepReport>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(de)?;
    let Value::Array(items) = value else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}
