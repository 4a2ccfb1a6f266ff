//! Telemetry extraction from raw log lines.
//!
//! Most lines the node writes are ordinary log output. Those are rejected by a
//! single substring search and never allocate; only lines carrying the marker
//! are handed to `serde_json`.

use thiserror::Error;

use super::{MetricRecord, MARKER};

/// Errors that can occur while extracting a record from a marked line.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("malformed metric payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("metric record has an empty topic")]
    EmptyTopic,
}

/// Extract a [`MetricRecord`] from a log line.
///
/// Returns `Ok(None)` when the line does not carry the marker.
pub fn extract_record(line: &str) -> Result<Option<MetricRecord>, ExtractError> {
    let Some(payload) = payload(line) else {
        return Ok(None);
    };

    let record: MetricRecord = serde_json::from_str(payload)?;
    if record.topic.trim().is_empty() {
        return Err(ExtractError::EmptyTopic);
    }

    Ok(Some(record))
}

/// Returns the trimmed payload following the marker, if any.
fn payload(line: &str) -> Option<&str> {
    let index = line.find(MARKER)?;
    let rest = line[index + MARKER.len()..].trim_start();
    let rest = rest.strip_prefix(':').unwrap_or(rest);
    Some(rest.trim())
}
