pub mod parse;

use std::collections::HashMap;

use serde::Deserialize;

/// Marker that prefixes every telemetry payload in the CKB log.
pub const MARKER: &str = "ckb-metrics";

/// A single telemetry event embedded in a CKB log line.
///
/// Built once per matching line and moved through the dispatcher to the
/// aggregation worker, which drops it after routing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricRecord {
    /// Subsystem that emitted the event (e.g. "propagation").
    pub topic: String,

    /// Dimensional labels attached to the event.
    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// Named numeric observations carried by the event.
    #[serde(default)]
    pub fields: HashMap<String, u64>,
}

impl MetricRecord {
    /// Returns the tag value for `key`, if present.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Returns the field value for `name`, if present.
    pub fn field(&self, name: &str) -> Option<u64> {
        self.fields.get(name).copied()
    }
}
