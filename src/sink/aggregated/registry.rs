//! Lazily-materialized telemetry instruments.
//!
//! Each distinct `(topic, field)` pair seen in the log gets one
//! [`InstrumentSet`], registered on first sight and kept for the life of the
//! process. Growth is unbounded in principle but bounded in practice by the
//! fixed set of topics and fields the node emits.

use std::collections::HashMap;
use std::fmt::Write;

use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Opts, Registry};

use crate::config::InstrumentsConfig;
use crate::record::MetricRecord;

/// Key identifying one exported instrument set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrumentIdentity<'a> {
    pub topic: &'a str,
    pub field: &'a str,
}

/// Instruments exported for one identity. Which members exist is fixed by
/// configuration, never by the data.
#[derive(Clone)]
pub struct InstrumentSet {
    counter: Option<Counter>,
    gauge: Option<Gauge>,
    histogram: Option<Histogram>,
}

impl InstrumentSet {
    /// Creates the enabled instruments and registers them with `registry`.
    ///
    /// Naming, with components passed through [`encode_component`]:
    /// - counter: `{ns}_{topic}__{field}__total`
    /// - gauge: `{ns}_{topic}__{field}`
    /// - histogram: `{ns}_{topic}__{field}__distribution`
    fn register(
        registry: &Registry,
        namespace: &str,
        cfg: &InstrumentsConfig,
        id: InstrumentIdentity<'_>,
        tags: &HashMap<String, String>,
    ) -> Result<Self, prometheus::Error> {
        let stem = format!(
            "{namespace}_{}__{}",
            encode_component(id.topic),
            encode_component(id.field)
        );
        let labels = const_labels(tags);
        let help = format!("Field {} reported under the {} topic.", id.field, id.topic);

        let opts = |name: String| Opts::new(name, help.clone()).const_labels(labels.clone());

        let counter = if cfg.counter {
            let counter = Counter::with_opts(opts(format!("{stem}__total")))?;
            registry.register(Box::new(counter.clone()))?;
            Some(counter)
        } else {
            None
        };

        let gauge = if cfg.gauge {
            let gauge = Gauge::with_opts(opts(stem.clone()))?;
            registry.register(Box::new(gauge.clone()))?;
            Some(gauge)
        } else {
            None
        };

        let histogram = if cfg.histogram {
            let histogram = Histogram::with_opts(
                HistogramOpts::from(opts(format!("{stem}__distribution")))
                    .buckets(cfg.histogram_buckets.clone()),
            )?;
            registry.register(Box::new(histogram.clone()))?;
            Some(histogram)
        } else {
            None
        };

        Ok(Self {
            counter,
            gauge,
            histogram,
        })
    }

    /// Route one observation to every populated instrument.
    pub fn update(&self, value: u64) {
        let value = value as f64;
        if let Some(counter) = &self.counter {
            counter.inc_by(value);
        }
        if let Some(gauge) = &self.gauge {
            gauge.set(value);
        }
        if let Some(histogram) = &self.histogram {
            histogram.observe(value);
        }
    }

    #[cfg(test)]
    pub(crate) fn counter(&self) -> Option<&Counter> {
        self.counter.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn gauge(&self) -> Option<&Gauge> {
        self.gauge.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn histogram(&self) -> Option<&Histogram> {
        self.histogram.as_ref()
    }
}

/// Maps instrument identities to their exported instruments.
///
/// Only ever touched by the aggregation worker, so it carries no locks.
pub struct InstrumentRegistry {
    registry: Registry,
    namespace: String,
    cfg: InstrumentsConfig,
    /// topic -> field -> instruments. Nested so lookups borrow `&str` keys.
    sets: HashMap<String, HashMap<String, InstrumentSet>>,
    len: usize,
}

impl InstrumentRegistry {
    pub fn new(registry: Registry, namespace: &str, cfg: InstrumentsConfig) -> Self {
        Self {
            registry,
            namespace: namespace.to_string(),
            cfg,
            sets: HashMap::new(),
            len: 0,
        }
    }

    /// Route `value` to the instruments for `id`, creating them first if this
    /// identity has not been seen.
    ///
    /// Tags are bound only at creation: later records with different tags
    /// update the same instruments without relabeling them. Returns whether
    /// the instruments were created by this call. A registration error means
    /// two identities derived the same series name.
    pub fn ensure_and_update(
        &mut self,
        id: InstrumentIdentity<'_>,
        tags: &HashMap<String, String>,
        value: u64,
    ) -> Result<bool, prometheus::Error> {
        if let Some(set) = self.get(id) {
            set.update(value);
            return Ok(false);
        }

        let set = InstrumentSet::register(&self.registry, &self.namespace, &self.cfg, id, tags)?;
        set.update(value);
        self.sets
            .entry(id.topic.to_string())
            .or_default()
            .insert(id.field.to_string(), set);
        self.len += 1;

        Ok(true)
    }

    /// Route every field of `record`. Returns the number of instrument sets
    /// created.
    pub fn record(&mut self, record: &MetricRecord) -> Result<usize, prometheus::Error> {
        let mut created = 0;
        for (field, value) in &record.fields {
            let id = InstrumentIdentity {
                topic: &record.topic,
                field,
            };
            if self.ensure_and_update(id, &record.tags, *value)? {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Returns the instruments for `id`, if created.
    pub fn get(&self, id: InstrumentIdentity<'_>) -> Option<&InstrumentSet> {
        self.sets.get(id.topic).and_then(|fields| fields.get(id.field))
    }

    /// Number of instrument sets created so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Converts tags to const labels, sanitizing names and skipping empty keys.
fn const_labels(tags: &HashMap<String, String>) -> HashMap<String, String> {
    tags.iter()
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (sanitize(key), value.clone()))
        .collect()
}

/// Encodes a topic or field as a metric name component.
///
/// ASCII alphanumerics are kept, as is an underscore between two of them
/// unless the next one is `x`. Every other byte becomes `_xHH`. The result
/// never contains `__` and never ends in `_`, so `__` can join components
/// without two identities ever sharing a name.
pub(crate) fn encode_component(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    for (i, &b) in bytes.iter().enumerate() {
        let interior = b == b'_'
            && i > 0
            && bytes[i - 1].is_ascii_alphanumeric()
            && bytes
                .get(i + 1)
                .is_some_and(|next| next.is_ascii_alphanumeric() && *next != b'x');
        if b.is_ascii_alphanumeric() || interior {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "_x{b:02x}");
        }
    }
    out
}

/// Maps a label name onto the Prometheus label alphabet.
pub(crate) fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 1);
    if raw.starts_with(|c: char| c.is_ascii_digit()) {
        out.push('_');
    }
    out.extend(raw.chars().map(|c| {
        if c.is_ascii_alphanumeric() || c == '_' {
            c
        } else {
            '_'
        }
    }));
    out
}
