//! Compact-block propagation percentiles.
//!
//! Every peer that relays a compact block produces one `propagation` record
//! tagged with the block hash and carrying the node's current peer count. The
//! tracker counts records per block and, when a single record pushes the count
//! across `p%` of the peers, observes the time since the block was first seen
//! on the `propagation_<p>` histogram.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use prometheus::{Histogram, HistogramOpts, Registry};
use thiserror::Error;

use crate::config::PropagationConfig;
use crate::record::MetricRecord;

/// Topic routed to the tracker instead of the instrument registry.
pub const PROPAGATION_TOPIC: &str = "propagation";

/// Tag holding the block hash.
pub const BLOCK_TAG: &str = "compact_block";

/// Field holding the peer count the percentiles are taken over.
pub const TOTAL_PEERS_FIELD: &str = "total_peers";

/// Percentiles detected per block.
pub const DEFAULT_PERCENTILES: [u8; 5] = [50, 80, 90, 95, 99];

/// Observations a block needs before its percentiles are evaluated.
///
/// Independent of [`DEFAULT_PERCENTILES`] even though both contain 50.
pub const DEFAULT_MIN_SAMPLES: u64 = 50;

/// Age after which a block's entry is discarded.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Minimum time between pruning sweeps.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Errors produced while tracking a propagation record.
#[derive(Error, Debug)]
pub enum PropagationError {
    #[error("propagation record without a compact_block tag")]
    MissingBlock,

    #[error("propagation record without a total_peers field")]
    MissingTotalPeers,

    #[error("registering propagation histograms: {0}")]
    Registration(#[from] prometheus::Error),
}

impl PropagationError {
    /// Whether the error should stop the aggregation worker.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Registration(_))
    }

    /// Short label used when counting rejected records.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingBlock => "missing_block",
            Self::MissingTotalPeers => "missing_total_peers",
            Self::Registration(_) => "registration",
        }
    }
}

/// A percentile line crossed by one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crossing {
    pub percentile: u8,
    pub elapsed: Duration,
}

/// Accumulation state for one block hash.
#[derive(Debug, Clone, Copy)]
struct PropagationState {
    first_seen: Instant,
    accumulative: u64,
}

struct PercentileHistogram {
    percentile: u8,
    histogram: Histogram,
}

/// Per-block propagation accumulator.
///
/// Owned by the aggregation worker; all methods take `&mut self` and no
/// internal synchronization is used.
pub struct PropagationTracker {
    registry: Registry,
    namespace: String,
    cfg: PropagationConfig,
    /// Created on the first valid propagation record.
    histograms: Option<Vec<PercentileHistogram>>,
    states: HashMap<String, PropagationState>,
    last_prune: Option<Instant>,
}

impl PropagationTracker {
    pub fn new(registry: Registry, namespace: &str, cfg: PropagationConfig) -> Self {
        Self {
            registry,
            namespace: namespace.to_string(),
            cfg,
            histograms: None,
            states: HashMap::new(),
            last_prune: None,
        }
    }

    /// Account one propagation record observed at `now`, returning the
    /// percentile lines it crossed.
    pub fn observe(
        &mut self,
        record: &MetricRecord,
        now: Instant,
    ) -> Result<Vec<Crossing>, PropagationError> {
        let block = record.tag(BLOCK_TAG).ok_or(PropagationError::MissingBlock)?;
        let total_peers = record
            .field(TOTAL_PEERS_FIELD)
            .ok_or(PropagationError::MissingTotalPeers)?;

        if self.histograms.is_none() {
            self.histograms = Some(self.register_histograms()?);
        }

        let state = match self.states.get_mut(block) {
            Some(state) => {
                state.accumulative += 1;
                *state
            }
            None => {
                let state = PropagationState {
                    first_seen: now,
                    accumulative: 1,
                };
                self.states.insert(block.to_string(), state);
                state
            }
        };

        if state.accumulative < self.cfg.min_samples {
            return Ok(Vec::new());
        }

        let before = u128::from(state.accumulative - 1) * 100;
        let after = u128::from(state.accumulative) * 100;
        let elapsed = now.saturating_duration_since(state.first_seen);

        let mut crossings = Vec::new();
        for entry in self.histograms.iter().flatten() {
            let line = u128::from(total_peers) * u128::from(entry.percentile);
            if before < line && line <= after {
                entry.histogram.observe(elapsed.as_secs_f64());
                crossings.push(Crossing {
                    percentile: entry.percentile,
                    elapsed,
                });
            }
        }

        Ok(crossings)
    }

    /// Sweep stale blocks if a full prune interval has passed since the last
    /// sweep. Returns the number of blocks removed.
    pub fn maybe_prune(&mut self, now: Instant) -> usize {
        let Some(last) = self.last_prune else {
            self.last_prune = Some(now);
            return 0;
        };
        if now.saturating_duration_since(last) < self.cfg.prune_interval {
            return 0;
        }

        self.last_prune = Some(now);
        self.prune(now)
    }

    /// Remove every block first seen more than one window before `now`.
    pub fn prune(&mut self, now: Instant) -> usize {
        let window = self.cfg.window;
        let before = self.states.len();
        self.states
            .retain(|_, state| now.saturating_duration_since(state.first_seen) <= window);
        before - self.states.len()
    }

    /// Number of blocks currently tracked.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Observations accumulated for `block`, if tracked.
    pub fn accumulative(&self, block: &str) -> Option<u64> {
        self.states.get(block).map(|state| state.accumulative)
    }

    fn register_histograms(&self) -> Result<Vec<PercentileHistogram>, prometheus::Error> {
        let mut histograms = Vec::with_capacity(self.cfg.percentiles.len());
        for &percentile in &self.cfg.percentiles {
            let histogram = Histogram::with_opts(
                HistogramOpts::new(
                    percentile.to_string(),
                    format!(
                        "Seconds from first sighting of a compact block until {percentile}% of peers relayed it."
                    ),
                )
                .namespace(self.namespace.as_str())
                .subsystem(PROPAGATION_TOPIC)
                .buckets(self.cfg.buckets.clone()),
            )?;
            self.registry.register(Box::new(histogram.clone()))?;
            histograms.push(PercentileHistogram {
                percentile,
                histogram,
            });
        }
        Ok(histograms)
    }
}
