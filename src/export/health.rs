use anyhow::Result;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry,
};

/// Namespace for the explorer's own health series. These names never contain
/// `__`, which every telemetry instrument name does.
const NAMESPACE: &str = "ckb_explorer";

/// Prometheus metrics describing the explorer itself.
///
/// Registered into the same registry as the exported telemetry so a single
/// scrape covers both.
pub struct HealthMetrics {
    /// Lines read per source.
    pub lines_read: CounterVec,
    /// Telemetry records extracted from log lines.
    pub records_extracted: Counter,
    /// Marked lines whose payload failed to parse.
    pub parse_errors: Counter,
    /// Records rejected by the aggregator, by reason.
    pub records_rejected: CounterVec,
    /// Source reopens after rotation, truncation or a read error, per source.
    pub source_reopens: CounterVec,
    /// Failed reads on an open source, per source.
    pub source_read_errors: CounterVec,
    /// Number of telemetry instrument sets created.
    pub instruments: Gauge,
    /// Blocks currently tracked for propagation.
    pub propagation_blocks_tracked: Gauge,
    /// Blocks discarded by the pruning sweep.
    pub propagation_blocks_pruned: Counter,
    /// Percentile crossings detected, by percentile.
    pub propagation_crossings: CounterVec,
    /// Time to route a single record (1us-10ms buckets).
    pub record_processing_duration: Histogram,
}

impl HealthMetrics {
    /// Creates the health metrics and registers them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self> {
        let lines_read = CounterVec::new(
            Opts::new("lines_read_total", "Total log lines read by source.")
                .namespace(NAMESPACE),
            &["source"],
        )?;
        let records_extracted = Counter::with_opts(
            Opts::new(
                "records_extracted_total",
                "Total telemetry records extracted from log lines.",
            )
            .namespace(NAMESPACE),
        )?;
        let parse_errors = Counter::with_opts(
            Opts::new(
                "parse_errors_total",
                "Total marked log lines with a malformed payload.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_rejected = CounterVec::new(
            Opts::new(
                "records_rejected_total",
                "Total records rejected by the aggregator by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let source_reopens = CounterVec::new(
            Opts::new(
                "source_reopens_total",
                "Total log source reopens after rotation or truncation.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let source_read_errors = CounterVec::new(
            Opts::new(
                "source_read_errors_total",
                "Total failed reads on an open log source.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let instruments = Gauge::with_opts(
            Opts::new("instruments", "Number of telemetry instrument sets exported.")
                .namespace(NAMESPACE),
        )?;
        let propagation_blocks_tracked = Gauge::with_opts(
            Opts::new(
                "propagation_blocks_tracked",
                "Number of compact blocks currently tracked for propagation.",
            )
            .namespace(NAMESPACE),
        )?;
        let propagation_blocks_pruned = Counter::with_opts(
            Opts::new(
                "propagation_blocks_pruned_total",
                "Total compact blocks discarded by the pruning sweep.",
            )
            .namespace(NAMESPACE),
        )?;
        let propagation_crossings = CounterVec::new(
            Opts::new(
                "propagation_crossings_total",
                "Total propagation percentile crossings by percentile.",
            )
            .namespace(NAMESPACE),
            &["percentile"],
        )?;
        let record_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "record_processing_duration_seconds",
                "Time to route a single telemetry record.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.000001, 0.00001, 0.0001, 0.001, 0.01]),
        )?;

        registry.register(Box::new(lines_read.clone()))?;
        registry.register(Box::new(records_extracted.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(records_rejected.clone()))?;
        registry.register(Box::new(source_reopens.clone()))?;
        registry.register(Box::new(source_read_errors.clone()))?;
        registry.register(Box::new(instruments.clone()))?;
        registry.register(Box::new(propagation_blocks_tracked.clone()))?;
        registry.register(Box::new(propagation_blocks_pruned.clone()))?;
        registry.register(Box::new(propagation_crossings.clone()))?;
        registry.register(Box::new(record_processing_duration.clone()))?;

        Ok(Self {
            lines_read,
            records_extracted,
            parse_errors,
            records_rejected,
            source_reopens,
            source_read_errors,
            instruments,
            propagation_blocks_tracked,
            propagation_blocks_pruned,
            propagation_crossings,
            record_processing_duration,
        })
    }
}
