pub mod propagation;
pub mod registry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use prometheus::Registry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::record::MetricRecord;
use crate::sink::dispatch::Dispatcher;
use crate::sink::Sink;

use self::propagation::{PropagationTracker, PROPAGATION_TOPIC};
use self::registry::InstrumentRegistry;

/// All aggregation state: the instrument registry and the propagation
/// tracker.
///
/// Owned by exactly one task. Nothing here is shared, so nothing is locked.
pub struct Aggregator {
    instruments: InstrumentRegistry,
    propagation: PropagationTracker,
    health: Arc<HealthMetrics>,
}

impl Aggregator {
    pub fn new(cfg: &Config, registry: Registry, health: Arc<HealthMetrics>) -> Self {
        Self {
            instruments: InstrumentRegistry::new(
                registry.clone(),
                &cfg.namespace,
                cfg.instruments.clone(),
            ),
            propagation: PropagationTracker::new(
                registry,
                &cfg.namespace,
                cfg.propagation.clone(),
            ),
            health,
        }
    }

    /// Route one record by topic.
    ///
    /// Invalid propagation records are logged and counted. Errors returned
    /// from here are fatal registration failures.
    pub fn handle(&mut self, record: &MetricRecord, now: Instant) -> Result<()> {
        let start = Instant::now();

        if record.topic == PROPAGATION_TOPIC {
            self.prune(now);
            match self.propagation.observe(record, now) {
                Ok(crossings) => {
                    for crossing in crossings {
                        let percentile = crossing.percentile.to_string();
                        self.health
                            .propagation_crossings
                            .with_label_values(&[percentile.as_str()])
                            .inc();
                        debug!(
                            percentile = crossing.percentile,
                            elapsed_ms = crossing.elapsed.as_millis() as u64,
                            "propagation percentile crossed",
                        );
                    }
                }
                Err(e) if e.is_fatal() => {
                    return Err(e).context("creating propagation instruments");
                }
                Err(e) => {
                    warn!(error = %e, ?record, "rejecting propagation record");
                    self.health
                        .records_rejected
                        .with_label_values(&[e.reason()])
                        .inc();
                }
            }
            self.health
                .propagation_blocks_tracked
                .set(self.propagation.len() as f64);
        } else {
            let created = self
                .instruments
                .record(record)
                .with_context(|| format!("creating instruments for topic {}", record.topic))?;
            if created > 0 {
                debug!(topic = %record.topic, created, "instruments created");
                self.health.instruments.set(self.instruments.len() as f64);
            }
        }

        self.health
            .record_processing_duration
            .observe(start.elapsed().as_secs_f64());

        Ok(())
    }

    /// Run the pruning sweep if it is due.
    pub fn prune(&mut self, now: Instant) {
        let removed = self.propagation.maybe_prune(now);
        if removed > 0 {
            debug!(removed, remaining = self.propagation.len(), "pruned stale blocks");
            self.health.propagation_blocks_pruned.inc_by(removed as f64);
            self.health
                .propagation_blocks_tracked
                .set(self.propagation.len() as f64);
        }
    }

    pub fn instruments(&self) -> &InstrumentRegistry {
        &self.instruments
    }

    pub fn propagation(&self) -> &PropagationTracker {
        &self.propagation
    }
}

/// Sink that aggregates records into Prometheus instruments on a single
/// worker task.
pub struct AggregatedSink {
    /// Present until `start` moves it into the worker.
    aggregator: Option<Aggregator>,

    /// The sink's own queue handle, dropped by `stop` so the worker can drain.
    dispatcher: Option<Dispatcher>,
    /// Queue receiver, taken by `start`.
    record_rx: Option<mpsc::Receiver<MetricRecord>>,

    /// How often the worker checks whether a pruning sweep is due.
    prune_check: Duration,

    /// Handle for the worker task.
    run_task: Option<JoinHandle<Result<()>>>,
}

impl AggregatedSink {
    /// Creates a new aggregated sink writing into `registry`.
    pub fn new(cfg: &Config, registry: Registry, health: Arc<HealthMetrics>) -> Self {
        let (dispatcher, record_rx) = Dispatcher::channel(cfg.queue_capacity);

        Self {
            aggregator: Some(Aggregator::new(cfg, registry, health)),
            dispatcher: Some(dispatcher),
            record_rx: Some(record_rx),
            prune_check: cfg.propagation.prune_interval,
            run_task: None,
        }
    }

    /// Waits for the worker to finish, returning its result.
    ///
    /// Cancel-safe: if the returned future is dropped the worker handle is
    /// kept and a later call waits again.
    pub async fn wait_for_shutdown(&mut self) -> Result<()> {
        let Some(run_task) = self.run_task.as_mut() else {
            return Ok(());
        };
        let result = run_task.await;
        self.run_task = None;
        result.context("aggregation worker panicked")?
    }
}

impl Sink for AggregatedSink {
    fn name(&self) -> &str {
        "aggregated"
    }

    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let mut aggregator = self
            .aggregator
            .take()
            .context("aggregated sink started more than once")?;
        let mut record_rx = self
            .record_rx
            .take()
            .context("aggregated sink started more than once")?;
        let prune_check = self.prune_check;

        let run_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(prune_check);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    record = record_rx.recv() => {
                        let Some(record) = record else {
                            debug!("record queue closed");
                            break;
                        };
                        aggregator.handle(&record, Instant::now())?;
                    }
                    _ = ticker.tick() => {
                        aggregator.prune(Instant::now());
                    }
                    _ = ctx.cancelled() => {
                        // Stop accepting and route whatever is already queued.
                        record_rx.close();
                        let mut drained = 0usize;
                        while let Some(record) = record_rx.recv().await {
                            aggregator.handle(&record, Instant::now())?;
                            drained += 1;
                        }
                        debug!(drained, "record queue drained");
                        break;
                    }
                }
            }

            info!(
                instruments = aggregator.instruments().len(),
                tracked_blocks = aggregator.propagation().len(),
                "aggregation worker stopped",
            );

            Ok::<(), anyhow::Error>(())
        });

        self.run_task = Some(run_task);

        info!("aggregated sink started");

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.dispatcher.take();
        self.wait_for_shutdown().await
    }

    fn dispatcher(&self) -> Dispatcher {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.clone(),
            // Stopped: hand out a dispatcher whose queue is already closed.
            None => Dispatcher::channel(1).0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::propagation::{BLOCK_TAG, TOTAL_PEERS_FIELD};
    use super::registry::InstrumentIdentity;
    use super::*;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.set_log_files("run.log");
        cfg
    }

    fn aggregator() -> (Registry, Arc<HealthMetrics>, Aggregator) {
        let registry = Registry::new();
        let health = Arc::new(HealthMetrics::new(&registry).expect("health"));
        let aggregator = Aggregator::new(&test_config(), registry.clone(), Arc::clone(&health));
        (registry, health, aggregator)
    }

    fn record(topic: &str, tags: &[(&str, &str)], fields: &[(&str, u64)]) -> MetricRecord {
        MetricRecord {
            topic: topic.to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            fields: fields.iter().map(|(k, v)| ((*k).to_string(), *v)).collect(),
        }
    }

    fn propagation(block: &str, total_peers: u64) -> MetricRecord {
        record(
            PROPAGATION_TOPIC,
            &[(BLOCK_TAG, block)],
            &[(TOTAL_PEERS_FIELD, total_peers)],
        )
    }

    #[test]
    fn test_routes_by_topic() {
        let (_registry, health, mut aggregator) = aggregator();
        let now = Instant::now();

        aggregator
            .handle(&record("sync", &[], &[("blocks", 4)]), now)
            .expect("handle");
        aggregator.handle(&propagation("0xaa", 10), now).expect("handle");

        assert_eq!(aggregator.instruments().len(), 1);
        assert_eq!(aggregator.propagation().len(), 1);
        assert!(aggregator
            .instruments()
            .get(InstrumentIdentity {
                topic: PROPAGATION_TOPIC,
                field: TOTAL_PEERS_FIELD,
            })
            .is_none());
        assert_eq!(health.instruments.get(), 1.0);
        assert_eq!(health.propagation_blocks_tracked.get(), 1.0);
    }

    #[test]
    fn test_rejected_propagation_record_is_counted() {
        let (_registry, health, mut aggregator) = aggregator();
        aggregator
            .handle(&record(PROPAGATION_TOPIC, &[], &[(TOTAL_PEERS_FIELD, 5)]), Instant::now())
            .expect("non-fatal");
        assert_eq!(
            health
                .records_rejected
                .with_label_values(&["missing_block"])
                .get(),
            1.0
        );
    }

    #[test]
    fn test_crossings_are_counted() {
        let (_registry, health, mut aggregator) = aggregator();
        let start = Instant::now();
        for i in 1..=100 {
            aggregator
                .handle(&propagation("0xaa", 100), start + Duration::from_millis(i))
                .expect("handle");
        }
        for p in ["50", "80", "90", "95", "99"] {
            assert_eq!(
                health.propagation_crossings.with_label_values(&[p]).get(),
                1.0
            );
        }
    }

    #[test]
    fn test_registration_failure_is_fatal() {
        let (registry, _health, mut aggregator) = aggregator();
        let taken = prometheus::Counter::new("ckb_sync__a__total", "taken").expect("counter");
        registry.register(Box::new(taken)).expect("register");

        assert!(aggregator
            .handle(&record("sync", &[], &[("a", 1)]), Instant::now())
            .is_err());
    }

    #[test]
    fn test_lookalike_names_do_not_collide() {
        let (_registry, health, mut aggregator) = aggregator();
        let now = Instant::now();

        for (topic, field) in [
            ("a_b", "c"),
            ("a", "b_c"),
            ("sync", "a-b"),
            ("sync", "a_b"),
            // Overlaps the health series prefix.
            ("explorer", "parse_errors"),
            ("explorer", "instruments"),
            ("propagation_50", "count"),
        ] {
            aggregator
                .handle(&record(topic, &[], &[(field, 1)]), now)
                .unwrap_or_else(|e| panic!("{topic}/{field}: {e:#}"));
        }

        assert_eq!(aggregator.instruments().len(), 7);
        assert_eq!(health.instruments.get(), 7.0);
    }

    #[test]
    fn test_prune_updates_health() {
        let (_registry, health, mut aggregator) = aggregator();
        let t0 = Instant::now();

        aggregator.prune(t0);
        aggregator.handle(&propagation("0xaa", 10), t0).expect("handle");
        aggregator.prune(t0 + Duration::from_secs(301));

        assert!(aggregator.propagation().is_empty());
        assert_eq!(health.propagation_blocks_pruned.get(), 1.0);
        assert_eq!(health.propagation_blocks_tracked.get(), 0.0);
    }

    #[tokio::test]
    async fn test_worker_drains_queue_on_stop() {
        let registry = Registry::new();
        let health = Arc::new(HealthMetrics::new(&registry).expect("health"));
        let mut sink = AggregatedSink::new(&test_config(), registry, health);
        sink.start(CancellationToken::new()).await.expect("start");

        let dispatcher = sink.dispatcher();
        for _ in 0..10 {
            dispatcher
                .dispatch(record("sync", &[], &[("blocks", 1)]))
                .await
                .expect("dispatch");
        }
        drop(dispatcher);

        sink.stop().await.expect("stop");
        assert!(sink.dispatcher().dispatch(record("sync", &[], &[])).await.is_err());
    }

    #[tokio::test]
    async fn test_worker_drains_queue_on_cancel() {
        let registry = Registry::new();
        let health = Arc::new(HealthMetrics::new(&registry).expect("health"));
        let mut sink = AggregatedSink::new(&test_config(), registry.clone(), health);
        let ctx = CancellationToken::new();
        sink.start(ctx.clone()).await.expect("start");

        let dispatcher = sink.dispatcher();
        for _ in 0..5 {
            dispatcher
                .dispatch(record("sync", &[], &[("blocks", 2)]))
                .await
                .expect("dispatch");
        }

        ctx.cancel();
        sink.wait_for_shutdown().await.expect("worker result");

        let total: f64 = registry
            .gather()
            .iter()
            .filter(|mf| mf.get_name() == "ckb_sync__blocks__total")
            .map(|mf| mf.get_metric()[0].get_counter().get_value())
            .sum();
        assert_eq!(total, 10.0);
    }

    #[tokio::test]
    async fn test_worker_fails_on_registration_error() {
        let registry = Registry::new();
        let health = Arc::new(HealthMetrics::new(&registry).expect("health"));
        let taken = prometheus::Counter::new("ckb_sync__a__total", "taken").expect("counter");
        registry.register(Box::new(taken)).expect("register");

        let mut sink = AggregatedSink::new(&test_config(), registry, health);
        sink.start(CancellationToken::new()).await.expect("start");

        sink.dispatcher()
            .dispatch(record("sync", &[], &[("a", 1)]))
            .await
            .expect("dispatch");

        assert!(sink.wait_for_shutdown().await.is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let registry = Registry::new();
        let health = Arc::new(HealthMetrics::new(&registry).expect("health"));
        let mut sink = AggregatedSink::new(&test_config(), registry, health);
        sink.start(CancellationToken::new()).await.expect("start");
        assert!(sink.start(CancellationToken::new()).await.is_err());
        sink.stop().await.expect("stop");
    }

    #[test]
    fn test_name() {
        let registry = Registry::new();
        let health = Arc::new(HealthMetrics::new(&registry).expect("health"));
        let sink = AggregatedSink::new(&test_config(), registry, health);
        assert_eq!(sink.name(), "aggregated");
    }
}
