use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use prometheus::Registry;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::MetricsServer;
use crate::sink::aggregated::AggregatedSink;
use crate::sink::Sink;
use crate::source;

/// Agent wires the log sources, the aggregation worker and the metrics
/// endpoint together.
pub struct Agent {
    cfg: Config,
    registry: Registry,
    health: Arc<HealthMetrics>,
    server: MetricsServer,
    local_addr: Option<SocketAddr>,
    sink: Option<AggregatedSink>,
    sources: JoinSet<(String, Result<()>)>,
    /// Stops the source tasks.
    cancel: CancellationToken,
    /// Stops the aggregation worker; only fired after sources are joined.
    worker_cancel: CancellationToken,
}

impl Agent {
    /// Creates a new agent with a fresh registry and its health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let registry = Registry::new();
        let health =
            Arc::new(HealthMetrics::new(&registry).context("creating health metrics")?);
        let server = MetricsServer::new(registry.clone(), &cfg.listen);

        Ok(Self {
            cfg,
            registry,
            health,
            server,
            local_addr: None,
            sink: None,
            sources: JoinSet::new(),
            cancel: CancellationToken::new(),
            worker_cancel: CancellationToken::new(),
        })
    }

    /// Opens the sources, then starts the worker, the endpoint and one task
    /// per source.
    pub async fn start(&mut self) -> Result<()> {
        if self.sink.is_some() {
            bail!("agent already started");
        }

        // 1. Open sources first so a bad path fails before anything binds.
        let sources = source::open_all(&self.cfg.source)
            .await
            .context("opening log sources")?;

        // 2. Start the aggregation worker.
        let mut sink = AggregatedSink::new(
            &self.cfg,
            self.registry.clone(),
            Arc::clone(&self.health),
        );
        sink.start(self.worker_cancel.clone())
            .await
            .context("starting aggregated sink")?;
        let dispatcher = sink.dispatcher();
        self.sink = Some(sink);

        // 3. Serve the registry.
        let local_addr = self
            .server
            .start()
            .await
            .context("starting metrics server")?;
        self.local_addr = Some(local_addr);

        // 4. One task per source, all sharing the dispatcher.
        for source in sources {
            let name = source.name().to_string();
            let dispatcher = dispatcher.clone();
            let health = Arc::clone(&self.health);
            let ctx = self.cancel.child_token();

            self.sources.spawn(async move {
                let result = source.run(dispatcher, health, ctx).await;
                (name, result)
            });
        }

        info!(
            addr = %local_addr,
            namespace = %self.cfg.namespace,
            sources = self.sources.len(),
            "agent fully started",
        );

        Ok(())
    }

    /// Address the metrics endpoint is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Resolves when the agent can no longer make progress: the worker
    /// failed or every source has ended.
    ///
    /// A source that ends while others are still running is only logged. Once
    /// all have ended, the first failure, if any, is returned.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };

        let mut first_error = None;
        loop {
            tokio::select! {
                result = sink.wait_for_shutdown() => {
                    result.context("aggregation worker failed")?;
                    bail!("aggregation worker exited unexpectedly");
                }
                joined = self.sources.join_next(), if !self.sources.is_empty() => {
                    match joined {
                        Some(Ok((name, Ok(())))) => {
                            info!(source = %name, remaining = self.sources.len(), "source finished");
                        }
                        Some(Ok((name, Err(e)))) => {
                            error!(source = %name, remaining = self.sources.len(), error = %format!("{e:#}"), "source failed");
                            first_error = first_error.or(Some(e.context(format!("source {name} failed"))));
                        }
                        Some(Err(e)) => {
                            error!(remaining = self.sources.len(), error = %e, "source task panicked");
                            first_error = first_error.or(Some(anyhow::Error::new(e).context("source task panicked")));
                        }
                        None => {}
                    }
                    if self.sources.is_empty() {
                        info!("all sources finished");
                        return match first_error {
                            Some(e) => Err(e),
                            None => Ok(()),
                        };
                    }
                }
            }
        }
    }

    /// Gracefully stop: sources first, then the worker drains, then the
    /// endpoint goes away.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        while let Some(joined) = self.sources.join_next().await {
            match joined {
                Ok((name, Err(e))) => error!(source = %name, error = %e, "source stopped with error"),
                Ok((name, Ok(()))) => info!(source = %name, "source stopped"),
                Err(e) => error!(error = %e, "source task panicked"),
            }
        }

        let worker = match self.sink.as_mut() {
            Some(sink) => {
                self.worker_cancel.cancel();
                sink.stop().await
            }
            None => Ok(()),
        };

        self.server.stop().await?;

        worker.context("aggregation worker failed")
    }
}
