//! Raw line sources feeding the dispatcher.

pub mod file;
pub mod journal;

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SourceConfig;
use crate::export::health::HealthMetrics;
use crate::record::parse::extract_record;
use crate::sink::dispatch::Dispatcher;

pub use file::{FileSource, TailEvent, TailReader};
pub use journal::JournalSource;

/// A line source, dispatched statically over the supported kinds.
pub enum Source {
    File(FileSource),
    Journal(JournalSource),
}

impl Source {
    /// Returns the source name for logging and health labels.
    pub fn name(&self) -> &str {
        match self {
            Self::File(s) => s.name(),
            Self::Journal(s) => s.name(),
        }
    }

    /// Runs the source until `ctx` is cancelled or the dispatcher closes.
    pub async fn run(
        self,
        dispatcher: Dispatcher,
        health: Arc<HealthMetrics>,
        ctx: CancellationToken,
    ) -> Result<()> {
        match self {
            Self::File(s) => s.run(dispatcher, health, ctx).await,
            Self::Journal(s) => s.run(ctx).await,
        }
    }
}

/// Opens every configured source.
///
/// A lone source that fails to open is fatal. With several, failures are
/// logged and skipped as long as at least one opens.
pub async fn open_all(cfg: &SourceConfig) -> Result<Vec<Source>> {
    if !cfg.journal_service.is_empty() {
        return Ok(vec![Source::Journal(JournalSource::new(&cfg.journal_service))]);
    }

    if cfg.log_files.len() == 1 {
        let source = FileSource::open(&cfg.log_files[0], cfg.poll_interval).await?;
        return Ok(vec![Source::File(source)]);
    }

    let mut sources = Vec::with_capacity(cfg.log_files.len());
    for path in &cfg.log_files {
        match FileSource::open(path, cfg.poll_interval).await {
            Ok(source) => sources.push(Source::File(source)),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping log file"),
        }
    }

    if sources.is_empty() {
        bail!("none of the {} configured log files could be opened", cfg.log_files.len());
    }

    info!(opened = sources.len(), configured = cfg.log_files.len(), "log sources opened");

    Ok(sources)
}

/// Extracts and dispatches a single line. Returns false once the dispatcher
/// is closed and the source should stop.
pub(crate) async fn handle_line(
    line: &str,
    dispatcher: &Dispatcher,
    health: &HealthMetrics,
) -> bool {
    match extract_record(line) {
        Ok(None) => true,
        Ok(Some(record)) => {
            health.records_extracted.inc();
            dispatcher.dispatch(record).await.is_ok()
        }
        Err(e) => {
            health.parse_errors.inc();
            warn!(error = %e, line, "dropping malformed telemetry line");
            true
        }
    }
}
