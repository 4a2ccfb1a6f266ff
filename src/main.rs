use std::path::PathBuf;

use anyhow::{Context, Result};
use ckb_explorer::agent::Agent;
use ckb_explorer::config::Config;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// Exports CKB node log telemetry as Prometheus metrics.
#[derive(Parser)]
#[command(name = "ckb-explorer", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Address to serve /metrics on, e.g. 127.0.0.1:8316 or :8316.
    #[arg(long)]
    listen: Option<String>,

    /// Comma-delimited CKB log files to tail.
    #[arg(long = "ckb-log-to-file", value_name = "PATHS")]
    ckb_log_to_file: Option<String>,

    /// Systemd service whose journal carries the CKB logs.
    #[arg(long = "ckb-log-to-journal", value_name = "SERVICE")]
    ckb_log_to_journal: Option<String>,

    /// Prefix for every exported metric name.
    #[arg(long)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

impl Cli {
    /// Builds the effective configuration: file values first, flags on top.
    fn config(&self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(level) = &self.log_level {
            cfg.log_level = level.clone();
        }
        if let Some(listen) = &self.listen {
            cfg.listen = listen.clone();
        }
        if let Some(files) = &self.ckb_log_to_file {
            cfg.set_log_files(files);
        }
        if let Some(service) = &self.ckb_log_to_journal {
            cfg.source.journal_service = service.clone();
        }
        if let Some(namespace) = &self.namespace {
            cfg.namespace = namespace.clone();
        }

        cfg.validate().context("invalid configuration")?;

        Ok(cfg)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("ckb-explorer {}", version::full());
        return Ok(());
    }

    let cfg = cli.config()?;

    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting ckb-explorer",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let outcome = tokio::select! {
        _ = shutdown_rx => Ok(()),
        result = agent.wait() => result,
    };

    if let Err(e) = &outcome {
        tracing::error!(error = %format!("{e:#}"), "agent failed");
    }

    agent.stop().await?;

    tracing::info!("ckb-explorer stopped");

    outcome
}
