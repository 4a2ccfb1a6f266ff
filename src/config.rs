use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::sink::aggregated::propagation::{
    DEFAULT_MIN_SAMPLES, DEFAULT_PERCENTILES, DEFAULT_PRUNE_INTERVAL, DEFAULT_WINDOW,
};

/// Top-level configuration for the explorer.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Listen address of the metrics endpoint. Default: "127.0.0.1:8316".
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Prefix for every exported telemetry series. Default: "ckb".
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Capacity of the record queue between sources and the worker. Default: 256.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Log source configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Which instruments are created per telemetry field.
    #[serde(default)]
    pub instruments: InstrumentsConfig,

    /// Propagation percentile tracking configuration.
    #[serde(default)]
    pub propagation: PropagationConfig,
}

/// Log source configuration. Exactly one of `log_files` and
/// `journal_service` must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// CKB log files to tail.
    #[serde(default)]
    pub log_files: Vec<PathBuf>,

    /// Systemd service running the CKB node.
    #[serde(default)]
    pub journal_service: String,

    /// How long a tail waits at end-of-file before polling again. Default: 100ms.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

/// Instrument kinds materialized for each (topic, field) identity.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentsConfig {
    /// Export a counter accumulating every value. Default: true.
    #[serde(default = "default_true")]
    pub counter: bool,

    /// Export a gauge holding the last value. Default: false.
    #[serde(default)]
    pub gauge: bool,

    /// Export a histogram of values. Default: false.
    #[serde(default)]
    pub histogram: bool,

    /// Histogram bucket upper bounds.
    #[serde(default = "default_histogram_buckets")]
    pub histogram_buckets: Vec<f64>,
}

/// Propagation percentile tracking configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PropagationConfig {
    /// Percentiles to detect, strictly ascending. Default: [50, 80, 90, 95, 99].
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<u8>,

    /// Observations required for a block before percentiles are evaluated. Default: 50.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,

    /// Age after which a block's tracking entry is discarded. Default: 5m.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Minimum time between pruning sweeps. Default: 5m.
    #[serde(default = "default_prune_interval", with = "humantime_serde")]
    pub prune_interval: Duration,

    /// Histogram bucket upper bounds for elapsed seconds.
    #[serde(default = "default_propagation_buckets")]
    pub buckets: Vec<f64>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:8316".to_string()
}

fn default_namespace() -> String {
    "ckb".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_true() -> bool {
    true
}

fn default_histogram_buckets() -> Vec<f64> {
    // 1, 4, 16, ... 4^11
    (0..12).map(|i| 4f64.powi(i)).collect()
}

fn default_percentiles() -> Vec<u8> {
    DEFAULT_PERCENTILES.to_vec()
}

fn default_min_samples() -> u64 {
    DEFAULT_MIN_SAMPLES
}

fn default_window() -> Duration {
    DEFAULT_WINDOW
}

fn default_prune_interval() -> Duration {
    DEFAULT_PRUNE_INTERVAL
}

fn default_propagation_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listen: default_listen(),
            namespace: default_namespace(),
            queue_capacity: default_queue_capacity(),
            source: SourceConfig::default(),
            instruments: InstrumentsConfig::default(),
            propagation: PropagationConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            log_files: Vec::new(),
            journal_service: String::new(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        Self {
            counter: true,
            gauge: false,
            histogram: false,
            histogram_buckets: default_histogram_buckets(),
        }
    }
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            percentiles: default_percentiles(),
            min_samples: default_min_samples(),
            window: default_window(),
            prune_interval: default_prune_interval(),
            buckets: default_propagation_buckets(),
        }
    }
}

// --- Loading, overrides and validation ---

impl Config {
    /// Load configuration from a YAML file. The result is not validated, so
    /// command-line overrides can still be applied.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Replace the configured log files with a comma-delimited path list.
    pub fn set_log_files(&mut self, list: &str) {
        self.source.log_files = split_paths(list);
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let has_files = !self.source.log_files.is_empty();
        let has_journal = !self.source.journal_service.is_empty();
        if has_files == has_journal {
            bail!("must provide only one of ckb-log-to-file or ckb-log-to-journal");
        }

        if self.listen.is_empty() {
            bail!("listen address is required");
        }

        if !is_valid_namespace(&self.namespace) {
            bail!("invalid metric namespace: {:?}", self.namespace);
        }

        if self.queue_capacity == 0 {
            bail!("queue_capacity must be positive");
        }

        if self.source.poll_interval.is_zero() {
            bail!("source.poll_interval must be positive");
        }

        let instruments = &self.instruments;
        if !(instruments.counter || instruments.gauge || instruments.histogram) {
            bail!("at least one of instruments.counter, gauge or histogram must be enabled");
        }
        if instruments.histogram {
            validate_buckets("instruments.histogram_buckets", &instruments.histogram_buckets)?;
        }

        let propagation = &self.propagation;
        if propagation.percentiles.is_empty() {
            bail!("propagation.percentiles must not be empty");
        }
        let mut previous = 0u8;
        for &p in &propagation.percentiles {
            if p == 0 || p > 100 {
                bail!("propagation percentile {p} must be within 1..=100");
            }
            if p <= previous {
                bail!("propagation.percentiles must be strictly ascending");
            }
            previous = p;
        }
        if propagation.window.is_zero() {
            bail!("propagation.window must be positive");
        }
        if propagation.prune_interval.is_zero() {
            bail!("propagation.prune_interval must be positive");
        }
        validate_buckets("propagation.buckets", &propagation.buckets)?;

        Ok(())
    }
}

fn split_paths(list: &str) -> Vec<PathBuf> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn is_valid_namespace(ns: &str) -> bool {
    let mut chars = ns.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_buckets(name: &str, buckets: &[f64]) -> Result<()> {
    if buckets.is_empty() {
        bail!("{name} must not be empty");
    }
    if buckets.windows(2).any(|w| w[0] >= w[1]) {
        bail!("{name} must be strictly increasing");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config() -> Config {
        let mut cfg = Config::default();
        cfg.set_log_files("/var/lib/ckb/data/logs/run.log");
        cfg
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.listen, "127.0.0.1:8316");
        assert_eq!(cfg.namespace, "ckb");
        assert_eq!(cfg.queue_capacity, 256);
        assert!(cfg.instruments.counter);
        assert!(!cfg.instruments.gauge);
        assert!(!cfg.instruments.histogram);
        assert_eq!(cfg.propagation.percentiles, vec![50, 80, 90, 95, 99]);
        assert_eq!(cfg.propagation.min_samples, 50);
        assert_eq!(cfg.propagation.window, Duration::from_secs(300));
        assert_eq!(cfg.propagation.prune_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_split_comma_delimited_paths() {
        let mut cfg = Config::default();
        cfg.set_log_files(" a.log, b.log ,,c.log");
        assert_eq!(
            cfg.source.log_files,
            vec![
                PathBuf::from("a.log"),
                PathBuf::from("b.log"),
                PathBuf::from("c.log")
            ]
        );
    }

    #[test]
    fn test_validation_requires_a_source() {
        let cfg = Config::default();
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("only one of"));
    }

    #[test]
    fn test_validation_rejects_both_sources() {
        let mut cfg = file_config();
        cfg.source.journal_service = "ckb".to_string();
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("only one of"));
    }

    #[test]
    fn test_validation_accepts_journal_only() {
        let mut cfg = Config::default();
        cfg.source.journal_service = "ckb".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_accepts_file_only() {
        assert!(file_config().validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_namespace() {
        for ns in ["", "1ckb", "ckb-node", "ckb node"] {
            let mut cfg = file_config();
            cfg.namespace = ns.to_string();
            assert!(cfg.validate().is_err(), "namespace {ns:?} should be rejected");
        }
    }

    #[test]
    fn test_validation_zero_queue_capacity() {
        let mut cfg = file_config();
        cfg.queue_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_requires_an_instrument_kind() {
        let mut cfg = file_config();
        cfg.instruments.counter = false;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("instruments"));
    }

    #[test]
    fn test_validation_percentiles_must_ascend() {
        let mut cfg = file_config();
        cfg.propagation.percentiles = vec![50, 50, 90];
        assert!(cfg.validate().is_err());

        cfg.propagation.percentiles = vec![90, 50];
        assert!(cfg.validate().is_err());

        cfg.propagation.percentiles = vec![0, 50];
        assert!(cfg.validate().is_err());

        cfg.propagation.percentiles = vec![50, 101];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_buckets_must_increase() {
        let mut cfg = file_config();
        cfg.propagation.buckets = vec![1.0, 1.0];
        assert!(cfg.validate().is_err());

        let mut cfg = file_config();
        cfg.instruments.histogram = true;
        cfg.instruments.histogram_buckets = vec![];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
listen: "0.0.0.0:9100"
namespace: ckb_testnet
queue_capacity: 64
source:
  log_files: ["/data/ckb/run.log"]
  poll_interval: 250ms
instruments:
  gauge: true
propagation:
  percentiles: [50, 99]
  min_samples: 10
  window: 2m
  prune_interval: 30s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("valid yaml");
        assert_eq!(cfg.listen, "0.0.0.0:9100");
        assert_eq!(cfg.namespace, "ckb_testnet");
        assert_eq!(cfg.queue_capacity, 64);
        assert_eq!(cfg.source.log_files, vec![PathBuf::from("/data/ckb/run.log")]);
        assert_eq!(cfg.source.poll_interval, Duration::from_millis(250));
        assert!(cfg.instruments.counter);
        assert!(cfg.instruments.gauge);
        assert_eq!(cfg.propagation.percentiles, vec![50, 99]);
        assert_eq!(cfg.propagation.min_samples, 10);
        assert_eq!(cfg.propagation.window, Duration::from_secs(120));
        assert_eq!(cfg.propagation.prune_interval, Duration::from_secs(30));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/ckb-explorer.yaml")).expect_err("should fail");
        assert!(err.to_string().contains("reading config file"));
    }

    #[test]
    fn test_example_file_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("ckb-explorer.example.yaml");
        let cfg = Config::load(&path).expect("example config loads");
        cfg.validate().expect("example config validates");

        let defaults = Config::default();
        assert_eq!(cfg.listen, defaults.listen);
        assert_eq!(cfg.instruments.histogram_buckets, defaults.instruments.histogram_buckets);
        assert_eq!(cfg.propagation.buckets, defaults.propagation.buckets);
        assert_eq!(cfg.propagation.window, defaults.propagation.window);
    }
}
