//! Tails CKB node logs, extracts the embedded `ckb-metrics` telemetry and
//! exports it as Prometheus metrics, including block propagation percentiles.

pub mod agent;
pub mod config;
pub mod export;
pub mod record;
pub mod sink;
pub mod source;
