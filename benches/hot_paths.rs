use std::sync::Arc;
use std::time::Instant;

use ckb_explorer::config::Config;
use ckb_explorer::export::health::HealthMetrics;
use ckb_explorer::record::parse::extract_record;
use ckb_explorer::sink::aggregated::Aggregator;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use prometheus::Registry;

const NOISE_LINE: &str = "2024-05-01 12:00:00.000 +00:00 ChainService INFO ckb_chain::chain  block: 12345678, hash: 0xdeadbeef, epoch: 1234 (567/1800)";
const METRIC_LINE: &str = r#"2024-05-01 12:00:00.000 +00:00 NetworkRuntime INFO ckb-metrics {"topic":"network","tags":{"peer":"p1"},"fields":{"received":1500,"sent":300}}"#;

fn aggregator() -> Aggregator {
    let registry = Registry::new();
    let health = Arc::new(HealthMetrics::new(&registry).expect("health"));
    Aggregator::new(&Config::default(), registry, health)
}

fn bench_extract(c: &mut Criterion) {
    c.bench_function("extract_non_telemetry_line", |b| {
        b.iter(|| extract_record(black_box(NOISE_LINE)))
    });

    c.bench_function("extract_telemetry_line", |b| {
        b.iter(|| extract_record(black_box(METRIC_LINE)))
    });
}

fn bench_handle(c: &mut Criterion) {
    let record = extract_record(METRIC_LINE)
        .expect("parse")
        .expect("record");

    let mut known = aggregator();
    known.handle(&record, Instant::now()).expect("warm up");
    c.bench_function("aggregator_handle_known_instrument", |b| {
        b.iter(|| known.handle(black_box(&record), Instant::now()))
    });

    let mut tracker = aggregator();
    let blocks: Vec<_> = (0..1024)
        .map(|i| {
            extract_record(&format!(
                r#"ckb-metrics {{"topic":"propagation","tags":{{"compact_block":"0x{i:064x}"}},"fields":{{"total_peers":100}}}}"#
            ))
            .expect("parse")
            .expect("record")
        })
        .collect();
    let mut i = 0usize;
    c.bench_function("aggregator_handle_propagation", |b| {
        b.iter(|| {
            let record = &blocks[i % blocks.len()];
            i += 1;
            tracker.handle(black_box(record), Instant::now())
        })
    });
}

criterion_group!(benches, bench_extract, bench_handle);
criterion_main!(benches);
