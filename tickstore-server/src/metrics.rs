//! Prometheus metrics
//!
//! Exposed in text exposition format at `GET /metrics`. The disk usage
//! gauge is refreshed by a background monitor task.

use lazy_static::lazy_static;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

lazy_static! {
    /// Server metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Seconds spent bringing the instance up
    pub static ref STARTUP_TIME: Gauge = Gauge::with_opts(Opts::new(
        "tickstore_startup_seconds",
        "Time taken to initialize the instance"
    ))
    .expect("metric can be created");

    /// Writes accepted through the RPC surface
    pub static ref WRITES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "tickstore_writes_total",
        "Total write requests accepted"
    ))
    .expect("metric can be created");

    /// Failed write requests
    pub static ref WRITE_ERRORS_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "tickstore_write_errors_total",
        "Total write requests that failed"
    ))
    .expect("metric can be created");

    /// Queries served
    pub static ref QUERIES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "tickstore_queries_total",
        "Total query requests served"
    ))
    .expect("metric can be created");

    /// Failed queries
    pub static ref QUERY_ERRORS_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "tickstore_query_errors_total",
        "Total query requests that failed"
    ))
    .expect("metric can be created");

    /// Connected replication subscribers
    pub static ref REPLICATION_SUBSCRIBERS: IntGauge = IntGauge::with_opts(Opts::new(
        "tickstore_replication_subscribers",
        "Currently connected replication subscribers"
    ))
    .expect("metric can be created");

    /// Transactions the slowest subscriber is behind by
    pub static ref REPLICATION_MAX_LAG: IntGauge = IntGauge::with_opts(Opts::new(
        "tickstore_replication_max_lag",
        "Transactions the slowest connected subscriber is behind by"
    ))
    .expect("metric can be created");

    /// Bytes under the data root
    pub static ref TOTAL_DISK_USAGE_BYTES: IntGauge = IntGauge::with_opts(Opts::new(
        "tickstore_disk_usage_bytes",
        "Total bytes under the data root directory"
    ))
    .expect("metric can be created");
}

/// Register every metric; call once at startup
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(STARTUP_TIME.clone()),
        Box::new(WRITES_TOTAL.clone()),
        Box::new(WRITE_ERRORS_TOTAL.clone()),
        Box::new(QUERIES_TOTAL.clone()),
        Box::new(QUERY_ERRORS_TOTAL.clone()),
        Box::new(REPLICATION_SUBSCRIBERS.clone()),
        Box::new(REPLICATION_MAX_LAG.clone()),
        Box::new(TOTAL_DISK_USAGE_BYTES.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            warn!(error = %e, "metric registration failed");
        }
    }
}

/// Text exposition of the registry
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buf) {
        warn!(error = %e, "metrics encoding failed");
    }
    String::from_utf8(buf).unwrap_or_default()
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            total += dir_size(&entry.path());
        } else if let Ok(metadata) = entry.metadata() {
            total += metadata.len();
        }
    }
    total
}

/// Periodically refresh the disk usage gauge for the data root
pub async fn run_disk_usage_monitor(root: PathBuf, interval: Duration) {
    loop {
        let path = root.clone();
        let size = tokio::task::spawn_blocking(move || dir_size(&path))
            .await
            .unwrap_or(0);
        TOTAL_DISK_USAGE_BYTES.set(size as i64);
        tokio::time::sleep(interval).await;
    }
}
