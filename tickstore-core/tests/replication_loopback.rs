//! Primary→replica streaming over localhost
//!
//! A master instance publishes committed transactions to a sender serving
//! on an ephemeral port; a receiver replays them into a WAL-bypass replica.
//! After the stream drains, the replica must answer queries byte-identically
//! to the master, including buckets it had never seen before subscribing.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

use tickstore_core::instance::{Instance, InstanceConfig};
use tickstore_core::query::QueryContext;
use tickstore_core::replication::{ReplicationReceiver, ReplicationSender, RetryPolicy};
use tickstore_core::trigger::TriggerMatchers;
use tickstore_core::writer::CsmWriter;
use tickstore_core::{
    BucketMeta, Column, ColumnData, ColumnSeries, ColumnSeriesMap, ElementType, RecordKind,
    Schema,
};

const BUCKET: &str = "AAPL/1Min/OHLCV";
const T0: i64 = 947075400;

fn meta() -> BucketMeta {
    BucketMeta {
        schema: Schema::new(vec![
            Column::new("Epoch", ElementType::Int64),
            Column::new("Close", ElementType::Float64),
        ])
        .unwrap(),
        timeframe: "1Min".parse().unwrap(),
        record_kind: RecordKind::Fixed,
    }
}

fn bar(epoch: i64, close: f64) -> ColumnSeries {
    ColumnSeries::new()
        .with_column("Epoch", ColumnData::Int64(vec![epoch]))
        .with_column("Close", ColumnData::Float64(vec![close]))
}

fn segment_bytes(root: &Path) -> Vec<u8> {
    std::fs::read(root.join("AAPL").join("1Min").join("OHLCV").join("2000.bin")).unwrap()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        interval: Duration::from_millis(100),
        backoff_coeff: 2.0,
        max_attempts: 10,
    }
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replica_converges_with_master() {
    let master_dir = TempDir::new().unwrap();
    let replica_dir = TempDir::new().unwrap();

    let sender = ReplicationSender::with_defaults();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(sender.clone().serve(listener, None));

    let master = Instance::initialize(
        InstanceConfig::new(master_dir.path()),
        Some(sender.clone()),
        Arc::new(TriggerMatchers::default()),
    )
    .unwrap();
    master.catalog().create(BUCKET, meta()).unwrap();

    let mut replica_config = InstanceConfig::new(replica_dir.path());
    replica_config.wal.bypass = true;
    let replica = Instance::initialize(
        replica_config,
        None,
        Arc::new(TriggerMatchers::default()),
    )
    .unwrap();

    let receiver = Arc::new(ReplicationReceiver::new(
        addr.to_string(),
        replica.catalog().clone(),
    ));
    let stream = receiver.clone();
    tokio::spawn(async move {
        let _ = stream.run_with_retry(fast_retry()).await;
    });

    const TXNS: u64 = 200;
    for i in 0..TXNS {
        let mut csm = ColumnSeriesMap::new();
        csm.insert(BUCKET, bar(T0 + i as i64 * 60, 100.0 + i as f64));
        let response = master.writer().write_csm(&csm).unwrap();
        assert!(response.first_error().is_none());
    }

    assert!(
        wait_until(Duration::from_secs(10), || receiver.last_applied() == TXNS).await,
        "replica applied {} of {} transactions",
        receiver.last_applied(),
        TXNS
    );

    // replica answers byte-identically to the master
    let sql = format!("SELECT * FROM '{}' WHERE Epoch >= {}", BUCKET, T0);
    let master_cs = master.query(&sql, &QueryContext::new()).unwrap();
    let replica_cs = replica.query(&sql, &QueryContext::new()).unwrap();
    assert_eq!(master_cs.len(), TXNS as usize);
    assert_eq!(master_cs, replica_cs);

    // and the on-disk state matches exactly
    master.shutdown().unwrap();
    replica.shutdown().unwrap();
    assert_eq!(
        segment_bytes(master_dir.path()),
        segment_bytes(replica_dir.path())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replica_bootstraps_unknown_buckets() {
    let master_dir = TempDir::new().unwrap();
    let replica_dir = TempDir::new().unwrap();

    let sender = ReplicationSender::with_defaults();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(sender.clone().serve(listener, None));

    let master = Instance::initialize(
        InstanceConfig::new(master_dir.path()),
        Some(sender.clone()),
        Arc::new(TriggerMatchers::default()),
    )
    .unwrap();

    let mut replica_config = InstanceConfig::new(replica_dir.path());
    replica_config.wal.bypass = true;
    let replica = Instance::initialize(
        replica_config,
        None,
        Arc::new(TriggerMatchers::default()),
    )
    .unwrap();
    let receiver = Arc::new(ReplicationReceiver::new(
        addr.to_string(),
        replica.catalog().clone(),
    ));
    let stream = receiver.clone();
    tokio::spawn(async move {
        let _ = stream.run_with_retry(fast_retry()).await;
    });

    // the bucket is created on the master after the replica subscribed
    master.catalog().create("MSFT/1Min/OHLCV", meta()).unwrap();
    let mut csm = ColumnSeriesMap::new();
    csm.insert("MSFT/1Min/OHLCV", bar(T0, 42.0));
    master.writer().write_csm(&csm).unwrap();

    assert!(wait_until(Duration::from_secs(10), || receiver.last_applied() >= 1).await);

    let replica_bucket = replica.catalog().resolve("MSFT/1Min/OHLCV").unwrap();
    assert_eq!(replica_bucket.meta(), &meta());
    let cs = replica
        .query("SELECT * FROM 'MSFT/1Min/OHLCV'", &QueryContext::new())
        .unwrap();
    assert_eq!(cs.len(), 1);
    assert_eq!(cs.column("Close").unwrap().f64_at(0), Some(42.0));

    master.shutdown().unwrap();
    replica.shutdown().unwrap();
}
