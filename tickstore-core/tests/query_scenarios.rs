//! End-to-end query scenarios over a seeded trading day
//!
//! `AAPL/1Min/OHLCV` is seeded with one bar per minute over 2000-01-05
//! (UTC); each scenario drives the full pipeline from SQL text to a
//! materialized column series.

use std::sync::Arc;
use tempfile::TempDir;

use tickstore_core::instance::{Instance, InstanceConfig};
use tickstore_core::query::QueryContext;
use tickstore_core::trigger::TriggerMatchers;
use tickstore_core::writer::CsmWriter;
use tickstore_core::{
    BucketMeta, Column, ColumnData, ColumnSeries, ColumnSeriesMap, ElementType, RecordKind,
    Schema, TickError,
};

/// 2000-01-05 00:00:00 UTC
const DAY_START: i64 = 947030400;
/// 2000-01-05 12:31:00 UTC, first row inside the open BETWEEN interval
const FIRST_ROW: i64 = 947075460;

fn ohlcv_meta(timeframe: &str) -> BucketMeta {
    BucketMeta {
        schema: Schema::new(vec![
            Column::new("Epoch", ElementType::Int64),
            Column::new("Open", ElementType::Float32),
            Column::new("High", ElementType::Float32),
            Column::new("Low", ElementType::Float32),
            Column::new("Close", ElementType::Float32),
        ])
        .unwrap(),
        timeframe: timeframe.parse().unwrap(),
        record_kind: RecordKind::Fixed,
    }
}

/// Open price of the bar at minute `i` of the day
fn open_at(i: usize) -> f32 {
    100.0 + (i % 13) as f32 * 0.25
}

fn seeded_instance(dir: &TempDir) -> Arc<Instance> {
    let instance = Instance::initialize(
        InstanceConfig::new(dir.path()),
        None,
        Arc::new(TriggerMatchers::default()),
    )
    .unwrap();
    instance
        .catalog()
        .create("AAPL/1Min/OHLCV", ohlcv_meta("1Min"))
        .unwrap();
    instance
        .catalog()
        .create("AAPL/5Min/OHLCV", ohlcv_meta("5Min"))
        .unwrap();

    let epochs: Vec<i64> = (0..1440).map(|i| DAY_START + i * 60).collect();
    let opens: Vec<f32> = (0..1440).map(open_at).collect();
    let cs = ColumnSeries::new()
        .with_column("Epoch", ColumnData::Int64(epochs))
        .with_column("Open", ColumnData::Float32(opens.clone()))
        .with_column(
            "High",
            ColumnData::Float32(opens.iter().map(|v| v + 0.5).collect()),
        )
        .with_column(
            "Low",
            ColumnData::Float32(opens.iter().map(|v| v - 0.5).collect()),
        )
        .with_column("Close", ColumnData::Float32(opens));
    let mut csm = ColumnSeriesMap::new();
    csm.insert("AAPL/1Min/OHLCV", cs);
    let response = instance.writer().write_csm(&csm).unwrap();
    assert!(response.first_error().is_none());
    instance
}

#[test]
fn scenario_point_query() {
    let dir = TempDir::new().unwrap();
    let instance = seeded_instance(&dir);
    let cs = instance
        .query(
            "SELECT Epoch, Open, High, Low, Close FROM 'AAPL/1Min/OHLCV' \
             WHERE Epoch BETWEEN '2000-01-05-12:30' AND '2000-01-05-13:00'",
            &QueryContext::new(),
        )
        .unwrap();

    assert_eq!(cs.len(), 29);
    assert_eq!(
        cs.column_names(),
        vec!["Epoch", "Open", "High", "Low", "Close"]
    );
    let epochs = cs.epochs();
    assert_eq!(epochs[0], FIRST_ROW);
    assert!(epochs.windows(2).all(|w| w[1] - w[0] == 60));

    // row values round-trip bit-exactly
    let minute = ((FIRST_ROW - DAY_START) / 60) as usize;
    assert_eq!(cs.column("Open").unwrap().f64_at(0), Some(open_at(minute) as f64));
    instance.shutdown().unwrap();
}

#[test]
fn scenario_empty_predicate() {
    let dir = TempDir::new().unwrap();
    let instance = seeded_instance(&dir);
    let cs = instance
        .query(
            "SELECT Epoch, Open, High, Low, Close FROM 'AAPL/1Min/OHLCV' \
             WHERE Epoch < '2000-01-05-12:30' AND Epoch > '2000-01-05-13:00'",
            &QueryContext::new(),
        )
        .unwrap();
    assert_eq!(cs.len(), 0);
    instance.shutdown().unwrap();
}

#[test]
fn scenario_count() {
    let dir = TempDir::new().unwrap();
    let instance = seeded_instance(&dir);
    let cs = instance
        .query(
            "SELECT count(*) FROM 'AAPL/1Min/OHLCV' \
             WHERE Epoch BETWEEN '2000-01-05-12:30' AND '2000-01-05-13:00'",
            &QueryContext::new(),
        )
        .unwrap();
    assert_eq!(cs.column("Count"), Some(&ColumnData::Int64(vec![29])));
    instance.shutdown().unwrap();
}

#[test]
fn scenario_count_before_seed_range() {
    let dir = TempDir::new().unwrap();
    let instance = seeded_instance(&dir);
    let cs = instance
        .query(
            "select count(*) from `AAPL/1Min/OHLCV` where Epoch < 946684800",
            &QueryContext::new(),
        )
        .unwrap();
    assert_eq!(cs.column("Count"), Some(&ColumnData::Int64(vec![0])));
    instance.shutdown().unwrap();
}

#[test]
fn scenario_tickcandler() {
    let dir = TempDir::new().unwrap();
    let instance = seeded_instance(&dir);
    let cs = instance
        .query(
            "SELECT TickCandler('5Min', Open) FROM 'AAPL/1Min/OHLCV' \
             WHERE Epoch BETWEEN '2000-01-05-12:30' AND '2000-01-05-13:00'",
            &QueryContext::new(),
        )
        .unwrap();

    assert_eq!(cs.len(), 6);
    assert_eq!(
        cs.column_names(),
        vec!["Epoch", "Open", "High", "Low", "Close"]
    );
    // windows align on 5-minute boundaries starting at 12:30
    let expected_windows: Vec<i64> = (0..6).map(|k| 947075400 + k * 300).collect();
    assert_eq!(cs.epochs(), expected_windows.as_slice());

    // each candle's O/H/L/C against the seeded opens
    for (k, &window) in expected_windows.iter().enumerate() {
        let first_minute = ((window - DAY_START) / 60).max((FIRST_ROW - DAY_START) / 60) as usize;
        let last_minute = (((window + 240 - DAY_START) / 60) as usize).min(1439).min(
            (947077140 - DAY_START) as usize / 60,
        );
        let opens: Vec<f64> = (first_minute..=last_minute)
            .map(|m| open_at(m) as f64)
            .collect();
        assert_eq!(cs.column("Open").unwrap().f64_at(k), Some(opens[0]));
        assert_eq!(
            cs.column("Close").unwrap().f64_at(k),
            Some(*opens.last().unwrap())
        );
        let high = opens.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let low = opens.iter().cloned().fold(f64::INFINITY, f64::min);
        assert_eq!(cs.column("High").unwrap().f64_at(k), Some(high));
        assert_eq!(cs.column("Low").unwrap().f64_at(k), Some(low));
    }
    instance.shutdown().unwrap();
}

#[test]
fn scenario_insert_select() {
    let dir = TempDir::new().unwrap();
    let instance = seeded_instance(&dir);

    let summary = instance
        .query(
            "INSERT INTO 'AAPL/5Min/OHLCV' SELECT * FROM 'AAPL/1Min/OHLCV' \
             WHERE Epoch BETWEEN '2000-01-05-12:30' AND '2000-01-05-13:00'",
            &QueryContext::new(),
        )
        .unwrap();
    assert_eq!(summary.len(), 1);
    assert_eq!(
        summary.column("RecordsWritten"),
        Some(&ColumnData::Int64(vec![29]))
    );

    // 29 one-minute records coalesce into six 5-minute slots
    let cs = instance
        .query(
            "SELECT * FROM 'AAPL/5Min/OHLCV' WHERE Epoch >= 947030400 AND Epoch <= 947116800",
            &QueryContext::new(),
        )
        .unwrap();
    assert_eq!(cs.len(), 6);
    instance.shutdown().unwrap();
}

#[test]
fn scenario_overwrite_semantics() {
    let dir = TempDir::new().unwrap();
    let instance = seeded_instance(&dir);

    // rewrite the 12:31 bar with a new open
    let cs = ColumnSeries::new()
        .with_column("Epoch", ColumnData::Int64(vec![FIRST_ROW]))
        .with_column("Open", ColumnData::Float32(vec![999.0]))
        .with_column("High", ColumnData::Float32(vec![999.5]))
        .with_column("Low", ColumnData::Float32(vec![998.5]))
        .with_column("Close", ColumnData::Float32(vec![999.0]));
    let mut csm = ColumnSeriesMap::new();
    csm.insert("AAPL/1Min/OHLCV", cs);
    instance.writer().write_csm(&csm).unwrap();

    let out = instance
        .query(
            &format!("SELECT Open FROM 'AAPL/1Min/OHLCV' WHERE Epoch = {}", FIRST_ROW),
            &QueryContext::new(),
        )
        .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out.column("Open").unwrap().f64_at(0), Some(999.0));
    instance.shutdown().unwrap();
}

#[test]
fn scenario_insert_on_missing_bucket_fails() {
    let dir = TempDir::new().unwrap();
    let instance = seeded_instance(&dir);
    let result = instance.query(
        "INSERT INTO 'MSFT/5Min/OHLCV' SELECT * FROM 'AAPL/1Min/OHLCV' \
         WHERE Epoch BETWEEN '2000-01-05-12:30' AND '2000-01-05-13:00'",
        &QueryContext::new(),
    );
    assert!(matches!(result, Err(TickError::Rejected(_))));
    instance.shutdown().unwrap();
}
