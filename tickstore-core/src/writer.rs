//! Write path
//!
//! `Writer::write_csm` validates each bucket's payload against its schema,
//! splits rows by calendar year, encodes them to record bytes, commits one
//! WAL transaction covering every bucket-year item, applies the items to
//! segment files, publishes the committed transaction to replication, and
//! fires trigger matchers on a background thread. With `WALBypass` (the
//! replica apply path) items go straight to the segment files.

use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{Bucket, Catalog};
use crate::replication::ReplicationSender;
use crate::segment::SegmentFile;
use crate::trigger::TriggerMatchers;
use crate::types::{year_of_epoch, ColumnSeries, ColumnSeriesMap, TimeRange};
use crate::wal::{TransactionGroup, Wal, WriteItem};
use crate::{Result, TickError};

/// Per-bucket outcome of a `write_csm` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketWriteStatus {
    pub bucket: String,
    pub records: u32,
    pub error: Option<String>,
}

/// Atomic-per-bucket write response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteResponse {
    pub responses: Vec<BucketWriteStatus>,
}

impl WriteResponse {
    /// First per-bucket error, if any
    pub fn first_error(&self) -> Option<&str> {
        self.responses
            .iter()
            .find_map(|r| r.error.as_deref())
    }
}

/// The write surface shared by the query engine's INSERT path and the RPC
/// frontends. Replicas install [`ErrorWriter`] here.
pub trait CsmWriter: Send + Sync {
    fn write_csm(&self, csm: &ColumnSeriesMap) -> Result<WriteResponse>;
}

/// The single writer of an instance
pub struct Writer {
    catalog: Arc<Catalog>,
    wal: Option<Arc<Wal>>,
    replication: Option<Arc<ReplicationSender>>,
    triggers: Arc<TriggerMatchers>,
}

impl Writer {
    pub fn new(
        catalog: Arc<Catalog>,
        wal: Option<Arc<Wal>>,
        replication: Option<Arc<ReplicationSender>>,
        triggers: Arc<TriggerMatchers>,
    ) -> Self {
        Self {
            catalog,
            wal,
            replication,
            triggers,
        }
    }

    fn encode_bucket(
        &self,
        bucket: &Arc<Bucket>,
        cs: &ColumnSeries,
    ) -> Result<Vec<WriteItem>> {
        let schema = bucket.schema();
        let epochs = cs.epochs();
        if epochs.is_empty() {
            if cs.len() > 0 {
                return Err(TickError::SchemaMismatch {
                    bucket: bucket.key().to_string(),
                    reason: "payload lacks an Epoch column".into(),
                });
            }
            return Ok(Vec::new());
        }

        // split row indices by the calendar year of their epoch
        let mut by_year: Vec<(i32, Vec<usize>)> = Vec::new();
        for (row, &epoch) in epochs.iter().enumerate() {
            let year = year_of_epoch(epoch);
            match by_year.iter_mut().find(|(y, _)| *y == year) {
                Some((_, rows)) => rows.push(row),
                None => by_year.push((year, vec![row])),
            }
        }
        by_year.sort_by_key(|(year, _)| *year);

        let mut items = Vec::with_capacity(by_year.len());
        for (year, rows) in by_year {
            let slice = cs.take(&rows);
            let data = slice.encode_records(schema).map_err(|e| match e {
                TickError::SchemaMismatch { reason, .. } => TickError::SchemaMismatch {
                    bucket: bucket.key().to_string(),
                    reason,
                },
                other => other,
            })?;
            items.push(WriteItem {
                bucket_key: bucket.key().to_string(),
                year,
                data,
                records: rows.len() as u32,
                meta: bucket.meta().clone(),
            });
        }
        Ok(items)
    }
}

impl CsmWriter for Writer {
    fn write_csm(&self, csm: &ColumnSeriesMap) -> Result<WriteResponse> {
        let mut response = WriteResponse::default();
        let mut items: Vec<WriteItem> = Vec::new();
        let mut views = Vec::new();

        for (key, cs) in csm.iter() {
            let bucket = match self.catalog.resolve(key) {
                Ok(b) => b,
                Err(e) => {
                    response.responses.push(BucketWriteStatus {
                        bucket: key.clone(),
                        records: 0,
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };
            views.push(bucket.write_view());
            match self.encode_bucket(&bucket, cs) {
                Ok(bucket_items) => {
                    let records = bucket_items.iter().map(|i| i.records).sum();
                    items.extend(bucket_items);
                    response.responses.push(BucketWriteStatus {
                        bucket: key.clone(),
                        records,
                        error: None,
                    });
                }
                Err(e) => {
                    response.responses.push(BucketWriteStatus {
                        bucket: key.clone(),
                        records: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if items.is_empty() {
            return Ok(response);
        }

        let tg = match &self.wal {
            Some(wal) => {
                let tg = wal.commit(items)?;
                let segments = apply_items(&self.catalog, &tg.items, false)?;
                if wal.config().background_sync {
                    wal.mark_dirty(segments);
                } else {
                    for seg in segments {
                        seg.sync()?;
                    }
                }
                tg
            }
            None => {
                // WAL bypass: commit straight to segment files
                let sequence = 0;
                apply_items(&self.catalog, &items, false)?;
                TransactionGroup {
                    txn_id: sequence,
                    sequence,
                    items,
                }
            }
        };

        if let Some(sender) = &self.replication {
            sender.publish(&tg);
        }
        self.triggers.fire(&tg.items);
        debug!(
            sequence = tg.sequence,
            buckets = response.responses.len(),
            "write_csm committed"
        );
        Ok(response)
    }
}

/// Rejects every write; installed as the RPC writer on replicas
pub struct ErrorWriter;

impl CsmWriter for ErrorWriter {
    fn write_csm(&self, _csm: &ColumnSeriesMap) -> Result<WriteResponse> {
        Err(TickError::ReadOnlyReplica)
    }
}

/// Apply encoded items to segment files in order. Used by the commit path,
/// WAL replay, and the replication receiver; idempotent by construction.
/// With `create_missing` set, unknown buckets are created from the item's
/// carried metadata (replica bootstrap).
pub fn apply_items(
    catalog: &Arc<Catalog>,
    items: &[WriteItem],
    create_missing: bool,
) -> Result<Vec<Arc<SegmentFile>>> {
    let mut touched = Vec::with_capacity(items.len());
    for item in items {
        let bucket = match catalog.resolve(&item.bucket_key) {
            Ok(b) => b,
            Err(TickError::BucketNotFound(_)) if create_missing => {
                catalog.create(&item.bucket_key, item.meta.clone())?
            }
            Err(e) => return Err(e),
        };
        let segment = bucket.get_or_open_year(item.year)?;
        segment.write_records(&item.data)?;
        touched.push(segment);
    }
    Ok(touched)
}

/// Epoch span touched by a write item, for trigger notification
pub fn item_range(item: &WriteItem) -> Option<TimeRange> {
    let rec_len = item.meta.schema.record_length();
    if rec_len == 0 || item.data.len() < rec_len {
        return None;
    }
    let mut min = i64::MAX;
    let mut max = i64::MIN;
    for record in item.data.chunks_exact(rec_len) {
        let epoch = i64::from_le_bytes([
            record[0], record[1], record[2], record[3], record[4], record[5], record[6], record[7],
        ]);
        min = min.min(epoch);
        max = max.max(epoch);
    }
    Some(TimeRange::new(min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BucketMeta, Column, ColumnData, ElementType, RecordKind, Schema};
    use crate::wal::WalConfig;
    use tempfile::TempDir;

    fn ohlcv_meta() -> BucketMeta {
        BucketMeta {
            schema: Schema::new(vec![
                Column::new("Epoch", ElementType::Int64),
                Column::new("Open", ElementType::Float32),
                Column::new("High", ElementType::Float32),
                Column::new("Low", ElementType::Float32),
                Column::new("Close", ElementType::Float32),
            ])
            .unwrap(),
            timeframe: "1Min".parse().unwrap(),
            record_kind: RecordKind::Fixed,
        }
    }

    fn bars(epochs: Vec<i64>) -> ColumnSeries {
        let n = epochs.len();
        ColumnSeries::new()
            .with_column("Epoch", ColumnData::Int64(epochs))
            .with_column("Open", ColumnData::Float32(vec![10.0; n]))
            .with_column("High", ColumnData::Float32(vec![11.0; n]))
            .with_column("Low", ColumnData::Float32(vec![9.0; n]))
            .with_column("Close", ColumnData::Float32(vec![10.5; n]))
    }

    fn writer_for(dir: &std::path::Path) -> (Arc<Catalog>, Writer) {
        let catalog = Arc::new(Catalog::open(dir.join("data")).unwrap());
        catalog.create("AAPL/1Min/OHLCV", ohlcv_meta()).unwrap();
        let wal = Arc::new(
            Wal::open(
                WalConfig {
                    dir: dir.join("data").join("WAL"),
                    ..WalConfig::default()
                },
                0,
            )
            .unwrap(),
        );
        let writer = Writer::new(
            catalog.clone(),
            Some(wal),
            None,
            Arc::new(TriggerMatchers::default()),
        );
        (catalog, writer)
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let (catalog, writer) = writer_for(dir.path());

        let mut csm = ColumnSeriesMap::new();
        csm.insert("AAPL/1Min/OHLCV", bars(vec![947075400, 947075460]));
        let resp = writer.write_csm(&csm).unwrap();
        assert!(resp.first_error().is_none());
        assert_eq!(resp.responses[0].records, 2);

        let bucket = catalog.resolve("AAPL/1Min/OHLCV").unwrap();
        let seg = bucket.get_or_open_year(2000).unwrap();
        let (lo, hi) = seg
            .slots_for_range(&TimeRange::new(947075400, 947075460))
            .unwrap();
        let cs = ColumnSeries::decode_records(
            seg.schema(),
            &seg.read_slot_range(lo, hi).unwrap(),
            true,
        )
        .unwrap();
        assert_eq!(cs.len(), 2);
        assert_eq!(cs.epochs(), &[947075400, 947075460]);
    }

    #[test]
    fn test_write_splits_across_years() {
        let dir = TempDir::new().unwrap();
        let (catalog, writer) = writer_for(dir.path());

        // 1999-12-31 23:59 and 2000-01-01 00:00
        let mut csm = ColumnSeriesMap::new();
        csm.insert("AAPL/1Min/OHLCV", bars(vec![946684740, 946684800]));
        let resp = writer.write_csm(&csm).unwrap();
        assert_eq!(resp.responses[0].records, 2);

        let bucket = catalog.resolve("AAPL/1Min/OHLCV").unwrap();
        assert_eq!(bucket.years().unwrap(), vec![1999, 2000]);
    }

    #[test]
    fn test_unknown_bucket_reports_not_found() {
        let dir = TempDir::new().unwrap();
        let (_catalog, writer) = writer_for(dir.path());
        let mut csm = ColumnSeriesMap::new();
        csm.insert("TSLA/1Min/OHLCV", bars(vec![947075400]));
        let resp = writer.write_csm(&csm).unwrap();
        assert!(resp.responses[0].error.as_deref().unwrap().contains("not found"));
    }

    #[test]
    fn test_schema_mismatch_reported_per_bucket() {
        let dir = TempDir::new().unwrap();
        let (_catalog, writer) = writer_for(dir.path());
        let bad = ColumnSeries::new()
            .with_column("Epoch", ColumnData::Int64(vec![947075400]))
            .with_column("Open", ColumnData::Float64(vec![10.0]));
        let mut csm = ColumnSeriesMap::new();
        csm.insert("AAPL/1Min/OHLCV", bad);
        let resp = writer.write_csm(&csm).unwrap();
        assert!(resp.first_error().is_some());
    }

    #[test]
    fn test_error_writer_rejects() {
        let csm = ColumnSeriesMap::new();
        assert!(matches!(
            ErrorWriter.write_csm(&csm),
            Err(TickError::ReadOnlyReplica)
        ));
    }
}
