//! Trigger matchers
//!
//! Triggers observe committed writes. Each matcher pairs a bucket-key
//! pattern (path components, `*` matches one component) with a trigger
//! implementation; matchers are evaluated after commit against the affected
//! `(bucket, epoch range)` and fire on a background thread, never blocking
//! the commit path.

use std::sync::Arc;
use tracing::info;

use crate::types::TimeRange;
use crate::wal::WriteItem;
use crate::writer::item_range;

/// A post-commit observer
pub trait Trigger: Send + Sync {
    fn fire(&self, bucket_key: &str, range: TimeRange, records: u32);
}

/// Component-wise bucket key pattern, e.g. `*/1Min/OHLCV`
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    let pat: Vec<&str> = pattern.split('/').collect();
    let parts: Vec<&str> = key.split('/').collect();
    pat.len() == parts.len()
        && pat
            .iter()
            .zip(parts.iter())
            .all(|(p, k)| *p == "*" || p == k)
}

struct Matcher {
    pattern: String,
    trigger: Arc<dyn Trigger>,
}

/// The set of configured trigger matchers
#[derive(Default)]
pub struct TriggerMatchers {
    matchers: Vec<Matcher>,
}

impl TriggerMatchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: impl Into<String>, trigger: Arc<dyn Trigger>) {
        self.matchers.push(Matcher {
            pattern: pattern.into(),
            trigger,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Fire matching triggers for every item of a committed transaction on a
    /// detached thread
    pub fn fire(&self, items: &[WriteItem]) {
        if self.matchers.is_empty() {
            return;
        }
        let mut fired: Vec<(Arc<dyn Trigger>, String, TimeRange, u32)> = Vec::new();
        for item in items {
            let Some(range) = item_range(item) else { continue };
            for matcher in &self.matchers {
                if pattern_matches(&matcher.pattern, &item.bucket_key) {
                    fired.push((
                        matcher.trigger.clone(),
                        item.bucket_key.clone(),
                        range,
                        item.records,
                    ));
                }
            }
        }
        if fired.is_empty() {
            return;
        }
        std::thread::spawn(move || {
            for (trigger, key, range, records) in fired {
                trigger.fire(&key, range, records);
            }
        });
    }
}

/// Built-in trigger that records fired ranges in the log
pub struct LoggingTrigger;

impl Trigger for LoggingTrigger {
    fn fire(&self, bucket_key: &str, range: TimeRange, records: u32) {
        info!(
            bucket = bucket_key,
            start = range.start,
            end = range.end,
            records,
            "trigger fired"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BucketMeta, Column, ElementType, RecordKind, Schema};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("*/1Min/OHLCV", "AAPL/1Min/OHLCV"));
        assert!(pattern_matches("AAPL/*/*", "AAPL/5Min/TICK"));
        assert!(!pattern_matches("*/1Min/OHLCV", "AAPL/5Min/OHLCV"));
        assert!(!pattern_matches("*/1Min", "AAPL/1Min/OHLCV"));
    }

    struct CountingTrigger(Arc<AtomicU32>);

    impl Trigger for CountingTrigger {
        fn fire(&self, _bucket_key: &str, _range: TimeRange, records: u32) {
            self.0.fetch_add(records, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_fire_matches_and_counts() {
        let count = Arc::new(AtomicU32::new(0));
        let mut matchers = TriggerMatchers::new();
        matchers.register("*/1Min/OHLCV", Arc::new(CountingTrigger(count.clone())));

        let schema = Schema::new(vec![Column::new("Epoch", ElementType::Int64)]).unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(&947075400i64.to_le_bytes());
        data.extend_from_slice(&947075460i64.to_le_bytes());
        let item = WriteItem {
            bucket_key: "AAPL/1Min/OHLCV".into(),
            year: 2000,
            data,
            records: 2,
            meta: BucketMeta {
                schema,
                timeframe: "1Min".parse().unwrap(),
                record_kind: RecordKind::Fixed,
            },
        };
        matchers.fire(&[item]);

        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) != 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
