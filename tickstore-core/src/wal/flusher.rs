//! Background WAL flusher
//!
//! One thread per instance. Wakes on a short tick and runs the checkpoint
//! pass when the configured interval has elapsed or pending bytes cross the
//! flush threshold.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info};

use super::Wal;

const TICK: Duration = Duration::from_millis(200);

struct Signal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

/// Handle to the flusher thread
pub struct Flusher {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl Flusher {
    /// Spawn the flusher for `wal`
    pub fn spawn(wal: Arc<Wal>) -> Flusher {
        let signal = Arc::new(Signal {
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let thread_signal = signal.clone();
        let handle = std::thread::Builder::new()
            .name("wal-flusher".into())
            .spawn(move || run(wal, thread_signal))
            .expect("spawn wal-flusher thread");
        Flusher {
            signal,
            handle: Some(handle),
        }
    }

    /// Stop the thread. The caller runs the final checkpoint via
    /// [`Wal::close`] after in-flight writes have drained.
    pub fn stop(mut self) {
        {
            let mut stopped = self.signal.stopped.lock();
            *stopped = true;
            self.signal.condvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!("WAL flusher stopped");
    }
}

fn run(wal: Arc<Wal>, signal: Arc<Signal>) {
    let interval = wal.config().rotate_interval;
    let threshold = wal.config().flush_threshold_bytes;
    let mut last_flush = Instant::now();
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if *stopped {
                return;
            }
            signal.condvar.wait_for(&mut stopped, TICK);
            if *stopped {
                return;
            }
        }
        let due = last_flush.elapsed() >= interval || wal.pending_bytes() >= threshold;
        if !due {
            continue;
        }
        if let Err(e) = wal.flush() {
            error!(error = %e, "WAL flush failed");
        }
        last_flush = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{WalConfig, WriteItem};
    use crate::types::{BucketMeta, Column, ElementType, RecordKind, Schema};
    use tempfile::TempDir;

    #[test]
    fn test_flusher_checkpoints_on_threshold() {
        let dir = TempDir::new().unwrap();
        let config = WalConfig {
            dir: dir.path().to_path_buf(),
            rotate_interval: Duration::from_secs(3600),
            flush_threshold_bytes: 1,
            ..WalConfig::default()
        };
        let wal = Arc::new(Wal::open(config, 0).unwrap());
        let flusher = Flusher::spawn(wal.clone());

        wal.commit(vec![WriteItem {
            bucket_key: "AAPL/1Min/OHLCV".into(),
            year: 2000,
            data: vec![0; 8],
            records: 1,
            meta: BucketMeta {
                schema: Schema::new(vec![Column::new("Epoch", ElementType::Int64)]).unwrap(),
                timeframe: "1Min".parse().unwrap(),
                record_kind: RecordKind::Fixed,
            },
        }])
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while wal.stats().last_checkpoint != 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(wal.stats().last_checkpoint, 1);
        flusher.stop();
    }
}
