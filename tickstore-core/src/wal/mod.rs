//! Write-Ahead Log
//!
//! The WAL is the durability boundary and the replication source of truth.
//! A transaction is durable once its COMMITTED marker is on stable storage;
//! only committed transactions are applied to segment files and published
//! to replicas. A background flusher periodically fences admission, syncs
//! the segments touched since the last checkpoint, writes a checkpoint
//! record, and rotates the file when it exceeds the size or age thresholds.
//! Rotated files are deleted only after their checkpoint is flushed.

pub mod entry;
pub mod flusher;
pub mod reader;
pub mod writer;

pub use entry::{
    ReplayState, TransactionGroup, TxnState, WalHeader, WalMessage, WriteItem, WriterStatus,
};
pub use flusher::Flusher;
pub use reader::{recover, RecoverySummary};
pub use writer::WalFile;

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::segment::SegmentFile;
use crate::Result;

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for WAL files
    pub dir: PathBuf,
    /// Flush/checkpoint cadence of the background flusher
    pub rotate_interval: Duration,
    /// Rotate the file once this many payload bytes have been appended
    pub max_file_bytes: u64,
    /// Trigger an early flush once this many bytes are pending
    pub flush_threshold_bytes: u64,
    /// Age at which the current file is rotated at the next checkpoint
    pub max_file_age: Duration,
    /// Sync segment files in the flusher instead of on the commit path
    pub background_sync: bool,
    /// Skip the WAL entirely (replica apply path); local recovery is then
    /// impossible and must be rebuilt from the primary
    pub bypass: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/WAL"),
            rotate_interval: Duration::from_secs(300),
            max_file_bytes: 512 * 1024 * 1024,
            flush_threshold_bytes: 16 * 1024 * 1024,
            max_file_age: Duration::from_secs(3600),
            background_sync: true,
            bypass: false,
        }
    }
}

/// Point-in-time WAL counters, surfaced on state dumps and metrics
#[derive(Debug, Clone)]
pub struct WalStats {
    pub file: PathBuf,
    pub pending_bytes: u64,
    pub last_committed: u64,
    pub last_checkpoint: u64,
}

struct WalState {
    file: WalFile,
    /// Segments touched since the last checkpoint, in commit order
    dirty: Vec<Arc<SegmentFile>>,
    last_committed: u64,
    checkpoint_size: u64,
}

/// The write-ahead log. Single producer (the Writer), single consumer (the
/// flusher); admission is gated so the flusher can fence out new commits
/// while a checkpoint barrier passes.
pub struct Wal {
    config: WalConfig,
    /// Commits hold the shared side, the flusher's fence the exclusive side
    gate: RwLock<()>,
    state: Mutex<WalState>,
    last_checkpoint: AtomicU64,
    next_sequence: AtomicU64,
}

impl Wal {
    /// Open a fresh WAL file. Crash recovery of earlier files is performed
    /// by [`recover`] before this is called; `start_sequence` is the highest
    /// sequence it observed.
    pub fn open(config: WalConfig, start_sequence: u64) -> Result<Self> {
        let file = WalFile::create(&config.dir, start_sequence)?;
        Ok(Self {
            config,
            gate: RwLock::new(()),
            state: Mutex::new(WalState {
                file,
                dirty: Vec::new(),
                last_committed: start_sequence,
                checkpoint_size: 0,
            }),
            last_checkpoint: AtomicU64::new(start_sequence),
            next_sequence: AtomicU64::new(start_sequence),
        })
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Stage and commit a transaction: TG_DATA + PREPARED, fsync, COMMITTED,
    /// fsync. Returns the allocated sequence. Blocks while the flusher's
    /// fence is up.
    pub fn commit(&self, items: Vec<WriteItem>) -> Result<TransactionGroup> {
        let _admit = self.gate.read();
        let mut state = self.state.lock();
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let tg = TransactionGroup {
            txn_id: sequence,
            sequence,
            items,
        };
        state.file.append(&WalMessage::TgData(tg.clone()))?;
        state.file.append(&WalMessage::TxnStatus {
            txn_id: sequence,
            sequence,
            state: TxnState::Prepared,
        })?;
        state.file.sync()?;
        state.file.append(&WalMessage::TxnStatus {
            txn_id: sequence,
            sequence,
            state: TxnState::Committed,
        })?;
        state.file.sync()?;
        state.last_committed = sequence;
        debug!(sequence, items = tg.items.len(), "committed transaction");
        Ok(tg)
    }

    /// Record the segment files a committed transaction touched so the next
    /// checkpoint can sync them
    pub fn mark_dirty(&self, segments: Vec<Arc<SegmentFile>>) {
        let mut state = self.state.lock();
        state.dirty.extend(segments);
    }

    /// Payload bytes appended since the last checkpoint
    pub fn pending_bytes(&self) -> u64 {
        let state = self.state.lock();
        state.file.size().saturating_sub(state.checkpoint_size)
    }

    pub fn stats(&self) -> WalStats {
        let state = self.state.lock();
        WalStats {
            file: state.file.path().to_path_buf(),
            pending_bytes: state.file.size().saturating_sub(state.checkpoint_size),
            last_committed: state.last_committed,
            last_checkpoint: self.last_checkpoint.load(Ordering::SeqCst),
        }
    }

    /// Checkpoint barrier: fence admission, sync dirty segments in commit
    /// order, write the checkpoint record, unfence. Rotates the file when it
    /// exceeds the size or age thresholds; the previous file is removed once
    /// its checkpoint is durable.
    pub fn flush(&self) -> Result<()> {
        let _fence = self.gate.write();
        let mut state = self.state.lock();

        let last = state.last_committed;
        if last > self.last_checkpoint.load(Ordering::SeqCst) {
            let mut synced: HashSet<PathBuf> = HashSet::new();
            for seg in state.dirty.drain(..).collect::<Vec<_>>() {
                if synced.insert(seg.path().to_path_buf()) {
                    seg.sync()?;
                }
            }
            state.file.append(&WalMessage::TxnStatus {
                txn_id: last,
                sequence: last,
                state: TxnState::Checkpointed,
            })?;
            state.file.sync()?;
            state.file.set_checkpoint(last)?;
            state.file.set_replay_state(ReplayState::Clean)?;
            state.checkpoint_size = state.file.size();
            self.last_checkpoint.store(last, Ordering::SeqCst);
            debug!(checkpoint = last, "WAL checkpoint written");
        }

        let rotate = state.file.size() >= self.config.max_file_bytes
            || state.file.age() >= self.config.max_file_age;
        if rotate {
            state.file.set_write_status(WriterStatus::Done)?;
            let old = state.file.path().to_path_buf();
            state.file = WalFile::create(&self.config.dir, last)?;
            state.checkpoint_size = 0;
            std::fs::remove_file(&old)?;
            info!(rotated = ?old, "rotated WAL file");
        }
        Ok(())
    }

    /// Final checkpoint + clean markers; called once on shutdown after
    /// in-flight writes have drained
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        let mut state = self.state.lock();
        state.file.set_replay_state(ReplayState::Clean)?;
        state.file.set_write_status(WriterStatus::Done)?;
        Ok(())
    }
}
