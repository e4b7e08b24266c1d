//! WAL scan and crash recovery
//!
//! Recovery walks every WAL file in rotation order. A file whose header says
//! clean-and-done is already checkpointed and is simply removed; a dirty
//! file is scanned and every COMMITTED transaction past the header
//! checkpoint is re-applied in sequence order. Application is idempotent
//! (fixed-bucket slot writes by construction, variable buckets by
//! `(epoch, nanos)` dedup), so replaying twice is harmless. PREPARED
//! transactions without a COMMITTED marker are discarded.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::entry::{
    ReplayState, TransactionGroup, TxnState, WalHeader, WalMessage, WriterStatus, WAL_HEADER_SIZE,
};
use super::writer::list_wal_files;
use crate::catalog::Catalog;
use crate::writer::apply_items;
use crate::{Result, TickError};

/// Outcome of startup recovery
#[derive(Debug, Default)]
pub struct RecoverySummary {
    /// Transactions re-applied to segment files
    pub replayed: usize,
    /// Highest transaction sequence seen anywhere in the WAL dir; the new
    /// WAL continues from here
    pub max_sequence: u64,
}

/// Parse one WAL file tolerantly: stop at a torn tail, skip messages that
/// fail their checksum.
pub fn read_wal_file(path: &Path) -> Result<(WalHeader, Vec<WalMessage>)> {
    let data = fs::read(path)?;
    let header = WalHeader::decode(&data)?;
    let mut messages = Vec::new();
    let mut pos = WAL_HEADER_SIZE;
    while pos < data.len() {
        match WalMessage::decode(&data[pos..]) {
            Ok(Some((msg, consumed))) => {
                messages.push(msg);
                pos += consumed;
            }
            Ok(None) => {
                if data.len() - pos > 0 {
                    warn!(path = ?path, offset = pos, "torn WAL tail, discarding");
                }
                break;
            }
            Err(TickError::ChecksumMismatch { .. }) => {
                // skip the framed length and keep going
                let len = u32::from_le_bytes([
                    data[pos + 1],
                    data[pos + 2],
                    data[pos + 3],
                    data[pos + 4],
                ]) as usize;
                warn!(path = ?path, offset = pos, "corrupt WAL message, skipping");
                pos += 5 + len;
            }
            Err(e) => return Err(e),
        }
    }
    Ok((header, messages))
}

/// Replay all WAL files under `dir` into the catalog's segment files, then
/// delete them. Returns the number of transactions replayed and the highest
/// sequence seen, which seeds the fresh WAL.
pub fn recover(dir: &Path, catalog: &Arc<Catalog>) -> Result<RecoverySummary> {
    let mut summary = RecoverySummary::default();
    for path in list_wal_files(dir)? {
        let (header, messages) = match read_wal_file(&path) {
            Ok(parsed) => parsed,
            Err(e) if e.is_corruption() => {
                warn!(path = ?path, error = %e, "quarantining unreadable WAL file");
                let quarantine = path.with_extension("quarantine");
                fs::rename(&path, quarantine)?;
                continue;
            }
            Err(e) => return Err(e),
        };
        summary.max_sequence = summary.max_sequence.max(header.last_checkpoint_txn);

        let clean =
            header.replay_state == ReplayState::Clean && header.write_status == WriterStatus::Done;
        if !clean {
            let replayed = replay_messages(&messages, header.last_checkpoint_txn, catalog)?;
            if replayed > 0 {
                info!(path = ?path, replayed, "replayed dirty WAL file");
            }
            summary.replayed += replayed;
        }
        for msg in &messages {
            if let WalMessage::TgData(tg) = msg {
                summary.max_sequence = summary.max_sequence.max(tg.sequence);
            }
        }
        fs::remove_file(&path)?;
    }
    Ok(summary)
}

fn replay_messages(
    messages: &[WalMessage],
    last_checkpoint: u64,
    catalog: &Arc<Catalog>,
) -> Result<usize> {
    let mut groups: BTreeMap<u64, &TransactionGroup> = BTreeMap::new();
    let mut committed: Vec<u64> = Vec::new();
    let mut checkpointed = last_checkpoint;

    for msg in messages {
        match msg {
            WalMessage::TgData(tg) => {
                groups.insert(tg.sequence, tg);
            }
            WalMessage::TxnStatus {
                sequence, state, ..
            } => match state {
                TxnState::Committed => committed.push(*sequence),
                TxnState::Checkpointed => checkpointed = checkpointed.max(*sequence),
                TxnState::Prepared | TxnState::Rejected => {}
            },
            WalMessage::Status { .. } => {}
        }
    }

    committed.sort_unstable();
    let mut replayed = 0;
    let mut touched = Vec::new();
    for sequence in committed {
        if sequence <= checkpointed {
            continue;
        }
        let Some(tg) = groups.get(&sequence) else {
            warn!(sequence, "COMMITTED marker without TG_DATA, skipping");
            continue;
        };
        touched.extend(apply_items(catalog, &tg.items, true)?);
        replayed += 1;
    }
    // the WAL file is removed after replay, so the segments must be on
    // stable storage first
    let mut synced = std::collections::HashSet::new();
    for segment in touched {
        if synced.insert(segment.path().to_path_buf()) {
            segment.sync()?;
        }
    }
    Ok(replayed)
}
