//! Physical WAL file: header maintenance, message appends, rotation naming

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use super::entry::{ReplayState, WalHeader, WalMessage, WriterStatus, WAL_HEADER_SIZE};
use crate::{Result, TickError};

/// WAL file name prefix; full names are `WALFile.<epochMillis>`
pub const WAL_FILE_PREFIX: &str = "WALFile.";

/// An open WAL file. All methods take `&mut self`; the owning [`super::Wal`]
/// serializes access.
pub struct WalFile {
    path: PathBuf,
    file: File,
    header: WalHeader,
    end: u64,
    opened_at: Instant,
}

impl WalFile {
    /// Create a fresh WAL file named by the current epoch milliseconds,
    /// with a dirty/live header carrying the previous checkpoint
    pub fn create(dir: &Path, last_checkpoint_txn: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        // bump the suffix until the name is free; rotation can land twice in
        // the same millisecond
        let (path, file) = loop {
            let path = dir.join(format!("{}{}", WAL_FILE_PREFIX, millis));
            match OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path)
            {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => millis += 1,
                Err(e) => return Err(e.into()),
            }
        };
        let header = WalHeader::new(std::process::id(), last_checkpoint_txn);
        file.write_all_at(&header.encode(), 0)?;
        file.sync_all()?;
        tracing::debug!(path = ?path, "created WAL file");
        Ok(Self {
            path,
            file,
            header,
            end: WAL_HEADER_SIZE as u64,
            opened_at: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &WalHeader {
        &self.header
    }

    /// Bytes appended past the header
    pub fn size(&self) -> u64 {
        self.end - WAL_HEADER_SIZE as u64
    }

    pub fn age(&self) -> std::time::Duration {
        self.opened_at.elapsed()
    }

    /// Append one message at the end of the file (no fsync)
    pub fn append(&mut self, msg: &WalMessage) -> Result<()> {
        let bytes = msg.encode()?;
        self.file
            .write_all_at(&bytes, self.end)
            .map_err(|e| TickError::Rejected(format!("WAL append failed: {}", e)))?;
        self.end += bytes.len() as u64;
        Ok(())
    }

    /// Flush appended messages to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| TickError::Rejected(format!("WAL fsync failed: {}", e)))?;
        Ok(())
    }

    /// Persist a new checkpoint transaction id in the header
    pub fn set_checkpoint(&mut self, txn_id: u64) -> Result<()> {
        self.header.last_checkpoint_txn = txn_id;
        self.rewrite_header()
    }

    /// Flip the replay flag (dirty on first write, clean after checkpoint)
    pub fn set_replay_state(&mut self, state: ReplayState) -> Result<()> {
        self.header.replay_state = state;
        self.rewrite_header()
    }

    /// Mark the writer done (clean shutdown / rotation)
    pub fn set_write_status(&mut self, status: WriterStatus) -> Result<()> {
        self.header.write_status = status;
        self.rewrite_header()
    }

    fn rewrite_header(&mut self) -> Result<()> {
        self.file.write_all_at(&self.header.encode(), 0)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// WAL files under `dir`, ascending by their epoch-millisecond suffix
pub fn list_wal_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found: Vec<(u128, PathBuf)> = Vec::new();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(millis) = name
            .strip_prefix(WAL_FILE_PREFIX)
            .and_then(|m| m.parse::<u128>().ok())
        {
            found.push((millis, entry.path()));
        }
    }
    found.sort_by_key(|(millis, _)| *millis);
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::entry::TxnState;
    use tempfile::TempDir;

    #[test]
    fn test_create_append_and_list() {
        let dir = TempDir::new().unwrap();
        let mut wal = WalFile::create(dir.path(), 0).unwrap();
        assert_eq!(wal.size(), 0);

        wal.append(&WalMessage::TxnStatus {
            txn_id: 1,
            sequence: 1,
            state: TxnState::Committed,
        })
        .unwrap();
        wal.sync().unwrap();
        assert!(wal.size() > 0);

        let files = list_wal_files(dir.path()).unwrap();
        assert_eq!(files, vec![wal.path().to_path_buf()]);
    }

    #[test]
    fn test_header_updates_persist() {
        let dir = TempDir::new().unwrap();
        let path;
        {
            let mut wal = WalFile::create(dir.path(), 0).unwrap();
            wal.set_checkpoint(9).unwrap();
            wal.set_replay_state(ReplayState::Clean).unwrap();
            wal.set_write_status(WriterStatus::Done).unwrap();
            path = wal.path().to_path_buf();
        }
        let data = fs::read(path).unwrap();
        let header = WalHeader::decode(&data).unwrap();
        assert_eq!(header.last_checkpoint_txn, 9);
        assert_eq!(header.replay_state, ReplayState::Clean);
        assert_eq!(header.write_status, WriterStatus::Done);
    }
}
