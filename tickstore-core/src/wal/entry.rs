//! WAL file format: header, message framing, transaction payloads

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::types::BucketMeta;
use crate::{Result, TickError};

/// `"MKWL"` in the first four WAL header bytes
pub const WAL_MAGIC: u32 = 0x4D4B_574C;
pub const WAL_VERSION: u16 = 1;
/// Fixed header region; the first message starts at this offset
pub const WAL_HEADER_SIZE: usize = 64;

/// Replay flag persisted in the WAL header. A WAL is dirty from first write
/// until its final checkpoint has been flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Clean = 1,
    Dirty = 2,
}

impl TryFrom<u8> for ReplayState {
    type Error = TickError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ReplayState::Clean),
            2 => Ok(ReplayState::Dirty),
            _ => Err(TickError::Corruption(format!(
                "invalid WAL replay state: {}",
                value
            ))),
        }
    }
}

/// Writer liveness persisted in the WAL header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterStatus {
    Live = 1,
    Done = 2,
}

impl TryFrom<u8> for WriterStatus {
    type Error = TickError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WriterStatus::Live),
            2 => Ok(WriterStatus::Done),
            _ => Err(TickError::Corruption(format!(
                "invalid WAL writer status: {}",
                value
            ))),
        }
    }
}

/// Fixed-size WAL file header
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalHeader {
    pub owner_pid: u32,
    pub replay_state: ReplayState,
    pub write_status: WriterStatus,
    pub last_checkpoint_txn: u64,
}

impl WalHeader {
    pub fn new(owner_pid: u32, last_checkpoint_txn: u64) -> Self {
        Self {
            owner_pid,
            replay_state: ReplayState::Dirty,
            write_status: WriterStatus::Live,
            last_checkpoint_txn,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(WAL_HEADER_SIZE);
        buf.put_u32_le(WAL_MAGIC);
        buf.put_u16_le(WAL_VERSION);
        buf.put_u32_le(self.owner_pid);
        buf.put_u8(self.replay_state as u8);
        buf.put_u8(self.write_status as u8);
        buf.put_u64_le(self.last_checkpoint_txn);
        let mut out = buf.to_vec();
        out.resize(WAL_HEADER_SIZE, 0);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < WAL_HEADER_SIZE {
            return Err(TickError::Corruption("WAL header too short".into()));
        }
        let mut cursor = std::io::Cursor::new(data);
        let magic = cursor.get_u32_le();
        if magic != WAL_MAGIC {
            return Err(TickError::Corruption(format!(
                "bad WAL magic: {:#010x}",
                magic
            )));
        }
        let version = cursor.get_u16_le();
        if version != WAL_VERSION {
            return Err(TickError::Corruption(format!(
                "unsupported WAL version: {}",
                version
            )));
        }
        let owner_pid = cursor.get_u32_le();
        let replay_state = ReplayState::try_from(cursor.get_u8())?;
        let write_status = WriterStatus::try_from(cursor.get_u8())?;
        let last_checkpoint_txn = cursor.get_u64_le();
        Ok(Self {
            owner_pid,
            replay_state,
            write_status,
            last_checkpoint_txn,
        })
    }
}

/// WAL message type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalMessageType {
    /// Transaction group payload
    TgData = 1,
    /// Transaction state transition (prepared, committed, rejected,
    /// checkpointed)
    TxnStatus = 2,
    /// Writer liveness marker
    Status = 3,
}

impl TryFrom<u8> for WalMessageType {
    type Error = TickError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalMessageType::TgData),
            2 => Ok(WalMessageType::TxnStatus),
            3 => Ok(WalMessageType::Status),
            _ => Err(TickError::InvalidFormat(format!(
                "invalid WAL message type: {}",
                value
            ))),
        }
    }
}

/// Per-transaction state recorded by `TXN_STATUS` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Prepared,
    Committed,
    Rejected,
    Checkpointed,
}

/// One bucket-year's worth of encoded records inside a transaction.
/// `meta` carries the bucket's schema so replay on an empty replica can
/// create the bucket before applying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteItem {
    pub bucket_key: String,
    pub year: i32,
    pub data: Vec<u8>,
    pub records: u32,
    pub meta: BucketMeta,
}

/// The atomic write unit: all record writes committed together, totally
/// ordered by `sequence`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionGroup {
    pub txn_id: u64,
    pub sequence: u64,
    pub items: Vec<WriteItem>,
}

/// A decoded WAL message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalMessage {
    TgData(TransactionGroup),
    TxnStatus {
        txn_id: u64,
        sequence: u64,
        state: TxnState,
    },
    Status {
        writer_live: bool,
    },
}

impl WalMessage {
    fn message_type(&self) -> WalMessageType {
        match self {
            WalMessage::TgData(_) => WalMessageType::TgData,
            WalMessage::TxnStatus { .. } => WalMessageType::TxnStatus,
            WalMessage::Status { .. } => WalMessageType::Status,
        }
    }

    /// Serialize as `type(1B) | length(4B LE) | body | crc32(4B LE)`,
    /// the checksum covering the body only
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body =
            bincode::serialize(self).map_err(|e| TickError::InvalidFormat(e.to_string()))?;
        let mut buf = BytesMut::with_capacity(body.len() + 9);
        buf.put_u8(self.message_type() as u8);
        buf.put_u32_le(body.len() as u32 + 4);
        buf.put_slice(&body);
        buf.put_u32_le(crc32fast::hash(&body));
        Ok(buf.to_vec())
    }

    /// Decode one message from the front of `data`, returning it with the
    /// number of bytes consumed. `Ok(None)` means a torn tail (incomplete
    /// message at end of file).
    pub fn decode(data: &[u8]) -> Result<Option<(WalMessage, usize)>> {
        if data.len() < 5 {
            return Ok(None);
        }
        WalMessageType::try_from(data[0])?;
        let len = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
        if len < 4 || data.len() < 5 + len {
            return Ok(None);
        }
        let body = &data[5..5 + len - 4];
        let expected = u32::from_le_bytes([
            data[5 + len - 4],
            data[5 + len - 3],
            data[5 + len - 2],
            data[5 + len - 1],
        ]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(TickError::ChecksumMismatch { expected, actual });
        }
        let msg =
            bincode::deserialize(body).map_err(|e| TickError::Corruption(e.to_string()))?;
        Ok(Some((msg, 5 + len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Column, ElementType, RecordKind, Schema};

    fn item() -> WriteItem {
        WriteItem {
            bucket_key: "AAPL/1Min/OHLCV".into(),
            year: 2000,
            data: vec![1, 2, 3, 4],
            records: 1,
            meta: BucketMeta {
                schema: Schema::new(vec![Column::new("Epoch", ElementType::Int64)]).unwrap(),
                timeframe: "1Min".parse().unwrap(),
                record_kind: RecordKind::Fixed,
            },
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = WalHeader::new(4242, 17);
        let bytes = header.encode();
        assert_eq!(bytes.len(), WAL_HEADER_SIZE);
        assert_eq!(WalHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_message_round_trip() {
        let msg = WalMessage::TgData(TransactionGroup {
            txn_id: 7,
            sequence: 7,
            items: vec![item()],
        });
        let bytes = msg.encode().unwrap();
        let (decoded, consumed) = WalMessage::decode(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_torn_tail_is_not_an_error() {
        let msg = WalMessage::TxnStatus {
            txn_id: 1,
            sequence: 1,
            state: TxnState::Committed,
        };
        let bytes = msg.encode().unwrap();
        assert!(WalMessage::decode(&bytes[..bytes.len() - 3]).unwrap().is_none());
        assert!(WalMessage::decode(&bytes[..2]).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_body_fails_checksum() {
        let msg = WalMessage::TxnStatus {
            txn_id: 1,
            sequence: 1,
            state: TxnState::Committed,
        };
        let mut bytes = msg.encode().unwrap();
        bytes[7] ^= 0xFF;
        assert!(matches!(
            WalMessage::decode(&bytes),
            Err(TickError::ChecksumMismatch { .. })
        ));
    }
}
