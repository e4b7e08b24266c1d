//! Primary→replica streaming
//!
//! A replica dials the primary, sends `Subscribe{last_txn_id}`, and the
//! primary streams every later committed transaction in sequence order.
//! Frames are 4-byte big-endian length-prefixed bincode bodies with a
//! trailing CRC32; TLS is optional on both ends. Delivery is at-least-once;
//! replay on the replica is idempotent.

pub mod receiver;
pub mod retry;
pub mod sender;

pub use receiver::ReplicationReceiver;
pub use retry::{Retrier, RetryPolicy};
pub use sender::ReplicationSender;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wal::{TransactionGroup, WriteItem};
use crate::{Result, TickError};

/// Upper bound on a single frame; anything larger is treated as corruption
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// A committed transaction on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnMessage {
    pub sequence: u64,
    pub txn_id: u64,
    pub items: Vec<WriteItem>,
}

impl From<&TransactionGroup> for TxnMessage {
    fn from(tg: &TransactionGroup) -> Self {
        Self {
            sequence: tg.sequence,
            txn_id: tg.txn_id,
            items: tg.items.clone(),
        }
    }
}

/// Replication stream message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplMessage {
    /// Replica → primary, once per connection
    Subscribe { last_txn_id: u64 },
    /// Primary → replica, in sequence order
    Txn(TxnMessage),
}

/// Write one frame: `len(4B BE) | bincode body | crc32(4B BE)`; the length
/// covers body + checksum
pub async fn write_frame<W>(writer: &mut W, msg: &ReplMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(msg).map_err(|e| TickError::Replication(e.to_string()))?;
    let len = (body.len() + 4) as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.write_all(&crc32fast::hash(&body).to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, validating length and checksum
pub async fn read_frame<R>(reader: &mut R) -> Result<ReplMessage>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 4 || len > MAX_FRAME_BYTES {
        return Err(TickError::Corruption(format!(
            "replication frame length out of range: {}",
            len
        )));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    let body = &frame[..len - 4];
    let expected = u32::from_be_bytes([
        frame[len - 4],
        frame[len - 3],
        frame[len - 2],
        frame[len - 1],
    ]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(TickError::ChecksumMismatch { expected, actual });
    }
    bincode::deserialize(body).map_err(|e| TickError::Corruption(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let msg = ReplMessage::Subscribe { last_txn_id: 42 };
        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        let msg = ReplMessage::Subscribe { last_txn_id: 42 };
        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).await.unwrap();
        let len = buf.len();
        buf[len / 2] ^= 0xFF;

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(TickError::Corruption(_))
        ));
    }
}
