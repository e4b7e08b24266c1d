//! Error types for tickstore

use thiserror::Error;

/// Result type alias for tickstore operations
pub type Result<T> = std::result::Result<T, TickError>;

/// Tickstore error types
#[derive(Error, Debug)]
pub enum TickError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bucket does not exist
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    /// Bucket exists with a different schema, or a write payload does not
    /// match the bucket schema
    #[error("schema mismatch for {bucket}: {reason}")]
    SchemaMismatch { bucket: String, reason: String },

    /// Malformed or unsupported query
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Checksum mismatch
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Data corruption detected (bad magic, bad version, inconsistent
    /// checkpoint). The affected bucket or WAL is quarantined.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Write rejected (WAL full, disk full). The server stays up and keeps
    /// serving reads.
    #[error("write rejected: {0}")]
    Rejected(String),

    /// Writes are not accepted on a replica
    #[error("writes are not allowed on a read-only replica")]
    ReadOnlyReplica,

    /// Bucket destroy refused while read or write views are outstanding
    #[error("bucket busy: {0}")]
    BucketBusy(String),

    /// Replication stream failure
    #[error("replication error: {0}")]
    Replication(String),

    /// Invalid data format
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Operation aborted via its cancellation handle
    #[error("cancelled")]
    Cancelled,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl TickError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TickError::Io(_) | TickError::Replication(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TickError::Corruption(_) | TickError::ChecksumMismatch { .. }
        )
    }

    /// Short machine-readable kind, surfaced through the RPC boundary
    pub fn kind(&self) -> &'static str {
        match self {
            TickError::Io(_) => "io",
            TickError::BucketNotFound(_) => "bucket_not_found",
            TickError::SchemaMismatch { .. } => "schema_mismatch",
            TickError::InvalidQuery(_) => "invalid_query",
            TickError::ChecksumMismatch { .. } => "checksum_mismatch",
            TickError::Corruption(_) => "corruption",
            TickError::Rejected(_) => "rejected",
            TickError::ReadOnlyReplica => "read_only_replica",
            TickError::BucketBusy(_) => "bucket_busy",
            TickError::Replication(_) => "replication",
            TickError::InvalidFormat(_) => "invalid_format",
            TickError::Cancelled => "cancelled",
            TickError::Internal(_) => "internal",
        }
    }
}
