//! Framed RPC service
//!
//! One request/response surface shared by the HTTP frontend (`POST /rpc`
//! with a length-prefixed body) and the raw TCP listener. Frames are a
//! 4-byte big-endian length followed by a bincode body. Panics inside a
//! request are recovered at this boundary and surfaced as `internal`.

use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use tickstore_core::instance::Instance;
use tickstore_core::query::{Executor, QueryContext};
use tickstore_core::writer::{CsmWriter, WriteResponse};
use tickstore_core::{
    ColumnSeries, ColumnSeriesMap, RecordKind, Schema, TickError, Timeframe,
};

use crate::metrics;

/// Upper bound on one RPC frame
pub const MAX_RPC_FRAME: usize = 64 * 1024 * 1024;

/// One query: either raw SQL or the structured form
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: Option<String>,
    pub bucket_key: Option<String>,
    pub epoch_start: Option<i64>,
    pub epoch_end: Option<i64>,
    pub columns: Vec<String>,
    pub limit: Option<usize>,
    pub functions: Vec<String>,
}

/// RPC request surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    Query {
        requests: Vec<QueryRequest>,
    },
    Write {
        csm: ColumnSeriesMap,
    },
    ListSymbols,
    Create {
        bucket_key: String,
        schema: Schema,
        timeframe: Timeframe,
        record_kind: RecordKind,
    },
    Destroy {
        bucket_key: String,
    },
    ServerVersion,
}

/// RPC response surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    Query { results: Vec<ColumnSeries> },
    Write { response: WriteResponse },
    Symbols { symbols: Vec<String> },
    Created,
    Destroyed,
    Version { version: String },
    Error { kind: String, message: String },
}

impl RpcResponse {
    fn from_error(e: &TickError) -> Self {
        RpcResponse::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// Adapts external requests to Writer/Query calls
pub struct RpcService {
    instance: Arc<Instance>,
    writer: Arc<dyn CsmWriter>,
    queryable: Arc<AtomicBool>,
    read_only: bool,
}

impl RpcService {
    pub fn new(
        instance: Arc<Instance>,
        writer: Arc<dyn CsmWriter>,
        queryable: Arc<AtomicBool>,
        read_only: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance,
            writer,
            queryable,
            read_only,
        })
    }

    /// Handle one request; never panics out
    pub fn handle(&self, request: RpcRequest) -> RpcResponse {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(request))) {
            Ok(response) => response,
            Err(_) => {
                error!("panic recovered at the RPC boundary");
                RpcResponse::Error {
                    kind: "internal".into(),
                    message: "internal error".into(),
                }
            }
        }
    }

    fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::Query { requests } => self.query(requests),
            RpcRequest::Write { csm } => self.write(&csm),
            RpcRequest::ListSymbols => RpcResponse::Symbols {
                symbols: self.instance.catalog().list(),
            },
            RpcRequest::Create {
                bucket_key,
                schema,
                timeframe,
                record_kind,
            } => self.create(&bucket_key, schema, timeframe, record_kind),
            RpcRequest::Destroy { bucket_key } => self.destroy(&bucket_key),
            RpcRequest::ServerVersion => RpcResponse::Version {
                version: tickstore_core::VERSION.to_string(),
            },
        }
    }

    fn executor(&self) -> Executor {
        Executor::new(
            self.instance.catalog().clone(),
            self.instance.registry().clone(),
        )
        .with_writer(self.writer.clone())
    }

    fn query(&self, requests: Vec<QueryRequest>) -> RpcResponse {
        if !self.queryable.load(Ordering::SeqCst) {
            return RpcResponse::Error {
                kind: "unavailable".into(),
                message: "server is shutting down".into(),
            };
        }
        let executor = self.executor();
        let ctx = QueryContext::new();
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            metrics::QUERIES_TOTAL.inc();
            let sql = match request.sql.clone().map(Ok).unwrap_or_else(|| structured_sql(&request)) {
                Ok(sql) => sql,
                Err(message) => {
                    metrics::QUERY_ERRORS_TOTAL.inc();
                    return RpcResponse::Error {
                        kind: "invalid_query".into(),
                        message,
                    };
                }
            };
            match executor.execute_sql(&sql, &ctx) {
                Ok(cs) => results.push(cs),
                Err(e) => {
                    metrics::QUERY_ERRORS_TOTAL.inc();
                    return RpcResponse::from_error(&e);
                }
            }
        }
        RpcResponse::Query { results }
    }

    fn write(&self, csm: &ColumnSeriesMap) -> RpcResponse {
        match self.writer.write_csm(csm) {
            Ok(response) => {
                if response.first_error().is_some() {
                    metrics::WRITE_ERRORS_TOTAL.inc();
                } else {
                    metrics::WRITES_TOTAL.inc();
                }
                RpcResponse::Write { response }
            }
            Err(e) => {
                metrics::WRITE_ERRORS_TOTAL.inc();
                RpcResponse::from_error(&e)
            }
        }
    }

    fn create(
        &self,
        bucket_key: &str,
        schema: Schema,
        timeframe: Timeframe,
        record_kind: RecordKind,
    ) -> RpcResponse {
        if self.read_only {
            return RpcResponse::from_error(&TickError::ReadOnlyReplica);
        }
        let meta = tickstore_core::BucketMeta {
            schema,
            timeframe,
            record_kind,
        };
        match self.instance.catalog().create(bucket_key, meta) {
            Ok(_) => RpcResponse::Created,
            Err(e) => RpcResponse::from_error(&e),
        }
    }

    fn destroy(&self, bucket_key: &str) -> RpcResponse {
        if self.read_only {
            return RpcResponse::from_error(&TickError::ReadOnlyReplica);
        }
        match self.instance.catalog().destroy(bucket_key) {
            Ok(()) => RpcResponse::Destroyed,
            Err(e) => RpcResponse::from_error(&e),
        }
    }
}

/// Build SQL from the structured query form
fn structured_sql(request: &QueryRequest) -> Result<String, String> {
    let bucket = request
        .bucket_key
        .as_deref()
        .ok_or_else(|| "either sql or bucket_key is required".to_string())?;
    let projection = if !request.functions.is_empty() {
        request.functions.join(", ")
    } else if !request.columns.is_empty() {
        request.columns.join(", ")
    } else {
        "*".to_string()
    };
    let mut sql = format!("SELECT {} FROM '{}'", projection, bucket);
    match (request.epoch_start, request.epoch_end) {
        (Some(start), Some(end)) => {
            sql.push_str(&format!(" WHERE Epoch BETWEEN {} AND {}", start, end))
        }
        (Some(start), None) => sql.push_str(&format!(" WHERE Epoch >= {}", start)),
        (None, Some(end)) => sql.push_str(&format!(" WHERE Epoch <= {}", end)),
        (None, None) => {}
    }
    if let Some(limit) = request.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    Ok(sql)
}

// ============================================================================
// Framing
// ============================================================================

fn frame(body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

fn unframe(bytes: &[u8]) -> Result<&[u8], String> {
    if bytes.len() < 4 {
        return Err("frame too short".into());
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_RPC_FRAME || bytes.len() < 4 + len {
        return Err(format!("bad frame length: {}", len));
    }
    Ok(&bytes[4..4 + len])
}

pub fn encode_request(request: &RpcRequest) -> Vec<u8> {
    frame(bincode::serialize(request).expect("request serializes"))
}

pub fn decode_request(bytes: &[u8]) -> Result<RpcRequest, String> {
    bincode::deserialize(unframe(bytes)?).map_err(|e| e.to_string())
}

pub fn encode_response(response: &RpcResponse) -> Vec<u8> {
    frame(bincode::serialize(response).expect("response serializes"))
}

pub fn decode_response(bytes: &[u8]) -> Result<RpcResponse, String> {
    bincode::deserialize(unframe(bytes)?).map_err(|e| e.to_string())
}

/// Raw framed RPC over TCP: one length-prefixed request per read, one
/// length-prefixed response per write
pub async fn serve_tcp(listener: TcpListener, service: Arc<RpcService>) {
    info!(
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        "rpc tcp listener up"
    );
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "rpc accept failed");
                continue;
            }
        };
        let service = service.clone();
        tokio::spawn(async move {
            loop {
                let mut len_buf = [0u8; 4];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    break;
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                if len > MAX_RPC_FRAME {
                    warn!(peer = %peer, len, "oversized rpc frame");
                    break;
                }
                let mut body = vec![0u8; len];
                if stream.read_exact(&mut body).await.is_err() {
                    break;
                }
                let response = match bincode::deserialize::<RpcRequest>(&body) {
                    Ok(request) => service.handle(request),
                    Err(e) => RpcResponse::Error {
                        kind: "invalid_format".into(),
                        message: e.to_string(),
                    },
                };
                if stream
                    .write_all(&encode_response(&response))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let request = RpcRequest::Query {
            requests: vec![QueryRequest {
                sql: Some("SELECT * FROM 'AAPL/1Min/OHLCV'".into()),
                ..QueryRequest::default()
            }],
        };
        let bytes = encode_request(&request);
        let decoded = decode_request(&bytes).unwrap();
        assert!(matches!(decoded, RpcRequest::Query { requests } if requests.len() == 1));
    }

    #[test]
    fn test_structured_sql() {
        let request = QueryRequest {
            bucket_key: Some("AAPL/1Min/OHLCV".into()),
            epoch_start: Some(947075400),
            epoch_end: Some(947077200),
            columns: vec!["Epoch".into(), "Close".into()],
            limit: Some(10),
            ..QueryRequest::default()
        };
        assert_eq!(
            structured_sql(&request).unwrap(),
            "SELECT Epoch, Close FROM 'AAPL/1Min/OHLCV' \
             WHERE Epoch BETWEEN 947075400 AND 947077200 LIMIT 10"
        );

        let functions = QueryRequest {
            bucket_key: Some("AAPL/1Min/OHLCV".into()),
            functions: vec!["count(*)".into()],
            ..QueryRequest::default()
        };
        assert_eq!(
            structured_sql(&functions).unwrap(),
            "SELECT count(*) FROM 'AAPL/1Min/OHLCV'"
        );

        assert!(structured_sql(&QueryRequest::default()).is_err());
    }

    #[test]
    fn test_unframe_rejects_bad_lengths() {
        assert!(unframe(&[0, 0]).is_err());
        assert!(unframe(&[0xFF, 0xFF, 0xFF, 0xFF, 1]).is_err());
    }
}
