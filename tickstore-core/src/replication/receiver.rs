//! Replication receiver (replica side)
//!
//! Dials the primary (optionally over TLS), subscribes with the last
//! applied transaction id, and replays every inbound transaction through
//! the WAL-bypass apply path. Stream errors reconnect through the
//! [`Retrier`]; duplicate deliveries after an unclean reconnect are
//! absorbed by idempotent replay.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use super::retry::{Retrier, RetryPolicy};
use super::{read_frame, write_frame, ReplMessage};
use crate::catalog::Catalog;
use crate::writer::apply_items;
use crate::{Result, TickError};

/// Pulls and replays the primary's committed transactions
pub struct ReplicationReceiver {
    master: String,
    catalog: Arc<Catalog>,
    tls: Option<TlsConnector>,
    last_applied: AtomicU64,
    progress: Arc<AtomicBool>,
}

impl ReplicationReceiver {
    pub fn new(master: impl Into<String>, catalog: Arc<Catalog>) -> Self {
        Self {
            master: master.into(),
            catalog,
            tls: None,
            last_applied: AtomicU64::new(0),
            progress: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Trust the primary's certificate (PEM) and speak TLS
    pub fn with_tls(mut self, cert_file: &Path) -> Result<Self> {
        let pem = std::fs::read(cert_file)?;
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| TickError::Replication(e.to_string()))?;
            roots
                .add(cert)
                .map_err(|e| TickError::Replication(e.to_string()))?;
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        self.tls = Some(TlsConnector::from(Arc::new(config)));
        Ok(self)
    }

    /// Highest transaction id applied locally
    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    /// One connection lifecycle: connect, subscribe, replay until the
    /// stream breaks
    pub async fn run_once(&self) -> Result<()> {
        let tcp = TcpStream::connect(&self.master).await?;
        info!(master = %self.master, last_applied = self.last_applied(), "replication stream open");
        match &self.tls {
            Some(connector) => {
                let host = self.master.split(':').next().unwrap_or(&self.master);
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|e| TickError::Replication(e.to_string()))?;
                let stream = connector.connect(server_name, tcp).await?;
                self.replay_stream(stream).await
            }
            None => self.replay_stream(tcp).await,
        }
    }

    /// Reconnect loop with exponential backoff, capped at the policy's
    /// attempt limit; the counter resets on any successful receive
    pub async fn run_with_retry(self: Arc<Self>, policy: RetryPolicy) -> Result<()> {
        let retrier = Retrier::with_progress(policy, self.progress.clone());
        retrier.run(|| self.run_once()).await
    }

    async fn replay_stream<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_frame(
            &mut stream,
            &ReplMessage::Subscribe {
                last_txn_id: self.last_applied(),
            },
        )
        .await?;

        loop {
            let msg = read_frame(&mut stream).await?;
            let ReplMessage::Txn(txn) = msg else {
                return Err(TickError::Replication(
                    "unexpected frame from primary".into(),
                ));
            };
            apply_items(&self.catalog, &txn.items, true)?;
            self.last_applied.store(txn.txn_id, Ordering::SeqCst);
            self.progress.store(true, Ordering::SeqCst);
            debug!(sequence = txn.sequence, items = txn.items.len(), "applied transaction");
        }
    }
}
