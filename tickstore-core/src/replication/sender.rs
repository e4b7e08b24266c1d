//! Replication sender (primary side)
//!
//! Keeps a bounded in-memory ring of recent committed transactions. Each
//! subscriber runs its own task with its own cursor; a subscriber that
//! cannot take a frame within the send timeout is disconnected and must
//! re-subscribe. Every committed transaction is delivered at least once, in
//! sequence order, to every still-connected subscriber.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use super::{read_frame, write_frame, ReplMessage, TxnMessage};
use crate::wal::TransactionGroup;
use crate::{Result, TickError};

/// Default ring capacity (committed transactions)
pub const DEFAULT_RING_CAPACITY: usize = 1024;
/// Default per-frame send timeout before a subscriber is dropped
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Broadcasts committed transactions to subscribed replicas
pub struct ReplicationSender {
    ring: Mutex<VecDeque<Arc<TxnMessage>>>,
    capacity: usize,
    send_timeout: Duration,
    latest: watch::Sender<u64>,
    subscribers: AtomicUsize,
    next_subscriber_id: AtomicU64,
    cursors: Mutex<HashMap<u64, u64>>,
}

impl ReplicationSender {
    pub fn new(capacity: usize, send_timeout: Duration) -> Arc<Self> {
        let (latest, _) = watch::channel(0u64);
        Arc::new(Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            send_timeout,
            latest,
            subscribers: AtomicUsize::new(0),
            next_subscriber_id: AtomicU64::new(0),
            cursors: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_RING_CAPACITY, DEFAULT_SEND_TIMEOUT)
    }

    /// Currently connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// Transactions the slowest connected subscriber is behind by
    /// (observability only)
    pub fn max_lag(&self) -> u64 {
        let latest = *self.latest.borrow();
        self.cursors
            .lock()
            .values()
            .map(|cursor| latest.saturating_sub(*cursor))
            .max()
            .unwrap_or(0)
    }

    /// Called by the writer on every commit (synchronous, lock-only)
    pub fn publish(&self, tg: &TransactionGroup) {
        let msg = Arc::new(TxnMessage::from(tg));
        {
            let mut ring = self.ring.lock();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(msg);
        }
        let _ = self.latest.send(tg.sequence);
    }

    fn next_after(&self, cursor: u64) -> Option<Arc<TxnMessage>> {
        let ring = self.ring.lock();
        ring.iter().find(|m| m.sequence > cursor).cloned()
    }

    fn oldest(&self) -> Option<u64> {
        self.ring.lock().front().map(|m| m.sequence)
    }

    /// Accept loop; one task per subscriber
    pub async fn serve(self: Arc<Self>, listener: TcpListener, tls: Option<TlsAcceptor>) {
        info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            tls = tls.is_some(),
            "replication sender listening"
        );
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "replication accept failed");
                    continue;
                }
            };
            let sender = self.clone();
            match &tls {
                Some(acceptor) => {
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => sender.subscriber_loop(tls_stream, peer).await,
                            Err(e) => warn!(peer = %peer, error = %e, "TLS accept failed"),
                        }
                    });
                }
                None => {
                    tokio::spawn(async move { sender.subscriber_loop(stream, peer).await });
                }
            }
        }
    }

    async fn subscriber_loop<S>(self: Arc<Self>, mut stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.fetch_add(1, Ordering::SeqCst);
        let result = self.stream_to_subscriber(&mut stream, peer, id).await;
        self.subscribers.fetch_sub(1, Ordering::SeqCst);
        self.cursors.lock().remove(&id);
        match result {
            Ok(()) => info!(peer = %peer, "subscriber disconnected"),
            Err(e) => warn!(peer = %peer, error = %e, "subscriber dropped"),
        }
    }

    async fn stream_to_subscriber<S>(
        &self,
        stream: &mut S,
        peer: SocketAddr,
        id: u64,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let subscribe = read_frame(stream).await?;
        let ReplMessage::Subscribe { last_txn_id } = subscribe else {
            return Err(TickError::Replication(
                "expected Subscribe as the first frame".into(),
            ));
        };
        let mut cursor = last_txn_id;
        self.cursors.lock().insert(id, cursor);
        if let Some(oldest) = self.oldest() {
            if cursor + 1 < oldest {
                // the ring no longer covers this subscriber's gap; it will
                // receive everything we still have
                warn!(
                    peer = %peer,
                    cursor,
                    oldest,
                    "subscriber behind retained history, full rebuild may be needed"
                );
            }
        }
        info!(peer = %peer, last_txn_id, "subscriber attached");

        let mut latest = self.latest.subscribe();
        loop {
            while let Some(msg) = self.next_after(cursor) {
                let frame = ReplMessage::Txn((*msg).clone());
                match timeout(self.send_timeout, write_frame(stream, &frame)).await {
                    Ok(Ok(())) => {
                        cursor = msg.sequence;
                        self.cursors.lock().insert(id, cursor);
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        return Err(TickError::Replication(format!(
                            "send to {} timed out after {:?}",
                            peer, self.send_timeout
                        )))
                    }
                }
            }
            if latest.changed().await.is_err() {
                // sender shutting down
                return Ok(());
            }
        }
    }
}
