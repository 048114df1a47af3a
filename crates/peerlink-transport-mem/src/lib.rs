//! peerlink-transport-mem: In-memory transport backed by paired byte
//! channels.
//!
//! Lets a peer run without any network dependency. [`MemConnection::pair`]
//! gives two pre-connected endpoints; [`MemProvider`] adds a named
//! listener registry so dial/listen flows (including reconnect scenarios)
//! run fully in process.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use peerlink_core::{Connection, Provider, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 16;

/// One end of an in-memory connection pair.
pub struct MemConnection {
    /// Outbound half. Taken on close so the remote's receive unblocks.
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    /// Cancelled on close. A blocked `receive` races against this instead
    /// of touching the receiver mutex from `close`.
    closed: CancellationToken,
}

impl MemConnection {
    /// Create two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        (
            Self {
                tx: Mutex::new(Some(tx_a)),
                rx: tokio::sync::Mutex::new(rx_b),
                closed: CancellationToken::new(),
            },
            Self {
                tx: Mutex::new(Some(tx_b)),
                rx: tokio::sync::Mutex::new(rx_a),
                closed: CancellationToken::new(),
            },
        )
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Connection for MemConnection {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        // Snapshot the sender outside the await.
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(TransportError::Closed);
        };

        tx.send(data).await.map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            msg = rx.recv() => msg.ok_or(TransportError::Closed),
        }
    }

    async fn close(&self, reason: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        tracing::debug!(reason, "closing in-memory connection");

        self.closed.cancel();
        // Dropping the sender lets the remote's receive drain and end.
        self.tx.lock().take();
        Ok(())
    }
}

/// In-memory provider with a named listener registry.
///
/// Clones share the registry, so the same provider value can be handed to
/// both the listening and the dialing side of a test.
#[derive(Clone, Default)]
pub struct MemProvider {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<MemConnection>>>>,
}

impl MemProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Provider for MemProvider {
    type Conn = MemConnection;

    async fn listen(
        &self,
        token: CancellationToken,
        addr: &str,
        sink: mpsc::Sender<MemConnection>,
    ) -> Result<(), TransportError> {
        {
            let mut listeners = self.listeners.lock();
            if let Some(existing) = listeners.get(addr)
                && !existing.is_closed()
            {
                return Err(TransportError::Protocol(format!(
                    "address already in use: {addr}"
                )));
            }
            listeners.insert(addr.to_string(), sink);
        }
        tracing::debug!(addr, "in-memory listener registered");

        token.cancelled().await;

        self.listeners.lock().remove(addr);
        tracing::debug!(addr, "in-memory listener removed");
        Ok(())
    }

    async fn dial(&self, url: &str) -> Result<MemConnection, TransportError> {
        let sink = self.listeners.lock().get(url).cloned();
        let Some(sink) = sink else {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("no listener at {url}"),
            )));
        };

        let (local, remote) = MemConnection::pair();
        sink.send(remote)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(local)
    }
}
