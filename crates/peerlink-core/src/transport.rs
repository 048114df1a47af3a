//! Transport traits.
//!
//! A transport moves opaque byte frames between two peers. Transports are
//! responsible for atomic one-frame delivery and for serializing
//! concurrent sends internally. They are NOT responsible for RPC
//! semantics, retries, or reconnection: any network error must surface to
//! the peer node, which owns retry policy.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::TransportError;

/// One full-duplex message channel.
///
/// `send` and `receive` may be called concurrently; two concurrent sends
/// must serialize internally. Frames within one direction arrive in send
/// order.
pub trait Connection: Send + Sync {
    /// Write one frame atomically.
    fn send(&self, data: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Block until one frame arrives.
    fn receive(&self) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Graceful shutdown with a human-readable reason.
    fn close(&self, reason: &str) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A factory for connections in either listen or dial mode.
pub trait Provider: Send + Sync {
    /// The connection type produced by this provider.
    type Conn: Connection + 'static;

    /// Bind `addr` and accept inbound connections until the token is
    /// cancelled or the listener fails. Each accepted connection is handed
    /// off through `sink`.
    fn listen(
        &self,
        token: CancellationToken,
        addr: &str,
        sink: mpsc::Sender<Self::Conn>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// One-shot outbound connect.
    fn dial(&self, url: &str) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

/// Boxed future type for object-safe transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`Connection`].
///
/// The peer node holds its connection as `Arc<dyn DynConnection>` so the
/// handle can be swapped atomically on reconnect without making the peer
/// generic over the transport.
pub trait DynConnection: Send + Sync {
    fn send_boxed(&self, data: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>>;
    fn receive_boxed(&self) -> BoxFuture<'_, Result<Vec<u8>, TransportError>>;
    fn close_boxed(&self, reason: String) -> BoxFuture<'_, Result<(), TransportError>>;
}

impl<C: Connection> DynConnection for C {
    fn send_boxed(&self, data: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.send(data))
    }

    fn receive_boxed(&self) -> BoxFuture<'_, Result<Vec<u8>, TransportError>> {
        Box::pin(self.receive())
    }

    fn close_boxed(&self, reason: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move { self.close(&reason).await })
    }
}

/// Object-safe dialer, used by the peer's reconnect loop.
pub trait DynProvider: Send + Sync {
    fn dial_boxed(
        &self,
        url: String,
    ) -> BoxFuture<'_, Result<Arc<dyn DynConnection>, TransportError>>;
}

impl<P: Provider> DynProvider for P {
    fn dial_boxed(
        &self,
        url: String,
    ) -> BoxFuture<'_, Result<Arc<dyn DynConnection>, TransportError>> {
        Box::pin(async move {
            let conn = self.dial(&url).await?;
            Ok(Arc::new(conn) as Arc<dyn DynConnection>)
        })
    }
}
