//! peerlink-transport-websocket: WebSocket binding for peerlink.
//!
//! Frames are JSON-RPC envelopes carried as WebSocket text messages, one
//! frame per message. Protocol-level pings are answered transparently
//! inside `receive`; a close frame surfaces as [`TransportError::Closed`].
//!
//! [`WsProvider`] implements both directions of the transport contract:
//! `listen` binds a TCP listener and upgrades requests on the `/ws` path,
//! `dial` performs a one-shot outbound connect.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use peerlink_core::{Connection, Provider, TransportError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_hdr_async, connect_async};
use tokio_util::sync::CancellationToken;

/// The HTTP path on which connections upgrade to WebSocket.
pub const UPGRADE_PATH: &str = "/ws";

/// A WebSocket connection carrying one JSON frame per text message.
///
/// Generic over the underlying byte stream so the same type serves dialed
/// (`MaybeTlsStream<TcpStream>`) and accepted connections.
pub struct WsConnection<S> {
    /// Write half. The async mutex serializes concurrent sends.
    sink: AsyncMutex<SplitSink<WebSocketStream<S>, Message>>,
    /// Read half.
    stream: AsyncMutex<SplitStream<WebSocketStream<S>>>,
    closed: AtomicBool,
    /// When set, `receive` fails if no traffic (frames or pongs) arrives
    /// within this window. Used by dialing peers as their liveness check.
    idle_timeout: Option<Duration>,
}

/// The connection type produced by [`WsProvider`].
pub type WsStreamConnection = WsConnection<MaybeTlsStream<TcpStream>>;

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established WebSocket stream.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self::with_idle_timeout(ws, None)
    }

    /// Wrap an established WebSocket stream with a liveness window.
    pub fn with_idle_timeout(ws: WebSocketStream<S>, idle_timeout: Option<Duration>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: AsyncMutex::new(sink),
            stream: AsyncMutex::new(stream),
            closed: AtomicBool::new(false),
            idle_timeout,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<S> Connection for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let text = String::from_utf8(data)
            .map_err(|e| TransportError::Protocol(format!("frame is not UTF-8: {e}")))?;

        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut stream = self.stream.lock().await;
        loop {
            // Any inbound traffic, pongs included, restarts the window.
            let next = match self.idle_timeout {
                Some(window) => tokio::time::timeout(window, stream.next())
                    .await
                    .map_err(|_| {
                        TransportError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "no traffic within the liveness window",
                        ))
                    })?,
                None => stream.next().await,
            };

            let msg = next
                .ok_or(TransportError::Closed)?
                .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;

            match msg {
                Message::Text(text) => return Ok(text.as_bytes().to_vec()),
                Message::Binary(data) => return Ok(data.to_vec()),
                Message::Ping(payload) => {
                    let mut sink = self.sink.lock().await;
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Message::Pong(_) => {}
                Message::Close(_) => {
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::Closed);
                }
                Message::Frame(_) => {}
            }
        }
    }

    async fn close(&self, reason: &str) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
        Ok(())
    }
}

/// Accept one inbound TCP stream as a peerlink WebSocket connection.
///
/// The upgrade is refused with 404 unless the request targets
/// [`UPGRADE_PATH`].
pub async fn accept_connection(stream: TcpStream) -> Result<WsStreamConnection, TransportError> {
    let callback = |req: &Request, resp: Response| {
        if req.uri().path() == UPGRADE_PATH {
            Ok(resp)
        } else {
            let mut refused = ErrorResponse::new(None);
            *refused.status_mut() = StatusCode::NOT_FOUND;
            Err(refused)
        }
    };

    let ws = accept_hdr_async(MaybeTlsStream::Plain(stream), callback)
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
    Ok(WsConnection::new(ws))
}

/// WebSocket connection factory: accepts inbound upgrades on `/ws` and
/// dials outbound URLs.
#[derive(Clone, Debug, Default)]
pub struct WsProvider {
    /// Liveness window applied to dialed connections. `None` disables the
    /// check (accepted connections get their liveness from the session's
    /// ping/pong pumps instead).
    pub idle_timeout: Option<Duration>,
}

impl WsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept connections on an already-bound listener. Each successful
    /// upgrade is handed off through `sink`; handshakes run in their own
    /// tasks so a slow client cannot stall the accept loop.
    pub async fn listen_on(
        &self,
        token: CancellationToken,
        listener: TcpListener,
        sink: mpsc::Sender<WsStreamConnection>,
    ) -> Result<(), TransportError> {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                r = listener.accept() => r,
            };

            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let sink = sink.clone();
            tokio::spawn(async move {
                match accept_connection(stream).await {
                    Ok(conn) => {
                        if sink.send(conn).await.is_err() {
                            tracing::debug!(%remote, "connection sink closed, dropping accept");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, %remote, "websocket handshake failed")
                    }
                }
            });
        }
    }
}

impl Provider for WsProvider {
    type Conn = WsStreamConnection;

    async fn listen(
        &self,
        token: CancellationToken,
        addr: &str,
        sink: mpsc::Sender<WsStreamConnection>,
    ) -> Result<(), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr, "websocket listener bound");
        self.listen_on(token, listener, sink).await
    }

    async fn dial(&self, url: &str) -> Result<WsStreamConnection, TransportError> {
        tracing::debug!(url, "dialing");
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
        Ok(WsConnection::with_idle_timeout(ws, self.idle_timeout))
    }
}
