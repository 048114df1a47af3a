//! One accepted connection and its two pumps.
//!
//! Lifecycle invariant: the read pump is the only place that enqueues the
//! session on the hub's unregister channel and the only canceller of the
//! session token. The write pump closes the socket on exit, whatever made
//! it exit (queue close, write error, cancellation).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use peerlink_core::{Request, Response, RpcError};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Hub, ServerConfig};

/// A live connection attached to the hub.
pub struct Session {
    id: u64,
    /// Remote address, kept as a diagnostic label.
    remote: String,
    authenticated: AtomicBool,
    identity: Mutex<Option<String>>,
    outbound: mpsc::Sender<Utf8Bytes>,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(id: u64, remote: String, outbound: mpsc::Sender<Utf8Bytes>) -> Self {
        Self {
            id,
            remote,
            authenticated: AtomicBool::new(false),
            identity: Mutex::new(None),
            outbound,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Release);
    }

    /// The identity bound to this session, once logged in.
    pub fn identity(&self) -> Option<String> {
        self.identity.lock().clone()
    }

    pub(crate) fn set_identity(&self, identity: String) {
        *self.identity.lock() = Some(identity);
    }

    /// Cancelled when the session terminates; handler contexts derive
    /// from it.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Push a notification to this session alone. A full outbound queue
    /// drops the frame.
    pub fn notify<P: Serialize>(&self, method: &str, params: &P) -> Result<(), RpcError> {
        let params = serde_json::value::to_raw_value(params)
            .map_err(|_| RpcError::new(peerlink_core::code::SERIALIZE_ERROR))?;
        let frame = Request::notification(method, Some(params));
        let payload = serde_json::to_string(&frame)
            .map_err(|_| RpcError::new(peerlink_core::code::SERIALIZE_ERROR))?;
        self.enqueue(payload.into());
        Ok(())
    }

    /// Enqueue one marshaled frame; drops with a warning when the queue
    /// is full or the write pump is gone. Never blocks.
    pub(crate) fn enqueue(&self, payload: Utf8Bytes) {
        if let Err(e) = self.outbound.try_send(payload) {
            tracing::warn!(sid = self.id, error = %e, "outbound queue full, dropping frame");
        }
    }

    pub(crate) fn enqueue_response(&self, resp: &Response) {
        match serde_json::to_string(resp) {
            Ok(payload) => self.enqueue(payload.into()),
            Err(e) => tracing::error!(sid = self.id, error = %e, "failed to serialize response"),
        }
    }
}

/// Drain the outbound queue onto the socket, pinging on a timer.
///
/// Exits on queue close, write error, or session cancellation; always
/// closes the socket on the way out.
pub(crate) async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
    cancel: CancellationToken,
    config: ServerConfig,
) {
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + config.ping_period,
        config.ping_period,
    );

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(payload) = queued else {
                    // Queue closed: courtesy close frame, then stop.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };

                // Coalesce whatever else is already queued into the same
                // transport message, newline separated. Receivers accept
                // both forms.
                let ready = outbound.len();
                let message = if ready == 0 {
                    Message::Text(payload)
                } else {
                    let mut combined = payload.as_str().to_owned();
                    for _ in 0..ready {
                        match outbound.try_recv() {
                            Ok(next) => {
                                combined.push('\n');
                                combined.push_str(next.as_str());
                            }
                            Err(_) => break,
                        }
                    }
                    Message::Text(combined.into())
                };

                match tokio::time::timeout(config.write_deadline, sink.send(message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(error = %e, "write failed");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!("write deadline exceeded");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                let probe = Message::Ping(Vec::new().into());
                match tokio::time::timeout(config.write_deadline, sink.send(probe)).await {
                    Ok(Ok(())) => {}
                    _ => {
                        tracing::debug!("ping failed, connection dead");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    let _ = sink.close().await;
}

/// Read frames, enforce the size cap and the pong deadline, dispatch into
/// the hub's registry.
pub(crate) async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    hub: Arc<Hub>,
    session: Arc<Session>,
) {
    let config = hub.config();

    loop {
        let next = match tokio::time::timeout(config.pong_wait, stream.next()).await {
            Err(_) => {
                tracing::warn!(sid = session.id(), "pong deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(sid = session.id(), error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        // Any inbound traffic, pongs included, refreshes the deadline by
        // reaching the next loop iteration.
        let data = match next {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(data) => data.to_vec(),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                tracing::debug!(sid = session.id(), "client closed");
                break;
            }
        };

        if data.len() > config.max_message_size {
            tracing::warn!(
                sid = session.id(),
                size = data.len(),
                cap = config.max_message_size,
                "inbound frame over size cap"
            );
            break;
        }

        // Peers may coalesce several newline-separated frames into one
        // message.
        for chunk in data.split(|b| *b == b'\n') {
            if chunk.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            hub.dispatch(session.clone(), chunk);
        }
    }

    // Sole unregister issuer and sole canceller of the session context.
    hub.send_unregister(session.id());
    session.cancel.cancel();
}
