//! The bidirectional peer node.
//!
//! A [`Peer`] is simultaneously caller and callee: it serves methods the
//! remote side invokes and issues calls against the remote's registry.
//! Only `Peer::listen` reads from the connection; every inbound frame is
//! routed from there, either into a registered handler (spawned, so a slow
//! handler cannot stall the receive loop) or into the pending-call slot
//! matching its correlation id.
//!
//! Two guards protect the node: a read-write lock on the connection handle
//! (writers only during reconnect substitution) and a short-critical-section
//! mutex on the pending table. `call` and `notify` snapshot the connection
//! under the read guard and release it before touching the network.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use peerlink_core::{
    DynConnection, DynProvider, Frame, PeerError, Request, Response, RpcError, TransportError,
    code, id_key,
};
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::PeerConfig;

/// Boxed future returned by method handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Box<RawValue>, RpcError>> + Send>>;

/// A registered method handler.
///
/// Receives a cancellation token (linked to the peer's listen context) and
/// the raw `params` blob; returns the raw `result` blob or a structured
/// error.
pub type Handler =
    dyn Fn(CancellationToken, Option<Box<RawValue>>) -> HandlerFuture + Send + Sync;

/// Callback for inbound notifications that have no registered handler.
pub type NotificationCallback = dyn Fn(&str, Option<Box<RawValue>>) + Send + Sync;

/// Callback invoked once per connected/disconnected transition.
pub type StatusCallback = dyn Fn(bool) + Send + Sync;

struct Dialer {
    provider: Arc<dyn DynProvider>,
    addr: String,
}

enum AuthOutcome {
    Ok,
    Failed,
    Cancelled,
}

/// A bidirectional JSON-RPC peer over one full-duplex connection.
pub struct Peer {
    /// Current connection. `None` while a reconnect is in progress.
    conn: RwLock<Option<Arc<dyn DynConnection>>>,

    /// Method registry. Read-mostly; registration replaces.
    handlers: RwLock<HashMap<String, Arc<Handler>>>,

    /// Outstanding calls by normalized correlation id.
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,

    /// Correlation ids are monotonically assigned and never reused.
    next_id: AtomicU64,

    /// Dial target for the reconnect loop. `None` for passively owned
    /// peers (server side): a lost connection then terminates `listen`.
    dialer: Option<Dialer>,

    config: PeerConfig,

    /// Login payload re-sent after every successful (re)connect.
    auth_payload: Mutex<Option<Box<RawValue>>>,

    on_notification: RwLock<Option<Arc<NotificationCallback>>>,
    on_status: RwLock<Option<Arc<StatusCallback>>>,
    connected: AtomicBool,
}

impl Peer {
    /// Create a peer around an already-accepted connection.
    ///
    /// The peer is passively owned: when the connection dies, `listen`
    /// returns an error instead of reconnecting.
    pub fn attached(conn: impl DynConnection + 'static, config: PeerConfig) -> Self {
        Self::build(Some(Arc::new(conn)), None, config)
    }

    /// Create a peer that dials `addr` through `provider` and reconnects
    /// with exponential backoff whenever the connection is lost.
    pub fn dialing(
        provider: impl DynProvider + 'static,
        addr: impl Into<String>,
        config: PeerConfig,
    ) -> Self {
        Self::build(
            None,
            Some(Dialer {
                provider: Arc::new(provider),
                addr: addr.into(),
            }),
            config,
        )
    }

    fn build(
        conn: Option<Arc<dyn DynConnection>>,
        dialer: Option<Dialer>,
        config: PeerConfig,
    ) -> Self {
        let connected = conn.is_some();
        Self {
            conn: RwLock::new(conn),
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dialer,
            config,
            auth_payload: Mutex::new(None),
            on_notification: RwLock::new(None),
            on_status: RwLock::new(None),
            connected: AtomicBool::new(connected),
        }
    }

    /// Register (or replace) a method handler. Never fails.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(CancellationToken, Option<Box<RawValue>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<RawValue>, RpcError>> + Send + 'static,
    {
        let handler: Arc<Handler> = Arc::new(move |ctx, params| {
            Box::pin(handler(ctx, params)) as HandlerFuture
        });
        self.handlers.write().insert(method.into(), handler);
    }

    /// Install the callback for notifications without a registered handler.
    pub fn on_notification(&self, callback: impl Fn(&str, Option<Box<RawValue>>) + Send + Sync + 'static) {
        *self.on_notification.write() = Some(Arc::new(callback));
    }

    /// Install the connectivity callback. Fires exactly once per
    /// transition between connected and disconnected.
    pub fn on_status_change(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        *self.on_status.write() = Some(Arc::new(callback));
    }

    /// Set the payload for the automatic `auth.login` call issued after
    /// every successful (re)connect.
    pub fn set_auth_payload<P: Serialize>(&self, payload: &P) -> Result<(), PeerError> {
        let raw = serde_json::value::to_raw_value(payload)?;
        *self.auth_payload.lock() = Some(raw);
        Ok(())
    }

    /// Whether the peer currently holds a live connection.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Close the current connection, if any. A dialing peer's listen loop
    /// observes the loss and reconnects; a passively owned peer's listen
    /// loop returns.
    pub async fn close(&self, reason: &str) {
        let conn = self.conn.read().clone();
        if let Some(conn) = conn
            && let Err(e) = conn.close_boxed(reason.to_string()).await
        {
            tracing::debug!(error = %e, "close failed");
        }
    }

    /// Issue a call and block until the matched response, the loss of the
    /// connection (`-32701`), or cancellation by dropping this future.
    ///
    /// The peer imposes no deadline of its own; wrap in
    /// [`tokio::time::timeout`] to bound the wait.
    pub async fn call<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<Box<RawValue>, PeerError> {
        self.call_raw(method, encode_params(params)?).await
    }

    /// [`call`](Self::call) with an already-serialized params blob.
    pub async fn call_raw(
        &self,
        method: &str,
        params: Option<Box<RawValue>>,
    ) -> Result<Box<RawValue>, PeerError> {
        let conn = self.conn.read().clone();
        let Some(conn) = conn else {
            return Err(RpcError::internal("reconnect in progress").into());
        };

        let key = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let id = serde_json::value::to_raw_value(&key)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key.clone(), tx);
        let mut cleanup = PendingGuard {
            peer: self,
            key: &key,
            armed: true,
        };

        let frame = serde_json::to_vec(&Request::new(method, params, id))?;
        conn.send_boxed(frame).await?;

        let response = rx
            .await
            .map_err(|_| PeerError::Rpc(RpcError::internal("response slot closed")))?;
        cleanup.disarm();

        match response.error {
            Some(err) => Err(PeerError::Rpc(err)),
            None => Ok(response.result.unwrap_or_else(null_raw)),
        }
    }

    /// Send a fire-and-forget notification. No tracking state is kept.
    pub async fn notify<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<(), PeerError> {
        self.notify_raw(method, encode_params(params)?).await
    }

    /// [`notify`](Self::notify) with an already-serialized params blob.
    pub async fn notify_raw(
        &self,
        method: &str,
        params: Option<Box<RawValue>>,
    ) -> Result<(), PeerError> {
        let conn = self.conn.read().clone();
        let Some(conn) = conn else {
            return Err(RpcError::internal("reconnect in progress").into());
        };

        let frame = serde_json::to_vec(&Request::notification(method, params))?;
        conn.send_boxed(frame).await?;
        Ok(())
    }

    /// Drive the receive loop (and, for dialing peers, the reconnect
    /// loop). Returns when `token` is cancelled, or with an error when a
    /// passively owned peer loses its connection.
    pub async fn listen(self: Arc<Self>, token: CancellationToken) -> Result<(), PeerError> {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            let conn = self.conn.read().clone();
            let Some(conn) = conn else {
                if self.dialer.is_none() {
                    return Err(PeerError::Transport(TransportError::Closed));
                }
                if !self.reconnect(&token).await {
                    return Ok(());
                }
                continue;
            };

            let received = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                r = conn.receive_boxed() => r,
            };

            match received {
                Ok(data) => self.dispatch_message(data, &token),
                Err(e) => {
                    tracing::warn!(error = %e, "receive failed, connection lost");
                    *self.conn.write() = None;
                    self.fail_pending("connection lost");
                    self.set_connected(false);
                    if self.dialer.is_none() {
                        return Err(e.into());
                    }
                }
            }
        }
    }

    /// Exponential-backoff dial loop. Returns false when cancelled.
    async fn reconnect(self: &Arc<Self>, token: &CancellationToken) -> bool {
        let Some(dialer) = &self.dialer else {
            return false;
        };

        let mut backoff = self.config.initial_backoff;
        loop {
            if token.is_cancelled() {
                return false;
            }

            tracing::info!(addr = %dialer.addr, "dialing");
            let dialed = tokio::select! {
                _ = token.cancelled() => return false,
                r = dialer.provider.dial_boxed(dialer.addr.clone()) => r,
            };

            match dialed {
                Ok(conn) => {
                    *self.conn.write() = Some(conn.clone());
                    match self.authenticate(&conn, token).await {
                        AuthOutcome::Ok => {
                            tracing::info!(addr = %dialer.addr, "connected");
                            self.set_connected(true);
                            return true;
                        }
                        AuthOutcome::Cancelled => return false,
                        AuthOutcome::Failed => {
                            let _ = conn.close_boxed("authentication failed".to_string()).await;
                            *self.conn.write() = None;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, backoff_secs = backoff.as_secs(), "dial failed");
                }
            }

            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// Issue the configured `auth.login` call on a fresh connection,
    /// pumping inbound frames until it completes (the main receive loop is
    /// not running yet at this point).
    async fn authenticate(
        self: &Arc<Self>,
        conn: &Arc<dyn DynConnection>,
        token: &CancellationToken,
    ) -> AuthOutcome {
        let payload = self.auth_payload.lock().clone();
        let Some(payload) = payload else {
            return AuthOutcome::Ok;
        };

        let me = self.clone();
        let login = async move {
            tokio::time::timeout(
                me.config.login_timeout,
                me.call_raw("auth.login", Some(payload)),
            )
            .await
        };
        tokio::pin!(login);

        loop {
            tokio::select! {
                _ = token.cancelled() => return AuthOutcome::Cancelled,
                outcome = &mut login => {
                    return match outcome {
                        Ok(Ok(_)) => AuthOutcome::Ok,
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "login rejected");
                            AuthOutcome::Failed
                        }
                        Err(_) => {
                            tracing::warn!("login timed out");
                            AuthOutcome::Failed
                        }
                    };
                }
                received = conn.receive_boxed() => match received {
                    Ok(data) => self.dispatch_message(data, token),
                    Err(e) => {
                        tracing::warn!(error = %e, "receive failed during login");
                        return AuthOutcome::Failed;
                    }
                }
            }
        }
    }

    /// Split a transport message into frames (the write side may coalesce
    /// several newline-separated frames into one message) and hand each to
    /// its own dispatch task.
    fn dispatch_message(self: &Arc<Self>, data: Vec<u8>, token: &CancellationToken) {
        for chunk in data.split(|b| *b == b'\n') {
            if chunk.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            let me = self.clone();
            let frame = chunk.to_vec();
            let ctx = token.child_token();
            tokio::spawn(async move { me.handle_incoming(frame, ctx).await });
        }
    }

    async fn handle_incoming(self: Arc<Self>, data: Vec<u8>, token: CancellationToken) {
        match Frame::decode(&data) {
            Ok(Frame::Request(req)) => self.process_request(req, token).await,
            Ok(Frame::Response(resp)) => self.process_response(resp),
            Err(err) => {
                // Reply with a parse error iff the frame carried an id.
                match err.id {
                    Some(id) => {
                        let resp = Response::error(Some(id), RpcError::new(code::PARSE_ERROR));
                        self.send_response(resp).await;
                    }
                    None => tracing::debug!(error = %err, "dropping malformed frame"),
                }
            }
        }
    }

    async fn process_request(self: &Arc<Self>, req: Request, token: CancellationToken) {
        let handler = self.handlers.read().get(&req.method).cloned();

        let Some(handler) = handler else {
            if req.is_notification() {
                let callback = self.on_notification.read().clone();
                match callback {
                    Some(cb) => cb(&req.method, req.params),
                    None => tracing::debug!(method = %req.method, "unhandled notification dropped"),
                }
            } else {
                let resp = Response::error(req.id, RpcError::method_not_found(&req.method));
                self.send_response(resp).await;
            }
            return;
        };

        let is_notification = req.is_notification();
        let outcome = AssertUnwindSafe(handler(token, req.params))
            .catch_unwind()
            .await;

        // A panicking handler must not tear down the dispatch path.
        let outcome = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "handler panicked".to_string()
                };
                tracing::error!(method = %req.method, panic = %message, "handler panicked");
                Err(RpcError::internal(&message))
            }
        };

        if is_notification {
            if let Err(e) = outcome {
                tracing::warn!(method = %req.method, error = %e, "notification handler failed");
            }
            return;
        }

        let resp = match outcome {
            Ok(result) => Response::result(req.id, result),
            Err(err) => Response::error(req.id, err),
        };
        self.send_response(resp).await;
    }

    fn process_response(&self, resp: Response) {
        let Some(id) = &resp.id else {
            tracing::debug!("response without id dropped");
            return;
        };
        let key = id_key(id);

        // Remove-then-send under one lock acquisition: a slot completes at
        // most once, even when a response races caller cancellation.
        let slot = self.pending.lock().remove(&key);
        match slot {
            Some(tx) => {
                let _ = tx.send(resp);
            }
            None => tracing::debug!(id = %key, "stray or duplicate response dropped"),
        }
    }

    async fn send_response(&self, resp: Response) {
        let data = match serde_json::to_vec(&resp) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize response");
                return;
            }
        };

        let conn = self.conn.read().clone();
        let Some(conn) = conn else {
            tracing::debug!("response dropped, no connection");
            return;
        };
        if let Err(e) = conn.send_boxed(data).await {
            tracing::warn!(error = %e, "failed to send response");
        }
    }

    /// Complete every pending call with `-32701` and clear the table.
    fn fail_pending(&self, reason: &str) {
        let drained: Vec<(String, oneshot::Sender<Response>)> =
            self.pending.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        tracing::debug!(count = drained.len(), "failing pending calls");
        for (key, tx) in drained {
            let id = serde_json::value::to_raw_value(&key).ok();
            let _ = tx.send(Response::error(id, RpcError::connection_lost(reason)));
        }
    }

    fn set_connected(&self, connected: bool) {
        let prev = self.connected.swap(connected, Ordering::AcqRel);
        if prev != connected
            && let Some(cb) = self.on_status.read().clone()
        {
            cb(connected);
        }
    }
}

/// Removes the pending entry when a call future is dropped before
/// completion (caller cancellation, send failure).
struct PendingGuard<'a> {
    peer: &'a Peer,
    key: &'a str,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.peer.pending.lock().remove(self.key).is_some() {
            tracing::debug!(id = %self.key, "call dropped, pending slot removed");
        }
    }
}

fn null_raw() -> Box<RawValue> {
    serde_json::value::to_raw_value(&()).expect("null is valid JSON")
}

fn encode_params<P: Serialize + ?Sized>(params: &P) -> Result<Option<Box<RawValue>>, PeerError> {
    let raw = serde_json::value::to_raw_value(params)?;
    Ok(if raw.get() == "null" { None } else { Some(raw) })
}

/// Adapt a typed async function into a registrable handler.
///
/// Parses `params` with the function's own schema and serializes its
/// return value; absent params parse as JSON `null`.
pub fn typed_handler<P, R, F, Fut>(
    f: F,
) -> impl Fn(CancellationToken, Option<Box<RawValue>>) -> HandlerFuture + Send + Sync + 'static
where
    P: serde::de::DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(CancellationToken, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
{
    let f = Arc::new(f);
    move |ctx, params| {
        let f = f.clone();
        Box::pin(async move {
            let text = params.as_deref().map_or("null", |r| r.get());
            let parsed: P =
                serde_json::from_str(text).map_err(|e| RpcError::invalid_params(&e.to_string()))?;
            let out = f(ctx, parsed).await?;
            serde_json::value::to_raw_value(&out).map_err(|_| RpcError::new(code::SERIALIZE_ERROR))
        }) as HandlerFuture
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::Connection;
    use peerlink_transport_mem::MemConnection;
    use std::time::Duration;

    #[tokio::test]
    async fn call_cancellation_cleans_pending() {
        // The far end never answers, so the call blocks until aborted.
        let (a, _b) = MemConnection::pair();
        let peer = Arc::new(Peer::attached(a, crate::PeerConfig::default()));

        let caller = peer.clone();
        let task = tokio::spawn(async move {
            let _ = caller.call("slow", &()).await;
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while peer.pending.lock().is_empty() {
            if tokio::time::Instant::now() >= deadline {
                panic!("call did not register its pending slot in time");
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        task.abort();
        let _ = task.await;

        assert!(peer.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn correlation_ids_never_repeat() {
        let (a, b) = MemConnection::pair();
        let peer = Arc::new(Peer::attached(a, crate::PeerConfig::default()));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let caller = peer.clone();
            tasks.push(tokio::spawn(async move {
                let _ = caller.call("x", &()).await;
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let data = b.receive().await.unwrap();
            match Frame::decode(&data).unwrap() {
                Frame::Request(req) => {
                    let id = id_key(&req.id.expect("call frames carry an id"));
                    assert!(seen.insert(id), "correlation id reused");
                }
                other => panic!("expected request, got {other:?}"),
            }
        }

        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    #[tokio::test]
    async fn call_without_connection_fails_fast() {
        let (a, _b) = MemConnection::pair();
        let peer = Arc::new(Peer::attached(a, crate::PeerConfig::default()));
        *peer.conn.write() = None;

        let err = peer.call("ping", &()).await.unwrap_err();
        assert_eq!(err.rpc_code(), Some(code::INTERNAL_ERROR));
    }

    #[tokio::test]
    async fn fail_pending_reports_connection_lost() {
        let (a, _b) = MemConnection::pair();
        let peer = Arc::new(Peer::attached(a, crate::PeerConfig::default()));

        let caller = peer.clone();
        let task = tokio::spawn(async move { caller.call("x", &()).await });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while peer.pending.lock().is_empty() {
            if tokio::time::Instant::now() >= deadline {
                panic!("call did not register its pending slot in time");
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        peer.fail_pending("connection lost");

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.rpc_code(), Some(code::CONNECTION_LOST));
        assert!(peer.pending.lock().is_empty());
    }
}
