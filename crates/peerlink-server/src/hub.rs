//! The session hub: registry of live sessions with identity indexing and
//! broadcast primitives.
//!
//! A single event-loop task owns the session set and the identity index;
//! sessions and public operations never touch that state directly, they
//! hand messages through the command channel. That serializes every index
//! mutation without a lock. The method registry is the one piece outside
//! the loop: a read-mostly map behind a read-write lock, shared with the
//! dispatch path.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Utf8Bytes;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use peerlink::HandlerFuture;
use peerlink_core::{Frame, Request, Response, RpcError, code};
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{Authenticator, ServerConfig, Session};

/// A handler in the hub's method registry.
///
/// Unlike a peer handler it also receives the session that sent the
/// request, so it can authenticate, bind, or address that connection.
pub type ServerHandler = dyn Fn(CancellationToken, Arc<Session>, Option<Box<RawValue>>) -> HandlerFuture
    + Send
    + Sync;

/// Failures of hub operations.
#[derive(Debug)]
pub enum HubError {
    /// `send_to_identity` found no live session for the identity.
    IdentityNotConnected(String),
    /// The hub event loop has shut down.
    Closed,
    /// A broadcast payload failed to serialize.
    Json(serde_json::Error),
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdentityNotConnected(identity) => {
                write!(f, "identity '{identity}' is not connected")
            }
            Self::Closed => write!(f, "hub is shut down"),
            Self::Json(e) => write!(f, "payload serialization failed: {e}"),
        }
    }
}

impl std::error::Error for HubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// A snapshot of the event loop's state, for diagnostics and tests.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub sessions: usize,
    pub authenticated: usize,
    /// Identity key to number of bound sessions. Entries are pruned, so
    /// every count is at least one.
    pub identities: HashMap<String, usize>,
}

enum HubCommand {
    Register(Arc<Session>),
    Unregister(u64),
    Bind { session_id: u64, identity: String },
    BroadcastAuthenticated { payload: Utf8Bytes },
    SendToIdentity {
        identity: String,
        payload: Utf8Bytes,
        reply: oneshot::Sender<Result<usize, HubError>>,
    },
    Stats(oneshot::Sender<HubStats>),
    Shutdown,
}

/// The server-side multiplexer over all live sessions.
pub struct Hub {
    commands: mpsc::UnboundedSender<HubCommand>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<HubCommand>>>,
    handlers: RwLock<HashMap<String, Arc<ServerHandler>>>,
    authenticator: Arc<dyn Authenticator>,
    config: ServerConfig,
    next_session_id: AtomicU64,
}

impl Hub {
    /// Create a hub. Spawn [`Hub::run`] to start the event loop.
    ///
    /// `auth.login` and `auth.resume` are registered out of the box,
    /// wired to `authenticator`.
    pub fn new(authenticator: Arc<dyn Authenticator>, config: ServerConfig) -> Arc<Self> {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            commands,
            commands_rx: Mutex::new(Some(commands_rx)),
            handlers: RwLock::new(HashMap::new()),
            authenticator,
            config,
            next_session_id: AtomicU64::new(1),
        });
        register_default_handlers(&hub);
        hub
    }

    /// Register (or replace) a method in the hub registry.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(CancellationToken, Arc<Session>, Option<Box<RawValue>>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<Box<RawValue>, RpcError>> + Send + 'static,
    {
        let handler: Arc<ServerHandler> = Arc::new(move |ctx, session, params| {
            Box::pin(handler(ctx, session, params)) as HandlerFuture
        });
        self.handlers.write().insert(method.into(), handler);
    }

    /// Attach an identity to a session. Idempotent.
    pub fn bind(&self, session: &Session, identity: &str) -> Result<(), HubError> {
        self.commands
            .send(HubCommand::Bind {
                session_id: session.id(),
                identity: identity.to_string(),
            })
            .map_err(|_| HubError::Closed)
    }

    /// Send a notification to every authenticated session. Sessions with
    /// a full outbound queue miss out; the hub never blocks on them.
    pub fn broadcast_authenticated<P: Serialize>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<(), HubError> {
        let payload = marshal_notification(method, params)?;
        self.commands
            .send(HubCommand::BroadcastAuthenticated { payload })
            .map_err(|_| HubError::Closed)
    }

    /// Fan a notification out to every session bound to `identity`,
    /// best-effort per session. Errors when no session is bound to it.
    /// Returns how many sessions accepted the frame.
    pub async fn send_to_identity<P: Serialize>(
        &self,
        identity: &str,
        method: &str,
        params: &P,
    ) -> Result<usize, HubError> {
        let payload = marshal_notification(method, params)?;
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::SendToIdentity {
                identity: identity.to_string(),
                payload,
                reply,
            })
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)?
    }

    /// Snapshot session and identity counts.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::Stats(reply))
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Stop the event loop. Every live session gets a courtesy close
    /// frame on its way down.
    pub fn shutdown(&self) {
        let _ = self.commands.send(HubCommand::Shutdown);
    }

    /// The event loop. Exclusive owner of the session set and the
    /// identity index.
    pub async fn run(self: Arc<Self>) {
        let Some(mut commands) = self.commands_rx.lock().take() else {
            tracing::error!("hub event loop started twice");
            return;
        };

        let mut sessions: HashMap<u64, Arc<Session>> = HashMap::new();
        let mut identities: HashMap<String, Vec<u64>> = HashMap::new();

        while let Some(command) = commands.recv().await {
            match command {
                HubCommand::Register(session) => {
                    tracing::debug!(sid = session.id(), remote = session.remote_addr(), "session registered");
                    sessions.insert(session.id(), session);
                }
                HubCommand::Unregister(id) => {
                    if let Some(session) = sessions.remove(&id) {
                        if let Some(identity) = session.identity()
                            && let Some(bound) = identities.get_mut(&identity)
                        {
                            bound.retain(|sid| *sid != id);
                            if bound.is_empty() {
                                identities.remove(&identity);
                            }
                        }
                        tracing::debug!(sid = id, "session unregistered");
                    }
                }
                HubCommand::Bind {
                    session_id,
                    identity,
                } => {
                    let Some(session) = sessions.get(&session_id) else {
                        tracing::debug!(sid = session_id, "bind for unknown session ignored");
                        continue;
                    };
                    session.set_identity(identity.clone());
                    let bound = identities.entry(identity.clone()).or_default();
                    if !bound.contains(&session_id) {
                        bound.push(session_id);
                        tracing::info!(sid = session_id, identity = %identity, "identity bound");
                    }
                }
                HubCommand::BroadcastAuthenticated { payload } => {
                    for session in sessions.values() {
                        if session.is_authenticated() {
                            session.enqueue(payload.clone());
                        }
                    }
                }
                HubCommand::SendToIdentity {
                    identity,
                    payload,
                    reply,
                } => {
                    let result = match identities.get(&identity) {
                        None => Err(HubError::IdentityNotConnected(identity)),
                        Some(bound) => {
                            let mut delivered = 0;
                            for sid in bound {
                                if let Some(session) = sessions.get(sid) {
                                    session.enqueue(payload.clone());
                                    delivered += 1;
                                }
                            }
                            Ok(delivered)
                        }
                    };
                    let _ = reply.send(result);
                }
                HubCommand::Stats(reply) => {
                    let stats = HubStats {
                        sessions: sessions.len(),
                        authenticated: sessions
                            .values()
                            .filter(|s| s.is_authenticated())
                            .count(),
                        identities: identities
                            .iter()
                            .map(|(identity, bound)| (identity.clone(), bound.len()))
                            .collect(),
                    };
                    let _ = reply.send(stats);
                }
                HubCommand::Shutdown => break,
            }
        }

        tracing::info!(sessions = sessions.len(), "hub shutting down");
        for session in sessions.values() {
            session.token().cancel();
        }
    }

    /// Decode one frame from a session and route it.
    pub(crate) fn dispatch(self: &Arc<Self>, session: Arc<Session>, data: &[u8]) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(err) => {
                match err.id {
                    Some(id) => session.enqueue_response(&Response::error(
                        Some(id),
                        RpcError::new(code::PARSE_ERROR),
                    )),
                    None => {
                        tracing::debug!(sid = session.id(), error = %err, "dropping malformed frame")
                    }
                }
                return;
            }
        };

        let req = match frame {
            Frame::Request(req) => req,
            Frame::Response(_) => {
                tracing::debug!(sid = session.id(), "unexpected response frame dropped");
                return;
            }
        };

        let handler = self.handlers.read().get(&req.method).cloned();
        let Some(handler) = handler else {
            if req.is_notification() {
                tracing::debug!(sid = session.id(), method = %req.method, "unhandled notification dropped");
            } else {
                tracing::warn!(sid = session.id(), method = %req.method, "method not found");
                session.enqueue_response(&Response::error(
                    req.id,
                    RpcError::method_not_found(&req.method),
                ));
            }
            return;
        };

        // Handlers run concurrently, one task per request, panics caught.
        tokio::spawn(async move {
            let is_notification = req.is_notification();
            let Request {
                method, params, id, ..
            } = req;

            let ctx = session.token().child_token();
            let outcome = AssertUnwindSafe(handler(ctx, session.clone(), params))
                .catch_unwind()
                .await;

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
                    tracing::error!(sid = session.id(), method = %method, panic = %message, "handler panicked");
                    Err(RpcError::internal(&message))
                }
            };

            if is_notification {
                if let Err(e) = outcome {
                    tracing::warn!(sid = session.id(), method = %method, error = %e, "notification handler failed");
                }
                return;
            }

            let resp = match outcome {
                Ok(result) => Response::result(id, result),
                Err(err) => Response::error(id, err),
            };
            session.enqueue_response(&resp);
        });
    }

    pub(crate) fn send_register(&self, session: Arc<Session>) -> Result<(), HubError> {
        self.commands
            .send(HubCommand::Register(session))
            .map_err(|_| HubError::Closed)
    }

    pub(crate) fn send_unregister(&self, id: u64) {
        let _ = self.commands.send(HubCommand::Unregister(id));
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn config(&self) -> ServerConfig {
        self.config.clone()
    }
}

fn marshal_notification<P: Serialize>(method: &str, params: &P) -> Result<Utf8Bytes, HubError> {
    let params = serde_json::value::to_raw_value(params)?;
    let frame = Request::notification(method, Some(params));
    Ok(serde_json::to_string(&frame)?.into())
}

#[derive(serde::Deserialize)]
struct Credentials {
    username: String,
    secret: String,
}

#[derive(serde::Deserialize)]
struct ResumeParams {
    token: String,
}

fn register_default_handlers(hub: &Arc<Hub>) {
    let weak = Arc::downgrade(hub);
    hub.register("auth.login", move |_ctx, session, params| {
        let weak = weak.clone();
        async move {
            let Some(hub) = weak.upgrade() else {
                return Err(RpcError::internal("hub unavailable"));
            };
            let text = params.as_deref().map_or("null", |r| r.get());
            let creds: Credentials = serde_json::from_str(text)
                .map_err(|e| RpcError::invalid_params(&e.to_string()))?;

            let Some(identity) = hub
                .authenticator
                .authenticate(&creds.username, &creds.secret)
            else {
                tracing::warn!(username = %creds.username, sid = session.id(), "login failed");
                return Err(RpcError::with_data(code::UNAUTHORIZED, &"bad credentials"));
            };

            session.set_authenticated(true);
            hub.bind(&session, &identity)
                .map_err(|_| RpcError::internal("hub unavailable"))?;
            tracing::info!(identity = %identity, sid = session.id(), "login successful");

            let token = hub.authenticator.issue_token(&identity);
            let result = serde_json::json!({
                "status": "success",
                "identity": identity,
                "token": token,
            });
            serde_json::value::to_raw_value(&result)
                .map_err(|_| RpcError::new(code::SERIALIZE_ERROR))
        }
    });

    let weak = Arc::downgrade(hub);
    hub.register("auth.resume", move |_ctx, session, params| {
        let weak = weak.clone();
        async move {
            let Some(hub) = weak.upgrade() else {
                return Err(RpcError::internal("hub unavailable"));
            };
            let text = params.as_deref().map_or("null", |r| r.get());
            let resume: ResumeParams = serde_json::from_str(text)
                .map_err(|e| RpcError::invalid_params(&e.to_string()))?;

            let Some(identity) = hub.authenticator.resume(&resume.token) else {
                return Err(RpcError::with_data(code::UNAUTHORIZED, &"token invalid"));
            };

            session.set_authenticated(true);
            hub.bind(&session, &identity)
                .map_err(|_| RpcError::internal("hub unavailable"))?;
            tracing::info!(identity = %identity, sid = session.id(), "session resumed");

            let result = serde_json::json!({"status": "resumed", "identity": identity});
            serde_json::value::to_raw_value(&result)
                .map_err(|_| RpcError::new(code::SERIALIZE_ERROR))
        }
    });
}
