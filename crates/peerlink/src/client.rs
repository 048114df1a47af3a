//! Client-side wrapper around a dialing [`Peer`].
//!
//! Adds the conveniences a client application wants: typed call results, a
//! default per-call deadline, notification and connectivity callbacks, and
//! an automatic login (with a payload persisted across reconnects).

use std::sync::Arc;

use peerlink_core::{DynProvider, PeerError, RpcError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;

use crate::{ClientConfig, Peer};

/// A reconnecting client peer.
pub struct Client {
    peer: Arc<Peer>,
    config: ClientConfig,
}

impl Client {
    /// Create a client that dials `config.url` through `provider`.
    pub fn new(provider: impl DynProvider + 'static, config: ClientConfig) -> Self {
        let peer = Arc::new(Peer::dialing(
            provider,
            config.url.clone(),
            config.peer.clone(),
        ));
        Self { peer, config }
    }

    /// Configure credentials. After every successful (re)connect the peer
    /// issues `auth.login` with this payload before reporting itself
    /// connected; a rejected login drops the connection and re-enters the
    /// backoff loop.
    pub fn with_auth<P: Serialize>(self, payload: &P) -> Result<Self, PeerError> {
        self.peer.set_auth_payload(payload)?;
        Ok(self)
    }

    /// Access the underlying peer (e.g. for raw calls).
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Register a method the server may invoke on this client.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(CancellationToken, Option<Box<RawValue>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<RawValue>, RpcError>> + Send + 'static,
    {
        self.peer.register(method, handler);
    }

    /// Callback for server notifications without a registered handler.
    pub fn on_notification(
        &self,
        callback: impl Fn(&str, Option<Box<RawValue>>) + Send + Sync + 'static,
    ) {
        self.peer.on_notification(callback);
    }

    /// Callback fired once per connected/disconnected transition.
    pub fn on_status_change(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.peer.on_status_change(callback);
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_connected()
    }

    /// Connect and keep the connection alive until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<(), PeerError> {
        self.peer.clone().listen(token).await
    }

    /// Call a server method and parse the result, bounded by the
    /// configured per-call deadline.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, PeerError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let raw = tokio::time::timeout(self.config.call_timeout, self.peer.call(method, params))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(serde_json::from_str(raw.get())?)
    }

    /// Send a notification. No reply is ever produced.
    pub async fn notify<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<(), PeerError> {
        self.peer.notify(method, params).await
    }
}
