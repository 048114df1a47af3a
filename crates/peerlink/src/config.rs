//! Configuration for peer and client behavior.

use std::time::Duration;

/// Reconnect and login timing for a [`Peer`](crate::Peer).
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// First delay after a lost connection.
    pub initial_backoff: Duration,

    /// Backoff doubles up to this cap.
    pub max_backoff: Duration,

    /// Deadline for the automatic `auth.login` call issued after a
    /// (re)connect when an auth payload is configured.
    pub login_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            login_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:8080/ws`.
    pub url: String,

    /// Default deadline applied to every `call` issued through the client.
    pub call_timeout: Duration,

    /// Reconnect behavior of the underlying peer.
    pub peer: PeerConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            call_timeout: Duration::from_secs(5),
            peer: PeerConfig::default(),
        }
    }
}
