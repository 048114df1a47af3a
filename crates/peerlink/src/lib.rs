//! peerlink: Symmetric JSON-RPC 2.0 peer transport.
//!
//! Two processes exchange structured requests, responses, and
//! fire-and-forget notifications over a full-duplex byte-message channel.
//! Each peer is simultaneously caller and callee: it registers methods the
//! remote invokes, and invokes methods the remote registered.
//!
//! # Quick start
//!
//! ```ignore
//! use peerlink::{Peer, PeerConfig, typed_handler};
//! use peerlink_transport_mem::MemConnection;
//! use tokio_util::sync::CancellationToken;
//!
//! let (a, b) = MemConnection::pair();
//! let server = std::sync::Arc::new(Peer::attached(a, PeerConfig::default()));
//! let client = std::sync::Arc::new(Peer::attached(b, PeerConfig::default()));
//!
//! server.register("ping", typed_handler(|_ctx, (): ()| async { Ok("pong") }));
//!
//! tokio::spawn(server.clone().listen(CancellationToken::new()));
//! tokio::spawn(client.clone().listen(CancellationToken::new()));
//!
//! let pong = client.call("ping", &()).await?;
//! assert_eq!(pong.get(), r#""pong""#);
//! ```
//!
//! # Transports
//!
//! The peer is transport-agnostic: anything implementing
//! [`Connection`] works. `peerlink-transport-websocket` is the reference
//! network binding; `peerlink-transport-mem` runs everything in process
//! for tests.
//!
//! # Reconnection
//!
//! A peer constructed with [`Peer::dialing`] treats a network error as a
//! soft failure: pending calls complete with `-32701`, then an
//! exponential-backoff dial loop (1 s doubling to 30 s) restores the
//! connection. Registered handlers survive the swap. A peer constructed
//! with [`Peer::attached`] is passively owned and reports the loss to its
//! caller instead.

#![forbid(unsafe_code)]

mod client;
mod config;
mod peer;

pub use client::Client;
pub use config::{ClientConfig, PeerConfig};
pub use peer::{
    Handler, HandlerFuture, NotificationCallback, Peer, StatusCallback, typed_handler,
};

// Re-export core types so most users depend on this crate alone.
pub use peerlink_core::{
    Connection, DynConnection, DynProvider, Frame, FrameDecodeError, PeerError, Provider, Request,
    Response, RpcError, TransportError, code, id_key, standard_message,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        Client, ClientConfig, Connection, Peer, PeerConfig, PeerError, Provider, RpcError, code,
        typed_handler,
    };
}
