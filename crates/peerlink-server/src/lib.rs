//! peerlink-server: Session hub and WebSocket HTTP surface.
//!
//! Accepted connections become [`Session`]s, each with a read pump and a
//! write pump. The [`Hub`] tracks live sessions in a single event loop,
//! binds them to authenticated identities, and fans notifications out to
//! addressed or filtered subsets.
//!
//! ```ignore
//! use std::sync::Arc;
//! use peerlink_server::{Hub, ServerConfig, TokenAuthenticator, serve};
//!
//! let auth = Arc::new(TokenAuthenticator::new().with_user("admin", "hunter2"));
//! let hub = Hub::new(auth, ServerConfig::default());
//! tokio::spawn(hub.clone().run());
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! serve(listener, hub, token).await?;
//! ```

#![forbid(unsafe_code)]

mod auth;
mod config;
mod http;
mod hub;
mod session;

pub use auth::{Authenticator, TokenAuthenticator};
pub use config::ServerConfig;
pub use http::{router, serve};
pub use hub::{Hub, HubError, HubStats, ServerHandler};
pub use session::Session;
