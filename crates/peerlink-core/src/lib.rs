//! peerlink-core: Core types and traits for the peerlink RPC system.
//!
//! This crate defines:
//! - Frame envelopes ([`Request`], [`Response`], [`Frame`])
//! - Error codes and error types ([`RpcError`], [`TransportError`], [`PeerError`])
//! - Transport traits ([`Connection`], [`Provider`], [`DynConnection`], [`DynProvider`])
//!
//! Payloads (`params`, `result`, error `data`) stay opaque
//! [`serde_json::value::RawValue`] blobs so handlers decode with their own
//! schemas, without a detour through a generic JSON tree.

#![forbid(unsafe_code)]

mod error;
mod frame;
mod transport;

pub use error::*;
pub use frame::*;
pub use transport::*;
