//! Error codes and error types.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// JSON-RPC 2.0 error codes, with local additions.
///
/// Codes in the -32700..-32600 range follow the JSON-RPC 2.0 spec.
/// -32701 and -32702 are peerlink-specific. 401/403 are reserved for
/// application-level auth failures.
pub mod code {
    /// Malformed frame.
    pub const PARSE_ERROR: i64 = -32700;
    /// Frame is valid JSON but not a valid request.
    pub const INVALID_REQUEST: i64 = -32600;
    /// No handler registered for the requested method.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Handler rejected the params.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Handler failure or other internal error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The connection was lost while the request was in flight.
    pub const CONNECTION_LOST: i64 = -32701;
    /// A payload could not be serialized.
    pub const SERIALIZE_ERROR: i64 = -32702;

    /// Application code: authentication required or failed.
    pub const UNAUTHORIZED: i64 = 401;
    /// Application code: authenticated but not allowed.
    pub const FORBIDDEN: i64 = 403;
}

/// Standard message text for a known error code.
///
/// Unknown codes fall back to `"Server error"`.
pub fn standard_message(code: i64) -> &'static str {
    match code {
        code::PARSE_ERROR => "Parse error",
        code::INVALID_REQUEST => "Invalid Request",
        code::METHOD_NOT_FOUND => "Method not found",
        code::INVALID_PARAMS => "Invalid params",
        code::INTERNAL_ERROR => "Internal error",
        code::CONNECTION_LOST => "Connection lost",
        code::SERIALIZE_ERROR => "Serialization error",
        code::UNAUTHORIZED => "Unauthorized",
        code::FORBIDDEN => "Forbidden",
        _ => "Server error",
    }
}

/// The wire-visible JSON-RPC error object.
///
/// `data` is an opaque blob: handlers put whatever detail they want there
/// and the peer never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl RpcError {
    /// Create an error with the standard message for `code` and no data.
    pub fn new(code: i64) -> Self {
        Self {
            code,
            message: standard_message(code).to_string(),
            data: None,
        }
    }

    /// Create an error with the standard message and serialized `data`.
    ///
    /// If `data` itself fails to serialize, the error is emitted without it.
    pub fn with_data<T: Serialize>(code: i64, data: &T) -> Self {
        Self {
            code,
            message: standard_message(code).to_string(),
            data: serde_json::value::to_raw_value(data).ok(),
        }
    }

    /// Create an error with a custom message.
    pub fn custom(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// `-32601` with the offending method name in `data`.
    pub fn method_not_found(method: &str) -> Self {
        Self::with_data(code::METHOD_NOT_FOUND, &method)
    }

    /// `-32602` with the parse failure in `data`.
    pub fn invalid_params(detail: &str) -> Self {
        Self::with_data(code::INVALID_PARAMS, &detail)
    }

    /// `-32603` with a detail string in `data`.
    pub fn internal(detail: &str) -> Self {
        Self::with_data(code::INTERNAL_ERROR, &detail)
    }

    /// `-32701` with the loss reason in `data`.
    pub fn connection_lost(reason: &str) -> Self {
        Self::with_data(code::CONNECTION_LOST, &reason)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Transport-level errors. All of them are connection-terminal: retry
/// policy belongs to the peer node, never to the transport.
#[derive(Debug)]
pub enum TransportError {
    /// The connection is closed (locally or by the remote).
    Closed,
    /// An I/O failure on the underlying channel.
    Io(std::io::Error),
    /// The remote violated the transport contract (e.g. an oversized or
    /// non-text frame).
    Protocol(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// What peer operations (`call`, `notify`, `listen`) surface to callers.
#[derive(Debug)]
pub enum PeerError {
    /// The transport failed before a response arrived.
    Transport(TransportError),
    /// The remote (or the local dispatch layer) answered with a structured
    /// JSON-RPC error.
    Rpc(RpcError),
    /// A local payload failed to serialize or deserialize.
    Json(serde_json::Error),
    /// A caller-imposed deadline elapsed before the response arrived.
    /// Never sent to the remote.
    Timeout,
}

impl PeerError {
    /// The JSON-RPC error code, if this is a structured error.
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            Self::Rpc(e) => Some(e.code),
            _ => None,
        }
    }
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Rpc(e) => write!(f, "{e}"),
            Self::Json(e) => write!(f, "JSON error: {e}"),
            Self::Timeout => write!(f, "call timed out"),
        }
    }
}

impl std::error::Error for PeerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Rpc(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Timeout => None,
        }
    }
}

impl From<TransportError> for PeerError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<RpcError> for PeerError {
    fn from(e: RpcError) -> Self {
        Self::Rpc(e)
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}
