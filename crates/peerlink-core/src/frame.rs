//! JSON-RPC 2.0 frame envelopes.
//!
//! One frame per transport message. Classification of inbound frames is a
//! single cheap inspection: a `method` field makes it a request (or a
//! notification, when `id` is absent), anything else is a response.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::RpcError;

/// The protocol version string carried by every frame.
pub const PROTOCOL_VERSION: &str = "2.0";

/// A request or notification frame.
///
/// `id` absent (or JSON `null`) means notification: the receiver never
/// replies, not even on error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Box<RawValue>>,
}

impl Request {
    /// Build a request expecting a reply.
    pub fn new(method: impl Into<String>, params: Option<Box<RawValue>>, id: Box<RawValue>) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    /// Build a notification (no id, no reply).
    pub fn notification(method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// True if this frame must not be answered.
    pub fn is_notification(&self) -> bool {
        match &self.id {
            None => true,
            Some(id) => id.get() == "null",
        }
    }
}

/// A response frame. Exactly one of `result`/`error` is present; `id` is
/// always serialized so the remote can correlate (JSON `null` for the
/// pathological parse-error-without-id case).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Option<Box<RawValue>>,
}

impl Response {
    /// Build a success response.
    pub fn result(id: Option<Box<RawValue>>, result: Box<RawValue>) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Build an error response.
    pub fn error(id: Option<Box<RawValue>>, error: RpcError) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

/// A frame that failed to decode.
///
/// When the bytes were valid JSON with an extractable `id`, it is salvaged
/// here so the receiver can answer `-32700`; otherwise the frame is
/// dropped.
#[derive(Debug)]
pub struct FrameDecodeError {
    pub source: serde_json::Error,
    pub id: Option<Box<RawValue>>,
}

impl fmt::Display for FrameDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed frame: {}", self.source)
    }
}

impl std::error::Error for FrameDecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

// Every envelope field at once; classification happens after the single
// serde pass, keyed on `method` presence.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Box<RawValue>>,
    #[serde(default)]
    id: Option<Box<RawValue>>,
    #[serde(default)]
    result: Option<Box<RawValue>>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct IdProbe {
    #[serde(default)]
    id: Option<Box<RawValue>>,
}

impl Frame {
    /// Parse and classify one frame.
    pub fn decode(data: &[u8]) -> Result<Frame, FrameDecodeError> {
        let env: Envelope = match serde_json::from_slice(data) {
            Ok(env) => env,
            Err(source) => {
                // Salvage the id when the bytes are still valid JSON, so
                // the caller can answer with a parse error.
                let id = serde_json::from_slice::<IdProbe>(data)
                    .ok()
                    .and_then(|p| p.id);
                return Err(FrameDecodeError { source, id });
            }
        };

        let jsonrpc = env
            .jsonrpc
            .unwrap_or_else(|| PROTOCOL_VERSION.to_string());

        match env.method {
            Some(method) => Ok(Frame::Request(Request {
                jsonrpc,
                method,
                params: env.params,
                id: env.id,
            })),
            None => Ok(Frame::Response(Response {
                jsonrpc,
                result: env.result,
                error: env.error,
                id: env.id,
            })),
        }
    }
}

/// Normalize a correlation id for table lookup.
///
/// Peers emit ids as decimal strings; other implementations may use bare
/// numbers. Stripping quotes makes `"7"` and `7` hit the same slot.
pub fn id_key(id: &RawValue) -> String {
    id.get().trim().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code;

    #[test]
    fn classifies_request() {
        let frame = Frame::decode(br#"{"jsonrpc":"2.0","method":"ping","id":"1"}"#).unwrap();
        match frame {
            Frame::Request(req) => {
                assert_eq!(req.method, "ping");
                assert!(!req.is_notification());
                assert_eq!(req.id.unwrap().get(), r#""1""#);
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn classifies_notification() {
        let frame = Frame::decode(br#"{"jsonrpc":"2.0","method":"log","params":[1,2]}"#).unwrap();
        match frame {
            Frame::Request(req) => assert!(req.is_notification()),
            other => panic!("expected request, got {other:?}"),
        }

        // An explicit null id is still a notification.
        let frame = Frame::decode(br#"{"jsonrpc":"2.0","method":"log","id":null}"#).unwrap();
        match frame {
            Frame::Request(req) => assert!(req.is_notification()),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn classifies_response() {
        let frame =
            Frame::decode(br#"{"jsonrpc":"2.0","result":{"ok":true},"id":"3"}"#).unwrap();
        match frame {
            Frame::Response(resp) => {
                assert_eq!(resp.result.unwrap().get(), r#"{"ok":true}"#);
                assert!(resp.error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_error_response() {
        let frame = Frame::decode(
            br#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"Method not found"},"id":"9"}"#,
        )
        .unwrap();
        match frame {
            Frame::Response(resp) => {
                assert_eq!(resp.error.unwrap().code, code::METHOD_NOT_FOUND);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn request_round_trips_params_verbatim() {
        let params = serde_json::value::to_raw_value(&serde_json::json!({
            "foo": "bar",
            "value": 42,
        }))
        .unwrap();
        let req = Request::new(
            "echo",
            Some(params.clone()),
            serde_json::value::to_raw_value(&"7").unwrap(),
        );
        let bytes = serde_json::to_vec(&req).unwrap();

        match Frame::decode(&bytes).unwrap() {
            Frame::Request(back) => {
                assert_eq!(back.params.unwrap().get(), params.get());
                assert_eq!(back.method, "echo");
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn response_always_carries_id_field() {
        let resp = Response::error(None, RpcError::new(code::PARSE_ERROR));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""id":null"#));
    }

    #[test]
    fn malformed_json_salvages_nothing() {
        let err = Frame::decode(b"{not json").unwrap_err();
        assert!(err.id.is_none());
    }

    #[test]
    fn invalid_envelope_salvages_id() {
        // `method` must be a string; the envelope parse fails but the id
        // is still extractable.
        let err = Frame::decode(br#"{"jsonrpc":"2.0","method":17,"id":"44"}"#).unwrap_err();
        assert_eq!(err.id.unwrap().get(), r#""44""#);
    }

    #[test]
    fn id_key_normalizes_quoting() {
        let quoted = serde_json::value::to_raw_value(&"12").unwrap();
        let bare = serde_json::value::to_raw_value(&12u64).unwrap();
        assert_eq!(id_key(&quoted), id_key(&bare));
    }
}
