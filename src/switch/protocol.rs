//! JSON-RPC 2.0 protocol types.
//!
//! Implements the JSON-RPC 2.0 envelope plus the switch extensions: the
//! `rpcswitch` channel envelope carried by forwarded traffic and the
//! switch-specific error codes in the -32000..-32010 range.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SwitchError;

/// JSON-RPC 2.0 request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Must be exactly "2.0"
    pub jsonrpc: String,
    /// Method name to invoke
    pub method: String,
    /// Optional parameters (can be object or array)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request identifier. If None, this is a notification (no response expected).
    #[serde(default)]
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Result on success (mutually exclusive with error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure (mutually exclusive with result)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Request identifier (echoed from request)
    pub id: Value,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code (see constants below)
    pub code: i32,
    /// Short error description
    pub message: String,
    /// Optional additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Envelope the switch adds to requests forwarded over a virtual channel
/// and expects back on in-channel traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub vcookie: String,
    pub vci: String,
    /// Authenticated caller, stamped on client-to-worker requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub who: Option<String>,
}

/// Sentinel value of `rpcswitch.vcookie` on valid channel traffic.
pub const VCOOKIE: &str = "eatme";

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Switch error codes
pub const ERR_NOT_NOTIFICATION: i32 = -32000;
pub const ERR_HANDLER: i32 = -32001;
pub const ERR_BAD_STATE: i32 = -32002;
pub const ERR_NO_WORKER: i32 = -32003;
pub const ERR_BAD_CHANNEL: i32 = -32004;
pub const ERR_NO_CHANNEL: i32 = -32005;
pub const ERR_GONE: i32 = -32006;
pub const ERR_NO_NAMESPACE: i32 = -32007;
pub const ERR_NO_ACL: i32 = -32008;
pub const ERR_NOT_ALLOWED: i32 = -32009;
pub const ERR_BAD_PARAM: i32 = -32010;
// Historically a separate condition; shares the bad-param code.
pub const ERR_TOO_BIG: i32 = -32010;

impl Response {
    /// Create a success response with the given result.
    pub fn success(id: Value, result: impl Serialize) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(serde_json::to_value(result).unwrap_or(Value::Null)),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    /// Create an error response from a dispatch failure.
    pub fn switch_error(id: Value, err: &SwitchError) -> Self {
        Self::error(id, err.code(), err.to_string())
    }

    /// Create a parse error response (used when request ID is unknown).
    pub fn parse_error() -> Self {
        Self::error(Value::Null, PARSE_ERROR, "Parse error")
    }
}

impl Request {
    /// Check if this request is a notification (no response expected).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Validate the request conforms to JSON-RPC 2.0.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != "2.0" {
            return Err("jsonrpc must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        Ok(())
    }
}

/// Extract the channel envelope from a raw message, if one is present.
///
/// Returns `Ok(None)` when the message carries no `rpcswitch` member and
/// `Err` when the member is present but malformed or has the wrong cookie.
pub fn envelope_of(msg: &Value) -> Result<Option<Envelope>, SwitchError> {
    let Some(raw) = msg.get("rpcswitch") else {
        return Ok(None);
    };
    let envelope: Envelope = serde_json::from_value(raw.clone())
        .map_err(|_| SwitchError::BadChannel("malformed rpcswitch envelope"))?;
    if envelope.vcookie != VCOOKIE {
        return Err(SwitchError::BadChannel("bad vcookie"));
    }
    Ok(Some(envelope))
}
