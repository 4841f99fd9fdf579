//! JSON-RPC 2.0 envelopes exchanged with the peer.
//!
//! Requests always carry a string id. Responses are parsed leniently: the
//! peer may echo the id as a string or a number, and may omit `result` or
//! the error `message`.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// JSON-RPC protocol version sent with every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Message used when the peer reports an error without a message.
pub const UNKNOWN_REMOTE_ERROR: &str = "Unknown error from peer";

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
    pub id: String,
}

impl JsonRpcRequest {
    pub fn new(method: &str, params: Value, id: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<JsonRpcError> for BridgeError {
    fn from(err: JsonRpcError) -> Self {
        BridgeError::Remote {
            message: err
                .message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| UNKNOWN_REMOTE_ERROR.to_string()),
            code: err.code,
            data: err.data,
        }
    }
}

/// Inbound response envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl JsonRpcResponse {
    /// Key used to look the response up in the pending request table.
    ///
    /// String ids are used as-is and numeric ids by their decimal form.
    /// Any other id shape (or a missing id) matches nothing.
    pub fn id_key(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Convert into the value a caller receives.
    ///
    /// An `error` member wins over `result`. A missing `result` resolves
    /// to `null`.
    pub fn into_result(self) -> Result<Value, BridgeError> {
        match self.error {
            Some(Value::Object(obj)) => {
                let err: JsonRpcError =
                    serde_json::from_value(Value::Object(obj)).unwrap_or_default();
                Err(err.into())
            }
            Some(Value::String(message)) => Err(JsonRpcError {
                message: Some(message),
                ..Default::default()
            }
            .into()),
            Some(Value::Null) | None => Ok(self.result.unwrap_or(Value::Null)),
            Some(other) => Err(JsonRpcError {
                data: Some(other),
                ..Default::default()
            }
            .into()),
        }
    }
}

/// Generate a request id: millisecond timestamp followed by a six digit
/// random suffix.
///
/// The suffix keeps ids distinct when several requests are issued in the
/// same millisecond. Uniqueness among pending requests is enforced by the
/// transport at registration time.
pub fn generate_request_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{}{:06}", millis, suffix)
}
