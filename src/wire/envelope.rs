//! JSON-RPC envelope shapes.
//!
//! Inbound objects are classified into an explicit tagged union
//! ([`Envelope`]) at the deserialization boundary so downstream code
//! pattern-matches exhaustively instead of probing for field presence.
//! Objects that match no variant (including non-JSON startup banners some
//! agents print before entering RPC mode) are discarded by [`classify`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version stamped on every outbound envelope.
pub const JSONRPC_VERSION: &str = "2.0";

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// A request: carries both an `id` and a `method`, and expects a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    /// Protocol version marker.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Correlation id; echoed back in the matching response.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Method-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestEnvelope {
    /// Build an outbound request envelope.
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Error member of a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Numeric JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A response: carries an `id` plus exactly one of `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    /// Protocol version marker.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Correlation id of the request being answered.
    pub id: u64,
    /// Successful result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl ResponseEnvelope {
    /// Build a success response.
    #[must_use]
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    #[must_use]
    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A notification: carries a `method` but no `id`; no response is written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEnvelope {
    /// Protocol version marker.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl NotificationEnvelope {
    /// Build an outbound notification envelope.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            method: method.into(),
            params,
        }
    }
}

/// Tagged union of the three JSON-RPC message shapes.
///
/// The untagged variant order matters: a request (`id` + `method`) must be
/// tried before a response (`id` only), which must be tried before a
/// notification (`method` only).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Envelope {
    /// Inbound request from the peer; the engine writes a response back.
    Request(RequestEnvelope),
    /// Response matching one of our outstanding calls.
    Response(ResponseEnvelope),
    /// Fire-and-forget notification.
    Notification(NotificationEnvelope),
}

/// Classify one raw line into an [`Envelope`].
///
/// Returns `None` for lines that are not JSON, not objects, or match none of
/// the three envelope shapes — such lines are tolerated silently because
/// some peers emit human-readable chatter before switching into RPC mode.
#[must_use]
pub fn classify(line: &str) -> Option<Envelope> {
    let envelope: Envelope = serde_json::from_str(line).ok()?;
    // A bare `{"id": N}` object deserializes as a response with neither
    // member present; it matches no protocol shape and is dropped.
    if let Envelope::Response(ref resp) = envelope {
        if resp.result.is_none() && resp.error.is_none() {
            return None;
        }
    }
    Some(envelope)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
