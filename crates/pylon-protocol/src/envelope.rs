//! Message envelopes for the Pylon protocol.
//!
//! An inbound [`Envelope`] selects a registered handler by its integer
//! message type. The matching [`Reply`] preserves the envelope's
//! `message_type` and `request_id` verbatim on every response path.

use serde::{Deserialize, Serialize};

/// WebSocket close code sent for policy violations.
///
/// Used uniformly for authentication failure, connection-admission denial,
/// and message-rate denial.
pub const POLICY_VIOLATION: u16 = 1008;

/// Status of a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum StatusCode {
    /// Handler ran and produced a result.
    Ok = 0,
    /// Handler failed; detail withheld from the client.
    Error = 1,
    /// Unknown message type or payload failed schema validation.
    InvalidData = 2,
    /// Identity's roles do not satisfy the handler's requirements.
    PermissionDenied = 3,
}

impl From<StatusCode> for u8 {
    fn from(code: StatusCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for StatusCode {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Error),
            2 => Ok(StatusCode::InvalidData),
            3 => Ok(StatusCode::PermissionDenied),
            _ => Err("Invalid status code"),
        }
    }
}

/// An inbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Integer discriminator selecting the registered handler.
    pub message_type: u16,
    /// Client-chosen correlation token, opaque to the server.
    pub request_id: String,
    /// Structured request payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(message_type: u16, request_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            message_type,
            request_id: request_id.into(),
            data,
        }
    }
}

/// An outbound response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Message type of the request this reply answers.
    pub message_type: u16,
    /// Request id echoed back unchanged.
    pub request_id: String,
    /// Outcome of the dispatch.
    pub status_code: StatusCode,
    /// Structured response payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Optional response metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl Reply {
    fn derived(envelope: &Envelope, status_code: StatusCode, data: serde_json::Value) -> Self {
        Self {
            message_type: envelope.message_type,
            request_id: envelope.request_id.clone(),
            status_code,
            data,
            meta: None,
        }
    }

    /// Successful reply carrying the handler's result.
    #[must_use]
    pub fn ok(envelope: &Envelope, data: serde_json::Value) -> Self {
        Self::derived(envelope, StatusCode::Ok, data)
    }

    /// Generic failure reply. The handler's error is logged server-side,
    /// not echoed to the client.
    #[must_use]
    pub fn error(envelope: &Envelope) -> Self {
        Self::derived(
            envelope,
            StatusCode::Error,
            serde_json::json!({"message": "internal error"}),
        )
    }

    /// Validation failure reply carrying a human-readable detail.
    #[must_use]
    pub fn invalid_data(envelope: &Envelope, detail: impl Into<String>) -> Self {
        Self::derived(
            envelope,
            StatusCode::InvalidData,
            serde_json::json!({"message": detail.into()}),
        )
    }

    /// Authorization failure reply.
    #[must_use]
    pub fn permission_denied(envelope: &Envelope) -> Self {
        Self::derived(
            envelope,
            StatusCode::PermissionDenied,
            serde_json::json!({"message": "permission denied"}),
        )
    }

    /// Server-initiated push, not correlated with any request.
    #[must_use]
    pub fn push(message_type: u16, data: serde_json::Value) -> Self {
        Self {
            message_type,
            request_id: String::new(),
            status_code: StatusCode::Ok,
            data,
            meta: None,
        }
    }

    /// Attach response metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_code_conversion() {
        assert_eq!(StatusCode::try_from(0), Ok(StatusCode::Ok));
        assert_eq!(StatusCode::try_from(1), Ok(StatusCode::Error));
        assert_eq!(StatusCode::try_from(2), Ok(StatusCode::InvalidData));
        assert_eq!(StatusCode::try_from(3), Ok(StatusCode::PermissionDenied));
        assert!(StatusCode::try_from(4).is_err());
    }

    #[test]
    fn test_replies_preserve_correlation() {
        let envelope = Envelope::new(42, "req-abc", json!({"k": "v"}));

        let replies = [
            Reply::ok(&envelope, json!({})),
            Reply::error(&envelope),
            Reply::invalid_data(&envelope, "bad payload"),
            Reply::permission_denied(&envelope),
        ];

        for reply in replies {
            assert_eq!(reply.message_type, 42);
            assert_eq!(reply.request_id, "req-abc");
        }
    }

    #[test]
    fn test_invalid_data_carries_detail() {
        let envelope = Envelope::new(1, "r", json!({}));
        let reply = Reply::invalid_data(&envelope, "missing field: name");

        assert_eq!(reply.status_code, StatusCode::InvalidData);
        assert_eq!(reply.data["message"], "missing field: name");
    }

    #[test]
    fn test_push_has_empty_request_id() {
        let push = Reply::push(9, json!({"event": "shutdown"}));
        assert!(push.request_id.is_empty());
        assert_eq!(push.status_code, StatusCode::Ok);
    }
}
