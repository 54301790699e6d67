//! Classification of embedded protocol messages.
//!
//! The gateway never interprets payloads beyond this: a message with both a
//! `method` and an `id` is a request, a message with a `method` and no `id` is
//! a notification, anything else travels the reply-expecting path.

use serde_json::Value;

/// How the gateway must treat an inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Has a method and an id; exactly one reply is expected.
    Request,
    /// Has a method but no id; fire-and-forget.
    Notification,
    /// No method (e.g. a response or a batch); treated as reply-expecting.
    Other,
}

impl MessageKind {
    pub fn expects_reply(&self) -> bool {
        !matches!(self, MessageKind::Notification)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Notification => "notification",
            MessageKind::Other => "other",
        }
    }
}

/// The `method` member, when present and a string.
pub fn method(payload: &Value) -> Option<&str> {
    payload.get("method").and_then(Value::as_str)
}

/// The `id` member, when present and not null.
pub fn request_id(payload: &Value) -> Option<&Value> {
    payload.get("id").filter(|id| !id.is_null())
}

pub fn classify(payload: &Value) -> MessageKind {
    match (method(payload), request_id(payload)) {
        (Some(_), Some(_)) => MessageKind::Request,
        (Some(_), None) => MessageKind::Notification,
        (None, _) => MessageKind::Other,
    }
}

/// True for the handshake request that opens a protocol session.
pub fn is_initialize(payload: &Value) -> bool {
    method(payload) == Some("initialize")
}
