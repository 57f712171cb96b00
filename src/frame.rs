//! Wire frames.
//!
//! Every message on the socket is a single JSON object with a mandatory
//! `command` string. Everything else is free-form and carried opaquely
//! through the transport and session layers.
//!
//! ```text
//! {"command": "send", "uuid": "3f1c...", "payload": {...}}
//! └─ command ────────┘└─ fields (flattened) ──────────────┘
//! ```
//!
//! Rust guideline compliant 2025-01

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keepalive probe.
pub const PING: &str = "ping";
/// Keepalive answer.
pub const PONG: &str = "pong";
/// Channel open request.
pub const REGISTER: &str = "connection:register";
/// Channel open acknowledgement.
pub const REGISTERED: &str = "connection:registered";
/// Channel close request.
pub const CLOSE: &str = "connection:close";
/// Channel close acknowledgement.
pub const CLOSED: &str = "connection:closed";
/// Channel payload envelope.
pub const SEND: &str = "send";
/// Message acknowledgement.
pub const ACK: &str = "ACK";

/// A single JSON message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Command name, e.g. `connection:register` or `synclist:append`.
    pub command: String,
    /// All remaining top-level fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Frame {
    /// Create a frame with no fields besides `command`.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Look up a top-level field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Look up a top-level string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// The channel id this frame is scoped to, if any.
    pub fn uuid(&self) -> Option<&str> {
        self.get_str("uuid")
    }

    /// Parse a frame from raw socket bytes.
    ///
    /// Returns `None` for anything that is not a JSON object with a string
    /// `command`; callers drop such input.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Self>(bytes) {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::debug!("[Frame] Dropping malformed frame: {e}");
                None
            }
        }
    }

    /// Serialize to compact JSON.
    pub fn to_json(&self) -> String {
        // A struct of String + Map<String, Value> always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Generate a fresh channel identifier.
pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_valid_frame() {
        let frame = Frame::parse(br#"{"command":"send","uuid":"X","payload":{"a":1}}"#).unwrap();
        assert_eq!(frame.command, "send");
        assert_eq!(frame.uuid(), Some("X"));
        assert_eq!(frame.get("payload"), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_parse_drops_malformed_json() {
        assert!(Frame::parse(b"{not json").is_none());
        assert!(Frame::parse(b"").is_none());
    }

    #[test]
    fn test_parse_drops_missing_or_non_string_command() {
        assert!(Frame::parse(br#"{"uuid":"X"}"#).is_none());
        assert!(Frame::parse(br#"{"command":5}"#).is_none());
        assert!(Frame::parse(br#"[1,2,3]"#).is_none());
    }

    #[test]
    fn test_to_json_is_compact_and_contains_command() {
        let json = Frame::new(PING).to_json();
        assert_eq!(json, r#"{"command":"ping"}"#);

        let json = Frame::new(REGISTER).with("uuid", "abc").to_json();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, json!({"command": "connection:register", "uuid": "abc"}));
        assert!(!json.contains(' '));
    }

    #[test]
    fn test_new_uuid_is_unique() {
        assert_ne!(new_uuid(), new_uuid());
    }
}
