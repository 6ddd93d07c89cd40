//! Opaque encrypted envelopes exchanged between peers.
//!
//! The transport never looks inside an envelope. It only checks that an
//! inbound frame is a JSON object and hands the parsed document to the
//! message receiver; decryption and routing happen further up.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{Result, TransportError};

/// An encrypted message envelope, kept as a raw JSON object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedMessage(Map<String, Value>);

impl EncryptedMessage {
    /// Parse a UTF-8 JSON frame into an envelope.
    ///
    /// Fails with [`TransportError::MalformedFrame`] when the text is not
    /// JSON or the document is not an object.
    pub fn from_json_str(text: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => Ok(Self(fields)),
            Ok(other) => Err(TransportError::MalformedFrame {
                reason: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
            Err(e) => Err(TransportError::MalformedFrame {
                reason: e.to_string(),
            }),
        }
    }

    /// Look up a top-level field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Borrow the underlying JSON object.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl TryFrom<Value> for EncryptedMessage {
    type Error = TransportError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(TransportError::MalformedFrame {
                reason: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parses_jwe_shaped_object() {
        let text = r#"{"protected":"eyJ","iv":"abc","ciphertext":"xyz","tag":"t"}"#;
        let msg = EncryptedMessage::from_json_str(text).unwrap();
        assert_eq!(msg.get("ciphertext"), Some(&json!("xyz")));
        assert_eq!(msg.fields().len(), 4);
    }

    #[test]
    fn rejects_invalid_json() {
        let err = EncryptedMessage::from_json_str("not json").unwrap_err();
        assert_matches!(err, TransportError::MalformedFrame { .. });
    }

    #[test]
    fn rejects_non_object_json() {
        let err = EncryptedMessage::from_json_str("[1,2,3]").unwrap_err();
        assert_matches!(err, TransportError::MalformedFrame { ref reason } if reason.contains("array"));
    }

    #[test]
    fn rejects_empty_frame() {
        assert!(EncryptedMessage::from_json_str("").is_err());
    }

    #[test]
    fn wire_form_preserves_fields() {
        let msg = EncryptedMessage::try_from(json!({"type": "ping-test"})).unwrap();
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"type":"ping-test"}"#);
    }

    #[test]
    fn try_from_scalar_fails() {
        assert!(EncryptedMessage::try_from(json!(42)).is_err());
    }
}
