use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// NIS message type for unencrypted payloads.
pub const PLAIN_MESSAGE_TYPE: u8 = 1;

/// An unencrypted transfer message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainMessage {
    payload: String,
}

impl PlainMessage {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Decodes a hex encoded UTF-8 payload as sent on the wire.
    pub fn from_hex(hex_payload: &str) -> Result<Self, ModelError> {
        let bytes = hex::decode(hex_payload.trim())
            .map_err(|e| ModelError::InvalidHex(e.to_string()))?;
        let payload = String::from_utf8(bytes).map_err(|_| ModelError::InvalidUtf8)?;
        Ok(Self { payload })
    }

    /// Builds a message from a raw message object (`{ "payload": "<hex>", ... }`).
    pub fn cast(raw: &Value) -> Result<Self, ModelError> {
        match raw.get("payload") {
            Some(Value::String(hex_payload)) => Self::from_hex(hex_payload),
            Some(Value::Null) | None => Ok(Self::empty()),
            Some(_) => Err(ModelError::InvalidField { field: "payload" }),
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.payload.as_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload length in bytes, which is what the message fee is charged on.
    pub fn len(&self) -> usize {
        self.payload.len()
    }
}
