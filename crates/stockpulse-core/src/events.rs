use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::BridgeError;

/// A raw message as it arrives from the event source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

impl Notification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Decode the payload into a change event.
    pub fn decode(&self) -> Result<ChangeEvent, BridgeError> {
        ChangeEvent::decode(&self.channel, &self.payload)
    }
}

/// Decoded change payload. The bridge treats it as an opaque JSON object:
/// no field is required and every field is passed through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeEvent(Map<String, Value>);

impl ChangeEvent {
    /// Parse a channel payload. Anything that is not a JSON object is rejected.
    pub fn decode(channel: &str, payload: &str) -> Result<Self, BridgeError> {
        let value: Value = serde_json::from_str(payload).map_err(|e| BridgeError::Decode {
            channel: channel.to_string(),
            detail: e.to_string(),
        })?;
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(BridgeError::Decode {
                channel: channel.to_string(),
                detail: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
        }
    }

    /// Wire representation pushed to subscribers.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for ChangeEvent {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for ChangeEvent {
    type Error = BridgeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(BridgeError::Decode {
                channel: String::new(),
                detail: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
