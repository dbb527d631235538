//! Response envelopes returned to clients.

use serde::Serialize;
use serde_json::{Value, json};

/// Error source reported to clients.
pub const HOLO_ERROR: &str = "HoloError";

/// `{type, payload, metadata}` envelope used by call-style methods.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Package {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Package {
    pub fn success(payload: Value, response_id: Option<u64>) -> Self {
        Self {
            kind: "success",
            payload,
            metadata: response_id.map(|id| json!({ "response_id": id })),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: "error",
            payload: json!({ "source": HOLO_ERROR, "message": message.into() }),
            metadata: None,
        }
    }

    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Bare error object returned by methods that predate the envelope.
pub fn holo_error(message: &str) -> Value {
    json!({ "name": HOLO_ERROR, "message": message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn success_carries_response_id() {
        assert_eq!(
            Package::success(json!(true), Some(4)).into_value(),
            json!({ "type": "success", "payload": true, "metadata": { "response_id": 4 } })
        );
        assert!(Package::success(json!(1), None).into_value().get("metadata").is_none());
    }

    #[test]
    fn error_names_its_source() {
        assert_eq!(
            Package::error("boom").into_value(),
            json!({ "type": "error", "payload": { "source": "HoloError", "message": "boom" } })
        );
    }
}
