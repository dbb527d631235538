//! JSON-RPC 2.0 messages exchanged over the websocket, plus the event
//! subscription extension (`rpc.on` / `rpc.off` and server notifications).

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::RpcError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Subscribe the calling connection to events.
pub const SUBSCRIBE: &str = "rpc.on";
/// Unsubscribe the calling connection from events.
pub const UNSUBSCRIBE: &str = "rpc.off";

/// Subscription result for an event that was acknowledged.
pub const EVENT_OK: &str = "ok";
/// Subscription result for an event that is not registered.
pub const EVENT_INVALID: &str = "provided event invalid";

/// A request from a client. Requests without an `id` get no reply.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
    pub id: Value,
}

impl RpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, err: &RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result: None,
            error: Some(RpcErrorBody {
                code: err.code(),
                message: err.to_string(),
            }),
            id,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            json!({
                "jsonrpc": JSONRPC_VERSION,
                "error": { "code": -32603, "message": e.to_string() },
                "id": self.id,
            })
            .to_string()
        })
    }
}

/// Server push for a subscribed event.
pub fn notification(event: &str, params: &Value) -> String {
    json!({ "notification": event, "params": params }).to_string()
}

/// Event names in `rpc.on` / `rpc.off` params: an array of names or a
/// single name.
pub fn event_names(params: &Value) -> Result<Vec<String>, RpcError> {
    let invalid = || RpcError::InvalidParams("expected an array of event names".to_string());
    match params {
        Value::String(name) => Ok(vec![name.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        _ => Err(invalid()),
    }
}

/// Positional parameter `index`, or `Null` when absent.
pub fn positional(params: &Value, index: usize) -> &Value {
    params.get(index).unwrap_or(&Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_without_id_is_a_notification() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"holo/call","params":{"a":1}}"#)
                .unwrap();
        assert!(req.id.is_none());
        assert_eq!(req.params, json!({ "a": 1 }));
    }

    #[test]
    fn responses_carry_only_result_or_error() {
        let ok: Value = serde_json::from_str(&RpcResponse::result(json!(3), json!(true)).to_text())
            .unwrap();
        assert_eq!(ok, json!({ "jsonrpc": "2.0", "result": true, "id": 3 }));

        let err = RpcResponse::error(json!(4), &RpcError::MethodNotFound("nope".into()));
        let err: Value = serde_json::from_str(&err.to_text()).unwrap();
        assert_eq!(err["error"]["code"], -32601);
        assert!(err.get("result").is_none());
    }

    #[test]
    fn event_names_accept_array_or_string() {
        assert_eq!(event_names(&json!(["a", "b"])).unwrap(), vec!["a", "b"]);
        assert_eq!(event_names(&json!("a")).unwrap(), vec!["a"]);
        assert!(event_names(&json!([1])).is_err());
        assert!(event_names(&json!({})).is_err());
    }
}
