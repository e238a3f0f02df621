//! JSON-RPC 2.0 message shapes as they appear on an upstream's stdio.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Correlation id. Our own requests always use numbers; peers may use strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call expecting a response. `id` is `None` when the peer sent `null`.
    Request {
        id: Option<RequestId>,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: Option<RequestId>,
        outcome: Result<Value, RpcError>,
    },
}

impl Message {
    /// Classify a JSON value. Anything that is not a recognisable
    /// request, notification or response yields an error message.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut obj) = value else {
            return Err("frame is not a JSON object".into());
        };
        let id = match obj.remove("id") {
            None => None,
            Some(Value::Null) => Some(None),
            Some(v) => Some(Some(
                serde_json::from_value::<RequestId>(v).map_err(|e| format!("bad id: {e}"))?,
            )),
        };
        let params = obj.remove("params").unwrap_or(Value::Null);

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err("method is not a string".into());
            };
            return Ok(match id {
                Some(id) => Message::Request { id, method, params },
                None => Message::Notification { method, params },
            });
        }

        let id = id.ok_or("response without id")?;
        if let Some(err) = obj.remove("error") {
            let err: RpcError =
                serde_json::from_value(err).map_err(|e| format!("bad error object: {e}"))?;
            return Ok(Message::Response { id, outcome: Err(err) });
        }
        match obj.remove("result") {
            Some(result) => Ok(Message::Response { id, outcome: Ok(result) }),
            None => Err("response carries neither result nor error".into()),
        }
    }

    pub fn parse(line: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), json!("2.0"));
        match self {
            Message::Request { id, method, params } => {
                obj.insert("id".into(), json!(id));
                obj.insert("method".into(), json!(method));
                if !params.is_null() {
                    obj.insert("params".into(), params.clone());
                }
            }
            Message::Notification { method, params } => {
                obj.insert("method".into(), json!(method));
                if !params.is_null() {
                    obj.insert("params".into(), params.clone());
                }
            }
            Message::Response { id, outcome } => {
                obj.insert("id".into(), json!(id));
                match outcome {
                    Ok(result) => obj.insert("result".into(), result.clone()),
                    Err(err) => obj.insert("error".into(), json!(err)),
                };
            }
        }
        Value::Object(obj)
    }

    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Message::Request {
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response(id: Option<RequestId>, outcome: Result<Value, RpcError>) -> Self {
        Message::Response { id, outcome }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_frames() {
        let req = Message::parse(r#"{"jsonrpc":"2.0","id":3,"method":"tools/list"}"#).unwrap();
        assert_eq!(req, Message::request(3, "tools/list", Value::Null));

        let note = Message::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(matches!(note, Message::Notification { ref method, .. } if method == "notifications/initialized"));

        let ok = Message::parse(r#"{"jsonrpc":"2.0","id":"a","result":{"x":1}}"#).unwrap();
        assert_eq!(
            ok,
            Message::response(Some(RequestId::String("a".into())), Ok(json!({"x": 1})))
        );

        let err = Message::parse(r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"nope"}}"#).unwrap();
        let Message::Response { outcome: Err(e), .. } = err else { panic!("expected error") };
        assert_eq!(e.code, METHOD_NOT_FOUND);
    }

    #[test]
    fn null_id_request_is_kept_apart_from_notifications() {
        let m = Message::parse(r#"{"jsonrpc":"2.0","id":null,"method":"roots/list"}"#).unwrap();
        assert!(matches!(m, Message::Request { id: None, .. }));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Message::parse("not json").is_err());
        assert!(Message::parse("[1,2]").is_err());
        assert!(Message::parse(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
    }

    #[test]
    fn encodes_without_null_params() {
        let v = Message::notification("notifications/initialized", Value::Null).to_value();
        assert_eq!(v, json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
        let v = Message::response(None, Err(RpcError::new(INVALID_REQUEST, "null id"))).to_value();
        assert_eq!(v["id"], Value::Null);
        assert_eq!(v["error"]["code"], json!(-32600));
    }
}
