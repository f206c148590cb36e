//! JSON-RPC 2.0 envelopes.
//!
//! Classification is structural: `method` + `id` is a request, `id` alone is a
//! response, `method` alone is a notification. Params are never validated
//! here and unknown methods are not an error.

use std::fmt;

use parley_core::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC error codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Request id. Peers may use numbers or strings.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self::Number(n as i64)
    }
}

/// JSON-RPC error object carried by an error response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        outcome: Result<Value, ErrorObject>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Envelope {
    pub fn request(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Self::Response {
            id,
            outcome: Ok(result),
        }
    }

    pub fn error_response(id: RequestId, error: ErrorObject) -> Self {
        Self::Response {
            id,
            outcome: Err(error),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        let _ = obj.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
        match self {
            Self::Request { id, method, params } => {
                let _ = obj.insert("id".into(), json!(id));
                let _ = obj.insert("method".into(), json!(method));
                if let Some(params) = params {
                    let _ = obj.insert("params".into(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                let _ = obj.insert("id".into(), json!(id));
                match outcome {
                    Ok(result) => {
                        let _ = obj.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        let _ = obj.insert("error".into(), json!(error));
                    }
                }
            }
            Self::Notification { method, params } => {
                let _ = obj.insert("method".into(), json!(method));
                if let Some(params) = params {
                    let _ = obj.insert("params".into(), params.clone());
                }
            }
        }
        Value::Object(obj)
    }

    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }
}

/// Classify a decoded JSON value into an envelope.
pub fn classify(value: &Value) -> Result<Envelope, ProtocolError> {
    let Some(obj) = value.as_object() else {
        return Err(ProtocolError("envelope is not a JSON object".into()));
    };

    let method = match obj.get("method") {
        None | Some(Value::Null) => None,
        Some(Value::String(m)) => Some(m.clone()),
        Some(_) => return Err(ProtocolError("method must be a string".into())),
    };
    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            serde_json::from_value::<RequestId>(raw.clone())
                .map_err(|_| ProtocolError(format!("invalid id: {raw}")))?,
        ),
    };
    let params = obj.get("params").cloned();

    match (id, method) {
        (Some(id), Some(method)) => Ok(Envelope::Request { id, method, params }),
        (None, Some(method)) => Ok(Envelope::Notification { method, params }),
        (Some(id), None) => {
            let outcome = match obj.get("error") {
                Some(err) if !err.is_null() => Err(serde_json::from_value(err.clone())
                    .unwrap_or_else(|_| ErrorObject {
                        code: INTERNAL_ERROR,
                        message: err.to_string(),
                        data: None,
                    })),
                _ => Ok(obj.get("result").cloned().unwrap_or(Value::Null)),
            };
            Ok(Envelope::Response { id, outcome })
        }
        (None, None) => Err(ProtocolError("missing both id and method".into())),
    }
}

/// Parse wire text and classify it.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError(format!("invalid JSON: {e}")))?;
    classify(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodes_with_version() {
        let env = Envelope::request(7u64, "session/prompt", Some(json!({"sessionId": "s1"})));
        let v = env.to_value();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 7);
        assert_eq!(v["method"], "session/prompt");
        assert_eq!(v["params"]["sessionId"], "s1");
    }

    #[test]
    fn notification_has_no_id() {
        let v = Envelope::notification("session/cancel", None).to_value();
        assert_eq!(v["jsonrpc"], "2.0");
        assert!(v.get("id").is_none());
        assert!(v.get("params").is_none());
    }

    #[test]
    fn error_response_encodes_error_object() {
        let env = Envelope::error_response(
            RequestId::String("abc".into()),
            ErrorObject::method_not_found("fs/read_text_file"),
        );
        let v = env.to_value();
        assert_eq!(v["id"], "abc");
        assert_eq!(v["error"]["code"], METHOD_NOT_FOUND);
        assert!(v.get("result").is_none());
        assert!(v.get("method").is_none());
    }

    #[test]
    fn classify_request() {
        let env = decode(r#"{"jsonrpc":"2.0","id":3,"method":"fs/read","params":{}}"#).unwrap();
        assert!(matches!(env, Envelope::Request { id: RequestId::Number(3), .. }));
        assert_eq!(env.method(), Some("fs/read"));
    }

    #[test]
    fn classify_response_with_result() {
        let env = decode(r#"{"jsonrpc":"2.0","id":3,"result":{"stopReason":"end_turn"}}"#).unwrap();
        let Envelope::Response { id, outcome } = env else {
            panic!("expected response");
        };
        assert_eq!(id, RequestId::Number(3));
        assert_eq!(outcome.unwrap()["stopReason"], "end_turn");
    }

    #[test]
    fn classify_response_with_error() {
        let env =
            decode(r#"{"jsonrpc":"2.0","id":"x","error":{"code":-32602,"message":"bad"}}"#).unwrap();
        let Envelope::Response { outcome, .. } = env else {
            panic!("expected response");
        };
        let err = outcome.unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert_eq!(err.message, "bad");
    }

    #[test]
    fn classify_malformed_error_object_keeps_text() {
        let env = decode(r#"{"id":1,"error":"nope"}"#).unwrap();
        let Envelope::Response { outcome, .. } = env else {
            panic!("expected response");
        };
        assert_eq!(outcome.unwrap_err().code, INTERNAL_ERROR);
    }

    #[test]
    fn classify_notification_with_unknown_method() {
        let env = decode(r#"{"jsonrpc":"2.0","method":"x/unheard_of"}"#).unwrap();
        assert_eq!(env, Envelope::notification("x/unheard_of", None));
    }

    #[test]
    fn null_id_is_treated_as_absent() {
        let env = decode(r#"{"id":null,"method":"session/update","params":{}}"#).unwrap();
        assert!(matches!(env, Envelope::Notification { .. }));
    }

    #[test]
    fn missing_id_and_method_is_protocol_error() {
        let err = decode(r#"{"jsonrpc":"2.0","result":1}"#).unwrap_err();
        assert!(err.0.contains("missing both"));
    }

    #[test]
    fn non_object_and_bad_json_are_protocol_errors() {
        assert!(decode("[1,2]").is_err());
        assert!(decode("not json").unwrap_err().0.starts_with("invalid JSON"));
        assert!(decode(r#"{"method": 5}"#).is_err());
    }
}
