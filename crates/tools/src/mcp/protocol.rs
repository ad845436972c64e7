use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_PARAMS: i64 = -32602;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;
pub const RESOURCE_NOT_FOUND: i64 = -32002;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    /// No `id`, or a `notifications/` method: the caller gets no response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none() || self.method.starts_with("notifications/")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

static ID_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#""id"\s*:\s*("(?:[^"\\]|\\.)*"|-?\d+)"#).ok());

/// Best-effort request id for a frame that failed to parse.
///
/// Never `null`: some clients reject that, so the fallback is the string `"error"`.
pub fn recover_id(body: &[u8]) -> Value {
    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
        if let Some(id) = map.get("id").filter(|v| !v.is_null()) {
            return id.clone();
        }
    }
    let text = String::from_utf8_lossy(body);
    ID_PATTERN
        .as_ref()
        .and_then(|re| re.captures(&text))
        .and_then(|caps| caps.get(1))
        .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
        .unwrap_or_else(|| Value::String("error".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_detection() {
        let req: JsonRpcRequest = serde_json::from_value(json!({"jsonrpc": "2.0", "method": "initialized"})).unwrap();
        assert!(req.is_notification());
        let req: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 3, "method": "notifications/cancelled"})).unwrap();
        assert!(req.is_notification());
        let req: JsonRpcRequest = serde_json::from_value(json!({"jsonrpc": "2.0", "id": 3, "method": "ping"})).unwrap();
        assert!(!req.is_notification());
    }

    #[test]
    fn test_recover_id_from_truncated_frame() {
        assert_eq!(recover_id(br#"{"jsonrpc":"2.0","id":42,"method":"tools/ca"#), json!(42));
        assert_eq!(recover_id(br#"{"id":"abc","method":"#), json!("abc"));
        assert_eq!(recover_id(b"garbage"), json!("error"));
        assert_eq!(recover_id(br#"{"id":null,"method":1}"#), json!("error"));
    }

    #[test]
    fn test_response_omits_absent_members() {
        let ok = serde_json::to_value(JsonRpcResponse::success(json!(1), json!({}))).unwrap();
        assert!(ok.get("error").is_none());
        let err = serde_json::to_value(JsonRpcResponse::failure(json!(1), METHOD_NOT_FOUND, "Method not found: x")).unwrap();
        assert!(err.get("result").is_none());
        assert_eq!(err["error"]["code"], -32601);
    }
}
