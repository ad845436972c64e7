//! Tool-result envelope and the structured error payload agents parse.

use gasoline_core::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
        }
    }
}

/// `{content: [{type: "text", text}], isError, metadata?}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: false,
            metadata: Map::new(),
        }
    }

    /// A summary line followed by a compact JSON object.
    pub fn json(summary: &str, value: &Value) -> Self {
        Self::text(format!("{}\n{}", summary, value))
    }

    /// Same shape as [`ToolResult::json`], flagged as a failure.
    pub fn json_error(summary: &str, value: &Value) -> Self {
        let mut result = Self::json(summary, value);
        result.is_error = true;
        result
    }

    pub fn error(err: StructuredError) -> Self {
        let body = serde_json::to_value(&err).unwrap_or(Value::Null);
        Self::json_error(&format!("Error: {}", err.error), &body)
    }

    pub fn push_text(&mut self, text: impl Into<String>) {
        self.content.push(ContentBlock::text(text));
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        let entry = self
            .metadata
            .entry("warnings")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = entry {
            list.push(Value::String(warning.into()));
        }
    }

    pub fn warnings(&self) -> Vec<String> {
        self.metadata
            .get("warnings")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(|w| w.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }
}

impl From<Error> for ToolResult {
    fn from(err: Error) -> Self {
        ToolResult::error(StructuredError::from(&err))
    }
}

/// `{error, message, retry, param?, hint?}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructuredError {
    pub error: String,
    pub message: String,
    pub retry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl StructuredError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: code.to_string(),
            message: message.into(),
            retry: default_retry(code).to_string(),
            param: None,
            hint: None,
        }
    }

    pub fn missing_param(param: &str) -> Self {
        let mut err = Self::new("missing_param", format!("Required parameter '{}' is missing", param));
        err.param = Some(param.to_string());
        err.hint = Some(format!("Add the '{}' parameter and call again", param));
        err
    }

    pub fn invalid_param(param: &str, message: impl Into<String>) -> Self {
        let mut err = Self::new("invalid_param", message);
        err.param = Some(param.to_string());
        err
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_retry(mut self, retry: impl Into<String>) -> Self {
        self.retry = retry.into();
        self
    }
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        match err {
            Error::MissingParam(param) => StructuredError::missing_param(param),
            Error::Validation(msg) => {
                let mut out = StructuredError::new("invalid_param", msg.clone());
                out.hint = Some("Check the tool schema for valid values".to_string());
                out
            }
            other => StructuredError::new(other.code(), other.to_string()),
        }
    }
}

fn default_retry(code: &str) -> &'static str {
    match code {
        "missing_param" | "invalid_param" | "invalid_json" => "Fix the parameters and retry",
        "unknown_tool" => "Use tools/list to see the available tools",
        "rate_limited" => "Wait a few seconds, then retry",
        "permission_denied" => "Only the client that created this resource can read it",
        "no_data" => "Interact with the page to generate data, then retry",
        "extension_timeout" => "Check that the extension is connected and the tab is tracked, then retry",
        "extension_disconnected" => "Reload the browser extension, then retry",
        "csp_blocked_page" => "Retry with world:\"isolated\" or on a different page",
        "pilot_disabled" => "Enable AI Web Pilot in the extension popup, then retry",
        _ => "Retry; if the problem persists, check the daemon logs",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_text_shape() {
        let result = ToolResult::error(StructuredError::missing_param("selector"));
        assert!(result.is_error);
        let text = &result.content[0].text;
        assert!(text.starts_with("Error: missing_param\n"));
        let start = text.find('{').unwrap();
        let body: Value = serde_json::from_str(&text[start..]).unwrap();
        assert_eq!(body["error"], "missing_param");
        assert_eq!(body["param"], "selector");
        assert!(body["hint"].as_str().unwrap().contains("selector"));
    }

    #[test]
    fn test_envelope_serialization() {
        let mut result = ToolResult::json("2 entries", &json!({"count": 2}));
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["isError"], false);
        assert_eq!(v["content"][0]["type"], "text");
        assert!(v.get("metadata").is_none());

        result.add_warning("unknown parameter 'foo' ignored");
        result.add_warning("second");
        assert_eq!(result.warnings().len(), 2);
    }

    #[test]
    fn test_from_core_error() {
        let result = ToolResult::from(Error::PermissionDenied("q-1".into()));
        let text = &result.content[0].text;
        let body: Value = serde_json::from_str(&text[text.find('{').unwrap()..]).unwrap();
        assert_eq!(body["error"], "permission_denied");
    }
}
