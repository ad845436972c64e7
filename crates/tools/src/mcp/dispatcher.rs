use futures::FutureExt;
use gasoline_capture::alerts::format_alerts_block;
use gasoline_storage::Journal;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use super::protocol::{
    recover_id, JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
    PARSE_ERROR, PROTOCOL_VERSION, RESOURCE_NOT_FOUND,
};
use super::resources;
use crate::modes;
use crate::rate_limit::ToolRateLimiter;
use crate::response::{StructuredError, ToolResult};
use crate::telemetry::{TelemetryMode, TelemetrySummary};
use crate::{ToolContext, ToolRegistry, ToolState};

/// Routes JSON-RPC frames to MCP methods and runs the tool-call pipeline.
///
/// Holds no per-caller state: the client ID arrives with every call.
pub struct McpDispatcher {
    registry: ToolRegistry,
    state: Arc<ToolState>,
    limiter: ToolRateLimiter,
    journal: Option<Arc<Journal>>,
    version: String,
}

impl McpDispatcher {
    pub fn new(state: Arc<ToolState>, journal: Option<Arc<Journal>>) -> Self {
        let limiter = ToolRateLimiter::new(state.config.tools.calls_per_minute);
        Self {
            registry: ToolRegistry::with_defaults(),
            state,
            limiter,
            journal,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn state(&self) -> &Arc<ToolState> {
        &self.state
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Handle one raw frame. `None` means the frame was a notification.
    pub async fn handle_body(&self, body: &[u8], client_id: &str) -> Option<JsonRpcResponse> {
        match serde_json::from_slice::<JsonRpcRequest>(body) {
            Ok(req) => self.handle(req, client_id).await,
            Err(e) => {
                debug!(error = %e, "Unparseable JSON-RPC frame");
                Some(JsonRpcResponse::failure(
                    recover_id(body),
                    PARSE_ERROR,
                    format!("Parse error: {}", e),
                ))
            }
        }
    }

    pub async fn handle(&self, req: JsonRpcRequest, client_id: &str) -> Option<JsonRpcResponse> {
        if req.is_notification() {
            debug!(method = %req.method, "Notification received");
            return None;
        }
        let id = req.id.clone().unwrap_or(Value::Null);
        let response = match req.method.as_str() {
            "initialize" => JsonRpcResponse::success(id, self.initialize(&req.params)),
            "initialized" | "ping" => JsonRpcResponse::success(id, json!({})),
            "prompts/list" => JsonRpcResponse::success(id, json!({"prompts": []})),
            "tools/list" => JsonRpcResponse::success(id, json!({"tools": self.registry.list_tools()})),
            "tools/call" => self.tools_call(id, &req.params, client_id).await,
            "resources/list" => JsonRpcResponse::success(id, json!({"resources": resources::list()})),
            "resources/templates/list" => JsonRpcResponse::success(id, json!({"resourceTemplates": []})),
            "resources/read" => Self::resources_read(id, &req.params),
            other => JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("Method not found: {}", other)),
        };
        Some(response)
    }

    fn initialize(&self, params: &Value) -> Value {
        let requested = params.get("protocolVersion").and_then(Value::as_str);
        if let Some(v) = requested.filter(|v| *v != PROTOCOL_VERSION) {
            debug!(requested = v, "Client asked for another protocol version");
        }
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {"name": "gasoline", "version": self.version},
            "capabilities": {"tools": {}, "resources": {}},
            "instructions": resources::INSTRUCTIONS,
        })
    }

    fn resources_read(id: Value, params: &Value) -> JsonRpcResponse {
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return JsonRpcResponse::failure(id, INVALID_PARAMS, "Invalid params: missing uri");
        };
        match resources::read(uri) {
            Some(text) => JsonRpcResponse::success(
                id,
                json!({"contents": [{"uri": uri, "mimeType": "text/markdown", "text": text}]}),
            ),
            None => JsonRpcResponse::failure(id, RESOURCE_NOT_FOUND, format!("Resource not found: {}", uri)),
        }
    }

    async fn tools_call(&self, id: Value, params: &Value, client_id: &str) -> JsonRpcResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::failure(id, INVALID_PARAMS, "Invalid params: missing tool name");
        };
        let args = match params.get("arguments") {
            None | Some(Value::Null) => json!({}),
            Some(v) => v.clone(),
        };

        if !self.limiter.allow() {
            warn!(tool = name, client = client_id, "Tool call rate limit exceeded");
            return JsonRpcResponse::failure(
                id,
                INTERNAL_ERROR,
                format!(
                    "Tool call rate limit exceeded ({} calls/minute). Please wait before retrying.",
                    self.limiter.capacity()
                ),
            );
        }
        if self.registry.get(name).is_none() {
            return JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("Unknown tool: {}", name));
        }

        let started = Instant::now();
        let result = self.run_pipeline(name, args.clone(), client_id).await;
        if let Some(journal) = &self.journal {
            journal.tool_call(
                name,
                call_mode(name, &args),
                client_id,
                result.is_error,
                started.elapsed().as_millis() as u64,
            );
        }
        match serde_json::to_value(&result) {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::failure(id, INTERNAL_ERROR, format!("Could not encode tool result: {}", e)),
        }
    }

    async fn run_pipeline(&self, name: &str, args: Value, client_id: &str) -> ToolResult {
        let ctx = ToolContext::new(self.state.clone(), client_id);
        let outcome = AssertUnwindSafe(self.registry.execute(name, ctx, args.clone()))
            .catch_unwind()
            .await;
        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ToolResult::from(e),
            Err(panic) => {
                error!(tool = name, panic = %panic_message(panic.as_ref()), "Tool handler panicked");
                ToolResult::error(StructuredError::new("internal", format!("Internal error while running {}", name)))
            }
        };

        if !result.is_error {
            for key in self.registry.unknown_params(name, &args) {
                result.add_warning(format!("unknown parameter '{}' for tool '{}' (ignored)", key, name));
            }
        }

        self.redact(&mut result);

        let capture = &self.state.capture;
        if name == modes::OBSERVE.tool {
            let alerts = capture.alerts.drain_for_observe();
            if !alerts.is_empty() {
                result.push_text(format_alerts_block(&alerts));
            }
        }

        let mode = args
            .get("telemetry_mode")
            .and_then(Value::as_str)
            .and_then(TelemetryMode::try_parse)
            .unwrap_or_else(|| self.state.telemetry.mode());
        let now = TelemetrySummary::sample(capture);
        if let Some(summary) = self.state.telemetry.summary_for(client_id, now, mode) {
            result.set_metadata("telemetry_summary", json!(summary));
        }
        result
    }

    fn redact(&self, result: &mut ToolResult) {
        let engine = &self.state.redaction;
        for block in result.content.iter_mut() {
            block.text = engine.redact_text(&block.text);
        }
        for value in result.metadata.values_mut() {
            engine.redact_value(value);
        }
    }
}

/// The discriminator value of a call, for the journal.
fn call_mode(name: &str, args: &Value) -> Option<String> {
    let discriminator = modes::ALL
        .iter()
        .find(|t| t.tool == name)
        .map(|t| t.discriminator)
        .unwrap_or("what");
    args.get(discriminator).and_then(Value::as_str).map(String::from)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use crate::{Tool, ToolSchema};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use gasoline_capture::alerts::{Alert, Severity};
    use gasoline_capture::BufferKind;
    use gasoline_core::Result;

    fn dispatcher() -> McpDispatcher {
        McpDispatcher::new(test_support::state(), None)
    }

    async fn call(d: &McpDispatcher, frame: Value, client: &str) -> Option<JsonRpcResponse> {
        let body = serde_json::to_vec(&frame).unwrap();
        d.handle_body(&body, client).await
    }

    fn tool_text(resp: &JsonRpcResponse) -> Vec<String> {
        resp.result.as_ref().unwrap()["content"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["text"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_initialize_negotiates_version() {
        let d = dispatcher();
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "2099-01-01"}}),
            "",
        )
        .await
        .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "gasoline");
        assert!(result["capabilities"]["tools"].is_object());
        assert!(result["capabilities"]["resources"].is_object());
        assert_eq!(resp.id, json!(1));
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let d = dispatcher();
        assert!(call(&d, json!({"jsonrpc": "2.0", "method": "initialized"}), "").await.is_none());
        assert!(call(&d, json!({"jsonrpc": "2.0", "id": 7, "method": "notifications/initialized"}), "")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_parse_error_keeps_id() {
        let d = dispatcher();
        let resp = d.handle_body(br#"{"jsonrpc":"2.0","id":9,"method":"#, "").await.unwrap();
        assert_eq!(resp.id, json!(9));
        assert_eq!(resp.error.unwrap().code, PARSE_ERROR);
        let resp = d.handle_body(b"not json", "").await.unwrap();
        assert_eq!(resp.id, json!("error"));
    }

    #[tokio::test]
    async fn test_unknown_method_and_tool() {
        let d = dispatcher();
        let resp = call(&d, json!({"jsonrpc": "2.0", "id": "a", "method": "bogus/method"}), "").await.unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert_eq!(err.message, "Method not found: bogus/method");

        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "teleport", "arguments": {}}}),
            "",
        )
        .await
        .unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_static_methods() {
        let d = dispatcher();
        let resp = call(&d, json!({"jsonrpc": "2.0", "id": 1, "method": "prompts/list"}), "").await.unwrap();
        assert_eq!(resp.result.unwrap(), json!({"prompts": []}));
        let resp = call(&d, json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}), "").await.unwrap();
        assert_eq!(resp.result.unwrap()["tools"].as_array().unwrap().len(), 5);
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 1, "method": "resources/read", "params": {"uri": "gasoline://guide"}}),
            "",
        )
        .await
        .unwrap();
        assert_eq!(resp.result.unwrap()["contents"][0]["mimeType"], "text/markdown");
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 1, "method": "resources/read", "params": {"uri": "gasoline://nope"}}),
            "",
        )
        .await
        .unwrap();
        assert_eq!(resp.error.unwrap().code, RESOURCE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_param_is_tool_result_not_rpc_error() {
        let d = dispatcher();
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call",
                   "params": {"name": "interact", "arguments": {"what": "execute_js"}}}),
            "",
        )
        .await
        .unwrap();
        assert!(resp.error.is_none());
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        let body: Value = serde_json::from_str(&text[text.find('{').unwrap()..]).unwrap();
        assert_eq!(body["error"], "missing_param");
        assert_eq!(body["param"], "script");
    }

    #[tokio::test]
    async fn test_unknown_arguments_become_warnings() {
        let d = dispatcher();
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call",
                   "params": {"name": "configure", "arguments": {"action": "health", "colour": "red"}}}),
            "",
        )
        .await
        .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], false);
        let warnings = result["metadata"]["warnings"].as_array().unwrap();
        assert_eq!(warnings[0], "unknown parameter 'colour' for tool 'configure' (ignored)");
    }

    #[tokio::test]
    async fn test_results_are_redacted() {
        let d = dispatcher();
        d.state().capture.ingest(
            BufferKind::Logs,
            vec![json!({"level": "error", "message": "auth failed for Bearer abcdefghijklmnopqrstuvwxyz123456"})],
        );
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 5, "method": "tools/call",
                   "params": {"name": "observe", "arguments": {"what": "errors"}}}),
            "",
        )
        .await
        .unwrap();
        let text = tool_text(&resp).join("\n");
        assert!(!text.contains("abcdefghijklmnopqrstuvwxyz123456"));
        assert!(text.contains("[REDACTED:bearer-token]"));
    }

    #[tokio::test]
    async fn test_redacted_result_json_still_parses() {
        let d = dispatcher();
        d.state().capture.ingest(
            BufferKind::Logs,
            vec![json!({"level": "error", "message": "api_key=abc", "url": "http://localhost:3000/login"})],
        );
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 6, "method": "tools/call",
                   "params": {"name": "observe", "arguments": {"what": "logs"}}}),
            "",
        )
        .await
        .unwrap();
        let text = &tool_text(&resp)[0];
        let body: Value = serde_json::from_str(&text[text.find('{').unwrap()..]).unwrap();
        assert_eq!(body["count"], 1);
        let entry = &body["entries"][0];
        assert_eq!(entry["message"], "[REDACTED:api-key]");
        assert_eq!(entry["level"], "error");
        assert_eq!(entry["url"], "http://localhost:3000/login");
    }

    #[tokio::test]
    async fn test_observe_appends_correlated_alert_block() {
        let d = dispatcher();
        let alerts = &d.state().capture.alerts;
        let t0 = Utc::now();
        for i in 0..3 {
            alerts.add(
                Alert::new(Severity::Warning, "regression", "LCP regressed", "LCP 2.1s -> 3.4s", "perf")
                    .at(t0 + ChronoDuration::milliseconds(i * 300)),
            );
        }
        alerts.add(
            Alert::new(Severity::Warning, "anomaly", "Error spike", "12 errors in 10s", "anomaly")
                .at(t0 + ChronoDuration::seconds(2)),
        );

        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 6, "method": "tools/call",
                   "params": {"name": "observe", "arguments": {"what": "errors"}}}),
            "",
        )
        .await
        .unwrap();
        let texts = tool_text(&resp);
        let block = texts.last().unwrap();
        assert!(block.starts_with("--- ALERTS (1) ---\n"));
        let listed: Value = serde_json::from_str(&block[block.find('[').unwrap()..]).unwrap();
        let alert = &listed[0];
        assert!(alert["title"].as_str().unwrap().starts_with("Correlated:"));
        assert_eq!(alert["count"], 3);
        assert!(alert["severity"] == "warning" || alert["severity"] == "error" || alert["severity"] == "critical");

        // Drained: a second observe carries no block.
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call",
                   "params": {"name": "observe", "arguments": {"what": "errors"}}}),
            "",
        )
        .await
        .unwrap();
        assert!(tool_text(&resp).iter().all(|t| !t.starts_with("--- ALERTS")));
    }

    #[tokio::test]
    async fn test_telemetry_full_override() {
        let d = dispatcher();
        let frame = json!({"jsonrpc": "2.0", "id": 8, "method": "tools/call",
                           "params": {"name": "observe", "arguments": {"what": "logs", "telemetry_mode": "full"}}});
        let first = call(&d, frame.clone(), "aaaaaaaaaaaa").await.unwrap();
        assert_eq!(first.result.unwrap()["metadata"]["telemetry_summary"]["logs"], 0);
        d.state().capture.ingest(BufferKind::Logs, vec![json!({"level": "info"}); 2]);
        let second = call(&d, frame, "aaaaaaaaaaaa").await.unwrap();
        assert_eq!(second.result.unwrap()["metadata"]["telemetry_summary"]["logs"], 2);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_with_internal_error() {
        let state = test_support::state();
        let mut config = state.config.clone();
        config.tools.calls_per_minute = 1;
        let state = Arc::new(ToolState::new(state.capture.clone(), config, state.redaction.clone()));
        let d = McpDispatcher::new(state, None);
        let frame = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                           "params": {"name": "configure", "arguments": {"action": "health"}}});
        assert!(call(&d, frame.clone(), "").await.unwrap().error.is_none());
        let resp = call(&d, frame, "").await.unwrap();
        assert_eq!(resp.error.unwrap().code, INTERNAL_ERROR);
    }

    struct PanickingTool;

    #[async_trait]
    impl Tool for PanickingTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "observe",
                description: "panics",
                parameters: json!({"type": "object", "properties": {}}),
            }
        }

        fn validate(&self, _params: &Value) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, _ctx: ToolContext, _params: Value) -> Result<ToolResult> {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal_error() {
        let mut d = dispatcher();
        d.registry.register(Arc::new(PanickingTool));
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "observe", "arguments": {}}}),
            "",
        )
        .await
        .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], true);
        assert!(result["content"][0]["text"].as_str().unwrap().contains("\"internal\""));
    }
}
