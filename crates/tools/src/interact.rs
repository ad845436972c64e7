use async_trait::async_trait;
use gasoline_core::{Error, Result};
use serde_json::{json, Value};

use crate::async_cmd::{run_command, wants_background};
use crate::modes::INTERACT;
use crate::{str_param, Tool, ToolContext, ToolResult, ToolSchema};

/// Extension query type and payload for one interact mode.
fn build_command(what: &str, params: &Value) -> Result<(&'static str, Value)> {
    let selector = str_param(params, "selector");
    let out = match what {
        "click" | "highlight" => (
            "dom_action",
            json!({"action": what, "selector": selector}),
        ),
        "type" => (
            "dom_action",
            json!({
                "action": "type",
                "selector": selector,
                "text": str_param(params, "text"),
                "clear": params.get("clear").and_then(Value::as_bool).unwrap_or(false),
            }),
        ),
        "navigate" => {
            let url = str_param(params, "url").unwrap_or("");
            let parsed = url::Url::parse(url)
                .map_err(|e| Error::Validation(format!("Invalid url '{}': {}", url, e)))?;
            if !matches!(parsed.scheme(), "http" | "https" | "file") {
                return Err(Error::Validation(format!(
                    "Refusing to navigate to '{}' scheme",
                    parsed.scheme()
                )));
            }
            ("browser_action", json!({"action": "navigate", "url": url}))
        }
        "refresh" | "back" | "forward" => ("browser_action", json!({"action": what})),
        "execute_js" => (
            "execute",
            json!({
                "script": str_param(params, "script"),
                "world": str_param(params, "world").unwrap_or("main"),
                "timeout_ms": params.get("timeout_ms").and_then(Value::as_u64).unwrap_or(5000),
            }),
        ),
        "set_storage" => {
            let storage = str_param(params, "storage_type").unwrap_or("localStorage");
            if !matches!(storage, "localStorage" | "sessionStorage") {
                return Err(Error::Validation(format!(
                    "storage_type must be localStorage or sessionStorage, got '{}'",
                    storage
                )));
            }
            (
                "browser_action",
                json!({
                    "action": "set_storage",
                    "storage_type": storage,
                    "key": str_param(params, "key"),
                    "value": params.get("value").cloned().unwrap_or(Value::Null),
                }),
            )
        }
        other => return Err(Error::Validation(format!("Unhandled interact mode '{}'", other))),
    };
    Ok(out)
}

pub struct InteractTool;

#[async_trait]
impl Tool for InteractTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "interact",
            description: "Drive the tracked browser tab: click, type, navigate, run JavaScript, set storage or highlight elements. Commands run synchronously by default; pass background=true to get a correlation_id and poll observe what=command_result.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "what": {"type": "string", "enum": INTERACT.schema_enum(), "description": "Action to perform"},
                    "selector": {"type": "string", "description": "(click, type, highlight) CSS selector"},
                    "text": {"type": "string", "description": "(type) Text to type"},
                    "clear": {"type": "boolean", "description": "(type) Clear the field first"},
                    "url": {"type": "string", "description": "(navigate) Destination URL"},
                    "script": {"type": "string", "description": "(execute_js) JavaScript to evaluate"},
                    "world": {"type": "string", "enum": ["main", "isolated"], "description": "(execute_js) Execution world"},
                    "timeout_ms": {"type": "integer", "description": "(execute_js) Script timeout"},
                    "key": {"type": "string", "description": "(set_storage) Storage key"},
                    "value": {"description": "(set_storage) Value to store"},
                    "storage_type": {"type": "string", "enum": ["localStorage", "sessionStorage"], "description": "(set_storage) Storage area"},
                    "background": {"type": "boolean", "description": "Return immediately with a correlation_id"},
                    "sync": {"type": "boolean", "description": "false is the same as background=true"},
                    "wait": {"type": "boolean", "description": "false is the same as background=true"},
                    "telemetry_mode": {"type": "string", "enum": ["off", "auto", "full"], "description": "Override passive telemetry for this call"}
                },
                "required": ["what"],
                "x-capabilities": INTERACT.capabilities()
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let mode = INTERACT.resolve(params)?;
        build_command(mode.name, params).map(|_| ())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolResult> {
        let mode = INTERACT.resolve(&params)?;
        let (query_type, payload) = build_command(mode.name, &params)?;
        run_command(&ctx, mode.name, query_type, payload, wants_background(&params)).await
    }
}
