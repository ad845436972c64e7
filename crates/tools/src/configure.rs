use async_trait::async_trait;
use gasoline_capture::BufferKind;
use gasoline_core::{Error, Result};
use serde_json::{json, Value};
use tracing::info;

use crate::modes::CONFIGURE;
use crate::observe::health_report;
use crate::response::StructuredError;
use crate::telemetry::TelemetryMode;
use crate::{str_param, Tool, ToolContext, ToolResult, ToolSchema};

const BOUNDARY_PREFIX: &str = "test-boundary:";
const BOUNDARY_RECORD_LIMIT: usize = 1000;

pub struct ConfigureTool;

impl ConfigureTool {
    fn clear(ctx: &ToolContext, params: &Value) -> Result<ToolResult> {
        let target = str_param(params, "buffer").unwrap_or("all");
        let kind = if target == "all" {
            None
        } else {
            Some(BufferKind::parse(target).ok_or_else(|| {
                Error::Validation(format!(
                    "Unknown buffer '{}'. Valid values: all, logs, network_bodies, websocket_events, actions, http_debug",
                    target
                ))
            })?)
        };
        let cleared = ctx.capture().store.clear(kind);
        info!(buffer = target, cleared, "Buffers cleared");
        Ok(ToolResult::json(
            &format!("Cleared {} records", cleared),
            &json!({"buffer": target, "cleared": cleared}),
        ))
    }

    fn telemetry(ctx: &ToolContext, params: &Value) -> Result<ToolResult> {
        let telemetry = &ctx.state.telemetry;
        if let Some(raw) = str_param(params, "mode") {
            let mode = TelemetryMode::try_parse(raw)
                .ok_or_else(|| Error::Validation(format!("Unknown telemetry mode '{}'. Valid values: off, auto, full", raw)))?;
            telemetry.set_mode(mode);
        }
        let mode = telemetry.mode();
        Ok(ToolResult::json(
            &format!("Telemetry mode {}", mode.as_str()),
            &json!({"telemetry_mode": mode.as_str()}),
        ))
    }

    fn checkpoint(ctx: &ToolContext, name: &str) -> ToolResult {
        let capture = ctx.capture();
        capture.checkpoints.create(&capture.store, name, &ctx.client_id);
        ToolResult::json(
            &format!("Checkpoint '{}' created", name),
            &json!({"checkpoint": name, "counters": capture.store.counters()}),
        )
    }

    fn boundary_end(ctx: &ToolContext, test_id: &str) -> ToolResult {
        let capture = ctx.capture();
        let name = format!("{}{}", BOUNDARY_PREFIX, test_id);
        if !capture.checkpoints.exists(&name, &ctx.client_id) {
            return ToolResult::error(
                StructuredError::invalid_param("test_id", format!("No test boundary started for '{}'", test_id))
                    .with_hint("Call configure action=test_boundary_start with this test_id first"),
            );
        }
        let diff = capture.checkpoints.changes_since(
            &capture.store,
            &name,
            &ctx.client_id,
            &[BufferKind::Logs],
            BOUNDARY_RECORD_LIMIT,
        );
        let errors = diff
            .changes
            .get(&BufferKind::Logs)
            .map(|c| {
                c.records
                    .iter()
                    .filter(|r| r.get("level").and_then(Value::as_str) == Some("error"))
                    .count()
            })
            .unwrap_or(0);
        let full = capture
            .checkpoints
            .changes_since(&capture.store, &name, &ctx.client_id, &[], 0);
        let totals: serde_json::Map<String, Value> = full
            .changes
            .iter()
            .map(|(k, c)| (k.as_str().to_string(), json!(c.total_new)))
            .collect();
        ToolResult::json(
            &format!("Test '{}' finished with {} errors", test_id, errors),
            &json!({
                "test_id": test_id,
                "errors": errors,
                "passed": errors == 0,
                "new_records": totals,
                "started_at": full.checkpoint_created_at,
            }),
        )
    }

    fn noise_filter(ctx: &ToolContext, params: &Value) -> Result<ToolResult> {
        let noise = &ctx.state.noise;
        let action = str_param(params, "noise_action").unwrap_or("list");
        match action {
            "add" => {
                let pattern = str_param(params, "pattern").ok_or_else(|| Error::MissingParam("pattern".into()))?;
                let rule = noise.add(pattern, str_param(params, "reason").map(String::from));
                Ok(ToolResult::json(&format!("Added noise rule {}", rule.id), &json!({"rule": rule})))
            }
            "remove" => {
                let id = str_param(params, "rule_id").ok_or_else(|| Error::MissingParam("rule_id".into()))?;
                if !noise.remove(id) {
                    return Err(Error::NotFound(format!("noise rule {}", id)));
                }
                Ok(ToolResult::json(&format!("Removed noise rule {}", id), &json!({"removed": id})))
            }
            "reset" => {
                noise.reset();
                let rules = noise.list();
                Ok(ToolResult::json("Noise rules reset", &json!({"count": rules.len(), "rules": rules})))
            }
            "list" => {
                let rules = noise.list();
                Ok(ToolResult::json(
                    &format!("{} noise rules", rules.len()),
                    &json!({"count": rules.len(), "rules": rules}),
                ))
            }
            other => Err(Error::Validation(format!(
                "Unknown noise_action '{}'. Valid values: add, remove, list, reset",
                other
            ))),
        }
    }
}

#[async_trait]
impl Tool for ConfigureTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "configure",
            description: "Configure the session: health, clear buffers, telemetry mode, named checkpoints, test boundaries, and log noise rules.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": CONFIGURE.schema_enum(), "description": "Configuration action"},
                    "buffer": {"type": "string", "description": "(clear) Buffer to clear, or all"},
                    "mode": {"type": "string", "enum": ["off", "auto", "full"], "description": "(telemetry) New telemetry mode"},
                    "name": {"type": "string", "description": "(checkpoint) Checkpoint name"},
                    "test_id": {"type": "string", "description": "(test_boundary_start, test_boundary_end) Test identifier"},
                    "noise_action": {"type": "string", "enum": ["add", "remove", "list", "reset"], "description": "(noise_filter) Operation"},
                    "pattern": {"type": "string", "description": "(noise_filter add) Substring to hide"},
                    "reason": {"type": "string", "description": "(noise_filter add) Why it is noise"},
                    "rule_id": {"type": "string", "description": "(noise_filter remove) Rule to remove"},
                    "telemetry_mode": {"type": "string", "enum": ["off", "auto", "full"], "description": "Override passive telemetry for this call"}
                },
                "required": ["action"],
                "x-capabilities": CONFIGURE.capabilities()
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        CONFIGURE.resolve(params).map(|_| ())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolResult> {
        let mode = CONFIGURE.resolve(&params)?;
        match mode.name {
            "health" => Ok(ToolResult::json("Daemon health", &health_report(ctx.capture()))),
            "clear" => Self::clear(&ctx, &params),
            "telemetry" => Self::telemetry(&ctx, &params),
            "checkpoint" => {
                let name = str_param(&params, "name").ok_or_else(|| Error::MissingParam("name".into()))?;
                Ok(Self::checkpoint(&ctx, name))
            }
            "test_boundary_start" => {
                let test_id = str_param(&params, "test_id").ok_or_else(|| Error::MissingParam("test_id".into()))?;
                let capture = ctx.capture();
                capture
                    .checkpoints
                    .create(&capture.store, &format!("{}{}", BOUNDARY_PREFIX, test_id), &ctx.client_id);
                Ok(ToolResult::json(
                    &format!("Test '{}' started", test_id),
                    &json!({"test_id": test_id, "started": true}),
                ))
            }
            "test_boundary_end" => {
                let test_id = str_param(&params, "test_id").ok_or_else(|| Error::MissingParam("test_id".into()))?;
                Ok(Self::boundary_end(&ctx, test_id))
            }
            "noise_filter" => Self::noise_filter(&ctx, &params),
            other => Err(Error::Validation(format!("Unhandled configure action '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn test_clear_one_buffer() {
        let state = test_support::state();
        state.capture.ingest(BufferKind::Logs, vec![json!({"level": "info"}); 3]);
        state.capture.ingest(BufferKind::Actions, vec![json!({"type": "click"})]);
        let ctx = test_support::ctx(&state, "");
        let result = ConfigureTool.execute(ctx.clone(), json!({"action": "clear", "buffer": "logs"})).await.unwrap();
        assert_eq!(test_support::payload(&result)["cleared"], 3);
        let err = ConfigureTool.execute(ctx, json!({"action": "clear", "buffer": "bogus"})).await.unwrap_err();
        assert_eq!(err.code(), "invalid_param");
    }

    #[tokio::test]
    async fn test_telemetry_mode_switch() {
        let state = test_support::state();
        let ctx = test_support::ctx(&state, "");
        ConfigureTool.execute(ctx, json!({"action": "telemetry", "mode": "full"})).await.unwrap();
        assert_eq!(state.telemetry.mode(), TelemetryMode::Full);
    }

    #[tokio::test]
    async fn test_boundaries_count_errors() {
        let state = test_support::state();
        let ctx = test_support::ctx(&state, "aaaaaaaaaaaa");
        ConfigureTool
            .execute(ctx.clone(), json!({"action": "test_boundary_start", "test_id": "login"}))
            .await
            .unwrap();
        state.capture.ingest(
            BufferKind::Logs,
            vec![json!({"level": "error", "message": "E"}), json!({"level": "info", "message": "I"})],
        );
        let result = ConfigureTool
            .execute(ctx.clone(), json!({"action": "test_boundary_end", "test_id": "login"}))
            .await
            .unwrap();
        let body = test_support::payload(&result);
        assert_eq!(body["errors"], 1);
        assert_eq!(body["passed"], false);
        assert_eq!(body["new_records"]["logs"], 2);

        let missing = ConfigureTool
            .execute(ctx, json!({"action": "test_boundary_end", "test_id": "nope"}))
            .await
            .unwrap();
        assert!(missing.is_error);
    }

    #[tokio::test]
    async fn test_noise_rules_round_trip() {
        let state = test_support::state();
        let ctx = test_support::ctx(&state, "");
        let added = ConfigureTool
            .execute(ctx.clone(), json!({"action": "noise_filter", "noise_action": "add", "pattern": "ResizeObserver"}))
            .await
            .unwrap();
        let id = test_support::payload(&added)["rule"]["id"].as_str().unwrap().to_string();
        assert!(state.noise.is_noise(&json!({"message": "ResizeObserver loop limit exceeded"})));
        ConfigureTool
            .execute(ctx, json!({"action": "noise_filter", "noise_action": "remove", "rule_id": id}))
            .await
            .unwrap();
        assert!(!state.noise.is_noise(&json!({"message": "ResizeObserver loop limit exceeded"})));
    }
}
