use async_trait::async_trait;
use gasoline_capture::store::DEFAULT_QUERY_LIMIT;
use gasoline_capture::{BufferKind, Capture, QueryFilter};
use gasoline_core::{Error, Result};
use serde_json::{json, Map, Value};

use crate::async_cmd::render_command;
use crate::modes::OBSERVE;
use crate::{str_param, usize_param, Tool, ToolContext, ToolResult, ToolSchema};

/// Default record count for `observe what=changes`.
const CHANGES_RECORD_LIMIT: usize = 20;

/// Buffer, memory, circuit and connection state in one object.
pub fn health_report(capture: &Capture) -> Value {
    let mut report = serde_json::to_value(capture.store.health()).unwrap_or_else(|_| json!({}));
    let buffers: Map<String, Value> = capture
        .store
        .stats()
        .into_iter()
        .map(|(kind, stats)| (kind.as_str().to_string(), json!(stats)))
        .collect();
    if let Value::Object(map) = &mut report {
        map.insert("minimal_mode".into(), json!(capture.store.minimal_mode()));
        map.insert("buffers".into(), Value::Object(buffers));
        map.insert("clients".into(), json!(capture.clients.count()));
        map.insert("extension_connected".into(), json!(capture.extension.is_connected()));
        map.insert("pending_queries".into(), json!(capture.queries.pending_count()));
        map.insert("tracked_commands".into(), json!(capture.commands.count()));
        map.insert("buffered_alerts".into(), json!(capture.alerts.len()));
        map.insert("uptime_secs".into(), json!(capture.uptime_secs()));
    }
    report
}

fn filter_from(params: &Value) -> QueryFilter {
    QueryFilter {
        limit: usize_param(params, "limit"),
        url: str_param(params, "url").map(String::from),
        method: str_param(params, "method").map(String::from),
        status_min: params.get("status_min").and_then(Value::as_u64),
        status_max: params.get("status_max").and_then(Value::as_u64),
        level: str_param(params, "level").map(String::from),
        since: None,
        until: None,
    }
}

fn entries_result(label: &str, entries: Vec<Value>, extra: Value) -> ToolResult {
    let mut body = json!({"count": entries.len(), "entries": entries});
    if let (Value::Object(body_map), Value::Object(extra_map)) = (&mut body, extra) {
        body_map.extend(extra_map);
    }
    let count = body["count"].as_u64().unwrap_or(0);
    if count == 0 {
        ToolResult::json(&format!("No {} captured", label), &body)
    } else {
        ToolResult::json(&format!("{} {} (newest first)", count, label), &body)
    }
}

pub struct ObserveTool;

impl ObserveTool {
    fn logs(ctx: &ToolContext, params: &Value, errors_only: bool) -> ToolResult {
        let mut filter = filter_from(params);
        if errors_only {
            filter.level = Some("error".to_string());
        }
        // Scan the whole buffer so noise does not eat into the caller's limit.
        let limit = filter.limit.take().unwrap_or(DEFAULT_QUERY_LIMIT).max(1);
        filter.limit = Some(usize::MAX);
        let mut entries = ctx.capture().store.query(BufferKind::Logs, &filter);
        let hidden = ctx.state.noise.filter(&mut entries);
        entries.truncate(limit);
        let label = if errors_only { "errors" } else { "log entries" };
        entries_result(label, entries, json!({"noise_filtered": hidden}))
    }

    fn buffer(ctx: &ToolContext, params: &Value, kind: BufferKind, label: &str) -> ToolResult {
        let entries = ctx.capture().store.query(kind, &filter_from(params));
        entries_result(label, entries, json!({}))
    }

    fn changes(ctx: &ToolContext, params: &Value) -> Result<ToolResult> {
        let name = str_param(params, "checkpoint").filter(|n| !n.is_empty());
        let kinds: Vec<BufferKind> = match params.get("kinds").and_then(Value::as_array) {
            Some(list) => {
                let mut kinds = Vec::new();
                for item in list {
                    let raw = item.as_str().unwrap_or("");
                    let kind = BufferKind::parse(raw)
                        .ok_or_else(|| Error::Validation(format!("Unknown buffer kind '{}'", raw)))?;
                    kinds.push(kind);
                }
                kinds
            }
            None => Vec::new(),
        };
        let limit = usize_param(params, "limit").unwrap_or(CHANGES_RECORD_LIMIT);
        let capture = ctx.capture();
        let (diff, summary) = match name {
            Some(name) => (
                capture
                    .checkpoints
                    .changes_since(&capture.store, name, &ctx.client_id, &kinds, limit),
                format!("checkpoint '{}'", name),
            ),
            None => (
                capture
                    .checkpoints
                    .changes_since_last_call(&capture.store, &ctx.client_id, &kinds, limit),
                "your previous call".to_string(),
            ),
        };
        let total = diff.total_new();
        let mut body = json!(diff);
        body["total_new"] = json!(total);
        Ok(ToolResult::json(&format!("{} new records since {}", total, summary), &body))
    }

    fn command_result(ctx: &ToolContext, params: &Value) -> Result<ToolResult> {
        let corr = str_param(params, "correlation_id").ok_or_else(|| Error::MissingParam("correlation_id".into()))?;
        let capture = ctx.capture();
        let record = capture.commands.get(corr, &ctx.client_id)?;
        Ok(render_command(&record, &capture.extension.diagnostic_hint()))
    }
}

#[async_trait]
impl Tool for ObserveTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "observe",
            description: "Read captured browser state: console errors and logs, network bodies, WebSocket events, user actions, changes since a checkpoint, browser command results, connected clients and daemon health. Alerts raised since the last observe are appended.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "what": {"type": "string", "enum": OBSERVE.schema_enum(), "description": "What to observe"},
                    "limit": {"type": "integer", "description": "Maximum entries to return (default 20)"},
                    "level": {"type": "string", "description": "(logs) Only entries at this level, e.g. warn or error"},
                    "url": {"type": "string", "description": "(network_bodies, actions) Substring the URL must contain"},
                    "method": {"type": "string", "description": "(network_bodies) HTTP method"},
                    "status_min": {"type": "integer", "description": "(network_bodies) Minimum status code"},
                    "status_max": {"type": "integer", "description": "(network_bodies) Maximum status code"},
                    "checkpoint": {"type": "string", "description": "(changes) Checkpoint name or RFC3339 timestamp; omit to diff since your previous call"},
                    "kinds": {"type": "array", "items": {"type": "string"}, "description": "(changes) Buffer kinds to diff"},
                    "correlation_id": {"type": "string", "description": "(command_result) Correlation ID from interact"},
                    "telemetry_mode": {"type": "string", "enum": ["off", "auto", "full"], "description": "Override passive telemetry for this call"}
                },
                "required": ["what"],
                "x-capabilities": OBSERVE.capabilities()
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        OBSERVE.resolve(params).map(|_| ())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolResult> {
        let mode = OBSERVE.resolve(&params)?;
        let capture = ctx.capture();
        let result = match mode.name {
            "errors" => Self::logs(&ctx, &params, true),
            "logs" => Self::logs(&ctx, &params, false),
            "network_bodies" => Self::buffer(&ctx, &params, BufferKind::NetworkBodies, "network bodies"),
            "websocket_events" => Self::buffer(&ctx, &params, BufferKind::WebsocketEvents, "WebSocket events"),
            "actions" => Self::buffer(&ctx, &params, BufferKind::Actions, "actions"),
            "http_debug" => Self::buffer(&ctx, &params, BufferKind::HttpDebug, "HTTP debug entries"),
            "changes" => Self::changes(&ctx, &params)?,
            "command_result" => Self::command_result(&ctx, &params)?,
            "pending_commands" => {
                let pending = capture.commands.pending(&ctx.client_id);
                entries_result("pending commands", pending.iter().map(|c| json!(c)).collect(), json!({}))
            }
            "failed_commands" => {
                let failed = capture.commands.failed(&ctx.client_id);
                entries_result("failed commands", failed.iter().map(|c| json!(c)).collect(), json!({}))
            }
            "clients" => {
                let clients = capture.clients.list();
                ToolResult::json(
                    &format!("{} clients", clients.len()),
                    &json!({"count": clients.len(), "clients": clients, "you": ctx.client_id}),
                )
            }
            "pilot" => {
                let status = capture.extension.status();
                let pilot = match status.settings.pilot_enabled {
                    Some(true) => "enabled",
                    Some(false) => "disabled",
                    None => "unknown",
                };
                ToolResult::json(
                    &format!("AI Web Pilot {}", pilot),
                    &json!({"pilot": pilot, "extension": status}),
                )
            }
            "health" => ToolResult::json("Daemon health", &health_report(capture)),
            "annotations" => {
                let sessions = capture.extension.draw_sessions();
                entries_result("annotation sessions", sessions.iter().map(|s| json!(s)).collect(), json!({}))
            }
            other => return Err(Error::Validation(format!("Unhandled observe mode '{}'", other))),
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use gasoline_capture::derive_client_id;

    #[test]
    fn test_observe_schema() {
        let schema = ObserveTool.schema();
        assert_eq!(schema.name, "observe");
        assert!(schema.parameters["properties"]["what"]["enum"]
            .as_array()
            .unwrap()
            .contains(&json!("command_result")));
    }

    #[test]
    fn test_observe_validate() {
        assert!(ObserveTool.validate(&json!({"what": "errors"})).is_ok());
        assert!(ObserveTool.validate(&json!({"what": "changes"})).is_ok());
        assert!(ObserveTool.validate(&json!({"what": "command_result"})).is_err());
        assert!(ObserveTool.validate(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_errors_skip_noise() {
        let state = test_support::state();
        state.capture.ingest(
            BufferKind::Logs,
            vec![
                json!({"level": "error", "message": "TypeError: boom"}),
                json!({"level": "error", "message": "x", "source": "chrome-extension://abc/bg.js"}),
                json!({"level": "info", "message": "hello"}),
            ],
        );
        let ctx = test_support::ctx(&state, "");
        let result = ObserveTool.execute(ctx, json!({"what": "errors"})).await.unwrap();
        let body = test_support::payload(&result);
        assert_eq!(body["count"], 1);
        assert_eq!(body["noise_filtered"], 1);
        assert_eq!(body["entries"][0]["message"], "TypeError: boom");
    }

    #[tokio::test]
    async fn test_changes_are_isolated_per_client() {
        let state = test_support::state();
        let a = derive_client_id("/home/alice/project");
        let b = derive_client_id("/home/bob/project");
        state.capture.clients.register("/home/alice/project");
        state.capture.clients.register("/home/bob/project");
        for id in [&a, &b] {
            state.capture.checkpoints.create(&state.capture.store, "start", id);
        }
        state.capture.ingest(
            BufferKind::Logs,
            vec![json!({"level": "error", "message": "E1"}), json!({"level": "error", "message": "E2"})],
        );

        let changes = |id: String| {
            let ctx = test_support::ctx(&state, &id);
            async move {
                let r = ObserveTool.execute(ctx, json!({"what": "changes", "checkpoint": "start"})).await.unwrap();
                test_support::payload(&r)
            }
        };
        let body_a = changes(a.clone()).await;
        let body_b = changes(b.clone()).await;
        assert_eq!(body_a["total_new"], 2);
        assert_eq!(body_b["total_new"], 2);
        assert_eq!(body_a["from"], "start");
        assert!(state.capture.checkpoints.exists("start", &b));

        state.capture.clients.unregister(&a);
        assert_eq!(changes(b).await["total_new"], 2);
    }

    #[tokio::test]
    async fn test_changes_without_checkpoint_advance() {
        let state = test_support::state();
        let id = derive_client_id("/home/carol/app");
        state.capture.ingest(BufferKind::Logs, vec![json!({"level": "error", "message": "E1"})]);

        let run = || {
            let ctx = test_support::ctx(&state, &id);
            async move { test_support::payload(&ObserveTool.execute(ctx, json!({"what": "changes"})).await.unwrap()) }
        };
        let first = run().await;
        assert_eq!(first["total_new"], 1);
        assert_eq!(first["from"], "previous-call");
        assert_eq!(run().await["total_new"], 0);

        state.capture.ingest(BufferKind::Actions, vec![json!({"type": "click"})]);
        let third = run().await;
        assert_eq!(third["total_new"], 1);
        assert_eq!(third["changes"]["actions"]["total_new"], 1);
    }

    #[tokio::test]
    async fn test_changes_since_timestamp() {
        let state = test_support::state();
        state.capture.ingest(BufferKind::Logs, vec![json!({"level": "info", "message": "old"})]);
        let cut = chrono::Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        state.capture.ingest(BufferKind::Logs, vec![json!({"level": "info", "message": "new"})]);

        let ctx = test_support::ctx(&state, "");
        let result = ObserveTool
            .execute(ctx, json!({"what": "changes", "checkpoint": cut.to_rfc3339(), "kinds": ["logs"]}))
            .await
            .unwrap();
        let body = test_support::payload(&result);
        assert_eq!(body["total_new"], 1);
        assert_eq!(body["changes"]["logs"]["records"][0]["message"], "new");
    }

    #[tokio::test]
    async fn test_limit_applies_after_noise_filter() {
        let state = test_support::state();
        let mut records = vec![json!({"level": "error", "message": "real"}); 2];
        records.extend(vec![json!({"level": "error", "message": "x", "source": "chrome-extension://abc/bg.js"}); 3]);
        state.capture.ingest(BufferKind::Logs, records);

        let ctx = test_support::ctx(&state, "");
        let result = ObserveTool.execute(ctx, json!({"what": "errors", "limit": 2})).await.unwrap();
        let body = test_support::payload(&result);
        assert_eq!(body["count"], 2);
        assert_eq!(body["noise_filtered"], 3);
        assert!(body["entries"].as_array().unwrap().iter().all(|e| e["message"] == "real"));
    }

    #[tokio::test]
    async fn test_command_result_other_client_denied() {
        let state = test_support::state();
        let rec = state.capture.queue_command("click", "dom_action", json!({"selector": "#b"}), "aaaaaaaaaaaa");
        let ctx = test_support::ctx(&state, "bbbbbbbbbbbb");
        let err = ObserveTool
            .execute(ctx, json!({"what": "command_result", "correlation_id": rec.correlation_id}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "permission_denied");
    }

    #[tokio::test]
    async fn test_health_mode() {
        let state = test_support::state();
        let ctx = test_support::ctx(&state, "");
        let result = ObserveTool.execute(ctx, json!({"what": "health"})).await.unwrap();
        let body = test_support::payload(&result);
        assert_eq!(body["circuit_open"], false);
        assert_eq!(body["buffers"]["logs"]["capacity"], 1000);
        assert_eq!(body["extension_connected"], false);
    }
}
