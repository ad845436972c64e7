use async_trait::async_trait;
use gasoline_capture::{BufferKind, QueryFilter};
use gasoline_core::{Error, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::artifacts::record_time;
use crate::links::{check_links, partition_urls};
use crate::modes::ANALYZE;
use crate::response::StructuredError;
use crate::{str_param, usize_param, Tool, ToolContext, ToolResult, ToolSchema};

const TIMELINE_DEFAULT_LIMIT: usize = 50;

pub struct AnalyzeTool;

/// `METHOD /path` with the query string dropped.
fn endpoint_key(record: &Value) -> String {
    let method = record.get("method").and_then(Value::as_str).unwrap_or("GET").to_uppercase();
    let raw = record.get("url").and_then(Value::as_str).unwrap_or("");
    let path = url::Url::parse(raw)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| raw.split('?').next().unwrap_or("").to_string());
    format!("{} {}", method, path)
}

#[derive(Default)]
struct EndpointStats {
    count: u64,
    statuses: BTreeMap<String, u64>,
    total_duration: f64,
    timed: u64,
}

/// Group network bodies by endpoint with counts, status histogram and mean duration.
pub fn summarize_api(records: &[Value]) -> Value {
    let mut groups: BTreeMap<String, EndpointStats> = BTreeMap::new();
    for record in records {
        let stats = groups.entry(endpoint_key(record)).or_default();
        stats.count += 1;
        let status = record
            .get("status")
            .and_then(Value::as_u64)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        *stats.statuses.entry(status).or_default() += 1;
        if let Some(d) = record.get("duration").and_then(Value::as_f64) {
            stats.total_duration += d;
            stats.timed += 1;
        }
    }
    let mut endpoints: Vec<Value> = groups
        .into_iter()
        .map(|(endpoint, s)| {
            let mean = if s.timed > 0 {
                Some((s.total_duration / s.timed as f64 * 10.0).round() / 10.0)
            } else {
                None
            };
            json!({
                "endpoint": endpoint,
                "count": s.count,
                "statuses": s.statuses,
                "mean_duration_ms": mean,
            })
        })
        .collect();
    endpoints.sort_by(|a, b| b["count"].as_u64().cmp(&a["count"].as_u64()));
    json!({"endpoint_count": endpoints.len(), "endpoints": endpoints})
}

/// Merge actions, error logs and network bodies by time, newest first.
pub fn build_timeline(actions: &[Value], errors: &[Value], network: &[Value], limit: usize) -> Vec<Value> {
    let mut events: Vec<(Option<chrono::DateTime<chrono::Utc>>, Value)> = Vec::new();
    for a in actions {
        events.push((record_time(a), json!({"kind": "action", "event": a})));
    }
    for e in errors {
        events.push((record_time(e), json!({"kind": "error", "event": e})));
    }
    for n in network {
        events.push((record_time(n), json!({"kind": "network", "event": n})));
    }
    // Records without a timestamp sink to the end.
    events.sort_by(|a, b| b.0.cmp(&a.0));
    events.into_iter().take(limit).map(|(_, v)| v).collect()
}

impl AnalyzeTool {
    /// Ask the extension a synchronous question and wait for the answer.
    async fn page_query(ctx: &ToolContext, query_type: &str, params: Value) -> Result<ToolResult> {
        let capture = ctx.capture();
        if !capture.extension.is_connected() {
            return Ok(ToolResult::error(
                StructuredError::new("extension_disconnected", "The browser extension is not connected")
                    .with_hint(capture.extension.diagnostic_hint()),
            ));
        }
        let timeout = capture.query_timeout();
        let id = capture.queries.create(query_type, params, None, timeout, &ctx.client_id);
        debug!(query_id = %id, query_type, "Waiting for extension query");
        match capture.queries.wait_for_result(&id, timeout, &ctx.client_id).await {
            Ok(value) => Ok(ToolResult::json(&format!("{} result", query_type), &json!({"result": value}))),
            Err(Error::Timeout(msg)) => Ok(ToolResult::error(
                StructuredError::new("extension_timeout", msg).with_hint(capture.extension.diagnostic_hint()),
            )),
            Err(e) => Err(e),
        }
    }

    async fn link_validation(ctx: &ToolContext, params: &Value) -> Result<ToolResult> {
        let urls: Vec<String> = params
            .get("urls")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(|u| u.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let (accepted, skipped) = partition_urls(&urls);
        if accepted.is_empty() {
            return Ok(ToolResult::error(
                StructuredError::invalid_param("urls", "No valid http(s) URLs to check")
                    .with_hint("Pass absolute http:// or https:// URLs"),
            ));
        }
        let results = check_links(&ctx.state.http, accepted).await;
        let broken = results.iter().filter(|r| !r.ok).count();
        Ok(ToolResult::json(
            &format!("Checked {} links, {} broken", results.len(), broken),
            &json!({"checked": results.len(), "broken": broken, "results": results, "skipped": skipped}),
        ))
    }
}

#[async_trait]
impl Tool for AnalyzeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "analyze",
            description: "Analyze the page and captured traffic: query the live DOM, run an accessibility audit, validate links, summarize API endpoints, or build a merged timeline.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "what": {"type": "string", "enum": ANALYZE.schema_enum(), "description": "Analysis to run"},
                    "selector": {"type": "string", "description": "(dom, accessibility) CSS selector"},
                    "urls": {"type": "array", "items": {"type": "string"}, "description": "(link_validation) URLs to check, at most 50"},
                    "url": {"type": "string", "description": "(api) Substring the URL must contain"},
                    "limit": {"type": "integer", "description": "(timeline) Maximum events"},
                    "telemetry_mode": {"type": "string", "enum": ["off", "auto", "full"], "description": "Override passive telemetry for this call"}
                },
                "required": ["what"],
                "x-capabilities": ANALYZE.capabilities()
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        ANALYZE.resolve(params).map(|_| ())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolResult> {
        let mode = ANALYZE.resolve(&params)?;
        let store = &ctx.capture().store;
        match mode.name {
            "dom" => {
                let selector = str_param(&params, "selector").unwrap_or_default();
                Self::page_query(&ctx, "dom", json!({"selector": selector})).await
            }
            "accessibility" => {
                let scope = str_param(&params, "selector");
                Self::page_query(&ctx, "a11y", json!({"scope": scope})).await
            }
            "link_validation" => Self::link_validation(&ctx, &params).await,
            "api" => {
                let filter = QueryFilter {
                    url: str_param(&params, "url").map(String::from),
                    limit: Some(usize::MAX),
                    ..Default::default()
                };
                let records = store.query(BufferKind::NetworkBodies, &filter);
                let summary = summarize_api(&records);
                Ok(ToolResult::json(
                    &format!("{} endpoints from {} requests", summary["endpoint_count"], records.len()),
                    &summary,
                ))
            }
            "timeline" => {
                let limit = usize_param(&params, "limit").unwrap_or(TIMELINE_DEFAULT_LIMIT);
                let all = QueryFilter { limit: Some(usize::MAX), ..Default::default() };
                let errors = QueryFilter { level: Some("error".into()), ..all.clone() };
                let events = build_timeline(
                    &store.query(BufferKind::Actions, &all),
                    &store.query(BufferKind::Logs, &errors),
                    &store.query(BufferKind::NetworkBodies, &all),
                    limit,
                );
                Ok(ToolResult::json(
                    &format!("{} timeline events (newest first)", events.len()),
                    &json!({"count": events.len(), "events": events}),
                ))
            }
            other => Err(Error::Validation(format!("Unhandled analyze mode '{}'", other))),
        }
    }
}
