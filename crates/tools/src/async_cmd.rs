//! Browser commands: queue, optionally wait, and render the correlated result.

use gasoline_capture::commands::is_csp_failure;
use gasoline_capture::{CommandRecord, CommandStatus};
use gasoline_core::Result;
use serde_json::{json, Value};
use tracing::debug;

use crate::response::{StructuredError, ToolResult};
use crate::{bool_param, ToolContext};

pub const SUGGESTED_RETRY_MS: u64 = 2000;

/// `background=true`, `sync=false` or `wait=false` ask for a queued acknowledgement.
pub fn wants_background(params: &Value) -> bool {
    bool_param(params, "background") == Some(true)
        || bool_param(params, "sync") == Some(false)
        || bool_param(params, "wait") == Some(false)
}

pub fn queued_ack(record: &CommandRecord) -> ToolResult {
    ToolResult::json(
        &format!("Queued {} command", record.kind),
        &json!({
            "status": "queued",
            "queued": true,
            "final": false,
            "correlation_id": record.correlation_id,
            "message": "Poll observe what=command_result with this correlation_id for the outcome",
        }),
    )
}

fn still_processing(record: &CommandRecord) -> ToolResult {
    ToolResult::json(
        &format!("Command {} still processing", record.correlation_id),
        &json!({
            "status": "still_processing",
            "queued": false,
            "final": false,
            "correlation_id": record.correlation_id,
            "elapsed_ms": record.elapsed_ms(),
            "suggested_retry_ms": SUGGESTED_RETRY_MS,
        }),
    )
}

/// Render a command record the way `observe what=command_result` reports it.
///
/// `hint` is the extension diagnostic line attached to timeouts.
pub fn render_command(record: &CommandRecord, hint: &str) -> ToolResult {
    let mut body = json!({
        "correlation_id": record.correlation_id,
        "status": record.status.to_string(),
        "queued": false,
        "final": record.status.is_terminal(),
        "created_at": record.created_at.to_rfc3339(),
        "elapsed_ms": record.elapsed_ms(),
    });
    match record.status {
        CommandStatus::Complete => {
            body["result"] = record.result.clone().unwrap_or(Value::Null);
            if let Some(at) = record.completed_at {
                body["completed_at"] = json!(at.to_rfc3339());
            }
            body["timing_ms"] = json!(record.elapsed_ms());
        }
        CommandStatus::Timeout | CommandStatus::Expired => {
            let reason = record.error.as_deref().unwrap_or("extension_timeout");
            body["error"] = json!("extension_timeout");
            body["message"] = json!(format!(
                "Command {} did not complete: {}",
                record.correlation_id, reason
            ));
            body["retry"] = json!("Check that the extension is connected and AI Web Pilot is enabled, then retry");
            body["hint"] = json!(hint);
        }
        CommandStatus::Error | CommandStatus::Cancelled => {
            body["error"] = json!(record.error.clone().unwrap_or_else(|| record.status.to_string()));
            if let Some(result) = &record.result {
                body["result"] = result.clone();
            }
        }
        CommandStatus::Pending => {}
    }
    if record.status.is_failure() && is_csp_failure(record.error.as_deref(), record.result.as_ref()) {
        body["csp_blocked"] = json!(true);
        body["failure_cause"] = json!("csp");
        body["retry"] = json!("The page's Content Security Policy blocked this; retry with world:\"isolated\" or on a different page");
    }

    let summary = format!("Command {}: {}", record.correlation_id, record.status);
    if record.status.is_failure() {
        ToolResult::json_error(&summary, &body)
    } else {
        ToolResult::json(&summary, &body)
    }
}

/// Queue a command and, unless backgrounded, wait for the extension to finish it.
pub async fn run_command(
    ctx: &ToolContext,
    kind: &str,
    query_type: &str,
    payload: Value,
    background: bool,
) -> Result<ToolResult> {
    let capture = ctx.capture();
    if capture.extension.pilot_disabled() {
        return Ok(ToolResult::error(
            StructuredError::new("pilot_disabled", "AI Web Pilot is disabled in the extension")
                .with_hint(capture.extension.diagnostic_hint()),
        ));
    }

    if !background && !capture.extension.is_connected() {
        return Ok(ToolResult::error(
            StructuredError::new("extension_disconnected", "The browser extension is not connected")
                .with_hint(capture.extension.diagnostic_hint()),
        ));
    }

    let record = capture.queue_command(kind, query_type, payload, &ctx.client_id);
    debug!(correlation_id = %record.correlation_id, kind, background, "Queued browser command");
    if background {
        return Ok(queued_ack(&record));
    }

    let corr = record.correlation_id.clone();
    let mut current = capture
        .commands
        .wait(&corr, &ctx.client_id, ctx.state.sync_wait())
        .await?;
    if current.status == CommandStatus::Pending {
        current = capture
            .commands
            .wait(&corr, &ctx.client_id, ctx.state.sync_grace())
            .await?;
    }
    if current.status == CommandStatus::Pending {
        return Ok(still_processing(&current));
    }
    Ok(render_command(&current, &capture.extension.diagnostic_hint()))
}
