use async_trait::async_trait;
use gasoline_capture::{BufferKind, QueryFilter};
use gasoline_core::{Error, Result};
use serde_json::{json, Value};

use crate::artifacts::{generator_for, ArtifactInput};
use crate::modes::GENERATE;
use crate::response::StructuredError;
use crate::{usize_param, Tool, ToolContext, ToolResult, ToolSchema};

pub struct GenerateTool;

fn collect_input(ctx: &ToolContext, params: &Value) -> ArtifactInput {
    let store = &ctx.capture().store;
    let all = QueryFilter {
        limit: Some(usize_param(params, "limit").unwrap_or(usize::MAX)),
        ..Default::default()
    };
    let errors = QueryFilter { level: Some("error".into()), ..all.clone() };
    let mut error_logs = store.query(BufferKind::Logs, &errors);
    ctx.state.noise.filter(&mut error_logs);
    ArtifactInput {
        actions: store.query(BufferKind::Actions, &all),
        network: store.query(BufferKind::NetworkBodies, &all),
        errors: error_logs,
        params: params.clone(),
    }
}

#[async_trait]
impl Tool for GenerateTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "generate",
            description: "Generate artifacts from the captured session: a Playwright reproduction script, a test skeleton, a HAR 1.2 export, or a markdown PR summary.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "what": {"type": "string", "enum": GENERATE.schema_enum(), "description": "Artifact to generate"},
                    "base_url": {"type": "string", "description": "(reproduction, test) Starting URL"},
                    "test_name": {"type": "string", "description": "(test) Name of the generated test"},
                    "limit": {"type": "integer", "description": "Maximum records per buffer to include"},
                    "telemetry_mode": {"type": "string", "enum": ["off", "auto", "full"], "description": "Override passive telemetry for this call"}
                },
                "required": ["what"],
                "x-capabilities": GENERATE.capabilities()
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        GENERATE.resolve(params).map(|_| ())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolResult> {
        let mode = GENERATE.resolve(&params)?;
        let generator = generator_for(mode.name)
            .ok_or_else(|| Error::Validation(format!("No generator for '{}'", mode.name)))?;
        let input = collect_input(&ctx, &params);
        if input.actions.is_empty() && input.network.is_empty() && input.errors.is_empty() {
            return Ok(ToolResult::error(
                StructuredError::new("no_data", "Nothing has been captured yet")
                    .with_hint("Use the page with the extension connected, then generate again"),
            ));
        }
        let artifact = generator.generate(&input)?;
        let mut result = match &artifact.content {
            Value::String(text) => ToolResult::text(format!("{}\n\n{}", artifact.summary, text)),
            other => ToolResult::json(&artifact.summary, other),
        };
        result.set_metadata("artifact_format", json!(artifact.format));
        result.set_metadata("generator", json!(generator.name()));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn test_generate_without_data() {
        let state = test_support::state();
        let ctx = test_support::ctx(&state, "");
        let result = GenerateTool.execute(ctx, json!({"what": "har"})).await.unwrap();
        assert!(result.is_error);
        assert_eq!(test_support::payload(&result)["error"], "no_data");
    }

    #[tokio::test]
    async fn test_generate_har_from_capture() {
        let state = test_support::state();
        state.capture.ingest(
            BufferKind::NetworkBodies,
            vec![json!({"url": "http://localhost/api", "method": "GET", "status": 200})],
        );
        let ctx = test_support::ctx(&state, "");
        let result = GenerateTool.execute(ctx, json!({"what": "har"})).await.unwrap();
        assert!(!result.is_error);
        assert_eq!(result.metadata["artifact_format"], "har");
        let body = test_support::payload(&result);
        assert_eq!(body["log"]["entries"][0]["request"]["url"], "http://localhost/api");
    }

    #[tokio::test]
    async fn test_generate_pr_summary_is_markdown() {
        let state = test_support::state();
        state.capture.ingest(BufferKind::Logs, vec![json!({"level": "error", "message": "boom"})]);
        let ctx = test_support::ctx(&state, "");
        let result = GenerateTool.execute(ctx, json!({"what": "pr_summary"})).await.unwrap();
        assert!(result.content[0].text.contains("## Browser session summary"));
    }

    #[test]
    fn test_generate_validate() {
        assert!(GenerateTool.validate(&json!({"what": "sarif"})).is_err());
        assert!(GenerateTool.validate(&json!({"what": "reproduction"})).is_ok());
    }
}
