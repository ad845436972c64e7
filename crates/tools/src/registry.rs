use std::collections::HashMap;
use std::sync::Arc;
use gasoline_core::{Error, Result};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::analyze::AnalyzeTool;
use crate::configure::ConfigureTool;
use crate::generate::GenerateTool;
use crate::interact::InteractTool;
use crate::observe::ObserveTool;
use crate::{Tool, ToolContext, ToolResult};

/// Arguments every tool accepts in addition to its own schema.
const COMMON_PARAMS: &[&str] = &["telemetry_mode"];

#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ObserveTool));
        registry.register(Arc::new(AnalyzeTool));
        registry.register(Arc::new(GenerateTool));
        registry.register(Arc::new(ConfigureTool));
        registry.register(Arc::new(InteractTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        debug!(name = schema.name, "Registering tool");
        self.tools.insert(schema.name.to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// MCP `tools/list` entries, sorted by name.
    pub fn list_tools(&self) -> Vec<Value> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                let schema = tool.schema();
                json!({
                    "name": schema.name,
                    "description": schema.description,
                    "inputSchema": schema.parameters
                })
            })
            .collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn execute(&self, name: &str, ctx: ToolContext, params: Value) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Unknown tool: {}", name)))?;

        if let Err(e) = tool.validate(&params) {
            warn!(tool = name, error = %e, "Tool validation failed");
            return Err(e);
        }

        debug!(tool = name, client = %ctx.client_id, "Executing tool");
        tool.execute(ctx, params).await
    }

    /// Argument names the tool's schema does not declare.
    pub fn unknown_params(&self, name: &str, params: &Value) -> Vec<String> {
        let Some(tool) = self.get(name) else {
            return Vec::new();
        };
        let schema = tool.schema();
        let declared = schema.parameters.get("properties").and_then(Value::as_object);
        let mut unknown: Vec<String> = params
            .as_object()
            .map(|args| {
                args.keys()
                    .filter(|k| !COMMON_PARAMS.contains(&k.as_str()))
                    .filter(|k| !declared.is_some_and(|d| d.contains_key(k.as_str())))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        unknown.sort();
        unknown
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
