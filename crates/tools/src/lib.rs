pub mod analyze;
pub mod artifacts;
pub mod async_cmd;
pub mod configure;
pub mod generate;
pub mod interact;
pub mod links;
pub mod mcp;
pub mod modes;
pub mod noise;
pub mod observe;
pub mod rate_limit;
pub mod redaction;
pub mod registry;
pub mod response;
pub mod telemetry;

use async_trait::async_trait;
use gasoline_capture::Capture;
use gasoline_core::{Config, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub use registry::ToolRegistry;
pub use response::{StructuredError, ToolResult};

use noise::NoiseFilter;
use redaction::RedactionEngine;
use telemetry::Telemetry;

/// Daemon-wide state shared by every tool call.
pub struct ToolState {
    pub capture: Arc<Capture>,
    pub config: Config,
    pub noise: NoiseFilter,
    pub telemetry: Telemetry,
    pub redaction: RedactionEngine,
    pub http: reqwest::Client,
}

impl ToolState {
    pub fn new(capture: Arc<Capture>, config: Config, redaction: RedactionEngine) -> Self {
        let telemetry = Telemetry::new(telemetry::TelemetryMode::parse(&config.tools.telemetry_mode));
        let http = reqwest::Client::builder()
            .timeout(links::LINK_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_default();
        Self {
            capture,
            config,
            noise: NoiseFilter::new(),
            telemetry,
            redaction,
            http,
        }
    }

    pub fn sync_wait(&self) -> Duration {
        Duration::from_secs(self.config.commands.sync_wait_secs)
    }

    pub fn sync_grace(&self) -> Duration {
        Duration::from_secs(self.config.commands.sync_grace_secs)
    }
}

/// Per-request context. The client ID travels with the call, never on shared state.
#[derive(Clone)]
pub struct ToolContext {
    pub client_id: String,
    pub state: Arc<ToolState>,
}

impl ToolContext {
    pub fn new(state: Arc<ToolState>, client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            state,
        }
    }

    pub fn capture(&self) -> &Capture {
        &self.state.capture
    }
}

pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    fn validate(&self, params: &Value) -> Result<()>;
    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<ToolResult>;
}

/// String parameter, if present and non-empty.
pub(crate) fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

pub(crate) fn usize_param(params: &Value, key: &str) -> Option<usize> {
    params.get(key).and_then(Value::as_u64).map(|n| n as usize)
}

pub(crate) fn bool_param(params: &Value, key: &str) -> Option<bool> {
    params.get(key).and_then(Value::as_bool)
}
