//! Capabilities map: each tool's discriminator, its modes and their required parameters.

use gasoline_core::{Error, Result};
use serde_json::{json, Map, Value};

#[derive(Debug)]
pub struct ModeSpec {
    pub name: &'static str,
    pub required: &'static [&'static str],
    pub summary: &'static str,
}

#[derive(Debug)]
pub struct ToolModes {
    pub tool: &'static str,
    pub discriminator: &'static str,
    pub modes: &'static [ModeSpec],
}

const fn mode(name: &'static str, required: &'static [&'static str], summary: &'static str) -> ModeSpec {
    ModeSpec { name, required, summary }
}

pub const OBSERVE: ToolModes = ToolModes {
    tool: "observe",
    discriminator: "what",
    modes: &[
        mode("errors", &[], "Console errors, newest first"),
        mode("logs", &[], "Console logs, filter by level"),
        mode("network_bodies", &[], "Captured request/response pairs, filter by url, method, status"),
        mode("websocket_events", &[], "WebSocket frames and lifecycle events"),
        mode("actions", &[], "Recorded user actions"),
        mode("http_debug", &[], "Extension HTTP debug entries"),
        mode(
            "changes",
            &[],
            "Everything captured since a checkpoint name or RFC3339 timestamp; without one, since your previous call",
        ),
        mode("command_result", &["correlation_id"], "Status or result of a browser command"),
        mode("pending_commands", &[], "Commands still waiting for the extension"),
        mode("failed_commands", &[], "Recently failed commands"),
        mode("clients", &[], "Connected agent clients"),
        mode("pilot", &[], "Extension connection and pilot status"),
        mode("health", &[], "Buffer, memory and circuit breaker status"),
        mode("annotations", &[], "Draw-mode annotation sessions"),
    ],
};

pub const ANALYZE: ToolModes = ToolModes {
    tool: "analyze",
    discriminator: "what",
    modes: &[
        mode("dom", &["selector"], "Query the live DOM"),
        mode("accessibility", &[], "Run an accessibility audit in the page"),
        mode("link_validation", &["urls"], "Check URLs for broken links"),
        mode("api", &[], "Group captured traffic by endpoint"),
        mode("timeline", &[], "Merged timeline of actions, errors and requests"),
    ],
};

pub const GENERATE: ToolModes = ToolModes {
    tool: "generate",
    discriminator: "what",
    modes: &[
        mode("reproduction", &[], "Reproduction script from recorded actions"),
        mode("test", &[], "Test skeleton from recorded actions"),
        mode("har", &[], "HAR 1.2 document from captured traffic"),
        mode("pr_summary", &[], "Markdown summary of errors and failed requests"),
    ],
};

pub const CONFIGURE: ToolModes = ToolModes {
    tool: "configure",
    discriminator: "action",
    modes: &[
        mode("health", &[], "Daemon health snapshot"),
        mode("clear", &[], "Clear one buffer or all of them"),
        mode("telemetry", &[], "Set the passive telemetry mode"),
        mode("checkpoint", &["name"], "Create a named checkpoint"),
        mode("test_boundary_start", &["test_id"], "Mark the start of a test"),
        mode("test_boundary_end", &["test_id"], "Mark the end of a test and summarize it"),
        mode("noise_filter", &[], "Manage log noise rules"),
    ],
};

pub const INTERACT: ToolModes = ToolModes {
    tool: "interact",
    discriminator: "what",
    modes: &[
        mode("click", &["selector"], "Click an element"),
        mode("type", &["selector", "text"], "Type text into an element"),
        mode("navigate", &["url"], "Navigate the tracked tab"),
        mode("refresh", &[], "Reload the tracked tab"),
        mode("back", &[], "History back"),
        mode("forward", &[], "History forward"),
        mode("execute_js", &["script"], "Run JavaScript in the page"),
        mode("set_storage", &["key"], "Set a localStorage/sessionStorage entry"),
        mode("highlight", &["selector"], "Highlight an element"),
    ],
};

pub const ALL: [&ToolModes; 5] = [&OBSERVE, &ANALYZE, &GENERATE, &CONFIGURE, &INTERACT];

impl ToolModes {
    pub fn names(&self) -> Vec<&'static str> {
        self.modes.iter().map(|m| m.name).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ModeSpec> {
        self.modes.iter().find(|m| m.name == name)
    }

    /// Resolve and check the mode named by the discriminator.
    pub fn resolve(&self, params: &Value) -> Result<&ModeSpec> {
        let name = params
            .get(self.discriminator)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::MissingParam(self.discriminator.to_string()))?;
        let spec = self.get(name).ok_or_else(|| {
            Error::Validation(format!(
                "Unknown {} '{}' for {}. Valid values: {}",
                self.discriminator,
                name,
                self.tool,
                self.names().join(", ")
            ))
        })?;
        for param in spec.required {
            let present = match params.get(*param) {
                None | Some(Value::Null) => false,
                Some(Value::String(s)) => !s.is_empty(),
                Some(Value::Array(a)) => !a.is_empty(),
                Some(_) => true,
            };
            if !present {
                return Err(Error::MissingParam((*param).to_string()));
            }
        }
        Ok(spec)
    }

    /// Enum of mode names for the JSON schema.
    pub fn schema_enum(&self) -> Value {
        json!(self.names())
    }

    pub fn capabilities(&self) -> Value {
        let modes: Map<String, Value> = self
            .modes
            .iter()
            .map(|m| {
                (
                    m.name.to_string(),
                    json!({"required": m.required, "description": m.summary}),
                )
            })
            .collect();
        json!({"discriminator": self.discriminator, "modes": modes})
    }
}

/// Capabilities for every tool, keyed by tool name.
pub fn capabilities() -> Value {
    let map: Map<String, Value> = ALL
        .iter()
        .map(|t| (t.tool.to_string(), t.capabilities()))
        .collect();
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_discriminator() {
        let err = OBSERVE.resolve(&json!({})).unwrap_err();
        assert_eq!(err.code(), "missing_param");
        assert_eq!(err.to_string(), "Missing parameter: what");
    }

    #[test]
    fn test_unknown_mode_lists_valid() {
        let err = ANALYZE.resolve(&json!({"what": "nope"})).unwrap_err();
        assert_eq!(err.code(), "invalid_param");
        assert!(err.to_string().contains("link_validation"));
    }

    #[test]
    fn test_required_params() {
        let err = ANALYZE.resolve(&json!({"what": "dom"})).unwrap_err();
        assert!(matches!(err, Error::MissingParam(ref p) if p == "selector"));
        assert!(ANALYZE.resolve(&json!({"what": "dom", "selector": "h1"})).is_ok());

        let err = INTERACT.resolve(&json!({"what": "type", "selector": "#q"})).unwrap_err();
        assert!(matches!(err, Error::MissingParam(ref p) if p == "text"));

        let err = ANALYZE.resolve(&json!({"what": "link_validation", "urls": []})).unwrap_err();
        assert!(matches!(err, Error::MissingParam(ref p) if p == "urls"));
    }

    #[test]
    fn test_configure_uses_action() {
        let spec = CONFIGURE.resolve(&json!({"action": "test_boundary_start", "test_id": "t1"})).unwrap();
        assert_eq!(spec.name, "test_boundary_start");
        assert!(CONFIGURE.resolve(&json!({"what": "health"})).is_err());
    }

    #[test]
    fn test_capabilities_map() {
        let caps = capabilities();
        assert_eq!(caps["observe"]["modes"]["command_result"]["required"][0], "correlation_id");
        assert_eq!(caps["interact"]["modes"]["set_storage"]["required"][0], "key");
        assert_eq!(caps["configure"]["discriminator"], "action");
    }
}
