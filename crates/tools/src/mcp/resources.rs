//! Static documentation served through `resources/list` and `resources/read`.

use serde_json::{json, Value};

use crate::modes;

pub const GUIDE_URI: &str = "gasoline://guide";
pub const CAPABILITIES_URI: &str = "gasoline://capabilities";
pub const QUICKSTART_URI: &str = "gasoline://quickstart";

/// Sent once per session in the `initialize` result.
pub const INSTRUCTIONS: &str = "Gasoline provides real-time browser telemetry via 5 tools.

Workflow:
- observe: read passive buffers (errors, logs, network bodies, websocket events, actions) and command results
- analyze: query the live DOM, audit accessibility, validate links, summarize APIs, build a timeline
- generate: Playwright reproduction, test skeleton, HAR export, PR summary
- configure: health, clear buffers, telemetry, checkpoints, test boundaries, noise rules
- interact: click, type, navigate, execute JS, set storage (requires AI Web Pilot)

Key patterns:
- Diffs: configure(action=\"checkpoint\", name=\"start\") then observe(what=\"changes\", checkpoint=\"start\").
- Async commands: interact(..., background=true) returns a correlation_id; poll observe(what=\"command_result\").
- Noise: configure(action=\"noise_filter\", noise_action=\"add\", pattern=...) hides recurring console noise.
- For routing help, read gasoline://capabilities. For detailed docs, read gasoline://guide. For quick examples, read gasoline://quickstart.";

const GUIDE: &str = "# Gasoline Guide

Gasoline is a local daemon that receives telemetry from a browser extension and
exposes it to coding agents over MCP.

## Reading captured data
- `observe what=errors` returns error-level console records, newest first.
- `observe what=logs level=warn` filters by level; `limit` caps the result.
- `observe what=network_bodies url=/api status_min=400` finds failed requests.
- `observe what=changes checkpoint=<name|RFC3339 time>` reports what accumulated since a checkpoint; without `checkpoint` it reports what arrived since your previous call.
  Checkpoints are private to the client that created them.

## Driving the browser
Interact commands run synchronously for up to 20 seconds. Long operations can be
backgrounded with `background=true`; the acknowledgement carries a `correlation_id`
to pass to `observe what=command_result`. Timeouts report `extension_timeout` with a
hint describing pilot and tab-tracking status.

## Alerts
Every `observe` call drains pending alerts (regressions, error spikes, CI results)
into a trailing `--- ALERTS (N) ---` block.

## Errors
Failed calls return `isError: true` and a JSON object with `error`, `message`,
`retry` and, when relevant, `param` and `hint`.
";

const QUICKSTART: &str = r##"# Gasoline MCP Quickstart

## 1. Health Check
{"tool":"configure","arguments":{"action":"health"}}

## 2. Collect Errors
{"tool":"observe","arguments":{"what":"errors"}}

## 3. Network Failures
{"tool":"observe","arguments":{"what":"network_bodies","status_min":400}}

## 4. Checkpoint and Diff
{"tool":"configure","arguments":{"action":"checkpoint","name":"before"}}
{"tool":"observe","arguments":{"what":"changes","checkpoint":"before"}}

## 5. DOM Query
{"tool":"analyze","arguments":{"what":"dom","selector":".error-message"}}

## 6. Click in the Background
{"tool":"interact","arguments":{"what":"click","selector":"#submit","background":true}}
{"tool":"observe","arguments":{"what":"command_result","correlation_id":"..."}}

## 7. Reproduction Script
{"tool":"generate","arguments":{"what":"reproduction"}}
"##;

fn capability_index() -> String {
    let mut out = String::from("# Gasoline Capabilities\n");
    for tool in modes::ALL.iter() {
        out.push_str(&format!("\n## {} ({})\n", tool.tool, tool.discriminator));
        for mode in tool.modes {
            if mode.required.is_empty() {
                out.push_str(&format!("- `{}`: {}\n", mode.name, mode.summary));
            } else {
                out.push_str(&format!(
                    "- `{}` (requires {}): {}\n",
                    mode.name,
                    mode.required.join(", "),
                    mode.summary
                ));
            }
        }
    }
    out
}

pub fn list() -> Value {
    json!([
        {"uri": CAPABILITIES_URI, "name": "capabilities", "description": "Tool modes and their required parameters", "mimeType": "text/markdown"},
        {"uri": GUIDE_URI, "name": "guide", "description": "How to use Gasoline's tools", "mimeType": "text/markdown"},
        {"uri": QUICKSTART_URI, "name": "quickstart", "description": "Copyable example calls", "mimeType": "text/markdown"}
    ])
}

/// Markdown for a resource URI, if it exists.
pub fn read(uri: &str) -> Option<String> {
    match uri {
        CAPABILITIES_URI => Some(capability_index()),
        GUIDE_URI => Some(GUIDE.to_string()),
        QUICKSTART_URI => Some(QUICKSTART.to_string()),
        _ => None,
    }
}
