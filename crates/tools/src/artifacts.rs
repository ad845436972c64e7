//! Artifact generators behind `generate`: reproduction scripts, test skeletons,
//! HAR documents and PR summaries built from captured state.

use chrono::{DateTime, TimeZone, Utc};
use gasoline_core::Result;
use serde_json::{json, Value};

/// Captured state handed to a generator, newest record first in each list.
#[derive(Debug, Clone, Default)]
pub struct ArtifactInput {
    pub actions: Vec<Value>,
    pub network: Vec<Value>,
    pub errors: Vec<Value>,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub format: &'static str,
    pub summary: String,
    pub content: Value,
}

pub trait ArtifactGenerator: Send + Sync {
    fn name(&self) -> &'static str;
    fn generate(&self, input: &ArtifactInput) -> Result<Artifact>;
}

pub fn generator_for(name: &str) -> Option<Box<dyn ArtifactGenerator>> {
    match name {
        "reproduction" => Some(Box::new(ReproductionScript)),
        "test" => Some(Box::new(TestSkeleton)),
        "har" => Some(Box::new(HarExport)),
        "pr_summary" => Some(Box::new(PrSummary)),
        _ => None,
    }
}

/// Record time from `ts` (RFC3339) or `timestamp` (unix ms or RFC3339).
pub fn record_time(record: &Value) -> Option<DateTime<Utc>> {
    let parse_str = |s: &str| DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc));
    if let Some(ts) = record.get("ts").and_then(Value::as_str) {
        return parse_str(ts);
    }
    match record.get("timestamp")? {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => parse_str(s),
        _ => None,
    }
}

fn selector_of(action: &Value) -> Option<String> {
    if let Some(s) = action.get("selector").and_then(Value::as_str) {
        return Some(s.to_string());
    }
    let selectors = action.get("selectors")?;
    for key in ["testId", "id", "ariaLabel", "css"] {
        match (key, selectors.get(key).and_then(Value::as_str)) {
            ("testId", Some(v)) => return Some(format!("[data-testid=\"{}\"]", v)),
            ("id", Some(v)) => return Some(format!("#{}", v)),
            ("ariaLabel", Some(v)) => return Some(format!("[aria-label=\"{}\"]", v)),
            (_, Some(v)) => return Some(v.to_string()),
            _ => {}
        }
    }
    None
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Playwright statements for the recorded actions, oldest first.
fn playwright_steps(actions: &[Value]) -> Vec<String> {
    let mut steps = Vec::new();
    for action in actions.iter().rev() {
        let kind = action.get("type").and_then(Value::as_str).unwrap_or("");
        let selector = selector_of(action);
        let step = match (kind, selector) {
            ("click", Some(sel)) => format!("await page.click({});", js_string(&sel)),
            ("input", Some(sel)) | ("type", Some(sel)) => {
                let value = action.get("value").and_then(Value::as_str).unwrap_or("");
                format!("await page.fill({}, {});", js_string(&sel), js_string(value))
            }
            ("select", Some(sel)) => {
                let value = action.get("selectedValue").and_then(Value::as_str).unwrap_or("");
                format!("await page.selectOption({}, {});", js_string(&sel), js_string(value))
            }
            ("keypress", _) => {
                let key = action.get("key").and_then(Value::as_str).unwrap_or("Enter");
                format!("await page.keyboard.press({});", js_string(key))
            }
            ("navigate", _) => {
                let url = action
                    .get("toUrl")
                    .or_else(|| action.get("url"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                format!("await page.goto({});", js_string(url))
            }
            ("scroll", _) => {
                let y = action.get("scrollY").and_then(Value::as_i64).unwrap_or(0);
                format!("await page.evaluate(() => window.scrollTo(0, {}));", y)
            }
            (other, _) => format!("// unsupported action: {}", other),
        };
        steps.push(step);
    }
    steps
}

fn start_url(input: &ArtifactInput) -> Option<String> {
    if let Some(url) = input.params.get("base_url").and_then(Value::as_str) {
        return Some(url.to_string());
    }
    input
        .actions
        .last()
        .and_then(|a| a.get("url").and_then(Value::as_str))
        .map(String::from)
}

pub struct ReproductionScript;

impl ArtifactGenerator for ReproductionScript {
    fn name(&self) -> &'static str {
        "reproduction"
    }

    fn generate(&self, input: &ArtifactInput) -> Result<Artifact> {
        let mut lines = vec![
            "const { chromium } = require('playwright');".to_string(),
            String::new(),
            "(async () => {".to_string(),
            "  const browser = await chromium.launch({ headless: false });".to_string(),
            "  const page = await browser.newPage();".to_string(),
        ];
        if let Some(url) = start_url(input) {
            lines.push(format!("  await page.goto({});", js_string(&url)));
        }
        let steps = playwright_steps(&input.actions);
        lines.extend(steps.iter().map(|s| format!("  {}", s)));
        lines.push("  await browser.close();".to_string());
        lines.push("})();".to_string());
        Ok(Artifact {
            format: "javascript",
            summary: format!("Reproduction script with {} steps", steps.len()),
            content: Value::String(lines.join("\n")),
        })
    }
}

pub struct TestSkeleton;

impl ArtifactGenerator for TestSkeleton {
    fn name(&self) -> &'static str {
        "test"
    }

    fn generate(&self, input: &ArtifactInput) -> Result<Artifact> {
        let test_name = input
            .params
            .get("test_name")
            .and_then(Value::as_str)
            .unwrap_or("recorded user flow");
        let mut lines = vec![
            "import { test, expect } from '@playwright/test';".to_string(),
            String::new(),
            format!("test({}, async ({{ page }}) => {{", js_string(test_name)),
            "  const errors = [];".to_string(),
            "  page.on('pageerror', (err) => errors.push(err.message));".to_string(),
        ];
        if let Some(url) = start_url(input) {
            lines.push(format!("  await page.goto({});", js_string(&url)));
        }
        let steps = playwright_steps(&input.actions);
        lines.extend(steps.iter().map(|s| format!("  {}", s)));
        for req in input.network.iter().rev() {
            let status = req.get("status").and_then(Value::as_u64).unwrap_or(0);
            if status >= 400 {
                let url = req.get("url").and_then(Value::as_str).unwrap_or("");
                lines.push(format!("  // observed {} from {}", status, url));
            }
        }
        lines.push("  expect(errors).toEqual([]);".to_string());
        lines.push("});".to_string());
        Ok(Artifact {
            format: "typescript",
            summary: format!("Playwright test with {} steps", steps.len()),
            content: Value::String(lines.join("\n")),
        })
    }
}

pub struct HarExport;

impl HarExport {
    fn entry(record: &Value) -> Value {
        let url = record.get("url").and_then(Value::as_str).unwrap_or("");
        let method = record.get("method").and_then(Value::as_str).unwrap_or("GET");
        let status = record.get("status").and_then(Value::as_u64).unwrap_or(0);
        let duration = record.get("duration").and_then(Value::as_f64).unwrap_or(0.0);
        let mime = record
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream");
        let started = record_time(record).unwrap_or_else(Utc::now);
        let query: Vec<Value> = url::Url::parse(url)
            .map(|u| {
                u.query_pairs()
                    .map(|(k, v)| json!({"name": k, "value": v}))
                    .collect()
            })
            .unwrap_or_default();
        let response_body = record.get("response_body").and_then(Value::as_str).unwrap_or("");
        let mut request = json!({
            "method": method,
            "url": url,
            "httpVersion": "HTTP/1.1",
            "headers": [],
            "queryString": query,
            "cookies": [],
            "headersSize": -1,
            "bodySize": record.get("request_body").and_then(Value::as_str).map(|b| b.len() as i64).unwrap_or(0),
        });
        if let Some(body) = record.get("request_body").and_then(Value::as_str) {
            request["postData"] = json!({"mimeType": "application/json", "text": body});
        }
        json!({
            "startedDateTime": started.to_rfc3339(),
            "time": duration,
            "request": request,
            "response": {
                "status": status,
                "statusText": "",
                "httpVersion": "HTTP/1.1",
                "headers": [],
                "cookies": [],
                "content": {"size": response_body.len(), "mimeType": mime, "text": response_body},
                "redirectURL": "",
                "headersSize": -1,
                "bodySize": response_body.len(),
            },
            "cache": {},
            "timings": {"send": 0, "wait": duration, "receive": 0},
        })
    }
}

impl ArtifactGenerator for HarExport {
    fn name(&self) -> &'static str {
        "har"
    }

    fn generate(&self, input: &ArtifactInput) -> Result<Artifact> {
        let entries: Vec<Value> = input.network.iter().rev().map(Self::entry).collect();
        Ok(Artifact {
            format: "har",
            summary: format!("HAR 1.2 with {} entries", entries.len()),
            content: json!({
                "log": {
                    "version": "1.2",
                    "creator": {"name": gasoline_core::SERVICE_NAME, "version": env!("CARGO_PKG_VERSION")},
                    "entries": entries,
                }
            }),
        })
    }
}

pub struct PrSummary;

impl ArtifactGenerator for PrSummary {
    fn name(&self) -> &'static str {
        "pr_summary"
    }

    fn generate(&self, input: &ArtifactInput) -> Result<Artifact> {
        let failed: Vec<&Value> = input
            .network
            .iter()
            .filter(|r| r.get("status").and_then(Value::as_u64).is_some_and(|s| s >= 400))
            .collect();
        let mut md = String::from("## Browser session summary\n\n");
        md.push_str(&format!(
            "- Console errors: {}\n- Failed requests: {}\n- User actions: {}\n",
            input.errors.len(),
            failed.len(),
            input.actions.len()
        ));
        if !input.errors.is_empty() {
            md.push_str("\n### Errors\n\n");
            for err in input.errors.iter().take(10) {
                let msg = err.get("message").and_then(Value::as_str).unwrap_or("(no message)");
                md.push_str(&format!("- `{}`\n", msg.lines().next().unwrap_or("")));
            }
        }
        if !failed.is_empty() {
            md.push_str("\n### Failed requests\n\n| Method | URL | Status |\n|---|---|---|\n");
            for req in failed.iter().take(10) {
                md.push_str(&format!(
                    "| {} | {} | {} |\n",
                    req.get("method").and_then(Value::as_str).unwrap_or("GET"),
                    req.get("url").and_then(Value::as_str).unwrap_or(""),
                    req.get("status").and_then(Value::as_u64).unwrap_or(0)
                ));
            }
        }
        if input.errors.is_empty() && failed.is_empty() {
            md.push_str("\nNo errors or failed requests captured.\n");
        }
        Ok(Artifact {
            format: "markdown",
            summary: format!("PR summary: {} errors, {} failed requests", input.errors.len(), failed.len()),
            content: Value::String(md),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> ArtifactInput {
        ArtifactInput {
            // newest first
            actions: vec![
                json!({"type": "click", "selectors": {"testId": "submit"}, "url": "http://localhost:3000/login"}),
                json!({"type": "input", "selector": "#email", "value": "a@b.c", "url": "http://localhost:3000/login"}),
            ],
            network: vec![
                json!({"url": "http://localhost:3000/api/login?next=%2F", "method": "POST", "status": 500,
                       "duration": 42, "request_body": "{\"email\":\"a@b.c\"}", "response_body": "oops"}),
            ],
            errors: vec![json!({"level": "error", "message": "Uncaught TypeError: x is undefined\n    at app.js:1"})],
            params: json!({}),
        }
    }

    #[test]
    fn test_reproduction_orders_steps_oldest_first() {
        let artifact = ReproductionScript.generate(&sample_input()).unwrap();
        let script = artifact.content.as_str().unwrap();
        let fill = script.find("page.fill(\"#email\"").unwrap();
        let click = script.find("page.click(\"[data-testid=\\\"submit\\\"]\")").unwrap();
        assert!(fill < click);
        assert!(script.contains("page.goto(\"http://localhost:3000/login\")"));
    }

    #[test]
    fn test_har_document() {
        let artifact = HarExport.generate(&sample_input()).unwrap();
        let log = &artifact.content["log"];
        assert_eq!(log["version"], "1.2");
        let entry = &log["entries"][0];
        assert_eq!(entry["request"]["method"], "POST");
        assert_eq!(entry["response"]["status"], 500);
        assert_eq!(entry["request"]["queryString"][0]["name"], "next");
        assert_eq!(entry["request"]["queryString"][0]["value"], "/");
    }

    #[test]
    fn test_pr_summary_lists_failures() {
        let artifact = PrSummary.generate(&sample_input()).unwrap();
        let md = artifact.content.as_str().unwrap();
        assert!(md.contains("Failed requests: 1"));
        assert!(md.contains("`Uncaught TypeError: x is undefined`"));
        assert!(md.contains("| POST | http://localhost:3000/api/login?next=%2F | 500 |"));
    }

    #[test]
    fn test_test_skeleton_and_lookup() {
        let gen = generator_for("test").unwrap();
        assert_eq!(gen.name(), "test");
        let artifact = gen.generate(&sample_input()).unwrap();
        assert!(artifact.content.as_str().unwrap().contains("expect(errors).toEqual([]);"));
        assert!(generator_for("sarif").is_none());
    }

    #[test]
    fn test_record_time_formats() {
        assert!(record_time(&json!({"ts": "2024-01-01T00:00:00Z"})).is_some());
        assert_eq!(
            record_time(&json!({"timestamp": 1_700_000_000_000i64})).unwrap().timestamp(),
            1_700_000_000
        );
        assert!(record_time(&json!({})).is_none());
    }
}
