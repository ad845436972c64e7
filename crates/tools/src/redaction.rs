//! Secret and PII scrubbing applied to every outbound tool result.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

struct Builtin {
    name: &'static str,
    pattern: &'static str,
    validate: Option<fn(&str) -> bool>,
}

const BUILTINS: &[Builtin] = &[
    Builtin { name: "aws-key", pattern: r"AKIA[0-9A-Z]{16}", validate: None },
    Builtin { name: "bearer-token", pattern: r"Bearer [A-Za-z0-9\-._~+/]+=*", validate: None },
    Builtin { name: "basic-auth", pattern: r"Basic [A-Za-z0-9+/]+=*", validate: None },
    Builtin {
        name: "jwt",
        pattern: r"eyJ[A-Za-z0-9_-]*\.eyJ[A-Za-z0-9_-]*\.[A-Za-z0-9_-]+",
        validate: None,
    },
    Builtin {
        name: "github-pat",
        pattern: r"(ghp_[A-Za-z0-9]{36,}|github_pat_[A-Za-z0-9_]{36,})",
        validate: None,
    },
    Builtin {
        name: "private-key",
        pattern: r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
        validate: None,
    },
    Builtin {
        name: "credit-card",
        pattern: r"\b([0-9]{4}[- ]?[0-9]{4}[- ]?[0-9]{4}[- ]?[0-9]{4})\b",
        validate: Some(luhn_valid),
    },
    Builtin { name: "ssn", pattern: r"\b[0-9]{3}-[0-9]{2}-[0-9]{4}\b", validate: None },
    Builtin {
        name: "api-key",
        pattern: r#"(?i)(api[_-]?key|apikey|secret[_-]?key)\s*[:=]\s*[^\s",}]+"#,
        validate: None,
    },
    Builtin {
        name: "session-cookie",
        pattern: r"(?i)(session|sid|token)\s*=\s*[A-Za-z0-9+/=_-]{16,}",
        validate: None,
    },
    Builtin {
        name: "email",
        pattern: r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
        validate: None,
    },
    Builtin { name: "hex-token", pattern: r"\b[0-9a-fA-F]{32,}\b", validate: None },
];

#[derive(Debug, Deserialize)]
struct RedactionFile {
    #[serde(default)]
    patterns: Vec<CustomPattern>,
}

#[derive(Debug, Deserialize)]
struct CustomPattern {
    name: String,
    pattern: String,
    #[serde(default)]
    replacement: Option<String>,
}

#[derive(Clone)]
struct Compiled {
    name: String,
    regex: Regex,
    replacement: String,
    validate: Option<fn(&str) -> bool>,
}

#[derive(Clone)]
pub struct RedactionEngine {
    patterns: Vec<Compiled>,
}

impl RedactionEngine {
    pub fn builtin() -> Self {
        let patterns = BUILTINS
            .iter()
            .filter_map(|b| {
                Regex::new(b.pattern).ok().map(|regex| Compiled {
                    name: b.name.to_string(),
                    regex,
                    replacement: format!("[REDACTED:{}]", b.name),
                    validate: b.validate,
                })
            })
            .collect();
        Self { patterns }
    }

    /// Built-ins plus the patterns in `path`, if it exists and parses.
    pub fn load(path: &Path) -> Self {
        let mut engine = Self::builtin();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return engine,
        };
        match serde_json::from_str::<RedactionFile>(&content) {
            Ok(file) => engine.extend(file.patterns),
            Err(e) => warn!(path = %path.display(), error = %e, "Ignoring invalid redaction config"),
        }
        engine
    }

    fn extend(&mut self, custom: Vec<CustomPattern>) {
        for p in custom {
            match Regex::new(&p.pattern) {
                Ok(regex) => {
                    debug!(name = %p.name, "Loaded redaction pattern");
                    let replacement = p
                        .replacement
                        .unwrap_or_else(|| format!("[REDACTED:{}]", p.name));
                    self.patterns.push(Compiled {
                        name: p.name,
                        regex,
                        replacement,
                        validate: None,
                    });
                }
                Err(e) => warn!(name = %p.name, error = %e, "Skipping invalid redaction pattern"),
            }
        }
    }

    pub fn pattern_names(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn redact(&self, input: &str) -> String {
        let mut out = input.to_string();
        for p in &self.patterns {
            if !p.regex.is_match(&out) {
                continue;
            }
            out = match p.validate {
                Some(check) => p
                    .regex
                    .replace_all(&out, |caps: &regex::Captures| {
                        let m = &caps[0];
                        if check(m) {
                            p.replacement.clone()
                        } else {
                            m.to_string()
                        }
                    })
                    .into_owned(),
                None => p.regex.replace_all(&out, p.replacement.as_str()).into_owned(),
            };
        }
        out
    }

    /// Redact a text block. A trailing JSON document is redacted leaf by leaf
    /// so it still parses afterwards.
    pub fn redact_text(&self, text: &str) -> String {
        for (start, _) in text.match_indices(['{', '[']) {
            if start > 0 && !text[..start].ends_with('\n') {
                continue;
            }
            let Ok(mut value) = serde_json::from_str::<Value>(&text[start..]) else {
                continue;
            };
            self.redact_value(&mut value);
            return format!("{}{}", self.redact(&text[..start]), value);
        }
        self.redact(text)
    }

    /// Redact every string leaf in place.
    pub fn redact_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => {
                let redacted = self.redact(s);
                if redacted != *s {
                    *s = redacted;
                }
            }
            Value::Array(items) => items.iter_mut().for_each(|v| self.redact_value(v)),
            Value::Object(map) => map.values_mut().for_each(|v| self.redact_value(v)),
            _ => {}
        }
    }
}

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
