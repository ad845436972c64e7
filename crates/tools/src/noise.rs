//! Substring rules that hide well-known console noise from `observe`.

use serde::Serialize;
use serde_json::Value;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NoiseRule {
    pub id: String,
    pub pattern: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub builtin: bool,
}

impl NoiseRule {
    /// Case-insensitive match against a record's message, source and URL.
    fn matches(&self, record: &Value) -> bool {
        let needle = self.pattern.to_lowercase();
        ["message", "source", "url", "filename"].iter().any(|field| {
            record
                .get(*field)
                .and_then(Value::as_str)
                .is_some_and(|s| s.to_lowercase().contains(&needle))
        })
    }
}

const BUILTIN_RULES: &[(&str, &str, &str)] = &[
    ("builtin_chrome_extension", "chrome-extension://", "browser extension output"),
    ("builtin_moz_extension", "moz-extension://", "browser extension output"),
    ("builtin_favicon", "favicon.ico", "missing favicon"),
    ("builtin_passive_listener", "non-passive event listener", "browser performance advice"),
    ("builtin_react_devtools", "download the react devtools", "framework banner"),
    ("builtin_vite_hmr", "[vite] connected", "dev server banner"),
    ("builtin_webpack_hmr", "[hmr]", "dev server hot reload"),
];

struct Inner {
    rules: Vec<NoiseRule>,
    next_id: u64,
}

fn builtin_rules() -> Vec<NoiseRule> {
    BUILTIN_RULES
        .iter()
        .map(|(id, pattern, reason)| NoiseRule {
            id: id.to_string(),
            pattern: pattern.to_string(),
            reason: Some(reason.to_string()),
            builtin: true,
        })
        .collect()
}

pub struct NoiseFilter {
    inner: RwLock<Inner>,
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseFilter {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                rules: builtin_rules(),
                next_id: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, pattern: &str, reason: Option<String>) -> NoiseRule {
        let mut inner = self.write();
        inner.next_id += 1;
        let rule = NoiseRule {
            id: format!("user_{}", inner.next_id),
            pattern: pattern.to_string(),
            reason,
            builtin: false,
        };
        inner.rules.push(rule.clone());
        rule
    }

    /// Remove a user rule. Built-in rules stay until `reset`.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.write();
        let before = inner.rules.len();
        inner.rules.retain(|r| r.builtin || r.id != id);
        inner.rules.len() != before
    }

    pub fn list(&self) -> Vec<NoiseRule> {
        self.read().rules.clone()
    }

    /// Drop every user rule and restore the built-ins.
    pub fn reset(&self) {
        let mut inner = self.write();
        inner.rules = builtin_rules();
    }

    pub fn is_noise(&self, record: &Value) -> bool {
        self.read().rules.iter().any(|r| r.matches(record))
    }

    /// Keep only the records no rule matches. Returns the number filtered out.
    pub fn filter(&self, records: &mut Vec<Value>) -> usize {
        let inner = self.read();
        let before = records.len();
        records.retain(|r| !inner.rules.iter().any(|rule| rule.matches(r)));
        before - records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_rules_hide_extension_noise() {
        let filter = NoiseFilter::new();
        assert!(filter.is_noise(&json!({"message": "x", "source": "chrome-extension://abc/content.js"})));
        assert!(filter.is_noise(&json!({"message": "Download the React DevTools for a better experience"})));
        assert!(!filter.is_noise(&json!({"message": "TypeError: x is undefined"})));
    }

    #[test]
    fn test_add_remove_reset() {
        let filter = NoiseFilter::new();
        let builtin_count = filter.list().len();
        let rule = filter.add("analytics blocked", Some("adblock".into()));
        assert!(filter.is_noise(&json!({"message": "Analytics BLOCKED by client"})));
        assert!(filter.remove(&rule.id));
        assert!(!filter.remove("builtin_favicon"));
        filter.add("foo", None);
        filter.reset();
        assert_eq!(filter.list().len(), builtin_count);
    }

    #[test]
    fn test_filter_counts_removed() {
        let filter = NoiseFilter::new();
        let mut records = vec![
            json!({"message": "[HMR] Waiting for update signal"}),
            json!({"message": "real error"}),
        ];
        assert_eq!(filter.filter(&mut records), 1);
        assert_eq!(records.len(), 1);
    }
}
