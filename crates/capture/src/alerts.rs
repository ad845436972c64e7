//! Alert buffer drained into `observe` responses, plus the error-spike
//! detector and CI webhook results that feed it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub const ALERT_BUFFER_CAP: usize = 50;
pub const CI_RESULTS_CAP: usize = 10;
const CORRELATION_WINDOW_SECS: i64 = 5;
const ANOMALY_WINDOW_SECS: i64 = 60;
const ANOMALY_BUCKET_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub severity: Severity,
    pub category: String,
    pub title: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub count: u32,
}

impl Alert {
    pub fn new(severity: Severity, category: &str, title: &str, detail: &str, source: &str) -> Self {
        Self {
            severity,
            category: category.to_string(),
            title: title.to_string(),
            detail: detail.to_string(),
            timestamp: Utc::now(),
            source: source.to_string(),
            count: 1,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CiFailure {
    pub name: String,
    #[serde(default)]
    pub message: String,
}

/// Body of `POST /ci-result`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CiResult {
    pub status: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub failures: Vec<CiFailure>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

pub fn build_ci_alert(ci: &CiResult) -> Alert {
    let severity = match ci.status.as_str() {
        "failure" | "error" => Severity::Error,
        _ => Severity::Info,
    };
    let mut detail = ci.summary.clone();
    if !ci.failures.is_empty() {
        let names: Vec<&str> = ci.failures.iter().map(|f| f.name.as_str()).collect();
        detail.push_str(&format!(" | Failed: {}", names.join(", ")));
    }
    if !ci.commit.is_empty() {
        detail.push_str(&format!(" [{}]", ci.commit));
    }
    Alert::new(
        severity,
        "ci",
        &format!("CI {} ({})", ci.status, ci.source),
        &detail,
        "ci_webhook",
    )
    .at(ci.received_at)
}

#[derive(Default)]
struct Inner {
    alerts: VecDeque<Alert>,
    error_times: VecDeque<DateTime<Utc>>,
    last_anomaly_at: Option<DateTime<Utc>>,
    ci_results: VecDeque<CiResult>,
    total_added: u64,
}

impl Inner {
    fn push(&mut self, alert: Alert) {
        self.total_added += 1;
        self.alerts.push_back(alert);
        while self.alerts.len() > ALERT_BUFFER_CAP {
            self.alerts.pop_front();
        }
    }
}

#[derive(Default)]
pub struct AlertBuffer {
    inner: Mutex<Inner>,
}

impl AlertBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, alert: Alert) {
        self.lock().push(alert);
    }

    pub fn len(&self) -> usize {
        self.lock().alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Alerts ever raised; never decreases.
    pub fn total_added(&self) -> u64 {
        self.lock().total_added
    }

    /// Take every buffered alert, deduplicated, correlated and sorted.
    pub fn drain_for_observe(&self) -> Vec<Alert> {
        let raw: Vec<Alert> = {
            let mut inner = self.lock();
            inner.alerts.drain(..).collect()
        };
        if raw.is_empty() {
            return raw;
        }
        let mut processed = correlate(deduplicate(raw));
        sort_by_priority(&mut processed);
        processed
    }

    /// Track one error log; may emit an anomaly alert when errors spike.
    pub fn record_error(&self, at: DateTime<Utc>) -> Option<Alert> {
        let mut inner = self.lock();
        inner.error_times.push_back(at);
        let cutoff = at - Duration::seconds(ANOMALY_WINDOW_SECS);
        while inner.error_times.front().is_some_and(|t| *t <= cutoff) {
            inner.error_times.pop_front();
        }
        if inner.error_times.len() < 2 {
            return None;
        }

        let recent_cutoff = at - Duration::seconds(ANOMALY_BUCKET_SECS);
        let recent = inner.error_times.iter().filter(|t| **t > recent_cutoff).count();
        let baseline =
            inner.error_times.len() as f64 / (ANOMALY_WINDOW_SECS / ANOMALY_BUCKET_SECS) as f64;
        if baseline <= 0.0 || (recent as f64) <= 3.0 * baseline {
            return None;
        }
        if inner
            .last_anomaly_at
            .is_some_and(|last| at - last < Duration::seconds(ANOMALY_BUCKET_SECS))
        {
            return None;
        }

        let alert = Alert::new(
            Severity::Warning,
            "anomaly",
            "Error frequency spike detected",
            &format!(
                "{} errors in last {}s vs {:.1} rolling average",
                recent, ANOMALY_BUCKET_SECS, baseline
            ),
            "anomaly_detector",
        )
        .at(at);
        inner.last_anomaly_at = Some(at);
        inner.push(alert.clone());
        debug!(recent, baseline, "Error spike alert raised");
        Some(alert)
    }

    /// Store a CI result. Returns the new alert, or `None` when `(commit, status)`
    /// was already recorded and only updated.
    pub fn process_ci_result(&self, ci: CiResult) -> Option<Alert> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .ci_results
            .iter_mut()
            .find(|r| r.commit == ci.commit && r.status == ci.status)
        {
            *existing = ci;
            return None;
        }
        let alert = build_ci_alert(&ci);
        inner.ci_results.push_back(ci);
        while inner.ci_results.len() > CI_RESULTS_CAP {
            inner.ci_results.pop_front();
        }
        inner.push(alert.clone());
        Some(alert)
    }

    /// Most recent CI results, newest first.
    pub fn ci_results(&self) -> Vec<CiResult> {
        self.lock().ci_results.iter().rev().cloned().collect()
    }
}

fn normalize_detail(detail: &str) -> String {
    detail.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Collapse alerts with the same (category, title, detail), summing their counts.
pub fn deduplicate(alerts: Vec<Alert>) -> Vec<Alert> {
    let mut seen: HashMap<(String, String, String), usize> = HashMap::new();
    let mut out: Vec<Alert> = Vec::new();
    for alert in alerts {
        let key = (
            alert.category.clone(),
            alert.title.clone(),
            normalize_detail(&alert.detail),
        );
        let count = alert.count.max(1);
        match seen.get(&key) {
            Some(&idx) => {
                let existing = &mut out[idx];
                existing.count += count;
                if alert.timestamp > existing.timestamp {
                    existing.timestamp = alert.timestamp;
                }
            }
            None => {
                seen.insert(key, out.len());
                out.push(Alert { count, ..alert });
            }
        }
    }
    out
}

fn correlates(a: &Alert, b: &Alert) -> bool {
    let pair = (a.category.as_str(), b.category.as_str());
    let kinds_match = matches!(
        pair,
        ("regression", "anomaly") | ("anomaly", "regression") | ("regression", "ci") | ("ci", "regression")
    );
    kinds_match && (a.timestamp - b.timestamp).num_seconds().abs() <= CORRELATION_WINDOW_SECS
}

fn merge(a: &Alert, b: &Alert) -> Alert {
    let regression = if a.category == "regression" { a } else { b };
    Alert {
        severity: a.severity.max(b.severity),
        category: "regression".to_string(),
        title: format!("Correlated: {} + {}", a.title, b.title),
        detail: format!("{} | {}", a.detail, b.detail),
        timestamp: a.timestamp.max(b.timestamp),
        source: regression.source.clone(),
        count: regression.count,
    }
}

/// Pair regressions with anomaly or CI alerts raised within five seconds of them.
pub fn correlate(alerts: Vec<Alert>) -> Vec<Alert> {
    if alerts.len() < 2 {
        return alerts;
    }
    let mut used = vec![false; alerts.len()];
    let mut out = Vec::with_capacity(alerts.len());
    for i in 0..alerts.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        let partner = (i + 1..alerts.len()).find(|&j| !used[j] && correlates(&alerts[i], &alerts[j]));
        match partner {
            Some(j) => {
                used[j] = true;
                out.push(merge(&alerts[i], &alerts[j]));
            }
            None => out.push(alerts[i].clone()),
        }
    }
    out
}

/// Severity descending, then newest first.
pub fn sort_by_priority(alerts: &mut [Alert]) {
    alerts.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.timestamp.cmp(&a.timestamp))
    });
}

/// Render the text block appended to `observe` results.
pub fn format_alerts_block(alerts: &[Alert]) -> String {
    let mut block = format!("--- ALERTS ({}) ---\n", alerts.len());
    if alerts.len() > 3 {
        let mut by_category: BTreeMap<&str, usize> = BTreeMap::new();
        for a in alerts {
            *by_category.entry(a.category.as_str()).or_default() += 1;
        }
        let parts: Vec<String> = by_category
            .iter()
            .map(|(cat, n)| format!("{} {}", n, cat))
            .collect();
        block.push_str(&format!("{} alerts: {}\n", alerts.len(), parts.join(", ")));
    }
    block.push_str(&serde_json::to_string(alerts).unwrap_or_else(|_| "[]".to_string()));
    block
}
