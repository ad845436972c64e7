//! Broken-link checking for `analyze what=link_validation`.

use futures::stream::{self, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

pub const MAX_URLS: usize = 50;
pub const CONCURRENCY: usize = 5;
pub const LINK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LinkStatus {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Keep the first `MAX_URLS` distinct http(s) URLs; the rest are reported as skipped.
pub fn partition_urls(urls: &[String]) -> (Vec<String>, Vec<String>) {
    let mut accepted: Vec<String> = Vec::new();
    let mut skipped = Vec::new();
    for raw in urls {
        let valid = url::Url::parse(raw)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false);
        if !valid || accepted.len() >= MAX_URLS {
            skipped.push(raw.clone());
        } else if !accepted.contains(raw) {
            accepted.push(raw.clone());
        }
    }
    (accepted, skipped)
}

async fn check_one(client: &Client, url: String) -> LinkStatus {
    let head = client.head(&url).timeout(LINK_TIMEOUT).send().await;
    let response = match head {
        Ok(resp) if resp.status() != StatusCode::METHOD_NOT_ALLOWED && resp.status() != StatusCode::NOT_IMPLEMENTED => {
            Ok(resp)
        }
        _ => client.get(&url).timeout(LINK_TIMEOUT).send().await,
    };
    match response {
        Ok(resp) => {
            let status = resp.status();
            LinkStatus {
                url,
                status: Some(status.as_u16()),
                ok: status.is_success() || status.is_redirection(),
                error: None,
            }
        }
        Err(e) => {
            debug!(url = %url, error = %e, "Link check failed");
            LinkStatus {
                url,
                status: None,
                ok: false,
                error: Some(if e.is_timeout() { "timeout".to_string() } else { e.to_string() }),
            }
        }
    }
}

/// Check `urls` with at most `CONCURRENCY` requests in flight. Output keeps input order.
pub async fn check_links(client: &Client, urls: Vec<String>) -> Vec<LinkStatus> {
    stream::iter(urls)
        .map(|url| check_one(client, url))
        .buffered(CONCURRENCY)
        .collect()
        .await
}
