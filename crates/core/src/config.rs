use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

use crate::error::{Error, Result};
use crate::paths::Paths;

pub const DEFAULT_PORT: u16 = 7890;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret expected in `X-Gasoline-Key`. Empty disables the check.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_shutdown_grace_secs() -> u64 {
    3
}

impl ServerConfig {
    /// Socket address to listen on. Only loopback hosts are accepted; the
    /// daemon serves captured page data and must never be reachable off-box.
    pub fn bind_addr(&self, port: u16) -> Result<SocketAddr> {
        let ip = match self.host.trim() {
            "" | "127.0.0.1" | "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
            "::1" | "[::1]" => IpAddr::V6(Ipv6Addr::LOCALHOST),
            other => {
                return Err(Error::Config(format!(
                    "server.host must be a loopback address (127.0.0.1, ::1 or localhost), got '{}'",
                    other
                )))
            }
        };
        Ok(SocketAddr::new(ip, port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: String::new(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    #[serde(default = "default_max_logs")]
    pub max_logs: usize,
    #[serde(default = "default_max_network_bodies")]
    pub max_network_bodies: usize,
    #[serde(default = "default_max_ws_events")]
    pub max_ws_events: usize,
    #[serde(default = "default_max_actions")]
    pub max_actions: usize,
    #[serde(default = "default_max_http_debug")]
    pub max_http_debug: usize,
    #[serde(default = "default_soft_limit")]
    pub memory_soft_limit: u64,
    #[serde(default = "default_hard_limit")]
    pub memory_hard_limit: u64,
    #[serde(default = "default_close_limit")]
    pub memory_close_limit: u64,
    #[serde(default = "default_critical_limit")]
    pub memory_critical_limit: u64,
    #[serde(default = "default_network_body_limit")]
    pub network_body_memory_limit: u64,
    #[serde(default = "default_rate_threshold")]
    pub rate_threshold: u64,
    #[serde(default = "default_max_request_body")]
    pub max_request_body: usize,
    #[serde(default = "default_max_response_body")]
    pub max_response_body: usize,
}

fn default_max_logs() -> usize {
    1000
}

fn default_max_network_bodies() -> usize {
    100
}

fn default_max_ws_events() -> usize {
    500
}

fn default_max_actions() -> usize {
    2000
}

fn default_max_http_debug() -> usize {
    200
}

fn default_soft_limit() -> u64 {
    20 * MIB
}

fn default_hard_limit() -> u64 {
    50 * MIB
}

fn default_close_limit() -> u64 {
    30 * MIB
}

fn default_critical_limit() -> u64 {
    100 * MIB
}

fn default_network_body_limit() -> u64 {
    8 * MIB
}

fn default_rate_threshold() -> u64 {
    1000
}

fn default_max_request_body() -> usize {
    8 * 1024
}

fn default_max_response_body() -> usize {
    16 * 1024
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_logs: default_max_logs(),
            max_network_bodies: default_max_network_bodies(),
            max_ws_events: default_max_ws_events(),
            max_actions: default_max_actions(),
            max_http_debug: default_max_http_debug(),
            memory_soft_limit: default_soft_limit(),
            memory_hard_limit: default_hard_limit(),
            memory_close_limit: default_close_limit(),
            memory_critical_limit: default_critical_limit(),
            network_body_memory_limit: default_network_body_limit(),
            rate_threshold: default_rate_threshold(),
            max_request_body: default_max_request_body(),
            max_response_body: default_max_response_body(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandsConfig {
    /// Lifetime of a queued browser command before it times out.
    #[serde(default = "default_command_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sync_wait_secs")]
    pub sync_wait_secs: u64,
    #[serde(default = "default_sync_grace_secs")]
    pub sync_grace_secs: u64,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

fn default_command_ttl_secs() -> u64 {
    30
}

fn default_sync_wait_secs() -> u64 {
    15
}

fn default_sync_grace_secs() -> u64 {
    5
}

fn default_query_timeout_secs() -> u64 {
    10
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_command_ttl_secs(),
            sync_wait_secs: default_sync_wait_secs(),
            sync_grace_secs: default_sync_grace_secs(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
    #[serde(default = "default_calls_per_minute")]
    pub calls_per_minute: usize,
    /// off | auto | full
    #[serde(default = "default_telemetry_mode")]
    pub telemetry_mode: String,
    #[serde(default)]
    pub redaction_config: Option<String>,
}

fn default_calls_per_minute() -> usize {
    500
}

fn default_telemetry_mode() -> String {
    "auto".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            calls_per_minute: default_calls_per_minute(),
            telemetry_mode: default_telemetry_mode(),
            redaction_config: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            Self::default()
        };
        if let Ok(key) = std::env::var("GASOLINE_API_KEY") {
            if !key.trim().is_empty() {
                config.server.api_key = key.trim().to_string();
            }
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn api_key(&self) -> Option<&str> {
        let key = self.server.api_key.trim();
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 7890);
        assert_eq!(cfg.capture.max_logs, 1000);
        assert_eq!(cfg.capture.max_network_bodies, 100);
        assert_eq!(cfg.capture.max_ws_events, 500);
        assert_eq!(cfg.capture.max_actions, 2000);
        assert_eq!(cfg.capture.max_http_debug, 200);
        assert_eq!(cfg.capture.memory_hard_limit, 50 * MIB);
        assert_eq!(cfg.commands.ttl_secs, 30);
        assert_eq!(cfg.tools.calls_per_minute, 500);
        assert!(cfg.api_key().is_none());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let raw = r#"{ "server": { "port": 9000, "apiKey": " s3cret " } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.api_key(), Some("s3cret"));
        assert_eq!(cfg.capture.rate_threshold, 1000);
        assert_eq!(cfg.tools.telemetry_mode, "auto");
    }

    #[test]
    fn test_bind_addr_is_loopback_only() {
        let mut server = ServerConfig::default();
        assert_eq!(server.bind_addr(7890).unwrap().to_string(), "127.0.0.1:7890");
        server.host = "localhost".into();
        assert!(server.bind_addr(7890).unwrap().ip().is_loopback());
        server.host = "::1".into();
        assert_eq!(server.bind_addr(7891).unwrap().to_string(), "[::1]:7891");

        for host in ["0.0.0.0", "::", "192.168.1.10", "example.com"] {
            server.host = host.into();
            let err = server.bind_addr(7890).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{} should be rejected", host);
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("gasoline-config-{}", std::process::id()));
        let path = dir.join("config.json");
        let mut cfg = Config::default();
        cfg.server.port = 7999;
        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.port, 7999);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
