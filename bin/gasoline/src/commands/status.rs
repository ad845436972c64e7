use std::time::Duration;

use gasoline_core::{Config, Paths};
use gasoline_storage::PidFile;
use serde_json::Value;

pub async fn run(paths: &Paths, config: &Config, port: u16) -> anyhow::Result<()> {
    println!("gasoline status");
    println!("===============");
    println!();

    let config_path = paths.config_file();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_path.exists() { "✓" } else { "(defaults)" }
    );

    let pid_file = PidFile::for_port(paths, port);
    match pid_file.live_owner() {
        Some(pid) => println!("PID file:  {} (pid {})", pid_file.path().display(), pid),
        None => println!("PID file:  none"),
    }

    let http = reqwest::Client::builder().timeout(Duration::from_secs(2)).build()?;
    let mut request = http.get(format!("http://127.0.0.1:{}/health", port));
    if let Some(key) = config.api_key() {
        request = request.header(super::gateway::KEY_HEADER, key);
    }
    let health: Value = match request.send().await {
        Ok(resp) if resp.status().is_success() => resp.json().await?,
        Ok(resp) => {
            println!("Daemon:    ✗ port {} answered HTTP {}", port, resp.status());
            return Ok(());
        }
        Err(_) => {
            println!("Daemon:    ✗ not running on port {}", port);
            return Ok(());
        }
    };

    println!(
        "Daemon:    ✓ port {} (pid {}, v{}, up {}s)",
        port,
        health["pid"],
        health["version"].as_str().unwrap_or("?"),
        health["uptime_secs"]
    );
    println!(
        "Extension: {}",
        if health["extension_connected"].as_bool().unwrap_or(false) { "✓ connected" } else { "✗ not connected" }
    );
    println!("Clients:   {}", health["clients"]);
    println!(
        "Circuit:   {}",
        if health["circuit_open"].as_bool().unwrap_or(false) {
            format!("open ({})", health["reason"].as_str().unwrap_or("unknown"))
        } else {
            "closed".to_string()
        }
    );
    println!("Memory:    {} bytes", health["memory_bytes"]);

    if let Some(buffers) = health["buffers"].as_object() {
        println!();
        println!("Buffers:");
        for (kind, stats) in buffers {
            println!("  {:<18} {}", kind, stats["count"]);
        }
    }

    Ok(())
}
