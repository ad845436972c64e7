use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use gasoline_capture::Transition;
use gasoline_core::{Config, Paths};
use gasoline_storage::{Journal, PidFile};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::gateway::{self, GatewayState};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const EXTENSION_CHECK_INTERVAL: Duration = Duration::from_secs(2);
const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const SCAVENGE_INTERVAL: Duration = Duration::from_secs(30);

/// Run the HTTP daemon in the foreground until a signal or `POST /shutdown`.
pub async fn run(paths: Paths, mut config: Config, port: u16, api_key: Option<String>) -> anyhow::Result<()> {
    paths.ensure_dirs().context("creating state directories")?;
    if let Some(key) = api_key {
        config.server.api_key = key;
    }
    config.server.port = port;
    let journal = Arc::new(Journal::new(&paths, port));

    // Fast fail before touching the socket.
    let pid_file = PidFile::for_port(&paths, port);
    if let Some(pid) = pid_file.live_owner() {
        error!(port, pid, "Another gasoline daemon owns this port");
        journal.lifecycle("port_conflict", json!({ "pid": pid }));
        bail!("gasoline is already running on port {} (pid {})", port, pid);
    }

    let bind_addr = match config.server.bind_addr(port) {
        Ok(addr) => addr,
        Err(e) => {
            error!(host = %config.server.host, error = %e, "Refusing non-loopback bind address");
            journal.lifecycle("bind_failed", json!({ "host": config.server.host, "error": e.to_string() }));
            bail!(e);
        }
    };
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "Failed to bind");
            journal.lifecycle("bind_failed", json!({ "addr": bind_addr.to_string(), "error": e.to_string() }));
            bail!("cannot bind {}: {}", bind_addr, e);
        }
    };
    pid_file.write_current().context("writing PID file")?;

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let mut shutdown_rx = shutdown_tx.subscribe();
    let state = GatewayState::new(&paths, config, Some(journal.clone()), shutdown_tx.clone());
    let app = gateway::router(state.clone());

    info!(
        addr = %bind_addr,
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        "gasoline daemon listening"
    );
    journal.lifecycle(
        "startup",
        json!({ "pid": std::process::id(), "version": env!("CARGO_PKG_VERSION"), "addr": bind_addr.to_string() }),
    );

    let server_shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = server_shutdown_rx;
                let _ = rx.recv().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "HTTP server stopped with an error");
        }
    });
    let maintenance_handle = spawn_maintenance(state, shutdown_tx.subscribe());

    // ── Wait for shutdown signal ──
    let reason = tokio::select! {
        signal = wait_for_signal() => {
            let _ = shutdown_tx.send(());
            signal
        }
        _ = shutdown_rx.recv() => "http",
    };
    info!(reason, "Shutdown requested, draining requests...");

    let handles: Vec<(&str, JoinHandle<()>)> = vec![("http_server", http_handle), ("maintenance", maintenance_handle)];
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if handles.iter().all(|(_, h)| h.is_finished()) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut aborted = 0;
    for (name, handle) in &handles {
        if !handle.is_finished() {
            warn!(task = *name, "Task did not exit in graceful window, aborting");
            handle.abort();
            aborted += 1;
        }
    }
    for (name, handle) in handles {
        match handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => debug!(task = name, "Task cancelled during shutdown"),
            Err(e) => error!(task = name, error = %e, "Task panicked during shutdown"),
        }
    }

    if let Err(e) = pid_file.remove_if_ours() {
        warn!(path = %pid_file.path().display(), error = %e, "Failed to remove PID file");
    }
    journal.lifecycle("shutdown", json!({ "reason": reason, "aborted_tasks": aborted }));
    info!(aborted, "gasoline daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut term), Ok(mut hup)) = (signal(SignalKind::terminate()), signal(SignalKind::hangup())) else {
        warn!("Could not install SIGTERM/SIGHUP handlers, listening for Ctrl+C only");
        return wait_for_ctrl_c().await;
    };
    tokio::select! {
        name = wait_for_ctrl_c() => name,
        _ = term.recv() => "SIGTERM",
        _ = hup.recv() => "SIGHUP",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

/// Breaker ticks, memory enforcement, extension liveness and TTL scavenging.
fn spawn_maintenance(state: GatewayState, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        let mut extension = tokio::time::interval(EXTENSION_CHECK_INTERVAL);
        let mut memory = tokio::time::interval(MEMORY_CHECK_INTERVAL);
        let mut scavenge = tokio::time::interval(SCAVENGE_INTERVAL);
        for interval in [&mut tick, &mut extension, &mut memory, &mut scavenge] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => {
                    if let Some(transition) = state.capture.store.tick() {
                        record_transition(&state, transition);
                    }
                }
                _ = extension.tick() => {
                    if state.capture.check_extension() {
                        warn!("Extension stopped polling, expired outstanding commands");
                        if let Some(journal) = &state.journal {
                            journal.lifecycle("extension_disconnected", json!({}));
                        }
                    }
                }
                _ = memory.tick() => {
                    let evicted = state.capture.store.check_memory();
                    if evicted > 0 {
                        debug!(evicted, "Memory check evicted records");
                    }
                }
                _ = scavenge.tick() => {
                    let expired = state.capture.scavenge();
                    if expired > 0 {
                        debug!(expired, "Scavenged expired commands and results");
                    }
                }
            }
        }
        debug!("Maintenance loop stopped");
    })
}

fn record_transition(state: &GatewayState, transition: Transition) {
    let (event, detail) = match transition {
        Transition::Opened(reason) => {
            warn!(reason = reason.as_str(), "Ingest circuit opened");
            ("circuit_opened", json!({ "reason": reason.as_str() }))
        }
        Transition::Closed => {
            info!("Ingest circuit closed");
            ("circuit_closed", json!({}))
        }
    };
    if let Some(journal) = &state.journal {
        journal.lifecycle(event, detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths() -> (Paths, TempDir) {
        let dir = TempDir::new().unwrap();
        (Paths::with_base(dir.path().to_path_buf()), dir)
    }

    #[tokio::test]
    async fn test_live_pid_file_is_a_conflict() {
        let (paths, _dir) = paths();
        let mut owner = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        PidFile::for_port(&paths, 7991).write(owner.id()).unwrap();

        let err = run(paths.clone(), Config::default(), 7991, None).await.unwrap_err();
        assert!(err.to_string().contains("already running"));

        owner.kill().unwrap();
        owner.wait().unwrap();
        let events = Journal::new(&paths, 7991).read_events().unwrap();
        assert!(!events.is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_no_pid_file() {
        let (paths, _dir) = paths();
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let err = run(paths.clone(), Config::default(), port, None).await.unwrap_err();
        assert!(err.to_string().contains("cannot bind"));
        assert!(!PidFile::for_port(&paths, port).path().exists());
    }

    #[tokio::test]
    async fn test_http_shutdown_removes_pid_file() {
        let (paths, _dir) = paths();
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let daemon = tokio::spawn(run(paths.clone(), Config::default(), port, None));

        let http = reqwest::Client::new();
        let base = format!("http://127.0.0.1:{}", port);
        let mut healthy = false;
        for _ in 0..50 {
            if http.get(format!("{}/health", base)).send().await.is_ok() {
                healthy = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(healthy);
        assert_eq!(PidFile::for_port(&paths, port).read(), Some(std::process::id()));

        http.post(format!("{}/shutdown", base)).send().await.unwrap();
        daemon.await.unwrap().unwrap();
        assert!(!PidFile::for_port(&paths, port).path().exists());
    }
}
