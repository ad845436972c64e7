//! Stdio bridge: one process per agent session, forwarding newline-delimited
//! JSON-RPC from stdin to the shared daemon's `/mcp` endpoint.

use std::net::TcpListener;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use gasoline_capture::derive_client_id;
use gasoline_core::{Config, Paths};
use gasoline_storage::{Journal, PidFile};
use gasoline_tools::mcp::protocol::{recover_id, INTERNAL_ERROR};
use gasoline_tools::mcp::{JsonRpcRequest, JsonRpcResponse};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::gateway::{CLIENT_HEADER, KEY_HEADER};
use super::stop::terminate;

const HEALTH_TIMEOUT: Duration = Duration::from_millis(500);
const RETRY_DELAY: Duration = Duration::from_millis(250);
const CONNECT_ATTEMPTS: u32 = 40;
const HUNG_ATTEMPTS: u32 = 8;
const ZOMBIE_GRACE: Duration = Duration::from_secs(2);
const FORWARD_TIMEOUT: Duration = Duration::from_secs(120);
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(2);

struct Bridge {
    http: reqwest::Client,
    base: String,
    port: u16,
    paths: Paths,
    api_key: Option<String>,
    client_id: String,
    forward_timeout: Duration,
    /// Serializes reconnects so concurrent frames don't each spawn a daemon.
    reconnect: Mutex<()>,
}

/// Attach to (or start) the daemon, then pump stdin frames until EOF.
pub async fn run(paths: Paths, config: &Config, port: u16) -> anyhow::Result<()> {
    paths.ensure_dirs().context("creating state directories")?;
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let bridge = Arc::new(Bridge::new(
        paths,
        port,
        config.api_key().map(String::from),
        derive_client_id(&cwd),
    )?);
    info!(port, client_id = %bridge.client_id, "Starting stdio bridge");

    bridge.ensure_daemon().await?;
    bridge.register(&cwd).await;
    bridge.forward_stdio().await
}

/// Try to take the port ourselves. Holding it keeps racing bridges waiting.
fn claim_port(port: u16) -> Option<TcpListener> {
    TcpListener::bind(("127.0.0.1", port)).ok()
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: setsid(2) is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn detach(_cmd: &mut Command) {}

/// Only a refused or failed connection is retried: the daemon never saw the
/// frame. A timeout or an error status may follow a `tools/call` that already ran.
fn should_retry(err: &anyhow::Error) -> bool {
    err.downcast_ref::<reqwest::Error>()
        .is_some_and(|e| e.is_connect() && !e.is_timeout())
}

/// Error frame for a request the daemon never answered. Notifications get nothing.
fn unreachable_reply(frame: &str, reason: &str) -> Option<String> {
    let is_notification = serde_json::from_str::<JsonRpcRequest>(frame)
        .map(|req| req.is_notification())
        .unwrap_or(false);
    if is_notification {
        return None;
    }
    let resp = JsonRpcResponse::failure(
        recover_id(frame.as_bytes()),
        INTERNAL_ERROR,
        format!("Gasoline daemon unreachable: {}", reason),
    );
    serde_json::to_string(&resp).ok()
}

impl Bridge {
    fn new(paths: Paths, port: u16, api_key: Option<String>, client_id: String) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base: format!("http://127.0.0.1:{}", port),
            port,
            paths,
            api_key,
            client_id,
            forward_timeout: FORWARD_TIMEOUT,
            reconnect: Mutex::new(()),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base, path))
            .header(CLIENT_HEADER, &self.client_id);
        if let Some(key) = &self.api_key {
            builder = builder.header(KEY_HEADER, key);
        }
        builder
    }

    async fn is_healthy(&self) -> bool {
        self.request(reqwest::Method::GET, "/health")
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .is_ok_and(|resp| resp.status().is_success())
    }

    async fn wait_for_health(&self, attempts: u32) -> bool {
        for attempt in 1..=attempts {
            let attempt_deadline = tokio::time::timeout(HEALTH_TIMEOUT, self.is_healthy());
            if matches!(attempt_deadline.await, Ok(true)) {
                debug!(attempt, "Daemon is healthy");
                return true;
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
        false
    }

    async fn ensure_daemon(&self) -> anyhow::Result<()> {
        if self.is_healthy().await {
            debug!(port = self.port, "Attached to running daemon");
            return Ok(());
        }

        let pid_file = PidFile::for_port(&self.paths, self.port);
        if let Some(pid) = pid_file.live_owner() {
            // Possibly still starting; give it a moment before calling it hung.
            if self.wait_for_health(HUNG_ATTEMPTS).await {
                return Ok(());
            }
            return self.recover_zombie(&pid_file, pid).await;
        }

        match claim_port(self.port) {
            Some(claim) => {
                info!(port = self.port, "No daemon running, starting one");
                self.spawn_daemon()?;
                drop(claim);
            }
            None => debug!(port = self.port, "Port is held by another process, waiting for its daemon"),
        }
        if self.wait_for_health(CONNECT_ATTEMPTS).await {
            return Ok(());
        }
        bail!("gasoline daemon on port {} did not become healthy", self.port)
    }

    async fn recover_zombie(&self, pid_file: &PidFile, pid: u32) -> anyhow::Result<()> {
        warn!(pid, port = self.port, "Daemon is not answering /health, restarting it");
        Journal::new(&self.paths, self.port).lifecycle("zombie_recovery", json!({ "pid": pid }));

        terminate(pid, ZOMBIE_GRACE).await?;
        pid_file.remove()?;
        self.spawn_daemon()?;
        if self.wait_for_health(CONNECT_ATTEMPTS).await {
            return Ok(());
        }
        bail!("respawned gasoline daemon on port {} did not become healthy", self.port)
    }

    fn spawn_daemon(&self) -> anyhow::Result<()> {
        let exe = std::env::current_exe().context("locating the gasoline executable")?;
        let mut cmd = Command::new(exe);
        cmd.arg("--daemon")
            .arg("--port")
            .arg(self.port.to_string())
            .arg("--state-dir")
            .arg(&self.paths.base)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut cmd);
        let child = cmd.spawn().context("spawning the gasoline daemon")?;
        info!(pid = child.id(), port = self.port, "Spawned detached daemon");
        Ok(())
    }

    async fn register(&self, cwd: &str) {
        let result = self
            .request(reqwest::Method::POST, "/clients")
            .json(&json!({ "cwd": cwd }))
            .timeout(UNREGISTER_TIMEOUT)
            .send()
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to register client with daemon");
        }
    }

    async fn unregister(&self) {
        let path = format!("/clients/{}", self.client_id);
        let result = self
            .request(reqwest::Method::DELETE, &path)
            .timeout(UNREGISTER_TIMEOUT)
            .send()
            .await;
        if let Err(e) = result {
            debug!(error = %e, "Failed to unregister client");
        }
    }

    /// POST one frame. `Ok(None)` means the daemon answered 204 (notification).
    async fn post_mcp(&self, frame: &str) -> anyhow::Result<Option<String>> {
        let resp = self
            .request(reqwest::Method::POST, "/mcp")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(frame.to_string())
            .timeout(self.forward_timeout)
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = resp.text().await?;
        if !status.is_success() {
            bail!("HTTP {}: {}", status, body.trim());
        }
        Ok(Some(body))
    }

    async fn forward_frame(&self, frame: &str) -> Option<String> {
        let first = match self.post_mcp(frame).await {
            Ok(reply) => return reply,
            Err(e) => e,
        };
        if !should_retry(&first) {
            warn!(error = %first, "Daemon request failed");
            return unreachable_reply(frame, &first.to_string());
        }
        warn!(error = %first, "Daemon connection failed, reconnecting");
        let reconnected = {
            let _guard = self.reconnect.lock().await;
            self.ensure_daemon().await
        };
        let retried = match reconnected {
            Ok(()) => self.post_mcp(frame).await,
            Err(e) => Err(e),
        };
        match retried {
            Ok(reply) => reply,
            Err(e) => unreachable_reply(frame, &e.to_string()),
        }
    }

    /// Forward every frame on its own task so a slow call never holds up the
    /// next one. Replies are written whole, one per line, in completion order.
    async fn forward_stream<R, W>(self: &Arc<Self>, reader: R, mut writer: W) -> anyhow::Result<W>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut lines = BufReader::new(reader).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    let frame = line.trim().to_string();
                    if frame.is_empty() {
                        continue;
                    }
                    let bridge = Arc::clone(self);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = bridge.forward_frame(&frame).await {
                            let _ = tx.send(reply);
                        }
                    });
                }
                Some(reply) = rx.recv() => write_frame(&mut writer, &reply).await?,
            }
        }
        // Input closed: wait for in-flight frames, which hold the remaining senders.
        drop(tx);
        while let Some(reply) = rx.recv().await {
            write_frame(&mut writer, &reply).await?;
        }
        Ok(writer)
    }

    async fn forward_stdio(self: &Arc<Self>) -> anyhow::Result<()> {
        self.forward_stream(tokio::io::stdin(), tokio::io::stdout()).await?;
        info!(client_id = %self.client_id, "stdin closed, detaching from daemon");
        self.unregister().await;
        Ok(())
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, reply: &str) -> anyhow::Result<()> {
    writer.write_all(reply.trim_end().as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
