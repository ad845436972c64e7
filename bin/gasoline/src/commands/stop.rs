use std::time::Duration;

use gasoline_core::{Config, Paths};
use gasoline_storage::pidfile::{is_pid_alive, scan_run_dir, send_signal, Signal};
use gasoline_storage::PidFile;
use tracing::{debug, warn};

use super::gateway::KEY_HEADER;

const STOP_GRACE: Duration = Duration::from_millis(1500);
const HTTP_STOP_WAIT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll until `pid` is gone. Returns false if it outlived `timeout`.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while is_pid_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    true
}

/// SIGTERM, wait `grace`, then SIGKILL. Returns true if SIGKILL was needed.
pub async fn terminate(pid: u32, grace: Duration) -> anyhow::Result<bool> {
    send_signal(pid, Signal::Term)?;
    if wait_for_exit(pid, grace).await {
        return Ok(false);
    }
    warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
    send_signal(pid, Signal::Kill)?;
    wait_for_exit(pid, Duration::from_millis(500)).await;
    Ok(true)
}

/// Ask the daemon to exit over HTTP, falling back to signalling the PID file owner.
pub async fn stop(paths: &Paths, config: &Config, port: u16) -> anyhow::Result<()> {
    let pid_file = PidFile::for_port(paths, port);
    let http = reqwest::Client::builder().timeout(Duration::from_secs(2)).build()?;
    let mut request = http.post(format!("http://127.0.0.1:{}/shutdown", port));
    if let Some(key) = config.api_key() {
        request = request.header(KEY_HEADER, key);
    }

    match request.send().await {
        Ok(resp) if resp.status().is_success() => {
            let exited = match pid_file.read() {
                Some(pid) => wait_for_exit(pid, HTTP_STOP_WAIT).await,
                None => true,
            };
            if exited {
                println!("✓ Stopped gasoline on port {}", port);
                return Ok(());
            }
            warn!(port, "Daemon accepted shutdown but is still running");
        }
        Ok(resp) => debug!(port, status = %resp.status(), "Shutdown endpoint refused"),
        Err(e) => debug!(port, error = %e, "Shutdown endpoint unreachable"),
    }

    let Some(pid) = pid_file.live_owner() else {
        println!("gasoline is not running on port {}", port);
        return Ok(());
    };
    let killed = terminate(pid, STOP_GRACE).await?;
    pid_file.remove()?;
    println!(
        "✓ Stopped gasoline (pid {}) on port {}{}",
        pid,
        port,
        if killed { " with SIGKILL" } else { "" }
    );
    Ok(())
}

/// Kill every daemon that owns a PID file under the run directory.
pub async fn force(paths: &Paths) -> anyhow::Result<()> {
    let mut stopped = 0;
    for (port, pid_file) in scan_run_dir(&paths.run_dir()) {
        let Some(pid) = pid_file.live_owner() else {
            debug!(port, "No live owner for PID file");
            continue;
        };
        match terminate(pid, STOP_GRACE).await {
            Ok(_) => {
                stopped += 1;
                println!("✓ Killed gasoline pid {} (port {})", pid, port);
            }
            Err(e) => warn!(pid, port, error = %e, "Failed to stop daemon"),
        }
        if let Err(e) = pid_file.remove() {
            warn!(port, error = %e, "Failed to remove PID file");
        }
    }
    println!("Stopped {} gasoline daemon(s)", stopped);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// PID of a process that has already exited and been reaped.
    fn reaped_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[tokio::test]
    async fn test_wait_for_exit_on_dead_pid() {
        assert!(wait_for_exit(reaped_pid(), Duration::from_millis(100)).await);
        assert!(!wait_for_exit(std::process::id(), Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_force_clears_stale_pid_files() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let stale = PidFile::for_port(&paths, 7999);
        stale.write(reaped_pid()).unwrap();
        force(&paths).await.unwrap();
        assert!(!stale.path().exists());
    }

    #[tokio::test]
    async fn test_terminate_stops_sleeping_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        // Reap on a thread so the exited child does not linger as a zombie.
        let reaper = std::thread::spawn(move || child.wait());
        let killed = terminate(pid, Duration::from_secs(2)).await.unwrap();
        assert!(!killed);
        assert!(reaper.join().unwrap().is_ok());
    }
}
