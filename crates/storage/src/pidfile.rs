use gasoline_core::{Error, Paths, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// `run/gasoline-<port>.pid`, holding the daemon's decimal PID.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn for_port(paths: &Paths, port: u16) -> Self {
        Self { path: paths.pid_file(port) }
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_current(&self) -> Result<()> {
        self.write(std::process::id())
    }

    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, format!("{}\n", pid))?;
        Ok(())
    }

    /// The recorded PID, or `None` when the file is missing or garbled.
    pub fn read(&self) -> Option<u32> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        content.trim().parse().ok()
    }

    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// PID of a live owner, if any. A stale file (dead PID) is removed.
    pub fn live_owner(&self) -> Option<u32> {
        let pid = self.read()?;
        if pid != std::process::id() && is_pid_alive(pid) {
            return Some(pid);
        }
        if pid != std::process::id() {
            debug!(pid, path = %self.path.display(), "Removing stale PID file");
            let _ = self.remove();
        }
        None
    }

    /// Remove the file only if it still names this process.
    pub fn remove_if_ours(&self) -> Result<()> {
        if self.read() == Some(std::process::id()) {
            self.remove()?;
        }
        Ok(())
    }
}

/// Every `gasoline-<port>.pid` under the run directory.
pub fn scan_run_dir(run_dir: &Path) -> Vec<(u16, PidFile)> {
    let Ok(entries) = std::fs::read_dir(run_dir) else {
        return Vec::new();
    };
    let mut found = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(port) = name
            .strip_prefix("gasoline-")
            .and_then(|rest| rest.strip_suffix(".pid"))
            .and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        found.push((port, PidFile::at(entry.path())));
    }
    found.sort_by_key(|(port, _)| *port);
    found
}

/// PIDs that name exactly one process. Zero and values that wrap negative
/// would address process groups in kill(2).
#[cfg(unix)]
fn signalable(pid: u32) -> bool {
    pid > 0 && pid <= i32::MAX as u32
}

pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: signal 0 only checks for existence.
        signalable(pid) && unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// Deliver a signal. A process that is already gone counts as success.
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    #[cfg(unix)]
    {
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        if !signalable(pid) {
            return Err(Error::Validation(format!("refusing to signal PID {}", pid)));
        }
        // SAFETY: kill(2) with a concrete PID has no memory-safety preconditions.
        if unsafe { libc::kill(pid as i32, sig) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err.into());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        Err(Error::Other("process signals are only supported on Unix".to_string()))
    }
}
