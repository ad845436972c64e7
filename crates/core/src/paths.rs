use std::path::PathBuf;

pub const STATE_DIR_ENV: &str = "GASOLINE_STATE_DIR";

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    /// Resolve the state root: `$GASOLINE_STATE_DIR`, else `~/.gasoline`.
    pub fn new() -> Self {
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|v| !v.is_empty()) {
            return Self { base: PathBuf::from(dir) };
        }
        let base = dirs::home_dir()
            .map(|h| h.join(".gasoline"))
            .unwrap_or_else(|| PathBuf::from(".gasoline"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.base.join("run")
    }

    pub fn pid_file(&self, port: u16) -> PathBuf {
        self.run_dir().join(format!("gasoline-{}.pid", port))
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.base.join("settings")
    }

    pub fn trusted_extensions_file(&self) -> PathBuf {
        self.settings_dir().join("trusted-extension-ids.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn journal_file(&self) -> PathBuf {
        self.logs_dir().join("gasoline.jsonl")
    }

    pub fn redaction_config(&self) -> PathBuf {
        self.base.join("redaction.json")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.run_dir())?;
        std::fs::create_dir_all(self.settings_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
