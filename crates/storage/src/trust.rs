//! First-seen pairing of browser extension origins.

use gasoline_core::{Paths, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

pub const CHROME_ID_ENV: &str = "GASOLINE_EXTENSION_ID";
pub const FIREFOX_ID_ENV: &str = "GASOLINE_FIREFOX_EXTENSION_ID";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrustedExtensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrome_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firefox_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Browser {
    Chrome,
    Firefox,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// Origin matches the paired (or configured) ID.
    Trusted,
    /// First sighting for this browser; the ID is now paired.
    Paired,
    /// A different ID is already paired, or the origin is malformed.
    Rejected,
    /// Not a browser-extension origin.
    NotExtension,
}

/// Extension IDs are lowercase alphanumerics plus `_` and `-`.
pub fn valid_extension_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Split `chrome-extension://<id>` / `moz-extension://<id>` origins.
pub fn parse_extension_origin(origin: &str) -> Option<(Browser, &str)> {
    let (browser, rest) = if let Some(rest) = origin.strip_prefix("chrome-extension://") {
        (Browser::Chrome, rest)
    } else if let Some(rest) = origin.strip_prefix("moz-extension://") {
        (Browser::Firefox, rest)
    } else {
        return None;
    };
    Some((browser, rest.trim_end_matches('/')))
}

pub struct TrustStore {
    path: PathBuf,
    env: TrustedExtensions,
    state: Mutex<TrustedExtensions>,
}

impl TrustStore {
    /// Load the pairing file; environment overrides win over it.
    pub fn load(paths: &Paths) -> Self {
        let env = TrustedExtensions {
            chrome_id: std::env::var(CHROME_ID_ENV).ok().filter(|v| valid_extension_id(v)),
            firefox_id: std::env::var(FIREFOX_ID_ENV).ok().filter(|v| valid_extension_id(v)),
        };
        Self::with_overrides(paths.trusted_extensions_file(), env)
    }

    pub fn with_overrides(path: PathBuf, env: TrustedExtensions) -> Self {
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "Ignoring unreadable trusted extension file");
                TrustedExtensions::default()
            }),
            Err(_) => TrustedExtensions::default(),
        };
        Self {
            path,
            env,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrustedExtensions> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> TrustedExtensions {
        let file = self.lock().clone();
        TrustedExtensions {
            chrome_id: self.env.chrome_id.clone().or(file.chrome_id),
            firefox_id: self.env.firefox_id.clone().or(file.firefox_id),
        }
    }

    /// Decide whether an `Origin` header may talk to the daemon, pairing on first sight.
    pub fn check_origin(&self, origin: &str) -> TrustDecision {
        let Some((browser, id)) = parse_extension_origin(origin) else {
            return TrustDecision::NotExtension;
        };
        if !valid_extension_id(id) {
            return TrustDecision::Rejected;
        }
        let configured = match browser {
            Browser::Chrome => self.env.chrome_id.as_deref(),
            Browser::Firefox => self.env.firefox_id.as_deref(),
        };
        if let Some(expected) = configured {
            return if expected == id { TrustDecision::Trusted } else { TrustDecision::Rejected };
        }

        let mut state = self.lock();
        let slot = match browser {
            Browser::Chrome => &mut state.chrome_id,
            Browser::Firefox => &mut state.firefox_id,
        };
        match slot.as_deref() {
            Some(paired) if paired == id => return TrustDecision::Trusted,
            Some(_) => return TrustDecision::Rejected,
            None => {}
        }
        *slot = Some(id.to_string());
        let snapshot = state.clone();
        drop(state);
        if let Err(e) = self.save(&snapshot) {
            warn!(error = %e, "Failed to persist extension pairing");
        }
        info!(?browser, extension_id = id, "Paired browser extension");
        TrustDecision::Paired
    }

    /// Atomic write: temp file, then rename over the target.
    fn save(&self, trusted: &TrustedExtensions) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, serde_json::to_string_pretty(trusted)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
