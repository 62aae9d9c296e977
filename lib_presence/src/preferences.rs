//! # Local Preferences
//!
//! Persistent storage for the privacy flag. The flag is loaded once when the
//! client is built and written back on every user-driven change.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::PresenceError;

/// Persists the user's privacy choice.
pub trait PreferenceStore: Send + Sync {
    /// Stored privacy flag; `false` when nothing was stored yet.
    fn load_privacy_mode(&self) -> bool;

    /// Persists the privacy flag.
    fn save_privacy_mode(&self, enabled: bool) -> Result<(), PresenceError>;
}

/// Process-local preferences; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    privacy_mode: Mutex<bool>,
}

impl MemoryPreferences {
    /// Starts with the given flag.
    pub fn with_privacy_mode(enabled: bool) -> Self {
        Self {
            privacy_mode: Mutex::new(enabled),
        }
    }
}

impl PreferenceStore for MemoryPreferences {
    fn load_privacy_mode(&self) -> bool {
        *self.privacy_mode.lock().expect("Preferences lock poisoned")
    }

    fn save_privacy_mode(&self, enabled: bool) -> Result<(), PresenceError> {
        *self.privacy_mode.lock().expect("Preferences lock poisoned") = enabled;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PreferencesFile {
    #[serde(default)]
    privacy_mode: bool,
}

/// Preferences kept in a small JSON file, e.g. `{"privacy_mode": true}`.
#[derive(Debug, Clone)]
pub struct JsonFilePreferences {
    path: PathBuf,
}

impl JsonFilePreferences {
    /// Uses `path`; the file and its directory are created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<PreferencesFile, PresenceError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PreferencesFile::default()),
            Err(e) => Err(e.into()),
        }
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn load_privacy_mode(&self) -> bool {
        match self.read() {
            Ok(prefs) => prefs.privacy_mode,
            Err(e) => {
                log::warn!("Ignoring unreadable preferences {}: {}", self.path.display(), e);
                false
            }
        }
    }

    fn save_privacy_mode(&self, enabled: bool) -> Result<(), PresenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let prefs = PreferencesFile { privacy_mode: enabled };
        fs::write(&self.path, serde_json::to_string_pretty(&prefs)?)?;
        Ok(())
    }
}
