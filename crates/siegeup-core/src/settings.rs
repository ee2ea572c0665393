//! Persisted declarative configuration.
//!
//! `settings.json` under the base directory holds the ordered desired-server
//! set. It is loaded once at startup and rewritten as a whole (temp file +
//! rename in the same directory) on every mutation, so a crash leaves either
//! the old complete file or the new complete file. A missing or unparsable
//! file reinitializes to an empty set.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// File name of the persisted settings document.
pub const SETTINGS_FILE: &str = "settings.json";

/// One declaratively managed game server, keyed by `port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredServer {
    /// Human label.
    #[serde(default)]
    pub name: String,

    /// Build-store version to run.
    pub version: String,

    /// TCP port, unique within the set.
    pub port: u16,

    /// Extra arguments appended after the built-in flags.
    #[serde(default)]
    pub args: Vec<String>,

    /// Opaque visibility flag, passed through in status.
    #[serde(default = "default_true")]
    pub visible: bool,

    /// When `false`, reconciliation ensures no live child exists for the
    /// port; the entry stays persisted.
    #[serde(default = "default_true")]
    pub run: bool,
}

const fn default_true() -> bool {
    true
}

/// The persisted settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Ordered desired-server set.
    #[serde(default)]
    pub servers: Vec<DesiredServer>,
}

/// Errors from settings persistence.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Settings file could not be written.
    #[error("failed to write settings: {0}")]
    Io(#[from] std::io::Error),

    /// Settings could not be serialized.
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Temp file could not be renamed over the settings file.
    #[error("failed to replace settings file: {0}")]
    Replace(#[from] tempfile::PersistError),
}

/// Path of the settings file under `base`.
#[must_use]
pub fn settings_path(base: &Path) -> PathBuf {
    base.join(SETTINGS_FILE)
}

/// Loads settings from `base`, falling back to an empty set when the file is
/// missing or unparsable.
#[must_use]
pub fn load(base: &Path) -> Settings {
    let path = settings_path(base);
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
        Err(e) => {
            warn!(path = %path.display(), "failed to read settings, starting empty: {e}");
            return Settings::default();
        },
    };
    match serde_json::from_slice(&raw) {
        Ok(settings) => settings,
        Err(e) => {
            warn!(path = %path.display(), "unparsable settings, starting empty: {e}");
            Settings::default()
        },
    }
}

/// Atomically replaces the settings file under `base`.
///
/// # Errors
///
/// Returns an error when serialization fails or the file cannot be written
/// or renamed into place.
pub fn persist(base: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let data = serde_json::to_vec_pretty(settings)?;
    let mut tmp = tempfile::NamedTempFile::new_in(base)?;
    tmp.write_all(&data)?;
    tmp.flush()?;
    tmp.persist(settings_path(base))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Settings {
        Settings {
            servers: vec![DesiredServer {
                name: "Server 1".to_string(),
                version: "v1".to_string(),
                port: 9001,
                args: vec!["--map".to_string(), "island".to_string()],
                visible: true,
                run: true,
            }],
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).servers.is_empty());
    }

    #[test]
    fn test_load_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(settings_path(dir.path()), b"{not json").unwrap();
        assert!(load(dir.path()).servers.is_empty());
    }

    #[test]
    fn test_persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        persist(dir.path(), &sample()).unwrap();

        let loaded = load(dir.path());
        assert_eq!(loaded.servers, sample().servers);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            settings_path(dir.path()),
            br#"{"servers":[{"version":"v1","port":9001,"futureField":42}],"extra":true}"#,
        )
        .unwrap();

        let loaded = load(dir.path());
        assert_eq!(loaded.servers.len(), 1);
        assert_eq!(loaded.servers[0].port, 9001);
        assert!(loaded.servers[0].visible);
        assert!(loaded.servers[0].run);
        assert!(loaded.servers[0].args.is_empty());
    }
}
