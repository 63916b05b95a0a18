use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Which storage backend the service runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    File,
    Sqlite,
}

impl StorageBackendKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "file" => Some(Self::File),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

/// Runtime configuration for the turn engine service.
///
/// Everything is sourced from the environment (`TURNKEEPER_*`); missing
/// variables fall back to defaults suitable for local play.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub backend: StorageBackendKind,
    /// Root directory holding `sessions/`, `dice/`, and `data/characters/`.
    pub data_root: PathBuf,
    /// SQLite database location (sqlite backend only).
    pub database_url: Option<String>,
    pub bind_addr: SocketAddr,
    /// Shared secret gating write routes. `None` leaves writes open.
    pub api_key: Option<String>,
    pub llm: LlmSettings,
    /// Default number of transcript entries returned without `tail`.
    pub transcript_tail: usize,
    /// Default number of changelog entries returned without `tail`.
    pub changelog_tail: usize,
    /// Auto-save interval in seconds; 0 disables the background task.
    pub auto_save_secs: u64,
    /// Previews older than this are garbage-collected.
    pub preview_max_age_secs: i64,
    /// Minimum turns between engine-requested discoveries.
    pub discovery_interval: u64,
}

/// Narration producer endpoint configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmSettings {
    /// OpenAI-compatible chat completions URL. `None` means narration
    /// falls back to the deterministic template output.
    pub endpoint: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::File,
            data_root: PathBuf::from("data"),
            database_url: None,
            bind_addr: "127.0.0.1:8642".parse().expect("static addr"),
            api_key: None,
            llm: LlmSettings {
                endpoint: None,
                model: "gpt-4o-mini".to_string(),
                api_key: None,
            },
            transcript_tail: 50,
            changelog_tail: 50,
            auto_save_secs: 300,
            preview_max_age_secs: 3600,
            discovery_interval: 5,
        }
    }
}

/// Configuration error raised during startup validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    Invalid { var: String, value: String },
    #[error("data root {0} is not a directory")]
    DataRoot(PathBuf),
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Ok(raw) = env::var("TURNKEEPER_STORAGE_BACKEND") {
            settings.backend =
                StorageBackendKind::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                    var: "TURNKEEPER_STORAGE_BACKEND".into(),
                    value: raw,
                })?;
        }
        if let Ok(raw) = env::var("TURNKEEPER_DATA_ROOT") {
            settings.data_root = PathBuf::from(raw);
        }
        if let Ok(raw) = env::var("TURNKEEPER_DATABASE_URL") {
            settings.database_url = Some(raw);
        }
        if let Ok(raw) = env::var("TURNKEEPER_BIND_ADDR") {
            settings.bind_addr = raw.parse().map_err(|_| ConfigError::Invalid {
                var: "TURNKEEPER_BIND_ADDR".into(),
                value: raw.clone(),
            })?;
        }
        if let Ok(raw) = env::var("TURNKEEPER_API_KEY") {
            if !raw.is_empty() {
                settings.api_key = Some(raw);
            }
        }
        if let Ok(raw) = env::var("TURNKEEPER_LLM_ENDPOINT") {
            if !raw.is_empty() {
                settings.llm.endpoint = Some(raw);
            }
        }
        if let Ok(raw) = env::var("TURNKEEPER_LLM_MODEL") {
            settings.llm.model = raw;
        }
        if let Ok(raw) = env::var("TURNKEEPER_LLM_API_KEY") {
            if !raw.is_empty() {
                settings.llm.api_key = Some(raw);
            }
        }
        settings.transcript_tail =
            parse_env("TURNKEEPER_TRANSCRIPT_TAIL", settings.transcript_tail)?;
        settings.changelog_tail = parse_env("TURNKEEPER_CHANGELOG_TAIL", settings.changelog_tail)?;
        settings.auto_save_secs = parse_env("TURNKEEPER_AUTO_SAVE_SECS", settings.auto_save_secs)?;
        settings.preview_max_age_secs =
            parse_env("TURNKEEPER_PREVIEW_MAX_AGE_SECS", settings.preview_max_age_secs)?;
        settings.discovery_interval =
            parse_env("TURNKEEPER_DISCOVERY_INTERVAL", settings.discovery_interval)?;

        Ok(settings)
    }

    /// Validate invariants that would otherwise surface mid-request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_root.exists() && !self.data_root.is_dir() {
            return Err(ConfigError::DataRoot(self.data_root.clone()));
        }
        Ok(())
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.data_root.join("sessions")
    }

    pub fn dice_path(&self) -> PathBuf {
        self.data_root.join("dice").join("entropy.ndjson")
    }

    pub fn characters_path(&self) -> PathBuf {
        self.data_root.join("data").join("characters")
    }

    pub fn session_path(&self, slug: &str) -> PathBuf {
        self.sessions_path().join(slug)
    }

    /// Resolved SQLite file path for the relational backend.
    pub fn sqlite_path(&self) -> PathBuf {
        match self.database_url.as_deref() {
            Some(url) => {
                let trimmed = url
                    .strip_prefix("sqlite://")
                    .or_else(|| url.strip_prefix("sqlite:"))
                    .unwrap_or(url);
                let path = Path::new(trimmed);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    self.data_root.join(path)
                }
            }
            None => self.data_root.join("turnkeeper.sqlite"),
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            var: var.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.backend, StorageBackendKind::File);
        assert_eq!(settings.transcript_tail, 50);
        assert_eq!(settings.auto_save_secs, 300);
        assert!(settings.api_key.is_none());
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!(
            StorageBackendKind::parse("SQLite"),
            Some(StorageBackendKind::Sqlite)
        );
        assert_eq!(
            StorageBackendKind::parse(" file "),
            Some(StorageBackendKind::File)
        );
        assert_eq!(StorageBackendKind::parse("postgres"), None);
    }

    #[test]
    fn test_derived_paths() {
        let mut settings = Settings::default();
        settings.data_root = PathBuf::from("/srv/dm");
        assert_eq!(
            settings.dice_path(),
            PathBuf::from("/srv/dm/dice/entropy.ndjson")
        );
        assert_eq!(
            settings.session_path("rogue-one"),
            PathBuf::from("/srv/dm/sessions/rogue-one")
        );
    }

    #[test]
    fn test_sqlite_path_resolution() {
        let mut settings = Settings::default();
        settings.data_root = PathBuf::from("/srv/dm");
        assert_eq!(
            settings.sqlite_path(),
            PathBuf::from("/srv/dm/turnkeeper.sqlite")
        );

        settings.database_url = Some("sqlite:///var/db/game.sqlite".to_string());
        assert_eq!(settings.sqlite_path(), PathBuf::from("/var/db/game.sqlite"));

        settings.database_url = Some("game.sqlite".to_string());
        assert_eq!(settings.sqlite_path(), PathBuf::from("/srv/dm/game.sqlite"));
    }
}
