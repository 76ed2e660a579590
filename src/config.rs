//! Configuration file parser for ~/.config/canopy/config.toml.
//!
//! The file is optional: a missing or empty file yields `Config::default()`.
//! Unknown keys are accepted but logged, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::PollerSettings;
use crate::registry::RegistrySettings;
use crate::storage::DEFAULT_ITEM_WINDOW;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration. Any subset of keys may be given.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Operator refresh interval. Feed TTLs can lengthen it; 0 is treated as 1.
    pub refresh_interval_minutes: u64,

    /// Items kept per feed.
    pub item_window: usize,

    /// Upper bound on one fetch, including redirects and the body.
    pub fetch_timeout_secs: u64,

    /// SQLite file. `None` means `canopy.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Consecutive unsupported-format cycles after which a feed is
    /// unsubscribed. 0 keeps such feeds forever.
    pub retire_unsupported_after: u32,

    /// Allow localhost and private-network feed URLs.
    pub allow_private_hosts: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval_minutes: 15,
            item_window: DEFAULT_ITEM_WINDOW,
            fetch_timeout_secs: 60,
            database_path: None,
            retire_unsupported_after: 0,
            allow_private_hosts: false,
        }
    }
}

const KNOWN_KEYS: [&str; 6] = [
    "refresh_interval_minutes",
    "item_window",
    "fetch_timeout_secs",
    "database_path",
    "retire_unsupported_after",
    "allow_private_hosts",
];

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML or wrong value types → `Err(ConfigError::Parse)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check the size before reading the whole file into memory
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            refresh_minutes = config.refresh_interval_minutes,
            item_window = config.item_window,
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_minutes.max(1) * 60)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    /// The configured database file, or `canopy.db` inside `config_dir`.
    pub fn database_path(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("canopy.db"))
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            refresh: self.refresh_interval(),
            retire_unsupported_after: self.retire_unsupported_after,
            lenient_charset: true,
        }
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            poller: self.poller_settings(),
            allow_private: self.allow_private_hosts,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.refresh_interval(), Duration::from_secs(15 * 60));
        assert_eq!(config.item_window, 7);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(60));
        assert_eq!(config.retire_unsupported_after, 0);
        assert!(!config.allow_private_hosts);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (_dir, path) = write_config("   \n  \n  ");
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let (_dir, path) = write_config("item_window = 20\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.item_window, 20);
        assert_eq!(config.refresh_interval_minutes, 15);
    }

    #[test]
    fn test_full_config() {
        let (_dir, path) = write_config(
            r#"
refresh_interval_minutes = 30
item_window = 50
fetch_timeout_secs = 10
database_path = "/var/lib/canopy/feeds.db"
retire_unsupported_after = 5
allow_private_hosts = true
"#,
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config,
            Config {
                refresh_interval_minutes: 30,
                item_window: 50,
                fetch_timeout_secs: 10,
                database_path: Some(PathBuf::from("/var/lib/canopy/feeds.db")),
                retire_unsupported_after: 5,
                allow_private_hosts: true,
            }
        );

        let settings = config.registry_settings();
        assert_eq!(settings.poller.refresh, Duration::from_secs(30 * 60));
        assert_eq!(settings.poller.retire_unsupported_after, 5);
        assert!(settings.allow_private);
    }

    #[test]
    fn test_zero_refresh_is_clamped() {
        let (_dir, path) = write_config("refresh_interval_minutes = 0\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_database_path_defaults_next_to_config() {
        let config = Config::default();
        assert_eq!(
            config.database_path(Path::new("/home/u/.config/canopy")),
            PathBuf::from("/home/u/.config/canopy/canopy.db")
        );
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (_dir, path) = write_config("this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let (_dir, path) = write_config("item_window = \"seven\"\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (_dir, path) = write_config("item_window = 3\ntheme = \"dark\"\n");
        assert_eq!(Config::load(&path).unwrap().item_window, 3);
    }

    // SEC-014: File size limit
    #[test]
    fn test_too_large_file_rejected() {
        let (_dir, path) = write_config(&"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_file_at_size_limit_accepted() {
        let mut content = "item_window = 9\n".to_string();
        while content.len() < 1_048_576 - 20 {
            content.push_str("# padding comment\n");
        }
        content.truncate(1_048_576);
        let (_dir, path) = write_config(&content);
        assert!(Config::load(&path).is_ok());
    }
}
