//! Configuration file parser for ~/.config/newsreel/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde, though we log a warning when the
//! file contains potential typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::EntryFailurePolicy;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Syndication feed to mirror.
    pub feed_url: String,

    /// Minutes between scheduled fetch cycles.
    pub refresh_interval_minutes: u64,

    /// Timeout applied to the feed request and to each article page request.
    pub request_timeout_secs: u64,

    /// Maximum number of article pages fetched at once while resolving images.
    pub image_fetch_concurrency: usize,

    /// What a cycle does with an entry that cannot be parsed or enriched.
    pub entry_failure_policy: EntryFailurePolicy,

    /// User-Agent header sent with every request.
    pub user_agent: String,

    /// SQLite file holding the snapshot. Defaults to `news.db` next to the config file.
    pub database_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_url: "https://bloomingbit.io/feed".to_string(),
            refresh_interval_minutes: 30,
            request_timeout_secs: 30,
            image_fetch_concurrency: 4,
            entry_failure_policy: EntryFailurePolicy::Abort,
            user_agent: format!("newsreel/{}", env!("CARGO_PKG_VERSION")),
            database_path: None,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 7] = [
        "feed_url",
        "refresh_interval_minutes",
        "request_timeout_secs",
        "image_fetch_concurrency",
        "entry_failure_policy",
        "user_agent",
        "database_path",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Zero interval, timeout or concurrency → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
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
                // Race condition: file deleted between metadata and read
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
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(path = %path.display(), feed = %config.feed_url, "Loaded configuration");
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let must_be_positive = [
            ("refresh_interval_minutes", self.refresh_interval_minutes == 0),
            ("request_timeout_secs", self.request_timeout_secs == 0),
            ("image_fetch_concurrency", self.image_fetch_concurrency == 0),
        ];
        for (key, is_zero) in must_be_positive {
            if is_zero {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.feed_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "feed_url",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_minutes.saturating_mul(60))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ============================================================================
// Tests
// ============================================================================
