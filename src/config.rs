//! Configuration file parser for ~/.config/relayfeed/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{RelayFormat, DEFAULT_RELAY_TIMEOUT};
use crate::storage::{DISPLAY_LIMIT, MAX_ITEMS_PER_FEED, SUMMARY_MAX_CHARS};

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

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// One `[[relays]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelayConfig {
    pub name: String,
    /// URL prefix or `{url}` template; absent means fetch the feed directly.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub format: RelayFormat,
}

impl RelayConfig {
    fn new(name: &str, endpoint: &str, format: RelayFormat) -> Self {
        Self {
            name: name.to_string(),
            endpoint: Some(endpoint.to_string()),
            format,
        }
    }
}

/// The public relays tried, in order, when the config names none.
pub fn default_relays() -> Vec<RelayConfig> {
    vec![
        RelayConfig::new(
            "allorigins",
            "https://api.allorigins.win/get?url=",
            RelayFormat::Envelope,
        ),
        RelayConfig::new("corsproxy", "https://corsproxy.io/?", RelayFormat::Raw),
        RelayConfig::new(
            "codetabs",
            "https://api.codetabs.com/v1/proxy?quest=",
            RelayFormat::Raw,
        ),
    ]
}

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage key the reader state is saved under.
    pub store_key: String,

    /// Where `<store_key>.json` lives; defaults to the config directory.
    pub data_dir: Option<PathBuf>,

    pub relay_timeout_secs: u64,

    /// `refresh --stale` skips feeds fetched more recently than this.
    pub stale_after_minutes: u64,

    pub max_items_per_feed: usize,

    /// Items shown per category listing.
    pub display_limit: usize,

    pub summary_max_chars: usize,

    pub relays: Vec<RelayConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_key: "rss_reader_data".to_string(),
            data_dir: None,
            relay_timeout_secs: DEFAULT_RELAY_TIMEOUT.as_secs(),
            stale_after_minutes: 30,
            max_items_per_feed: MAX_ITEMS_PER_FEED,
            display_limit: DISPLAY_LIMIT,
            summary_max_chars: SUMMARY_MAX_CHARS,
            relays: default_relays(),
        }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 8] = [
        "store_key",
        "data_dir",
        "relay_timeout_secs",
        "stale_after_minutes",
        "max_items_per_feed",
        "display_limit",
        "summary_max_chars",
        "relays",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Zero timeout or per-feed cap → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading.
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
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            relays = config.relays.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.relay_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "relay_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.max_items_per_feed == 0 {
            return Err(ConfigError::Invalid(
                "max_items_per_feed must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_minutes.saturating_mul(60))
    }
}

// ============================================================================
// Tests
// ============================================================================
