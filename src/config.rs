//! Configuration file parser for ~/.config/feedstash/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Every section and key uses `#[serde(default)]`, so any subset can be given.
//! Unknown keys are accepted but logged as warnings.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

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

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration, one struct per TOML section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub rate_limit: RateLimitConfig,
    pub fetch: FetchConfig,
    pub storage: StorageConfig,
}

/// `[sync]`: job scheduling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts per job before it becomes permanently failed.
    pub max_retries: u32,
    /// Accepted for compatibility; jobs always run one at a time.
    pub max_concurrent_jobs: u32,
    /// Base delay for job-level and fetch-level exponential backoff.
    pub retry_backoff_ms: u64,
    /// Jobs enqueued longer ago than this are pruned whatever their status.
    pub job_max_age_secs: u64,
    /// Apply staged items without confirmation when a feed has none applied yet.
    pub auto_apply_initial: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_concurrent_jobs: 1,
            retry_backoff_ms: 1_000,
            job_max_age_secs: 24 * 60 * 60,
            auto_apply_initial: true,
        }
    }
}

impl SyncConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// `[rate_limit]`: client-side request budget.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window_secs: u64,
    pub min_interval_ms: u64,
    /// Extra wait past the window reset before retrying an exhausted budget.
    pub reset_margin_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 100,
            window_secs: 600,
            min_interval_ms: 1_000,
            reset_margin_ms: 1_000,
        }
    }
}

/// `[fetch]`: remote listing endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Items requested per listing.
    pub item_limit: u32,
    pub timeout_secs: u64,
    /// In-job retries for transient errors, further capped by the rate budget.
    pub fetch_retries: u32,
    /// Preferred image width band, inclusive.
    pub media_min_width: u32,
    pub media_max_width: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.reddit.com".to_string(),
            user_agent: concat!("feedstash/", env!("CARGO_PKG_VERSION")).to_string(),
            item_limit: 25,
            timeout_secs: 10,
            fetch_retries: 2,
            media_min_width: 320,
            media_max_width: 960,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[storage]`: snapshot budget and eviction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Hard ceiling on the snapshot size, whatever the disk reports.
    pub max_store_bytes: u64,
    /// Occupied/quota ratio at which threshold eviction kicks in.
    pub eviction_threshold: f64,
    /// Share of the primary feed removed by one threshold eviction.
    pub eviction_fraction: f64,
    /// Unpinned items older than this are dropped on load and after apply.
    pub max_item_age_days: u64,
    /// Debounce window for snapshot writes.
    pub flush_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: 50 * 1024 * 1024,
            eviction_threshold: 0.9,
            eviction_fraction: 0.2,
            max_item_age_days: 30,
            flush_delay_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn max_item_age_secs(&self) -> i64 {
        i64::try_from(self.max_item_age_days.saturating_mul(24 * 60 * 60)).unwrap_or(i64::MAX)
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [(&'static str, &'static [&'static str]); 4] = [
        (
            "sync",
            &[
                "max_retries",
                "max_concurrent_jobs",
                "retry_backoff_ms",
                "job_max_age_secs",
                "auto_apply_initial",
            ],
        ),
        (
            "rate_limit",
            &[
                "requests_per_window",
                "window_secs",
                "min_interval_ms",
                "reset_margin_ms",
            ],
        ),
        (
            "fetch",
            &[
                "base_url",
                "user_agent",
                "item_limit",
                "timeout_secs",
                "fetch_retries",
                "media_min_width",
                "media_max_width",
            ],
        ),
        (
            "storage",
            &[
                "max_store_bytes",
                "eviction_threshold",
                "eviction_fraction",
                "max_item_age_days",
                "flush_delay_ms",
            ],
        ),
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
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
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            Self::warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        if config.sync.max_concurrent_jobs > 1 {
            tracing::warn!(
                max_concurrent_jobs = config.sync.max_concurrent_jobs,
                "Concurrent jobs are not supported, jobs run one at a time"
            );
        }
        tracing::debug!(?config, "Loaded configuration");
        Ok(config)
    }

    /// Reject values that would stall or disable the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key, reason: &str| {
            Err(ConfigError::Invalid {
                key,
                reason: reason.to_string(),
            })
        };
        if self.rate_limit.requests_per_window == 0 {
            return invalid("rate_limit.requests_per_window", "must be at least 1");
        }
        if self.rate_limit.window_secs == 0 {
            return invalid("rate_limit.window_secs", "must be at least 1");
        }
        let fraction = self.storage.eviction_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return invalid("storage.eviction_fraction", "must be in (0, 1]");
        }
        if self.fetch.media_min_width > self.fetch.media_max_width {
            return invalid(
                "fetch.media_min_width",
                "must not exceed fetch.media_max_width",
            );
        }
        Ok(())
    }

    fn warn_unknown_keys(raw: &toml::Table) {
        for (section, value) in raw {
            let Some((_, keys)) = Self::KNOWN_KEYS.iter().find(|(name, _)| *name == section.as_str()) else {
                tracing::warn!(section = %section, "Unknown section in config file, ignoring");
                continue;
            };
            if let Some(table) = value.as_table() {
                for key in table.keys() {
                    if !keys.contains(&key.as_str()) {
                        tracing::warn!(section = %section, key = %key, "Unknown key in config file, ignoring");
                    }
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sync.max_retries, 3);
        assert!(config.sync.auto_apply_initial);
        assert_eq!(config.rate_limit.requests_per_window, 100);
        assert_eq!(config.fetch.item_limit, 25);
        assert_eq!(config.storage.eviction_threshold, 0.9);
        assert_eq!(config.storage.max_item_age_secs(), 30 * 86_400);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.sync.max_retries, 3);
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (_dir, path) = write_config("   \n  \n  ");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.fetch.timeout_secs, 10);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let (_dir, path) = write_config("[sync]\nmax_retries = 5\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.sync.retry_backoff_ms, 1_000);
        assert_eq!(config.rate_limit.window_secs, 600);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
[sync]
max_retries = 4
max_concurrent_jobs = 1
retry_backoff_ms = 250
job_max_age_secs = 3600
auto_apply_initial = false

[rate_limit]
requests_per_window = 60
window_secs = 60
min_interval_ms = 500
reset_margin_ms = 200

[fetch]
base_url = "http://localhost:8080"
user_agent = "test-agent"
item_limit = 50
timeout_secs = 3
fetch_retries = 1
media_min_width = 200
media_max_width = 700

[storage]
max_store_bytes = 1048576
eviction_threshold = 0.8
eviction_fraction = 0.25
max_item_age_days = 7
flush_delay_ms = 100
"#;
        let (_dir, path) = write_config(content);
        let config = Config::load(&path).unwrap();
        assert_eq!(config.sync.max_retries, 4);
        assert!(!config.sync.auto_apply_initial);
        assert_eq!(config.rate_limit.min_interval_ms, 500);
        assert_eq!(config.fetch.base_url, "http://localhost:8080");
        assert_eq!(config.fetch.timeout(), Duration::from_secs(3));
        assert_eq!(config.storage.eviction_fraction, 0.25);
        assert_eq!(config.storage.max_item_age_secs(), 7 * 86_400);
    }

    #[test]
    fn test_degenerate_values_rejected() {
        let cases = [
            ("[rate_limit]\nrequests_per_window = 0\n", "rate_limit.requests_per_window"),
            ("[rate_limit]\nwindow_secs = 0\n", "rate_limit.window_secs"),
            ("[storage]\neviction_fraction = 0.0\n", "storage.eviction_fraction"),
            ("[storage]\neviction_fraction = 1.5\n", "storage.eviction_fraction"),
            ("[storage]\neviction_fraction = -0.2\n", "storage.eviction_fraction"),
            (
                "[fetch]\nmedia_min_width = 800\nmedia_max_width = 400\n",
                "fetch.media_min_width",
            ),
        ];
        for (content, expected) in cases {
            match Config::parse(content) {
                Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, expected, "{content}"),
                other => panic!("expected {expected} to be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_boundary_values_accepted() {
        let content = "[storage]\neviction_fraction = 1.0\n\n[fetch]\nmedia_min_width = 640\nmedia_max_width = 640\n\n[rate_limit]\nrequests_per_window = 1\nwindow_secs = 1\n";
        let config = Config::parse(content).unwrap();
        assert_eq!(config.storage.eviction_fraction, 1.0);
        assert_eq!(config.rate_limit.requests_per_window, 1);
        assert!(Config::default().validate().is_ok());
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
        let (_dir, path) = write_config("[sync]\nmax_retries = \"three\"\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let content = r#"
theme = "dark"

[sync]
max_retries = 2
totally_fake_key = "should not fail"
"#;
        let (_dir, path) = write_config(content);
        let config = Config::load(&path).unwrap();
        assert_eq!(config.sync.max_retries, 2);
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (_dir, path) = write_config(&"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_concurrent_jobs_setting_still_parses() {
        let config = Config::parse("[sync]\nmax_concurrent_jobs = 8\n").unwrap();
        assert_eq!(config.sync.max_concurrent_jobs, 8);
    }
}
