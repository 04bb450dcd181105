//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/fieldtrack/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/fieldtrack/` (~/.config/fieldtrack/)
//! - Data: `$XDG_DATA_HOME/fieldtrack/` (~/.local/share/fieldtrack/)
//! - State/Logs: `$XDG_STATE_HOME/fieldtrack/` (~/.local/state/fieldtrack/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Sampling and retention thresholds
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Flush cadence and rejection policy
    #[serde(default)]
    pub sync: SyncConfig,

    /// Attendance service endpoint (optional)
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Route display settings
    #[serde(default)]
    pub display: DisplayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sampling, filtering and clustering thresholds.
///
/// Injected into [`crate::session::TrackingService`] at construction; runtime
/// changes go through `TrackingService::update_config`, which calls
/// [`TrackingConfig::validate`].
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TrackingConfig {
    /// Ordinary fixes less accurate than this (meters) are rejected
    #[serde(default = "default_max_accuracy")]
    pub max_accuracy_m: f64,

    /// Movement from the last accepted sample that always warrants a new one
    #[serde(default = "default_min_distance")]
    pub min_distance_m: f64,

    /// Heartbeat period while stationary
    #[serde(default = "default_min_dwell")]
    pub min_dwell_secs: u64,

    /// Ordinary samples allowed per cluster before stationary samples are dropped
    #[serde(default = "default_cluster_cap")]
    pub cluster_cap: usize,

    /// Distance within which a fix joins an existing cluster
    #[serde(default = "default_cluster_radius")]
    pub cluster_radius_m: f64,

    /// How long accepted samples stay in the cluster lookback
    #[serde(default = "default_cluster_window")]
    pub cluster_window_secs: u64,

    /// Sampling timer period
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    /// Upper bound on a single position request
    #[serde(default = "default_fix_timeout")]
    pub fix_timeout_secs: u64,

    /// Oldest cached fix the provider may hand back
    #[serde(default = "default_fix_max_age")]
    pub fix_max_age_secs: u64,

    /// Ask the provider for its most accurate mode
    #[serde(default = "default_true")]
    pub high_accuracy: bool,

    /// Consecutive provider failures before a degraded-tracking warning
    #[serde(default = "default_failure_threshold")]
    pub degraded_after_failures: u32,

    /// Consecutive write failures before a storage-health warning
    #[serde(default = "default_failure_threshold")]
    pub storage_warning_after_failures: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_accuracy_m: default_max_accuracy(),
            min_distance_m: default_min_distance(),
            min_dwell_secs: default_min_dwell(),
            cluster_cap: default_cluster_cap(),
            cluster_radius_m: default_cluster_radius(),
            cluster_window_secs: default_cluster_window(),
            sample_interval_secs: default_sample_interval(),
            fix_timeout_secs: default_fix_timeout(),
            fix_max_age_secs: default_fix_max_age(),
            high_accuracy: default_true(),
            degraded_after_failures: default_failure_threshold(),
            storage_warning_after_failures: default_failure_threshold(),
        }
    }
}

impl TrackingConfig {
    /// Validate thresholds, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let finite_positive = |v: f64| v.is_finite() && v > 0.0;

        if !finite_positive(self.max_accuracy_m) {
            return Err(Error::Config(
                "tracking.max_accuracy_m must be a positive number".to_string(),
            ));
        }
        if !finite_positive(self.min_distance_m) {
            return Err(Error::Config(
                "tracking.min_distance_m must be a positive number".to_string(),
            ));
        }
        if !finite_positive(self.cluster_radius_m) {
            return Err(Error::Config(
                "tracking.cluster_radius_m must be a positive number".to_string(),
            ));
        }
        if self.cluster_cap == 0 {
            return Err(Error::Config(
                "tracking.cluster_cap must be at least 1".to_string(),
            ));
        }
        if self.sample_interval_secs == 0 || self.fix_timeout_secs == 0 {
            return Err(Error::Config(
                "tracking.sample_interval_secs and tracking.fix_timeout_secs must be non-zero"
                    .to_string(),
            ));
        }
        if self.cluster_window_secs < self.min_dwell_secs {
            return Err(Error::Config(
                "tracking.cluster_window_secs must cover at least one dwell period".to_string(),
            ));
        }
        Ok(())
    }

    pub fn min_dwell(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_dwell_secs as i64)
    }

    pub fn cluster_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cluster_window_secs as i64)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn fix_timeout(&self) -> Duration {
        Duration::from_secs(self.fix_timeout_secs)
    }
}

fn default_max_accuracy() -> f64 {
    35.0
}

fn default_min_distance() -> f64 {
    8.0
}

fn default_min_dwell() -> u64 {
    25
}

fn default_cluster_cap() -> usize {
    3
}

fn default_cluster_radius() -> f64 {
    20.0
}

fn default_cluster_window() -> u64 {
    2 * 60 * 60
}

fn default_sample_interval() -> u64 {
    10
}

fn default_fix_timeout() -> u64 {
    10
}

fn default_fix_max_age() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Sync engine configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SyncConfig {
    /// Seconds between automatic flushes while a session is active
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Records loaded per store query while draining
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Extra attempts per record on transport failure within one flush
    #[serde(default = "default_sync_max_retries")]
    pub max_retries: usize,

    /// Stop retrying a record after this many explicit rejections.
    /// Absent means retry forever.
    #[serde(default)]
    pub abandon_after_rejections: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            page_size: default_page_size(),
            max_retries: default_sync_max_retries(),
            abandon_after_rejections: None,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(Error::Config(
                "sync.interval_secs must be non-zero".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(Error::Config("sync.page_size must be non-zero".to_string()));
        }
        if self.abandon_after_rejections == Some(0) {
            return Err(Error::Config(
                "sync.abandon_after_rejections must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_sync_interval() -> u64 {
    30
}

fn default_page_size() -> usize {
    100
}

fn default_sync_max_retries() -> usize {
    2
}

/// Attendance service configuration
///
/// When enabled, accepted samples are pushed to the service in addition to
/// being stored locally in SQLite.
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    /// Enable/disable remote sync
    #[serde(default)]
    pub enabled: bool,

    /// Service base URL (e.g., `https://erp.example.com`)
    pub server_url: Option<String>,

    /// Bearer token; the host is responsible for obtaining it
    pub api_key: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: None,
            api_key: None,
            timeout_secs: default_remote_timeout(),
        }
    }
}

impl RemoteConfig {
    /// Check if the remote is properly configured and enabled
    pub fn is_ready(&self) -> bool {
        self.enabled && self.server_url.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        match self.server_url.as_deref() {
            None => Err(Error::Config(
                "remote.server_url is required when remote is enabled".to_string(),
            )),
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => Err(
                Error::Config(format!("remote.server_url must be an http(s) URL, got {url}")),
            ),
            Some(_) if self.timeout_secs == 0 => Err(Error::Config(
                "remote.timeout_secs must be non-zero".to_string(),
            )),
            Some(_) => Ok(()),
        }
    }
}

fn default_remote_timeout() -> u64 {
    15
}

/// Route display configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DisplayConfig {
    /// Points closer than this are grouped when thinning a route
    #[serde(default = "default_display_proximity")]
    pub proximity_m: f64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            proximity_m: default_display_proximity(),
        }
    }
}

impl DisplayConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.proximity_m.is_finite() && self.proximity_m > 0.0) {
            return Err(Error::Config(
                "display.proximity_m must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_display_proximity() -> f64 {
    25.0
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.tracking.validate()?;
        self.sync.validate()?;
        self.remote.validate()?;
        self.display.validate()
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/fieldtrack/config.toml` (~/.config/fieldtrack/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("fieldtrack").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/fieldtrack/` (~/.local/share/fieldtrack/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("fieldtrack")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/fieldtrack/` (~/.local/state/fieldtrack/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("fieldtrack")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/fieldtrack/samples.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("samples.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/fieldtrack/fieldtrack.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("fieldtrack.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tracking.max_accuracy_m, 35.0);
        assert_eq!(config.tracking.min_distance_m, 8.0);
        assert_eq!(config.tracking.min_dwell_secs, 25);
        assert_eq!(config.tracking.cluster_cap, 3);
        assert_eq!(config.tracking.cluster_window_secs, 7200);
        assert_eq!(config.tracking.sample_interval_secs, 10);
        assert_eq!(config.sync.interval_secs, 30);
        assert!(config.sync.abandon_after_rejections.is_none());
        assert!(!config.remote.is_ready());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[tracking]
max_accuracy_m = 50.0
cluster_cap = 5

[sync]
interval_secs = 60
abandon_after_rejections = 10

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.tracking.max_accuracy_m, 50.0);
        assert_eq!(config.tracking.cluster_cap, 5);
        // Unspecified fields keep their defaults
        assert_eq!(config.tracking.min_distance_m, 8.0);
        assert_eq!(config.sync.interval_secs, 60);
        assert_eq!(config.sync.abandon_after_rejections, Some(10));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_tracking_validation() {
        assert!(TrackingConfig::default().validate().is_ok());

        let config = TrackingConfig {
            cluster_cap: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TrackingConfig {
            min_distance_m: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TrackingConfig {
            cluster_window_secs: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_display_proximity_validation() {
        assert!(DisplayConfig::default().validate().is_ok());

        for bad in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let config = DisplayConfig { proximity_m: bad };
            assert!(config.validate().is_err(), "{bad}");
        }

        let config: Config = toml::from_str("[display]\nproximity_m = -1.0\n").unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("display.proximity_m")));
    }

    #[test]
    fn test_remote_config_validation() {
        // Disabled config is always valid
        let config = RemoteConfig::default();
        assert!(config.validate().is_ok());

        // Enabled without a URL should fail
        let config = RemoteConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RemoteConfig {
            enabled: true,
            server_url: Some("erp.example.com".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RemoteConfig {
            enabled: true,
            server_url: Some("https://erp.example.com".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.is_ready());
    }

    #[test]
    fn test_parse_remote_config() {
        let toml = r#"
[remote]
enabled = true
server_url = "https://erp.example.com"
api_key = "secret"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.remote.enabled);
        assert_eq!(
            config.remote.server_url.as_deref(),
            Some("https://erp.example.com")
        );
        assert_eq!(config.remote.timeout_secs, 15);
        assert!(config.remote.is_ready());
    }

    #[test]
    fn test_sync_config_rejects_zero_abandon_threshold() {
        let config = SyncConfig {
            abandon_after_rejections: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
