//! Configuration module for the sync core.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, saving, validation, defaults, and a builder pattern for
//! programmatic use.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::domain::SyncTimeWindow;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub retry: RetryConfig,
    pub bandwidth: BandwidthConfig,
    pub conflicts: ConflictsConfig,
    pub offline: OfflineConfig,
    pub logging: LoggingConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory of the local replica.
    pub root: PathBuf,
    /// SQLite state database.
    pub database_path: PathBuf,
    /// Folders in scope; empty means the whole drive.
    pub selected_folders: Vec<String>,
    /// Glob patterns matched against file names; matches are never synced.
    pub exclude_patterns: Vec<String>,
    /// Maximum transfers running at once.
    pub max_concurrent_transfers: usize,
    /// Seconds between remote polling cycles.
    pub poll_interval: u64,
    /// Seconds before a single cloud call times out.
    pub transfer_timeout: u64,
}

/// Retry policy for retryable failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

/// Bandwidth limits and scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Bytes per second; `None` is unlimited.
    pub upload_limit: Option<u64>,
    /// Bytes per second; `None` is unlimited.
    pub download_limit: Option<u64>,
    /// Scale limits by measured network quality.
    pub enable_auto_throttling: bool,
    /// Hold transfers while on a metered link.
    pub pause_on_metered_connection: bool,
    /// Halve the effective limits.
    pub power_saving: bool,
    /// Periods when transfers may run; empty means always.
    pub sync_windows: Vec<SyncTimeWindow>,
}

/// Conflict resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictsConfig {
    /// Default strategy: `ask_user`, `keep_local`, `keep_remote`, or `keep_both`.
    pub default_strategy: String,
    /// Per-pattern overrides, first match wins.
    pub rules: Vec<ConflictRuleConfig>,
}

/// A glob pattern mapped to a conflict strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRuleConfig {
    pub pattern: String,
    pub strategy: String,
}

/// Offline ("available offline") cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub max_cache_size_mb: u64,
    /// Run cleanup when usage crosses `cleanup_threshold`.
    pub auto_cleanup: bool,
    /// Fraction of `max_cache_size_mb` (0.0-1.0).
    pub cleanup_threshold: f64,
    /// Entries untouched this long may be evicted.
    pub eviction_age_days: u32,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Loading and saving
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Write the configuration as YAML, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config")?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/cloudsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("cloudsync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("cloudsync");
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("CloudSync"),
            database_path: data_dir.join("state.db"),
            selected_folders: Vec::new(),
            exclude_patterns: vec![
                ".DS_Store".to_string(),
                "*.tmp".to_string(),
                "Thumbs.db".to_string(),
            ],
            max_concurrent_transfers: 4,
            poll_interval: 30,
            transfer_timeout: 300,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 1,
            max_delay_secs: 60,
        }
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            upload_limit: None,
            download_limit: None,
            enable_auto_throttling: true,
            pause_on_metered_connection: true,
            power_saving: false,
            sync_windows: Vec::new(),
        }
    }
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            default_strategy: "ask_user".to_string(),
            rules: Vec::new(),
        }
    }
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_cache_size_mb: 10 * 1024,
            auto_cleanup: true,
            cleanup_threshold: 0.8,
            eviction_age_days: 7,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.poll_interval"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for conflict strategies.
pub const VALID_CONFLICT_STRATEGIES: &[&str] =
    &["ask_user", "keep_local", "keep_remote", "keep_both"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        if self.sync.poll_interval == 0 {
            errors.push(ValidationError::new("sync.poll_interval", "must be greater than 0"));
        }
        if self.sync.transfer_timeout == 0 {
            errors.push(ValidationError::new(
                "sync.transfer_timeout",
                "must be greater than 0",
            ));
        }
        if self.sync.max_concurrent_transfers == 0 || self.sync.max_concurrent_transfers > 64 {
            errors.push(ValidationError::new(
                "sync.max_concurrent_transfers",
                "must be in range 1..=64",
            ));
        }
        for (i, folder) in self.sync.selected_folders.iter().enumerate() {
            if !folder.starts_with('/') {
                errors.push(ValidationError::new(
                    format!("sync.selected_folders[{i}]"),
                    format!("must be an absolute scope path: {folder}"),
                ));
            }
        }
        for (i, pattern) in self.sync.exclude_patterns.iter().enumerate() {
            if let Err(e) = glob::Pattern::new(pattern) {
                errors.push(ValidationError::new(
                    format!("sync.exclude_patterns[{i}]"),
                    format!("invalid glob '{pattern}': {e}"),
                ));
            }
        }

        // --- retry ---
        if self.retry.max_attempts == 0 {
            errors.push(ValidationError::new("retry.max_attempts", "must be greater than 0"));
        }
        if self.retry.base_delay_secs == 0 {
            errors.push(ValidationError::new(
                "retry.base_delay_secs",
                "must be greater than 0",
            ));
        }
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            errors.push(ValidationError::new(
                "retry.max_delay_secs",
                format!(
                    "max_delay_secs ({}) must not be less than base_delay_secs ({})",
                    self.retry.max_delay_secs, self.retry.base_delay_secs
                ),
            ));
        }

        // --- bandwidth ---
        if self.bandwidth.upload_limit == Some(0) {
            errors.push(ValidationError::new(
                "bandwidth.upload_limit",
                "must be greater than 0 (use null for unlimited)",
            ));
        }
        if self.bandwidth.download_limit == Some(0) {
            errors.push(ValidationError::new(
                "bandwidth.download_limit",
                "must be greater than 0 (use null for unlimited)",
            ));
        }
        for (i, window) in self.bandwidth.sync_windows.iter().enumerate() {
            if window.name.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("bandwidth.sync_windows[{i}].name"),
                    "must not be empty",
                ));
            }
            if window.start == window.end {
                errors.push(ValidationError::new(
                    format!("bandwidth.sync_windows[{i}]"),
                    "start and end must differ",
                ));
            }
        }

        // --- conflicts ---
        if !VALID_CONFLICT_STRATEGIES.contains(&self.conflicts.default_strategy.as_str()) {
            errors.push(ValidationError::new(
                "conflicts.default_strategy",
                format!(
                    "invalid strategy '{}'; valid options: {}",
                    self.conflicts.default_strategy,
                    VALID_CONFLICT_STRATEGIES.join(", ")
                ),
            ));
        }
        for (i, rule) in self.conflicts.rules.iter().enumerate() {
            if let Err(e) = glob::Pattern::new(&rule.pattern) {
                errors.push(ValidationError::new(
                    format!("conflicts.rules[{i}].pattern"),
                    format!("invalid glob '{}': {e}", rule.pattern),
                ));
            }
            if !VALID_CONFLICT_STRATEGIES.contains(&rule.strategy.as_str()) {
                errors.push(ValidationError::new(
                    format!("conflicts.rules[{i}].strategy"),
                    format!("invalid strategy '{}'", rule.strategy),
                ));
            }
        }

        // --- offline ---
        if self.offline.max_cache_size_mb == 0 {
            errors.push(ValidationError::new(
                "offline.max_cache_size_mb",
                "must be greater than 0",
            ));
        }
        if !(self.offline.cleanup_threshold > 0.0 && self.offline.cleanup_threshold <= 1.0) {
            errors.push(ValidationError::new(
                "offline.cleanup_threshold",
                "must be in range (0.0, 1.0]",
            ));
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError::new(
                "logging.level",
                format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            ));
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use cloudsync_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .sync_root(PathBuf::from("/home/user/CloudSync"))
///     .sync_poll_interval(60)
///     .bandwidth_upload_limit(Some(512 * 1024))
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_root(mut self, root: PathBuf) -> Self {
        self.config.sync.root = root;
        self
    }

    pub fn sync_database_path(mut self, path: PathBuf) -> Self {
        self.config.sync.database_path = path;
        self
    }

    pub fn sync_selected_folders(mut self, folders: Vec<String>) -> Self {
        self.config.sync.selected_folders = folders;
        self
    }

    pub fn sync_exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.sync.exclude_patterns = patterns;
        self
    }

    pub fn sync_max_concurrent_transfers(mut self, n: usize) -> Self {
        self.config.sync.max_concurrent_transfers = n;
        self
    }

    pub fn sync_poll_interval(mut self, seconds: u64) -> Self {
        self.config.sync.poll_interval = seconds;
        self
    }

    pub fn sync_transfer_timeout(mut self, seconds: u64) -> Self {
        self.config.sync.transfer_timeout = seconds;
        self
    }

    // --- retry ---

    pub fn retry_max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n;
        self
    }

    pub fn retry_delays(mut self, base_secs: u64, max_secs: u64) -> Self {
        self.config.retry.base_delay_secs = base_secs;
        self.config.retry.max_delay_secs = max_secs;
        self
    }

    // --- bandwidth ---

    pub fn bandwidth_upload_limit(mut self, limit: Option<u64>) -> Self {
        self.config.bandwidth.upload_limit = limit;
        self
    }

    pub fn bandwidth_download_limit(mut self, limit: Option<u64>) -> Self {
        self.config.bandwidth.download_limit = limit;
        self
    }

    pub fn bandwidth_auto_throttling(mut self, enabled: bool) -> Self {
        self.config.bandwidth.enable_auto_throttling = enabled;
        self
    }

    pub fn bandwidth_pause_on_metered(mut self, enabled: bool) -> Self {
        self.config.bandwidth.pause_on_metered_connection = enabled;
        self
    }

    pub fn bandwidth_power_saving(mut self, enabled: bool) -> Self {
        self.config.bandwidth.power_saving = enabled;
        self
    }

    pub fn bandwidth_sync_window(mut self, window: SyncTimeWindow) -> Self {
        self.config.bandwidth.sync_windows.push(window);
        self
    }

    // --- conflicts ---

    pub fn conflicts_default_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.config.conflicts.default_strategy = strategy.into();
        self
    }

    pub fn conflicts_rule(mut self, pattern: impl Into<String>, strategy: impl Into<String>) -> Self {
        self.config.conflicts.rules.push(ConflictRuleConfig {
            pattern: pattern.into(),
            strategy: strategy.into(),
        });
        self
    }

    // --- offline ---

    pub fn offline_max_cache_size_mb(mut self, mb: u64) -> Self {
        self.config.offline.max_cache_size_mb = mb;
        self
    }

    pub fn offline_cleanup_threshold(mut self, threshold: f64) -> Self {
        self.config.offline.cleanup_threshold = threshold;
        self
    }

    pub fn offline_eviction_age_days(mut self, days: u32) -> Self {
        self.config.offline.eviction_age_days = days;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    // -- Defaults --

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.poll_interval, 30);
        assert_eq!(cfg.sync.transfer_timeout, 300);
        assert_eq!(cfg.sync.max_concurrent_transfers, 4);
        assert_eq!(
            cfg.sync.exclude_patterns,
            vec![".DS_Store", "*.tmp", "Thumbs.db"]
        );
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.max_delay_secs, 60);
        assert!(cfg.bandwidth.upload_limit.is_none());
        assert!(cfg.bandwidth.enable_auto_throttling);
        assert!(cfg.bandwidth.pause_on_metered_connection);
        assert!(!cfg.bandwidth.power_saving);
        assert_eq!(cfg.conflicts.default_strategy, "ask_user");
        assert_eq!(cfg.offline.max_cache_size_mb, 10240);
        assert_eq!(cfg.offline.cleanup_threshold, 0.8);
        assert_eq!(cfg.offline.eviction_age_days, 7);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn default_config_passes_validation() {
        let errors = Config::default().validate();
        assert!(errors.is_empty(), "unexpected validation errors: {errors:?}");
    }

    // -- Loading --

    #[test]
    fn load_from_yaml_file() {
        let yaml = r#"
sync:
  root: /tmp/test-cloudsync
  selected_folders: ["/Documents", "/Photos"]
  max_concurrent_transfers: 2
  poll_interval: 60
retry:
  max_attempts: 5
bandwidth:
  upload_limit: 1048576
  download_limit: null
  sync_windows:
    - name: nightly
      start: "22:00"
      end: "06:00"
      days: [mon, tue]
conflicts:
  default_strategy: keep_both
  rules:
    - pattern: "*.docx"
      strategy: keep_local
offline:
  cleanup_threshold: 0.5
logging:
  level: debug
  json: true
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.sync.root, PathBuf::from("/tmp/test-cloudsync"));
        assert_eq!(cfg.sync.selected_folders, vec!["/Documents", "/Photos"]);
        assert_eq!(cfg.sync.max_concurrent_transfers, 2);
        assert_eq!(cfg.sync.transfer_timeout, 300, "missing fields use defaults");
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.bandwidth.upload_limit, Some(1_048_576));
        assert_eq!(cfg.bandwidth.download_limit, None);
        assert_eq!(cfg.bandwidth.sync_windows.len(), 1);
        assert_eq!(cfg.bandwidth.sync_windows[0].start.to_string(), "22:00");
        assert!(cfg.bandwidth.sync_windows[0].enabled);
        assert_eq!(cfg.conflicts.default_strategy, "keep_both");
        assert_eq!(cfg.conflicts.rules[0].pattern, "*.docx");
        assert_eq!(cfg.offline.cleanup_threshold, 0.5);
        assert!(cfg.logging.json);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_or_default_returns_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(cfg.sync.poll_interval, 30);
    }

    #[test]
    fn load_returns_error_on_invalid_yaml() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"not: [valid: yaml: {{{").unwrap();
        tmp.flush().unwrap();

        assert!(Config::load(tmp.path()).is_err());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let cfg = ConfigBuilder::new()
            .sync_poll_interval(90)
            .conflicts_rule("*.psd", "keep_both")
            .build();

        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.sync.poll_interval, 90);
        assert_eq!(loaded.conflicts.rules, cfg.conflicts.rules);
    }

    // -- Validation --

    #[test]
    fn validate_catches_zero_values() {
        let cfg = ConfigBuilder::new()
            .sync_poll_interval(0)
            .sync_transfer_timeout(0)
            .sync_max_concurrent_transfers(0)
            .retry_max_attempts(0)
            .offline_max_cache_size_mb(0)
            .build();
        let fields: Vec<_> = cfg.validate().into_iter().map(|e| e.field).collect();
        for expected in [
            "sync.poll_interval",
            "sync.transfer_timeout",
            "sync.max_concurrent_transfers",
            "retry.max_attempts",
            "offline.max_cache_size_mb",
        ] {
            assert!(fields.iter().any(|f| f == expected), "missing {expected}");
        }
    }

    #[test]
    fn validate_catches_inverted_retry_delays() {
        let cfg = ConfigBuilder::new().retry_delays(10, 5).build();
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.field == "retry.max_delay_secs"));
    }

    #[test]
    fn validate_catches_zero_bandwidth_limit() {
        let cfg = ConfigBuilder::new().bandwidth_upload_limit(Some(0)).build();
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.field == "bandwidth.upload_limit"));
    }

    #[test]
    fn validate_catches_invalid_strategies_and_patterns() {
        let cfg = ConfigBuilder::new()
            .conflicts_default_strategy("merge")
            .conflicts_rule("[", "keep_local")
            .conflicts_rule("*.txt", "newest")
            .build();
        let fields: Vec<_> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert!(fields.contains(&"conflicts.default_strategy".to_string()));
        assert!(fields.contains(&"conflicts.rules[0].pattern".to_string()));
        assert!(fields.contains(&"conflicts.rules[1].strategy".to_string()));
    }

    #[test]
    fn validate_catches_relative_selected_folder() {
        let cfg = ConfigBuilder::new()
            .sync_selected_folders(vec!["Documents".into()])
            .build();
        assert!(cfg
            .validate()
            .iter()
            .any(|e| e.field == "sync.selected_folders[0]"));
    }

    #[test]
    fn validate_catches_bad_cleanup_threshold() {
        for threshold in [0.0, 1.5, -0.1] {
            let cfg = ConfigBuilder::new().offline_cleanup_threshold(threshold).build();
            assert!(cfg
                .validate()
                .iter()
                .any(|e| e.field == "offline.cleanup_threshold"));
        }
    }

    #[test]
    fn validate_accepts_all_valid_conflict_strategies() {
        for strategy in VALID_CONFLICT_STRATEGIES {
            let cfg = ConfigBuilder::new().conflicts_default_strategy(*strategy).build();
            assert!(cfg.validate().is_empty(), "{strategy} should be valid");
        }
    }

    #[test]
    fn validate_catches_invalid_log_level() {
        let cfg = ConfigBuilder::new().logging_level("verbose").build();
        assert!(cfg.validate().iter().any(|e| e.field == "logging.level"));
    }

    // -- Builder --

    #[test]
    fn builder_build_validated_fails_for_invalid_config() {
        let result = ConfigBuilder::new().sync_poll_interval(0).build_validated();
        assert!(result.is_err());
        assert!(ConfigBuilder::new().build_validated().is_ok());
    }

    #[test]
    fn default_path_ends_with_config_yaml() {
        let path = Config::default_path();
        assert!(path.ends_with("cloudsync/config.yaml"));
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError::new("sync.poll_interval", "must be greater than 0");
        assert_eq!(err.to_string(), "sync.poll_interval: must be greater than 0");
    }
}
