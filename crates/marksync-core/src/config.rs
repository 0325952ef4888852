//! Configuration module for marksync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for marksync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
    /// JSON file holding the persisted user settings.
    pub settings_file: PathBuf,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Local directory holding the bookmark files.
    pub local_dir: PathBuf,
    /// Root of the cloud container.
    pub container_root: PathBuf,
    /// Tracked file extension, without the leading dot.
    pub file_extension: String,
    /// Name used for initial synchronization conflict copies.
    /// Defaults to the host name when unset.
    pub device_name: Option<String>,
    /// Milliseconds of quiet before a burst of local changes is processed.
    pub debounce_ms: u64,
    /// Milliseconds between cloud container queries.
    pub cloud_poll_interval_ms: u64,
    /// Seconds between cloud availability checks.
    pub availability_check_interval_secs: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/marksync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        config_dir().join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("marksync")
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("marksync")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
            settings_file: config_dir().join("settings.json"),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_dir: data_dir().join("bookmarks"),
            container_root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("MarksyncCloud"),
            file_extension: "kml".to_string(),
            device_name: None,
            debounce_ms: 500,
            cloud_poll_interval_ms: 1000,
            availability_check_interval_secs: 30,
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
    /// Dotted path to the offending field, e.g. `"sync.debounce_ms"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ValidationError {
                field: field.into(),
                message,
            })
        };

        // --- sync ---
        let extension = &self.sync.file_extension;
        if extension.is_empty() {
            push("sync.file_extension", "must not be empty".into());
        } else if extension.starts_with('.') || extension.contains('/') {
            push(
                "sync.file_extension",
                format!("invalid extension '{extension}'; use the bare extension, e.g. 'kml'"),
            );
        }
        if let Some(device) = &self.sync.device_name {
            if device.trim().is_empty() || device.contains('/') {
                push(
                    "sync.device_name",
                    "must be a non-empty name without '/'".into(),
                );
            }
        }
        if self.sync.local_dir == self.sync.container_root {
            push(
                "sync.container_root",
                "must differ from sync.local_dir".into(),
            );
        }
        if self.sync.debounce_ms == 0 {
            push("sync.debounce_ms", "must be greater than 0".into());
        }
        if self.sync.cloud_poll_interval_ms == 0 {
            push("sync.cloud_poll_interval_ms", "must be greater than 0".into());
        }
        if self.sync.availability_check_interval_secs == 0 {
            push(
                "sync.availability_check_interval_secs",
                "must be greater than 0".into(),
            );
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            push(
                "logging.level",
                format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            );
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
/// use marksync_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .local_dir(PathBuf::from("/home/user/bookmarks"))
///     .container_root(PathBuf::from("/home/user/cloud"))
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

    pub fn local_dir(mut self, dir: PathBuf) -> Self {
        self.config.sync.local_dir = dir;
        self
    }

    pub fn container_root(mut self, root: PathBuf) -> Self {
        self.config.sync.container_root = root;
        self
    }

    pub fn file_extension(mut self, extension: impl Into<String>) -> Self {
        self.config.sync.file_extension = extension.into();
        self
    }

    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.config.sync.device_name = Some(name.into());
        self
    }

    pub fn debounce_ms(mut self, ms: u64) -> Self {
        self.config.sync.debounce_ms = ms;
        self
    }

    pub fn cloud_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.sync.cloud_poll_interval_ms = ms;
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

    pub fn settings_file(mut self, path: PathBuf) -> Self {
        self.config.settings_file = path;
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
        assert_eq!(cfg.sync.file_extension, "kml");
        assert_eq!(cfg.sync.debounce_ms, 500);
        assert_eq!(cfg.sync.cloud_poll_interval_ms, 1000);
        assert_eq!(cfg.sync.availability_check_interval_secs, 30);
        assert!(cfg.sync.device_name.is_none());
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
        assert!(cfg.settings_file.ends_with("marksync/settings.json"));
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
  local_dir: /tmp/marksync/local
  container_root: /tmp/marksync/cloud
  file_extension: kmz
  device_name: laptop
  debounce_ms: 250
  cloud_poll_interval_ms: 2000
  availability_check_interval_secs: 10
logging:
  level: debug
  json: true
settings_file: /tmp/marksync/settings.json
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.sync.local_dir, PathBuf::from("/tmp/marksync/local"));
        assert_eq!(cfg.sync.container_root, PathBuf::from("/tmp/marksync/cloud"));
        assert_eq!(cfg.sync.file_extension, "kmz");
        assert_eq!(cfg.sync.device_name.as_deref(), Some("laptop"));
        assert_eq!(cfg.sync.debounce_ms, 250);
        assert_eq!(cfg.sync.cloud_poll_interval_ms, 2000);
        assert_eq!(cfg.sync.availability_check_interval_secs, 10);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
        assert_eq!(cfg.settings_file, PathBuf::from("/tmp/marksync/settings.json"));
    }

    #[test]
    fn load_partial_yaml_fills_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"logging:\n  level: warn\n").unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.logging.level, "warn");
        assert!(!cfg.logging.json);
        assert_eq!(cfg.sync.debounce_ms, 500);
    }

    #[test]
    fn load_or_default_returns_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(cfg.sync.debounce_ms, 500);
    }

    #[test]
    fn load_returns_error_on_invalid_yaml() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"not: [valid: yaml: {{{").unwrap();
        tmp.flush().unwrap();

        assert!(Config::load(tmp.path()).is_err());
    }

    // -- Validation --

    #[test]
    fn validate_catches_bad_extension() {
        let mut cfg = Config::default();
        cfg.sync.file_extension = ".kml".into();
        assert!(cfg.validate().iter().any(|e| e.field == "sync.file_extension"));

        cfg.sync.file_extension = String::new();
        assert!(cfg.validate().iter().any(|e| e.field == "sync.file_extension"));
    }

    #[test]
    fn validate_catches_zero_intervals() {
        let mut cfg = Config::default();
        cfg.sync.debounce_ms = 0;
        cfg.sync.cloud_poll_interval_ms = 0;
        cfg.sync.availability_check_interval_secs = 0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "sync.debounce_ms"));
        assert!(errors.iter().any(|e| e.field == "sync.cloud_poll_interval_ms"));
        assert!(errors
            .iter()
            .any(|e| e.field == "sync.availability_check_interval_secs"));
    }

    #[test]
    fn validate_catches_same_directories() {
        let mut cfg = Config::default();
        cfg.sync.container_root = cfg.sync.local_dir.clone();
        assert!(cfg.validate().iter().any(|e| e.field == "sync.container_root"));
    }

    #[test]
    fn validate_catches_blank_device_name() {
        let mut cfg = Config::default();
        cfg.sync.device_name = Some("  ".into());
        assert!(cfg.validate().iter().any(|e| e.field == "sync.device_name"));
    }

    #[test]
    fn validate_catches_invalid_log_level() {
        let mut cfg = Config::default();
        cfg.logging.level = "verbose".into();
        assert!(cfg.validate().iter().any(|e| e.field == "logging.level"));
    }

    #[test]
    fn validate_accepts_all_valid_log_levels() {
        for level in VALID_LOG_LEVELS {
            let mut cfg = Config::default();
            cfg.logging.level = level.to_string();
            assert!(
                !cfg.validate().iter().any(|e| e.field == "logging.level"),
                "level '{level}' should be valid"
            );
        }
    }

    // -- Builder --

    #[test]
    fn builder_overrides_fields() {
        let cfg = ConfigBuilder::new()
            .local_dir(PathBuf::from("/a"))
            .container_root(PathBuf::from("/b"))
            .file_extension("gpx")
            .device_name("phone")
            .debounce_ms(10)
            .cloud_poll_interval_ms(20)
            .logging_level("trace")
            .logging_json(true)
            .settings_file(PathBuf::from("/c/settings.json"))
            .build();
        assert_eq!(cfg.sync.local_dir, PathBuf::from("/a"));
        assert_eq!(cfg.sync.container_root, PathBuf::from("/b"));
        assert_eq!(cfg.sync.file_extension, "gpx");
        assert_eq!(cfg.sync.device_name.as_deref(), Some("phone"));
        assert_eq!(cfg.sync.debounce_ms, 10);
        assert_eq!(cfg.sync.cloud_poll_interval_ms, 20);
        assert_eq!(cfg.logging.level, "trace");
        assert!(cfg.logging.json);
        assert_eq!(cfg.settings_file, PathBuf::from("/c/settings.json"));
    }

    #[test]
    fn builder_build_validated_fails_for_invalid_config() {
        let result = ConfigBuilder::new().debounce_ms(0).build_validated();
        let errors = result.unwrap_err();
        assert!(errors.iter().any(|e| e.field == "sync.debounce_ms"));
    }

    #[test]
    fn default_path_ends_with_config_yaml() {
        let path = Config::default_path();
        assert!(path.ends_with("marksync/config.yaml"));
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError {
            field: "sync.debounce_ms".into(),
            message: "must be greater than 0".into(),
        };
        assert_eq!(err.to_string(), "sync.debounce_ms: must be greater than 0");
    }
}
