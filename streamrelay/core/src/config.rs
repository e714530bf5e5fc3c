//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, from an optional TOML
//! file at `~/.config/streamrelay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [pipe]
//! chunk_size = 4096
//! teardown_on_error = true
//!
//! [writer]
//! max_stalled_writes = 32
//!
//! [run_loop]
//! poll_interval_ms = 100
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipe::PipeConfig;

/// Largest accepted chunk size (1 MiB)
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
///
/// Records the highest-priority layer that changed anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[pipe]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeToml {
    /// Bytes read per readable event
    pub chunk_size: Option<usize>,

    /// Tear the pipe down on errors
    pub teardown_on_error: Option<bool>,
}

/// `[writer]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterToml {
    /// Consecutive no-progress writes before abandoning
    pub max_stalled_writes: Option<u32>,
}

/// `[run_loop]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunLoopToml {
    /// Longest a single poll waits, in milliseconds
    pub poll_interval_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Pipe section
    pub pipe: PipeToml,

    /// Writer section
    pub writer: WriterToml,

    /// Run loop section
    pub run_loop: RunLoopToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Settings for a polling run loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunLoopConfig {
    /// Longest a single poll waits before the stop flag is rechecked
    pub poll_interval: Duration,
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Resolved relay configuration
///
/// Use [`load_config`] to load with proper priority handling.
#[derive(Clone, Debug)]
pub struct RelayConfigFile {
    /// Pipe settings, including the writer's
    pub pipe: PipeConfig,

    /// Run loop settings
    pub run_loop: RunLoopConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for RelayConfigFile {
    fn default() -> Self {
        Self {
            pipe: PipeConfig::default(),
            run_loop: RunLoopConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfigFile {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check every value is usable
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunk_size = self.pipe.chunk_size;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {chunk_size}"
            )));
        }
        if self.pipe.writer.max_stalled_writes == 0 {
            return Err(ConfigError::ValidationError(
                "max_stalled_writes must be at least 1".to_string(),
            ));
        }
        if self.run_loop.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/streamrelay/relay.toml` or the platform
/// equivalent.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("streamrelay").join("relay.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<RelayConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfigFile, ConfigError> {
    let mut config = RelayConfigFile::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);

    Ok(config)
}

fn apply_toml_config(config: &mut RelayConfigFile, toml: &RelayToml) {
    if let Some(size) = toml.pipe.chunk_size {
        config.pipe.chunk_size = size;
    }
    if let Some(teardown) = toml.pipe.teardown_on_error {
        config.pipe.teardown_on_error = teardown;
    }
    if let Some(max) = toml.writer.max_stalled_writes {
        config.pipe.writer.max_stalled_writes = max;
    }
    if let Some(ms) = toml.run_loop.poll_interval_ms {
        config.run_loop.poll_interval = Duration::from_millis(ms);
    }
}

fn apply_env_config(config: &mut RelayConfigFile) {
    if let Ok(size) = std::env::var("STREAMRELAY_CHUNK_SIZE") {
        if let Ok(n) = size.parse::<usize>() {
            config.pipe.chunk_size = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(teardown) = std::env::var("STREAMRELAY_TEARDOWN_ON_ERROR") {
        config.pipe.teardown_on_error = teardown != "0" && teardown.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
    if let Ok(max) = std::env::var("STREAMRELAY_MAX_STALLED_WRITES") {
        if let Ok(n) = max.parse::<u32>() {
            config.pipe.writer.max_stalled_writes = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(interval) = std::env::var("STREAMRELAY_POLL_INTERVAL_MS") {
        if let Ok(ms) = interval.parse::<u64>() {
            config.run_loop.poll_interval = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Chunk size override
    pub chunk_size: Option<usize>,

    /// Teardown-on-error override
    pub teardown_on_error: Option<bool>,

    /// Stalled write limit override
    pub max_stalled_writes: Option<u32>,

    /// Poll interval override (milliseconds)
    pub poll_interval_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set chunk size override
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    /// Set teardown-on-error override
    #[must_use]
    pub fn with_teardown_on_error(mut self, teardown: bool) -> Self {
        self.teardown_on_error = Some(teardown);
        self
    }

    /// Set stalled write limit override
    #[must_use]
    pub fn with_max_stalled_writes(mut self, max: u32) -> Self {
        self.max_stalled_writes = Some(max);
        self
    }

    /// Set poll interval override
    #[must_use]
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = Some(ms);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfigFile) {
        if self.chunk_size.is_some()
            || self.teardown_on_error.is_some()
            || self.max_stalled_writes.is_some()
            || self.poll_interval_ms.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(size) = self.chunk_size {
            config.pipe.chunk_size = size;
        }
        if let Some(teardown) = self.teardown_on_error {
            config.pipe.teardown_on_error = teardown;
        }
        if let Some(max) = self.max_stalled_writes {
            config.pipe.writer.max_stalled_writes = max;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.run_loop.poll_interval = Duration::from_millis(ms);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // Env-dependent assertions live in tests/config_env.rs, which runs in
    // its own process; these tests only read files and defaults.

    #[test]
    fn test_default_config() {
        let config = RelayConfigFile::default();

        assert_eq!(config.pipe.chunk_size, 512);
        assert!(!config.pipe.teardown_on_error);
        assert_eq!(config.pipe.writer.max_stalled_writes, 16);
        assert_eq!(config.run_loop.poll_interval, Duration::from_millis(250));
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("streamrelay"));
            assert!(p.to_string_lossy().ends_with("relay.toml"));
        }
    }

    #[test]
    fn test_apply_toml_sections() {
        let toml_config: RelayToml = toml::from_str(
            r#"
[pipe]
chunk_size = 4096
teardown_on_error = true

[writer]
max_stalled_writes = 32

[run_loop]
poll_interval_ms = 100
"#,
        )
        .unwrap();

        let mut config = RelayConfigFile::default();
        apply_toml_config(&mut config, &toml_config);

        assert_eq!(config.pipe.chunk_size, 4096);
        assert!(config.pipe.teardown_on_error);
        assert_eq!(config.pipe.writer.max_stalled_writes, 32);
        assert_eq!(config.run_loop.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml_config: RelayToml = toml::from_str("[writer]\nmax_stalled_writes = 4\n").unwrap();

        let mut config = RelayConfigFile::default();
        apply_toml_config(&mut config, &toml_config);

        assert_eq!(config.pipe.chunk_size, 512);
        assert_eq!(config.pipe.writer.max_stalled_writes, 4);
    }

    #[test]
    fn test_empty_toml() {
        let toml_config: RelayToml = toml::from_str("").unwrap();
        assert!(toml_config.pipe.chunk_size.is_none());
        assert!(toml_config.run_loop.poll_interval_ms.is_none());
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[pipe\nchunk_size = ").unwrap();

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[pipe]\nchunk_size = \"big\"\n").unwrap();

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/streamrelay/relay.toml")))
                .unwrap();
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_overrides_apply_last() {
        let mut config = RelayConfigFile::default();
        config.set_source(ConfigSource::File);

        ConfigOverrides::new()
            .with_chunk_size(64)
            .with_teardown_on_error(true)
            .with_max_stalled_writes(2)
            .with_poll_interval_ms(10)
            .apply(&mut config);

        assert_eq!(config.pipe.chunk_size, 64);
        assert!(config.pipe.teardown_on_error);
        assert_eq!(config.pipe.writer.max_stalled_writes, 2);
        assert_eq!(config.run_loop.poll_interval, Duration::from_millis(10));
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = RelayConfigFile::default();
        config.set_source(ConfigSource::File);
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::File);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RelayConfigFile::default();
        config.pipe.chunk_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        config.pipe.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(config.validate().is_err());

        config.pipe.chunk_size = MAX_CHUNK_SIZE;
        assert!(config.validate().is_ok());

        config.pipe.writer.max_stalled_writes = 0;
        assert!(config.validate().is_err());

        config.pipe.writer.max_stalled_writes = 1;
        config.run_loop.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
