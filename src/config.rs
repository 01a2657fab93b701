//! Engine configuration.
//!
//! Loaded from a TOML file or built in code. Everything has a default so an
//! empty file (or `EngineConfig::default()`) is a valid configuration.

use serde::Deserialize;
use std::path::Path;

/// Top-level engine configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Worker thread configuration
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker thread configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of worker threads (default: number of CPUs)
    pub threads: Option<usize>,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps in log output
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include thread names in log output
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            thread_names: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output
    #[default]
    Pretty,
    /// Single-line output
    Compact,
    /// Machine-readable JSON
    Json,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.workers.threads == Some(0) {
            return Err("workers.threads must be at least 1".into());
        }
        Ok(())
    }

    /// Get the number of worker threads.
    pub fn threads(&self) -> usize {
        self.workers.threads.unwrap_or_else(num_cpus::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.logging.timestamps);
        assert!(config.threads() >= 1);
    }

    #[test]
    fn test_parse_full_config() {
        let config: EngineConfig = toml::from_str(
            r#"
            [workers]
            threads = 4

            [logging]
            level = "debug"
            format = "json"
            timestamps = false
            "#,
        )
        .unwrap();
        assert_eq!(config.threads(), 4);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.timestamps);
        assert!(config.logging.thread_names);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let config: EngineConfig = toml::from_str("[workers]\nthreads = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<EngineConfig, _> = toml::from_str("[workers]\nthreds = 2\n");
        assert!(result.is_err());
    }
}
