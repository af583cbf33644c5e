//! Gateway configuration
//!
//! Loaded from meridian.yaml; a `.env` file and the process environment
//! override individual values. Every section falls back to its defaults.

use meridian_exec::ExecutionConfig;
use meridian_planner::PlannerConfig;
use meridian_registry::AliasTable;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnvVar { var: String, value: String },
}

/// One backing platform and the pre-parsed schema document describing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSource {
    pub id: String,
    /// JSON or YAML document, relative to the config file's directory
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directives, e.g. `info` or `meridian_planner=debug`
    pub level: String,
    /// pretty, json, compact
    pub format: String,
    /// stdout, file, both
    pub output: String,
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub platforms: Vec<PlatformSource>,
    pub aliases: AliasTable,
    pub planner: PlannerConfig,
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
    /// Directory platform paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&contents)?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        // An empty file is a valid, all-defaults configuration
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Override values from `MERIDIAN_*` and the logging variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = env_parse("MERIDIAN_MAX_IN_FLIGHT")? {
            self.execution.max_in_flight = value;
        }
        if let Some(value) = env_parse("MERIDIAN_FETCH_TIMEOUT_MS")? {
            self.execution.fetch_timeout_ms = value;
        }
        if let Some(value) = env_parse("MERIDIAN_COLLAPSE_FULL_QUERY")? {
            self.planner.collapse_full_query = value;
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.directory = dir;
        }
        Ok(())
    }

    /// Where the document for `source` lives on disk
    pub fn document_path(&self, source: &PlatformSource) -> PathBuf {
        if source.path.is_absolute() {
            source.path.clone()
        } else {
            self.base_dir.join(&source.path)
        }
    }

    /// Set logging environment variables for the logging module
    pub fn apply_logging_env(&self) {
        std::env::set_var("RUST_LOG", &self.logging.level);
        std::env::set_var("LOG_FORMAT", &self.logging.format);
        std::env::set_var("LOG_OUTPUT", &self.logging.output);
        std::env::set_var("LOG_DIR", &self.logging.directory);
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar {
                var: var.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
