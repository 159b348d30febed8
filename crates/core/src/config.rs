//! TOML-based configuration for subsync.
//!
//! Holds the top-level pull/push locations, the remap rules applied to
//! declared subrepo sources, prompt behaviour and the default log level.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::state::{validate_rules, RemapRule};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubsyncConfig {
    /// Locations of the outermost repository.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Remap rules, applied in order to every declared source.
    #[serde(default)]
    pub subpaths: Vec<RemapRule>,

    /// Prompt and output settings.
    #[serde(default)]
    pub ui: UiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Pull / push locations relative subrepo sources are resolved against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    pub default: Option<String>,

    /// Falls back to `default` when unset.
    pub default_push: Option<String>,
}

// ---------------------------------------------------------------------------
// UI
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiConfig {
    /// Ask the operator at prompts; otherwise every prompt takes its default.
    #[serde(default = "default_true")]
    pub interactive: bool,

    /// Suppress status output.
    #[serde(default)]
    pub quiet: bool,

    /// Author for subrepo commits, `Name <email>`.
    pub username: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            interactive: default_true(),
            quiet: false,
            username: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl SubsyncConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: SubsyncConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!(rules = config.subpaths.len(), "configuration parsed successfully");
        Ok(config)
    }

    /// Check that every remap pattern compiles and the log level is known.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_rules(&self.subpaths).map_err(|e| ConfigError::InvalidValue {
            field: "subpaths".into(),
            detail: e.to_string(),
        })?;
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".into(),
                detail: format!(
                    "unknown level '{}', expected one of {}",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            });
        }
        if let Some(username) = &self.ui.username {
            if username.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "ui.username".into(),
                    detail: "username must not be blank".into(),
                });
            }
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}
