//! Configuration module for imagecycle.
//!
//! The tool is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [provider]
//! region = "${AWS_REGION}"
//!
//! [tags]
//! owner_marker = "LambdaAutomation"
//!
//! [environments.dev]
//! instances = ["i-0304c8ad0d646a745", "dev-ec2"]
//! retention_hours = 72
//!
//! [environments.prod]
//! instances = ["prod-instance-name-1"]
//! retention_hours = 168
//! ```

mod creation;
mod environments;
mod observability;
mod provider;
mod retention;

use std::{collections::BTreeMap, path::Path};

pub use creation::*;
pub use environments::*;
pub use observability::*;
pub use provider::*;
pub use retention::*;
use serde::{Deserialize, Serialize};

use crate::policy::EnvironmentLabel;

/// Root configuration.
///
/// Every section except `environments` is optional with defaults matching
/// the conventional tag layout (`CreatedBy`, `Environment`, `Name`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Cloud provider connection settings.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Tag keys and the owner marker that scopes destructive operations.
    #[serde(default)]
    pub tags: TagsConfig,

    /// Environment label -> instances to image and retention window.
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,

    /// Image creation settings.
    #[serde(default)]
    pub creation: CreationConfig,

    /// Reclamation safety settings.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Logging configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing variables cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: AppConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.environments.is_empty() {
            return Err(ConfigError::Validation(
                "at least one [environments.<label>] section is required".into(),
            ));
        }

        for (label, env) in &self.environments {
            EnvironmentLabel::parse(label.as_str())
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
            env.validate(label).map_err(ConfigError::Validation)?;
        }

        self.tags.validate().map_err(ConfigError::Validation)?;

        Ok(())
    }

    /// Non-fatal problems worth reporting once logging is up.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.has_any_retention() {
            warnings.push(
                "No environment has retention_hours configured; reclaim cycles will keep every image"
                    .to_string(),
            );
        }
        warnings
    }

    /// Check if any environment has a retention window.
    pub fn has_any_retention(&self) -> bool {
        self.environments
            .values()
            .any(|env| env.retention_hours.is_some())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand `${VAR}` placeholders, skipping anything after a `#` on the line.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(format!("invalid placeholder pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else { continue };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);

            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

/// Default configuration written by `imagecycle init`.
pub fn default_config_toml() -> &'static str {
    r#"# imagecycle configuration

[provider]
# region = "us-east-1"

[tags]
owner_key = "CreatedBy"
owner_marker = "LambdaAutomation"
environment_key = "Environment"
name_key = "Name"

# Instances may be listed by instance id or by Name tag.
[environments.dev]
instances = []
retention_hours = 72

[environments.prod]
instances = []
retention_hours = 168

[retention.safety]
dry_run = false
max_deletes_per_run = 0
max_duration_secs = 0

[observability.logging]
level = "info"
format = "compact"
"#
}
