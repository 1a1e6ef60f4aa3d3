//! Environment and tag configuration.
//!
//! # Example
//!
//! ```toml
//! [tags]
//! owner_key = "CreatedBy"
//! owner_marker = "LambdaAutomation"
//!
//! [environments.dev]
//! instances = ["i-0304c8ad0d646a745", "dev-ec2"]
//! retention_hours = 10
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Per-environment settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Instance ids or `Name` tag values to image on each create cycle.
    #[serde(default)]
    pub instances: BTreeSet<String>,

    /// Minimum age (in hours) before an image of this environment is
    /// reclaimed. When omitted, images of this environment are never deleted.
    #[serde(default)]
    pub retention_hours: Option<u64>,
}

impl EnvironmentConfig {
    pub(super) fn validate(&self, label: &str) -> Result<(), String> {
        if self.instances.iter().any(|candidate| candidate.trim().is_empty()) {
            return Err(format!(
                "environments.{label}.instances contains an empty entry"
            ));
        }
        Ok(())
    }
}

/// Tag layout shared by the creator and the reclaimer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagsConfig {
    /// Tag key carrying the owner marker.
    /// Default: "CreatedBy"
    #[serde(default = "default_owner_key")]
    pub owner_key: String,

    /// Tag value identifying images created by this tool. Only images
    /// carrying it are ever listed for deletion.
    /// Default: "LambdaAutomation"
    #[serde(default = "default_owner_marker")]
    pub owner_marker: String,

    /// Tag key carrying the environment label.
    /// Default: "Environment"
    #[serde(default = "default_environment_key")]
    pub environment_key: String,

    /// Tag key holding display names (instances and created images).
    /// Default: "Name"
    #[serde(default = "default_name_key")]
    pub name_key: String,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            owner_key: default_owner_key(),
            owner_marker: default_owner_marker(),
            environment_key: default_environment_key(),
            name_key: default_name_key(),
        }
    }
}

impl TagsConfig {
    pub(super) fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("owner_key", &self.owner_key),
            ("owner_marker", &self.owner_marker),
            ("environment_key", &self.environment_key),
            ("name_key", &self.name_key),
        ] {
            if value.trim().is_empty() {
                return Err(format!("tags.{field} must not be empty"));
            }
        }

        if self.owner_key == self.environment_key {
            return Err("tags.owner_key and tags.environment_key must differ".into());
        }

        Ok(())
    }
}

fn default_owner_key() -> String {
    "CreatedBy".to_string()
}

fn default_owner_marker() -> String {
    "LambdaAutomation".to_string()
}

fn default_environment_key() -> String {
    "Environment".to_string()
}

fn default_name_key() -> String {
    "Name".to_string()
}
