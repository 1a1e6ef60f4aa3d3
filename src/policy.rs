//! Lifecycle policy derived from configuration.
//!
//! The creator and the reclaimer receive these values at construction time;
//! nothing here is global.

use std::{
    borrow::Borrow,
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::TimeDelta;
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::{AppConfig, TagsConfig},
    gateway::OwnerFilter,
};

/// An environment label such as `dev` or `prod`.
///
/// Labels end up in image names and tag values, so they are restricted to
/// ASCII letters, digits, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct EnvironmentLabel(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("environment label '{0}' must be non-empty and contain only letters, digits, '-' or '_'")]
pub struct InvalidLabel(pub String);

impl EnvironmentLabel {
    pub fn parse(label: impl Into<String>) -> Result<Self, InvalidLabel> {
        let label = label.into();
        let valid = !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        if valid {
            Ok(Self(label))
        } else {
            Err(InvalidLabel(label))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for EnvironmentLabel {
    type Error = InvalidLabel;

    fn try_from(label: &str) -> Result<Self, Self::Error> {
        Self::parse(label)
    }
}

impl TryFrom<String> for EnvironmentLabel {
    type Error = InvalidLabel;

    fn try_from(label: String) -> Result<Self, Self::Error> {
        Self::parse(label)
    }
}

impl Borrow<str> for EnvironmentLabel {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Labels of a config that bypassed validation are skipped with a warning.
fn config_label(label: &str) -> Option<EnvironmentLabel> {
    match EnvironmentLabel::parse(label) {
        Ok(label) => Some(label),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring environment");
            None
        }
    }
}

/// Environment label -> minimum image age before reclamation.
///
/// A label that is not a key here is exempt from deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    durations: BTreeMap<EnvironmentLabel, TimeDelta>,
}

impl RetentionPolicy {
    pub fn new(durations: impl IntoIterator<Item = (EnvironmentLabel, TimeDelta)>) -> Self {
        Self {
            durations: durations.into_iter().collect(),
        }
    }

    /// Build from hour-granular windows, e.g. `[("dev", 10), ("prod", 168)]`.
    pub fn from_hours<'a>(
        hours: impl IntoIterator<Item = (&'a str, u64)>,
    ) -> Result<Self, InvalidLabel> {
        let durations = hours
            .into_iter()
            .map(|(label, h)| Ok((EnvironmentLabel::parse(label)?, hours_to_delta(h))))
            .collect::<Result<Vec<_>, InvalidLabel>>()?;
        Ok(Self::new(durations))
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.environments.iter().filter_map(|(label, env)| {
            let hours = env.retention_hours?;
            Some((config_label(label)?, hours_to_delta(hours)))
        }))
    }

    /// Retention window for `label`, or `None` when the label is unmanaged.
    pub fn retention_for(&self, label: &str) -> Option<TimeDelta> {
        self.durations.get(label).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EnvironmentLabel, &TimeDelta)> {
        self.durations.iter()
    }
}

fn hours_to_delta(hours: u64) -> TimeDelta {
    i64::try_from(hours)
        .ok()
        .and_then(TimeDelta::try_hours)
        .unwrap_or(TimeDelta::MAX)
}

/// Environment label -> instance ids or display names to image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceGroups {
    groups: BTreeMap<EnvironmentLabel, BTreeSet<String>>,
}

impl InstanceGroups {
    pub fn new(groups: impl IntoIterator<Item = (EnvironmentLabel, BTreeSet<String>)>) -> Self {
        Self {
            groups: groups.into_iter().collect(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config
                .environments
                .iter()
                .filter(|(_, env)| !env.instances.is_empty())
                .filter_map(|(label, env)| Some((config_label(label)?, env.instances.clone()))),
        )
    }

    pub fn get(&self, label: &str) -> Option<&BTreeSet<String>> {
        self.groups.get(label)
    }

    /// Groups in label order.
    pub fn iter(&self) -> impl Iterator<Item = (&EnvironmentLabel, &BTreeSet<String>)> {
        self.groups.iter()
    }
}

/// Tag keys and the owner marker shared by creation and reclamation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagScheme {
    pub owner_key: String,
    pub owner_marker: String,
    pub environment_key: String,
    pub name_key: String,
}

impl TagScheme {
    /// Filter that limits listings to images this tool created.
    pub fn owner_filter(&self) -> OwnerFilter {
        OwnerFilter {
            tag_key: self.owner_key.clone(),
            tag_value: self.owner_marker.clone(),
        }
    }
}

impl Default for TagScheme {
    fn default() -> Self {
        Self::from(&TagsConfig::default())
    }
}

impl From<&TagsConfig> for TagScheme {
    fn from(tags: &TagsConfig) -> Self {
        Self {
            owner_key: tags.owner_key.clone(),
            owner_marker: tags.owner_marker.clone(),
            environment_key: tags.environment_key.clone(),
            name_key: tags.name_key.clone(),
        }
    }
}
