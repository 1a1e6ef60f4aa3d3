//! Image reclamation configuration.
//!
//! Retention windows live on each environment; this section only carries the
//! safety settings that bound what a single reclaim cycle may do.
//!
//! # Example
//!
//! ```toml
//! [retention.safety]
//! dry_run = false
//! max_deletes_per_run = 50
//! max_duration_secs = 600
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reclamation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// Safety settings to prevent accidental data loss.
    #[serde(default)]
    pub safety: RetentionSafety,
}

/// Safety settings for reclaim cycles.
///
/// These settings help prevent accidental image loss and allow
/// testing retention policies before enabling them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionSafety {
    /// If true, report what would be deleted without deleting anything.
    /// Default: false
    #[serde(default)]
    pub dry_run: bool,

    /// Maximum number of images to tear down per cycle. Eligible images
    /// beyond the cap are kept until the next cycle.
    /// Set to 0 for unlimited.
    /// Default: 0
    #[serde(default)]
    pub max_deletes_per_run: u64,

    /// Maximum wall-clock time for one cycle (in seconds). When exceeded,
    /// the cycle stops and the remaining images are evaluated next run.
    /// Set to 0 for unlimited.
    /// Default: 0
    #[serde(default)]
    pub max_duration_secs: u64,
}

impl RetentionSafety {
    /// Get the per-cycle delete cap, or None if unlimited.
    pub fn max_deletes(&self) -> Option<u64> {
        if self.max_deletes_per_run == 0 {
            None
        } else {
            Some(self.max_deletes_per_run)
        }
    }

    /// Get the max duration as a Duration, or None if unlimited.
    pub fn max_duration(&self) -> Option<Duration> {
        if self.max_duration_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_duration_secs))
        }
    }
}
