use serde::{Deserialize, Serialize};

/// Image creation settings.
///
/// ```toml
/// [creation]
/// no_reboot = true
/// dry_run = false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreationConfig {
    /// Snapshot without stopping the instance (crash-consistent image).
    /// Default: true
    #[serde(default = "default_true")]
    pub no_reboot: bool,

    /// Log the images that would be created without calling the provider.
    /// Default: false
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for CreationConfig {
    fn default() -> Self {
        Self {
            no_reboot: true,
            dry_run: false,
        }
    }
}

fn default_true() -> bool {
    true
}
