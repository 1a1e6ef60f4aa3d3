use serde::{Deserialize, Serialize};

/// Cloud provider connection settings.
///
/// Credentials come from the standard AWS chain (environment, profile,
/// instance or task role).
///
/// ```toml
/// [provider]
/// region = "eu-west-1"
/// profile = "imaging"
/// endpoint_url = "http://localhost:4566"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// AWS region. Falls back to the region from the environment.
    #[serde(default)]
    pub region: Option<String>,

    /// Named credentials profile.
    #[serde(default)]
    pub profile: Option<String>,

    /// Custom endpoint URL (useful for localstack testing).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}
