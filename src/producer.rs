//! Image producer: requests tagged image snapshots of configured instances.
//!
//! Creation is fire-and-forget. The producer issues one create call per
//! instance and never waits for the image to become available.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::{
    gateway::{CreateImageRequest, GatewayError, ImageGateway},
    policy::{EnvironmentLabel, InstanceGroups, TagScheme},
    resolver::InstanceResolver,
};

/// Timestamp layout embedded in image names.
const NAME_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("failed to resolve instances for environment '{environment}': {source}")]
    Resolve {
        environment: EnvironmentLabel,
        #[source]
        source: GatewayError,
    },
}

/// An image creation request accepted by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedImage {
    pub image_id: String,
    pub name: String,
}

/// Per-instance outcome of a create cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CreateOutcome {
    Started { image_id: String, name: String },
    WouldCreate { name: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceCreateReport {
    pub environment: EnvironmentLabel,
    pub instance_id: String,
    #[serde(flatten)]
    pub outcome: CreateOutcome,
}

/// Results from a single create cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CreateReport {
    pub dry_run: bool,
    pub instances: Vec<InstanceCreateReport>,
    /// Configured candidates that matched no instance, per environment.
    pub unmatched: BTreeMap<EnvironmentLabel, Vec<String>>,
}

impl CreateReport {
    pub fn started_count(&self) -> usize {
        self.count(|o| matches!(o, CreateOutcome::Started { .. }))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|o| matches!(o, CreateOutcome::Failed { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count() > 0
    }

    fn count(&self, pred: impl Fn(&CreateOutcome) -> bool) -> usize {
        self.instances.iter().filter(|r| pred(&r.outcome)).count()
    }
}

pub struct ImageProducer {
    gateway: Arc<dyn ImageGateway>,
    tags: TagScheme,
    no_reboot: bool,
    dry_run: bool,
}

impl ImageProducer {
    pub fn new(gateway: Arc<dyn ImageGateway>, tags: TagScheme) -> Self {
        Self {
            gateway,
            tags,
            no_reboot: true,
            dry_run: false,
        }
    }

    /// Reboot the instance before imaging instead of taking a
    /// crash-consistent snapshot.
    pub fn with_no_reboot(mut self, no_reboot: bool) -> Self {
        self.no_reboot = no_reboot;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Request an image of `instance_id` tagged for `environment`.
    pub async fn create(
        &self,
        instance_id: &str,
        environment: &EnvironmentLabel,
    ) -> Result<CreatedImage, GatewayError> {
        self.create_at(instance_id, environment, Utc::now()).await
    }

    pub async fn create_at(
        &self,
        instance_id: &str,
        environment: &EnvironmentLabel,
        now: DateTime<Utc>,
    ) -> Result<CreatedImage, GatewayError> {
        let request = self.build_request(instance_id, environment, now);

        tracing::info!(
            environment = %environment,
            instance_id = %instance_id,
            name = %request.name,
            "Creating image for {} instance",
            environment.as_str().to_uppercase()
        );

        let image_id = self.gateway.create_image(&request).await?;

        tracing::info!(
            environment = %environment,
            instance_id = %instance_id,
            image_id = %image_id,
            "Image creation started"
        );

        Ok(CreatedImage {
            image_id,
            name: request.name,
        })
    }

    /// Build the create request: name, description and ownership tags.
    pub fn build_request(
        &self,
        instance_id: &str,
        environment: &EnvironmentLabel,
        now: DateTime<Utc>,
    ) -> CreateImageRequest {
        let name = image_name(environment, instance_id, now);
        let description = format!(
            "Automated AMI for {} - {}",
            environment.as_str().to_uppercase(),
            instance_id
        );

        let tags = BTreeMap::from([
            (
                self.tags.environment_key.clone(),
                environment.as_str().to_string(),
            ),
            (self.tags.owner_key.clone(), self.tags.owner_marker.clone()),
            (self.tags.name_key.clone(), name.clone()),
        ]);

        CreateImageRequest {
            instance_id: instance_id.to_string(),
            name,
            description,
            no_reboot: self.no_reboot,
            tags,
        }
    }

    /// Run one create cycle over every configured environment.
    ///
    /// A failed instance listing aborts the cycle; a failed create call
    /// only affects that instance.
    pub async fn run_create_cycle(
        &self,
        groups: &InstanceGroups,
        resolver: &InstanceResolver,
    ) -> Result<CreateReport, ProducerError> {
        self.run_create_cycle_at(groups, resolver, Utc::now()).await
    }

    pub async fn run_create_cycle_at(
        &self,
        groups: &InstanceGroups,
        resolver: &InstanceResolver,
        now: DateTime<Utc>,
    ) -> Result<CreateReport, ProducerError> {
        let mut report = CreateReport {
            dry_run: self.dry_run,
            ..Default::default()
        };

        for (environment, candidates) in groups.iter() {
            let resolution = resolver.resolve_detailed(candidates).await.map_err(|source| {
                ProducerError::Resolve {
                    environment: environment.clone(),
                    source,
                }
            })?;

            if !resolution.unmatched.is_empty() {
                tracing::warn!(
                    environment = %environment,
                    unmatched = ?resolution.unmatched,
                    "Some configured instances were not found"
                );
                report.unmatched.insert(
                    environment.clone(),
                    resolution.unmatched.into_iter().collect(),
                );
            }

            for instance_id in resolution.resolved {
                let outcome = if self.dry_run {
                    let name = image_name(environment, &instance_id, now);
                    tracing::info!(
                        environment = %environment,
                        instance_id = %instance_id,
                        name = %name,
                        "DRY RUN: Would create image"
                    );
                    CreateOutcome::WouldCreate { name }
                } else {
                    match self.create_at(&instance_id, environment, now).await {
                        Ok(created) => CreateOutcome::Started {
                            image_id: created.image_id,
                            name: created.name,
                        },
                        Err(e) => {
                            tracing::error!(
                                environment = %environment,
                                instance_id = %instance_id,
                                error = %e,
                                "Failed to create image"
                            );
                            CreateOutcome::Failed {
                                error: e.to_string(),
                            }
                        }
                    }
                };

                report.instances.push(InstanceCreateReport {
                    environment: environment.clone(),
                    instance_id,
                    outcome,
                });
            }
        }

        Ok(report)
    }
}

/// `{env}-ami-{instance_id}-{YYYY-MM-DD-HH-MM-SS}`
pub fn image_name(environment: &EnvironmentLabel, instance_id: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}-ami-{}-{}",
        environment,
        instance_id,
        now.format(NAME_TIMESTAMP_FORMAT)
    )
}
