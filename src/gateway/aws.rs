//! AWS EC2 implementation of the image gateway.
//!
//! Uses AWS SDK for Rust with the standard credential chain (environment,
//! profile, instance profile, etc.)

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_ec2::{
    Client,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    types::{Filter, InstanceStateName, ResourceType, Tag, TagSpecification},
};

use super::{
    CreateImageRequest, GatewayError, GatewayResult, ImageGateway, InstanceState, ManagedImage,
    ManagedInstance, OwnerFilter,
};
use crate::config::ProviderConfig;

/// EC2-backed gateway.
pub struct Ec2Gateway {
    client: Client,
    name_key: String,
}

impl Ec2Gateway {
    /// Create a new EC2 client with the given configuration.
    ///
    /// `name_key` is the tag holding instance display names.
    pub async fn new(config: &ProviderConfig, name_key: impl Into<String>) -> Self {
        let mut aws_config = aws_config::from_env();

        if let Some(region) = &config.region {
            aws_config = aws_config.region(aws_config::Region::new(region.clone()));
        }

        if let Some(profile) = &config.profile {
            aws_config = aws_config.profile_name(profile);
        }

        let aws_config = aws_config.load().await;

        let mut ec2_config = aws_sdk_ec2::config::Builder::from(&aws_config);

        if let Some(endpoint_url) = &config.endpoint_url {
            ec2_config = ec2_config.endpoint_url(endpoint_url);
        }

        Self {
            client: Client::from_conf(ec2_config.build()),
            name_key: name_key.into(),
        }
    }
}

#[async_trait]
impl ImageGateway for Ec2Gateway {
    async fn list_instances(
        &self,
        states: &[InstanceState],
    ) -> GatewayResult<Vec<ManagedInstance>> {
        let state_filter = Filter::builder()
            .name("instance-state-name")
            .set_values(Some(
                states
                    .iter()
                    .filter(|s| **s != InstanceState::Other)
                    .map(|s| s.as_str().to_string())
                    .collect(),
            ))
            .build();

        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .describe_instances()
                .filters(state_filter.clone())
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| map_sdk_error("DescribeInstances", e))?;

            for reservation in output.reservations() {
                for instance in reservation.instances() {
                    let Some(instance_id) = instance.instance_id() else {
                        continue;
                    };

                    let display_name = instance
                        .tags()
                        .iter()
                        .find(|t| t.key() == Some(self.name_key.as_str()))
                        .and_then(|t| t.value())
                        .map(str::to_string);

                    let state = match instance.state().and_then(|s| s.name()) {
                        Some(InstanceStateName::Running) => InstanceState::Running,
                        Some(InstanceStateName::Stopped) => InstanceState::Stopped,
                        _ => InstanceState::Other,
                    };

                    instances.push(ManagedInstance {
                        instance_id: instance_id.to_string(),
                        display_name,
                        state,
                    });
                }
            }

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(instances)
    }

    async fn list_owned_images(&self, owner: &OwnerFilter) -> GatewayResult<Vec<ManagedImage>> {
        let tag_filter = Filter::builder()
            .name(format!("tag:{}", owner.tag_key))
            .values(owner.tag_value.clone())
            .build();

        let mut images = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .describe_images()
                .owners("self")
                .filters(tag_filter.clone())
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| map_sdk_error("DescribeImages", e))?;

            for image in output.images() {
                let Some(image_id) = image.image_id() else {
                    continue;
                };

                let tags: BTreeMap<String, String> = image
                    .tags()
                    .iter()
                    .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
                    .collect();

                let snapshot_ids = image
                    .block_device_mappings()
                    .iter()
                    .filter_map(|m| m.ebs().and_then(|ebs| ebs.snapshot_id()))
                    .map(str::to_string)
                    .collect();

                images.push(ManagedImage {
                    image_id: image_id.to_string(),
                    creation_date: image.creation_date().unwrap_or_default().to_string(),
                    tags,
                    snapshot_ids,
                });
            }

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(images)
    }

    async fn create_image(&self, request: &CreateImageRequest) -> GatewayResult<String> {
        let tags = request
            .tags
            .iter()
            .map(|(key, value)| Tag::builder().key(key).value(value).build())
            .collect();

        let output = self
            .client
            .create_image()
            .instance_id(&request.instance_id)
            .name(&request.name)
            .description(&request.description)
            .no_reboot(request.no_reboot)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Image)
                    .set_tags(Some(tags))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error("CreateImage", e))?;

        output
            .image_id()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Provider {
                operation: "CreateImage",
                code: None,
                message: format!(
                    "response for instance {} did not include an image id",
                    request.instance_id
                ),
            })
    }

    async fn deregister_image(&self, image_id: &str) -> GatewayResult<()> {
        self.client
            .deregister_image()
            .image_id(image_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("DeregisterImage", e))?;
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> GatewayResult<()> {
        self.client
            .delete_snapshot()
            .snapshot_id(snapshot_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("DeleteSnapshot", e))?;
        Ok(())
    }
}

/// Classify an SDK failure by its EC2 error code.
fn map_sdk_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> GatewayError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            return GatewayError::Connection { operation, message };
        }
        _ => {}
    }

    let code = err.code().map(str::to_string);
    classify_error_code(operation, code, message)
}

fn classify_error_code(
    operation: &'static str,
    code: Option<String>,
    message: String,
) -> GatewayError {
    match code.as_deref() {
        Some("Throttling" | "RequestLimitExceeded" | "ThrottlingException") => {
            GatewayError::Throttled { operation, message }
        }
        Some(c) if c.ends_with(".NotFound") => GatewayError::NotFound {
            operation,
            resource: message,
        },
        _ => GatewayError::Provider {
            operation,
            code,
            message,
        },
    }
}
