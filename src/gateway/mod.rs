//! Resource gateway over the compute provider's image API.
//!
//! The retention engine, resolver and producer only ever talk to an
//! [`ImageGateway`]; transport details stay behind it.
//!
//! Supports multiple backends:
//! - In-memory (for testing and local rehearsal)
//! - AWS EC2 - requires `aws` feature

#[cfg(feature = "aws")]
mod aws;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(feature = "aws")]
pub use aws::Ec2Gateway;
pub use memory::{GatewayCall, MemoryGateway, Operation};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{operation}: resource not found: {resource}")]
    NotFound {
        operation: &'static str,
        resource: String,
    },

    #[error("{operation}: request throttled: {message}")]
    Throttled {
        operation: &'static str,
        message: String,
    },

    #[error("{operation}: connection error: {message}")]
    Connection {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} failed{}: {message}", code_suffix(.code))]
    Provider {
        operation: &'static str,
        code: Option<String>,
        message: String,
    },
}

impl GatewayError {
    /// Name of the gateway operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            GatewayError::NotFound { operation, .. }
            | GatewayError::Throttled { operation, .. }
            | GatewayError::Connection { operation, .. }
            | GatewayError::Provider { operation, .. } => operation,
        }
    }
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref()
        .map(|c| format!(" ({c})"))
        .unwrap_or_default()
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Lifecycle state of an instance as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Stopped,
    Other,
}

impl InstanceState {
    /// States an instance must be in to be imaged.
    pub const IMAGEABLE: [InstanceState; 2] = [InstanceState::Running, InstanceState::Stopped];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Other => "other",
        }
    }
}

/// Read-only view of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedInstance {
    pub instance_id: String,
    pub display_name: Option<String>,
    pub state: InstanceState,
}

impl ManagedInstance {
    pub fn new(instance_id: impl Into<String>, state: InstanceState) -> Self {
        Self {
            instance_id: instance_id.into(),
            display_name: None,
            state,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// An image as listed by the provider.
///
/// `creation_date` is kept in the provider's string form; the retention
/// engine parses it so a malformed value only affects this image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedImage {
    pub image_id: String,
    pub creation_date: String,
    pub tags: BTreeMap<String, String>,
    /// Backing snapshot ids in block-device-mapping order.
    pub snapshot_ids: Vec<String>,
}

impl ManagedImage {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Tag filter used to scope image listings to images this tool created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerFilter {
    pub tag_key: String,
    pub tag_value: String,
}

/// Parameters for a single image creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateImageRequest {
    pub instance_id: String,
    pub name: String,
    pub description: String,
    pub no_reboot: bool,
    pub tags: BTreeMap<String, String>,
}

/// Trait for the provider operations the tool consumes.
///
/// Implementations surface provider failures as [`GatewayError`] and never
/// substitute defaults, so callers can isolate failures per item.
#[async_trait]
pub trait ImageGateway: Send + Sync {
    /// List instances whose lifecycle state is one of `states`.
    async fn list_instances(&self, states: &[InstanceState])
    -> GatewayResult<Vec<ManagedInstance>>;

    /// List images owned by this account that carry the owner tag.
    async fn list_owned_images(&self, owner: &OwnerFilter) -> GatewayResult<Vec<ManagedImage>>;

    /// Request creation of an image. Returns the new image id without
    /// waiting for the image to become available.
    async fn create_image(&self, request: &CreateImageRequest) -> GatewayResult<String>;

    /// Deregister an image. Its snapshots are left in place.
    async fn deregister_image(&self, image_id: &str) -> GatewayResult<()>;

    /// Delete a block storage snapshot.
    async fn delete_snapshot(&self, snapshot_id: &str) -> GatewayResult<()>;
}
