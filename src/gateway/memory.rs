//! In-memory gateway with configurable failure injection.
//!
//! Mirrors the provider semantics the engine relies on: listings are
//! filtered like the real API, deregistering an image leaves its snapshots
//! behind, and a snapshot still referenced by a registered image cannot be
//! deleted.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use super::{
    CreateImageRequest, GatewayError, GatewayResult, ImageGateway, InstanceState, ManagedImage,
    ManagedInstance, OwnerFilter,
};

/// Gateway operation, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListInstances,
    ListImages,
    CreateImage,
    DeregisterImage,
    DeleteSnapshot,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ListInstances => "DescribeInstances",
            Operation::ListImages => "DescribeImages",
            Operation::CreateImage => "CreateImage",
            Operation::DeregisterImage => "DeregisterImage",
            Operation::DeleteSnapshot => "DeleteSnapshot",
        }
    }
}

/// A call received by the gateway, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    ListInstances,
    ListImages,
    CreateImage(String),
    DeregisterImage(String),
    DeleteSnapshot(String),
}

/// In-memory fleet, image and snapshot inventory.
#[derive(Default)]
pub struct MemoryGateway {
    instances: DashMap<String, ManagedInstance>,
    images: DashMap<String, ManagedImage>,
    snapshots: DashSet<String>,
    /// Keyed by operation and target; a `None` target fails every call.
    failures: DashMap<(Operation, Option<String>), GatewayError>,
    latency: DashMap<Operation, Duration>,
    calls: Mutex<Vec<GatewayCall>>,
    next_id: AtomicU64,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(self, instance: ManagedInstance) -> Self {
        self.add_instance(instance);
        self
    }

    pub fn with_image(self, image: ManagedImage) -> Self {
        self.insert_image(image);
        self
    }

    pub fn add_instance(&self, instance: ManagedInstance) {
        self.instances.insert(instance.instance_id.clone(), instance);
    }

    /// Register an image and its backing snapshots.
    pub fn insert_image(&self, image: ManagedImage) {
        for snapshot_id in &image.snapshot_ids {
            self.snapshots.insert(snapshot_id.clone());
        }
        self.images.insert(image.image_id.clone(), image);
    }

    /// Make `operation` fail for `target` (or for every call when `None`).
    pub fn fail(&self, operation: Operation, target: Option<&str>, error: GatewayError) {
        self.failures
            .insert((operation, target.map(str::to_string)), error);
    }

    /// Make `operation` fail for `target` with a generic provider error.
    pub fn fail_on(&self, operation: Operation, target: Option<&str>) {
        let error = GatewayError::Provider {
            operation: operation.as_str(),
            code: Some("InjectedFailure".to_string()),
            message: format!(
                "injected failure for {}",
                target.unwrap_or("all resources")
            ),
        };
        self.fail(operation, target, error);
    }

    /// Make every call to `operation` take `latency` before it completes.
    pub fn delay(&self, operation: Operation, latency: Duration) {
        self.latency.insert(operation, latency);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    /// Registered image ids, sorted.
    pub fn image_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.images.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn image(&self, image_id: &str) -> Option<ManagedImage> {
        self.images.get(image_id).map(|e| e.value().clone())
    }

    pub fn has_image(&self, image_id: &str) -> bool {
        self.images.contains_key(image_id)
    }

    pub fn has_snapshot(&self, snapshot_id: &str) -> bool {
        self.snapshots.contains(snapshot_id)
    }

    /// Live snapshot ids, sorted.
    pub fn snapshot_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.snapshots.iter().map(|s| s.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().push(call);
    }

    async fn simulate_latency(&self, operation: Operation) {
        let latency = self.latency.get(&operation).map(|e| *e.value());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn injected(&self, operation: Operation, target: Option<&str>) -> GatewayResult<()> {
        if let Some(target) = target
            && let Some(err) = self.failures.get(&(operation, Some(target.to_string())))
        {
            return Err(err.value().clone());
        }
        match self.failures.get(&(operation, None)) {
            Some(err) => Err(err.value().clone()),
            None => Ok(()),
        }
    }

    fn next_resource_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}-{n:017x}")
    }
}

#[async_trait]
impl ImageGateway for MemoryGateway {
    async fn list_instances(
        &self,
        states: &[InstanceState],
    ) -> GatewayResult<Vec<ManagedInstance>> {
        self.record(GatewayCall::ListInstances);
        self.simulate_latency(Operation::ListInstances).await;
        self.injected(Operation::ListInstances, None)?;

        let mut instances: Vec<ManagedInstance> = self
            .instances
            .iter()
            .filter(|e| states.contains(&e.value().state))
            .map(|e| e.value().clone())
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }

    async fn list_owned_images(&self, owner: &OwnerFilter) -> GatewayResult<Vec<ManagedImage>> {
        self.record(GatewayCall::ListImages);
        self.simulate_latency(Operation::ListImages).await;
        self.injected(Operation::ListImages, None)?;

        let mut images: Vec<ManagedImage> = self
            .images
            .iter()
            .filter(|e| e.value().tag(&owner.tag_key) == Some(owner.tag_value.as_str()))
            .map(|e| e.value().clone())
            .collect();
        images.sort_by(|a, b| a.image_id.cmp(&b.image_id));
        Ok(images)
    }

    async fn create_image(&self, request: &CreateImageRequest) -> GatewayResult<String> {
        self.record(GatewayCall::CreateImage(request.instance_id.clone()));
        self.simulate_latency(Operation::CreateImage).await;
        self.injected(Operation::CreateImage, Some(&request.instance_id))?;

        if !self.instances.contains_key(&request.instance_id) {
            return Err(GatewayError::NotFound {
                operation: Operation::CreateImage.as_str(),
                resource: request.instance_id.clone(),
            });
        }

        let image = ManagedImage {
            image_id: self.next_resource_id("ami"),
            creation_date: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            tags: request.tags.clone(),
            snapshot_ids: vec![self.next_resource_id("snap")],
        };
        let image_id = image.image_id.clone();
        self.insert_image(image);
        Ok(image_id)
    }

    async fn deregister_image(&self, image_id: &str) -> GatewayResult<()> {
        self.record(GatewayCall::DeregisterImage(image_id.to_string()));
        self.simulate_latency(Operation::DeregisterImage).await;
        self.injected(Operation::DeregisterImage, Some(image_id))?;

        match self.images.remove(image_id) {
            Some(_) => Ok(()),
            None => Err(GatewayError::NotFound {
                operation: Operation::DeregisterImage.as_str(),
                resource: image_id.to_string(),
            }),
        }
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> GatewayResult<()> {
        self.record(GatewayCall::DeleteSnapshot(snapshot_id.to_string()));
        self.simulate_latency(Operation::DeleteSnapshot).await;
        self.injected(Operation::DeleteSnapshot, Some(snapshot_id))?;

        if let Some(owner) = self
            .images
            .iter()
            .find(|e| e.value().snapshot_ids.iter().any(|s| s == snapshot_id))
        {
            return Err(GatewayError::Provider {
                operation: Operation::DeleteSnapshot.as_str(),
                code: Some("InvalidSnapshot.InUse".to_string()),
                message: format!(
                    "snapshot {snapshot_id} is currently in use by {}",
                    owner.key()
                ),
            });
        }

        match self.snapshots.remove(snapshot_id) {
            Some(_) => Ok(()),
            None => Err(GatewayError::NotFound {
                operation: Operation::DeleteSnapshot.as_str(),
                resource: snapshot_id.to_string(),
            }),
        }
    }
}
