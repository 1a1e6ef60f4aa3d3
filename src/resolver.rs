//! Resolves configured instance ids and display names to live instance ids.

use std::{collections::BTreeSet, sync::Arc};

use crate::gateway::{GatewayResult, ImageGateway, InstanceState};

/// Outcome of resolving a candidate set against the live fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Canonical ids of matched instances.
    pub resolved: BTreeSet<String>,
    /// Candidates that matched no running or stopped instance.
    pub unmatched: BTreeSet<String>,
}

pub struct InstanceResolver {
    gateway: Arc<dyn ImageGateway>,
}

impl InstanceResolver {
    pub fn new(gateway: Arc<dyn ImageGateway>) -> Self {
        Self { gateway }
    }

    /// Map candidates (ids or display names) to instance ids.
    ///
    /// Candidates matching nothing are dropped without error.
    pub async fn resolve(&self, candidates: &BTreeSet<String>) -> GatewayResult<BTreeSet<String>> {
        Ok(self.resolve_detailed(candidates).await?.resolved)
    }

    /// Like [`resolve`](Self::resolve), also returning the unmatched candidates.
    ///
    /// Only running and stopped instances are considered; terminated or
    /// transitioning instances are excluded rather than failing the caller.
    pub async fn resolve_detailed(
        &self,
        candidates: &BTreeSet<String>,
    ) -> GatewayResult<Resolution> {
        if candidates.is_empty() {
            return Ok(Resolution::default());
        }

        let instances = self
            .gateway
            .list_instances(&InstanceState::IMAGEABLE)
            .await?;

        let mut resolution = Resolution::default();
        let mut matched_candidates = BTreeSet::new();

        for instance in &instances {
            let by_id = candidates.contains(&instance.instance_id);
            let by_name = instance
                .display_name
                .as_ref()
                .is_some_and(|name| candidates.contains(name));

            if !(by_id || by_name) {
                continue;
            }

            if by_id {
                matched_candidates.insert(instance.instance_id.as_str());
            }
            if by_name && let Some(name) = &instance.display_name {
                matched_candidates.insert(name.as_str());
            }

            tracing::info!(
                instance_id = %instance.instance_id,
                name = instance.display_name.as_deref().unwrap_or(""),
                state = instance.state.as_str(),
                "Resolved instance"
            );
            resolution.resolved.insert(instance.instance_id.clone());
        }

        for candidate in candidates {
            if !matched_candidates.contains(candidate.as_str()) {
                tracing::debug!(candidate = %candidate, "Candidate matched no running or stopped instance");
                resolution.unmatched.insert(candidate.clone());
            }
        }

        Ok(resolution)
    }
}
