//! Ensure-semantics over the control plane.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use keel_core::drift::{drift, strip_server_fields};
use keel_core::ports::ControlPlane;
use keel_core::{InfraError, ProvisionFailure, ProvisionedResource, ResourceDescriptor, ResourceKey, ResourceState};
use metrics::counter;
use tracing::{debug, info, warn};

/// Idempotently ensures resources exist with a compatible spec.
///
/// Never mutates a live resource: a mismatch is reported as
/// [`ProvisionFailure::Conflict`]. Dependency order is the caller's job.
pub struct ResourceProvisioner {
    plane: Arc<dyn ControlPlane>,
    ledger: Mutex<BTreeMap<ResourceKey, ProvisionedResource>>,
}

impl ResourceProvisioner {
    pub fn new(plane: Arc<dyn ControlPlane>) -> Self {
        Self { plane, ledger: Mutex::new(BTreeMap::new()) }
    }

    pub async fn ensure(&self, desc: &ResourceDescriptor) -> ProvisionedResource {
        self.note(&desc.key, ResourceState::Requested);
        let state = match self.plane.describe(&desc.key).await {
            Ok(Some(live)) => compare(desc, &live),
            Ok(None) => self.create(desc).await,
            Err(e) => failure(e),
        };
        let kind = desc.key.kind.as_str();
        match &state {
            ResourceState::Exists => {
                counter!("provision_ensure_total", 1u64, "kind" => kind, "result" => "exists");
            }
            ResourceState::Failed(f) => {
                counter!("provision_ensure_total", 1u64, "kind" => kind, "result" => "failed");
                warn!(resource = %desc.key, reason = %f.reason(), retryable = f.is_retryable(), "ensure failed");
            }
            ResourceState::Requested => {}
        }
        self.note(&desc.key, state.clone());
        ProvisionedResource { key: desc.key.clone(), state }
    }

    /// Ensure a tier of mutually independent resources concurrently.
    pub async fn ensure_all<'a, I>(&self, descs: I) -> Vec<ProvisionedResource>
    where
        I: IntoIterator<Item = &'a ResourceDescriptor>,
    {
        join_all(descs.into_iter().map(|d| self.ensure(d))).await
    }

    /// Last known state of every resource this provisioner has touched.
    pub fn ledger(&self) -> Vec<ProvisionedResource> {
        match self.ledger.lock() {
            Ok(l) => l.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    async fn create(&self, desc: &ResourceDescriptor) -> ResourceState {
        match self.plane.create(desc).await {
            Ok(()) => {
                info!(resource = %desc.key, "created");
                ResourceState::Exists
            }
            // Lost a race with another creator: judge what is there now.
            Err(InfraError::AlreadyExists) => match self.plane.describe(&desc.key).await {
                Ok(Some(live)) => compare(desc, &live),
                Ok(None) => ResourceState::Failed(ProvisionFailure::Transient("reported as existing but not found".into())),
                Err(e) => failure(e),
            },
            Err(e) => failure(e),
        }
    }

    fn note(&self, key: &ResourceKey, state: ResourceState) {
        let mut ledger = match self.ledger.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        ledger.insert(key.clone(), ProvisionedResource { key: key.clone(), state });
    }
}

fn compare(desc: &ResourceDescriptor, live: &serde_json::Value) -> ResourceState {
    let live = strip_server_fields(live.clone());
    let d = drift(&desc.body, &live);
    if d.is_compatible() {
        debug!(resource = %desc.key, "already exists with compatible spec");
        ResourceState::Exists
    } else {
        ResourceState::Failed(ProvisionFailure::Conflict(format!("exists with incompatible spec ({})", d.describe())))
    }
}

fn failure(e: InfraError) -> ResourceState {
    match e {
        InfraError::Unsupported(r) => ResourceState::Failed(ProvisionFailure::Unsupported(r)),
        other => ResourceState::Failed(ProvisionFailure::Transient(other.to_string())),
    }
}
