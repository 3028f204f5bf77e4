//! Narrow interfaces to the external collaborators the orchestrator drives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{AdminError, InfraError, MemberRole, ResourceDescriptor, ResourceKey, TopologySpec};

/// Which readiness count to query for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadinessTarget {
    /// Member workloads scheduled and running.
    SchedulableMembers,
    /// Member storage claims bound to a volume.
    BoundClaims,
}

/// Infrastructure and container control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Live body of the resource, `None` when absent.
    async fn describe(&self, key: &ResourceKey) -> Result<Option<serde_json::Value>, InfraError>;

    /// Create the resource. Returns [`InfraError::AlreadyExists`] when someone else won the race.
    async fn create(&self, desc: &ResourceDescriptor) -> Result<(), InfraError>;

    /// Count of units in `scope` satisfying `target`. Read-only.
    async fn count_ready(&self, scope: &str, target: ReadinessTarget) -> Result<usize, InfraError>;
}

/// Replication status as reported by one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationStatus {
    NotInitialized,
    Initialized {
        set_id: String,
        /// Member addresses without port.
        members: Vec<String>,
        /// Role of the member that answered.
        self_role: MemberRole,
    },
}

/// Data-store administrative channel, addressed per member.
#[async_trait]
pub trait AdminChannel: Send + Sync {
    /// Narrow data-plane reachability check.
    async fn ping(&self, address: &str) -> Result<(), AdminError>;

    async fn replication_status(&self, address: &str) -> Result<ReplicationStatus, AdminError>;

    /// Issue the one-time initiation command on `seed_address` for `topology`.
    async fn initiate(&self, seed_address: &str, topology: &TopologySpec) -> Result<(), AdminError>;
}
