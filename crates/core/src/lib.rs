//! Keel core types: cluster spec, provisioned resources, member identities,
//! replication topology and bootstrap phases.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod allocate;
pub mod config;
pub mod drift;
pub mod error;
pub mod plan;
pub mod ports;

pub use allocate::{allocate, topology};
pub use error::{AdminError, BootstrapError, InfraError};

/// Prefix of every member's stable name (`member-<ordinal>`).
pub const MEMBER_PREFIX: &str = "member";
/// Name of the volume claim template; claims are named `data-member-<ordinal>`.
pub const CLAIM_TEMPLATE: &str = "data";
/// Container running the data store in every member pod; admin commands exec into it.
pub const DATA_CONTAINER: &str = "mongod";
/// Label carried by every workload pod of a scope.
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

fn default_set_id() -> String { "rs0".to_string() }
fn default_data_port() -> u16 { 27017 }
fn default_image() -> String { "mongo:7.0".to_string() }

/// Desired shape of one replicated data store. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Namespacing key isolating this cluster's resources and identities.
    pub scope: String,
    /// Desired member count N.
    pub members: u32,
    pub compute_class: String,
    /// Storage request per member, e.g. "10Gi".
    pub storage_size: String,
    /// Storage class name; defaults to `<scope>-sc`.
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Provisioner backing the storage class.
    #[serde(default)]
    pub storage_provisioner: Option<String>,
    /// Opaque reference to credentials held by the platform (never read here).
    #[serde(default)]
    pub credential_ref: Option<String>,
    #[serde(default = "default_set_id")]
    pub replication_set_id: String,
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    #[serde(default = "default_image")]
    pub image: String,
    /// Chart release replacing the built-in stateful workload.
    #[serde(default)]
    pub release: Option<ReleaseSpec>,
    /// Compute cluster and node pool to ensure before anything else.
    #[serde(default)]
    pub compute: Option<ComputeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSpec {
    pub name: String,
    pub chart: String,
    pub version: String,
    #[serde(default)]
    pub values: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeSpec {
    pub cluster_name: String,
    pub node_count: u32,
}

impl ClusterSpec {
    /// Minimal spec with defaults for everything optional.
    pub fn new(scope: impl Into<String>, members: u32) -> Self {
        Self {
            scope: scope.into(),
            members,
            compute_class: "standard".to_string(),
            storage_size: "10Gi".to_string(),
            storage_class: None,
            storage_provisioner: None,
            credential_ref: None,
            replication_set_id: default_set_id(),
            data_port: default_data_port(),
            image: default_image(),
            release: None,
            compute: None,
        }
    }

    pub fn storage_class_name(&self) -> String {
        self.storage_class.clone().unwrap_or_else(|| format!("{}-sc", self.scope))
    }

    pub fn validate(&self) -> Result<(), BootstrapError> {
        if self.members == 0 {
            return Err(BootstrapError::InvalidSpec("member count must be at least 1".into()));
        }
        if !is_dns_label(&self.scope) {
            return Err(BootstrapError::InvalidSpec(format!(
                "scope {:?} is not a DNS label (lowercase alphanumerics and '-', at most 63 chars)",
                self.scope
            )));
        }
        if self.storage_size.trim().is_empty() {
            return Err(BootstrapError::InvalidSpec("storage size must not be empty".into()));
        }
        if self.replication_set_id.trim().is_empty() {
            return Err(BootstrapError::InvalidSpec("replication set id must not be empty".into()));
        }
        if self.members % 2 == 0 {
            tracing::warn!(scope = %self.scope, members = self.members, "even member count cannot tolerate a split vote");
        }
        Ok(())
    }
}

fn is_dns_label(s: &str) -> bool {
    let b = s.as_bytes();
    !b.is_empty()
        && b.len() <= 63
        && b.iter().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == b'-')
        && b[0] != b'-'
        && b[b.len() - 1] != b'-'
}

// ---- resources ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    ComputeCluster,
    NodePool,
    Namespace,
    StorageClass,
    Service,
    PersistentVolumeClaim,
    StatefulSet,
    Release,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ComputeCluster => "ComputeCluster",
            ResourceKind::NodePool => "NodePool",
            ResourceKind::Namespace => "Namespace",
            ResourceKind::StorageClass => "StorageClass",
            ResourceKind::Service => "Service",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Release => "Release",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Identity of a resource: ensure-semantics are keyed on this triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: String,
    pub scope: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self { kind, name: name.into(), scope: scope.into() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.scope, self.name)
    }
}

/// What should exist: the key plus the desired body (kind-specific fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub key: ResourceKey,
    pub body: serde_json::Value,
}

impl ResourceDescriptor {
    pub fn new(kind: ResourceKind, name: impl Into<String>, scope: impl Into<String>, body: serde_json::Value) -> Self {
        Self { key: ResourceKey::new(kind, name, scope), body }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionFailure {
    /// Exists with an incompatible spec; never mutated, never retried.
    Conflict(String),
    Transient(String),
    /// No collaborator can provision this kind.
    Unsupported(String),
}

impl ProvisionFailure {
    pub fn is_retryable(&self) -> bool { matches!(self, ProvisionFailure::Transient(_)) }

    pub fn reason(&self) -> &str {
        match self {
            ProvisionFailure::Conflict(r) | ProvisionFailure::Transient(r) | ProvisionFailure::Unsupported(r) => r,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    Requested,
    Exists,
    Failed(ProvisionFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    #[serde(flatten)]
    pub key: ResourceKey,
    pub state: ResourceState,
}

impl ProvisionedResource {
    pub fn exists(&self) -> bool { self.state == ResourceState::Exists }

    pub fn failure(&self) -> Option<&ProvisionFailure> {
        match &self.state {
            ResourceState::Failed(f) => Some(f),
            _ => None,
        }
    }
}

// ---- members & topology ----

/// One member of the replicated set. `stable_name` and `address` derive from `ordinal`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberIdentity {
    pub ordinal: u32,
    pub stable_name: String,
    pub address: String,
}

impl MemberIdentity {
    /// `address:port`, the host entry used in the replication config.
    pub fn endpoint(&self, port: u16) -> String { format!("{}:{}", self.address, port) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpec {
    pub replication_set_id: String,
    pub members: Vec<MemberIdentity>,
}

impl TopologySpec {
    pub fn len(&self) -> usize { self.members.len() }
    pub fn is_empty(&self) -> bool { self.members.is_empty() }

    pub fn member(&self, ordinal: u32) -> Option<&MemberIdentity> {
        self.members.iter().find(|m| m.ordinal == ordinal)
    }

    /// True when `addresses` names exactly this topology's members (any order).
    pub fn same_members(&self, addresses: &[String]) -> bool {
        if addresses.len() != self.members.len() { return false; }
        self.members.iter().all(|m| addresses.iter().any(|a| a == &m.address))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    Primary,
    Secondary,
    /// Member is loading its replication config or syncing.
    Startup,
    /// Reachable but not part of any replication topology yet.
    Uninitialized,
    Unknown,
}

impl MemberRole {
    /// Primary/Secondary: the roles that count toward a serving majority.
    pub fn is_serving(&self) -> bool { matches!(self, MemberRole::Primary | MemberRole::Secondary) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Uninitialized,
    Initializing,
    Converging,
    Healthy,
    Degraded,
    Unreachable,
}

/// Fresh snapshot; never merged with a previous observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyHealth {
    pub state: HealthState,
    pub per_member_role: BTreeMap<u32, MemberRole>,
    pub last_observed_at: DateTime<Utc>,
}

impl TopologyHealth {
    pub fn primary(&self) -> Option<u32> {
        self.per_member_role.iter().find(|(_, r)| **r == MemberRole::Primary).map(|(o, _)| *o)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitiationFailure {
    /// Seed did not answer on the data-plane port. Retryable.
    Unreachable(String),
    /// Members already belong to a different topology. Needs an operator.
    ConflictingTopology(String),
    /// Data store refused the initiation command.
    Rejected(String),
}

impl InitiationFailure {
    pub fn is_retryable(&self) -> bool { matches!(self, InitiationFailure::Unreachable(_)) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitiationResult {
    Initiated,
    AlreadyInitiated,
    Failed(InitiationFailure),
}

// ---- run phases ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Provisioning,
    AwaitingReadiness,
    AllocatingIdentities,
    Initiating,
    VerifyingHealth,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool { matches!(self, Phase::Done | Phase::Failed) }

    /// Successor on success; terminal phases have none.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Provisioning => Some(Phase::AwaitingReadiness),
            Phase::AwaitingReadiness => Some(Phase::AllocatingIdentities),
            Phase::AllocatingIdentities => Some(Phase::Initiating),
            Phase::Initiating => Some(Phase::VerifyingHealth),
            Phase::VerifyingHealth => Some(Phase::Done),
            Phase::Done | Phase::Failed => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Provisioning => "Provisioning",
            Phase::AwaitingReadiness => "AwaitingReadiness",
            Phase::AllocatingIdentities => "AllocatingIdentities",
            Phase::Initiating => "Initiating",
            Phase::VerifyingHealth => "VerifyingHealth",
            Phase::Done => "Done",
            Phase::Failed => "Failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

pub mod prelude {
    pub use super::{
        ClusterSpec, HealthState, InitiationFailure, InitiationResult, MemberIdentity, MemberRole, Phase,
        ProvisionFailure, ProvisionedResource, ResourceDescriptor, ResourceKey, ResourceKind, ResourceState,
        TopologyHealth, TopologySpec,
    };
    pub use super::error::{AdminError, BootstrapError, InfraError};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_members_and_bad_scope() {
        assert!(matches!(ClusterSpec::new("test", 0).validate(), Err(BootstrapError::InvalidSpec(_))));
        assert!(matches!(ClusterSpec::new("Bad_Scope", 3).validate(), Err(BootstrapError::InvalidSpec(_))));
        assert!(matches!(ClusterSpec::new("-lead", 3).validate(), Err(BootstrapError::InvalidSpec(_))));
        assert!(ClusterSpec::new("test", 3).validate().is_ok());
        // even counts are allowed, only warned about
        assert!(ClusterSpec::new("test", 2).validate().is_ok());
    }

    #[test]
    fn storage_class_defaults_to_scope_suffix() {
        let mut spec = ClusterSpec::new("test", 3);
        assert_eq!(spec.storage_class_name(), "test-sc");
        spec.storage_class = Some("fast".into());
        assert_eq!(spec.storage_class_name(), "fast");
    }

    #[test]
    fn cluster_spec_reads_yaml_with_defaults() {
        let y = "scope: prod\nmembers: 5\ncomputeClass: m5.large\nstorageSize: 50Gi\n";
        let spec: ClusterSpec = serde_yaml::from_str(y).unwrap();
        assert_eq!(spec.members, 5);
        assert_eq!(spec.replication_set_id, "rs0");
        assert_eq!(spec.data_port, 27017);
        assert!(spec.release.is_none());
    }

    #[test]
    fn phases_advance_linearly_and_stop_at_done() {
        let mut p = Phase::Provisioning;
        let mut seen = vec![p];
        while let Some(n) = p.next() { seen.push(n); p = n; }
        assert_eq!(seen.last(), Some(&Phase::Done));
        assert_eq!(seen.len(), 6);
        assert!(Phase::Failed.next().is_none());
        assert!(Phase::Failed.is_terminal());
    }

    #[test]
    fn same_members_ignores_order() {
        let t = topology(&ClusterSpec::new("test", 3));
        let addrs = vec!["member-2.test".to_string(), "member-0.test".to_string(), "member-1.test".to_string()];
        assert!(t.same_members(&addrs));
        assert!(!t.same_members(&addrs[..2]));
    }
}
