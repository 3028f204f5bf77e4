#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use keel_boot::{AdminChannel, ControlPlane, ReadinessTarget, ReplicationStatus};
use keel_core::config::{BootstrapConfig, HealthConfig, ProbeConfig, ReadinessConfig, RetryPolicy};
use keel_core::{AdminError, InfraError, MemberRole, ResourceDescriptor, ResourceKey, ResourceKind, TopologySpec};

/// In-memory control plane. Objects live in a map; readiness counts are set by the test.
#[derive(Default)]
pub struct FakePlane {
    pub objects: Mutex<BTreeMap<ResourceKey, serde_json::Value>>,
    pub creates: Mutex<Vec<ResourceKey>>,
    ready_members: AtomicUsize,
    bound_claims: AtomicUsize,
    /// Remaining create calls that fail transiently.
    transient_creates: AtomicUsize,
    /// Remaining count_ready calls that fail.
    failing_counts: AtomicUsize,
    unsupported: Mutex<HashSet<ResourceKind>>,
}

impl FakePlane {
    pub fn new() -> Self { Self::default() }

    pub fn set_ready(&self, n: usize) {
        self.ready_members.store(n, Ordering::SeqCst);
        self.bound_claims.store(n, Ordering::SeqCst);
    }

    pub fn fail_creates(&self, n: usize) { self.transient_creates.store(n, Ordering::SeqCst); }
    pub fn fail_counts(&self, n: usize) { self.failing_counts.store(n, Ordering::SeqCst); }
    pub fn refuse(&self, kind: ResourceKind) { self.unsupported.lock().unwrap().insert(kind); }

    pub fn create_count(&self) -> usize { self.creates.lock().unwrap().len() }

    pub fn body(&self, kind: ResourceKind, name: &str, scope: &str) -> Option<serde_json::Value> {
        self.objects.lock().unwrap().get(&ResourceKey::new(kind, name, scope)).cloned()
    }

    /// Simulate a resource created out-of-band.
    pub fn insert(&self, kind: ResourceKind, name: &str, scope: &str, body: serde_json::Value) {
        self.objects.lock().unwrap().insert(ResourceKey::new(kind, name, scope), body);
    }
}

fn take_one(a: &AtomicUsize) -> bool {
    a.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

#[async_trait]
impl ControlPlane for FakePlane {
    async fn describe(&self, key: &ResourceKey) -> Result<Option<serde_json::Value>, InfraError> {
        if self.unsupported.lock().unwrap().contains(&key.kind) {
            return Err(InfraError::Unsupported(key.kind.to_string()));
        }
        Ok(self.objects.lock().unwrap().get(key).map(|body| {
            // The server adds bookkeeping the desired body never carries.
            let mut live = body.clone();
            if let Some(obj) = live.as_object_mut() {
                obj.insert("metadata".into(), serde_json::json!({"resourceVersion": "7", "uid": "abc"}));
            }
            live
        }))
    }

    async fn create(&self, desc: &ResourceDescriptor) -> Result<(), InfraError> {
        if take_one(&self.transient_creates) {
            return Err(InfraError::Transient("etcd leader changed".into()));
        }
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&desc.key) {
            return Err(InfraError::AlreadyExists);
        }
        objects.insert(desc.key.clone(), desc.body.clone());
        self.creates.lock().unwrap().push(desc.key.clone());
        Ok(())
    }

    async fn count_ready(&self, _scope: &str, target: ReadinessTarget) -> Result<usize, InfraError> {
        if take_one(&self.failing_counts) {
            return Err(InfraError::Transient("list timed out".into()));
        }
        Ok(match target {
            ReadinessTarget::SchedulableMembers => self.ready_members.load(Ordering::SeqCst),
            ReadinessTarget::BoundClaims => self.bound_claims.load(Ordering::SeqCst),
        })
    }
}

#[derive(Debug, Clone)]
struct MemberState {
    reachable: bool,
    status: ReplicationStatus,
}

/// In-memory replication admin. Members start reachable and uninitialized.
pub struct FakeAdmin {
    members: Mutex<HashMap<String, MemberState>>,
    pub initiate_calls: AtomicUsize,
    /// Status reads of secondaries that still report Startup after initiation.
    startup_reads: AtomicUsize,
    /// Every member drops off the network once initiation succeeds.
    vanish_after_initiate: AtomicBool,
    /// Another runner initiates this set between our pre-check and our command.
    rival: Mutex<Option<(String, Vec<String>)>>,
}

impl FakeAdmin {
    pub fn new(topology: &TopologySpec) -> Self {
        let members = topology
            .members
            .iter()
            .map(|m| (m.address.clone(), MemberState { reachable: true, status: ReplicationStatus::NotInitialized }))
            .collect();
        Self {
            members: Mutex::new(members),
            initiate_calls: AtomicUsize::new(0),
            startup_reads: AtomicUsize::new(0),
            vanish_after_initiate: AtomicBool::new(false),
            rival: Mutex::new(None),
        }
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if let Some(m) = self.members.lock().unwrap().get_mut(address) {
            m.reachable = reachable;
        }
    }

    pub fn set_all_reachable(&self, reachable: bool) {
        for m in self.members.lock().unwrap().values_mut() {
            m.reachable = reachable;
        }
    }

    pub fn set_status(&self, address: &str, status: ReplicationStatus) {
        if let Some(m) = self.members.lock().unwrap().get_mut(address) {
            m.status = status;
        }
    }

    pub fn lag_secondaries(&self, reads: usize) { self.startup_reads.store(reads, Ordering::SeqCst); }

    pub fn initiations(&self) -> usize { self.initiate_calls.load(Ordering::SeqCst) }

    pub fn vanish_after_initiate(&self) { self.vanish_after_initiate.store(true, Ordering::SeqCst); }

    /// The next initiate finds the members already configured as `set_id` over `members`.
    pub fn lose_race_to(&self, set_id: &str, members: Vec<String>) {
        *self.rival.lock().unwrap() = Some((set_id.to_string(), members));
    }
}

#[async_trait]
impl AdminChannel for FakeAdmin {
    async fn ping(&self, address: &str) -> Result<(), AdminError> {
        match self.members.lock().unwrap().get(address) {
            Some(m) if m.reachable => Ok(()),
            _ => Err(AdminError::Unreachable(format!("{}: connection refused", address))),
        }
    }

    async fn replication_status(&self, address: &str) -> Result<ReplicationStatus, AdminError> {
        let st = match self.members.lock().unwrap().get(address) {
            Some(m) if m.reachable => m.status.clone(),
            _ => return Err(AdminError::Unreachable(format!("{}: connection refused", address))),
        };
        match st {
            ReplicationStatus::Initialized { set_id, members, self_role: MemberRole::Secondary }
                if take_one(&self.startup_reads) =>
            {
                Ok(ReplicationStatus::Initialized { set_id, members, self_role: MemberRole::Startup })
            }
            other => Ok(other),
        }
    }

    async fn initiate(&self, seed_address: &str, topology: &TopologySpec) -> Result<(), AdminError> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        let mut members = self.members.lock().unwrap();
        match members.get(seed_address) {
            Some(m) if !m.reachable => return Err(AdminError::Unreachable(seed_address.to_string())),
            None => return Err(AdminError::Unreachable(seed_address.to_string())),
            Some(m) if matches!(m.status, ReplicationStatus::Initialized { .. }) => return Err(AdminError::AlreadyInitialized),
            Some(_) => {}
        }
        if let Some((set_id, addrs)) = self.rival.lock().unwrap().take() {
            for (addr, st) in members.iter_mut() {
                let role = if addr == seed_address { MemberRole::Primary } else { MemberRole::Secondary };
                st.status = ReplicationStatus::Initialized { set_id: set_id.clone(), members: addrs.clone(), self_role: role };
            }
            return Err(AdminError::AlreadyInitialized);
        }
        let addrs: Vec<String> = topology.members.iter().map(|m| m.address.clone()).collect();
        for m in &topology.members {
            if let Some(st) = members.get_mut(&m.address) {
                let role = if m.address == seed_address { MemberRole::Primary } else { MemberRole::Secondary };
                st.status = ReplicationStatus::Initialized {
                    set_id: topology.replication_set_id.clone(),
                    members: addrs.clone(),
                    self_role: role,
                };
            }
        }
        if self.vanish_after_initiate.load(Ordering::SeqCst) {
            for st in members.values_mut() {
                st.reachable = false;
            }
        }
        Ok(())
    }
}

/// Short budgets so paused-clock tests stay small.
pub fn fast_config() -> BootstrapConfig {
    let quick = RetryPolicy::new(3, std::time::Duration::from_millis(100), std::time::Duration::from_millis(400));
    BootstrapConfig {
        provision: quick.clone(),
        readiness: ReadinessConfig {
            probe: ProbeConfig {
                timeout_ms: 10_000,
                poll_interval_ms: 500,
                max_poll_interval_ms: 2_000,
                backoff_multiplier: 2.0,
                max_consecutive_errors: 3,
            },
            rounds: 1,
        },
        reachability: quick.clone(),
        initiate: quick,
        health: HealthConfig { deadline_ms: 30_000, poll_interval_ms: 1_000, grace_ms: 60_000, unreachable_tolerance: 2 },
    }
}
