//! One-time replication initiation.

use std::sync::Arc;

use keel_core::ports::{AdminChannel, ReplicationStatus};
use keel_core::{AdminError, InitiationFailure, InitiationResult, TopologySpec};
use metrics::counter;
use tracing::{debug, info, warn};

/// Issues the initiation command against a seed member.
///
/// Safe to call repeatedly: if any reachable member already belongs to a topology,
/// the call reports [`InitiationResult::AlreadyInitiated`] (same set, same members)
/// or a conflict, and never re-initializes.
pub struct TopologyInitiator {
    admin: Arc<dyn AdminChannel>,
}

impl TopologyInitiator {
    pub fn new(admin: Arc<dyn AdminChannel>) -> Self {
        Self { admin }
    }

    /// Lowest ordinal whose member answers on the data-plane port.
    pub async fn select_seed(&self, topology: &TopologySpec) -> Option<u32> {
        let mut members: Vec<_> = topology.members.iter().collect();
        members.sort_by_key(|m| m.ordinal);
        for m in members {
            match self.admin.ping(&m.address).await {
                Ok(()) => return Some(m.ordinal),
                Err(e) => debug!(address = %m.address, error = %e, "seed candidate unreachable"),
            }
        }
        None
    }

    pub async fn initiate(&self, topology: &TopologySpec, seed_ordinal: u32) -> InitiationResult {
        let res = self.initiate_inner(topology, seed_ordinal).await;
        let label = match &res {
            InitiationResult::Initiated => "initiated",
            InitiationResult::AlreadyInitiated => "already",
            InitiationResult::Failed(_) => "failed",
        };
        counter!("initiate_total", 1u64, "result" => label);
        res
    }

    async fn initiate_inner(&self, topology: &TopologySpec, seed_ordinal: u32) -> InitiationResult {
        let Some(seed) = topology.member(seed_ordinal) else {
            return InitiationResult::Failed(InitiationFailure::Rejected(format!("seed ordinal {} is not in the topology", seed_ordinal)));
        };

        // Reachability is re-checked right before initiating.
        if let Err(e) = self.admin.ping(&seed.address).await {
            return InitiationResult::Failed(InitiationFailure::Unreachable(format!("{}: {}", seed.address, e)));
        }

        for m in &topology.members {
            match self.admin.replication_status(&m.address).await {
                Ok(ReplicationStatus::NotInitialized) | Err(AdminError::NotInitialized) => {}
                Ok(ReplicationStatus::Initialized { set_id, members, .. }) => {
                    return classify_existing(topology, &m.address, &set_id, &members);
                }
                Err(AdminError::Unreachable(e)) if m.ordinal != seed_ordinal => {
                    debug!(address = %m.address, error = %e, "member unreachable during pre-check; skipping");
                }
                Err(AdminError::Unreachable(e)) => {
                    return InitiationResult::Failed(InitiationFailure::Unreachable(format!("{}: {}", seed.address, e)));
                }
                Err(e) => {
                    return InitiationResult::Failed(InitiationFailure::Rejected(format!("status of {}: {}", m.address, e)));
                }
            }
        }

        info!(seed = %seed.address, set = %topology.replication_set_id, members = topology.len(), "initiating replication");
        match self.admin.initiate(&seed.address, topology).await {
            Ok(()) => InitiationResult::Initiated,
            Err(AdminError::AlreadyInitialized) => {
                // Someone initialized between the pre-check and our command.
                match self.admin.replication_status(&seed.address).await {
                    Ok(ReplicationStatus::Initialized { set_id, members, .. }) => {
                        classify_existing(topology, &seed.address, &set_id, &members)
                    }
                    Ok(ReplicationStatus::NotInitialized) | Err(_) => InitiationResult::Failed(InitiationFailure::Unreachable(format!(
                        "{} reported already initialized but status is unavailable",
                        seed.address
                    ))),
                }
            }
            Err(AdminError::Unreachable(e)) => InitiationResult::Failed(InitiationFailure::Unreachable(format!("{}: {}", seed.address, e))),
            Err(e) => InitiationResult::Failed(InitiationFailure::Rejected(e.to_string())),
        }
    }
}

fn classify_existing(topology: &TopologySpec, reporter: &str, set_id: &str, members: &[String]) -> InitiationResult {
    if set_id == topology.replication_set_id && topology.same_members(members) {
        info!(reporter, set = set_id, "topology already initiated");
        InitiationResult::AlreadyInitiated
    } else {
        warn!(reporter, set = set_id, existing = ?members, "member belongs to a different topology");
        InitiationResult::Failed(InitiationFailure::ConflictingTopology(format!(
            "{} is in set {:?} with members [{}], wanted set {:?} with {} members",
            reporter,
            set_id,
            members.join(", "),
            topology.replication_set_id,
            topology.len()
        )))
    }
}
