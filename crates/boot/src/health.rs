//! Replication health classification.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use keel_core::ports::{AdminChannel, ReplicationStatus};
use keel_core::{AdminError, HealthState, MemberRole, TopologyHealth, TopologySpec};
use tracing::debug;

pub struct TopologyHealthChecker {
    admin: Arc<dyn AdminChannel>,
    grace: Duration,
}

impl TopologyHealthChecker {
    pub fn new(admin: Arc<dyn AdminChannel>, grace: Duration) -> Self {
        Self { admin, grace }
    }

    pub async fn check(&self, topology: &TopologySpec) -> TopologyHealth {
        self.check_since(topology, None).await
    }

    /// Check with knowledge of when initiation happened, so unsettled roles
    /// inside the grace window read as Converging rather than Degraded.
    pub async fn check_since(&self, topology: &TopologySpec, initiated_at: Option<DateTime<Utc>>) -> TopologyHealth {
        let observations = join_all(topology.members.iter().map(|m| async move {
            let role = match self.admin.replication_status(&m.address).await {
                Ok(ReplicationStatus::Initialized { self_role, .. }) => Some(self_role),
                Ok(ReplicationStatus::NotInitialized) | Err(AdminError::NotInitialized) => Some(MemberRole::Uninitialized),
                Err(AdminError::Unreachable(e)) => {
                    debug!(address = %m.address, error = %e, "member unreachable");
                    None
                }
                Err(_) => Some(MemberRole::Unknown),
            };
            (m.ordinal, role)
        }))
        .await;
        let health = classify(&observations, initiated_at, Utc::now(), self.grace);
        debug!(state = ?health.state, roles = ?health.per_member_role, "health observed");
        health
    }
}

/// Classify one round of observations; `None` means the member did not answer.
pub fn classify(
    observations: &[(u32, Option<MemberRole>)],
    initiated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grace: Duration,
) -> TopologyHealth {
    let n = observations.len();
    let per_member_role: BTreeMap<u32, MemberRole> =
        observations.iter().map(|(o, r)| (*o, r.unwrap_or(MemberRole::Unknown))).collect();
    let count = |want: MemberRole| observations.iter().filter(|(_, r)| *r == Some(want)).count();
    let unreachable = observations.iter().filter(|(_, r)| r.is_none()).count();
    let serving = observations.iter().filter(|(_, r)| r.map(|r| r.is_serving()).unwrap_or(false)).count();
    let primaries = count(MemberRole::Primary);
    let secondaries = count(MemberRole::Secondary);
    let pending = count(MemberRole::Startup) + count(MemberRole::Uninitialized);

    let within_grace = initiated_at
        .and_then(|t| (now - t).to_std().ok())
        .map(|since| since <= grace)
        .unwrap_or(false);

    let state = if n == 0 || unreachable == n {
        HealthState::Unreachable
    } else if unreachable > 0 {
        // Partial availability only if a strict majority still serves.
        if serving * 2 > n { HealthState::Degraded } else { HealthState::Unreachable }
    } else if count(MemberRole::Uninitialized) == n {
        HealthState::Uninitialized
    } else if primaries == 1 && secondaries == n - 1 {
        HealthState::Healthy
    } else if primaries == 0 && pending > 0 {
        HealthState::Initializing
    } else if within_grace {
        HealthState::Converging
    } else {
        HealthState::Degraded
    };

    TopologyHealth { state, per_member_role, last_observed_at: now }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MemberRole::*;

    fn at(now: DateTime<Utc>, obs: &[(u32, Option<MemberRole>)], initiated_secs_ago: Option<i64>) -> HealthState {
        let initiated = initiated_secs_ago.map(|s| now - chrono::Duration::seconds(s));
        classify(obs, initiated, now, Duration::from_secs(60)).state
    }

    #[test]
    fn one_primary_two_secondaries_is_healthy() {
        let now = Utc::now();
        let h = classify(&[(0, Some(Primary)), (1, Some(Secondary)), (2, Some(Secondary))], None, now, Duration::from_secs(60));
        assert_eq!(h.state, HealthState::Healthy);
        assert_eq!(h.primary(), Some(0));
        assert_eq!(h.last_observed_at, now);
    }

    #[test]
    fn one_unreachable_secondary_is_degraded() {
        let now = Utc::now();
        assert_eq!(at(now, &[(0, Some(Primary)), (1, Some(Secondary)), (2, None)], None), HealthState::Degraded);
    }

    #[test]
    fn all_unreachable_is_unreachable() {
        let now = Utc::now();
        assert_eq!(at(now, &[(0, None), (1, None), (2, None)], None), HealthState::Unreachable);
    }

    #[test]
    fn minority_serving_with_unreachable_members_is_unreachable() {
        let now = Utc::now();
        assert_eq!(at(now, &[(0, Some(Primary)), (1, None), (2, None)], None), HealthState::Unreachable);
        assert_eq!(at(now, &[(0, Some(Startup)), (1, Some(Secondary)), (2, None)], None), HealthState::Unreachable);
    }

    #[test]
    fn fresh_members_are_uninitialized_then_initializing() {
        let now = Utc::now();
        let fresh = [(0, Some(Uninitialized)), (1, Some(Uninitialized)), (2, Some(Uninitialized))];
        assert_eq!(at(now, &fresh, None), HealthState::Uninitialized);
        let starting = [(0, Some(Startup)), (1, Some(Secondary)), (2, Some(Uninitialized))];
        assert_eq!(at(now, &starting, Some(5)), HealthState::Initializing);
    }

    #[test]
    fn unsettled_roles_converge_within_grace_and_degrade_after() {
        let now = Utc::now();
        let two_primaries = [(0, Some(Primary)), (1, Some(Primary)), (2, Some(Secondary))];
        assert_eq!(at(now, &two_primaries, Some(10)), HealthState::Converging);
        assert_eq!(at(now, &two_primaries, Some(600)), HealthState::Degraded);
        assert_eq!(at(now, &two_primaries, None), HealthState::Degraded);
    }

    #[test]
    fn unknown_role_maps_unreachable_members() {
        let now = Utc::now();
        let h = classify(&[(0, Some(Primary)), (1, None)], None, now, Duration::from_secs(1));
        assert_eq!(h.per_member_role.get(&1), Some(&Unknown));
        // 1 of 2 is not a strict majority
        assert_eq!(h.state, HealthState::Unreachable);
    }
}
