//! Member identity allocation.
//!
//! Naming scheme, stable across restarts and versions:
//! - `stable_name` = `member-<ordinal>`
//! - `address`     = `<stable_name>.<scope>`
//!
//! Both are computed from the ordinal, never stored, so a restarted run recomputes the
//! same topology without any allocation table.

use crate::{ClusterSpec, MemberIdentity, TopologySpec, MEMBER_PREFIX};

pub fn stable_name(ordinal: u32) -> String {
    format!("{}-{}", MEMBER_PREFIX, ordinal)
}

pub fn address(ordinal: u32, scope: &str) -> String {
    format!("{}.{}", stable_name(ordinal), scope)
}

/// Identities for ordinals `0..N`, in ordinal order. Pure.
pub fn allocate(spec: &ClusterSpec) -> Vec<MemberIdentity> {
    (0..spec.members)
        .map(|ordinal| MemberIdentity { ordinal, stable_name: stable_name(ordinal), address: address(ordinal, &spec.scope) })
        .collect()
}

pub fn topology(spec: &ClusterSpec) -> TopologySpec {
    TopologySpec { replication_set_id: spec.replication_set_id.clone(), members: allocate(spec) }
}

/// Inverse of [`address`]: `member-3.prod` -> `(3, "prod")`.
pub fn parse_address(addr: &str) -> Option<(u32, &str)> {
    let (name, scope) = addr.split_once('.')?;
    let ordinal = name.strip_prefix(MEMBER_PREFIX)?.strip_prefix('-')?.parse().ok()?;
    if scope.is_empty() { return None; }
    Some((ordinal, scope))
}
