//! The record of one bootstrap invocation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use keel_core::{
    BootstrapError, ClusterSpec, InitiationResult, Phase, ProvisionedResource, TopologyHealth, TopologySpec,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One bootstrap invocation. Created in `Provisioning`, ends in `Done` or `Failed`,
/// and is never driven again once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRun {
    pub run_id: Uuid,
    pub spec: ClusterSpec,
    pub phase: Phase,
    pub attempts: BTreeMap<Phase, u32>,
    pub error: Option<BootstrapError>,
    /// Phase that was running when the run failed.
    pub failed_phase: Option<Phase>,
    pub started_at: DateTime<Utc>,
    pub resources: Vec<ProvisionedResource>,
    pub topology: Option<TopologySpec>,
    pub seed: Option<u32>,
    pub initiation: Option<InitiationResult>,
    pub initiated_at: Option<DateTime<Utc>>,
    pub health: Option<TopologyHealth>,
}

impl BootstrapRun {
    pub fn new(spec: ClusterSpec) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            spec,
            phase: Phase::Provisioning,
            attempts: BTreeMap::new(),
            error: None,
            failed_phase: None,
            started_at: Utc::now(),
            resources: Vec::new(),
            topology: None,
            seed: None,
            initiation: None,
            initiated_at: None,
            health: None,
        }
    }

    pub fn is_terminal(&self) -> bool { self.phase.is_terminal() }
    pub fn succeeded(&self) -> bool { self.phase == Phase::Done }

    pub fn attempts(&self, phase: Phase) -> u32 { self.attempts.get(&phase).copied().unwrap_or(0) }

    pub(crate) fn bump(&mut self, phase: Phase) -> u32 {
        let n = self.attempts.entry(phase).or_insert(0);
        *n += 1;
        *n
    }

    pub(crate) fn record_resource(&mut self, res: ProvisionedResource) {
        match self.resources.iter_mut().find(|r| r.key == res.key) {
            Some(slot) => *slot = res,
            None => self.resources.push(res),
        }
    }

    /// One line an operator can act on.
    pub fn summary(&self) -> String {
        match (&self.phase, &self.error) {
            (Phase::Done, _) => {
                let set = self.topology.as_ref().map(|t| t.replication_set_id.as_str()).unwrap_or("-");
                let primary = self
                    .health
                    .as_ref()
                    .and_then(|h| h.primary())
                    .and_then(|o| self.topology.as_ref().and_then(|t| t.member(o)))
                    .map(|m| m.address.as_str())
                    .unwrap_or("-");
                format!("scope {} done: set {} healthy, primary {}", self.spec.scope, set, primary)
            }
            (Phase::Failed, Some(err)) => {
                let phase = self.failed_phase.unwrap_or(Phase::Provisioning);
                let advice = if err.is_operator_action_required() { "manual intervention required" } else { "safe to re-run" };
                format!(
                    "scope {} failed in {} after {} attempt(s): {} ({})",
                    self.spec.scope,
                    phase,
                    self.attempts(phase),
                    err,
                    advice
                )
            }
            (phase, _) => format!("scope {} in progress: {}", self.spec.scope, phase),
        }
    }
}

/// Audit row for one phase change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub run_id: Uuid,
    pub scope: String,
    pub from: Phase,
    pub to: Phase,
    /// Attempts spent in `from`.
    pub attempt: u32,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}
