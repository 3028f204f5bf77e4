//! The bootstrap phase machine.
//!
//! ```text
//! Provisioning -> AwaitingReadiness -> AllocatingIdentities -> Initiating -> VerifyingHealth -> Done
//!       \_____________________________________________________________________________/-> Failed
//! ```
//!
//! Phases run strictly in order. Each phase retries in place under its own budget and
//! classifies its errors; the first unrecoverable error moves the run to `Failed`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_core::config::BootstrapConfig;
use keel_core::plan::ProvisionPlan;
use keel_core::ports::{AdminChannel, ControlPlane, ReadinessTarget};
use keel_core::{topology, BootstrapError, ClusterSpec, HealthState, InitiationFailure, InitiationResult, Phase, ProvisionFailure, ResourceState};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::health::TopologyHealthChecker;
use crate::initiate::TopologyInitiator;
use crate::probe::{deadline_after, ProbeOutcome, ReadinessProbe};
use crate::provision::ResourceProvisioner;
use crate::run::{BootstrapRun, PhaseTransition};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("run {0} is already terminal ({1}); start a fresh run")]
    AlreadyTerminal(Uuid, Phase),
}

pub struct BootstrapOrchestrator {
    plane: Arc<dyn ControlPlane>,
    provisioner: ResourceProvisioner,
    initiator: TopologyInitiator,
    health: TopologyHealthChecker,
    cfg: BootstrapConfig,
    audit: Option<Arc<dyn AuditSink>>,
}

impl BootstrapOrchestrator {
    pub fn new(plane: Arc<dyn ControlPlane>, admin: Arc<dyn AdminChannel>, cfg: BootstrapConfig) -> Self {
        Self {
            provisioner: ResourceProvisioner::new(plane.clone()),
            plane,
            initiator: TopologyInitiator::new(admin.clone()),
            health: TopologyHealthChecker::new(admin, cfg.health.grace()),
            cfg,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn provisioner(&self) -> &ResourceProvisioner { &self.provisioner }

    /// Start a fresh run for `spec` and drive it to a terminal phase.
    pub async fn run(&self, spec: ClusterSpec, cancel: CancellationToken) -> BootstrapRun {
        let mut run = BootstrapRun::new(spec);
        info!(scope = %run.spec.scope, run_id = %run.run_id, members = run.spec.members, "bootstrap started");
        if let Err(e) = self.drive(&mut run, &cancel).await {
            // A run we just created cannot be terminal.
            error!(error = %e, "bootstrap refused");
        }
        run
    }

    /// Drive `run` until it is `Done` or `Failed`. Terminal runs are refused.
    pub async fn drive(&self, run: &mut BootstrapRun, cancel: &CancellationToken) -> Result<(), OrchestratorError> {
        if run.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal(run.run_id, run.phase));
        }
        if let Err(e) = run.spec.validate() {
            self.fail(run, e);
            return Ok(());
        }
        while !run.is_terminal() {
            if cancel.is_cancelled() {
                self.fail(run, BootstrapError::Cancelled);
                break;
            }
            let phase = run.phase;
            let t0 = Instant::now();
            let res = match phase {
                Phase::Provisioning => self.provision(run, cancel).await,
                Phase::AwaitingReadiness => self.await_readiness(run, cancel).await,
                Phase::AllocatingIdentities => {
                    self.allocate(run);
                    Ok(())
                }
                Phase::Initiating => self.initiate(run, cancel).await,
                Phase::VerifyingHealth => self.verify_health(run, cancel).await,
                Phase::Done | Phase::Failed => break,
            };
            histogram!("boot_phase_ms", t0.elapsed().as_secs_f64() * 1000.0, "phase" => phase.as_str());
            match (res, phase.next()) {
                (Ok(()), Some(next)) => self.transition(run, next, None),
                (Ok(()), None) => break,
                (Err(e), _) => self.fail(run, e),
            }
        }
        info!(scope = %run.spec.scope, run_id = %run.run_id, phase = %run.phase, "{}", run.summary());
        Ok(())
    }

    async fn provision(&self, run: &mut BootstrapRun, cancel: &CancellationToken) -> Result<(), BootstrapError> {
        let plan = ProvisionPlan::for_cluster(&run.spec);
        let policy = &self.cfg.provision;
        for (tier_no, tier) in plan.tiers.iter().enumerate() {
            let mut pending: Vec<_> = tier.iter().collect();
            let mut attempt = 0u32;
            loop {
                check(cancel)?;
                attempt += 1;
                run.bump(Phase::Provisioning);
                let results = self.provisioner.ensure_all(pending.iter().copied()).await;
                let mut retry = Vec::new();
                for (desc, res) in pending.iter().zip(results) {
                    let state = res.state.clone();
                    run.record_resource(res);
                    match state {
                        ResourceState::Exists => {}
                        ResourceState::Failed(ProvisionFailure::Conflict(r)) => {
                            return Err(BootstrapError::Conflict(format!("{}: {}", desc.key, r)));
                        }
                        ResourceState::Failed(ProvisionFailure::Unsupported(r)) => {
                            return Err(BootstrapError::Unsupported(format!("{}: {}", desc.key, r)));
                        }
                        ResourceState::Failed(ProvisionFailure::Transient(r)) => retry.push((*desc, r)),
                        ResourceState::Requested => retry.push((*desc, "still requested".to_string())),
                    }
                }
                if retry.is_empty() {
                    debug!(tier = tier_no, resources = tier.len(), "tier ensured");
                    break;
                }
                if policy.exhausted(attempt) {
                    let (desc, reason) = &retry[0];
                    return Err(BootstrapError::RetryableInfra(format!(
                        "{} still failing after {} attempts: {}",
                        desc.key, attempt, reason
                    )));
                }
                let delay = policy.delay_for(attempt);
                warn!(tier = tier_no, attempt, failing = retry.len(), delay_ms = delay.as_millis() as u64, "transient provisioning failures; retrying");
                pause(cancel, delay).await?;
                pending = retry.into_iter().map(|(d, _)| d).collect();
            }
        }
        Ok(())
    }

    async fn await_readiness(&self, run: &mut BootstrapRun, cancel: &CancellationToken) -> Result<(), BootstrapError> {
        let want = run.spec.members as usize;
        let scope = run.spec.scope.clone();
        let rounds = self.cfg.readiness.rounds.max(1);
        let probe = ReadinessProbe::new(self.cfg.readiness.probe.clone(), cancel.clone());
        let mut last = ReadinessTarget::SchedulableMembers;
        for round in 1..=rounds {
            check(cancel)?;
            run.bump(Phase::AwaitingReadiness);
            let mut timed_out = false;
            for target in [ReadinessTarget::SchedulableMembers, ReadinessTarget::BoundClaims] {
                last = target;
                let what = format!("{} {:?} >= {}", scope, target, want);
                let outcome = probe
                    .wait(&what, || {
                        let plane = self.plane.clone();
                        let scope = scope.clone();
                        async move { plane.count_ready(&scope, target).await.map(|n| n >= want) }
                    })
                    .await;
                match outcome {
                    ProbeOutcome::Ready => {}
                    ProbeOutcome::TimedOut => {
                        timed_out = true;
                        break;
                    }
                    ProbeOutcome::ProbeError(e) => {
                        return Err(BootstrapError::RetryableInfra(format!("readiness of {:?} unknowable: {}", target, e)));
                    }
                    ProbeOutcome::Cancelled => return Err(BootstrapError::Cancelled),
                }
            }
            if !timed_out {
                return Ok(());
            }
            warn!(scope = %scope, round, rounds, target = ?last, "readiness wait timed out");
        }
        Err(BootstrapError::Timeout(format!("{:?} below {} after {} readiness rounds", last, want, rounds)))
    }

    fn allocate(&self, run: &mut BootstrapRun) {
        run.bump(Phase::AllocatingIdentities);
        let t = topology(&run.spec);
        info!(scope = %run.spec.scope, set = %t.replication_set_id, members = ?t.members.iter().map(|m| m.address.as_str()).collect::<Vec<_>>(), "identities allocated");
        run.topology = Some(t);
    }

    async fn find_seed(&self, run: &BootstrapRun, cancel: &CancellationToken) -> Result<u32, BootstrapError> {
        let topology = run.topology.clone().unwrap_or_else(|| topology(&run.spec));
        let policy = &self.cfg.reachability;
        let mut attempt = 0u32;
        loop {
            check(cancel)?;
            attempt += 1;
            if let Some(seed) = self.initiator.select_seed(&topology).await {
                return Ok(seed);
            }
            if policy.exhausted(attempt) {
                return Err(BootstrapError::Unreachable(format!("no member of {} reachable after {} attempts", run.spec.scope, attempt)));
            }
            let delay = policy.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "no reachable seed yet");
            pause(cancel, delay).await?;
        }
    }

    async fn initiate(&self, run: &mut BootstrapRun, cancel: &CancellationToken) -> Result<(), BootstrapError> {
        let topology = match &run.topology {
            Some(t) => t.clone(),
            None => topology(&run.spec),
        };
        let policy = &self.cfg.initiate;
        let mut attempt = 0u32;
        loop {
            check(cancel)?;
            let seed = self.find_seed(run, cancel).await?;
            run.seed = Some(seed);
            attempt += 1;
            run.bump(Phase::Initiating);
            let res = self.initiator.initiate(&topology, seed).await;
            run.initiation = Some(res.clone());
            match res {
                InitiationResult::Initiated => {
                    run.initiated_at = Some(Utc::now());
                    info!(seed, set = %topology.replication_set_id, "replication initiated");
                    return Ok(());
                }
                InitiationResult::AlreadyInitiated => {
                    info!(seed, set = %topology.replication_set_id, "replication already initiated; continuing");
                    return Ok(());
                }
                InitiationResult::Failed(InitiationFailure::ConflictingTopology(r)) => return Err(BootstrapError::Conflict(r)),
                InitiationResult::Failed(InitiationFailure::Rejected(r)) => {
                    return Err(BootstrapError::Conflict(format!("initiation rejected: {}", r)))
                }
                InitiationResult::Failed(InitiationFailure::Unreachable(r)) => {
                    if policy.exhausted(attempt) {
                        return Err(BootstrapError::Unreachable(format!("initiation failed after {} attempts: {}", attempt, r)));
                    }
                    let delay = policy.delay_for(attempt);
                    warn!(seed, attempt, delay_ms = delay.as_millis() as u64, reason = %r, "seed unreachable; retrying initiation");
                    pause(cancel, delay).await?;
                }
            }
        }
    }

    async fn verify_health(&self, run: &mut BootstrapRun, cancel: &CancellationToken) -> Result<(), BootstrapError> {
        let topology = match &run.topology {
            Some(t) => t.clone(),
            None => topology(&run.spec),
        };
        let hc = &self.cfg.health;
        let deadline = deadline_after(hc.deadline());
        let mut unreachable_streak = 0u32;
        loop {
            check(cancel)?;
            run.bump(Phase::VerifyingHealth);
            let h = self.health.check_since(&topology, run.initiated_at).await;
            let state = h.state;
            run.health = Some(h);
            match state {
                HealthState::Healthy => return Ok(()),
                HealthState::Unreachable => {
                    unreachable_streak += 1;
                    if unreachable_streak > hc.unreachable_tolerance {
                        return Err(BootstrapError::Unreachable(format!(
                            "topology unreachable in {} consecutive checks",
                            unreachable_streak
                        )));
                    }
                }
                other => {
                    unreachable_streak = 0;
                    debug!(state = ?other, "topology not healthy yet");
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BootstrapError::Timeout(format!("topology not healthy after {:?} (last state {:?})", hc.deadline(), state)));
            }
            pause(cancel, hc.poll_interval().min(deadline - now)).await?;
        }
    }

    fn transition(&self, run: &mut BootstrapRun, to: Phase, err: Option<&BootstrapError>) {
        let from = run.phase;
        run.phase = to;
        let rec = PhaseTransition {
            run_id: run.run_id,
            scope: run.spec.scope.clone(),
            from,
            to,
            attempt: run.attempts(from),
            error_kind: err.map(|e| e.kind().to_string()),
            error: err.map(|e| e.to_string()),
            at: Utc::now(),
        };
        info!(scope = %rec.scope, run_id = %rec.run_id, from = %from, to = %to, attempt = rec.attempt, "phase transition");
        counter!("boot_phase_transitions_total", 1u64, "to" => to.as_str());
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record(&rec) {
                warn!(error = %e, "audit append failed; continuing");
            }
        }
    }

    fn fail(&self, run: &mut BootstrapRun, e: BootstrapError) {
        error!(scope = %run.spec.scope, phase = %run.phase, kind = e.kind(), error = %e, "bootstrap failed");
        counter!("boot_failures_total", 1u64, "kind" => e.kind());
        run.failed_phase = Some(run.phase);
        run.error = Some(e.clone());
        self.transition(run, Phase::Failed, Some(&e));
    }
}

fn check(cancel: &CancellationToken) -> Result<(), BootstrapError> {
    if cancel.is_cancelled() { Err(BootstrapError::Cancelled) } else { Ok(()) }
}

async fn pause(cancel: &CancellationToken, d: Duration) -> Result<(), BootstrapError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(BootstrapError::Cancelled),
        _ = tokio::time::sleep(d) => Ok(()),
    }
}
