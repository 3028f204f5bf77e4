//! Keel bootstrap: drives a replicated data store from nothing to a healthy,
//! initialized replication topology.
//!
//! Components, leaves first:
//! - [`ReadinessProbe`]: deadline-bounded polling of a side-effect-free condition
//! - [`ResourceProvisioner`]: ensure-semantics over a [`ControlPlane`]
//! - [`keel_core::allocate`]: pure member identity allocation
//! - [`TopologyInitiator`]: one-time initiation over an [`AdminChannel`]
//! - [`TopologyHealthChecker`]: role queries classified into a [`keel_core::HealthState`]
//! - [`BootstrapOrchestrator`]: the phase machine tying them together

#![forbid(unsafe_code)]

pub mod audit;
pub mod health;
pub mod initiate;
pub mod orchestrator;
pub mod probe;
pub mod provision;
pub mod run;

pub use audit::AuditSink;
pub use health::TopologyHealthChecker;
pub use initiate::TopologyInitiator;
pub use keel_core::ports::{AdminChannel, ControlPlane, ReadinessTarget, ReplicationStatus};
pub use orchestrator::{BootstrapOrchestrator, OrchestratorError};
pub use probe::{ProbeOutcome, ReadinessProbe};
pub use provision::ResourceProvisioner;
pub use run::{BootstrapRun, PhaseTransition};
pub use tokio_util::sync::CancellationToken;
