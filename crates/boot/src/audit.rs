//! Where phase transitions go for later diagnosis.

use anyhow::Result;
use keel_persist::{AuditRecord, AuditStore, SqliteStore};

use crate::run::PhaseTransition;

/// Receives every phase transition. Failures are logged by the caller, never fatal.
pub trait AuditSink: Send + Sync {
    fn record(&self, t: &PhaseTransition) -> Result<()>;
}

impl From<&PhaseTransition> for AuditRecord {
    fn from(t: &PhaseTransition) -> Self {
        AuditRecord {
            scope: t.scope.clone(),
            ts: t.at.timestamp_millis(),
            run_id: t.run_id.to_string(),
            from_phase: t.from.as_str().to_string(),
            to_phase: t.to.as_str().to_string(),
            attempt: t.attempt,
            error_kind: t.error_kind.clone(),
            error: t.error.clone(),
        }
    }
}

impl AuditSink for SqliteStore {
    fn record(&self, t: &PhaseTransition) -> Result<()> {
        self.append(AuditRecord::from(t))
    }
}
