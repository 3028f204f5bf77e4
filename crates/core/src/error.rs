//! Error taxonomy shared by the orchestrator and its collaborators.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal error of a bootstrap run. Each phase classifies into one of these.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapError {
    /// Transient API failure that survived the phase's retry budget.
    #[error("infrastructure error (retryable): {0}")]
    RetryableInfra(String),
    /// Existing resource or topology does not match the request.
    #[error("conflict: {0}")]
    Conflict(String),
    /// A polling phase ran out of rounds.
    #[error("timed out: {0}")]
    Timeout(String),
    /// A member never became reachable within the reachability budget.
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid cluster spec: {0}")]
    InvalidSpec(String),
    #[error("cancelled")]
    Cancelled,
}

impl BootstrapError {
    /// Stable kind string, used in audit rows and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            BootstrapError::RetryableInfra(_) => "RetryableInfra",
            BootstrapError::Conflict(_) => "Conflict",
            BootstrapError::Timeout(_) => "Timeout",
            BootstrapError::Unreachable(_) => "Unreachable",
            BootstrapError::Unsupported(_) => "Unsupported",
            BootstrapError::InvalidSpec(_) => "InvalidSpec",
            BootstrapError::Cancelled => "Cancelled",
        }
    }

    /// Conflicts and bad input need a human; everything else is safe to re-run.
    pub fn is_operator_action_required(&self) -> bool {
        matches!(self, BootstrapError::Conflict(_) | BootstrapError::InvalidSpec(_) | BootstrapError::Unsupported(_))
    }
}

/// Errors reported by a [`crate::ports::ControlPlane`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InfraError {
    #[error("transient control plane error: {0}")]
    Transient(String),
    #[error("resource already exists")]
    AlreadyExists,
    #[error("unsupported resource: {0}")]
    Unsupported(String),
}

/// Errors reported by a [`crate::ports::AdminChannel`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdminError {
    #[error("member unreachable: {0}")]
    Unreachable(String),
    #[error("replication already initialized")]
    AlreadyInitialized,
    #[error("replication not initialized")]
    NotInitialized,
    #[error("command rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_need_an_operator_timeouts_do_not() {
        assert!(BootstrapError::Conflict("sc size".into()).is_operator_action_required());
        assert!(!BootstrapError::Timeout("readiness".into()).is_operator_action_required());
        assert!(!BootstrapError::Unreachable("member-0.test".into()).is_operator_action_required());
        assert_eq!(BootstrapError::Cancelled.kind(), "Cancelled");
    }

    #[test]
    fn messages_name_the_cause() {
        let e = BootstrapError::Conflict("PersistentVolumeClaim/test/data-member-0: spec.resources changed".into());
        assert!(e.to_string().starts_with("conflict: "));
        assert!(e.to_string().contains("data-member-0"));
    }
}
