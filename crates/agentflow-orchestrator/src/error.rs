//! Error taxonomy for the orchestrator (spec §7).
//!
//! One enum covers every component. Variants are grouped by retry policy:
//! `Validation`/`Authorization`/`RiskReject`/`RiskExpired` are never retried;
//! `VersionConflict`/`LockConflict`/`Timeout`/`ExternalFailure` are retried
//! locally by the engine up to its configured limit before surfacing.

use uuid::Uuid;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("could not acquire lock on {resource_id}")]
    LockConflict { resource_id: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("external call failed: {0}")]
    ExternalFailure(String),

    #[error("approval rejected: {reason}")]
    RiskReject { reason: String },

    #[error("approval expired")]
    RiskExpired,

    #[error("replay integrity error at seq {seq}: expected hash {expected}, computed {computed}")]
    ReplayIntegrityError {
        workflow_id: Uuid,
        seq: i64,
        expected: String,
        computed: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Authorization(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::VersionConflict { .. } => "version_conflict",
            Self::LockConflict { .. } => "lock_conflict",
            Self::Timeout(_) => "timeout",
            Self::ExternalFailure(_) => "external_failure",
            Self::RiskReject { .. } => "risk_rejected",
            Self::RiskExpired => "risk_expired",
            Self::ReplayIntegrityError { .. } => "replay_integrity_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Transient classes the engine is allowed to retry locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::LockConflict { .. } | Self::Timeout(_) | Self::ExternalFailure(_)
        )
    }
}

impl From<agentflow_durable::StoreError> for OrchestratorError {
    fn from(err: agentflow_durable::StoreError) -> Self {
        match err {
            agentflow_durable::StoreError::WorkflowNotFound(id) => {
                Self::NotFound(format!("workflow {id}"))
            }
            agentflow_durable::StoreError::TaskNotFound(id) => Self::NotFound(format!("task {id}")),
            agentflow_durable::StoreError::ConcurrencyConflict { expected, actual } => {
                Self::VersionConflict {
                    expected: expected as i64,
                    actual: actual as i64,
                }
            }
            agentflow_durable::StoreError::Database(msg) => Self::Internal(msg),
            agentflow_durable::StoreError::Serialization(msg) => Self::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(OrchestratorError::Timeout("x".into()).is_retryable());
        assert!(OrchestratorError::LockConflict { resource_id: "r".into() }.is_retryable());
        assert!(!OrchestratorError::Validation("x".into()).is_retryable());
        assert!(!OrchestratorError::RiskExpired.is_retryable());
    }

    #[test]
    fn error_codes_are_snake_case() {
        assert_eq!(OrchestratorError::RiskExpired.code(), "risk_expired");
        assert_eq!(
            OrchestratorError::Authorization("x".into()).code(),
            "unauthorized"
        );
    }
}
