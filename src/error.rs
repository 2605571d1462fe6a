// Error taxonomy for the orchestration core

use thiserror::Error;
use uuid::Uuid;

use crate::validation::CheckResult;
use crate::workflows::{WorkflowError, WorkflowState};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("session {0} not found")]
    NotFound(Uuid),
    #[error("session {0} already exists")]
    AlreadyExists(Uuid),
    #[error("branch '{branch}' already has active session {existing}")]
    BranchConflict { branch: String, existing: Uuid },
    #[error("session store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session document is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session {id} changed underneath this write (have version {expected}, store has {found})")]
    StaleWrite { id: Uuid, expected: u64, found: u64 },
    #[error("could not lock session store at {path}: {message}")]
    LockFile { path: String, message: String },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{operation} blocked by pre-flight checks: {}", summarize(.checks))]
    ValidationFailure {
        operation: String,
        checks: Vec<CheckResult>,
    },

    #[error("cannot move from {from} to {to}: {reason}")]
    TransitionRejected {
        from: WorkflowState,
        to: WorkflowState,
        reason: String,
    },

    #[error("session {session_id} is busy (held by {holder})")]
    LockContention { session_id: Uuid, holder: String },

    #[error("{operation} failed{}: {message}", timeout_suffix(.timed_out))]
    ExternalOperationFailure {
        operation: String,
        message: String,
        timed_out: bool,
    },

    #[error("{operation} completed but verification failed: {}", summarize(.checks))]
    PostFlightMismatch {
        operation: String,
        checks: Vec<CheckResult>,
    },

    #[error("no active session for branch '{0}'")]
    SessionNotFound(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

impl OrchestratorError {
    pub fn external(operation: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestratorError::ExternalOperationFailure {
            operation: operation.into(),
            message: message.into(),
            timed_out: false,
        }
    }

    /// Whether a retry by the caller could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ExternalOperationFailure { .. }
                | OrchestratorError::LockContention { .. }
        )
    }
}

fn summarize(checks: &[CheckResult]) -> String {
    checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| format!("{} ({})", c.name, c.message))
        .collect::<Vec<_>>()
        .join(", ")
}

fn timeout_suffix(timed_out: &bool) -> &'static str {
    if *timed_out {
        " (timed out)"
    } else {
        ""
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::CheckSeverity;

    #[test]
    fn test_validation_failure_lists_failed_checks_only() {
        let err = OrchestratorError::ValidationFailure {
            operation: "commit".to_string(),
            checks: vec![
                CheckResult::pass("branch_name_valid", "ok"),
                CheckResult::fail("has_changes", "nothing to commit", CheckSeverity::Blocking),
            ],
        };
        assert_eq!(
            err.to_string(),
            "commit blocked by pre-flight checks: has_changes (nothing to commit)"
        );
    }

    #[test]
    fn test_timeout_is_visible_in_message() {
        let err = OrchestratorError::ExternalOperationFailure {
            operation: "wait_for_checks".to_string(),
            message: "no result after 1200s".to_string(),
            timed_out: true,
        };
        assert!(err.to_string().contains("(timed out)"));
        assert!(err.is_retryable());
    }
}
