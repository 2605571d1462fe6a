use tracing::{info, Instrument};
use uuid::Uuid;

use super::{OperationResult, Orchestrator, SessionStatus};
use crate::error::{OrchestratorError, Result};
use crate::session::Session;
use crate::telemetry::{generate_correlation_id, operation_span};
use crate::validation::Operation;

impl Orchestrator {
    /// Purge terminal sessions older than `max_age_days`, defaulting to the
    /// configured session TTL. Active sessions are never removed.
    pub async fn cleanup(&self, max_age_days: Option<u32>) -> Result<OperationResult> {
        let span = operation_span(Operation::Cleanup.as_str(), "*", &generate_correlation_id());
        async {
            let days = max_age_days.unwrap_or(self.config.sessions.ttl_days);
            let purged = self.repository.cleanup_expired(days).await?;
            info!(purged, max_age_days = days, "Session cleanup finished");
            Ok(OperationResult::finished(
                Operation::Cleanup,
                None,
                format!("purged {purged} finished session(s) older than {days} day(s)"),
            ))
        }
        .instrument(span)
        .await
    }

    /// The active session on `branch` and what it can do next
    pub async fn status(&self, branch: &str) -> Result<SessionStatus> {
        let session = self.active_session(branch).await?;
        self.describe(session).await
    }

    /// Same as [`Orchestrator::status`] but for any stored session, finished ones included
    pub async fn status_by_id(&self, id: Uuid) -> Result<SessionStatus> {
        let session = self
            .repository
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(id.to_string()))?;
        self.describe(session).await
    }

    pub async fn sessions(&self, active_only: bool) -> Result<Vec<Session>> {
        Ok(self.repository.list(active_only).await?)
    }

    async fn describe(&self, session: Session) -> Result<SessionStatus> {
        let machine = self.workflows.machine(session.workflow_type);
        let lease = self.repository.current_lease(session.id).await?;
        Ok(SessionStatus {
            resumable: session.can_resume(self.config.sessions.ttl()),
            allowed_actions: machine.get_allowed_actions(session.current_state),
            next_states: machine.allowed_transitions(session.current_state).to_vec(),
            lease,
            session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use super::super::{AbortParams, LaunchParams};
    use super::*;
    use crate::session::SessionRepository;
    use crate::workflows::{Action, WorkflowState, WorkflowType};

    #[tokio::test]
    async fn test_status_lists_next_moves() {
        let h = harness();
        h.orchestrator.launch(LaunchParams::new("feature/a")).await.unwrap();

        let status = h.orchestrator.status("feature/a").await.unwrap();
        assert!(status.resumable);
        assert!(status.lease.is_none());
        assert_eq!(status.session.current_state, WorkflowState::BranchReady);
        assert!(status.next_states.contains(&WorkflowState::ChangesCommitted));
        assert!(status.allowed_actions.contains(&Action::Abort));
    }

    #[tokio::test]
    async fn test_finished_session_is_reachable_by_id() {
        let h = harness();
        h.orchestrator.launch(LaunchParams::new("feature/a")).await.unwrap();
        let result = h.orchestrator.abort(AbortParams::new("feature/a")).await.unwrap();

        assert!(matches!(
            h.orchestrator.status("feature/a").await,
            Err(OrchestratorError::SessionNotFound(_))
        ));
        let status = h.orchestrator.status_by_id(result.session_id.unwrap()).await.unwrap();
        assert!(!status.resumable);
        assert!(status.next_states.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_active_sessions() {
        let h = harness();
        h.orchestrator.launch(LaunchParams::new("feature/live")).await.unwrap();

        let machine = h.orchestrator.workflows().machine(WorkflowType::Launch);
        let mut old = Session::new(machine, "feature/old", "main");
        old.current_state = WorkflowState::Aborted;
        old.created_at -= chrono::Duration::days(60);
        h.repository.create(&old).await.unwrap();

        let result = h.orchestrator.cleanup(None).await.unwrap();
        assert!(result.success);
        assert!(result.message.starts_with("purged 1 "));
        assert!(h.repository.get(old.id).await.unwrap().is_none());
        assert_eq!(h.orchestrator.sessions(true).await.unwrap().len(), 1);

        let result = h.orchestrator.cleanup(Some(0)).await.unwrap();
        assert!(result.message.starts_with("purged 0 "));
        assert_eq!(h.orchestrator.sessions(false).await.unwrap().len(), 1);
    }
}
