use tracing::{field, info, Instrument, Span};

use super::{stash_label, AbortParams, Gate, OperationResult, Orchestrator};
use crate::concurrency::ConcurrencyToolkit;
use crate::error::Result;
use crate::session::{MetadataPatch, MetadataUpdate, Session};
use crate::telemetry::{generate_correlation_id, operation_span};
use crate::validation::{Operation, PostFlightContext, PreFlightContext};
use crate::workflows::{ValidationContext, WorkflowState};

impl Orchestrator {
    /// Abandon a session, optionally deleting its branch.
    ///
    /// Refused from states that have no edge to ABORTED, such as MERGING.
    pub async fn abort(&self, params: AbortParams) -> Result<OperationResult> {
        let span = operation_span(Operation::Abort.as_str(), &params.branch, &generate_correlation_id());
        self.run_abort(params).instrument(span).await
    }

    async fn run_abort(&self, params: AbortParams) -> Result<OperationResult> {
        let toolkit = self.toolkit(params.retry);
        let mut session = self.active_session(&params.branch).await?;
        Span::current().record("session.id", field::display(session.id));

        let lease = self.acquire(&mut session).await?;
        let outcome = self.abort_locked(&mut session, &params, &toolkit).await;
        self.release(lease, outcome).await
    }

    async fn abort_locked(
        &self,
        session: &mut Session,
        params: &AbortParams,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<OperationResult> {
        self.ensure_legal(session, WorkflowState::Aborted)?;
        let branch = session.branch_name.clone();
        let from = session.current_state;

        let current = self.current_branch(toolkit).await?;
        // uncommitted work only matters when it belongs to the session branch
        let status = if current == branch {
            Some(self.working_tree(toolkit).await?)
        } else {
            None
        };
        let context = PreFlightContext {
            branch: branch.clone(),
            current_branch: Some(current.clone()),
            status,
            ..PreFlightContext::default()
        };
        let report = self.validation.pre_flight_check(Operation::Abort, Some(&*session), &context);
        let chosen = match self.gate(&report, &params.choice, Some(&*session))? {
            Gate::Halt(result) => return Ok(result),
            Gate::Proceed(chosen) => chosen,
        };

        let mut patch = MetadataPatch::new();
        let stash = self.stash_if_chosen(chosen.as_ref(), &branch, session, toolkit).await?;
        if let Some(stash) = &stash {
            patch = patch.set(MetadataUpdate::StashRef(Some(stash.clone())));
        }

        let mut checks = Vec::new();
        if params.delete_branch {
            if current == branch {
                let base = session.base_branch.clone();
                let outcome = toolkit.call("checkout_branch", || self.git.checkout_branch(&base)).await;
                self.settle(session, outcome).await?;
            }
            let outcome = toolkit
                .call("remote_branch_exists", || self.git.remote_branch_exists(&branch))
                .await;
            let on_remote = self.settle(session, outcome).await?;
            let outcome = toolkit.call("branch_exists", || self.git.branch_exists(&branch)).await;
            let local = self.settle(session, outcome).await?;
            if local || on_remote {
                let outcome = toolkit
                    .call("delete_branch", || self.git.delete_branch(&branch, on_remote))
                    .await;
                self.settle(session, outcome).await?;
            }

            let outcome = toolkit.call("branch_exists", || self.git.branch_exists(&branch)).await;
            let still_there = self.settle(session, outcome).await?;
            checks = self
                .verify(
                    Operation::Abort,
                    session,
                    &PostFlightContext {
                        deleted_branch_exists: Some(still_there),
                        ..PostFlightContext::default()
                    },
                )
                .await?;
        }

        self.advance(Operation::Abort, session, WorkflowState::Aborted, patch, ValidationContext::new())?;
        self.persist(session).await?;
        info!(
            session_id = %session.id,
            %branch,
            %from,
            deleted = params.delete_branch,
            stashed = stash.is_some(),
            "Session aborted"
        );

        let mut message = format!("{} session on '{branch}' aborted from {from}", session.workflow_type);
        if params.delete_branch {
            message.push_str("; branch deleted");
        }
        if let Some(stash) = &stash {
            message.push_str(&format!("; uncommitted work saved as {stash} ({})", stash_label(&branch)));
        }
        Ok(OperationResult::completed(Operation::Abort, session, message)
            .with_checks(report.checks)
            .with_checks(checks)
            .with_choice(chosen))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use super::super::{Choice, HotfixStartParams, LaunchParams};
    use super::*;
    use crate::error::OrchestratorError;
    use crate::session::SessionRepository;
    use crate::workflows::WorkflowType;

    #[tokio::test]
    async fn test_abort_during_merge_is_rejected() {
        let h = harness();
        let mut session = Session::new(h.orchestrator.workflows().machine(WorkflowType::Ship), "feature/m", "main");
        session.current_state = WorkflowState::Merging;
        h.repository.create(&session).await.unwrap();

        let err = h.orchestrator.abort(AbortParams::new("feature/m")).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::TransitionRejected {
                from: WorkflowState::Merging,
                to: WorkflowState::Aborted,
                ..
            }
        ));
        let stored = h.repository.get(session.id).await.unwrap().unwrap();
        assert_eq!(stored.current_state, WorkflowState::Merging);
        assert!(h.repository.current_lease(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hotfix_cannot_abort_before_validation() {
        let h = harness();
        h.orchestrator
            .hotfix_start(HotfixStartParams::new("db", "high"))
            .await
            .unwrap();

        let err = h.orchestrator.abort(AbortParams::new("hotfix/db")).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::TransitionRejected {
                from: WorkflowState::HotfixReady,
                to: WorkflowState::Aborted,
                ..
            }
        ));
        let stored = h.repository.get_by_branch("hotfix/db").await.unwrap().unwrap();
        assert_eq!(stored.current_state, WorkflowState::HotfixReady);
    }

    #[tokio::test]
    async fn test_abort_with_uncommitted_work_asks_first() {
        let h = harness();
        h.orchestrator.launch(LaunchParams::new("feature/a")).await.unwrap();
        h.git.set_unstaged(&["wip.rs"]);

        let result = h.orchestrator.abort(AbortParams::new("feature/a")).await.unwrap();
        assert!(!result.success);
        assert!(result.options.iter().any(|o| o.id == "stash_and_abort"));
        assert!(h.repository.get_by_branch("feature/a").await.unwrap().is_some());

        let mut params = AbortParams::new("feature/a");
        params.choice = Choice::pick("cancel");
        let result = h.orchestrator.abort(params).await.unwrap();
        assert!(!result.success);
        assert!(h.git.is_dirty());
    }

    #[tokio::test]
    async fn test_forced_abort_stashes_and_deletes_branch() {
        let h = harness();
        h.orchestrator.launch(LaunchParams::new("feature/a")).await.unwrap();
        h.git.set_unstaged(&["wip.rs"]);

        let mut params = AbortParams::new("feature/a");
        params.delete_branch = true;
        params.choice = Choice::recommended();
        let result = h.orchestrator.abort(params).await.unwrap();

        assert!(result.success);
        assert_eq!(result.new_state, Some(WorkflowState::Aborted));
        assert_eq!(h.git.current(), "main");
        assert!(!h.git.has_branch("feature/a"));
        assert_eq!(h.git.stash_count(), 1);

        assert!(h.repository.get_by_branch("feature/a").await.unwrap().is_none());
        let session = h.repository.get(result.session_id.unwrap()).await.unwrap().unwrap();
        assert!(session.metadata.stash_ref.is_some());
    }

    #[tokio::test]
    async fn test_abort_keeps_branch_by_default() {
        let h = harness();
        h.orchestrator.launch(LaunchParams::new("feature/a")).await.unwrap();

        let result = h.orchestrator.abort(AbortParams::new("feature/a")).await.unwrap();
        assert!(result.success);
        assert!(h.git.has_branch("feature/a"));
        assert_eq!(h.git.current(), "feature/a");
    }
}
