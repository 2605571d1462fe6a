use tracing::{field, info, Instrument, Span};

use super::{Choice, CommitParams, Gate, OperationResult, Orchestrator};
use crate::concurrency::ConcurrencyToolkit;
use crate::error::{OrchestratorError, Result};
use crate::session::{MetadataPatch, MetadataUpdate, Session};
use crate::telemetry::{generate_correlation_id, operation_span};
use crate::validation::{Operation, PostFlightContext, PreFlightContext};
use crate::workflows::{ValidationContext, WorkflowState, WorkflowType};

/// The state a commit moves the session into, or `None` when the session has
/// already recorded one and the new commit is added in place
fn commit_target(session: &Session) -> Result<Option<WorkflowState>> {
    use WorkflowState as S;
    match (session.workflow_type, session.current_state) {
        (WorkflowType::Launch, S::BranchReady) | (WorkflowType::Ship, S::Validating) => {
            Ok(Some(S::ChangesCommitted))
        }
        (WorkflowType::Hotfix, S::HotfixReady) => Ok(Some(S::HotfixCommitted)),
        (WorkflowType::Launch, S::ChangesCommitted)
        | (WorkflowType::Ship, S::ChangesCommitted | S::ChangesRequested | S::MergeConflict)
        | (WorkflowType::Hotfix, S::HotfixCommitted) => Ok(None),
        (workflow, state) => Err(OrchestratorError::TransitionRejected {
            from: state,
            to: match workflow {
                WorkflowType::Hotfix => S::HotfixCommitted,
                _ => S::ChangesCommitted,
            },
            reason: format!("commits are not accepted while the {workflow} session is in {state}"),
        }),
    }
}

impl Orchestrator {
    /// Commit on the session branch and record the hash
    pub async fn commit(&self, params: CommitParams) -> Result<OperationResult> {
        let span = operation_span(Operation::Commit.as_str(), &params.branch, &generate_correlation_id());
        self.run_commit(params).instrument(span).await
    }

    async fn run_commit(&self, params: CommitParams) -> Result<OperationResult> {
        let toolkit = self.toolkit(params.retry);
        let mut session = self.active_session(&params.branch).await?;
        Span::current().record("session.id", field::display(session.id));

        let lease = self.acquire(&mut session).await?;
        let outcome = self.commit_locked(&mut session, &params, &toolkit).await;
        self.release(lease, outcome).await
    }

    async fn commit_locked(
        &self,
        session: &mut Session,
        params: &CommitParams,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<OperationResult> {
        let current = self.current_branch(toolkit).await?;
        let status = self.working_tree(toolkit).await?;
        let context = PreFlightContext {
            branch: params.branch.clone(),
            current_branch: Some(current),
            status: Some(status),
            commit_message: Some(params.message.clone()),
            staged_only: params.staged_only,
            ..PreFlightContext::default()
        };
        let report = self.validation.pre_flight_check(Operation::Commit, Some(&*session), &context);
        if let Gate::Halt(result) = self.gate(&report, &Choice::default(), Some(&*session))? {
            return Ok(result);
        }

        let target = commit_target(session)?;
        if let Some(to) = target {
            self.ensure_legal(session, to)?;
        }

        let outcome = toolkit
            .call("commit", || self.git.commit(&params.message, params.staged_only))
            .await;
        let hash = self.settle(session, outcome).await?;
        let outcome = toolkit.call("head_commit", || self.git.head_commit()).await;
        let head = self.settle(session, outcome).await?;
        let checks = self
            .verify(
                Operation::Commit,
                session,
                &PostFlightContext {
                    expected_commit: Some(hash.clone()),
                    head_commit: Some(head),
                    ..PostFlightContext::default()
                },
            )
            .await?;

        let patch = MetadataPatch::new().set(MetadataUpdate::CommitHash(hash.clone()));
        match target {
            Some(to) => {
                self.advance(
                    Operation::Commit,
                    session,
                    to,
                    patch,
                    ValidationContext::new().with("commit_hash", hash.clone()),
                )?;
            }
            None => session.annotate(patch),
        }
        self.persist(session).await?;
        info!(session_id = %session.id, commit = %hash, state = %session.current_state, "Changes committed");

        Ok(
            OperationResult::completed(Operation::Commit, session, format!("committed {hash}"))
                .with_checks(report.checks)
                .with_checks(checks)
                .next(&["ship to push and open a pull request"]),
        )
    }
}
