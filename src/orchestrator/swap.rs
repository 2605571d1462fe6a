use tracing::{field, info, Instrument, Span};

use super::{stash_label, Gate, OperationResult, Orchestrator, SwapParams};
use crate::concurrency::ConcurrencyToolkit;
use crate::error::{OrchestratorError, Result};
use crate::session::{MetadataPatch, MetadataUpdate, Session};
use crate::telemetry::{generate_correlation_id, operation_span};
use crate::validation::{
    CheckOption, CheckResult, CheckSeverity, Operation, OptionAction, PostFlightContext,
    PreFlightContext, PreFlightReport,
};

impl Orchestrator {
    /// Move the working tree to another branch.
    ///
    /// Work stashed while leaving a branch is labelled with that branch and
    /// restored the next time the branch is swapped to. Sessions on either
    /// side are leased for the duration but never change state.
    pub async fn swap(&self, params: SwapParams) -> Result<OperationResult> {
        let span = operation_span(Operation::Swap.as_str(), &params.target, &generate_correlation_id());
        self.run_swap(params).instrument(span).await
    }

    async fn run_swap(&self, params: SwapParams) -> Result<OperationResult> {
        let toolkit = self.toolkit(params.retry);
        let target = params.target.clone();

        let current = self.current_branch(&toolkit).await?;
        let status = self.working_tree(&toolkit).await?;
        let context = PreFlightContext {
            branch: target.clone(),
            current_branch: Some(current.clone()),
            status: Some(status),
            ..PreFlightContext::default()
        };
        let report = self.validation.pre_flight_check(Operation::Swap, None, &context);

        let mut target_session = self.repository.get_by_branch(&target).await?;
        let chosen = match self.gate(&report, &params.choice, target_session.as_ref())? {
            Gate::Halt(result) => return Ok(result),
            Gate::Proceed(chosen) => chosen,
        };

        if !toolkit.call("branch_exists", || self.git.branch_exists(&target)).await? {
            return Err(OrchestratorError::ValidationFailure {
                operation: Operation::Swap.to_string(),
                checks: vec![CheckResult::fail(
                    "target_branch_exists",
                    format!("branch '{target}' does not exist"),
                    CheckSeverity::Blocking,
                )],
            });
        }

        let mut source_session = self.repository.get_by_branch(&current).await?;
        if let Some(session) = &target_session {
            Span::current().record("session.id", field::display(session.id));
        }

        let source_lease = match source_session.as_mut() {
            Some(session) => Some(self.acquire(session).await?),
            None => None,
        };
        let target_lease = match target_session.as_mut() {
            Some(session) => match self.acquire(session).await {
                Ok(lease) => Some(lease),
                Err(error) => return self.release_optional(source_lease, Err(error)).await,
            },
            None => None,
        };

        let outcome = self
            .swap_locked(
                &current,
                &target,
                report,
                chosen,
                source_session.as_mut(),
                target_session.as_mut(),
                &toolkit,
            )
            .await;
        let outcome = self.release_optional(target_lease, outcome).await;
        self.release_optional(source_lease, outcome).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn swap_locked(
        &self,
        current: &str,
        target: &str,
        report: PreFlightReport,
        chosen: Option<CheckOption>,
        mut source: Option<&mut Session>,
        mut destination: Option<&mut Session>,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<OperationResult> {
        let mut stash = None;
        if chosen
            .as_ref()
            .is_some_and(|option| option.action == OptionAction::StashAndContinue)
        {
            let label = stash_label(current);
            let outcome = toolkit
                .call("stash_changes", || self.git.stash_changes(&label))
                .await;
            let reference = self.settle_on(source.as_deref_mut(), outcome).await?;
            if let Some(session) = source.as_deref_mut() {
                session.annotate(MetadataPatch::new().set(MetadataUpdate::StashRef(Some(reference.clone()))));
                self.persist(session).await?;
            }
            info!(stash = %reference, from = %current, "Stashed uncommitted work");
            stash = Some(reference);
        }

        let outcome = toolkit.call("checkout_branch", || self.git.checkout_branch(target)).await;
        self.settle_on(destination.as_deref_mut(), outcome).await?;

        let label = stash_label(target);
        let outcome = toolkit.call("find_stash", || self.git.find_stash(&label)).await;
        let pending = self.settle_on(destination.as_deref_mut(), outcome).await?;
        let mut restored = None;
        if let Some(reference) = &pending {
            let outcome = toolkit.call("apply_stash", || self.git.apply_stash(reference)).await;
            self.settle_on(destination.as_deref_mut(), outcome).await?;
            let outcome = toolkit.call("find_stash", || self.git.find_stash(&label)).await;
            let left = self.settle_on(destination.as_deref_mut(), outcome).await?;
            restored = Some(left.as_ref() != Some(reference));
        }

        let outcome = self.current_branch(toolkit).await;
        let now_on = self.settle_on(destination.as_deref_mut(), outcome).await?;
        let facts = PostFlightContext {
            expected_branch: Some(target.to_string()),
            current_branch: Some(now_on),
            stash_restored: restored,
            ..PostFlightContext::default()
        };
        let checks = self.validation.verify_branch_facts(Operation::Swap, target, &facts);
        let failed: Vec<CheckResult> = checks.iter().filter(|c| c.is_blocking_failure()).cloned().collect();
        if !failed.is_empty() {
            if let Some(session) = destination.as_deref_mut() {
                session.record_post_flight_failures(failed.iter().map(|c| c.name.clone()).collect());
                self.persist(session).await?;
            }
            return Err(OrchestratorError::PostFlightMismatch {
                operation: Operation::Swap.to_string(),
                checks: failed,
            });
        }

        if let Some(session) = destination.as_deref_mut() {
            if restored == Some(true) {
                session.annotate(MetadataPatch::new().set(MetadataUpdate::StashRef(None)));
                self.persist(session).await?;
            }
        }
        info!(from = %current, to = %target, stashed = stash.is_some(), restored = restored == Some(true), "Swapped branches");

        let mut message = format!("switched from '{current}' to '{target}'");
        if let Some(stash) = &stash {
            message.push_str(&format!("; work on '{current}' saved as {stash}"));
        }
        if let Some(reference) = pending.filter(|_| restored == Some(true)) {
            message.push_str(&format!("; restored {reference}"));
        }
        Ok(OperationResult::finished(Operation::Swap, destination.as_deref(), message)
            .with_checks(report.checks)
            .with_checks(checks)
            .with_choice(chosen))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use super::super::{Choice, LaunchParams};
    use super::*;
    use crate::session::SessionRepository;
    use crate::workflows::WorkflowState;

    #[tokio::test]
    async fn test_swap_to_session_branch() {
        let h = harness();
        h.orchestrator.launch(LaunchParams::new("feature/a")).await.unwrap();
        h.orchestrator.swap(SwapParams::new("main")).await.unwrap();
        assert_eq!(h.git.current(), "main");

        let result = h.orchestrator.swap(SwapParams::new("feature/a")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.new_state, Some(WorkflowState::BranchReady));
        assert_eq!(h.git.current(), "feature/a");
    }

    #[tokio::test]
    async fn test_stashed_work_comes_back_on_return() {
        let h = harness();
        h.orchestrator.launch(LaunchParams::new("feature/a")).await.unwrap();
        h.git.set_unstaged(&["half_done.rs"]);

        let mut params = SwapParams::new("main");
        params.choice = Choice::recommended();
        let result = h.orchestrator.swap(params).await.unwrap();
        assert!(result.success);
        assert!(!h.git.is_dirty());
        assert_eq!(h.git.stash_count(), 1);
        let session = h.repository.get_by_branch("feature/a").await.unwrap().unwrap();
        assert!(session.metadata.stash_ref.is_some());

        let result = h.orchestrator.swap(SwapParams::new("feature/a")).await.unwrap();
        assert!(result.message.contains("restored"));
        assert!(h.git.is_dirty());
        assert_eq!(h.git.stash_count(), 0);
        let session = h.repository.get_by_branch("feature/a").await.unwrap().unwrap();
        assert!(session.metadata.stash_ref.is_none());
    }

    #[tokio::test]
    async fn test_dirty_swap_needs_decision() {
        let h = harness();
        h.orchestrator.launch(LaunchParams::new("feature/a")).await.unwrap();
        h.git.set_unstaged(&["half_done.rs"]);

        let result = h.orchestrator.swap(SwapParams::new("main")).await.unwrap();
        assert!(!result.success);
        assert_eq!(h.git.current(), "feature/a");
        assert_eq!(h.git.stash_count(), 0);
    }

    #[tokio::test]
    async fn test_swap_to_missing_branch() {
        let h = harness();
        let err = h.orchestrator.swap(SwapParams::new("feature/ghost")).await.unwrap_err();
        match err {
            OrchestratorError::ValidationFailure { checks, .. } => {
                assert_eq!(checks[0].name, "target_branch_exists")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_swap_to_current_branch_is_blocked() {
        let h = harness();
        let err = h.orchestrator.swap(SwapParams::new("main")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationFailure { .. }));
    }

    #[tokio::test]
    async fn test_leased_target_releases_source() {
        let h = harness();
        h.orchestrator.launch(LaunchParams::new("feature/a")).await.unwrap();
        h.orchestrator.swap(SwapParams::new("main")).await.unwrap();
        h.orchestrator.launch(LaunchParams::new("feature/b")).await.unwrap();

        let a = h.repository.get_by_branch("feature/a").await.unwrap().unwrap();
        let b = h.repository.get_by_branch("feature/b").await.unwrap().unwrap();
        h.repository
            .acquire_lock(a.id, "other-agent", chrono::Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();

        let err = h.orchestrator.swap(SwapParams::new("feature/a")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::LockContention { .. }));
        assert!(h.repository.current_lease(b.id).await.unwrap().is_none());
        assert_eq!(h.git.current(), "feature/b");
    }
}
