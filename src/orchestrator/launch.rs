use tracing::{field, info, Instrument, Span};

use super::{Gate, LaunchParams, OperationResult, Orchestrator};
use crate::concurrency::ConcurrencyToolkit;
use crate::error::Result;
use crate::session::{MetadataPatch, Session};
use crate::telemetry::{generate_correlation_id, operation_span};
use crate::validation::{CheckOption, Operation, PostFlightContext, PreFlightContext, PreFlightReport};
use crate::workflows::{ValidationContext, WorkflowState, WorkflowType};

impl Orchestrator {
    /// Create a feature branch from its base and open a launch session on it.
    ///
    /// A launch session left in INIT by an earlier failed launch is picked up
    /// again instead of being reported as a conflict.
    pub async fn launch(&self, params: LaunchParams) -> Result<OperationResult> {
        let span = operation_span(Operation::Launch.as_str(), &params.branch, &generate_correlation_id());
        self.run_launch(params).instrument(span).await
    }

    async fn run_launch(&self, params: LaunchParams) -> Result<OperationResult> {
        let toolkit = self.toolkit(params.retry);
        let base = params
            .base
            .clone()
            .unwrap_or_else(|| self.config.validation.default_base.clone());

        let current = self.current_branch(&toolkit).await?;
        let status = self.working_tree(&toolkit).await?;
        let (resumed, conflicting) = match self.repository.get_by_branch(&params.branch).await? {
            Some(s) if s.workflow_type == WorkflowType::Launch && s.current_state == WorkflowState::Init => {
                (Some(s), None)
            }
            Some(s) => (None, Some(s.id.to_string())),
            None => (None, None),
        };

        let context = PreFlightContext {
            branch: params.branch.clone(),
            current_branch: Some(current.clone()),
            status: Some(status),
            existing_session: conflicting,
            ..PreFlightContext::default()
        };
        let report = self.validation.pre_flight_check(Operation::Launch, None, &context);
        let chosen = match self.gate(&report, &params.choice, resumed.as_ref())? {
            Gate::Halt(result) => return Ok(result),
            Gate::Proceed(chosen) => chosen,
        };

        let mut session = match resumed {
            Some(session) => session,
            None => {
                let session = Session::new(self.workflows.machine(WorkflowType::Launch), &params.branch, &base);
                self.repository.create(&session).await?;
                session
            }
        };
        Span::current().record("session.id", field::display(session.id));

        let lease = self.acquire(&mut session).await?;
        let outcome = self
            .launch_locked(&mut session, &current, report, chosen, &toolkit)
            .await;
        self.release(lease, outcome).await
    }

    async fn launch_locked(
        &self,
        session: &mut Session,
        current: &str,
        report: PreFlightReport,
        chosen: Option<CheckOption>,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<OperationResult> {
        self.ensure_legal(session, WorkflowState::BranchReady)?;
        let branch = session.branch_name.clone();
        let base = session.base_branch.clone();

        let stash = self.stash_if_chosen(chosen.as_ref(), current, session, toolkit).await?;

        let outcome = toolkit.call("branch_exists", || self.git.branch_exists(&branch)).await;
        if !self.settle(session, outcome).await? {
            let outcome = toolkit
                .call("create_branch", || self.git.create_branch(&branch, &base))
                .await;
            self.settle(session, outcome).await?;
        }
        let outcome = toolkit.call("checkout_branch", || self.git.checkout_branch(&branch)).await;
        self.settle(session, outcome).await?;

        let outcome = self.current_branch(toolkit).await;
        let now_on = self.settle(session, outcome).await?;
        let checks = self
            .verify(
                Operation::Launch,
                session,
                &PostFlightContext {
                    expected_branch: Some(branch.clone()),
                    current_branch: Some(now_on),
                    ..PostFlightContext::default()
                },
            )
            .await?;

        self.advance(
            Operation::Launch,
            session,
            WorkflowState::BranchReady,
            MetadataPatch::new(),
            ValidationContext::new(),
        )?;
        self.persist(session).await?;
        info!(session_id = %session.id, %branch, %base, stashed = stash.is_some(), "Branch launched");

        let mut message = format!("'{branch}' is ready, branched from '{base}'");
        if let Some(stash) = stash {
            message.push_str(&format!("; work on '{current}' saved as {stash}"));
        }
        Ok(OperationResult::completed(Operation::Launch, session, message)
            .with_checks(report.checks)
            .with_checks(checks)
            .with_choice(chosen)
            .next(&["make changes, then commit", "ship to open a pull request"]))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use super::super::Choice;
    use super::*;
    use crate::error::OrchestratorError;
    use crate::session::SessionRepository;

    #[tokio::test]
    async fn test_launch_creates_branch_and_session() {
        let h = harness();
        let result = h.orchestrator.launch(LaunchParams::new("feature/login")).await.unwrap();

        assert!(result.success);
        assert_eq!(result.new_state, Some(WorkflowState::BranchReady));
        assert_eq!(h.git.current(), "feature/login");

        let session = h.repository.get_by_branch("feature/login").await.unwrap().unwrap();
        assert_eq!(session.base_branch, "main");
        assert_eq!(session.state_history.len(), 1);
        assert_eq!(session.state_history[0].actor, "tester");
    }

    #[tokio::test]
    async fn test_launch_on_protected_branch_is_blocked() {
        let h = harness();
        let err = h.orchestrator.launch(LaunchParams::new("main")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationFailure { .. }));
        assert!(h.repository.list(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dirty_tree_asks_for_decision() {
        let h = harness();
        h.git.set_unstaged(&["src/lib.rs"]);

        let result = h.orchestrator.launch(LaunchParams::new("feature/x")).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.options.iter().filter(|o| o.auto_recommended).count(), 1);
        assert_eq!(h.git.current(), "main");
        assert!(h.repository.list(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forced_launch_stashes_and_continues() {
        let h = harness();
        h.git.set_unstaged(&["src/lib.rs"]);

        let mut params = LaunchParams::new("feature/x");
        params.choice = Choice::recommended();
        let result = h.orchestrator.launch(params).await.unwrap();

        assert!(result.success);
        assert_eq!(result.chosen_option.unwrap().id, "stash_and_continue");
        assert_eq!(h.git.stash_count(), 1);
        assert!(!h.git.is_dirty());
    }

    #[tokio::test]
    async fn test_failed_checkout_leaves_resumable_init_session() {
        let h = harness();
        h.git.fail_on("checkout_branch");

        let err = h.orchestrator.launch(LaunchParams::new("feature/y")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ExternalOperationFailure { .. }));
        let session = h.repository.get_by_branch("feature/y").await.unwrap().unwrap();
        assert_eq!(session.current_state, WorkflowState::Init);
        assert!(session.metadata.last_error.is_some());
        assert!(h.repository.current_lease(session.id).await.unwrap().is_none());

        h.git.clear_failures();
        let result = h.orchestrator.launch(LaunchParams::new("feature/y")).await.unwrap();
        assert_eq!(result.session_id, Some(session.id));
        let session = h.repository.get(session.id).await.unwrap().unwrap();
        assert_eq!(session.current_state, WorkflowState::BranchReady);
        assert!(session.metadata.last_error.is_none());
    }

    #[tokio::test]
    async fn test_second_launch_on_same_branch_is_blocked() {
        let h = harness();
        h.orchestrator.launch(LaunchParams::new("feature/z")).await.unwrap();
        let err = h.orchestrator.launch(LaunchParams::new("feature/z")).await.unwrap_err();
        match err {
            OrchestratorError::ValidationFailure { checks, .. } => {
                assert!(checks.iter().any(|c| c.name == "no_active_session"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
