//! Use-cases that drive sessions through their workflows
//!
//! Every mutating call follows the same sequence: resolve the session, take
//! its lease, run pre-flight, check the transition is legal, perform the
//! external effect through the [`ConcurrencyToolkit`], verify the effect
//! post-flight, then transition and persist. The lease is released on every
//! exit path.

mod abort;
mod commit;
mod hotfix;
mod housekeeping;
mod launch;
mod ship;
mod swap;
pub mod types;

pub use hotfix::hotfix_branch;
pub use types::{
    AbortParams, Choice, CommitParams, HotfixDeployParams, HotfixRollbackParams,
    HotfixStartParams, LaunchParams, OperationResult, SessionStatus, ShipParams, SwapParams,
};

use std::sync::Arc;
use tracing::{info, warn};

use crate::capabilities::{GitCapability, GitStatus, PlatformCapability};
use crate::concurrency::{ConcurrencyToolkit, RetryPolicy};
use crate::config::BranchflowConfig;
use crate::error::{OrchestratorError, RepositoryError, Result};
use crate::session::{
    process_holder, Lease, LeaseKeeper, MetadataPatch, MetadataUpdate, Session, SessionRepository,
};
use crate::validation::{
    CheckOption, CheckResult, CheckSeverity, Decision, Operation, OptionAction, PostFlightContext,
    PreFlightReport, ValidationService,
};
use crate::workflows::{
    RuleOutcome, TransitionFailure, TransitionResult, ValidationContext, WorkflowRegistry,
    WorkflowState,
};

/// Label for work stashed while leaving `branch`, found again when returning to it
pub fn stash_label(branch: &str) -> String {
    format!("branchflow:{branch}")
}

pub(crate) enum Gate {
    Proceed(Option<CheckOption>),
    Halt(OperationResult),
}

pub struct Orchestrator {
    git: Arc<dyn GitCapability>,
    platform: Arc<dyn PlatformCapability>,
    repository: Arc<dyn SessionRepository>,
    workflows: WorkflowRegistry,
    validation: ValidationService,
    config: BranchflowConfig,
    actor: String,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("actor", &self.actor)
            .field("workflows", &self.workflows)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        git: Arc<dyn GitCapability>,
        platform: Arc<dyn PlatformCapability>,
        repository: Arc<dyn SessionRepository>,
        config: BranchflowConfig,
    ) -> anyhow::Result<Self> {
        let validation = ValidationService::new(&config.validation, config.sessions.ttl())?;
        let actor = config.sessions.actor.clone().unwrap_or_else(process_holder);
        Ok(Self {
            git,
            platform,
            repository,
            workflows: WorkflowRegistry::new()?,
            validation,
            config,
            actor,
        })
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn config(&self) -> &BranchflowConfig {
        &self.config
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    /// Register hooks before the orchestrator is shared
    pub fn workflows_mut(&mut self) -> &mut WorkflowRegistry {
        &mut self.workflows
    }

    pub fn validation(&self) -> &ValidationService {
        &self.validation
    }

    pub fn repository(&self) -> &Arc<dyn SessionRepository> {
        &self.repository
    }

    fn toolkit(&self, retry: Option<RetryPolicy>) -> ConcurrencyToolkit {
        ConcurrencyToolkit::new(&self.config.concurrency, retry)
    }

    async fn active_session(&self, branch: &str) -> Result<Session> {
        self.repository
            .get_by_branch(branch)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(branch.to_string()))
    }

    /// Take the session's lease and keep it renewed until released. The session
    /// is re-read under the lease, since it may have moved on since it was loaded.
    async fn acquire(&self, session: &mut Session) -> Result<LeaseKeeper> {
        let ttl = self.config.sessions.lease_ttl();
        let Some(lease) = self.repository.acquire_lock(session.id, &self.actor, ttl).await? else {
            let holder = self
                .repository
                .current_lease(session.id)
                .await?
                .map(|lease| lease.holder)
                .unwrap_or_else(|| "unknown".to_string());
            warn!(session_id = %session.id, %holder, "Session is leased by another holder");
            return Err(OrchestratorError::LockContention {
                session_id: session.id,
                holder,
            });
        };

        let fresh = match self.repository.get(session.id).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => {
                let missing = OrchestratorError::SessionNotFound(session.branch_name.clone());
                return self.release_lease(&lease, Err(missing)).await;
            }
            Err(error) => return self.release_lease(&lease, Err(error.into())).await,
        };
        *session = fresh;
        Ok(LeaseKeeper::start(
            Arc::clone(&self.repository),
            lease,
            ttl,
            self.config.sessions.lease_renew_interval(),
        ))
    }

    async fn release<T>(&self, keeper: LeaseKeeper, outcome: Result<T>) -> Result<T> {
        let lease = keeper.stop().await;
        self.release_lease(&lease, outcome).await
    }

    async fn release_lease<T>(&self, lease: &Lease, outcome: Result<T>) -> Result<T> {
        let released = self.repository.release_lock(lease).await;
        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(error)) => Err(error.into()),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(release_error)) => {
                warn!(session_id = %lease.session_id, error = %release_error, "Lease release failed");
                Err(error)
            }
        }
    }

    async fn release_optional<T>(&self, keeper: Option<LeaseKeeper>, outcome: Result<T>) -> Result<T> {
        match keeper {
            Some(keeper) => self.release(keeper, outcome).await,
            None => outcome,
        }
    }

    /// Turn a pre-flight report into go, stop, or an error
    fn gate(&self, report: &PreFlightReport, choice: &Choice, session: Option<&Session>) -> Result<Gate> {
        let session_id = session.map(|s| s.id);
        match report.decision() {
            Decision::Blocked => Err(OrchestratorError::ValidationFailure {
                operation: report.operation.to_string(),
                checks: report.failed(),
            }),
            Decision::Proceed | Decision::ProceedWithWarning => Ok(Gate::Proceed(None)),
            Decision::NeedsDecision => {
                let chosen = match &choice.option {
                    Some(id) => Some(report.option(id).cloned().ok_or_else(|| {
                        OrchestratorError::ValidationFailure {
                            operation: report.operation.to_string(),
                            checks: vec![CheckResult::fail(
                                "option_known",
                                format!("'{id}' is not one of the offered options"),
                                CheckSeverity::Blocking,
                            )],
                        }
                    })?),
                    None if choice.force => report.recommended().cloned(),
                    None => None,
                };
                match chosen {
                    None => Ok(Gate::Halt(OperationResult::needs_decision(report, session_id))),
                    Some(option) if option.action == OptionAction::Cancel => {
                        Ok(Gate::Halt(OperationResult::cancelled(report, option, session_id)))
                    }
                    Some(option) => {
                        info!(operation = %report.operation, option = %option.id, forced = choice.force, "Pre-flight option chosen");
                        Ok(Gate::Proceed(Some(option)))
                    }
                }
            }
        }
    }

    fn ensure_legal(&self, session: &Session, to: WorkflowState) -> Result<()> {
        let machine = self.workflows.machine(session.workflow_type);
        if machine.can_transition(session.current_state, to) {
            return Ok(());
        }
        Err(OrchestratorError::TransitionRejected {
            from: session.current_state,
            to,
            reason: format!(
                "{} workflow does not allow {} -> {to}",
                session.workflow_type, session.current_state
            ),
        })
    }

    /// Facts every rule may read, taken from the session itself
    fn rule_context(&self, session: &Session) -> ValidationContext {
        let mut context = ValidationContext::new()
            .with("branch_name", session.branch_name.clone())
            .with("protected_branch", self.validation.is_protected(&session.branch_name));
        let metadata = &session.metadata;
        if let Some(hash) = &metadata.commit_hash {
            context.insert("commit_hash", hash.clone());
        }
        if let Some(number) = metadata.pr_number {
            context.insert("pr_number", number);
        }
        if let Some(severity) = metadata.severity() {
            context.insert("severity", severity);
        }
        if let Some(target) = metadata.rollback_target() {
            context.insert("rollback_target", target);
        }
        if let Some(merge) = metadata.merge_commit() {
            context.insert("merge_commit", merge);
        }
        context
    }

    /// Transition through the session's machine, mapping failures to errors
    fn advance(
        &self,
        operation: Operation,
        session: &mut Session,
        to: WorkflowState,
        patch: MetadataPatch,
        facts: ValidationContext,
    ) -> Result<TransitionResult> {
        let machine = self.workflows.machine(session.workflow_type);
        let mut context = self.rule_context(session);
        context.merge(&facts);

        let mut patch = patch;
        if session.metadata.last_error.is_some() || !session.metadata.post_flight_failures.is_empty() {
            patch = patch.set(MetadataUpdate::ClearError);
        }

        let from = session.current_state;
        let result = session.transition(machine, to, patch, &context, &self.actor);
        match &result.failure {
            None => Ok(result),
            Some(TransitionFailure::Illegal { reason }) => Err(OrchestratorError::TransitionRejected {
                from,
                to,
                reason: reason.clone(),
            }),
            Some(TransitionFailure::RulesFailed { reports }) => Err(OrchestratorError::ValidationFailure {
                operation: operation.to_string(),
                checks: reports
                    .iter()
                    .filter_map(|report| match &report.outcome {
                        RuleOutcome::Fail(message) => {
                            Some(CheckResult::fail(report.rule, message.clone(), CheckSeverity::Blocking))
                        }
                        _ => None,
                    })
                    .collect(),
            }),
            Some(TransitionFailure::HookRejected { reason }) => Err(OrchestratorError::ValidationFailure {
                operation: operation.to_string(),
                checks: vec![CheckResult::fail("transition_hook", reason.clone(), CheckSeverity::Blocking)],
            }),
        }
    }

    async fn persist(&self, session: &mut Session) -> Result<()> {
        if let Err(error) = self.repository.update(session).await {
            if matches!(error, RepositoryError::StaleWrite { .. }) {
                warn!(session_id = %session.id, error = %error, "Session moved on under another holder, write refused");
            }
            return Err(error.into());
        }
        Ok(())
    }

    /// Record an external failure on the session before handing it back
    async fn settle<T>(&self, session: &mut Session, outcome: Result<T>) -> Result<T> {
        if let Err(OrchestratorError::ExternalOperationFailure { operation, message, .. }) = &outcome {
            session.record_failure(operation, message);
            if let Err(error) = self.repository.update(session).await {
                warn!(session_id = %session.id, error = %error, "Could not record failure on session");
            }
        }
        outcome
    }

    async fn settle_on<T>(&self, session: Option<&mut Session>, outcome: Result<T>) -> Result<T> {
        match session {
            Some(session) => self.settle(session, outcome).await,
            None => outcome,
        }
    }

    /// Post-flight; blocking mismatches are recorded on the session and returned as errors
    async fn verify(
        &self,
        operation: Operation,
        session: &mut Session,
        facts: &PostFlightContext,
    ) -> Result<Vec<CheckResult>> {
        let checks = self.validation.post_flight_verify(operation, session, facts);
        let failed: Vec<CheckResult> = checks.iter().filter(|c| c.is_blocking_failure()).cloned().collect();
        if failed.is_empty() {
            return Ok(checks);
        }
        session.record_post_flight_failures(failed.iter().map(|c| c.name.clone()).collect());
        self.persist(session).await?;
        Err(OrchestratorError::PostFlightMismatch {
            operation: operation.to_string(),
            checks: failed,
        })
    }

    async fn current_branch(&self, toolkit: &ConcurrencyToolkit) -> Result<String> {
        toolkit
            .call("get_current_branch", || self.git.get_current_branch())
            .await
    }

    async fn working_tree(&self, toolkit: &ConcurrencyToolkit) -> Result<GitStatus> {
        toolkit.call("get_status", || self.git.get_status()).await
    }

    /// Approval is asked once per toolkit, then served from its status cache
    async fn approval(&self, number: u64, toolkit: &ConcurrencyToolkit) -> Result<bool> {
        let key = format!("approval:{number}");
        if let Some(approved) = toolkit.status_cache().get(&key) {
            return Ok(approved);
        }
        let approved = toolkit
            .call("check_pr_approval", || self.platform.check_pr_approval(number))
            .await?;
        toolkit.status_cache().insert(key, approved);
        Ok(approved)
    }

    /// Stash uncommitted work on `branch` when the chosen option asks for it
    async fn stash_if_chosen(
        &self,
        chosen: Option<&CheckOption>,
        branch: &str,
        session: &mut Session,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<Option<String>> {
        if !chosen.is_some_and(|option| option.action == OptionAction::StashAndContinue) {
            return Ok(None);
        }
        let label = stash_label(branch);
        let outcome = toolkit
            .call("stash_changes", || self.git.stash_changes(&label))
            .await;
        let stash = self.settle(session, outcome).await?;
        info!(stash = %stash, from = %branch, "Stashed uncommitted work");
        Ok(Some(stash))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::capabilities::fakes::{FakeGit, FakePlatform};
    use crate::session::InMemorySessionRepository;

    pub(crate) struct Harness {
        pub git: Arc<FakeGit>,
        pub platform: Arc<FakePlatform>,
        pub repository: Arc<InMemorySessionRepository>,
        pub orchestrator: Orchestrator,
    }

    pub(crate) fn harness() -> Harness {
        let git = Arc::new(FakeGit::new("main"));
        let platform = Arc::new(FakePlatform::new());
        let repository = Arc::new(InMemorySessionRepository::new());
        let orchestrator = Orchestrator::new(
            git.clone(),
            platform.clone(),
            repository.clone(),
            BranchflowConfig::default(),
        )
        .unwrap()
        .with_actor("tester");
        Harness {
            git,
            platform,
            repository,
            orchestrator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::harness;
    use super::*;
    use crate::capabilities::{MockGitCapability, MockPlatformCapability};
    use crate::session::InMemorySessionRepository;
    use crate::workflows::WorkflowType;

    #[tokio::test]
    async fn test_second_holder_sees_contention() {
        let h = harness();
        let mut session = Session::new(h.orchestrator.workflows().machine(WorkflowType::Launch), "feature/a", "main");
        h.repository.create(&session).await.unwrap();
        h.repository
            .acquire_lock(session.id, "someone-else", chrono::Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();

        let err = h.orchestrator.acquire(&mut session).await.unwrap_err();
        match err {
            OrchestratorError::LockContention { holder, .. } => assert_eq!(holder, "someone-else"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_release_runs_when_operation_fails() {
        let h = harness();
        let mut session = Session::new(h.orchestrator.workflows().machine(WorkflowType::Launch), "feature/a", "main");
        h.repository.create(&session).await.unwrap();

        let lease = h.orchestrator.acquire(&mut session).await.unwrap();
        let outcome: Result<()> = Err(OrchestratorError::external("push", "rejected"));
        assert!(h.orchestrator.release(lease, outcome).await.is_err());
        assert!(h.repository.current_lease(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acquire_rereads_session_under_lease() {
        let h = harness();
        let mut loaded = Session::new(h.orchestrator.workflows().machine(WorkflowType::Launch), "feature/a", "main");
        h.repository.create(&loaded).await.unwrap();

        let mut moved_on = loaded.clone();
        moved_on.current_state = WorkflowState::Aborted;
        h.repository.update(&mut moved_on).await.unwrap();

        let lease = h.orchestrator.acquire(&mut loaded).await.unwrap();
        assert_eq!(loaded.current_state, WorkflowState::Aborted);
        assert_eq!(loaded.version, 1);
        h.orchestrator.release(lease, Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn test_persist_refuses_outdated_copy() {
        let h = harness();
        let mut ours = Session::new(h.orchestrator.workflows().machine(WorkflowType::Launch), "feature/a", "main");
        h.repository.create(&ours).await.unwrap();
        let mut theirs = ours.clone();
        theirs.current_state = WorkflowState::Aborted;
        h.repository.update(&mut theirs).await.unwrap();

        ours.current_state = WorkflowState::BranchReady;
        let err = h.orchestrator.persist(&mut ours).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Repository(RepositoryError::StaleWrite { .. })
        ));
        let stored = h.repository.get(ours.id).await.unwrap().unwrap();
        assert_eq!(stored.current_state, WorkflowState::Aborted);
    }

    #[tokio::test]
    async fn test_approval_is_cached_per_toolkit() {
        let mut platform = MockPlatformCapability::new();
        platform
            .expect_check_pr_approval()
            .times(1)
            .returning(|_| Ok(true));
        let orchestrator = Orchestrator::new(
            Arc::new(MockGitCapability::new()),
            Arc::new(platform),
            Arc::new(InMemorySessionRepository::new()),
            BranchflowConfig::default(),
        )
        .unwrap();

        let toolkit = orchestrator.toolkit(None);
        assert!(orchestrator.approval(4, &toolkit).await.unwrap());
        assert!(orchestrator.approval(4, &toolkit).await.unwrap());
    }

    #[tokio::test]
    async fn test_registered_hook_can_veto_a_transition() {
        let mut h = harness();
        h.orchestrator
            .workflows_mut()
            .machine_mut(WorkflowType::Launch)
            .on_validate(WorkflowState::BranchReady, |_| Err("branch creation frozen".to_string()));

        let err = h
            .orchestrator
            .launch(LaunchParams::new("feature/frozen"))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::ValidationFailure { checks, .. } => {
                assert_eq!(checks[0].name, "transition_hook");
                assert_eq!(checks[0].message, "branch creation frozen");
            }
            other => panic!("unexpected error: {other}"),
        }
        let session = h.repository.get_by_branch("feature/frozen").await.unwrap().unwrap();
        assert_eq!(session.current_state, WorkflowState::Init);
    }

    #[test]
    fn test_stash_label_names_the_branch() {
        assert_eq!(stash_label("feature/login"), "branchflow:feature/login");
    }
}
