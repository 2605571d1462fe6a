use std::sync::Arc;
use tracing::{field, info, warn, Instrument, Span};

use super::ship::{recorded_pr, PullRequestDraft, Step};
use super::{
    Choice, Gate, HotfixDeployParams, HotfixRollbackParams, HotfixStartParams, OperationResult,
    Orchestrator,
};
use crate::concurrency::{task, ConcurrencyToolkit, ExecuteOptions};
use crate::error::{OrchestratorError, Result};
use crate::session::{MetadataPatch, MetadataUpdate, Session, WorkflowMetadata};
use crate::telemetry::{generate_correlation_id, operation_span};
use crate::validation::{CheckOption, CheckResult, Operation, PostFlightContext, PreFlightContext, PreFlightReport};
use crate::workflows::{ValidationContext, WorkflowState as S, WorkflowType};

const HOTFIX_PREFIX: &str = "hotfix/";

pub fn hotfix_branch(name: &str) -> String {
    if name.starts_with(HOTFIX_PREFIX) {
        name.to_string()
    } else {
        format!("{HOTFIX_PREFIX}{name}")
    }
}

fn gate_warnings(session: &Session) -> Vec<String> {
    match &session.metadata.workflow {
        WorkflowMetadata::Hotfix { gate_warnings, .. } => gate_warnings.clone(),
        _ => Vec::new(),
    }
}

impl Orchestrator {
    /// Branch `hotfix/<name>` off the base and remember the base HEAD as the rollback target
    pub async fn hotfix_start(&self, params: HotfixStartParams) -> Result<OperationResult> {
        let branch = hotfix_branch(&params.name);
        let span = operation_span(Operation::HotfixStart.as_str(), &branch, &generate_correlation_id());
        self.run_hotfix_start(branch, params).instrument(span).await
    }

    async fn run_hotfix_start(&self, branch: String, params: HotfixStartParams) -> Result<OperationResult> {
        let toolkit = self.toolkit(params.retry);
        let base = params
            .base
            .clone()
            .unwrap_or_else(|| self.config.validation.default_base.clone());

        let current = self.current_branch(&toolkit).await?;
        let status = self.working_tree(&toolkit).await?;
        let existing = self.repository.get_by_branch(&branch).await?;
        let context = PreFlightContext {
            branch: branch.clone(),
            current_branch: Some(current.clone()),
            status: Some(status),
            existing_session: existing.map(|s| s.id.to_string()),
            severity: Some(params.severity.clone()),
            ..PreFlightContext::default()
        };
        let report = self.validation.pre_flight_check(Operation::HotfixStart, None, &context);
        let chosen = match self.gate(&report, &params.choice, None)? {
            Gate::Halt(result) => return Ok(result),
            Gate::Proceed(chosen) => chosen,
        };

        let mut session = Session::new(self.workflows.machine(WorkflowType::Hotfix), &branch, &base);
        session.annotate(MetadataPatch::new().set(MetadataUpdate::Severity(params.severity.clone())));
        self.repository.create(&session).await?;
        Span::current().record("session.id", field::display(session.id));

        let lease = self.acquire(&mut session).await?;
        let outcome = self
            .hotfix_start_locked(&mut session, &current, report, chosen, &toolkit)
            .await;
        self.release(lease, outcome).await
    }

    async fn hotfix_start_locked(
        &self,
        session: &mut Session,
        current: &str,
        report: PreFlightReport,
        chosen: Option<CheckOption>,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<OperationResult> {
        let op = Operation::HotfixStart;
        self.ensure_legal(session, S::HotfixReady)?;
        let branch = session.branch_name.clone();
        let base = session.base_branch.clone();

        self.stash_if_chosen(chosen.as_ref(), current, session, toolkit).await?;

        let outcome = toolkit.call("branch_exists", || self.git.branch_exists(&branch)).await;
        if !self.settle(session, outcome).await? {
            let outcome = toolkit
                .call("create_branch", || self.git.create_branch(&branch, &base))
                .await;
            self.settle(session, outcome).await?;
        }
        let outcome = toolkit.call("checkout_branch", || self.git.checkout_branch(&branch)).await;
        self.settle(session, outcome).await?;

        let outcome = toolkit.call("head_commit", || self.git.head_commit()).await;
        let rollback_target = self.settle(session, outcome).await?;
        let outcome = self.current_branch(toolkit).await;
        let now_on = self.settle(session, outcome).await?;
        let checks = self
            .verify(
                op,
                session,
                &PostFlightContext {
                    expected_branch: Some(branch.clone()),
                    current_branch: Some(now_on),
                    ..PostFlightContext::default()
                },
            )
            .await?;

        self.advance(
            op,
            session,
            S::HotfixReady,
            MetadataPatch::new().set(MetadataUpdate::RollbackTarget(rollback_target.clone())),
            ValidationContext::new().with("rollback_target", rollback_target.clone()),
        )?;
        self.persist(session).await?;
        info!(
            session_id = %session.id,
            %branch,
            severity = session.metadata.severity().unwrap_or_default(),
            rollback_target = %rollback_target,
            "Hotfix started"
        );

        Ok(OperationResult::completed(
            op,
            session,
            format!("'{branch}' ready; rollback target {rollback_target}"),
        )
        .with_checks(report.checks)
        .with_checks(checks)
        .with_choice(chosen)
        .next(&["commit the fix", "hotfix_deploy to push, validate and merge"]))
    }

    /// Push, open the pull request, pass the severity gate, merge and clean up
    pub async fn hotfix_deploy(&self, params: HotfixDeployParams) -> Result<OperationResult> {
        let span = operation_span(Operation::HotfixDeploy.as_str(), &params.branch, &generate_correlation_id());
        self.run_hotfix_deploy(params).instrument(span).await
    }

    async fn run_hotfix_deploy(&self, params: HotfixDeployParams) -> Result<OperationResult> {
        let toolkit = self.toolkit(params.retry);
        let mut session = self.hotfix_session(&params.branch).await?;
        Span::current().record("session.id", field::display(session.id));

        let lease = self.acquire(&mut session).await?;
        let outcome = self.hotfix_deploy_locked(&mut session, &params, &toolkit).await;
        self.release(lease, outcome).await
    }

    async fn hotfix_deploy_locked(
        &self,
        session: &mut Session,
        params: &HotfixDeployParams,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<OperationResult> {
        let op = Operation::HotfixDeploy;
        let report = self.hotfix_pre_flight(op, session, toolkit).await?;
        if let Gate::Halt(result) = self.gate(&report, &Choice::default(), Some(&*session))? {
            return Ok(result);
        }

        let mut checks = report.checks;
        let draft = PullRequestDraft {
            title: params.title.as_deref(),
            body: &params.body,
            draft: false,
        };
        let waiting = loop {
            if !session.is_active() {
                break None;
            }
            match self.deploy_step(session, params, &draft, toolkit).await? {
                Step::Advanced(step_checks) => checks.extend(step_checks),
                Step::Wait(reason) => break Some(reason),
            }
        };

        let warnings = gate_warnings(session);
        let message = waiting.unwrap_or_else(|| {
            format!(
                "hotfix '{}' deployed as {}",
                session.branch_name,
                session.metadata.merge_commit().unwrap_or_default()
            )
        });
        Ok(OperationResult::completed(op, session, message)
            .with_checks(checks)
            .with_warnings(warnings))
    }

    async fn deploy_step(
        &self,
        session: &mut Session,
        params: &HotfixDeployParams,
        draft: &PullRequestDraft<'_>,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<Step> {
        let op = Operation::HotfixDeploy;
        match session.current_state {
            S::HotfixCommitted => Ok(Step::Advanced(
                self.push_step(op, session, S::HotfixPushed, toolkit).await?,
            )),
            S::HotfixPushed => {
                self.ensure_legal(session, S::HotfixValidated)?;
                let (_, checks) = self.ensure_pull_request(op, session, draft, toolkit).await?;
                self.validate_hotfix(op, session, toolkit).await?;
                Ok(Step::Advanced(checks))
            }
            S::Rollback => {
                self.validate_hotfix(op, session, toolkit).await?;
                Ok(Step::Advanced(Vec::new()))
            }
            S::HotfixValidated => Ok(Step::Advanced(self.deploy_merge_step(session, params, toolkit).await?)),
            S::HotfixDeployed => Ok(Step::Advanced(
                self.cleanup_branch_step(op, session, S::HotfixCleanup, true, toolkit)
                    .await?,
            )),
            S::HotfixCleanup => {
                self.advance(op, session, S::HotfixComplete, MetadataPatch::new(), ValidationContext::new())?;
                self.persist(session).await?;
                Ok(Step::Advanced(Vec::new()))
            }
            state => Err(OrchestratorError::TransitionRejected {
                from: state,
                to: S::HotfixPushed,
                reason: "commit the fix before deploying".to_string(),
            }),
        }
    }

    async fn deploy_merge_step(
        &self,
        session: &mut Session,
        params: &HotfixDeployParams,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<Vec<CheckResult>> {
        let op = Operation::HotfixDeploy;
        self.ensure_legal(session, S::HotfixDeployed)?;
        let number = recorded_pr(op, session)?;
        let method = params.merge_method;

        let outcome = toolkit
            .call("merge_pull_request", || self.platform.merge_pull_request(number, method))
            .await;
        let hash = self.settle(session, outcome).await?;
        let checks = self
            .verify(
                op,
                session,
                &PostFlightContext {
                    merge_commit: Some(hash.clone()),
                    ..PostFlightContext::default()
                },
            )
            .await?;
        self.advance(
            op,
            session,
            S::HotfixDeployed,
            MetadataPatch::new().set(MetadataUpdate::MergeCommit(hash.clone())),
            ValidationContext::new().with("merge_commit", hash.clone()),
        )?;
        self.persist(session).await?;
        info!(session_id = %session.id, merge_commit = %hash, "Hotfix deployed");
        Ok(checks)
    }

    /// Gather approval and CI in parallel, then enter HOTFIX_VALIDATED through the severity gate.
    ///
    /// A status that could not be fetched is left out of the context, so only a
    /// critical hotfix proceeds without it, and then with a recorded warning.
    async fn validate_hotfix(
        &self,
        operation: Operation,
        session: &mut Session,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<()> {
        self.ensure_legal(session, S::HotfixValidated)?;
        let number = recorded_pr(operation, session)?;
        let ci_timeout = self.config.concurrency.ci_wait_timeout();
        let policy = toolkit.policy();

        let platform = Arc::clone(&self.platform);
        let approval = task(async move {
            policy
                .call("check_pr_approval", || platform.check_pr_approval(number))
                .await
                .map_err(anyhow::Error::from)
        });
        let platform = Arc::clone(&self.platform);
        let checks = task(async move {
            policy
                .call_with_timeout("wait_for_checks", ci_timeout, || {
                    platform.wait_for_checks(number, ci_timeout)
                })
                .await
                .map_err(anyhow::Error::from)
        });
        let mut results = toolkit
            .execute_all(vec![approval, checks], ExecuteOptions::default())
            .await
            .into_iter();

        let mut facts = ValidationContext::new();
        for fact in ["review_approved", "ci_passed"] {
            match results.next().map(|r| r.outcome) {
                Some(Ok(value)) => {
                    toolkit.status_cache().insert(format!("{fact}:{number}"), value);
                    facts.insert(fact, value);
                }
                Some(Err(error)) => {
                    warn!(session_id = %session.id, fact, error = %error, "Hotfix status unavailable")
                }
                None => {}
            }
        }

        let advanced = self.advance(operation, session, S::HotfixValidated, MetadataPatch::new(), facts);
        self.persist(session).await?;
        let transition = advanced?;
        if !transition.warnings.is_empty() {
            warn!(session_id = %session.id, warnings = ?transition.warnings, "Hotfix validated with bypassed gate");
        }
        Ok(())
    }

    /// Revert the hotfix branch to its rollback target, then re-validate
    pub async fn hotfix_rollback(&self, params: HotfixRollbackParams) -> Result<OperationResult> {
        let span = operation_span(Operation::HotfixRollback.as_str(), &params.branch, &generate_correlation_id());
        self.run_hotfix_rollback(params).instrument(span).await
    }

    async fn run_hotfix_rollback(&self, params: HotfixRollbackParams) -> Result<OperationResult> {
        let toolkit = self.toolkit(params.retry);
        let mut session = self.hotfix_session(&params.branch).await?;
        Span::current().record("session.id", field::display(session.id));

        let lease = self.acquire(&mut session).await?;
        let outcome = self.hotfix_rollback_locked(&mut session, &toolkit).await;
        self.release(lease, outcome).await
    }

    async fn hotfix_rollback_locked(
        &self,
        session: &mut Session,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<OperationResult> {
        let op = Operation::HotfixRollback;
        let report = self.hotfix_pre_flight(op, session, toolkit).await?;
        if let Gate::Halt(result) = self.gate(&report, &Choice::default(), Some(&*session))? {
            return Ok(result);
        }
        self.ensure_legal(session, S::Rollback)?;

        let branch = session.branch_name.clone();
        let target = session
            .metadata
            .rollback_target()
            .map(str::to_string)
            .unwrap_or_default();

        let outcome = toolkit.call("revert_to", || self.git.revert_to(&target)).await;
        let revert = self.settle(session, outcome).await?;
        let outcome = toolkit.call("push", || self.git.push(&branch)).await;
        self.settle(session, outcome).await?;
        let outcome = toolkit.call("head_commit", || self.git.head_commit()).await;
        let head = self.settle(session, outcome).await?;
        let outcome = toolkit
            .call("remote_branch_exists", || self.git.remote_branch_exists(&branch))
            .await;
        let remote = self.settle(session, outcome).await?;
        let checks = self
            .verify(
                op,
                session,
                &PostFlightContext {
                    expected_commit: Some(revert.clone()),
                    head_commit: Some(head),
                    remote_branch_exists: Some(remote),
                    ..PostFlightContext::default()
                },
            )
            .await?;

        self.advance(
            op,
            session,
            S::Rollback,
            MetadataPatch::new().set(MetadataUpdate::CommitHash(revert.clone())),
            ValidationContext::new(),
        )?;
        self.persist(session).await?;
        info!(session_id = %session.id, %target, revert = %revert, "Hotfix rolled back");

        self.validate_hotfix(op, session, toolkit).await?;
        Ok(OperationResult::completed(
            op,
            session,
            format!("'{branch}' reverted to {target} and re-validated"),
        )
        .with_checks(report.checks)
        .with_checks(checks)
        .with_warnings(gate_warnings(session))
        .next(&["hotfix_deploy to merge the reverted state"]))
    }

    async fn hotfix_session(&self, branch: &str) -> Result<Session> {
        let session = self.active_session(branch).await?;
        if session.workflow_type != WorkflowType::Hotfix {
            return Err(OrchestratorError::TransitionRejected {
                from: session.current_state,
                to: S::HotfixValidated,
                reason: format!("'{branch}' is tracked by a {} session, not a hotfix", session.workflow_type),
            });
        }
        Ok(session)
    }

    async fn hotfix_pre_flight(
        &self,
        operation: Operation,
        session: &mut Session,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<PreFlightReport> {
        let outcome = self.current_branch(toolkit).await;
        let current = self.settle(session, outcome).await?;
        let context = PreFlightContext {
            branch: session.branch_name.clone(),
            current_branch: Some(current),
            ..PreFlightContext::default()
        };
        Ok(self.validation.pre_flight_check(operation, Some(&*session), &context))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{harness, Harness};
    use super::super::CommitParams;
    use super::*;
    use crate::concurrency::RetryPolicy;
    use crate::session::SessionRepository;
    use std::time::Duration;

    async fn committed_hotfix(h: &Harness, name: &str, severity: &str) -> String {
        h.orchestrator
            .hotfix_start(HotfixStartParams::new(name, severity))
            .await
            .unwrap();
        let branch = hotfix_branch(name);
        h.git.set_unstaged(&["src/db.rs"]);
        h.orchestrator.commit(CommitParams::new(&branch, "Fix pool leak")).await.unwrap();
        branch
    }

    #[test]
    fn test_hotfix_branch_prefix() {
        assert_eq!(hotfix_branch("db"), "hotfix/db");
        assert_eq!(hotfix_branch("hotfix/db"), "hotfix/db");
    }

    #[tokio::test]
    async fn test_start_records_rollback_target() {
        let h = harness();
        let result = h
            .orchestrator
            .hotfix_start(HotfixStartParams::new("db", "High"))
            .await
            .unwrap();
        assert_eq!(result.new_state, Some(S::HotfixReady));

        let session = h.repository.get_by_branch("hotfix/db").await.unwrap().unwrap();
        assert_eq!(session.metadata.severity(), Some("high"));
        assert!(session.metadata.rollback_target().is_some());
        assert_eq!(h.git.current(), "hotfix/db");
    }

    #[tokio::test]
    async fn test_unknown_severity_is_blocked() {
        let h = harness();
        let err = h
            .orchestrator
            .hotfix_start(HotfixStartParams::new("db", "urgent"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationFailure { .. }));
    }

    #[tokio::test]
    async fn test_low_severity_without_approval_stops_at_pushed() {
        let h = harness();
        let branch = committed_hotfix(&h, "db", "low").await;

        let err = h
            .orchestrator
            .hotfix_deploy(HotfixDeployParams::new(&branch).titled("Fix pool leak"))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::ValidationFailure { checks, .. } => {
                assert!(checks.iter().any(|c| c.name == "severity_gate"))
            }
            other => panic!("unexpected error: {other}"),
        }
        let session = h.repository.get_by_branch(&branch).await.unwrap().unwrap();
        assert_eq!(session.current_state, S::HotfixPushed);
        assert_eq!(session.metadata.pr_number, Some(1));
    }

    #[tokio::test]
    async fn test_critical_without_approval_deploys_with_warning() {
        let h = harness();
        let branch = committed_hotfix(&h, "auth", "critical").await;

        let result = h
            .orchestrator
            .hotfix_deploy(HotfixDeployParams::new(&branch).titled("Fix auth bypass"))
            .await
            .unwrap();
        assert_eq!(result.new_state, Some(S::HotfixComplete));
        assert_eq!(result.warnings.len(), 1);

        let session = h.repository.get(result.session_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(gate_warnings(&session).len(), 1);
        assert_eq!(h.git.current(), "main");
        assert!(!h.git.has_branch(&branch));
    }

    #[tokio::test]
    async fn test_deploy_before_commit_is_rejected() {
        let h = harness();
        h.orchestrator
            .hotfix_start(HotfixStartParams::new("db", "high"))
            .await
            .unwrap();
        let err = h
            .orchestrator
            .hotfix_deploy(HotfixDeployParams::new("hotfix/db").titled("Fix"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TransitionRejected { from: S::HotfixReady, .. }));
    }

    #[tokio::test]
    async fn test_flaky_approval_lookup_is_retried() {
        let h = harness();
        let branch = committed_hotfix(&h, "queue", "high").await;
        h.platform.approve(1);
        h.platform.fail_once("check_pr_approval");

        let params = HotfixDeployParams {
            retry: Some(RetryPolicy {
                max_retries: 2,
                retry_delay: Duration::from_millis(10),
                exponential_backoff: false,
            }),
            ..HotfixDeployParams::new(&branch).titled("Fix queue stall")
        };
        let result = h.orchestrator.hotfix_deploy(params).await.unwrap();
        assert_eq!(result.new_state, Some(S::HotfixComplete));
        assert!(result.warnings.is_empty());
        let approvals = h
            .platform
            .calls()
            .iter()
            .filter(|call| call.as_str() == "check_pr_approval")
            .count();
        assert_eq!(approvals, 2);
    }

    #[tokio::test]
    async fn test_failed_approval_lookup_without_retry_blocks_high_severity() {
        let h = harness();
        let branch = committed_hotfix(&h, "queue", "high").await;
        h.platform.approve(1);
        h.platform.fail_once("check_pr_approval");

        let err = h
            .orchestrator
            .hotfix_deploy(HotfixDeployParams::new(&branch).titled("Fix queue stall"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationFailure { .. }));
        let session = h.repository.get_by_branch(&branch).await.unwrap().unwrap();
        assert_eq!(session.current_state, S::HotfixPushed);
    }

    #[tokio::test]
    async fn test_rollback_from_validated_revalidates() {
        let h = harness();
        let branch = committed_hotfix(&h, "cache", "high").await;
        h.platform.approve(1);
        h.platform.fail_on("merge_pull_request");
        h.orchestrator
            .hotfix_deploy(HotfixDeployParams::new(&branch).titled("Fix cache"))
            .await
            .unwrap_err();
        let session = h.repository.get_by_branch(&branch).await.unwrap().unwrap();
        assert_eq!(session.current_state, S::HotfixValidated);

        let result = h
            .orchestrator
            .hotfix_rollback(HotfixRollbackParams::new(&branch))
            .await
            .unwrap();
        assert_eq!(result.new_state, Some(S::HotfixValidated));
        let session = h.repository.get_by_branch(&branch).await.unwrap().unwrap();
        let visited: Vec<S> = session.state_history.iter().map(|e| e.to_state).collect();
        assert!(visited.ends_with(&[S::Rollback, S::HotfixValidated]));
    }
}
