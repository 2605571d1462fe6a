use tracing::{field, info, Instrument, Span};

use super::{Choice, Gate, OperationResult, Orchestrator, ShipParams};
use crate::capabilities::{PullRequestRequest, PullRequestState, RebaseOutcome};
use crate::concurrency::ConcurrencyToolkit;
use crate::error::{OrchestratorError, Result};
use crate::session::{MetadataPatch, MetadataUpdate, Session};
use crate::telemetry::{generate_correlation_id, operation_span};
use crate::validation::{CheckResult, CheckSeverity, Operation, PostFlightContext, PreFlightContext, PreFlightReport};
use crate::workflows::{ValidationContext, WorkflowState as S, WorkflowType};

/// One pipeline step either moved the session on or has to wait for the outside world
pub(super) enum Step {
    Advanced(Vec<CheckResult>),
    Wait(String),
}

/// Text for a pull request that may still have to be opened
pub(super) struct PullRequestDraft<'a> {
    pub title: Option<&'a str>,
    pub body: &'a str,
    pub draft: bool,
}

pub(super) fn recorded_pr(operation: Operation, session: &Session) -> Result<u64> {
    session
        .metadata
        .pr_number
        .ok_or_else(|| OrchestratorError::ValidationFailure {
            operation: operation.to_string(),
            checks: vec![CheckResult::fail(
                "pr_number_set",
                "no pull request recorded for this session",
                CheckSeverity::Blocking,
            )],
        })
}

impl Orchestrator {
    /// Drive a branch towards merge.
    ///
    /// A launch session goes PUSHED, then PR_CREATED, then COMPLETE once the
    /// branch is merged. Without a session a ship session is created and taken
    /// as far as the outside world allows; calling again resumes it.
    pub async fn ship(&self, params: ShipParams) -> Result<OperationResult> {
        let span = operation_span(Operation::Ship.as_str(), &params.branch, &generate_correlation_id());
        self.run_ship(params).instrument(span).await
    }

    async fn run_ship(&self, params: ShipParams) -> Result<OperationResult> {
        let toolkit = self.toolkit(params.retry);
        let existing = self.repository.get_by_branch(&params.branch).await?;
        if let Some(session) = existing.as_ref().filter(|s| s.workflow_type == WorkflowType::Hotfix) {
            return Err(OrchestratorError::TransitionRejected {
                from: session.current_state,
                to: S::HotfixPushed,
                reason: "hotfix sessions are deployed with hotfix_deploy".to_string(),
            });
        }

        let current = self.current_branch(&toolkit).await?;
        let status = self.working_tree(&toolkit).await?;
        let context = PreFlightContext {
            branch: params.branch.clone(),
            current_branch: Some(current),
            status: Some(status),
            ..PreFlightContext::default()
        };
        let report = self.validation.pre_flight_check(Operation::Ship, existing.as_ref(), &context);
        if let Gate::Halt(result) = self.gate(&report, &Choice::default(), existing.as_ref())? {
            return Ok(result);
        }

        let mut session = match existing {
            Some(session) => session,
            None => {
                let base = params
                    .base
                    .clone()
                    .unwrap_or_else(|| self.config.validation.default_base.clone());
                let session = Session::new(self.workflows.machine(WorkflowType::Ship), &params.branch, &base);
                self.repository.create(&session).await?;
                session
            }
        };
        Span::current().record("session.id", field::display(session.id));

        let lease = self.acquire(&mut session).await?;
        let outcome = self.ship_locked(&mut session, &params, report, &toolkit).await;
        self.release(lease, outcome).await
    }

    async fn ship_locked(
        &self,
        session: &mut Session,
        params: &ShipParams,
        report: PreFlightReport,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<OperationResult> {
        let mut checks = report.checks;
        let waiting = loop {
            if !session.is_active() {
                break None;
            }
            let step = if session.workflow_type == WorkflowType::Launch {
                self.launch_ship_step(session, params, toolkit).await?
            } else {
                self.ship_step(session, params, toolkit).await?
            };
            match step {
                Step::Advanced(step_checks) => checks.extend(step_checks),
                Step::Wait(reason) => break Some(reason),
            }
        };

        let result = match waiting {
            Some(reason) => {
                info!(session_id = %session.id, state = %session.current_state, %reason, "Ship paused");
                OperationResult::completed(Operation::Ship, session, reason).next(&["run ship again to resume"])
            }
            None => {
                info!(session_id = %session.id, state = %session.current_state, "Ship finished");
                OperationResult::completed(
                    Operation::Ship,
                    session,
                    format!("'{}' shipped into '{}'", session.branch_name, session.base_branch),
                )
            }
        };
        Ok(result.with_checks(checks))
    }

    async fn launch_ship_step(
        &self,
        session: &mut Session,
        params: &ShipParams,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<Step> {
        let op = Operation::Ship;
        match session.current_state {
            S::ChangesCommitted => Ok(Step::Advanced(self.push_step(op, session, S::Pushed, toolkit).await?)),
            S::Pushed => {
                let draft = PullRequestDraft::from(params);
                Ok(Step::Advanced(
                    self.open_pr_step(op, session, S::PrCreated, &draft, toolkit).await?,
                ))
            }
            S::PrCreated => {
                let number = recorded_pr(op, session)?;
                if !self.branch_merged(session, toolkit).await? {
                    return Ok(Step::Wait(format!(
                        "pull request #{number} is open; ship again once it is merged"
                    )));
                }
                self.advance(
                    op,
                    session,
                    S::Complete,
                    MetadataPatch::new(),
                    ValidationContext::new().with("branch_merged", true),
                )?;
                self.persist(session).await?;
                Ok(Step::Advanced(Vec::new()))
            }
            state => Err(OrchestratorError::TransitionRejected {
                from: state,
                to: S::Pushed,
                reason: "commit changes before shipping".to_string(),
            }),
        }
    }

    async fn ship_step(
        &self,
        session: &mut Session,
        params: &ShipParams,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<Step> {
        let op = Operation::Ship;
        match session.current_state {
            S::Init | S::Error => {
                self.advance(op, session, S::Validating, MetadataPatch::new(), ValidationContext::new())?;
                self.persist(session).await?;
                Ok(Step::Advanced(Vec::new()))
            }
            S::Validating => Ok(Step::Advanced(self.record_changes_step(session, params, toolkit).await?)),
            S::ChangesCommitted | S::ChangesRequested => {
                Ok(Step::Advanced(self.push_step(op, session, S::Pushed, toolkit).await?))
            }
            S::Pushed => {
                let draft = PullRequestDraft::from(params);
                Ok(Step::Advanced(
                    self.open_pr_step(op, session, S::PrCreated, &draft, toolkit).await?,
                ))
            }
            S::PrCreated => {
                self.advance(op, session, S::WaitingApproval, MetadataPatch::new(), ValidationContext::new())?;
                self.persist(session).await?;
                Ok(Step::Advanced(Vec::new()))
            }
            S::WaitingApproval => {
                let number = recorded_pr(op, session)?;
                let outcome = self.approval(number, toolkit).await;
                if self.settle(session, outcome).await? {
                    self.advance(
                        op,
                        session,
                        S::Approved,
                        MetadataPatch::new().set(MetadataUpdate::Approvals(1)),
                        ValidationContext::new().with("review_approved", true),
                    )?;
                    self.persist(session).await?;
                    Ok(Step::Advanced(Vec::new()))
                } else if params.changes_requested {
                    self.advance(op, session, S::ChangesRequested, MetadataPatch::new(), ValidationContext::new())?;
                    self.persist(session).await?;
                    Ok(Step::Wait(format!(
                        "changes requested on pull request #{number}; commit fixes and ship again"
                    )))
                } else {
                    Ok(Step::Wait(format!("waiting for review approval on pull request #{number}")))
                }
            }
            S::Approved | S::MergeConflict => {
                let patch = if session.current_state == S::MergeConflict {
                    MetadataPatch::new().set(MetadataUpdate::RebaseConflicts(Vec::new()))
                } else {
                    MetadataPatch::new()
                };
                self.advance(op, session, S::Rebasing, patch, ValidationContext::new())?;
                self.persist(session).await?;
                Ok(Step::Advanced(Vec::new()))
            }
            S::Rebasing => self.rebase_step(session, toolkit).await,
            S::Merging => Ok(Step::Advanced(self.merge_step(session, params, toolkit).await?)),
            S::Merged => Ok(Step::Advanced(
                self.cleanup_branch_step(op, session, S::Cleanup, params.delete_branch, toolkit)
                    .await?,
            )),
            S::Cleanup => {
                self.advance(op, session, S::Complete, MetadataPatch::new(), ValidationContext::new())?;
                self.persist(session).await?;
                Ok(Step::Advanced(Vec::new()))
            }
            state => Err(OrchestratorError::TransitionRejected {
                from: state,
                to: S::Complete,
                reason: format!("ship workflow has no step from {state}"),
            }),
        }
    }

    /// VALIDATING -> CHANGES_COMMITTED: commit pending work when asked, else record HEAD
    async fn record_changes_step(
        &self,
        session: &mut Session,
        params: &ShipParams,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<Vec<CheckResult>> {
        let op = Operation::Ship;
        self.ensure_legal(session, S::ChangesCommitted)?;
        let outcome = self.working_tree(toolkit).await;
        let status = self.settle(session, outcome).await?;

        let committed = match &params.commit_message {
            Some(message) if !status.is_clean() => {
                let outcome = toolkit.call("commit", || self.git.commit(message, false)).await;
                Some(self.settle(session, outcome).await?)
            }
            _ => None,
        };
        if committed.is_none() {
            let base = session.base_branch.clone();
            let outcome = toolkit
                .call("get_commits_since", || self.git.get_commits_since(&base))
                .await;
            if self.settle(session, outcome).await?.is_empty() {
                return Err(OrchestratorError::ValidationFailure {
                    operation: op.to_string(),
                    checks: vec![CheckResult::fail(
                        "has_commits_to_ship",
                        format!("'{}' has no commits ahead of '{base}'", session.branch_name),
                        CheckSeverity::Blocking,
                    )],
                });
            }
        }

        let outcome = toolkit.call("head_commit", || self.git.head_commit()).await;
        let head = self.settle(session, outcome).await?;
        let hash = committed.unwrap_or_else(|| head.clone());
        let checks = self
            .verify(
                op,
                session,
                &PostFlightContext {
                    expected_commit: Some(hash.clone()),
                    head_commit: Some(head),
                    ..PostFlightContext::default()
                },
            )
            .await?;
        self.advance(
            op,
            session,
            S::ChangesCommitted,
            MetadataPatch::new().set(MetadataUpdate::CommitHash(hash.clone())),
            ValidationContext::new().with("commit_hash", hash),
        )?;
        self.persist(session).await?;
        Ok(checks)
    }

    /// REBASING -> MERGING or MERGE_CONFLICT
    async fn rebase_step(&self, session: &mut Session, toolkit: &ConcurrencyToolkit) -> Result<Step> {
        let op = Operation::Ship;
        self.ensure_legal(session, S::Merging)?;
        let base = session.base_branch.clone();
        let branch = session.branch_name.clone();

        let outcome = toolkit.call("rebase", || self.git.rebase(&base)).await;
        match self.settle(session, outcome).await? {
            RebaseOutcome::Conflicts(files) => {
                let count = files.len();
                self.advance(
                    op,
                    session,
                    S::MergeConflict,
                    MetadataPatch::new().set(MetadataUpdate::RebaseConflicts(files)),
                    ValidationContext::new(),
                )?;
                self.persist(session).await?;
                Ok(Step::Wait(format!(
                    "rebase onto '{base}' stopped on {count} conflicting file(s); resolve them and ship again"
                )))
            }
            RebaseOutcome::Clean => {
                let outcome = toolkit.call("push", || self.git.push(&branch)).await;
                self.settle(session, outcome).await?;

                let number = recorded_pr(op, session)?;
                let limit = self.config.concurrency.ci_wait_timeout();
                let outcome = toolkit
                    .call_with_timeout("wait_for_checks", limit, || {
                        self.platform.wait_for_checks(number, limit)
                    })
                    .await;
                let passed = self.settle(session, outcome).await?;
                toolkit.status_cache().insert(format!("ci:{number}"), passed);

                session.annotate(MetadataPatch::new().set(MetadataUpdate::CiPassed(passed)));
                let advanced = self.advance(
                    op,
                    session,
                    S::Merging,
                    MetadataPatch::new(),
                    ValidationContext::new().with("ci_passed", passed),
                );
                self.persist(session).await?;
                advanced?;
                Ok(Step::Advanced(Vec::new()))
            }
        }
    }

    /// MERGING -> MERGED, or ERROR when the platform refuses the merge
    async fn merge_step(
        &self,
        session: &mut Session,
        params: &ShipParams,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<Vec<CheckResult>> {
        let op = Operation::Ship;
        self.ensure_legal(session, S::Merged)?;
        let number = recorded_pr(op, session)?;
        let method = params.merge_method;

        let hash = match toolkit
            .call("merge_pull_request", || self.platform.merge_pull_request(number, method))
            .await
        {
            Ok(hash) => hash,
            Err(error) => {
                self.advance(op, session, S::Error, MetadataPatch::new(), ValidationContext::new())?;
                session.record_failure("merge_pull_request", &error.to_string());
                self.persist(session).await?;
                return Err(error);
            }
        };

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
            S::Merged,
            MetadataPatch::new().set(MetadataUpdate::MergeCommit(hash.clone())),
            ValidationContext::new().with("merge_commit", hash),
        )?;
        self.persist(session).await?;
        Ok(checks)
    }

    async fn branch_merged(&self, session: &mut Session, toolkit: &ConcurrencyToolkit) -> Result<bool> {
        if let Some(number) = session.metadata.pr_number {
            let pr = match toolkit.cached_pull_request(number) {
                Some(pr) => pr,
                None => {
                    let outcome = toolkit
                        .call("get_pull_request", || self.platform.get_pull_request(number))
                        .await;
                    let pr = self.settle(session, outcome).await?;
                    toolkit.remember_pull_request(&pr);
                    pr
                }
            };
            if pr.state == PullRequestState::Merged {
                return Ok(true);
            }
        }
        let branch = session.branch_name.clone();
        let base = session.base_branch.clone();
        let outcome = toolkit
            .call("is_branch_merged", || self.git.is_branch_merged(&branch, &base))
            .await;
        self.settle(session, outcome).await
    }

    pub(super) async fn push_step(
        &self,
        operation: Operation,
        session: &mut Session,
        to: S,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<Vec<CheckResult>> {
        self.ensure_legal(session, to)?;
        let branch = session.branch_name.clone();

        let outcome = toolkit.call("push", || self.git.push(&branch)).await;
        self.settle(session, outcome).await?;
        let outcome = toolkit
            .call("remote_branch_exists", || self.git.remote_branch_exists(&branch))
            .await;
        let exists = self.settle(session, outcome).await?;
        let checks = self
            .verify(
                operation,
                session,
                &PostFlightContext {
                    remote_branch_exists: Some(exists),
                    ..PostFlightContext::default()
                },
            )
            .await?;

        self.advance(
            operation,
            session,
            to,
            MetadataPatch::new(),
            ValidationContext::new().with("remote_branch_exists", exists),
        )?;
        self.persist(session).await?;
        info!(session_id = %session.id, %branch, "Branch pushed");
        Ok(checks)
    }

    /// Open the session's pull request unless one is already recorded
    pub(super) async fn ensure_pull_request(
        &self,
        operation: Operation,
        session: &mut Session,
        draft: &PullRequestDraft<'_>,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<(u64, Vec<CheckResult>)> {
        if let Some(number) = session.metadata.pr_number {
            return Ok((number, Vec::new()));
        }
        let title = draft
            .title
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| OrchestratorError::ValidationFailure {
                operation: operation.to_string(),
                checks: vec![CheckResult::fail(
                    "pr_title_present",
                    "a pull request title is required",
                    CheckSeverity::Blocking,
                )],
            })?;
        let request = PullRequestRequest {
            head: session.branch_name.clone(),
            base: session.base_branch.clone(),
            title: title.to_string(),
            body: draft.body.to_string(),
            draft: draft.draft,
        };

        let outcome = toolkit
            .call("create_pull_request", || self.platform.create_pull_request(&request))
            .await;
        let pr = self.settle(session, outcome).await?;
        toolkit.remember_pull_request(&pr);
        let checks = self
            .verify(
                operation,
                session,
                &PostFlightContext {
                    pr_number: Some(pr.number),
                    ..PostFlightContext::default()
                },
            )
            .await?;

        session.annotate(
            MetadataPatch::new()
                .set(MetadataUpdate::PrNumber(pr.number))
                .set(MetadataUpdate::PrUrl(pr.url.clone())),
        );
        self.persist(session).await?;
        info!(session_id = %session.id, pr = pr.number, url = %pr.url, "Pull request opened");
        Ok((pr.number, checks))
    }

    pub(super) async fn open_pr_step(
        &self,
        operation: Operation,
        session: &mut Session,
        to: S,
        draft: &PullRequestDraft<'_>,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<Vec<CheckResult>> {
        self.ensure_legal(session, to)?;
        let (number, checks) = self.ensure_pull_request(operation, session, draft, toolkit).await?;
        self.advance(
            operation,
            session,
            to,
            MetadataPatch::new(),
            ValidationContext::new().with("pr_number", number),
        )?;
        self.persist(session).await?;
        Ok(checks)
    }

    /// Return to the base branch and optionally remove the merged branch
    pub(super) async fn cleanup_branch_step(
        &self,
        operation: Operation,
        session: &mut Session,
        to: S,
        delete: bool,
        toolkit: &ConcurrencyToolkit,
    ) -> Result<Vec<CheckResult>> {
        self.ensure_legal(session, to)?;
        let branch = session.branch_name.clone();
        let base = session.base_branch.clone();

        let outcome = toolkit.call("checkout_branch", || self.git.checkout_branch(&base)).await;
        self.settle(session, outcome).await?;
        let outcome = self.current_branch(toolkit).await;
        let mut facts = PostFlightContext {
            expected_branch: Some(base.clone()),
            current_branch: Some(self.settle(session, outcome).await?),
            ..PostFlightContext::default()
        };

        if delete {
            let outcome = toolkit
                .call("remote_branch_exists", || self.git.remote_branch_exists(&branch))
                .await;
            let remote = self.settle(session, outcome).await?;
            let outcome = toolkit
                .call("delete_branch", || self.git.delete_branch(&branch, remote))
                .await;
            self.settle(session, outcome).await?;
            let outcome = toolkit.call("branch_exists", || self.git.branch_exists(&branch)).await;
            facts.deleted_branch_exists = Some(self.settle(session, outcome).await?);
        }

        let checks = self.verify(operation, session, &facts).await?;
        self.advance(operation, session, to, MetadataPatch::new(), ValidationContext::new())?;
        self.persist(session).await?;
        info!(session_id = %session.id, %branch, deleted = delete, "Branch cleaned up");
        Ok(checks)
    }
}

impl<'a> From<&'a ShipParams> for PullRequestDraft<'a> {
    fn from(params: &'a ShipParams) -> Self {
        Self {
            title: params.title.as_deref(),
            body: &params.body,
            draft: params.draft,
        }
    }
}
