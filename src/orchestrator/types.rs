use serde::Serialize;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::capabilities::MergeMethod;
use crate::concurrency::RetryPolicy;
use crate::session::{Lease, Session};
use crate::validation::{CheckOption, CheckResult, Operation, PreFlightReport};
use crate::workflows::{Action, WorkflowState};

/// How to answer a pre-flight warning that offers options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Choice {
    /// Take the recommended option without asking
    pub force: bool,
    /// Take this option id
    pub option: Option<String>,
}

impl Choice {
    pub fn recommended() -> Self {
        Self {
            force: true,
            option: None,
        }
    }

    pub fn pick(id: &str) -> Self {
        Self {
            force: false,
            option: Some(id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchParams {
    pub branch: String,
    /// Defaults to `validation.default_base`
    pub base: Option<String>,
    pub choice: Choice,
    pub retry: Option<RetryPolicy>,
}

impl LaunchParams {
    pub fn new(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommitParams {
    pub branch: String,
    pub message: String,
    pub staged_only: bool,
    pub retry: Option<RetryPolicy>,
}

impl CommitParams {
    pub fn new(branch: &str, message: &str) -> Self {
        Self {
            branch: branch.to_string(),
            message: message.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShipParams {
    pub branch: String,
    /// Base for a session created by this call
    pub base: Option<String>,
    /// Pull request title, required only when a pull request has to be opened
    pub title: Option<String>,
    pub body: String,
    pub draft: bool,
    /// Commits pending changes before pushing when set
    pub commit_message: Option<String>,
    pub merge_method: MergeMethod,
    /// Reviewer asked for changes; moves a waiting pull request back to work
    pub changes_requested: bool,
    /// Remove the branch locally and remotely once merged
    pub delete_branch: bool,
    pub retry: Option<RetryPolicy>,
}

impl ShipParams {
    pub fn new(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
            base: None,
            title: None,
            body: String::new(),
            draft: false,
            commit_message: None,
            merge_method: MergeMethod::default(),
            changes_requested: false,
            delete_branch: true,
            retry: None,
        }
    }

    pub fn titled(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SwapParams {
    pub target: String,
    pub choice: Choice,
    pub retry: Option<RetryPolicy>,
}

impl SwapParams {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AbortParams {
    pub branch: String,
    /// Also remove the branch locally and on the remote
    pub delete_branch: bool,
    pub choice: Choice,
    pub retry: Option<RetryPolicy>,
}

impl AbortParams {
    pub fn new(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HotfixStartParams {
    /// Short name; the branch becomes `hotfix/<name>`
    pub name: String,
    pub severity: String,
    pub base: Option<String>,
    pub choice: Choice,
    pub retry: Option<RetryPolicy>,
}

impl HotfixStartParams {
    pub fn new(name: &str, severity: &str) -> Self {
        Self {
            name: name.to_string(),
            severity: severity.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HotfixDeployParams {
    pub branch: String,
    pub title: Option<String>,
    pub body: String,
    pub merge_method: MergeMethod,
    pub retry: Option<RetryPolicy>,
}

impl HotfixDeployParams {
    pub fn new(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
            ..Self::default()
        }
    }

    pub fn titled(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct HotfixRollbackParams {
    pub branch: String,
    pub retry: Option<RetryPolicy>,
}

impl HotfixRollbackParams {
    pub fn new(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
            retry: None,
        }
    }
}

/// Outcome of one orchestrator call
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub operation: Operation,
    pub success: bool,
    pub session_id: Option<Uuid>,
    pub new_state: Option<WorkflowState>,
    pub applied_checks: Vec<CheckResult>,
    /// Offered when pre-flight needs a decision
    pub options: Vec<CheckOption>,
    pub chosen_option: Option<CheckOption>,
    pub warnings: Vec<String>,
    pub message: String,
    pub next_steps: Vec<String>,
}

impl OperationResult {
    pub(crate) fn completed(operation: Operation, session: &Session, message: impl Into<String>) -> Self {
        Self::finished(operation, Some(session), message)
    }

    /// Success for calls that may act without a session, such as swap and cleanup
    pub(crate) fn finished(operation: Operation, session: Option<&Session>, message: impl Into<String>) -> Self {
        Self {
            operation,
            success: true,
            session_id: session.map(|s| s.id),
            new_state: session.map(|s| s.current_state),
            applied_checks: Vec::new(),
            options: Vec::new(),
            chosen_option: None,
            warnings: Vec::new(),
            message: message.into(),
            next_steps: Vec::new(),
        }
    }

    pub(crate) fn needs_decision(report: &PreFlightReport, session_id: Option<Uuid>) -> Self {
        Self {
            operation: report.operation,
            success: false,
            session_id,
            new_state: None,
            applied_checks: report.checks.clone(),
            options: report.options.clone(),
            chosen_option: None,
            warnings: Vec::new(),
            message: format!("{} needs a decision before it can continue", report.operation),
            next_steps: report
                .options
                .iter()
                .map(|o| format!("{}: {}", o.id, o.description))
                .collect(),
        }
    }

    pub(crate) fn cancelled(report: &PreFlightReport, option: CheckOption, session_id: Option<Uuid>) -> Self {
        Self {
            operation: report.operation,
            success: false,
            session_id,
            new_state: None,
            applied_checks: report.checks.clone(),
            options: report.options.clone(),
            chosen_option: Some(option),
            warnings: Vec::new(),
            message: format!("{} cancelled; nothing was changed", report.operation),
            next_steps: Vec::new(),
        }
    }

    pub(crate) fn with_checks(mut self, checks: Vec<CheckResult>) -> Self {
        self.applied_checks.extend(checks);
        self
    }

    pub(crate) fn with_choice(mut self, chosen: Option<CheckOption>) -> Self {
        self.chosen_option = chosen;
        self
    }

    pub(crate) fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub(crate) fn next(mut self, steps: &[&str]) -> Self {
        self.next_steps = steps.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Where a session stands and what can happen next
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session: Session,
    pub resumable: bool,
    pub allowed_actions: BTreeSet<Action>,
    pub next_states: Vec<WorkflowState>,
    pub lease: Option<Lease>,
}
