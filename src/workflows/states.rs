// Workflow vocabulary: the state names, workflow kinds and user-facing verbs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which transition table a session follows. Fixed at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    /// Standard feature delivery: branch, commit, push, PR
    Launch,
    /// Full pipeline through review, rebase, merge and cleanup
    Ship,
    /// Emergency fix with a severity-gated validation step
    Hotfix,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Launch => "launch",
            WorkflowType::Ship => "ship",
            WorkflowType::Hotfix => "hotfix",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every state any workflow can be in. Each table only defines its own subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    // Shared by launch and ship
    Init,
    ChangesCommitted,
    Pushed,
    PrCreated,
    Complete,
    Aborted,

    // Launch only
    BranchReady,

    // Ship only
    Validating,
    WaitingApproval,
    Approved,
    ChangesRequested,
    Rebasing,
    MergeConflict,
    Merging,
    Merged,
    Error,
    Cleanup,

    // Hotfix
    HotfixInit,
    HotfixReady,
    HotfixCommitted,
    HotfixPushed,
    HotfixValidated,
    HotfixDeployed,
    Rollback,
    HotfixCleanup,
    HotfixComplete,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 26] = [
        WorkflowState::Init,
        WorkflowState::ChangesCommitted,
        WorkflowState::Pushed,
        WorkflowState::PrCreated,
        WorkflowState::Complete,
        WorkflowState::Aborted,
        WorkflowState::BranchReady,
        WorkflowState::Validating,
        WorkflowState::WaitingApproval,
        WorkflowState::Approved,
        WorkflowState::ChangesRequested,
        WorkflowState::Rebasing,
        WorkflowState::MergeConflict,
        WorkflowState::Merging,
        WorkflowState::Merged,
        WorkflowState::Error,
        WorkflowState::Cleanup,
        WorkflowState::HotfixInit,
        WorkflowState::HotfixReady,
        WorkflowState::HotfixCommitted,
        WorkflowState::HotfixPushed,
        WorkflowState::HotfixValidated,
        WorkflowState::HotfixDeployed,
        WorkflowState::Rollback,
        WorkflowState::HotfixCleanup,
        WorkflowState::HotfixComplete,
    ];

    /// End states shared by all workflows; no table may leave them
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Complete | WorkflowState::Aborted | WorkflowState::HotfixComplete
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Init => "INIT",
            WorkflowState::ChangesCommitted => "CHANGES_COMMITTED",
            WorkflowState::Pushed => "PUSHED",
            WorkflowState::PrCreated => "PR_CREATED",
            WorkflowState::Complete => "COMPLETE",
            WorkflowState::Aborted => "ABORTED",
            WorkflowState::BranchReady => "BRANCH_READY",
            WorkflowState::Validating => "VALIDATING",
            WorkflowState::WaitingApproval => "WAITING_APPROVAL",
            WorkflowState::Approved => "APPROVED",
            WorkflowState::ChangesRequested => "CHANGES_REQUESTED",
            WorkflowState::Rebasing => "REBASING",
            WorkflowState::MergeConflict => "MERGE_CONFLICT",
            WorkflowState::Merging => "MERGING",
            WorkflowState::Merged => "MERGED",
            WorkflowState::Error => "ERROR",
            WorkflowState::Cleanup => "CLEANUP",
            WorkflowState::HotfixInit => "HOTFIX_INIT",
            WorkflowState::HotfixReady => "HOTFIX_READY",
            WorkflowState::HotfixCommitted => "HOTFIX_COMMITTED",
            WorkflowState::HotfixPushed => "HOTFIX_PUSHED",
            WorkflowState::HotfixValidated => "HOTFIX_VALIDATED",
            WorkflowState::HotfixDeployed => "HOTFIX_DEPLOYED",
            WorkflowState::Rollback => "ROLLBACK",
            WorkflowState::HotfixCleanup => "HOTFIX_CLEANUP",
            WorkflowState::HotfixComplete => "HOTFIX_COMPLETE",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown workflow state '{s}'"))
    }
}

/// User-facing verbs derived from the transitions available in a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Validate,
    Commit,
    Reset,
    Push,
    CreatePr,
    RequestReview,
    Approve,
    RequestChanges,
    Rebase,
    Merge,
    Cleanup,
    Complete,
    Deploy,
    Rollback,
    Abort,
}

impl Action {
    /// Map a single edge of a transition table to the verb that triggers it.
    ///
    /// System-driven edges (merge failures, conflicts) have no verb.
    pub fn for_transition(from: WorkflowState, to: WorkflowState) -> Option<Action> {
        use WorkflowState::*;
        let action = match (from, to) {
            (ChangesCommitted, BranchReady) => Action::Reset,
            (_, BranchReady) | (_, HotfixReady) => Action::Start,
            (_, Validating) => Action::Validate,
            (_, HotfixValidated) => Action::Validate,
            (_, ChangesCommitted) | (_, HotfixCommitted) => Action::Commit,
            (_, Pushed) | (_, HotfixPushed) => Action::Push,
            (_, PrCreated) => Action::CreatePr,
            (_, WaitingApproval) => Action::RequestReview,
            (_, Approved) => Action::Approve,
            (_, ChangesRequested) => Action::RequestChanges,
            (_, Rebasing) => Action::Rebase,
            (_, Merging) | (_, Merged) => Action::Merge,
            (_, Cleanup) | (_, HotfixCleanup) => Action::Cleanup,
            (_, Complete) | (_, HotfixComplete) => Action::Complete,
            (_, HotfixDeployed) => Action::Deploy,
            (_, Rollback) => Action::Rollback,
            (_, Aborted) => Action::Abort,
            (_, MergeConflict) | (_, Error) | (_, Init) | (_, HotfixInit) => return None,
        };
        Some(action)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Validate => "validate",
            Action::Commit => "commit",
            Action::Reset => "reset",
            Action::Push => "push",
            Action::CreatePr => "create_pr",
            Action::RequestReview => "request_review",
            Action::Approve => "approve",
            Action::RequestChanges => "request_changes",
            Action::Rebase => "rebase",
            Action::Merge => "merge",
            Action::Cleanup => "cleanup",
            Action::Complete => "complete",
            Action::Deploy => "deploy",
            Action::Rollback => "rollback",
            Action::Abort => "abort",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
