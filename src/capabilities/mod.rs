//! External collaborators consumed by the orchestration core
//!
//! Git and the code-hosting platform are reached only through these traits.
//! Implementations live outside the crate; [`fakes`] provides in-memory
//! versions for tests and embedding.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod fakes;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStatus {
    pub branch: String,
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
}

impl GitStatus {
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty() && self.unstaged.is_empty() && self.untracked.is_empty()
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    pub fn changed_files(&self) -> usize {
        self.staged.len() + self.unstaged.len() + self.untracked.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub hash: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebaseOutcome {
    Clean,
    Conflicts(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Merge,
    #[default]
    Squash,
    Rebase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
    pub draft: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestState {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub head: String,
    pub base: String,
    pub state: PullRequestState,
}

/// Git operations the orchestrator performs on the working copy
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait GitCapability: Send + Sync {
    async fn get_current_branch(&self) -> Result<String>;

    async fn get_status(&self) -> Result<GitStatus>;

    async fn checkout_branch(&self, branch: &str) -> Result<()>;

    /// Create `branch` from `from` without switching to it
    async fn create_branch(&self, branch: &str, from: &str) -> Result<()>;

    async fn branch_exists(&self, branch: &str) -> Result<bool>;

    /// Stash every uncommitted change under `label`, returning the stash ref
    async fn stash_changes(&self, label: &str) -> Result<String>;

    async fn find_stash(&self, label: &str) -> Result<Option<String>>;

    /// Apply and drop a stash
    async fn apply_stash(&self, stash_ref: &str) -> Result<()>;

    /// Commit and return the new commit hash. Without `staged_only` every change is added first.
    async fn commit(&self, message: &str, staged_only: bool) -> Result<String>;

    async fn push(&self, branch: &str) -> Result<()>;

    async fn remote_branch_exists(&self, branch: &str) -> Result<bool>;

    async fn get_commits_since(&self, reference: &str) -> Result<Vec<CommitSummary>>;

    async fn is_branch_merged(&self, branch: &str, into: &str) -> Result<bool>;

    async fn rebase(&self, onto: &str) -> Result<RebaseOutcome>;

    /// Revert the current branch back to `target`, returning the revert commit
    async fn revert_to(&self, target: &str) -> Result<String>;

    async fn delete_branch(&self, branch: &str, remote: bool) -> Result<()>;

    async fn head_commit(&self) -> Result<String>;
}

/// Provider-neutral code-hosting operations
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PlatformCapability: Send + Sync {
    async fn create_pull_request(&self, request: &PullRequestRequest) -> Result<PullRequest>;

    async fn get_pull_request(&self, number: u64) -> Result<PullRequest>;

    /// Merge and return the merge commit hash
    async fn merge_pull_request(&self, number: u64, method: MergeMethod) -> Result<String>;

    async fn check_pr_approval(&self, number: u64) -> Result<bool>;

    /// Block until CI settles or `timeout` elapses; true when every check passed
    async fn wait_for_checks(&self, number: u64, timeout: Duration) -> Result<bool>;
}
