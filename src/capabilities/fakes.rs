// In-memory git and platform implementations - no side effects outside the process

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::*;

#[derive(Debug, Clone)]
struct Stash {
    reference: String,
    label: String,
    staged: Vec<String>,
    unstaged: Vec<String>,
    untracked: Vec<String>,
}

#[derive(Debug, Default)]
struct RepoState {
    current: String,
    logs: BTreeMap<String, Vec<CommitSummary>>,
    remote: BTreeSet<String>,
    staged: Vec<String>,
    unstaged: Vec<String>,
    untracked: Vec<String>,
    stashes: Vec<Stash>,
    merged: BTreeSet<String>,
    rebase_conflicts: Vec<String>,
    failures: HashSet<String>,
    counter: u64,
    calls: Vec<String>,
}

impl RepoState {
    fn record(&mut self, call: &str) -> Result<()> {
        self.calls.push(call.to_string());
        if self.failures.contains(call) {
            bail!("injected failure: {call}");
        }
        Ok(())
    }

    fn next_hash(&mut self) -> String {
        self.counter += 1;
        format!("{:07x}", 0xc0ffee + self.counter)
    }

    fn log(&self, branch: &str) -> Result<&Vec<CommitSummary>> {
        self.logs
            .get(branch)
            .ok_or_else(|| anyhow!("branch '{branch}' does not exist"))
    }

    fn log_mut(&mut self, branch: &str) -> Result<&mut Vec<CommitSummary>> {
        self.logs
            .get_mut(branch)
            .ok_or_else(|| anyhow!("branch '{branch}' does not exist"))
    }
}

/// A single-remote repository held in memory
#[derive(Debug)]
pub struct FakeGit {
    state: Mutex<RepoState>,
}

impl Default for FakeGit {
    fn default() -> Self {
        Self::new("main")
    }
}

impl FakeGit {
    /// A repository with one commit on `default_branch`, which is also on the remote
    pub fn new(default_branch: &str) -> Self {
        let mut state = RepoState {
            current: default_branch.to_string(),
            ..RepoState::default()
        };
        let hash = state.next_hash();
        state.logs.insert(
            default_branch.to_string(),
            vec![CommitSummary {
                hash,
                message: "initial commit".to_string(),
            }],
        );
        state.remote.insert(default_branch.to_string());
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RepoState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_unstaged(&self, files: &[&str]) {
        self.lock().unstaged = files.iter().map(|f| f.to_string()).collect();
    }

    pub fn set_staged(&self, files: &[&str]) {
        self.lock().staged = files.iter().map(|f| f.to_string()).collect();
    }

    pub fn set_merged(&self, branch: &str) {
        self.lock().merged.insert(branch.to_string());
    }

    pub fn set_rebase_conflicts(&self, files: &[&str]) {
        self.lock().rebase_conflicts = files.iter().map(|f| f.to_string()).collect();
    }

    /// Make every later call of `operation` fail until cleared
    pub fn fail_on(&self, operation: &str) {
        self.lock().failures.insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn current(&self) -> String {
        self.lock().current.clone()
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.lock().logs.contains_key(branch)
    }

    pub fn on_remote(&self, branch: &str) -> bool {
        self.lock().remote.contains(branch)
    }

    pub fn stash_count(&self) -> usize {
        self.lock().stashes.len()
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.lock();
        !(state.staged.is_empty() && state.unstaged.is_empty() && state.untracked.is_empty())
    }
}

#[async_trait]
impl GitCapability for FakeGit {
    async fn get_current_branch(&self) -> Result<String> {
        let mut state = self.lock();
        state.record("get_current_branch")?;
        Ok(state.current.clone())
    }

    async fn get_status(&self) -> Result<GitStatus> {
        let mut state = self.lock();
        state.record("get_status")?;
        Ok(GitStatus {
            branch: state.current.clone(),
            staged: state.staged.clone(),
            unstaged: state.unstaged.clone(),
            untracked: state.untracked.clone(),
        })
    }

    async fn checkout_branch(&self, branch: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("checkout_branch")?;
        state.log(branch)?;
        state.current = branch.to_string();
        Ok(())
    }

    async fn create_branch(&self, branch: &str, from: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("create_branch")?;
        if state.logs.contains_key(branch) {
            bail!("branch '{branch}' already exists");
        }
        let log = state.log(from)?.clone();
        state.logs.insert(branch.to_string(), log);
        Ok(())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let mut state = self.lock();
        state.record("branch_exists")?;
        Ok(state.logs.contains_key(branch))
    }

    async fn stash_changes(&self, label: &str) -> Result<String> {
        let mut state = self.lock();
        state.record("stash_changes")?;
        if state.staged.is_empty() && state.unstaged.is_empty() && state.untracked.is_empty() {
            bail!("no local changes to save");
        }
        state.counter += 1;
        let stash = Stash {
            reference: format!("stash-{}", state.counter),
            label: label.to_string(),
            staged: std::mem::take(&mut state.staged),
            unstaged: std::mem::take(&mut state.unstaged),
            untracked: std::mem::take(&mut state.untracked),
        };
        let reference = stash.reference.clone();
        state.stashes.push(stash);
        Ok(reference)
    }

    async fn find_stash(&self, label: &str) -> Result<Option<String>> {
        let mut state = self.lock();
        state.record("find_stash")?;
        Ok(state
            .stashes
            .iter()
            .rev()
            .find(|s| s.label == label)
            .map(|s| s.reference.clone()))
    }

    async fn apply_stash(&self, stash_ref: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("apply_stash")?;
        let index = state
            .stashes
            .iter()
            .position(|s| s.reference == stash_ref)
            .ok_or_else(|| anyhow!("no stash {stash_ref}"))?;
        let stash = state.stashes.remove(index);
        state.staged.extend(stash.staged);
        state.unstaged.extend(stash.unstaged);
        state.untracked.extend(stash.untracked);
        Ok(())
    }

    async fn commit(&self, message: &str, staged_only: bool) -> Result<String> {
        let mut state = self.lock();
        state.record("commit")?;
        if staged_only {
            if state.staged.is_empty() {
                bail!("nothing staged for commit");
            }
            state.staged.clear();
        } else {
            if state.staged.is_empty() && state.unstaged.is_empty() && state.untracked.is_empty() {
                bail!("nothing to commit, working tree clean");
            }
            state.staged.clear();
            state.unstaged.clear();
            state.untracked.clear();
        }
        let hash = state.next_hash();
        let current = state.current.clone();
        state.log_mut(&current)?.push(CommitSummary {
            hash: hash.clone(),
            message: message.to_string(),
        });
        Ok(hash)
    }

    async fn push(&self, branch: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("push")?;
        state.log(branch)?;
        state.remote.insert(branch.to_string());
        Ok(())
    }

    async fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        let mut state = self.lock();
        state.record("remote_branch_exists")?;
        Ok(state.remote.contains(branch))
    }

    async fn get_commits_since(&self, reference: &str) -> Result<Vec<CommitSummary>> {
        let mut state = self.lock();
        state.record("get_commits_since")?;
        let current = state.log(&state.current)?;
        let skip = match state.logs.get(reference) {
            Some(base) => current
                .iter()
                .zip(base.iter())
                .take_while(|(a, b)| a.hash == b.hash)
                .count(),
            None => current
                .iter()
                .position(|c| c.hash == reference)
                .map(|i| i + 1)
                .ok_or_else(|| anyhow!("unknown revision {reference}"))?,
        };
        Ok(current[skip..].to_vec())
    }

    async fn is_branch_merged(&self, branch: &str, _into: &str) -> Result<bool> {
        let mut state = self.lock();
        state.record("is_branch_merged")?;
        Ok(state.merged.contains(branch))
    }

    async fn rebase(&self, _onto: &str) -> Result<RebaseOutcome> {
        let mut state = self.lock();
        state.record("rebase")?;
        if state.rebase_conflicts.is_empty() {
            Ok(RebaseOutcome::Clean)
        } else {
            Ok(RebaseOutcome::Conflicts(state.rebase_conflicts.clone()))
        }
    }

    async fn revert_to(&self, target: &str) -> Result<String> {
        let mut state = self.lock();
        state.record("revert_to")?;
        let hash = state.next_hash();
        let current = state.current.clone();
        state.log_mut(&current)?.push(CommitSummary {
            hash: hash.clone(),
            message: format!("Revert to {target}"),
        });
        Ok(hash)
    }

    async fn delete_branch(&self, branch: &str, remote: bool) -> Result<()> {
        let mut state = self.lock();
        state.record("delete_branch")?;
        if state.current == branch {
            bail!("cannot delete the checked-out branch '{branch}'");
        }
        state.logs.remove(branch);
        if remote {
            state.remote.remove(branch);
        }
        Ok(())
    }

    async fn head_commit(&self) -> Result<String> {
        let mut state = self.lock();
        state.record("head_commit")?;
        state
            .log(&state.current)?
            .last()
            .map(|c| c.hash.clone())
            .ok_or_else(|| anyhow!("branch has no commits"))
    }
}

#[derive(Debug)]
struct PlatformState {
    next_number: u64,
    pull_requests: BTreeMap<u64, PullRequest>,
    approved: HashSet<u64>,
    checks_pass: bool,
    checks_delay: Option<Duration>,
    failures: HashSet<String>,
    flaky: HashSet<String>,
    calls: Vec<String>,
}

/// A code-hosting platform held in memory; checks pass unless told otherwise
#[derive(Debug)]
pub struct FakePlatform {
    state: Mutex<PlatformState>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PlatformState {
                next_number: 1,
                pull_requests: BTreeMap::new(),
                approved: HashSet::new(),
                checks_pass: true,
                checks_delay: None,
                failures: HashSet::new(),
                flaky: HashSet::new(),
                calls: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(call.to_string());
        if state.failures.contains(call) || state.flaky.remove(call) {
            bail!("injected failure: {call}");
        }
        Ok(())
    }

    pub fn approve(&self, number: u64) {
        self.lock().approved.insert(number);
    }

    pub fn set_checks_pass(&self, pass: bool) {
        self.lock().checks_pass = pass;
    }

    /// Delay before `wait_for_checks` reports
    pub fn set_checks_delay(&self, delay: Duration) {
        self.lock().checks_delay = Some(delay);
    }

    pub fn fail_on(&self, operation: &str) {
        self.lock().failures.insert(operation.to_string());
    }

    /// Fail only the next call of `operation`
    pub fn fail_once(&self, operation: &str) {
        self.lock().flaky.insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.flaky.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn pull_request(&self, number: u64) -> Option<PullRequest> {
        self.lock().pull_requests.get(&number).cloned()
    }
}

#[async_trait]
impl PlatformCapability for FakePlatform {
    async fn create_pull_request(&self, request: &PullRequestRequest) -> Result<PullRequest> {
        self.record("create_pull_request")?;
        let mut state = self.lock();
        let number = state.next_number;
        state.next_number += 1;
        let pr = PullRequest {
            number,
            url: format!("https://forge.example/pulls/{number}"),
            head: request.head.clone(),
            base: request.base.clone(),
            state: PullRequestState::Open,
        };
        state.pull_requests.insert(number, pr.clone());
        Ok(pr)
    }

    async fn get_pull_request(&self, number: u64) -> Result<PullRequest> {
        self.record("get_pull_request")?;
        self.lock()
            .pull_requests
            .get(&number)
            .cloned()
            .ok_or_else(|| anyhow!("pull request #{number} not found"))
    }

    async fn merge_pull_request(&self, number: u64, _method: MergeMethod) -> Result<String> {
        self.record("merge_pull_request")?;
        let mut state = self.lock();
        let pr = state
            .pull_requests
            .get_mut(&number)
            .ok_or_else(|| anyhow!("pull request #{number} not found"))?;
        if pr.state != PullRequestState::Open {
            bail!("pull request #{number} is not open");
        }
        pr.state = PullRequestState::Merged;
        Ok(format!("{:07x}", 0xbeef00 + number))
    }

    async fn check_pr_approval(&self, number: u64) -> Result<bool> {
        self.record("check_pr_approval")?;
        Ok(self.lock().approved.contains(&number))
    }

    async fn wait_for_checks(&self, _number: u64, _timeout: Duration) -> Result<bool> {
        self.record("wait_for_checks")?;
        let (delay, pass) = {
            let state = self.lock();
            (state.checks_delay, state.checks_pass)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(pass)
    }
}
