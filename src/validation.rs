// Pre-flight and post-flight checks
//
// Pre-flight turns "is it safe to proceed" into a PreFlightReport: named
// checks, a Decision, and when a warning fires a ranked set of
// CheckOptions with exactly one recommended default. Post-flight confirms
// that an external effect produced what was expected.

use chrono::Duration;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use crate::capabilities::GitStatus;
use crate::config::ValidationConfig;
use crate::session::Session;

pub const SEVERITIES: [&str; 4] = ["critical", "high", "medium", "low"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Launch,
    Commit,
    Ship,
    Swap,
    Abort,
    HotfixStart,
    HotfixDeploy,
    HotfixRollback,
    Cleanup,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Launch => "launch",
            Operation::Commit => "commit",
            Operation::Ship => "ship",
            Operation::Swap => "swap",
            Operation::Abort => "abort",
            Operation::HotfixStart => "hotfix_start",
            Operation::HotfixDeploy => "hotfix_deploy",
            Operation::HotfixRollback => "hotfix_rollback",
            Operation::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckSeverity {
    /// Failure prevents the transition attempt
    Blocking,
    /// Failure asks the caller to choose how to continue
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub severity: CheckSeverity,
}

impl CheckResult {
    pub fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
            severity: CheckSeverity::Info,
        }
    }

    pub fn fail(name: &str, message: impl Into<String>, severity: CheckSeverity) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
            severity,
        }
    }

    fn check(name: &str, passed: bool, ok: &str, failed: String, severity: CheckSeverity) -> Self {
        if passed {
            Self::pass(name, ok)
        } else {
            Self::fail(name, failed, severity)
        }
    }

    pub fn is_blocking_failure(&self) -> bool {
        !self.passed && self.severity == CheckSeverity::Blocking
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

/// What the orchestrator does when an option is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionAction {
    /// Stash uncommitted work under a label, then continue
    StashAndContinue,
    /// Continue and carry uncommitted work along
    Continue,
    /// Stop without changing anything
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOption {
    pub id: String,
    pub label: String,
    pub description: String,
    pub action: OptionAction,
    pub auto_recommended: bool,
    pub risk: Risk,
}

impl CheckOption {
    fn new(id: &str, label: &str, description: &str, action: OptionAction, risk: Risk) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            description: description.to_string(),
            action,
            auto_recommended: false,
            risk,
        }
    }

    fn recommended(mut self) -> Self {
        self.auto_recommended = true;
        self
    }
}

/// Dedupe by id and leave exactly one recommended option.
///
/// The first option already marked wins; without one, the lowest-risk option
/// (earliest on ties) is chosen.
pub fn normalize_options(options: Vec<CheckOption>) -> Vec<CheckOption> {
    let mut unique: Vec<CheckOption> = Vec::with_capacity(options.len());
    for option in options {
        if !unique.iter().any(|o| o.id == option.id) {
            unique.push(option);
        }
    }
    if unique.is_empty() {
        return unique;
    }
    let chosen = unique
        .iter()
        .position(|o| o.auto_recommended)
        .or_else(|| {
            unique
                .iter()
                .enumerate()
                .min_by_key(|(i, o)| (o.risk, *i))
                .map(|(i, _)| i)
        })
        .unwrap_or(0);
    for (i, option) in unique.iter_mut().enumerate() {
        option.auto_recommended = i == chosen;
    }
    unique
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Proceed,
    ProceedWithWarning,
    NeedsDecision,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreFlightReport {
    pub operation: Operation,
    pub checks: Vec<CheckResult>,
    pub options: Vec<CheckOption>,
}

impl PreFlightReport {
    pub fn decision(&self) -> Decision {
        if self.checks.iter().any(CheckResult::is_blocking_failure) {
            Decision::Blocked
        } else if !self.options.is_empty() {
            Decision::NeedsDecision
        } else if self.checks.iter().any(|c| !c.passed) {
            Decision::ProceedWithWarning
        } else {
            Decision::Proceed
        }
    }

    pub fn failed(&self) -> Vec<CheckResult> {
        self.checks.iter().filter(|c| !c.passed).cloned().collect()
    }

    pub fn recommended(&self) -> Option<&CheckOption> {
        self.options.iter().find(|o| o.auto_recommended)
    }

    pub fn option(&self, id: &str) -> Option<&CheckOption> {
        self.options.iter().find(|o| o.id == id)
    }
}

/// Facts gathered before an operation
#[derive(Debug, Clone, Default)]
pub struct PreFlightContext {
    /// Branch the operation acts on
    pub branch: String,
    pub current_branch: Option<String>,
    pub status: Option<GitStatus>,
    /// Active session already tracking `branch`, for operations that start one
    pub existing_session: Option<String>,
    pub commit_message: Option<String>,
    pub staged_only: bool,
    pub severity: Option<String>,
}

/// Facts observed after an external effect. Only facts that are set get checked.
#[derive(Debug, Clone, Default)]
pub struct PostFlightContext {
    pub expected_branch: Option<String>,
    pub current_branch: Option<String>,
    pub expected_commit: Option<String>,
    pub head_commit: Option<String>,
    pub remote_branch_exists: Option<bool>,
    pub pr_number: Option<u64>,
    pub merge_commit: Option<String>,
    pub deleted_branch_exists: Option<bool>,
    pub stash_restored: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ValidationService {
    protected: Vec<Regex>,
    protected_patterns: Vec<String>,
    session_ttl: Duration,
}

impl ValidationService {
    pub fn new(config: &ValidationConfig, session_ttl: Duration) -> anyhow::Result<Self> {
        let protected = config
            .protected_branches
            .iter()
            .map(|pattern| glob_to_regex(pattern))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            protected,
            protected_patterns: config.protected_branches.clone(),
            session_ttl,
        })
    }

    pub fn protected_patterns(&self) -> &[String] {
        &self.protected_patterns
    }

    pub fn is_protected(&self, branch: &str) -> bool {
        self.protected.iter().any(|re| re.is_match(branch))
    }

    pub fn pre_flight_check(
        &self,
        operation: Operation,
        session: Option<&Session>,
        context: &PreFlightContext,
    ) -> PreFlightReport {
        let mut checks = Vec::new();
        let mut options = Vec::new();

        match operation {
            Operation::Launch => {
                checks.push(self.branch_name_valid(&context.branch));
                checks.push(self.branch_not_protected(&context.branch));
                checks.push(self.no_active_session(context));
                self.clean_tree_or_options(context, &mut checks, &mut options, "Switching branches");
            }
            Operation::Commit => {
                checks.push(self.session_resumable(session));
                checks.push(self.branch_not_protected(&context.branch));
                checks.push(self.on_session_branch(context));
                checks.push(self.has_changes(context));
                checks.push(self.commit_message_present(context));
            }
            Operation::Ship => {
                checks.push(self.branch_name_valid(&context.branch));
                checks.push(self.branch_not_protected(&context.branch));
                if session.is_some() {
                    checks.push(self.session_resumable(session));
                }
                checks.push(self.on_session_branch(context));
                if let Some(status) = &context.status {
                    checks.push(CheckResult::check(
                        "uncommitted_changes",
                        status.is_clean(),
                        "working tree clean",
                        format!("{} uncommitted file(s) will not be part of the push", status.changed_files()),
                        CheckSeverity::Info,
                    ));
                }
            }
            Operation::Swap => {
                checks.push(self.branch_name_valid(&context.branch));
                checks.push(self.swap_target_differs(context));
                self.clean_tree_or_options(context, &mut checks, &mut options, "Swapping branches");
            }
            Operation::Abort => {
                checks.push(self.session_active(session));
                if let Some(status) = &context.status {
                    let passed = status.is_clean();
                    checks.push(CheckResult::check(
                        "uncommitted_changes_before_abort",
                        passed,
                        "no uncommitted work to lose",
                        format!("{} uncommitted file(s) would be lost", status.changed_files()),
                        CheckSeverity::Warning,
                    ));
                    if !passed {
                        options.push(
                            CheckOption::new(
                                "stash_and_abort",
                                "Stash and abort",
                                "Save uncommitted work in a labelled stash, then abort",
                                OptionAction::StashAndContinue,
                                Risk::Low,
                            )
                            .recommended(),
                        );
                        options.push(CheckOption::new(
                            "cancel",
                            "Keep working",
                            "Leave the session and working tree as they are",
                            OptionAction::Cancel,
                            Risk::Low,
                        ));
                    }
                }
            }
            Operation::HotfixStart => {
                checks.push(self.branch_name_valid(&context.branch));
                checks.push(self.no_active_session(context));
                checks.push(self.severity_declared(context.severity.as_deref()));
                self.clean_tree_or_options(context, &mut checks, &mut options, "Starting a hotfix");
            }
            Operation::HotfixDeploy => {
                checks.push(self.session_resumable(session));
                checks.push(self.on_session_branch(context));
                checks.push(self.severity_declared(session.and_then(|s| s.metadata.severity())));
            }
            Operation::HotfixRollback => {
                checks.push(self.session_resumable(session));
                checks.push(self.on_session_branch(context));
                let target = session.and_then(|s| s.metadata.rollback_target());
                checks.push(CheckResult::check(
                    "rollback_target_recorded",
                    target.is_some(),
                    "rollback target known",
                    "no rollback target recorded for this hotfix".to_string(),
                    CheckSeverity::Blocking,
                ));
            }
            Operation::Cleanup => {}
        }

        let report = PreFlightReport {
            operation,
            checks,
            options: normalize_options(options),
        };
        debug!(
            operation = %operation,
            branch = %context.branch,
            decision = ?report.decision(),
            failed = report.failed().len(),
            "Pre-flight complete"
        );
        report
    }

    pub fn post_flight_verify(
        &self,
        operation: Operation,
        session: &Session,
        context: &PostFlightContext,
    ) -> Vec<CheckResult> {
        let checks = self.verify_branch_facts(operation, &session.branch_name, context);
        let failed = checks.iter().filter(|c| !c.passed).count();
        if failed > 0 {
            warn!(operation = %operation, session_id = %session.id, failed, "Post-flight verification failed");
        }
        checks
    }

    /// Post-flight for an effect on `branch` that no session tracks
    pub fn verify_branch_facts(
        &self,
        operation: Operation,
        branch: &str,
        context: &PostFlightContext,
    ) -> Vec<CheckResult> {
        let mut checks = Vec::new();
        let blocking = CheckSeverity::Blocking;

        if let Some(current) = &context.current_branch {
            let expected = context.expected_branch.as_deref().unwrap_or(branch);
            checks.push(CheckResult::check(
                "branch_checked_out",
                current == expected,
                "expected branch checked out",
                format!("expected '{expected}' checked out, found '{current}'"),
                blocking,
            ));
        }
        if let Some(expected) = &context.expected_commit {
            let head = context.head_commit.as_deref().unwrap_or("<none>");
            checks.push(CheckResult::check(
                "commit_recorded",
                head == expected,
                "commit is at HEAD",
                format!("expected HEAD {expected}, found {head}"),
                blocking,
            ));
        }
        if let Some(exists) = context.remote_branch_exists {
            checks.push(CheckResult::check(
                "branch_exists_remotely",
                exists,
                "branch present on remote",
                format!("'{branch}' is missing on the remote after push"),
                blocking,
            ));
        }
        if let Some(number) = context.pr_number {
            checks.push(CheckResult::check(
                "pr_number_set",
                number > 0,
                "pull request number recorded",
                "platform returned no pull request number".to_string(),
                blocking,
            ));
        }
        if let Some(merge) = &context.merge_commit {
            checks.push(CheckResult::check(
                "merge_commit_recorded",
                !merge.trim().is_empty(),
                "merge commit recorded",
                "merge returned no commit".to_string(),
                blocking,
            ));
        }
        if let Some(exists) = context.deleted_branch_exists {
            checks.push(CheckResult::check(
                "branch_deleted",
                !exists,
                "branch removed",
                format!("'{branch}' still exists after deletion"),
                blocking,
            ));
        }
        if let Some(restored) = context.stash_restored {
            checks.push(CheckResult::check(
                "stash_restored",
                restored,
                "stashed work restored",
                "stashed work for this branch was not restored".to_string(),
                CheckSeverity::Warning,
            ));
        }

        debug!(operation = %operation, %branch, checks = checks.len(), "Post-flight facts checked");
        checks
    }

    fn branch_name_valid(&self, branch: &str) -> CheckResult {
        match branch_name_problem(branch) {
            None => CheckResult::pass("branch_name_valid", "branch name is valid"),
            Some(problem) => CheckResult::fail(
                "branch_name_valid",
                format!("'{branch}' is not a valid branch name: {problem}"),
                CheckSeverity::Blocking,
            ),
        }
    }

    fn branch_not_protected(&self, branch: &str) -> CheckResult {
        CheckResult::check(
            "branch_not_protected",
            !self.is_protected(branch),
            "branch is not protected",
            format!("'{branch}' is a protected branch"),
            CheckSeverity::Blocking,
        )
    }

    fn no_active_session(&self, context: &PreFlightContext) -> CheckResult {
        CheckResult::check(
            "no_active_session",
            context.existing_session.is_none(),
            "no other session tracks this branch",
            format!(
                "branch '{}' already has active session {}",
                context.branch,
                context.existing_session.as_deref().unwrap_or_default()
            ),
            CheckSeverity::Blocking,
        )
    }

    fn session_active(&self, session: Option<&Session>) -> CheckResult {
        match session {
            Some(s) if s.is_active() => CheckResult::pass("session_active", "session is active"),
            Some(s) => CheckResult::fail(
                "session_active",
                format!("session is already {}", s.current_state),
                CheckSeverity::Blocking,
            ),
            None => CheckResult::fail("session_active", "no session for this branch", CheckSeverity::Blocking),
        }
    }

    fn session_resumable(&self, session: Option<&Session>) -> CheckResult {
        match session {
            Some(s) if s.can_resume(self.session_ttl) => {
                CheckResult::pass("session_resumable", "session can be resumed")
            }
            Some(s) if s.is_active() => CheckResult::fail(
                "session_resumable",
                format!("session expired after {} days", s.age().num_days()),
                CheckSeverity::Blocking,
            ),
            Some(s) => CheckResult::fail(
                "session_resumable",
                format!("session already finished in {}", s.current_state),
                CheckSeverity::Blocking,
            ),
            None => CheckResult::fail("session_resumable", "no session for this branch", CheckSeverity::Blocking),
        }
    }

    fn on_session_branch(&self, context: &PreFlightContext) -> CheckResult {
        match &context.current_branch {
            Some(current) => CheckResult::check(
                "on_session_branch",
                *current == context.branch,
                "on the session branch",
                format!("checked out '{current}', expected '{}'", context.branch),
                CheckSeverity::Blocking,
            ),
            None => CheckResult::fail(
                "on_session_branch",
                "current branch unknown",
                CheckSeverity::Blocking,
            ),
        }
    }

    fn has_changes(&self, context: &PreFlightContext) -> CheckResult {
        let Some(status) = &context.status else {
            return CheckResult::fail("has_changes", "working tree status unknown", CheckSeverity::Blocking);
        };
        let passed = if context.staged_only {
            status.has_staged()
        } else {
            !status.is_clean()
        };
        CheckResult::check(
            "has_changes",
            passed,
            "changes ready to commit",
            if context.staged_only {
                "nothing staged for commit".to_string()
            } else {
                "nothing to commit".to_string()
            },
            CheckSeverity::Blocking,
        )
    }

    fn commit_message_present(&self, context: &PreFlightContext) -> CheckResult {
        let present = context
            .commit_message
            .as_deref()
            .is_some_and(|m| !m.trim().is_empty());
        CheckResult::check(
            "commit_message_present",
            present,
            "commit message provided",
            "a commit message is required".to_string(),
            CheckSeverity::Blocking,
        )
    }

    fn swap_target_differs(&self, context: &PreFlightContext) -> CheckResult {
        let same = context.current_branch.as_deref() == Some(context.branch.as_str());
        CheckResult::check(
            "swap_target_differs",
            !same,
            "target differs from current branch",
            format!("already on '{}'", context.branch),
            CheckSeverity::Blocking,
        )
    }

    fn severity_declared(&self, severity: Option<&str>) -> CheckResult {
        match severity {
            Some(s) if SEVERITIES.iter().any(|known| known.eq_ignore_ascii_case(s)) => {
                CheckResult::pass("hotfix_severity_declared", format!("severity {s}"))
            }
            Some(s) => CheckResult::fail(
                "hotfix_severity_declared",
                format!("unknown severity '{s}' (expected one of {})", SEVERITIES.join(", ")),
                CheckSeverity::Blocking,
            ),
            None => CheckResult::fail(
                "hotfix_severity_declared",
                "hotfix severity must be declared",
                CheckSeverity::Blocking,
            ),
        }
    }

    fn clean_tree_or_options(
        &self,
        context: &PreFlightContext,
        checks: &mut Vec<CheckResult>,
        options: &mut Vec<CheckOption>,
        doing: &str,
    ) {
        let Some(status) = &context.status else {
            return;
        };
        if status.is_clean() {
            checks.push(CheckResult::pass("clean_working_tree", "working tree clean"));
            return;
        }
        checks.push(CheckResult::fail(
            "clean_working_tree",
            format!("{} uncommitted file(s) on '{}'", status.changed_files(), status.branch),
            CheckSeverity::Warning,
        ));
        options.push(
            CheckOption::new(
                "stash_and_continue",
                "Stash and continue",
                &format!("{doing} after saving uncommitted work in a stash labelled with '{}'", status.branch),
                OptionAction::StashAndContinue,
                Risk::Low,
            )
            .recommended(),
        );
        options.push(CheckOption::new(
            "carry_changes",
            "Bring changes along",
            &format!("{doing} with the uncommitted work left in the working tree"),
            OptionAction::Continue,
            Risk::Medium,
        ));
        options.push(CheckOption::new(
            "cancel",
            "Cancel",
            "Stop without touching the working tree",
            OptionAction::Cancel,
            Risk::Low,
        ));
    }
}

/// Translate a branch glob into an anchored regex. `*` stays within one path
/// segment, `**` crosses segments.
pub fn glob_to_regex(pattern: &str) -> anyhow::Result<Regex> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Ok(Regex::new(&out)?)
}

fn branch_name_problem(branch: &str) -> Option<&'static str> {
    if branch.trim().is_empty() {
        return Some("empty");
    }
    if branch == "@" {
        return Some("'@' is reserved");
    }
    if branch.starts_with('-') || branch.starts_with('/') || branch.ends_with('/') {
        return Some("cannot start with '-' or start/end with '/'");
    }
    if branch.ends_with(".lock") || branch.ends_with('.') {
        return Some("cannot end with '.lock' or '.'");
    }
    if branch.contains("..") || branch.contains("//") || branch.contains("@{") {
        return Some("contains '..', '//' or '@{'");
    }
    if branch
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
    {
        return Some("contains whitespace or one of ~^:?*[\\");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::workflows::launch_workflow;

    fn service() -> ValidationService {
        let config = ValidationConfig {
            protected_branches: vec!["main".into(), "release/*".into()],
            ..ValidationConfig::default()
        };
        ValidationService::new(&config, Duration::days(30)).unwrap()
    }

    fn dirty(branch: &str) -> GitStatus {
        GitStatus {
            branch: branch.to_string(),
            unstaged: vec!["src/lib.rs".to_string()],
            ..GitStatus::default()
        }
    }

    #[test]
    fn test_protected_globs() {
        let service = service();
        assert!(service.is_protected("main"));
        assert!(service.is_protected("release/1.2"));
        assert!(!service.is_protected("release/1.2/hotfix"));
        assert!(!service.is_protected("feature/main"));
    }

    #[test]
    fn test_branch_name_rules() {
        assert!(branch_name_problem("feature/x").is_none());
        assert!(branch_name_problem("feature x").is_some());
        assert!(branch_name_problem("a..b").is_some());
        assert!(branch_name_problem("topic.lock").is_some());
        assert!(branch_name_problem("").is_some());
    }

    #[test]
    fn test_launch_on_protected_branch_is_blocked() {
        let report = service().pre_flight_check(
            Operation::Launch,
            None,
            &PreFlightContext {
                branch: "main".into(),
                ..PreFlightContext::default()
            },
        );
        assert_eq!(report.decision(), Decision::Blocked);
        assert!(report.failed().iter().any(|c| c.name == "branch_not_protected"));
    }

    #[test]
    fn test_dirty_tree_yields_one_recommended_option() {
        let report = service().pre_flight_check(
            Operation::Swap,
            None,
            &PreFlightContext {
                branch: "feature/y".into(),
                current_branch: Some("feature/x".into()),
                status: Some(dirty("feature/x")),
                ..PreFlightContext::default()
            },
        );
        assert_eq!(report.decision(), Decision::NeedsDecision);
        assert_eq!(report.options.iter().filter(|o| o.auto_recommended).count(), 1);
        assert_eq!(report.recommended().unwrap().action, OptionAction::StashAndContinue);
    }

    #[test]
    fn test_normalize_picks_lowest_risk_when_none_recommended() {
        let options = vec![
            CheckOption::new("a", "A", "", OptionAction::Continue, Risk::High),
            CheckOption::new("b", "B", "", OptionAction::Cancel, Risk::Low),
            CheckOption::new("b", "B again", "", OptionAction::Cancel, Risk::Low),
        ];
        let normalized = normalize_options(options);
        assert_eq!(normalized.len(), 2);
        assert!(normalized[1].auto_recommended);
        assert!(!normalized[0].auto_recommended);
    }

    #[test]
    fn test_normalize_keeps_first_of_many_recommended() {
        let options = vec![
            CheckOption::new("a", "A", "", OptionAction::Continue, Risk::High).recommended(),
            CheckOption::new("b", "B", "", OptionAction::Cancel, Risk::Low).recommended(),
        ];
        let normalized = normalize_options(options);
        assert!(normalized[0].auto_recommended);
        assert!(!normalized[1].auto_recommended);
    }

    #[test]
    fn test_commit_without_changes_is_blocked() {
        let machine = launch_workflow().unwrap();
        let session = Session::new(&machine, "feature/x", "main");
        let report = service().pre_flight_check(
            Operation::Commit,
            Some(&session),
            &PreFlightContext {
                branch: "feature/x".into(),
                current_branch: Some("feature/x".into()),
                status: Some(GitStatus {
                    branch: "feature/x".into(),
                    ..GitStatus::default()
                }),
                commit_message: Some("feat: x".into()),
                ..PreFlightContext::default()
            },
        );
        assert_eq!(report.decision(), Decision::Blocked);
        assert_eq!(report.failed()[0].name, "has_changes");
    }

    #[test]
    fn test_post_flight_reports_missing_remote_branch() {
        let machine = launch_workflow().unwrap();
        let session = Session::new(&machine, "feature/x", "main");
        let checks = service().post_flight_verify(
            Operation::Ship,
            &session,
            &PostFlightContext {
                remote_branch_exists: Some(false),
                pr_number: Some(12),
                ..PostFlightContext::default()
            },
        );
        assert_eq!(checks.len(), 2);
        assert!(!checks[0].passed);
        assert!(checks[1].passed);
    }
}
