// Named, introspectable validation rules.
//
// A rule declares the context fields it needs up front, so a caller can ask a
// state which facts must be gathered before attempting entry, and only then
// evaluate it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Facts gathered about the outside world, keyed by field name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationContext {
    fields: BTreeMap<String, Value>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// Present means set, not null, and not an empty string
    pub fn is_present(&self, field: &str) -> bool {
        match self.get(field) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        }
    }

    pub fn merge(&mut self, other: &ValidationContext) {
        for (field, value) in &other.fields {
            self.fields.insert(field.clone(), value.clone());
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// What a rule checks once its required fields are present
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RuleKind {
    /// Only the required fields have to be present
    FieldsPresent,
    /// A boolean field must hold the expected value
    FieldIs { field: &'static str, expected: bool },
    /// Review approval and CI success, bypassable with a warning for critical severity
    HotfixGate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationRule {
    pub name: &'static str,
    pub description: &'static str,
    pub required_fields: Vec<&'static str>,
    pub kind: RuleKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOutcome {
    Pass,
    PassWithWarning(String),
    Fail(String),
}

impl RuleOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RuleOutcome::Fail(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleReport {
    pub rule: &'static str,
    pub outcome: RuleOutcome,
}

pub const CRITICAL_SEVERITY: &str = "critical";

impl ValidationRule {
    pub fn new(
        name: &'static str,
        description: &'static str,
        required_fields: &[&'static str],
        kind: RuleKind,
    ) -> Self {
        Self {
            name,
            description,
            required_fields: required_fields.to_vec(),
            kind,
        }
    }

    pub fn evaluate(&self, context: &ValidationContext) -> RuleOutcome {
        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .copied()
            .filter(|field| !context.is_present(field))
            .collect();
        if !missing.is_empty() {
            return RuleOutcome::Fail(format!(
                "{}: missing required field(s) {}",
                self.name,
                missing.join(", ")
            ));
        }

        match &self.kind {
            RuleKind::FieldsPresent => RuleOutcome::Pass,
            RuleKind::FieldIs { field, expected } => match context.get_bool(field) {
                Some(actual) if actual == *expected => RuleOutcome::Pass,
                Some(actual) => RuleOutcome::Fail(format!(
                    "{}: expected {field} to be {expected}, got {actual}",
                    self.name
                )),
                None => RuleOutcome::Fail(format!("{}: {field} is not a boolean", self.name)),
            },
            RuleKind::HotfixGate => evaluate_hotfix_gate(context),
        }
    }
}

fn evaluate_hotfix_gate(context: &ValidationContext) -> RuleOutcome {
    let severity = context.get_str("severity").unwrap_or_default();
    let mut gaps = Vec::new();
    match context.get_bool("review_approved") {
        Some(true) => {}
        Some(false) => gaps.push("review approval missing"),
        None => gaps.push("review status unavailable"),
    }
    match context.get_bool("ci_passed") {
        Some(true) => {}
        Some(false) => gaps.push("CI checks not passing"),
        None => gaps.push("CI status unavailable"),
    }

    if gaps.is_empty() {
        RuleOutcome::Pass
    } else if severity.eq_ignore_ascii_case(CRITICAL_SEVERITY) {
        RuleOutcome::PassWithWarning(format!(
            "critical hotfix proceeding despite: {}",
            gaps.join("; ")
        ))
    } else {
        RuleOutcome::Fail(format!(
            "severity_gate: {severity} hotfix requires review approval and passing CI ({})",
            gaps.join("; ")
        ))
    }
}

// Shared rule constructors used by the workflow tables

pub fn branch_not_protected() -> ValidationRule {
    ValidationRule::new(
        "branch_not_protected",
        "work never happens directly on a protected branch",
        &["branch_name", "protected_branch"],
        RuleKind::FieldIs {
            field: "protected_branch",
            expected: false,
        },
    )
}

pub fn commit_recorded() -> ValidationRule {
    ValidationRule::new(
        "commit_recorded",
        "a commit hash was produced",
        &["commit_hash"],
        RuleKind::FieldsPresent,
    )
}

pub fn branch_pushed() -> ValidationRule {
    ValidationRule::new(
        "branch_pushed",
        "the branch exists on the remote",
        &["remote_branch_exists"],
        RuleKind::FieldIs {
            field: "remote_branch_exists",
            expected: true,
        },
    )
}

pub fn pull_request_open() -> ValidationRule {
    ValidationRule::new(
        "pull_request_open",
        "a pull request number is known",
        &["pr_number"],
        RuleKind::FieldsPresent,
    )
}

pub fn review_approved() -> ValidationRule {
    ValidationRule::new(
        "review_approved",
        "the pull request carries an approving review",
        &["review_approved"],
        RuleKind::FieldIs {
            field: "review_approved",
            expected: true,
        },
    )
}

pub fn checks_passed() -> ValidationRule {
    ValidationRule::new(
        "checks_passed",
        "CI checks on the pull request succeeded",
        &["ci_passed"],
        RuleKind::FieldIs {
            field: "ci_passed",
            expected: true,
        },
    )
}

pub fn merge_recorded() -> ValidationRule {
    ValidationRule::new(
        "merge_recorded",
        "the merge produced a commit on the base branch",
        &["merge_commit"],
        RuleKind::FieldsPresent,
    )
}

pub fn branch_merged() -> ValidationRule {
    ValidationRule::new(
        "branch_merged",
        "the branch has been merged into its base",
        &["branch_merged"],
        RuleKind::FieldIs {
            field: "branch_merged",
            expected: true,
        },
    )
}

pub fn rollback_target_recorded() -> ValidationRule {
    ValidationRule::new(
        "rollback_target_recorded",
        "a known-good commit to roll back to exists",
        &["rollback_target"],
        RuleKind::FieldsPresent,
    )
}

pub fn severity_gate() -> ValidationRule {
    ValidationRule::new(
        "severity_gate",
        "non-critical hotfixes need review approval and passing CI",
        &["severity", "pr_number"],
        RuleKind::HotfixGate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_required_field_fails_before_kind_check() {
        let rule = commit_recorded();
        let outcome = rule.evaluate(&ValidationContext::new().with("commit_hash", ""));
        assert!(outcome.is_failure());

        let outcome = rule.evaluate(&ValidationContext::new().with("commit_hash", "abc123"));
        assert_eq!(outcome, RuleOutcome::Pass);
    }

    #[test]
    fn test_field_is_rule_compares_booleans() {
        let rule = branch_not_protected();
        let ok = ValidationContext::new()
            .with("branch_name", "feature/x")
            .with("protected_branch", false);
        assert_eq!(rule.evaluate(&ok), RuleOutcome::Pass);

        let protected = ok.clone().with("protected_branch", true);
        assert!(rule.evaluate(&protected).is_failure());
    }

    #[test]
    fn test_hotfix_gate_by_severity() {
        let rule = severity_gate();
        let unapproved = ValidationContext::new()
            .with("pr_number", 7)
            .with("review_approved", false)
            .with("ci_passed", true);

        let low = unapproved.clone().with("severity", "low");
        assert!(rule.evaluate(&low).is_failure());

        let critical = unapproved.with("severity", "critical");
        assert!(matches!(
            rule.evaluate(&critical),
            RuleOutcome::PassWithWarning(_)
        ));

        let approved = ValidationContext::new()
            .with("pr_number", 7)
            .with("severity", "low")
            .with("review_approved", true)
            .with("ci_passed", true);
        assert_eq!(rule.evaluate(&approved), RuleOutcome::Pass);
    }

    #[test]
    fn test_rules_are_introspectable() {
        let rule = severity_gate();
        assert_eq!(rule.required_fields, vec!["severity", "pr_number"]);
        assert_eq!(rule.kind, RuleKind::HotfixGate);
    }
}
