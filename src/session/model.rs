use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::workflows::{
    Action, StateMachine, TransitionFailure, TransitionResult, ValidationContext, WorkflowState,
    WorkflowType,
};

pub const DEFAULT_SESSION_TTL_DAYS: i64 = 30;

/// Fields only one workflow carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkflowMetadata {
    Launch,
    Ship {
        #[serde(default)]
        approvals: u32,
        #[serde(default)]
        ci_passed: Option<bool>,
        #[serde(default)]
        merge_commit: Option<String>,
        #[serde(default)]
        rebase_conflicts: Vec<String>,
    },
    Hotfix {
        severity: String,
        #[serde(default)]
        rollback_target: Option<String>,
        #[serde(default)]
        deployed_commit: Option<String>,
        #[serde(default)]
        gate_warnings: Vec<String>,
    },
}

impl WorkflowMetadata {
    pub fn for_workflow(workflow: WorkflowType) -> Self {
        match workflow {
            WorkflowType::Launch => WorkflowMetadata::Launch,
            WorkflowType::Ship => WorkflowMetadata::Ship {
                approvals: 0,
                ci_passed: None,
                merge_commit: None,
                rebase_conflicts: Vec::new(),
            },
            WorkflowType::Hotfix => WorkflowMetadata::Hotfix {
                severity: String::new(),
                rollback_target: None,
                deployed_commit: None,
                gate_warnings: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub stash_ref: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub post_flight_failures: Vec<String>,
    pub workflow: WorkflowMetadata,
    /// Open-ended platform data
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl SessionMetadata {
    pub fn new(workflow: WorkflowType) -> Self {
        Self {
            pr_number: None,
            pr_url: None,
            commit_hash: None,
            stash_ref: None,
            last_error: None,
            post_flight_failures: Vec::new(),
            workflow: WorkflowMetadata::for_workflow(workflow),
            extra: BTreeMap::new(),
        }
    }

    pub fn severity(&self) -> Option<&str> {
        match &self.workflow {
            WorkflowMetadata::Hotfix { severity, .. } if !severity.is_empty() => Some(severity),
            _ => None,
        }
    }

    pub fn rollback_target(&self) -> Option<&str> {
        match &self.workflow {
            WorkflowMetadata::Hotfix {
                rollback_target, ..
            } => rollback_target.as_deref(),
            _ => None,
        }
    }

    pub fn merge_commit(&self) -> Option<&str> {
        match &self.workflow {
            WorkflowMetadata::Ship { merge_commit, .. } => merge_commit.as_deref(),
            WorkflowMetadata::Hotfix {
                deployed_commit, ..
            } => deployed_commit.as_deref(),
            WorkflowMetadata::Launch => None,
        }
    }

    fn apply(&mut self, update: &MetadataUpdate) {
        match (update, &mut self.workflow) {
            (MetadataUpdate::PrNumber(n), _) => self.pr_number = Some(*n),
            (MetadataUpdate::PrUrl(url), _) => self.pr_url = Some(url.clone()),
            (MetadataUpdate::CommitHash(hash), _) => self.commit_hash = Some(hash.clone()),
            (MetadataUpdate::StashRef(stash), _) => self.stash_ref = stash.clone(),
            (MetadataUpdate::ClearError, _) => {
                self.last_error = None;
                self.post_flight_failures.clear();
            }
            (MetadataUpdate::Approvals(n), WorkflowMetadata::Ship { approvals, .. }) => {
                *approvals = *n
            }
            (MetadataUpdate::CiPassed(passed), WorkflowMetadata::Ship { ci_passed, .. }) => {
                *ci_passed = Some(*passed)
            }
            (MetadataUpdate::MergeCommit(hash), WorkflowMetadata::Ship { merge_commit, .. }) => {
                *merge_commit = Some(hash.clone())
            }
            (MetadataUpdate::MergeCommit(hash), WorkflowMetadata::Hotfix { deployed_commit, .. }) => {
                *deployed_commit = Some(hash.clone())
            }
            (
                MetadataUpdate::RebaseConflicts(files),
                WorkflowMetadata::Ship {
                    rebase_conflicts, ..
                },
            ) => *rebase_conflicts = files.clone(),
            (
                MetadataUpdate::RollbackTarget(target),
                WorkflowMetadata::Hotfix {
                    rollback_target, ..
                },
            ) => *rollback_target = Some(target.clone()),
            (MetadataUpdate::Severity(level), WorkflowMetadata::Hotfix { severity, .. }) => {
                *severity = level.to_ascii_lowercase()
            }
            (MetadataUpdate::GateWarning(msg), WorkflowMetadata::Hotfix { gate_warnings, .. }) => {
                gate_warnings.push(msg.clone())
            }
            (MetadataUpdate::Extra(key, value), _) => {
                self.extra.insert(key.clone(), value.clone());
            }
            (other, _) => {
                // Field does not exist on this workflow, stored under extra
                if let Ok(Value::Object(map)) = serde_json::to_value(other) {
                    if let (Some(Value::String(field)), Some(value)) = (map.get("field"), map.get("value")) {
                        self.extra.insert(field.clone(), value.clone());
                    }
                }
            }
        }
    }
}

/// A single metadata change carried by a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum MetadataUpdate {
    PrNumber(u64),
    PrUrl(String),
    CommitHash(String),
    StashRef(Option<String>),
    ClearError,
    Approvals(u32),
    CiPassed(bool),
    MergeCommit(String),
    RebaseConflicts(Vec<String>),
    RollbackTarget(String),
    Severity(String),
    GateWarning(String),
    Extra(String, Value),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPatch(pub Vec<MetadataUpdate>);

impl MetadataPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, update: MetadataUpdate) -> Self {
        self.0.push(update);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from_state: WorkflowState,
    pub to_state: WorkflowState,
    /// Verb that caused the move; `None` for system-driven edges
    pub trigger: Option<Action>,
    pub actor: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub workflow_type: WorkflowType,
    pub branch_name: String,
    pub base_branch: String,
    pub current_state: WorkflowState,
    pub state_history: Vec<HistoryEntry>,
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every update; a write carrying an older version is refused
    #[serde(default)]
    pub version: u64,
}

impl Session {
    /// A new session in the machine's initial state
    pub fn new(machine: &StateMachine, branch_name: &str, base_branch: &str) -> Self {
        let now = Utc::now();
        let workflow_type = machine.workflow_type();
        Self {
            id: Uuid::new_v4(),
            workflow_type,
            branch_name: branch_name.to_string(),
            base_branch: base_branch.to_string(),
            current_state: machine.initial_state(),
            state_history: Vec::new(),
            metadata: SessionMetadata::new(workflow_type),
            created_at: now,
            updated_at: now,
            archived_at: None,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.current_state.is_terminal()
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.is_expired_at(Utc::now(), ttl)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.created_at > ttl
    }

    pub fn can_resume(&self, ttl: Duration) -> bool {
        self.is_active() && !self.is_expired(ttl)
    }

    /// Move to `to` through `machine`, applying `patch` only on success
    pub fn transition(
        &mut self,
        machine: &StateMachine,
        to: WorkflowState,
        patch: MetadataPatch,
        context: &ValidationContext,
        actor: &str,
    ) -> TransitionResult {
        let from = self.current_state;
        if machine.workflow_type() != self.workflow_type {
            let reason = format!(
                "session {} follows the {} workflow, not {}",
                self.id,
                self.workflow_type,
                machine.workflow_type()
            );
            return TransitionResult {
                success: false,
                from,
                to,
                timestamp: Utc::now(),
                metadata: patch.to_value(),
                warnings: Vec::new(),
                failure: Some(TransitionFailure::Illegal { reason }),
            };
        }

        let result = machine.transition(from, to, patch.to_value(), context);
        if !result.success {
            return result;
        }

        let mut patch = patch;
        for warning in &result.warnings {
            warn!(session_id = %self.id, %from, %to, warning = %warning, "Gate bypassed");
            patch.0.push(MetadataUpdate::GateWarning(warning.clone()));
        }
        for update in &patch.0 {
            self.metadata.apply(update);
        }

        self.state_history.push(HistoryEntry {
            from_state: from,
            to_state: to,
            trigger: Action::for_transition(from, to),
            actor: actor.to_string(),
            metadata: patch.to_value(),
            timestamp: result.timestamp,
        });
        self.current_state = to;
        self.updated_at = result.timestamp;
        if machine.is_terminal(to) {
            self.archived_at = Some(result.timestamp);
        }

        info!(
            session_id = %self.id,
            workflow = %self.workflow_type,
            branch = %self.branch_name,
            %from,
            %to,
            history_len = self.state_history.len(),
            "Session transitioned"
        );
        result
    }

    /// Apply metadata without a state change, e.g. a second commit in the same state
    pub fn annotate(&mut self, patch: MetadataPatch) {
        for update in &patch.0 {
            self.metadata.apply(update);
        }
        self.updated_at = Utc::now();
    }

    pub fn record_failure(&mut self, operation: &str, message: &str) {
        self.metadata.last_error = Some(format!("{operation}: {message}"));
        self.updated_at = Utc::now();
    }

    pub fn record_post_flight_failures(&mut self, failures: Vec<String>) {
        self.metadata.post_flight_failures = failures;
        self.updated_at = Utc::now();
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.created_at
    }
}
