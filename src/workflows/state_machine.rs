// Table-driven state machine shared by every workflow
//
// A transition is legal only when it is declared in the table. Legal
// transitions then pass through the target state's rules and any Validate
// hooks before Exit/Enter hooks fire. Nothing runs for illegal transitions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::rules::{RuleOutcome, RuleReport, ValidationContext, ValidationRule};
use super::states::{Action, WorkflowState, WorkflowType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("{workflow}: state {state} is declared twice")]
    DuplicateState {
        workflow: WorkflowType,
        state: WorkflowState,
    },
    #[error("{workflow}: {from} targets undefined state {to}")]
    UndefinedTarget {
        workflow: WorkflowType,
        from: WorkflowState,
        to: WorkflowState,
    },
    #[error("{workflow}: terminal state {state} declares outgoing transitions")]
    TerminalWithTransitions {
        workflow: WorkflowType,
        state: WorkflowState,
    },
    #[error("{workflow}: initial state {state} is not defined")]
    UndefinedInitial {
        workflow: WorkflowType,
        state: WorkflowState,
    },
}

/// One row of a transition table
#[derive(Debug, Clone, Serialize)]
pub struct StateDefinition {
    pub state: WorkflowState,
    pub allowed_transitions: Vec<WorkflowState>,
    pub requires_user_input: bool,
    pub is_terminal: bool,
    pub is_reversible: bool,
    pub validation_rules: Vec<ValidationRule>,
}

impl StateDefinition {
    pub fn new(state: WorkflowState) -> Self {
        Self {
            state,
            allowed_transitions: Vec::new(),
            requires_user_input: false,
            is_terminal: false,
            is_reversible: false,
            validation_rules: Vec::new(),
        }
    }

    pub fn to(mut self, targets: &[WorkflowState]) -> Self {
        self.allowed_transitions.extend_from_slice(targets);
        self
    }

    pub fn terminal(mut self) -> Self {
        self.is_terminal = true;
        self
    }

    pub fn reversible(mut self) -> Self {
        self.is_reversible = true;
        self
    }

    pub fn user_input(mut self) -> Self {
        self.requires_user_input = true;
        self
    }

    pub fn rule(mut self, rule: ValidationRule) -> Self {
        self.validation_rules.push(rule);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Validate,
    Exit,
    Enter,
}

/// What a hook sees while a transition is in progress
#[derive(Debug)]
pub struct HookContext<'a> {
    pub workflow: WorkflowType,
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub metadata: &'a Value,
    pub context: &'a ValidationContext,
}

pub type ValidateHook = Arc<dyn Fn(&HookContext<'_>) -> Result<(), String> + Send + Sync>;
pub type LifecycleHook = Arc<dyn Fn(&HookContext<'_>) + Send + Sync>;

#[derive(Clone)]
enum Hook {
    Validate(ValidateHook),
    Lifecycle(LifecycleHook),
}

/// Why a transition did not happen
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransitionFailure {
    /// Not in the table, unknown source, or source is terminal
    Illegal { reason: String },
    /// One or more target-state rules failed
    RulesFailed { reports: Vec<RuleReport> },
    /// A Validate hook vetoed the transition
    HookRejected { reason: String },
}

impl TransitionFailure {
    pub fn describe(&self) -> String {
        match self {
            TransitionFailure::Illegal { reason } => reason.clone(),
            TransitionFailure::RulesFailed { reports } => reports
                .iter()
                .filter_map(|r| match &r.outcome {
                    RuleOutcome::Fail(msg) => Some(msg.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("; "),
            TransitionFailure::HookRejected { reason } => reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionResult {
    pub success: bool,
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
    pub warnings: Vec<String>,
    pub failure: Option<TransitionFailure>,
}

impl TransitionResult {
    fn failed(from: WorkflowState, to: WorkflowState, metadata: Value, failure: TransitionFailure) -> Self {
        Self {
            success: false,
            from,
            to,
            timestamp: Utc::now(),
            metadata,
            warnings: Vec::new(),
            failure: Some(failure),
        }
    }
}

/// Enforces one workflow's transition table, independent of any session
pub struct StateMachine {
    workflow: WorkflowType,
    initial: WorkflowState,
    states: BTreeMap<WorkflowState, StateDefinition>,
    hooks: HashMap<(WorkflowState, HookPhase), Vec<Hook>>,
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("workflow", &self.workflow)
            .field("initial", &self.initial)
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl StateMachine {
    /// Build a machine from declared rows, rejecting malformed tables
    pub fn new(
        workflow: WorkflowType,
        initial: WorkflowState,
        definitions: Vec<StateDefinition>,
    ) -> Result<Self, WorkflowError> {
        let mut states = BTreeMap::new();
        for definition in definitions {
            let state = definition.state;
            if states.insert(state, definition).is_some() {
                return Err(WorkflowError::DuplicateState { workflow, state });
            }
        }

        if !states.contains_key(&initial) {
            return Err(WorkflowError::UndefinedInitial {
                workflow,
                state: initial,
            });
        }

        for definition in states.values() {
            if definition.is_terminal && !definition.allowed_transitions.is_empty() {
                return Err(WorkflowError::TerminalWithTransitions {
                    workflow,
                    state: definition.state,
                });
            }
            for target in &definition.allowed_transitions {
                if !states.contains_key(target) {
                    return Err(WorkflowError::UndefinedTarget {
                        workflow,
                        from: definition.state,
                        to: *target,
                    });
                }
            }
        }

        Ok(Self {
            workflow,
            initial,
            states,
            hooks: HashMap::new(),
        })
    }

    pub fn workflow_type(&self) -> WorkflowType {
        self.workflow
    }

    pub fn initial_state(&self) -> WorkflowState {
        self.initial
    }

    pub fn states(&self) -> impl Iterator<Item = WorkflowState> + '_ {
        self.states.keys().copied()
    }

    pub fn terminal_states(&self) -> Vec<WorkflowState> {
        self.states
            .values()
            .filter(|d| d.is_terminal)
            .map(|d| d.state)
            .collect()
    }

    pub fn definition(&self, state: WorkflowState) -> Option<&StateDefinition> {
        self.states.get(&state)
    }

    pub fn is_known(&self, state: WorkflowState) -> bool {
        self.states.contains_key(&state)
    }

    pub fn is_terminal(&self, state: WorkflowState) -> bool {
        self.definition(state).is_some_and(|d| d.is_terminal)
    }

    pub fn allowed_transitions(&self, state: WorkflowState) -> &[WorkflowState] {
        self.definition(state)
            .map(|d| d.allowed_transitions.as_slice())
            .unwrap_or(&[])
    }

    pub fn can_transition(&self, from: WorkflowState, to: WorkflowState) -> bool {
        match self.definition(from) {
            Some(definition) => !definition.is_terminal && definition.allowed_transitions.contains(&to),
            None => false,
        }
    }

    pub fn on_validate<F>(&mut self, state: WorkflowState, hook: F)
    where
        F: Fn(&HookContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks
            .entry((state, HookPhase::Validate))
            .or_default()
            .push(Hook::Validate(Arc::new(hook)));
    }

    pub fn on_exit<F>(&mut self, state: WorkflowState, hook: F)
    where
        F: Fn(&HookContext<'_>) + Send + Sync + 'static,
    {
        self.hooks
            .entry((state, HookPhase::Exit))
            .or_default()
            .push(Hook::Lifecycle(Arc::new(hook)));
    }

    pub fn on_enter<F>(&mut self, state: WorkflowState, hook: F)
    where
        F: Fn(&HookContext<'_>) + Send + Sync + 'static,
    {
        self.hooks
            .entry((state, HookPhase::Enter))
            .or_default()
            .push(Hook::Lifecycle(Arc::new(hook)));
    }

    /// Evaluate every rule of `state` against the context
    pub fn evaluate_state(&self, state: WorkflowState, context: &ValidationContext) -> Vec<RuleReport> {
        self.definition(state)
            .map(|definition| {
                definition
                    .validation_rules
                    .iter()
                    .map(|rule| RuleReport {
                        rule: rule.name,
                        outcome: rule.evaluate(context),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Admission check: would `state` accept entry with this context?
    pub fn validate_state(&self, state: WorkflowState, context: &ValidationContext) -> bool {
        self.is_known(state)
            && self
                .evaluate_state(state, context)
                .iter()
                .all(|report| !report.outcome.is_failure())
    }

    /// Context fields the rules of `state` need
    pub fn required_fields(&self, state: WorkflowState) -> BTreeSet<&'static str> {
        self.definition(state)
            .map(|d| {
                d.validation_rules
                    .iter()
                    .flat_map(|r| r.required_fields.iter().copied())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_allowed_actions(&self, state: WorkflowState) -> BTreeSet<Action> {
        if self.is_terminal(state) {
            return BTreeSet::new();
        }
        self.allowed_transitions(state)
            .iter()
            .filter_map(|to| Action::for_transition(state, *to))
            .collect()
    }

    pub fn transition(
        &self,
        from: WorkflowState,
        to: WorkflowState,
        metadata: Value,
        context: &ValidationContext,
    ) -> TransitionResult {
        if !self.can_transition(from, to) {
            let reason = if !self.is_known(from) {
                format!("{} workflow has no state {from}", self.workflow)
            } else if self.is_terminal(from) {
                format!("{from} is terminal in the {} workflow", self.workflow)
            } else {
                format!("{} workflow does not allow {from} -> {to}", self.workflow)
            };
            debug!(workflow = %self.workflow, %from, %to, %reason, "Transition rejected");
            return TransitionResult::failed(from, to, metadata, TransitionFailure::Illegal { reason });
        }

        let reports = self.evaluate_state(to, context);
        if reports.iter().any(|r| r.outcome.is_failure()) {
            warn!(workflow = %self.workflow, %from, %to, "Target state rules failed");
            return TransitionResult::failed(from, to, metadata, TransitionFailure::RulesFailed { reports });
        }
        let warnings: Vec<String> = reports
            .iter()
            .filter_map(|r| match &r.outcome {
                RuleOutcome::PassWithWarning(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect();

        let hook_context = HookContext {
            workflow: self.workflow,
            from,
            to,
            metadata: &metadata,
            context,
        };

        for hook in self.hooks_for(to, HookPhase::Validate) {
            if let Hook::Validate(validate) = hook {
                if let Err(reason) = validate(&hook_context) {
                    warn!(workflow = %self.workflow, %from, %to, %reason, "Validate hook rejected transition");
                    return TransitionResult::failed(
                        from,
                        to,
                        metadata.clone(),
                        TransitionFailure::HookRejected { reason },
                    );
                }
            }
        }

        self.run_lifecycle(from, HookPhase::Exit, &hook_context);
        self.run_lifecycle(to, HookPhase::Enter, &hook_context);

        for warning in &warnings {
            warn!(workflow = %self.workflow, %from, %to, warning = %warning, "Transition accepted with warning");
        }

        TransitionResult {
            success: true,
            from,
            to,
            timestamp: Utc::now(),
            metadata: metadata.clone(),
            warnings,
            failure: None,
        }
    }

    fn hooks_for(&self, state: WorkflowState, phase: HookPhase) -> &[Hook] {
        self.hooks
            .get(&(state, phase))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn run_lifecycle(&self, state: WorkflowState, phase: HookPhase, context: &HookContext<'_>) {
        for hook in self.hooks_for(state, phase) {
            if let Hook::Lifecycle(run) = hook {
                run(context);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::rules::commit_recorded;
    use std::sync::Mutex;

    fn tiny_machine() -> StateMachine {
        use WorkflowState::*;
        StateMachine::new(
            WorkflowType::Launch,
            Init,
            vec![
                StateDefinition::new(Init).to(&[ChangesCommitted, Aborted]),
                StateDefinition::new(ChangesCommitted)
                    .to(&[Complete])
                    .rule(commit_recorded()),
                StateDefinition::new(Complete).terminal(),
                StateDefinition::new(Aborted).terminal(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_table_with_undefined_target() {
        use WorkflowState::*;
        let err = StateMachine::new(
            WorkflowType::Launch,
            Init,
            vec![StateDefinition::new(Init).to(&[Pushed])],
        )
        .unwrap_err();
        assert_eq!(
            err,
            WorkflowError::UndefinedTarget {
                workflow: WorkflowType::Launch,
                from: Init,
                to: Pushed
            }
        );
    }

    #[test]
    fn test_rejects_terminal_with_outgoing_edges() {
        use WorkflowState::*;
        let err = StateMachine::new(
            WorkflowType::Launch,
            Init,
            vec![
                StateDefinition::new(Init).to(&[Complete]),
                StateDefinition::new(Complete).terminal().to(&[Init]),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::TerminalWithTransitions { .. }));
    }

    #[test]
    fn test_illegal_transition_runs_no_hooks() {
        let mut machine = tiny_machine();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        machine.on_exit(WorkflowState::Init, move |_| seen.lock().unwrap().push("exit"));

        let result = machine.transition(
            WorkflowState::Init,
            WorkflowState::Complete,
            Value::Null,
            &ValidationContext::new(),
        );
        assert!(!result.success);
        assert!(matches!(result.failure, Some(TransitionFailure::Illegal { .. })));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_hooks_fire_exit_then_enter() {
        let mut machine = tiny_machine();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let on_exit = calls.clone();
        let on_enter = calls.clone();
        machine.on_exit(WorkflowState::Init, move |ctx| {
            on_exit.lock().unwrap().push(format!("exit {}", ctx.from))
        });
        machine.on_enter(WorkflowState::ChangesCommitted, move |ctx| {
            on_enter.lock().unwrap().push(format!("enter {}", ctx.to))
        });

        let context = ValidationContext::new().with("commit_hash", "abc");
        let result = machine.transition(
            WorkflowState::Init,
            WorkflowState::ChangesCommitted,
            Value::Null,
            &context,
        );
        assert!(result.success);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["exit INIT".to_string(), "enter CHANGES_COMMITTED".to_string()]
        );
    }

    #[test]
    fn test_validate_hook_vetoes_before_lifecycle_hooks() {
        let mut machine = tiny_machine();
        let entered = Arc::new(Mutex::new(false));
        let flag = entered.clone();
        machine.on_validate(WorkflowState::Aborted, |_| Err("not today".to_string()));
        machine.on_enter(WorkflowState::Aborted, move |_| *flag.lock().unwrap() = true);

        let result = machine.transition(
            WorkflowState::Init,
            WorkflowState::Aborted,
            Value::Null,
            &ValidationContext::new(),
        );
        assert!(!result.success);
        assert_eq!(
            result.failure,
            Some(TransitionFailure::HookRejected {
                reason: "not today".to_string()
            })
        );
        assert!(!*entered.lock().unwrap());
    }

    #[test]
    fn test_rule_failure_blocks_entry() {
        let machine = tiny_machine();
        let result = machine.transition(
            WorkflowState::Init,
            WorkflowState::ChangesCommitted,
            Value::Null,
            &ValidationContext::new(),
        );
        assert!(!result.success);
        assert!(matches!(result.failure, Some(TransitionFailure::RulesFailed { .. })));
        assert!(!machine.validate_state(WorkflowState::ChangesCommitted, &ValidationContext::new()));
        assert_eq!(
            machine.required_fields(WorkflowState::ChangesCommitted),
            BTreeSet::from(["commit_hash"])
        );
    }
}
