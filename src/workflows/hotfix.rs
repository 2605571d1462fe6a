// Emergency hotfix: severity-gated validation, deploy, optional rollback

use super::rules::{
    branch_pushed, commit_recorded, merge_recorded, rollback_target_recorded, severity_gate,
};
use super::state_machine::{StateDefinition, StateMachine, WorkflowError};
use super::states::{WorkflowState::*, WorkflowType};

pub fn hotfix_workflow() -> Result<StateMachine, WorkflowError> {
    StateMachine::new(
        WorkflowType::Hotfix,
        HotfixInit,
        vec![
            StateDefinition::new(HotfixInit).to(&[HotfixReady]),
            StateDefinition::new(HotfixReady)
                .to(&[HotfixCommitted])
                .rule(rollback_target_recorded()),
            StateDefinition::new(HotfixCommitted)
                .to(&[HotfixPushed])
                .rule(commit_recorded()),
            StateDefinition::new(HotfixPushed)
                .to(&[HotfixValidated])
                .rule(branch_pushed()),
            StateDefinition::new(HotfixValidated)
                .to(&[HotfixDeployed, Rollback, Aborted])
                .rule(severity_gate()),
            StateDefinition::new(HotfixDeployed)
                .to(&[HotfixCleanup])
                .rule(merge_recorded()),
            StateDefinition::new(Rollback)
                .to(&[HotfixValidated])
                .reversible()
                .rule(rollback_target_recorded()),
            StateDefinition::new(HotfixCleanup).to(&[HotfixComplete]),
            StateDefinition::new(HotfixComplete).terminal(),
            StateDefinition::new(Aborted).terminal(),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::rules::ValidationContext;
    use crate::workflows::state_machine::TransitionFailure;
    use serde_json::json;

    fn gate_context(severity: &str) -> ValidationContext {
        ValidationContext::new()
            .with("severity", severity)
            .with("pr_number", 42)
            .with("review_approved", false)
            .with("ci_passed", true)
    }

    #[test]
    fn test_low_severity_without_approval_is_blocked() {
        let machine = hotfix_workflow().unwrap();
        let result = machine.transition(HotfixPushed, HotfixValidated, json!({}), &gate_context("low"));
        assert!(!result.success);
        assert!(matches!(result.failure, Some(TransitionFailure::RulesFailed { .. })));
    }

    #[test]
    fn test_critical_severity_passes_with_warning() {
        let machine = hotfix_workflow().unwrap();
        let result = machine.transition(
            HotfixPushed,
            HotfixValidated,
            json!({}),
            &gate_context("critical"),
        );
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_hotfix_aborts_only_once_validated() {
        let machine = hotfix_workflow().unwrap();
        for early in [HotfixInit, HotfixReady, HotfixCommitted, HotfixPushed] {
            assert!(!machine.can_transition(early, Aborted), "{early} must not abort");
        }
        assert!(machine.can_transition(HotfixValidated, Aborted));
        assert!(!machine.can_transition(HotfixDeployed, Aborted));
        assert!(machine.can_transition(Rollback, HotfixValidated));
        assert_eq!(machine.terminal_states(), vec![Aborted, HotfixComplete]);
    }
}
