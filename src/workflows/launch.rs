// Standard feature delivery: branch, commit, push, open a pull request

use super::rules::{
    branch_merged, branch_not_protected, branch_pushed, commit_recorded, pull_request_open,
};
use super::state_machine::{StateDefinition, StateMachine, WorkflowError};
use super::states::{WorkflowState::*, WorkflowType};

pub fn launch_workflow() -> Result<StateMachine, WorkflowError> {
    StateMachine::new(
        WorkflowType::Launch,
        Init,
        vec![
            StateDefinition::new(Init).to(&[BranchReady, Aborted]),
            StateDefinition::new(BranchReady)
                .to(&[ChangesCommitted, Aborted])
                .rule(branch_not_protected()),
            StateDefinition::new(ChangesCommitted)
                .to(&[Pushed, BranchReady, Aborted])
                .reversible()
                .rule(commit_recorded()),
            StateDefinition::new(Pushed)
                .to(&[PrCreated, Aborted])
                .rule(branch_pushed()),
            StateDefinition::new(PrCreated)
                .to(&[Complete, Aborted])
                .rule(pull_request_open()),
            StateDefinition::new(Complete).terminal().rule(branch_merged()),
            StateDefinition::new(Aborted).terminal(),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::rules::ValidationContext;
    use crate::workflows::states::{Action, WorkflowState};
    use std::collections::BTreeSet;

    #[test]
    fn test_launch_table_edges() {
        let machine = launch_workflow().unwrap();
        assert_eq!(machine.initial_state(), WorkflowState::Init);
        assert!(machine.can_transition(Init, BranchReady));
        assert!(machine.can_transition(ChangesCommitted, BranchReady));
        assert!(machine.can_transition(PrCreated, Complete));
        assert!(!machine.can_transition(Init, Pushed));
        assert!(!machine.can_transition(BranchReady, Pushed));
        assert!(!machine.can_transition(Complete, Aborted));
        assert_eq!(machine.terminal_states(), vec![Complete, Aborted]);
    }

    #[test]
    fn test_committed_state_offers_reset() {
        let machine = launch_workflow().unwrap();
        assert_eq!(
            machine.get_allowed_actions(ChangesCommitted),
            BTreeSet::from([Action::Push, Action::Reset, Action::Abort])
        );
        assert!(machine.get_allowed_actions(Complete).is_empty());
    }

    #[test]
    fn test_branch_ready_rejects_protected_branch() {
        let machine = launch_workflow().unwrap();
        let context = ValidationContext::new()
            .with("branch_name", "main")
            .with("protected_branch", true);
        assert!(!machine.validate_state(BranchReady, &context));
    }
}
