// Full ship pipeline through review, rebase, merge and cleanup
//
// MERGING is the one non-terminal state without an ABORTED edge: once the
// platform merge is in flight it has to land in MERGED or ERROR.

use super::rules::{
    branch_not_protected, branch_pushed, checks_passed, commit_recorded, merge_recorded,
    pull_request_open, review_approved,
};
use super::state_machine::{StateDefinition, StateMachine, WorkflowError};
use super::states::{WorkflowState::*, WorkflowType};

pub fn ship_workflow() -> Result<StateMachine, WorkflowError> {
    StateMachine::new(
        WorkflowType::Ship,
        Init,
        vec![
            StateDefinition::new(Init).to(&[Validating, Aborted]),
            StateDefinition::new(Validating)
                .to(&[ChangesCommitted, Aborted])
                .rule(branch_not_protected()),
            StateDefinition::new(ChangesCommitted)
                .to(&[Pushed, Aborted])
                .rule(commit_recorded()),
            StateDefinition::new(Pushed)
                .to(&[PrCreated, Aborted])
                .rule(branch_pushed()),
            StateDefinition::new(PrCreated)
                .to(&[WaitingApproval, Aborted])
                .rule(pull_request_open()),
            StateDefinition::new(WaitingApproval)
                .to(&[Approved, ChangesRequested, Aborted])
                .user_input(),
            StateDefinition::new(Approved)
                .to(&[Rebasing, Aborted])
                .rule(review_approved()),
            StateDefinition::new(ChangesRequested)
                .to(&[Pushed, Aborted])
                .user_input()
                .reversible(),
            StateDefinition::new(Rebasing).to(&[Merging, MergeConflict, Aborted]),
            StateDefinition::new(MergeConflict)
                .to(&[Rebasing, Aborted])
                .user_input()
                .reversible(),
            StateDefinition::new(Merging)
                .to(&[Merged, Error])
                .rule(checks_passed()),
            StateDefinition::new(Merged)
                .to(&[Cleanup, Aborted])
                .rule(merge_recorded()),
            StateDefinition::new(Error)
                .to(&[Validating, Aborted])
                .reversible(),
            StateDefinition::new(Cleanup).to(&[Complete, Aborted]),
            StateDefinition::new(Complete).terminal(),
            StateDefinition::new(Aborted).terminal(),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::rules::ValidationContext;
    use crate::workflows::states::WorkflowState;

    #[test]
    fn test_merging_cannot_be_aborted() {
        let machine = ship_workflow().unwrap();
        assert!(!machine.can_transition(Merging, Aborted));
        for state in machine.states() {
            if state == Merging || machine.is_terminal(state) {
                continue;
            }
            assert!(
                machine.can_transition(state, Aborted),
                "{state} should be abortable"
            );
        }
    }

    #[test]
    fn test_recovery_edges() {
        let machine = ship_workflow().unwrap();
        assert!(machine.can_transition(Error, Validating));
        assert!(machine.can_transition(MergeConflict, Rebasing));
        assert!(machine.can_transition(ChangesRequested, Pushed));
        assert!(!machine.can_transition(Error, Merging));
    }

    #[test]
    fn test_user_input_states() {
        let machine = ship_workflow().unwrap();
        let waiting: Vec<WorkflowState> = machine
            .states()
            .filter(|s| machine.definition(*s).is_some_and(|d| d.requires_user_input))
            .collect();
        assert_eq!(waiting, vec![WaitingApproval, ChangesRequested, MergeConflict]);
    }

    #[test]
    fn test_merging_requires_green_checks() {
        let machine = ship_workflow().unwrap();
        let red = ValidationContext::new().with("ci_passed", false);
        assert!(!machine.validate_state(Merging, &red));
        let green = ValidationContext::new().with("ci_passed", true);
        assert!(machine.validate_state(Merging, &green));
    }
}
