//! Workflow definitions and the shared transition engine

pub mod hotfix;
pub mod launch;
pub mod rules;
pub mod ship;
pub mod state_machine;
pub mod states;

pub use hotfix::hotfix_workflow;
pub use launch::launch_workflow;
pub use rules::{RuleKind, RuleOutcome, RuleReport, ValidationContext, ValidationRule};
pub use ship::ship_workflow;
pub use state_machine::{
    HookContext, HookPhase, StateDefinition, StateMachine, TransitionFailure, TransitionResult,
    WorkflowError,
};
pub use states::{Action, WorkflowState, WorkflowType};

/// The three built-in machines, built once and shared by reference
#[derive(Debug)]
pub struct WorkflowRegistry {
    launch: StateMachine,
    ship: StateMachine,
    hotfix: StateMachine,
}

impl WorkflowRegistry {
    pub fn new() -> Result<Self, WorkflowError> {
        Ok(Self {
            launch: launch_workflow()?,
            ship: ship_workflow()?,
            hotfix: hotfix_workflow()?,
        })
    }

    pub fn machine(&self, workflow: WorkflowType) -> &StateMachine {
        match workflow {
            WorkflowType::Launch => &self.launch,
            WorkflowType::Ship => &self.ship,
            WorkflowType::Hotfix => &self.hotfix,
        }
    }

    /// Mutable access for registering hooks
    pub fn machine_mut(&mut self, workflow: WorkflowType) -> &mut StateMachine {
        match workflow {
            WorkflowType::Launch => &mut self.launch,
            WorkflowType::Ship => &mut self.ship,
            WorkflowType::Hotfix => &mut self.hotfix,
        }
    }
}
