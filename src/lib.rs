// Branchflow Library - session-tracked git branch workflows
// Launch, ship and hotfix state machines driven through injected git and platform capabilities

pub mod capabilities;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod telemetry;
pub mod validation;
pub mod workflows;

// Re-export key types for easy access
pub use capabilities::{GitCapability, GitStatus, MergeMethod, PlatformCapability, PullRequest};
pub use concurrency::{BoundedExecutor, ConcurrencyToolkit, LruCache, RetryPolicy, TtlCache};
pub use config::BranchflowConfig;
pub use error::{OrchestratorError, RepositoryError, Result};
pub use orchestrator::{
    hotfix_branch, stash_label, AbortParams, Choice, CommitParams, HotfixDeployParams, HotfixRollbackParams,
    HotfixStartParams, LaunchParams, OperationResult, Orchestrator, SessionStatus, ShipParams,
    SwapParams,
};
pub use session::{
    FileSessionRepository, InMemorySessionRepository, Lease, LeaseKeeper, Session, SessionRepository,
};
pub use telemetry::{generate_correlation_id, init_telemetry};
pub use validation::{CheckOption, CheckResult, Decision, Operation, PreFlightReport, ValidationService};
pub use workflows::{StateMachine, TransitionResult, WorkflowRegistry, WorkflowState, WorkflowType};
