//! End-to-end workflows driven through the public orchestrator API
//!
//! Git and the platform are the in-memory fakes; sessions go through the
//! file store so every step also exercises persistence.

use std::sync::Arc;
use std::time::Duration;

use branchflow::capabilities::fakes::{FakeGit, FakePlatform};
use branchflow::session::{FileSessionRepository, SessionRepository, WorkflowMetadata};
use branchflow::{
    hotfix_branch, GitCapability, RepositoryError, AbortParams, BranchflowConfig, CommitParams, HotfixDeployParams, HotfixStartParams,
    LaunchParams, Orchestrator, OrchestratorError, ShipParams, SwapParams, WorkflowState,
};
use tempfile::TempDir;

struct World {
    git: Arc<FakeGit>,
    platform: Arc<FakePlatform>,
    repository: Arc<FileSessionRepository>,
    orchestrator: Orchestrator,
    _store: TempDir,
}

fn world() -> World {
    world_with(BranchflowConfig::default())
}

fn world_with(mut config: BranchflowConfig) -> World {
    let store = TempDir::new().unwrap();
    let git = Arc::new(FakeGit::new("main"));
    let platform = Arc::new(FakePlatform::new());
    let repository = Arc::new(FileSessionRepository::open(store.path()).unwrap());
    config.sessions.store_dir = store.path().to_path_buf();
    let orchestrator = Orchestrator::new(git.clone(), platform.clone(), repository.clone(), config)
        .unwrap()
        .with_actor("ci-bot");
    World {
        git,
        platform,
        repository,
        orchestrator,
        _store: store,
    }
}

fn short_leases() -> BranchflowConfig {
    let mut config = BranchflowConfig::default();
    config.sessions.lease_seconds = 1;
    config
}

/// A ship session parked in WAITING_APPROVAL with approval granted and a CI
/// run that outlasts the one-second lease
async fn approved_slow_ship(w: &World, branch: &str) {
    w.git.create_branch(branch, "main").await.unwrap();
    w.git.checkout_branch(branch).await.unwrap();
    w.git.set_unstaged(&["src/slow.rs"]);
    w.git.commit("Slow change", false).await.unwrap();
    let parked = w
        .orchestrator
        .ship(ShipParams::new(branch).titled("Slow change"))
        .await
        .unwrap();
    assert_eq!(parked.new_state, Some(WorkflowState::WaitingApproval));

    w.platform.approve(1);
    w.platform.set_checks_delay(Duration::from_millis(2500));
}

#[tokio::test]
async fn test_launch_commit_ship_reaches_pull_request() {
    let w = world();
    w.orchestrator.launch(LaunchParams::new("feature/search")).await.unwrap();
    w.git.set_unstaged(&["src/search.rs"]);
    w.orchestrator
        .commit(CommitParams::new("feature/search", "Add search endpoint"))
        .await
        .unwrap();

    let result = w
        .orchestrator
        .ship(ShipParams::new("feature/search").titled("Add search endpoint"))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.new_state, Some(WorkflowState::PrCreated));

    let session = w.repository.get_by_branch("feature/search").await.unwrap().unwrap();
    assert_eq!(session.metadata.pr_number, Some(1));
    assert_eq!(session.state_history.len(), 4);
    assert!(session.state_history.iter().all(|entry| entry.actor == "ci-bot"));
    assert!(w.repository.current_lease(session.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_abort_refused_while_merging() {
    let w = world();
    let machine = w.orchestrator.workflows().machine(branchflow::WorkflowType::Ship);
    let mut session = branchflow::Session::new(machine, "feature/merge", "main");
    session.current_state = WorkflowState::Merging;
    w.repository.create(&session).await.unwrap();

    let err = w
        .orchestrator
        .abort(AbortParams::new("feature/merge"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::TransitionRejected { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_hotfix_gate_depends_on_severity() {
    let w = world();
    for (name, severity) in [("pool", "low"), ("auth", "critical")] {
        w.orchestrator
            .hotfix_start(HotfixStartParams::new(name, severity))
            .await
            .unwrap();
        w.git.set_unstaged(&["src/fix.rs"]);
        w.orchestrator
            .commit(CommitParams::new(&hotfix_branch(name), "Fix"))
            .await
            .unwrap();
        if name == "pool" {
            let low = w
                .orchestrator
                .hotfix_deploy(HotfixDeployParams::new("hotfix/pool").titled("Fix pool"))
                .await;
            assert!(matches!(low, Err(OrchestratorError::ValidationFailure { .. })));
        }
    }

    let critical = w
        .orchestrator
        .hotfix_deploy(HotfixDeployParams::new("hotfix/auth").titled("Fix auth"))
        .await
        .unwrap();
    assert_eq!(critical.new_state, Some(WorkflowState::HotfixComplete));
    assert_eq!(critical.warnings.len(), 1);

    let pool = w.repository.get_by_branch("hotfix/pool").await.unwrap().unwrap();
    assert_eq!(pool.current_state, WorkflowState::HotfixPushed);

    let deployed = w.repository.get(critical.session_id.unwrap()).await.unwrap().unwrap();
    assert!(matches!(
        deployed.metadata.workflow,
        WorkflowMetadata::Hotfix { deployed_commit: Some(_), .. }
    ));
}

#[tokio::test]
async fn test_session_survives_orchestrator_restart() {
    let w = world();
    w.orchestrator.launch(LaunchParams::new("feature/resume")).await.unwrap();

    let reopened = Arc::new(FileSessionRepository::open(w.repository.root()).unwrap());
    let second = Orchestrator::new(
        w.git.clone(),
        w.platform.clone(),
        reopened,
        BranchflowConfig::default(),
    )
    .unwrap();

    w.git.set_unstaged(&["src/lib.rs"]);
    let result = second
        .commit(CommitParams::new("feature/resume", "Continue after restart"))
        .await
        .unwrap();
    assert_eq!(result.new_state, Some(WorkflowState::ChangesCommitted));

    let status = w.orchestrator.status("feature/resume").await.unwrap();
    assert_eq!(status.session.state_history.len(), 2);
    assert!(status.resumable);
}

#[tokio::test]
async fn test_cleanup_never_removes_active_sessions() {
    let w = world();
    w.orchestrator.launch(LaunchParams::new("feature/keep")).await.unwrap();
    w.orchestrator.swap(SwapParams::new("main")).await.unwrap();
    w.orchestrator.launch(LaunchParams::new("feature/drop")).await.unwrap();
    w.orchestrator.abort(AbortParams::new("feature/drop")).await.unwrap();

    let result = w.orchestrator.cleanup(Some(0)).await.unwrap();
    assert!(result.success);

    let remaining = w.orchestrator.sessions(false).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].branch_name, "feature/keep");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_long_ci_wait_keeps_other_process_out() {
    let w = world_with(short_leases());
    approved_slow_ship(&w, "feature/slow").await;

    let rival = Orchestrator::new(
        w.git.clone(),
        w.platform.clone(),
        Arc::new(FileSessionRepository::open(w.repository.root()).unwrap()),
        short_leases(),
    )
    .unwrap()
    .with_actor("other-bot");

    let (shipped, aborted) = tokio::join!(
        w.orchestrator.ship(ShipParams::new("feature/slow")),
        async {
            tokio::time::sleep(Duration::from_millis(1600)).await;
            rival.abort(AbortParams::new("feature/slow")).await
        }
    );

    match aborted {
        Err(OrchestratorError::LockContention { holder, .. }) => assert_eq!(holder, "ci-bot"),
        other => panic!("abort should have met a held lease, got {other:?}"),
    }
    let shipped = shipped.unwrap();
    assert_eq!(shipped.new_state, Some(WorkflowState::Complete));

    let session = w.repository.get(shipped.session_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(session.current_state, WorkflowState::Complete);
    assert!(!session
        .state_history
        .iter()
        .any(|entry| entry.to_state == WorkflowState::Aborted));
    assert!(w.repository.current_lease(session.id).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_behind_the_lease_wins_over_stale_pipeline() {
    let w = world_with(short_leases());
    approved_slow_ship(&w, "feature/slow").await;
    let session_id = w
        .repository
        .get_by_branch("feature/slow")
        .await
        .unwrap()
        .unwrap()
        .id;

    let (shipped, _) = tokio::join!(
        w.orchestrator.ship(ShipParams::new("feature/slow")),
        async {
            tokio::time::sleep(Duration::from_millis(1600)).await;
            let other = FileSessionRepository::open(w.repository.root()).unwrap();
            let mut session = other.get(session_id).await.unwrap().unwrap();
            session.current_state = WorkflowState::Aborted;
            other.update(&mut session).await.unwrap();
        }
    );

    assert!(matches!(
        shipped,
        Err(OrchestratorError::Repository(RepositoryError::StaleWrite { .. }))
    ));
    let session = w.repository.get(session_id).await.unwrap().unwrap();
    assert_eq!(session.current_state, WorkflowState::Aborted);
    assert!(w.git.has_branch("feature/slow"));
    assert!(w.repository.current_lease(session_id).await.unwrap().is_none());
}
