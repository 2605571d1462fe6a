// Background renewal for a held lease
//
// Operations can outlive the lease TTL while waiting on CI. The keeper renews
// on a fixed interval until stopped; once the lease is found taken over it
// stops renewing, and the session's version check refuses any stale write.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument, Span};

use super::repository::{Lease, SessionRepository};

#[derive(Debug)]
pub struct LeaseKeeper {
    lease: Lease,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl LeaseKeeper {
    pub fn start(
        repository: Arc<dyn SessionRepository>,
        lease: Lease,
        ttl: ChronoDuration,
        every: Duration,
    ) -> Self {
        let (shutdown, stop) = watch::channel(false);
        let handle = tokio::spawn(
            renew_loop(repository, lease.clone(), ttl, every, stop).instrument(Span::current()),
        );
        Self {
            lease,
            shutdown: Some(shutdown),
            handle: Some(handle),
        }
    }

    /// Stop renewing and wait for any in-flight renewal to land
    pub async fn stop(mut self) -> Lease {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.lease.clone()
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn renew_loop(
    repository: Arc<dyn SessionRepository>,
    lease: Lease,
    ttl: ChronoDuration,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match repository.renew_lock(&lease, ttl).await {
                    Ok(Some(renewed)) => {
                        debug!(session_id = %lease.session_id, expires_at = %renewed.expires_at, "Lease renewed");
                    }
                    Ok(None) => {
                        warn!(session_id = %lease.session_id, holder = %lease.holder, "Lease was lost, no longer renewing");
                        break;
                    }
                    Err(error) => {
                        warn!(session_id = %lease.session_id, error = %error, "Lease renewal failed");
                    }
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InMemorySessionRepository, Session};
    use crate::workflows::launch_workflow;

    async fn leased(repo: &Arc<InMemorySessionRepository>, ttl: ChronoDuration) -> Lease {
        let machine = launch_workflow().unwrap();
        let session = Session::new(&machine, "feature/long", "main");
        repo.create(&session).await.unwrap();
        repo.acquire_lock(session.id, "agent-a", ttl).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_keeper_holds_lease_past_ttl() {
        let repo = Arc::new(InMemorySessionRepository::new());
        let ttl = ChronoDuration::milliseconds(300);
        let lease = leased(&repo, ttl).await;

        let keeper = LeaseKeeper::start(repo.clone(), lease.clone(), ttl, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let current = repo.current_lease(lease.session_id).await.unwrap().unwrap();
            assert_eq!(current.token, lease.token);
        }
        assert!(repo
            .acquire_lock(lease.session_id, "agent-b", ttl)
            .await
            .unwrap()
            .is_none());

        let stopped = keeper.stop().await;
        assert_eq!(stopped.token, lease.token);
        repo.release_lock(&stopped).await.unwrap();
        assert!(repo.current_lease(lease.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keeper_gives_up_after_takeover() {
        let repo = Arc::new(InMemorySessionRepository::new());
        let lease = leased(&repo, ChronoDuration::milliseconds(-1)).await;
        let rival = repo
            .acquire_lock(lease.session_id, "agent-b", ChronoDuration::minutes(5))
            .await
            .unwrap()
            .unwrap();

        let keeper = LeaseKeeper::start(
            repo.clone(),
            lease.clone(),
            ChronoDuration::minutes(5),
            Duration::from_millis(100),
        );
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(repo.current_lease(lease.session_id).await.unwrap(), Some(rival));
        keeper.stop().await;
    }
}
