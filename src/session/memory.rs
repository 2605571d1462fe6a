// Process-local session store

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use super::model::Session;
use super::repository::{is_purgeable, next_version, Lease, SessionRepository};
use crate::error::RepositoryError;

#[derive(Debug, Default)]
struct Store {
    sessions: HashMap<Uuid, Session>,
    leases: HashMap<Uuid, Lease>,
}

#[derive(Debug, Default)]
pub struct InMemorySessionRepository {
    store: Mutex<Store>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn create(&self, session: &Session) -> Result<(), RepositoryError> {
        let mut store = self.lock();
        if store.sessions.contains_key(&session.id) {
            return Err(RepositoryError::AlreadyExists(session.id));
        }
        if let Some(existing) = store
            .sessions
            .values()
            .find(|s| s.is_active() && s.branch_name == session.branch_name)
        {
            return Err(RepositoryError::BranchConflict {
                branch: session.branch_name.clone(),
                existing: existing.id,
            });
        }
        store.sessions.insert(session.id, session.clone());
        debug!(session_id = %session.id, branch = %session.branch_name, "Session created");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>, RepositoryError> {
        Ok(self.lock().sessions.get(&id).cloned())
    }

    async fn get_by_branch(&self, branch: &str) -> Result<Option<Session>, RepositoryError> {
        Ok(self
            .lock()
            .sessions
            .values()
            .find(|s| s.is_active() && s.branch_name == branch)
            .cloned())
    }

    async fn list(&self, active_only: bool) -> Result<Vec<Session>, RepositoryError> {
        let mut sessions: Vec<Session> = self
            .lock()
            .sessions
            .values()
            .filter(|s| !active_only || s.is_active())
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn update(&self, session: &mut Session) -> Result<(), RepositoryError> {
        let mut store = self.lock();
        let stored = store
            .sessions
            .get_mut(&session.id)
            .ok_or(RepositoryError::NotFound(session.id))?;
        session.version = next_version(stored, session)?;
        *stored = session.clone();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError> {
        let mut store = self.lock();
        store.leases.remove(&id);
        Ok(store.sessions.remove(&id).is_some())
    }

    async fn acquire_lock(
        &self,
        id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, RepositoryError> {
        let mut store = self.lock();
        if !store.sessions.contains_key(&id) {
            return Err(RepositoryError::NotFound(id));
        }
        if let Some(existing) = store.leases.get(&id) {
            if !existing.is_expired() {
                debug!(session_id = %id, holder = %existing.holder, "Lease already held");
                return Ok(None);
            }
            info!(session_id = %id, stale_holder = %existing.holder, "Taking over expired lease");
        }
        let lease = Lease::new(id, holder, ttl);
        store.leases.insert(id, lease.clone());
        Ok(Some(lease))
    }

    async fn renew_lock(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, RepositoryError> {
        let mut store = self.lock();
        match store.leases.get_mut(&lease.session_id) {
            Some(held) if held.token == lease.token => {
                *held = held.renewed(ttl);
                Ok(Some(held.clone()))
            }
            _ => {
                debug!(session_id = %lease.session_id, "Lease no longer held, not renewing");
                Ok(None)
            }
        }
    }

    async fn release_lock(&self, lease: &Lease) -> Result<(), RepositoryError> {
        let mut store = self.lock();
        if store
            .leases
            .get(&lease.session_id)
            .is_some_and(|held| held.token == lease.token)
        {
            store.leases.remove(&lease.session_id);
        }
        Ok(())
    }

    async fn current_lease(&self, id: Uuid) -> Result<Option<Lease>, RepositoryError> {
        Ok(self
            .lock()
            .leases
            .get(&id)
            .filter(|lease| !lease.is_expired())
            .cloned())
    }

    async fn cleanup_expired(&self, max_age_days: u32) -> Result<usize, RepositoryError> {
        let now = Utc::now();
        let mut store = self.lock();
        let doomed: Vec<Uuid> = store
            .sessions
            .values()
            .filter(|s| is_purgeable(s, now, max_age_days))
            .map(|s| s.id)
            .collect();
        for id in &doomed {
            store.sessions.remove(id);
            store.leases.remove(id);
        }
        if !doomed.is_empty() {
            info!(purged = doomed.len(), max_age_days, "Purged expired sessions");
        }
        Ok(doomed.len())
    }
}
