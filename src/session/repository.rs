// Storage contract for sessions
//
// Branch uniqueness and lease ownership are enforced here rather than on the
// session itself. A lease is never waited on: a busy session is reported to
// the caller, who decides whether to try again.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::Session;
use crate::error::RepositoryError;

/// Ownership-tokened, expiring write lock on one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub session_id: Uuid,
    pub holder: String,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(session_id: Uuid, holder: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            holder: holder.to_string(),
            token: Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Same lease with a fresh expiry
    pub fn renewed(&self, ttl: Duration) -> Self {
        Self {
            expires_at: Utc::now() + ttl,
            ..self.clone()
        }
    }
}

/// `<hostname>:<pid>` identifying this process as a lease holder
pub fn process_holder() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{host}:{}", std::process::id())
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Fails with `BranchConflict` when the branch already has an active session
    async fn create(&self, session: &Session) -> Result<(), RepositoryError>;

    async fn get(&self, id: Uuid) -> Result<Option<Session>, RepositoryError>;

    /// The active session for `branch`, if any
    async fn get_by_branch(&self, branch: &str) -> Result<Option<Session>, RepositoryError>;

    /// Sessions ordered by creation time; archived ones are left out when `active_only`
    async fn list(&self, active_only: bool) -> Result<Vec<Session>, RepositoryError>;

    /// Compare-and-swap on `session.version`: refused with `StaleWrite` when the
    /// stored document has moved on, otherwise stored and the version advanced
    async fn update(&self, session: &mut Session) -> Result<(), RepositoryError>;

    /// Remove a session and its lease; false when it did not exist
    async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError>;

    /// Non-blocking. `None` while someone else holds a live lease.
    async fn acquire_lock(
        &self,
        id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, RepositoryError>;

    /// Push out the expiry of a lease this holder still owns. `None` once the
    /// lease was released or taken over; an expired lease nobody took is renewed.
    async fn renew_lock(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, RepositoryError>;

    /// Idempotent; a lease whose token no longer matches is ignored
    async fn release_lock(&self, lease: &Lease) -> Result<(), RepositoryError>;

    /// The live lease on a session, if any
    async fn current_lease(&self, id: Uuid) -> Result<Option<Lease>, RepositoryError>;

    /// Purge sessions that are both terminal and older than `max_age_days`
    async fn cleanup_expired(&self, max_age_days: u32) -> Result<usize, RepositoryError>;
}

/// The version `incoming` is stored under, provided nobody wrote since it was read
pub(crate) fn next_version(stored: &Session, incoming: &Session) -> Result<u64, RepositoryError> {
    if stored.version != incoming.version {
        return Err(RepositoryError::StaleWrite {
            id: incoming.id,
            expected: incoming.version,
            found: stored.version,
        });
    }
    Ok(incoming.version + 1)
}

/// Whether `cleanup_expired` may remove this session
pub(crate) fn is_purgeable(session: &Session, now: DateTime<Utc>, max_age_days: u32) -> bool {
    !session.is_active() && session.is_expired_at(now, Duration::days(i64::from(max_age_days)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry() {
        let lease = Lease::new(Uuid::new_v4(), "host:1", Duration::seconds(30));
        assert!(!lease.is_expired());
        assert!(lease.is_expired_at(lease.acquired_at + Duration::seconds(31)));
    }

    #[test]
    fn test_renewal_keeps_token() {
        let lease = Lease::new(Uuid::new_v4(), "host:1", Duration::seconds(-1));
        let renewed = lease.renewed(Duration::seconds(30));
        assert_eq!(renewed.token, lease.token);
        assert_eq!(renewed.acquired_at, lease.acquired_at);
        assert!(!renewed.is_expired());
    }

    #[test]
    fn test_process_holder_includes_pid() {
        let holder = process_holder();
        assert!(holder.ends_with(&format!(":{}", std::process::id())));
    }
}
