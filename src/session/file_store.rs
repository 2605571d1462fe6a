// Directory-backed session store
//
// Layout under the store root:
//
// ```text
// <id>.json          one session document
// <id>.lease.json    the current lease on that session, if any
// .store.lock        fd-lock guarding every read-modify-write
// ```
//
// Documents are written to a temporary file and renamed into place, so a
// reader never sees a half-written session. Branch-uniqueness and lease checks
// run under the store lock, which makes them safe across processes.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fd_lock::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::Session;
use super::repository::{is_purgeable, next_version, Lease, SessionRepository};
use crate::error::RepositoryError;

const LOCK_FILE: &str = ".store.lock";
const LEASE_SUFFIX: &str = ".lease.json";
const SESSION_SUFFIX: &str = ".json";

#[derive(Debug, Clone)]
struct StoreDir {
    root: PathBuf,
}

impl StoreDir {
    fn session_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}{SESSION_SUFFIX}"))
    }

    fn lease_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}{LEASE_SUFFIX}"))
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, RepositoryError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), RepositoryError> {
        let content = serde_json::to_string_pretty(value)?;
        let temp_path = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        fs::write(&temp_path, content)?;
        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<bool, RepositoryError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn session(&self, id: Uuid) -> Result<Option<Session>, RepositoryError> {
        self.read_json(&self.session_path(id))
    }

    fn lease(&self, id: Uuid) -> Result<Option<Lease>, RepositoryError> {
        self.read_json(&self.lease_path(id))
    }

    /// Every readable session document; unreadable ones are skipped with a warning
    fn sessions(&self) -> Result<Vec<Session>, RepositoryError> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(SESSION_SUFFIX) || name.ends_with(LEASE_SUFFIX) {
                continue;
            }
            match self.read_json::<Session>(&path) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session document"),
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }
}

#[derive(Debug, Clone)]
pub struct FileSessionRepository {
    dir: StoreDir,
}

impl FileSessionRepository {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!(root = %root.display(), "Opened session store");
        Ok(Self {
            dir: StoreDir { root },
        })
    }

    pub fn root(&self) -> &Path {
        &self.dir.root
    }

    /// Run `op` on a blocking thread while holding the store lock
    async fn locked<T, F>(&self, op: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&StoreDir) -> Result<T, RepositoryError> + Send + 'static,
    {
        let dir = self.dir.clone();
        let lock_path = dir.root.join(LOCK_FILE);
        let display_path = lock_path.display().to_string();
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&lock_path)?;
            let mut lock = RwLock::new(file);
            let _guard = lock.write().map_err(|e| RepositoryError::LockFile {
                path: lock_path.display().to_string(),
                message: e.to_string(),
            })?;
            op(&dir)
        })
        .await
        .map_err(|e| RepositoryError::LockFile {
            path: display_path,
            message: format!("store task did not complete: {e}"),
        })?
    }
}

#[async_trait]
impl SessionRepository for FileSessionRepository {
    async fn create(&self, session: &Session) -> Result<(), RepositoryError> {
        let session = session.clone();
        self.locked(move |dir| {
            if dir.session_path(session.id).exists() {
                return Err(RepositoryError::AlreadyExists(session.id));
            }
            if let Some(existing) = dir
                .sessions()?
                .into_iter()
                .find(|s| s.is_active() && s.branch_name == session.branch_name)
            {
                return Err(RepositoryError::BranchConflict {
                    branch: session.branch_name.clone(),
                    existing: existing.id,
                });
            }
            dir.write_json(&dir.session_path(session.id), &session)?;
            debug!(session_id = %session.id, branch = %session.branch_name, "Session document written");
            Ok(())
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>, RepositoryError> {
        self.locked(move |dir| dir.session(id)).await
    }

    async fn get_by_branch(&self, branch: &str) -> Result<Option<Session>, RepositoryError> {
        let branch = branch.to_string();
        self.locked(move |dir| {
            Ok(dir
                .sessions()?
                .into_iter()
                .find(|s| s.is_active() && s.branch_name == branch))
        })
        .await
    }

    async fn list(&self, active_only: bool) -> Result<Vec<Session>, RepositoryError> {
        self.locked(move |dir| {
            Ok(dir
                .sessions()?
                .into_iter()
                .filter(|s| !active_only || s.is_active())
                .collect())
        })
        .await
    }

    async fn update(&self, session: &mut Session) -> Result<(), RepositoryError> {
        let mut incoming = session.clone();
        let version = self
            .locked(move |dir| {
                let stored = dir
                    .session(incoming.id)?
                    .ok_or(RepositoryError::NotFound(incoming.id))?;
                incoming.version = next_version(&stored, &incoming)?;
                dir.write_json(&dir.session_path(incoming.id), &incoming)?;
                Ok(incoming.version)
            })
            .await?;
        session.version = version;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError> {
        self.locked(move |dir| {
            dir.remove(&dir.lease_path(id))?;
            dir.remove(&dir.session_path(id))
        })
        .await
    }

    async fn acquire_lock(
        &self,
        id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, RepositoryError> {
        let holder = holder.to_string();
        self.locked(move |dir| {
            if !dir.session_path(id).exists() {
                return Err(RepositoryError::NotFound(id));
            }
            if let Some(existing) = dir.lease(id)? {
                if !existing.is_expired() {
                    debug!(session_id = %id, holder = %existing.holder, "Lease already held");
                    return Ok(None);
                }
                info!(session_id = %id, stale_holder = %existing.holder, "Taking over expired lease");
            }
            let lease = Lease::new(id, &holder, ttl);
            dir.write_json(&dir.lease_path(id), &lease)?;
            Ok(Some(lease))
        })
        .await
    }

    async fn renew_lock(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, RepositoryError> {
        let lease = lease.clone();
        self.locked(move |dir| match dir.lease(lease.session_id)? {
            Some(held) if held.token == lease.token => {
                let renewed = held.renewed(ttl);
                dir.write_json(&dir.lease_path(lease.session_id), &renewed)?;
                Ok(Some(renewed))
            }
            _ => {
                debug!(session_id = %lease.session_id, "Lease no longer held, not renewing");
                Ok(None)
            }
        })
        .await
    }

    async fn release_lock(&self, lease: &Lease) -> Result<(), RepositoryError> {
        let lease = lease.clone();
        self.locked(move |dir| {
            if let Some(held) = dir.lease(lease.session_id)? {
                if held.token == lease.token {
                    dir.remove(&dir.lease_path(lease.session_id))?;
                } else {
                    debug!(session_id = %lease.session_id, "Ignoring release with stale token");
                }
            }
            Ok(())
        })
        .await
    }

    async fn current_lease(&self, id: Uuid) -> Result<Option<Lease>, RepositoryError> {
        self.locked(move |dir| Ok(dir.lease(id)?.filter(|lease| !lease.is_expired())))
            .await
    }

    async fn cleanup_expired(&self, max_age_days: u32) -> Result<usize, RepositoryError> {
        self.locked(move |dir| {
            let now = Utc::now();
            let mut purged = 0;
            for session in dir.sessions()? {
                if is_purgeable(&session, now, max_age_days) {
                    dir.remove(&dir.lease_path(session.id))?;
                    dir.remove(&dir.session_path(session.id))?;
                    purged += 1;
                }
            }
            if purged > 0 {
                info!(purged, max_age_days, "Purged expired sessions");
            }
            Ok(purged)
        })
        .await
    }
}
