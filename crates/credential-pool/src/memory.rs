//! In-process `Store` with optional JSON snapshots
//!
//! All state sits behind one tokio Mutex, which makes every store call atomic
//! relative to the others. When opened with a path, the state is loaded from
//! and written back to a JSON snapshot with atomic temp-file + rename; the
//! file holds sealed secrets and is kept at 0600.
//!
//! Usage entries are kept per user so admission checks only scan the
//! requesting user's history; `prune_usage` bounds that history.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{Credential, CredentialId, JobStatus, ModelGroup, UsageLogEntry, User, UserId};
use crate::store::{
    CredentialQuery, CredentialUpdate, MAX_ERROR_LEN, Store, StoreFuture, UsageQuery, truncate,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    credentials: BTreeMap<CredentialId, Credential>,
    #[serde(default)]
    users: BTreeMap<UserId, User>,
    /// Usage log, per user, in insertion order
    #[serde(default)]
    usage: BTreeMap<UserId, VecDeque<UsageLogEntry>>,
    #[serde(default)]
    jobs: HashMap<String, JobStatus>,
    #[serde(default)]
    next_credential_id: u64,
    #[serde(default)]
    next_user_id: u64,
    #[serde(default)]
    next_usage_id: u64,
}

impl StoreState {
    fn credential_mut(&mut self, id: CredentialId) -> Result<&mut Credential> {
        self.credentials
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("credential {id}")))
    }

    fn usage_len(&self) -> usize {
        self.usage.values().map(VecDeque::len).sum()
    }

    fn user_usage<'a>(&'a self, query: &'a UsageQuery) -> impl Iterator<Item = &'a UsageLogEntry> {
        self.usage
            .get(&query.user_id)
            .into_iter()
            .flatten()
            .filter(move |e| query.matches(e))
    }

    fn next_id(counter: &mut u64) -> u64 {
        *counter += 1;
        *counter
    }
}

pub struct MemoryStore {
    state: Mutex<StoreState>,
    snapshot: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Volatile store, nothing is written to disk.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            snapshot: None,
        }
    }

    /// Load from `path`, creating an empty snapshot on cold start.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading store snapshot: {e}")))?;
            let state: StoreState = serde_json::from_str(&contents)
                .map_err(|e| Error::Snapshot(format!("parsing store snapshot: {e}")))?;
            info!(
                path = %path.display(),
                credentials = state.credentials.len(),
                users = state.users.len(),
                usage = state.usage_len(),
                "loaded store snapshot"
            );
            state
        } else {
            info!(path = %path.display(), "store snapshot not found, starting empty");
            let state = StoreState::default();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            state: Mutex::new(state),
            snapshot: Some(path),
        })
    }

    /// Write the current state to the snapshot file, if one is configured.
    pub async fn persist(&self) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let state = self.state.lock().await;
        write_atomic(path, &state).await
    }
}

impl Store for MemoryStore {
    fn list_credentials(&self, query: CredentialQuery) -> StoreFuture<'_, Vec<Credential>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .credentials
                .values()
                .filter(|c| query.matches(c))
                .cloned()
                .collect())
        })
    }

    fn get_credential(&self, id: CredentialId) -> StoreFuture<'_, Option<Credential>> {
        Box::pin(async move { Ok(self.state.lock().await.credentials.get(&id).cloned()) })
    }

    fn count_credentials(&self, query: CredentialQuery) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.credentials.values().filter(|c| query.matches(c)).count())
        })
    }

    fn insert_credential(&self, mut credential: Credential) -> StoreFuture<'_, CredentialId> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let id = StoreState::next_id(&mut state.next_credential_id);
            credential.id = id;
            state.credentials.insert(id, credential);
            debug!(credential_id = id, "inserted credential");
            Ok(id)
        })
    }

    fn touch_credential(
        &self,
        id: CredentialId,
        group: ModelGroup,
        now: u64,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let c = state.credential_mut(id)?;
            c.last_used_at = Some(now);
            c.group_last_used.set(group, Some(now));
            c.total_requests += 1;
            Ok(())
        })
    }

    fn record_failure(&self, id: CredentialId, message: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let c = state.credential_mut(id)?;
            c.failed_requests += 1;
            c.last_error = Some(truncate(&message, MAX_ERROR_LEN));
            Ok(())
        })
    }

    fn set_active(
        &self,
        id: CredentialId,
        active: bool,
        last_error: Option<String>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let c = state.credential_mut(id)?;
            c.active = active;
            c.last_error = last_error.map(|e| truncate(&e, MAX_ERROR_LEN));
            Ok(())
        })
    }

    fn set_group_last_used(
        &self,
        id: CredentialId,
        group: ModelGroup,
        at: Option<u64>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.credential_mut(id)?.group_last_used.set(group, at);
            Ok(())
        })
    }

    fn set_access_token(
        &self,
        id: CredentialId,
        sealed: String,
        expires_at: Option<u64>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let c = state.credential_mut(id)?;
            c.sealed_access_token = Some(sealed);
            c.access_expires_at = expires_at;
            Ok(())
        })
    }

    fn apply_updates(&self, updates: Vec<CredentialUpdate>) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut applied = 0;
            for update in updates {
                let Some(c) = state.credentials.get_mut(&update.id) else {
                    continue;
                };
                if let Some((sealed, expires_at)) = update.access_token {
                    c.sealed_access_token = Some(sealed);
                    c.access_expires_at = expires_at;
                }
                if let Some(active) = update.active {
                    c.active = active;
                }
                if let Some(tier) = update.tier {
                    c.tier = tier;
                }
                if let Some(last_error) = update.last_error {
                    c.last_error = last_error.map(|e| truncate(&e, MAX_ERROR_LEN));
                }
                applied += 1;
            }
            debug!(applied, "applied credential updates");
            Ok(applied)
        })
    }

    fn unlink_credential(&self, id: CredentialId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.credentials.contains_key(&id) {
                return Err(Error::NotFound(format!("credential {id}")));
            }
            let mut detached = 0usize;
            for entry in state.usage.values_mut().flatten() {
                if entry.credential_id == Some(id) {
                    entry.credential_id = None;
                    detached += 1;
                }
            }
            state.credentials.remove(&id);
            debug!(credential_id = id, detached, "removed credential");
            Ok(())
        })
    }

    fn set_reward_held(&self, id: CredentialId, held: bool) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let c = state.credential_mut(id)?;
            let changed = c.reward_held != held;
            c.reward_held = held;
            Ok(changed)
        })
    }

    fn get_user(&self, id: UserId) -> StoreFuture<'_, Option<User>> {
        Box::pin(async move { Ok(self.state.lock().await.users.get(&id).cloned()) })
    }

    fn find_user_by_key_digest(&self, digest: String) -> StoreFuture<'_, Option<User>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .users
                .values()
                .find(|u| u.api_key_digest == digest)
                .cloned())
        })
    }

    fn insert_user(&self, mut user: User) -> StoreFuture<'_, UserId> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state
                .users
                .values()
                .any(|u| u.api_key_digest == user.api_key_digest)
            {
                return Err(Error::Store(format!(
                    "user {} has an API key already in use",
                    user.name
                )));
            }
            let id = StoreState::next_id(&mut state.next_user_id);
            user.id = id;
            state.users.insert(id, user);
            Ok(id)
        })
    }

    fn adjust_bonus_quota(&self, id: UserId, delta: i64) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let user = state
                .users
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
            user.bonus_quota = user.bonus_quota.saturating_add_signed(delta);
            Ok(user.bonus_quota)
        })
    }

    fn insert_usage(&self, mut entry: UsageLogEntry) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let id = StoreState::next_id(&mut state.next_usage_id);
            entry.id = id;
            state.usage.entry(entry.user_id).or_default().push_back(entry);
            Ok(id)
        })
    }

    fn count_usage(&self, query: UsageQuery) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.user_usage(&query).count() as u64)
        })
    }

    fn list_usage(&self, query: UsageQuery) -> StoreFuture<'_, Vec<UsageLogEntry>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.user_usage(&query).cloned().collect())
        })
    }

    fn prune_usage(&self, before: u64) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut removed = 0;
            state.usage.retain(|_, entries| {
                let len = entries.len();
                entries.retain(|e| e.created_at >= before);
                removed += len - entries.len();
                !entries.is_empty()
            });
            debug!(removed, before, "pruned usage log");
            Ok(removed)
        })
    }

    fn put_job(&self, job: JobStatus) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().await.jobs.insert(job.id.clone(), job);
            Ok(())
        })
    }

    fn get_job(&self, id: String) -> StoreFuture<'_, Option<JobStatus>> {
        Box::pin(async move { Ok(self.state.lock().await.jobs.get(&id).cloned()) })
    }
}

/// Write the snapshot atomically with 0600 permissions.
async fn write_atomic(path: &Path, state: &StoreState) -> Result<()> {
    let json = serde_json::to_string(state)
        .map_err(|e| Error::Snapshot(format!("serializing store snapshot: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        Some(_) => Path::new("."),
        None => return Err(Error::Io("snapshot path has no parent directory".into())),
    };

    let tmp_path = dir.join(format!(".store.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp snapshot: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting snapshot permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp snapshot: {e}")))?;

    debug!(path = %path.display(), "persisted store snapshot");
    Ok(())
}
