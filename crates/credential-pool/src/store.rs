//! Storage seam for credentials, users, usage logs and job status
//!
//! The pool, quota engine, rate limiter and maintenance jobs only talk to
//! storage through `Store`, so a SQL backend can replace `MemoryStore`
//! without touching selection or retry logic. Mutations that the pool
//! relies on for fairness (`touch_credential`) are single store calls so
//! they stay atomic with respect to each other.

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::model::{
    Credential, CredentialId, JobStatus, ModelGroup, Tier, UsageLogEntry, User, UserId, Visibility,
};

/// Future returned by `Store` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Longest `last_error` kept on a credential.
pub const MAX_ERROR_LEN: usize = 1000;

/// Ownership filter for credential listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    /// Credentials owned by this user
    Owned(UserId),
    /// Owned by this user, or public
    OwnedOrPublic(UserId),
    Public,
}

/// Credential listing filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialQuery {
    pub scope: Scope,
    pub tier: Option<Tier>,
    pub visibility: Option<Visibility>,
    pub active_only: bool,
}

impl CredentialQuery {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            tier: None,
            visibility: None,
            active_only: false,
        }
    }

    pub fn all() -> Self {
        Self::new(Scope::All)
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn active(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn matches(&self, credential: &Credential) -> bool {
        let in_scope = match self.scope {
            Scope::All => true,
            Scope::Owned(user) => credential.owner_id == Some(user),
            Scope::OwnedOrPublic(user) => {
                credential.owner_id == Some(user) || credential.is_public()
            }
            Scope::Public => credential.is_public(),
        };
        in_scope
            && self.tier.is_none_or(|t| credential.tier == t)
            && self.visibility.is_none_or(|v| credential.visibility == v)
            && (!self.active_only || credential.active)
    }
}

/// Usage log filter. The window is `since..=until`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageQuery {
    pub user_id: UserId,
    pub since: u64,
    pub until: Option<u64>,
    /// None = every group
    pub groups: Option<Vec<ModelGroup>>,
    pub success_only: bool,
}

impl UsageQuery {
    pub fn new(user_id: UserId, since: u64) -> Self {
        Self {
            user_id,
            since,
            until: None,
            groups: None,
            success_only: false,
        }
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn group(mut self, group: ModelGroup) -> Self {
        self.groups.get_or_insert_with(Vec::new).push(group);
        self
    }

    pub fn successful(mut self) -> Self {
        self.success_only = true;
        self
    }

    pub fn matches(&self, entry: &UsageLogEntry) -> bool {
        entry.user_id == self.user_id
            && entry.created_at >= self.since
            && self.until.is_none_or(|u| entry.created_at <= u)
            && self
                .groups
                .as_ref()
                .is_none_or(|groups| groups.contains(&entry.group))
            && (!self.success_only || entry.success)
    }
}

/// One credential's share of a batched maintenance commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialUpdate {
    pub id: CredentialId,
    /// New sealed access token and its expiry
    pub access_token: Option<(String, Option<u64>)>,
    pub active: Option<bool>,
    /// Capability detected by verification
    pub tier: Option<Tier>,
    /// `Some(None)` clears the last error
    pub last_error: Option<Option<String>>,
}

/// Persistence for pool state.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Store>`).
pub trait Store: Send + Sync {
    fn list_credentials(&self, query: CredentialQuery) -> StoreFuture<'_, Vec<Credential>>;

    fn get_credential(&self, id: CredentialId) -> StoreFuture<'_, Option<Credential>>;

    fn count_credentials(&self, query: CredentialQuery) -> StoreFuture<'_, usize>;

    /// Insert and return the assigned id.
    fn insert_credential(&self, credential: Credential) -> StoreFuture<'_, CredentialId>;

    /// Record a use: `last_used_at`, the group timestamp and `total_requests`
    /// move together.
    fn touch_credential(
        &self,
        id: CredentialId,
        group: ModelGroup,
        now: u64,
    ) -> StoreFuture<'_, ()>;

    /// Bump `failed_requests` and remember the error (truncated).
    fn record_failure(&self, id: CredentialId, message: String) -> StoreFuture<'_, ()>;

    fn set_active(
        &self,
        id: CredentialId,
        active: bool,
        last_error: Option<String>,
    ) -> StoreFuture<'_, ()>;

    fn set_group_last_used(
        &self,
        id: CredentialId,
        group: ModelGroup,
        at: Option<u64>,
    ) -> StoreFuture<'_, ()>;

    fn set_access_token(
        &self,
        id: CredentialId,
        sealed: String,
        expires_at: Option<u64>,
    ) -> StoreFuture<'_, ()>;

    /// Apply several updates as one write. Unknown ids are skipped.
    fn apply_updates(&self, updates: Vec<CredentialUpdate>) -> StoreFuture<'_, usize>;

    /// Remove a credential. Usage entries that refer to it keep their history
    /// with the credential reference cleared.
    fn unlink_credential(&self, id: CredentialId) -> StoreFuture<'_, ()>;

    /// Set the credential's `reward_held` flag. Returns whether it changed,
    /// so a reward is paid or clawed back by exactly one caller.
    fn set_reward_held(&self, id: CredentialId, held: bool) -> StoreFuture<'_, bool>;

    fn get_user(&self, id: UserId) -> StoreFuture<'_, Option<User>>;

    fn find_user_by_key_digest(&self, digest: String) -> StoreFuture<'_, Option<User>>;

    fn insert_user(&self, user: User) -> StoreFuture<'_, UserId>;

    /// Add `delta` to a user's bonus quota, saturating at 0. Returns the new value.
    fn adjust_bonus_quota(&self, id: UserId, delta: i64) -> StoreFuture<'_, u64>;

    fn insert_usage(&self, entry: UsageLogEntry) -> StoreFuture<'_, u64>;

    fn count_usage(&self, query: UsageQuery) -> StoreFuture<'_, u64>;

    fn list_usage(&self, query: UsageQuery) -> StoreFuture<'_, Vec<UsageLogEntry>>;

    /// Drop usage entries created before `before`. Returns how many went.
    fn prune_usage(&self, before: u64) -> StoreFuture<'_, usize>;

    fn put_job(&self, job: JobStatus) -> StoreFuture<'_, ()>;

    fn get_job(&self, id: String) -> StoreFuture<'_, Option<JobStatus>>;
}

/// Cut an error message down to `max` characters on a char boundary.
pub fn truncate(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
