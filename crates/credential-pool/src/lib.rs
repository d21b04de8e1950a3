//! Multi-tenant credential pool for an LLM gateway
//!
//! Users draw on a pool of upstream credentials, their own and (depending on
//! the visibility mode) ones donated by others. Each request goes through:
//!
//! 1. Admission: sliding one-minute rate limit, then per-group daily quota
//! 2. Selection: least-recently-used credential the user may see, preferring
//!    ones not cooling down for the model group
//! 3. Token resolution: API key as-is, or OAuth access token (refreshed if
//!    close to expiry)
//! 4. Backend call under a deadline; failures are classified and fed back
//!    (disable broken credentials, align cooldown with upstream retry delay)
//! 5. Retry on another credential within the target's budget, then fall back
//!    to the next backend target
//! 6. Exactly one usage log entry per target that made an attempt
//!
//! Background maintenance refreshes OAuth tokens and verifies credentials in
//! bulk. All state lives behind the `Store` trait; `MemoryStore` keeps it in
//! memory with optional JSON snapshots.

pub mod broker;
pub mod classify;
pub mod cooldown;
pub mod error;
pub mod maintenance;
pub mod memory;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod pool;
pub mod quota;
pub mod rate_limit;
pub mod settings;
pub mod store;
pub mod usage;

pub use broker::{AccessToken, OAuthSettings, TokenBroker};
pub use classify::{classify, classify_error, parse_retry_delay};
pub use cooldown::ModelTable;
pub use error::{Error, GatewayError, Result};
pub use maintenance::{Maintenance, spawn_refresh_task};
pub use memory::MemoryStore;
pub use model::{
    Credential, CredentialId, JobKind, JobState, JobStatus, ModelGroup, PoolVisibilityMode,
    SecretKind, Tier, UsageLogEntry, User, UserId, Visibility, digest_api_key,
};
pub use notify::{Notifier, StateChange};
pub use orchestrator::{
    Completion, CompletionBody, CompletionRequest, Orchestrator, StreamHandle, Target, UsageRecord,
};
pub use pool::{CredentialPool, NoCandidateReason, Selection};
pub use quota::QuotaEngine;
pub use rate_limit::RateLimiter;
pub use settings::{
    CooldownSettings, MaintenanceSettings, QuotaSettings, RateLimitSettings, RetrySettings,
};
pub use store::Store;
pub use usage::{MIN_USAGE_RETENTION, PRUNE_INTERVAL, UsageLogger, spawn_usage_pruning};

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    let elapsed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
