//! Pool data model: credentials, users, usage log entries, job status.
//!
//! Timestamps are unix milliseconds throughout.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use provider::ErrorCategory;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type CredentialId = u64;
pub type UserId = u64;

/// Capability class of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "2.5")]
    Gemini25,
    #[serde(rename = "3")]
    Gemini3,
}

/// Bucket a requested model is metered and cooled down under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelGroup {
    Flash,
    Pro,
    Tier3,
}

impl ModelGroup {
    pub const ALL: [ModelGroup; 3] = [ModelGroup::Flash, ModelGroup::Pro, ModelGroup::Tier3];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelGroup::Flash => "flash",
            ModelGroup::Pro => "pro",
            ModelGroup::Tier3 => "tier3",
        }
    }

    /// Tier a credential must have to serve this group, if any.
    pub fn required_tier(&self) -> Option<Tier> {
        match self {
            ModelGroup::Tier3 => Some(Tier::Gemini3),
            ModelGroup::Flash | ModelGroup::Pro => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

/// Process-wide policy for drawing on credentials a user does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolVisibilityMode {
    Private,
    Tier3Shared,
    #[default]
    FullShared,
}

/// How the stored secret turns into an access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    /// Static API key, used as-is
    ApiKey,
    /// OAuth refresh token exchanged at the token endpoint
    OAuth,
}

/// Per-group last-use timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTimestamps {
    pub flash: Option<u64>,
    pub pro: Option<u64>,
    pub tier3: Option<u64>,
}

impl GroupTimestamps {
    pub fn get(&self, group: ModelGroup) -> Option<u64> {
        match group {
            ModelGroup::Flash => self.flash,
            ModelGroup::Pro => self.pro,
            ModelGroup::Tier3 => self.tier3,
        }
    }

    pub fn set(&mut self, group: ModelGroup, at: Option<u64>) {
        match group {
            ModelGroup::Flash => self.flash = at,
            ModelGroup::Pro => self.pro = at,
            ModelGroup::Tier3 => self.tier3 = at,
        }
    }
}

/// A stored upstream authorization.
///
/// Secret material is held sealed (see `common::Cipher`); the pool only
/// opens it inside the token broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    /// None = system-owned
    pub owner_id: Option<UserId>,
    #[serde(default)]
    pub label: Option<String>,
    pub kind: SecretKind,
    /// Sealed API key or refresh token
    pub sealed_secret: String,
    #[serde(default)]
    pub sealed_access_token: Option<String>,
    #[serde(default)]
    pub access_expires_at: Option<u64>,
    /// Credential-specific OAuth client, overriding the system default
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub sealed_client_secret: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    pub tier: Tier,
    pub visibility: Visibility,
    pub active: bool,
    /// The owner's donation reward is currently credited for this credential
    #[serde(default)]
    pub reward_held: bool,
    #[serde(default)]
    pub last_used_at: Option<u64>,
    #[serde(default)]
    pub group_last_used: GroupTimestamps,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub failed_requests: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub created_at: u64,
}

impl Credential {
    /// A new, never-used credential. The store assigns the id on insert.
    pub fn new(kind: SecretKind, sealed_secret: String, tier: Tier, visibility: Visibility) -> Self {
        Self {
            id: 0,
            owner_id: None,
            label: None,
            kind,
            sealed_secret,
            sealed_access_token: None,
            access_expires_at: None,
            client_id: None,
            sealed_client_secret: None,
            project_id: None,
            tier,
            visibility,
            active: true,
            reward_held: false,
            last_used_at: None,
            group_last_used: GroupTimestamps::default(),
            total_requests: 0,
            failed_requests: 0,
            last_error: None,
            created_at: 0,
        }
    }

    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }

    /// Eligible for selection at all: active, with a backend project.
    pub fn is_selectable(&self) -> bool {
        self.active
            && self
                .project_id
                .as_deref()
                .is_some_and(|p| !p.trim().is_empty())
    }

    /// Whether this credential may serve a model group.
    pub fn serves(&self, group: ModelGroup) -> bool {
        group.required_tier().is_none_or(|tier| self.tier == tier)
    }
}

/// Explicit per-group ceilings; 0 means "derive from credential count".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierOverrides {
    pub flash: u64,
    pub pro: u64,
    pub tier3: u64,
}

impl TierOverrides {
    pub fn get(&self, group: ModelGroup) -> u64 {
        match group {
            ModelGroup::Flash => self.flash,
            ModelGroup::Pro => self.pro,
            ModelGroup::Tier3 => self.tier3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    /// SHA-256 of the user's gateway API key, see `digest_api_key`
    pub api_key_digest: String,
    pub base_quota: u64,
    #[serde(default)]
    pub bonus_quota: u64,
    #[serde(default)]
    pub overrides: TierOverrides,
    /// Exempt from quota and rate checks
    #[serde(default)]
    pub privileged: bool,
}

impl User {
    pub fn new(name: impl Into<String>, api_key: &str, base_quota: u64) -> Self {
        Self {
            id: 0,
            name: name.into(),
            api_key_digest: digest_api_key(api_key),
            base_quota,
            bonus_quota: 0,
            overrides: TierOverrides::default(),
            privileged: false,
        }
    }

    /// Daily allowance across all groups.
    pub fn daily_allowance(&self) -> u64 {
        self.base_quota.saturating_add(self.bonus_quota)
    }
}

/// Digest under which a gateway API key is stored and looked up.
pub fn digest_api_key(api_key: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(api_key.trim().as_bytes()))
}

/// Immutable record of one logical request's outcome on a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    #[serde(default)]
    pub id: u64,
    pub user_id: UserId,
    /// None once the credential has been removed
    pub credential_id: Option<CredentialId>,
    pub model: String,
    pub group: ModelGroup,
    pub target: String,
    /// HTTP status of the final attempt, 0 for transport failures
    pub status: u16,
    pub success: bool,
    pub latency_ms: u64,
    pub attempts: u32,
    #[serde(default)]
    pub category: Option<ErrorCategory>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Refresh,
    Verify,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Refresh => "refresh",
            JobKind::Verify => "verify",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Done,
}

/// Persisted progress of a background maintenance job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub kind: JobKind,
    pub state: JobState,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub started_at: u64,
    #[serde(default)]
    pub finished_at: Option<u64>,
}
