//! Error types for pool operations

use provider::ErrorCategory;

/// Errors from the store and other internal pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not configured: {0}")]
    NotConfigured(&'static str),

    #[error("cipher error: {0}")]
    Cipher(#[from] common::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// User-facing outcome of `admit` / `complete`.
///
/// The three families stay distinguishable: pre-admission rejections
/// (`RateLimited`, `QuotaExceeded`), admission-time "nothing to use"
/// (`NoCredential`, `NoTierAccess`, `NoPublicAccess`) and execution-time
/// failures (`AllRetriesExhausted`, `Upstream`).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("rate limit exceeded: {limit} requests per minute")]
    RateLimited { limit: u64 },

    #[error("daily {scope} quota exceeded ({used}/{limit})")]
    QuotaExceeded { scope: String, used: u64, limit: u64 },

    #[error("no credential is currently available, try again later")]
    NoCredential,

    #[error("model {model} needs a tier 3 credential and none is available")]
    NoTierAccess { model: String },

    #[error("you have no usable credential; donate one to the public pool to draw from it")]
    NoPublicAccess,

    #[error("all credentials failed after {attempts} attempts: {last_error}")]
    AllRetriesExhausted { attempts: u32, last_error: String },

    #[error("upstream rejected the request ({category}, HTTP {status}) after {attempts} attempts: {message}")]
    Upstream {
        status: u16,
        category: ErrorCategory,
        attempts: u32,
        message: String,
    },

    #[error("model {0} is not served by any configured target")]
    UnsupportedModel(String),

    #[error("unknown user {0}")]
    UnknownUser(u64),

    #[error("internal error: {0}")]
    Internal(#[from] Error),
}

impl GatewayError {
    /// HTTP status the gateway answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::RateLimited { .. } | GatewayError::QuotaExceeded { .. } => 429,
            GatewayError::NoCredential
            | GatewayError::NoTierAccess { .. }
            | GatewayError::NoPublicAccess
            | GatewayError::AllRetriesExhausted { .. } => 503,
            GatewayError::Upstream { status, .. } if (400..500).contains(status) => *status,
            GatewayError::Upstream { .. } => 502,
            GatewayError::UnsupportedModel(_) => 400,
            GatewayError::UnknownUser(_) => 401,
            GatewayError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable error type.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::QuotaExceeded { .. } => "quota_exceeded",
            GatewayError::NoCredential => "no_credential",
            GatewayError::NoTierAccess { .. } => "no_tier_access",
            GatewayError::NoPublicAccess => "no_public_access",
            GatewayError::AllRetriesExhausted { .. } => "all_retries_exhausted",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::UnsupportedModel(_) => "unsupported_model",
            GatewayError::UnknownUser(_) => "unknown_user",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}
