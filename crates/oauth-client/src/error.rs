//! Error types for token endpoint operations

/// Errors from the OAuth token endpoint.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    /// The refresh token or client pair was rejected; retrying will not help.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
}

impl Error {
    /// Whether the failure is permanent for this credential.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::InvalidCredentials(_))
    }
}

/// Result alias for token operations.
pub type Result<T> = std::result::Result<T, Error>;
