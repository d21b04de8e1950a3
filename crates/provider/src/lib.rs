//! Upstream backend abstraction
//!
//! Defines the `Provider` trait the retry orchestrator calls once per attempt,
//! plus the error taxonomy shared between the classifier and the usage log.
//! The wire format of the generative backend is opaque here: a call either
//! yields a reply (complete JSON or a byte stream) or an `UpstreamError`
//! carrying the HTTP status, body text and response headers.

pub mod http;

pub use http::HttpProvider;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

/// Category an upstream failure falls into.
///
/// Serialized with the upper-case names stored in usage logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    #[serde(rename = "AUTH_ERROR")]
    Auth,
    #[serde(rename = "RATE_LIMIT")]
    RateLimit,
    #[serde(rename = "QUOTA_EXHAUSTED")]
    QuotaExhausted,
    #[serde(rename = "INVALID_REQUEST")]
    InvalidRequest,
    #[serde(rename = "MODEL_ERROR")]
    ModelError,
    #[serde(rename = "CONTENT_FILTER")]
    ContentFilter,
    #[serde(rename = "NETWORK_ERROR")]
    Network,
    #[serde(rename = "UPSTREAM_ERROR")]
    Upstream,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "TOKEN_ERROR")]
    Token,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Auth => "AUTH_ERROR",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::QuotaExhausted => "QUOTA_EXHAUSTED",
            ErrorCategory::InvalidRequest => "INVALID_REQUEST",
            ErrorCategory::ModelError => "MODEL_ERROR",
            ErrorCategory::ContentFilter => "CONTENT_FILTER",
            ErrorCategory::Network => "NETWORK_ERROR",
            ErrorCategory::Upstream => "UPSTREAM_ERROR",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::Token => "TOKEN_ERROR",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one upstream failure.
///
/// - `retryable`: another credential may succeed where this one failed
/// - `disable`: the credential itself is broken and must leave the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    /// Finer-grained code, e.g. `UNAUTHENTICATED`, `HTTP_503`, `SAFETY_BLOCKED`
    pub code: String,
    pub retryable: bool,
    pub disable: bool,
}

/// Failure raised by a backend call.
///
/// Transport-level failures (connect, timeout, broken stream) use status 0 and
/// describe themselves in `body` so text-based classification still applies.
#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream returned {status}: {body}")]
pub struct UpstreamError {
    pub status: u16,
    pub body: String,
    /// Response headers, lower-cased names
    pub headers: HashMap<String, String>,
}

impl UpstreamError {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Deadline exceeded at the backend-call boundary.
    pub fn timed_out(after_secs: u64) -> Self {
        Self::new(0, format!("request timed out after {after_secs}s"))
    }

    /// Connection-level failure that never produced a response.
    pub fn network(detail: impl fmt::Display) -> Self {
        Self::new(0, format!("network error: {detail}"))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Streamed response body, chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// Successful backend reply.
pub enum Reply {
    Complete(serde_json::Value),
    Stream(ByteStream),
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Complete(value) => f.debug_tuple("Complete").field(value).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Future returned by `Provider::send`.
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<Reply, UpstreamError>> + Send + 'a>>;

/// One independently configured backend target.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Provider>`).
pub trait Provider: Send + Sync {
    /// Identifier for logging and usage records (e.g. "code-assist")
    fn name(&self) -> &str;

    /// Call the backend with an access token on behalf of a project.
    fn send<'a>(
        &'a self,
        access_token: &'a str,
        project_id: &'a str,
        payload: &'a serde_json::Value,
        stream: bool,
    ) -> SendFuture<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_names_match_serialized_form() {
        for category in [
            ErrorCategory::Auth,
            ErrorCategory::RateLimit,
            ErrorCategory::QuotaExhausted,
            ErrorCategory::Token,
            ErrorCategory::Unknown,
        ] {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category.as_str()));
        }
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let err = UpstreamError::new(429, "slow down").with_header("Retry-After", "17");
        assert_eq!(err.header("retry-after"), Some("17"));
        assert_eq!(err.header("RETRY-AFTER"), Some("17"));
        assert_eq!(err.header("x-missing"), None);
    }

    #[test]
    fn transport_failures_describe_themselves() {
        assert_eq!(UpstreamError::timed_out(30).status, 0);
        assert!(UpstreamError::timed_out(30).body.contains("timed out"));
        assert!(
            UpstreamError::network("connection refused")
                .body
                .starts_with("network error")
        );
    }
}
