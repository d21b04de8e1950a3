//! Upstream error classification
//!
//! Maps (HTTP status, response text) to a category plus two decisions:
//! whether another credential may succeed (`retryable`) and whether this
//! credential is broken (`disable`). Status rules are checked first, then
//! text fallbacks, then an embedded upstream status code. Pure: the same
//! input always yields the same classification.

use std::sync::LazyLock;
use std::time::Duration;

use provider::{Classification, ErrorCategory, UpstreamError};
use regex::Regex;

/// Delay assumed for a 429 that names no retry delay.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

const SAFETY_PATTERNS: &[&str] = &["safety", "blocked", "harm", "filter"];

const PERIODIC_QUOTA_PATTERNS: &[&str] = &["per day", "daily", "quota"];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "etimedout"];

const NETWORK_PATTERNS: &[&str] = &[
    "econnreset",
    "connection reset",
    "socket hang up",
    "econnrefused",
    "connection refused",
    "network error",
    "connectionreset",
    "enotfound",
    "getaddrinfo",
];

static UPSTREAM_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""code"\s*:\s*"([A-Z_]+)""#).expect("Invalid upstream code regex")
});

static RETRY_DELAY_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""retryDelay"\s*:\s*"(\d+(?:\.\d+)?)s?""#).expect("Invalid retryDelay regex")
});

static RETRY_AFTER_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry\s+after\s+(\d+)\s*s").expect("Invalid retry-after text regex")
});

static SECONDS_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*seconds?").expect("Invalid seconds text regex"));

fn rule(category: ErrorCategory, code: &str, retryable: bool, disable: bool) -> Classification {
    Classification {
        category,
        code: code.to_string(),
        retryable,
        disable,
    }
}

fn contains_any(text: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| text.contains(p))
}

/// Classify an upstream failure by status and body text.
pub fn classify(status: u16, text: &str) -> Classification {
    let lower = text.to_lowercase();

    match status {
        401 => return rule(ErrorCategory::Auth, "UNAUTHENTICATED", false, true),
        403 => {
            if lower.contains("permission_denied") {
                return rule(ErrorCategory::Auth, "PERMISSION_DENIED", false, true);
            }
            if lower.contains("quota") || lower.contains("limit") {
                return rule(ErrorCategory::QuotaExhausted, "QUOTA_EXCEEDED", false, false);
            }
            if lower.contains("billing") {
                return rule(ErrorCategory::Auth, "BILLING_DISABLED", false, true);
            }
            return rule(ErrorCategory::Auth, "FORBIDDEN", false, true);
        }
        429 => {
            if contains_any(&lower, PERIODIC_QUOTA_PATTERNS) {
                return rule(ErrorCategory::QuotaExhausted, "DAILY_QUOTA_EXCEEDED", false, false);
            }
            return rule(ErrorCategory::RateLimit, "RESOURCE_EXHAUSTED", true, false);
        }
        400 => {
            if contains_any(&lower, SAFETY_PATTERNS) {
                return rule(ErrorCategory::ContentFilter, "SAFETY_BLOCKED", false, false);
            }
            if lower.contains("model") && (lower.contains("not found") || lower.contains("not exist"))
            {
                return rule(ErrorCategory::ModelError, "MODEL_NOT_FOUND", false, false);
            }
            if lower.contains("invalid") && lower.contains("argument") {
                return rule(ErrorCategory::InvalidRequest, "INVALID_ARGUMENT", false, false);
            }
            return rule(ErrorCategory::InvalidRequest, "BAD_REQUEST", false, false);
        }
        404 => return rule(ErrorCategory::ModelError, "NOT_FOUND", true, false),
        s if s >= 500 => return rule(ErrorCategory::Upstream, &format!("HTTP_{s}"), true, false),
        _ => {}
    }

    if contains_any(&lower, TIMEOUT_PATTERNS) {
        return rule(ErrorCategory::Timeout, "REQUEST_TIMEOUT", true, false);
    }
    if contains_any(&lower, NETWORK_PATTERNS) {
        return rule(ErrorCategory::Network, "CONNECTION_ERROR", true, false);
    }
    if lower.contains("token") && (lower.contains("refresh") || lower.contains("expired")) {
        return rule(ErrorCategory::Token, "TOKEN_REFRESH_FAILED", false, true);
    }

    if let Some(code) = UPSTREAM_CODE.captures(text).and_then(|c| c.get(1)) {
        if let Some(category) = upstream_code_category(code.as_str()) {
            let retryable = matches!(
                category,
                ErrorCategory::RateLimit | ErrorCategory::Upstream | ErrorCategory::Timeout
            );
            return rule(category, code.as_str(), retryable, category == ErrorCategory::Auth);
        }
    }

    rule(ErrorCategory::Unknown, "UNKNOWN", true, false)
}

/// Classify an `UpstreamError` value.
pub fn classify_error(err: &UpstreamError) -> Classification {
    classify(err.status, &err.body)
}

fn upstream_code_category(code: &str) -> Option<ErrorCategory> {
    Some(match code {
        "RESOURCE_EXHAUSTED" => ErrorCategory::RateLimit,
        "INVALID_ARGUMENT" | "FAILED_PRECONDITION" => ErrorCategory::InvalidRequest,
        "NOT_FOUND" => ErrorCategory::ModelError,
        "PERMISSION_DENIED" | "UNAUTHENTICATED" => ErrorCategory::Auth,
        "INTERNAL" | "UNAVAILABLE" => ErrorCategory::Upstream,
        "DEADLINE_EXCEEDED" => ErrorCategory::Timeout,
        "CANCELLED" => ErrorCategory::Unknown,
        _ => return None,
    })
}

/// Retry delay a 429 asks for, if it names one.
///
/// Sources in order: `Retry-After` header, embedded `"retryDelay": "Ns"`,
/// `retry after N s` text, `N second(s)` text.
pub fn parse_retry_delay(err: &UpstreamError) -> Option<Duration> {
    if let Some(secs) = err
        .header("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }

    if let Some(secs) = RETRY_DELAY_FIELD
        .captures(&err.body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Some(Duration::from_millis((secs * 1000.0).ceil() as u64));
    }

    [&*RETRY_AFTER_TEXT, &*SECONDS_TEXT].iter().find_map(|re| {
        re.captures(&err.body)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .map(Duration::from_secs)
    })
}
