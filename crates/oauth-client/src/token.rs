//! OAuth token refresh
//!
//! POSTs `grant_type=refresh_token` to the token endpoint. Google answers a
//! revoked or foreign refresh token with 400 `invalid_grant`, and a bad client
//! pair with 401 `invalid_client`; both are reported as `InvalidCredentials`
//! so callers can take the credential out of rotation.

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_EXPIRES_IN_SECS;
use crate::error::{Error, Result};

/// OAuth client id/secret used for the exchange.
#[derive(Debug, Clone, Copy)]
pub struct ClientPair<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a str,
}

/// Response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time. Google does not
/// rotate refresh tokens on refresh, so `refresh_token` is usually absent.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

fn default_expires_in() -> u64 {
    DEFAULT_EXPIRES_IN_SECS
}

/// Error codes that mean the grant itself is unusable.
const PERMANENT_ERROR_CODES: &[&str] = &["invalid_grant", "invalid_client", "unauthorized_client"];

/// Refresh an access token using a refresh token and client pair.
pub async fn refresh_access_token(
    client: &reqwest::Client,
    endpoint: &str,
    refresh: &str,
    pair: ClientPair<'_>,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", pair.client_id),
            ("client_secret", pair.client_secret),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        let code = status.as_u16();
        let grant_rejected = PERMANENT_ERROR_CODES.iter().any(|c| body.contains(c));
        if code == 401 || code == 403 || (code == 400 && grant_rejected) {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenRefresh(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenRefresh(format!("invalid refresh response: {e}")))
}
