//! reqwest-backed provider for Code Assist style endpoints.
//!
//! Complete calls POST `{base}/v1internal:generateContent`, streamed calls
//! POST `{base}/v1internal:streamGenerateContent?alt=sse`. The request body
//! wraps the caller's payload with the credential's project id.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::HeaderMap;
use tracing::debug;

use crate::{Provider, Reply, SendFuture, UpstreamError};

/// HTTP backend target.
pub struct HttpProvider {
    name: String,
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        client: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            timeout,
        }
    }

    fn endpoint(&self, stream: bool) -> String {
        if stream {
            format!("{}/v1internal:streamGenerateContent?alt=sse", self.base_url)
        } else {
            format!("{}/v1internal:generateContent", self.base_url)
        }
    }

    fn map_transport_error(&self, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::timed_out(self.timeout.as_secs())
        } else {
            UpstreamError::network(e)
        }
    }
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(
        &'a self,
        access_token: &'a str,
        project_id: &'a str,
        payload: &'a serde_json::Value,
        stream: bool,
    ) -> SendFuture<'a> {
        Box::pin(async move {
            let url = self.endpoint(stream);
            let body = serde_json::json!({
                "project": project_id,
                "request": payload,
            });

            let response = self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await
                .map_err(|e| self.map_transport_error(e))?;

            let status = response.status();
            if !status.is_success() {
                let headers = header_map(response.headers());
                let text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                debug!(target_name = %self.name, status = status.as_u16(), "upstream returned error status");
                return Err(UpstreamError {
                    status: status.as_u16(),
                    body: text,
                    headers,
                });
            }

            if stream {
                let chunks = response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(UpstreamError::network));
                return Ok(Reply::Stream(Box::pin(chunks)));
            }

            response
                .json::<serde_json::Value>()
                .await
                .map(Reply::Complete)
                .map_err(|e| UpstreamError::new(status.as_u16(), format!("invalid upstream JSON: {e}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use tokio::net::TcpListener;

    async fn start_mock(app: axum::Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn provider(url: &str) -> HttpProvider {
        HttpProvider::new("code-assist", url, reqwest::Client::new(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn complete_call_wraps_payload_and_sends_bearer() {
        let app = axum::Router::new().fallback(
            |uri: axum::http::Uri,
             headers: AxumHeaders,
             axum::Json(body): axum::Json<serde_json::Value>| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                axum::Json(serde_json::json!({ "path": uri.path(), "auth": auth, "echo": body }))
            },
        );
        let url = start_mock(app).await;

        let payload = serde_json::json!({"model": "gemini-2.5-flash", "messages": [{"role": "user", "content": "hi"}]});
        let reply = provider(&url)
            .send("ya29.token", "proj-1", &payload, false)
            .await
            .unwrap();

        let Reply::Complete(json) = reply else {
            panic!("expected complete reply");
        };
        assert_eq!(json["path"], "/v1internal:generateContent");
        assert_eq!(json["auth"], "Bearer ya29.token");
        assert_eq!(json["echo"]["project"], "proj-1");
        assert_eq!(json["echo"]["request"]["model"], "gemini-2.5-flash");
    }

    #[tokio::test]
    async fn error_status_carries_body_and_headers() {
        let app = axum::Router::new().fallback(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", "12")],
                r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#,
            )
        });
        let url = start_mock(app).await;

        let err = provider(&url)
            .send("t", "p", &serde_json::json!({}), false)
            .await
            .unwrap_err();
        assert_eq!(err.status, 429);
        assert!(err.body.contains("RESOURCE_EXHAUSTED"));
        assert_eq!(err.header("Retry-After"), Some("12"));
    }

    #[tokio::test]
    async fn stream_call_yields_body_chunks() {
        let app = axum::Router::new()
            .fallback(|| async { "data: {\"a\":1}\n\ndata: {\"b\":2}\n\n" });
        let url = start_mock(app).await;

        let reply = provider(&url)
            .send("t", "p", &serde_json::json!({}), true)
            .await
            .unwrap();
        let Reply::Stream(mut stream) = reply else {
            panic!("expected stream reply");
        };
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(
            String::from_utf8(collected).unwrap(),
            "data: {\"a\":1}\n\ndata: {\"b\":2}\n\n"
        );
    }

    #[tokio::test]
    async fn dead_upstream_is_a_network_error() {
        let err = provider("http://127.0.0.1:1")
            .send("t", "p", &serde_json::json!({}), false)
            .await
            .unwrap_err();
        assert_eq!(err.status, 0);
        assert!(err.body.starts_with("network error"), "got: {}", err.body);
    }

    #[test]
    fn endpoint_selection() {
        let p = provider("https://cloudcode-pa.googleapis.com/");
        assert_eq!(
            p.endpoint(false),
            "https://cloudcode-pa.googleapis.com/v1internal:generateContent"
        );
        assert_eq!(
            p.endpoint(true),
            "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
    }
}
