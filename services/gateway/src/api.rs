//! Client-facing API: authentication, request translation and error bodies
//!
//! Clients authenticate with `Authorization: Bearer <gateway key>`. The key
//! is only ever compared by digest. Chat requests are translated into the
//! backend's `contents` shape and handed to the orchestrator; completed
//! replies are returned as the backend produced them, streamed replies as
//! server-sent events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use credential_pool::{
    CompletionBody, CompletionRequest, GatewayError, ModelGroup, Orchestrator, QuotaEngine, Store,
    User, digest_api_key, now_millis,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::metrics::{record_rejection, record_request};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Shared state for client-facing handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub orchestrator: Arc<Orchestrator>,
    pub quota: Arc<QuotaEngine>,
}

/// JSON error body with content type, matching every error the gateway emits.
pub fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn gateway_error_response(err: &GatewayError, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = error_response(status, err.kind(), &err.to_string(), request_id);
    if let GatewayError::RateLimited { .. } = err {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
    }
    response
}

/// Resolve the bearer key to a user, or the response to send instead.
async fn authenticate(
    store: &dyn Store,
    headers: &HeaderMap,
    request_id: &str,
) -> Result<User, Response> {
    let key = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|k| !k.is_empty());

    let Some(key) = key else {
        record_rejection("unauthorized");
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing bearer API key",
            request_id,
        ));
    };

    match store.find_user_by_key_digest(digest_api_key(key)).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => {
            record_rejection("unauthorized");
            Err(error_response(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "invalid API key",
                request_id,
            ))
        }
        Err(e) => {
            warn!(error = %e, "user lookup failed");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "user lookup failed",
                request_id,
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

impl ChatRequest {
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MODEL)
    }
}

/// Plain text of a message: a string, or the text parts of a part list.
fn message_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Backend request body for a chat request.
///
/// System messages become `systemInstruction`, assistant turns use the
/// `model` role, and sampling options map into `generationConfig`.
pub fn backend_payload(request: &ChatRequest) -> Result<Value, String> {
    if request.messages.is_empty() {
        return Err("messages must not be empty".into());
    }

    let mut system = Vec::new();
    let mut contents = Vec::new();
    for message in &request.messages {
        let text = message_text(&message.content);
        match message.role.as_str() {
            "system" | "developer" => system.push(json!({ "text": text })),
            role => {
                let role = if role == "assistant" { "model" } else { "user" };
                contents.push(json!({ "role": role, "parts": [{ "text": text }] }));
            }
        }
    }
    if contents.is_empty() {
        return Err("at least one non-system message is required".into());
    }

    let mut payload = json!({
        "model": request.model(),
        "contents": contents,
    });
    if !system.is_empty() {
        payload["systemInstruction"] = json!({ "parts": system });
    }

    let mut generation = serde_json::Map::new();
    if let Some(t) = request.temperature {
        generation.insert("temperature".into(), t.into());
    }
    if let Some(p) = request.top_p {
        generation.insert("topP".into(), p.into());
    }
    if let Some(n) = request.max_tokens {
        generation.insert("maxOutputTokens".into(), n.into());
    }
    if !generation.is_empty() {
        payload["generationConfig"] = Value::Object(generation);
    }
    Ok(payload)
}

/// SSE frame reporting a failure after the stream has started.
fn stream_error_frame(message: &str) -> Bytes {
    let event = json!({ "error": { "type": "upstream_error", "message": message } });
    Bytes::from(format!("data: {event}\n\n"))
}

/// POST /v1/chat/completions
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn chat_completions(
    state: &ApiState,
    headers: &HeaderMap,
    body: Bytes,
    request_id: String,
) -> Response {
    let started = std::time::Instant::now();
    let response = complete(state, headers, body, &request_id).await;
    record_request(response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

async fn complete(state: &ApiState, headers: &HeaderMap, body: Bytes, request_id: &str) -> Response {
    let user = match authenticate(state.store.as_ref(), headers, request_id).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    let chat: ChatRequest = match serde_json::from_slice(&body) {
        Ok(chat) => chat,
        Err(e) => {
            record_rejection("invalid_request");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };
    let payload = match backend_payload(&chat) {
        Ok(payload) => payload,
        Err(message) => {
            record_rejection("invalid_request");
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", &message, request_id);
        }
    };

    debug!(user_id = user.id, model = chat.model(), stream = chat.stream, "chat request");
    let request = CompletionRequest {
        user_id: user.id,
        model: chat.model().to_string(),
        payload,
        stream: chat.stream,
        request_id: request_id.to_string(),
    };

    let completion = match state.orchestrator.complete(request).await {
        Ok(completion) => completion,
        Err(err) => {
            record_rejection(err.kind());
            return gateway_error_response(&err, request_id);
        }
    };

    let mut response = match completion.body {
        CompletionBody::Complete(value) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            value.to_string(),
        )
            .into_response(),
        CompletionBody::Stream(handle) => {
            let events = handle.map(|item| {
                Ok::<_, Infallible>(match item {
                    Ok(chunk) => chunk,
                    Err(e) => stream_error_frame(&e.to_string()),
                })
            });
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                Body::from_stream(events),
            )
                .into_response()
        }
    };

    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", v);
    }
    if let Ok(v) = HeaderValue::from_str(&completion.usage.target) {
        headers.insert("x-gateway-target", v);
    }
    headers.insert("x-gateway-attempts", HeaderValue::from(completion.usage.attempts));
    response
}

/// GET /v1/usage: today's usage and ceilings for the calling user.
pub async fn usage(state: &ApiState, headers: &HeaderMap, request_id: String) -> Response {
    let user = match authenticate(state.store.as_ref(), headers, &request_id).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    match usage_summary(&state.quota, &user).await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response(),
        Err(e) => {
            warn!(user_id = user.id, error = %e, "usage summary failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "usage summary failed",
                &request_id,
            )
        }
    }
}

async fn usage_summary(quota: &QuotaEngine, user: &User) -> credential_pool::Result<Value> {
    let today = quota.usage(user.id, now_millis()).await?;
    let mut groups = serde_json::Map::new();
    for group in ModelGroup::ALL {
        let limit = quota.ceiling(user, group).await?;
        groups.insert(
            group.as_str().to_string(),
            json!({ "used": today.get(group), "limit": limit }),
        );
    }
    Ok(json!({
        "user": user.name,
        "privileged": user.privileged,
        "used": today.total(),
        "allowance": user.daily_allowance(),
        "groups": groups,
    }))
}
