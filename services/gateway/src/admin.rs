//! Admin API for users, credentials and maintenance jobs
//!
//! Runs on a separate listener (`server.admin_listen_addr`) with no
//! authentication of its own; keep it on a private interface.
//!
//! Endpoints:
//! - GET    /admin/pool               pool health summary
//! - GET    /admin/credentials        list credentials (never secrets)
//! - POST   /admin/credentials        onboard a credential
//! - DELETE /admin/credentials/{id}   remove a credential
//! - POST   /admin/users              register a user
//! - POST   /admin/jobs/{kind}        start a refresh or verify job
//! - GET    /admin/jobs/{id}          poll a job

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use common::{Cipher, Secret};
use credential_pool::store::CredentialQuery;
use credential_pool::{
    Credential, CredentialPool, JobKind, Maintenance, SecretKind, Store, Tier, User, Visibility,
    now_millis,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    store: Arc<dyn Store>,
    pool: Arc<CredentialPool>,
    maintenance: Arc<Maintenance>,
    cipher: Arc<dyn Cipher>,
    default_base_quota: u64,
}

impl AdminState {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<CredentialPool>,
        maintenance: Arc<Maintenance>,
        cipher: Arc<dyn Cipher>,
        default_base_quota: u64,
    ) -> Self {
        Self {
            store,
            pool,
            maintenance,
            cipher,
            default_base_quota,
        }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/pool", get(pool_status))
        .route("/admin/credentials", get(list_credentials).post(add_credential))
        .route("/admin/credentials/{id}", delete(delete_credential))
        .route("/admin/users", post(add_user))
        .route("/admin/jobs/{key}", post(start_job).get(job_status))
        .with_state(state)
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn admin_error(status: StatusCode, message: impl std::fmt::Display) -> Response {
    json_response(status, json!({ "error": message.to_string() }))
}

fn store_error(e: credential_pool::Error) -> Response {
    match e {
        credential_pool::Error::NotFound(what) => {
            admin_error(StatusCode::NOT_FOUND, format!("{what} not found"))
        }
        credential_pool::Error::NotConfigured(what) => {
            admin_error(StatusCode::CONFLICT, format!("{what} is not configured"))
        }
        other => {
            warn!(error = %other, "admin operation failed");
            admin_error(StatusCode::INTERNAL_SERVER_ERROR, other)
        }
    }
}

/// GET /admin/pool
async fn pool_status(State(state): State<AdminState>) -> Response {
    match state.pool.health(now_millis()).await {
        Ok(health) => json_response(StatusCode::OK, health),
        Err(e) => store_error(e),
    }
}

fn credential_summary(c: &Credential) -> Value {
    json!({
        "id": c.id,
        "owner_id": c.owner_id,
        "label": c.label,
        "kind": c.kind,
        "project_id": c.project_id,
        "tier": c.tier,
        "visibility": c.visibility,
        "active": c.active,
        "last_used_at": c.last_used_at,
        "total_requests": c.total_requests,
        "failed_requests": c.failed_requests,
        "last_error": c.last_error,
    })
}

/// GET /admin/credentials
async fn list_credentials(State(state): State<AdminState>) -> Response {
    match state.store.list_credentials(CredentialQuery::all()).await {
        Ok(mut credentials) => {
            credentials.sort_by_key(|c| c.id);
            let list: Vec<Value> = credentials.iter().map(credential_summary).collect();
            json_response(StatusCode::OK, json!({ "credentials": list }))
        }
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct NewCredential {
    kind: SecretKind,
    /// API key or OAuth refresh token
    secret: Secret<String>,
    #[serde(default)]
    owner_id: Option<u64>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    tier: Tier,
    visibility: Visibility,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<Secret<String>>,
}

impl NewCredential {
    fn seal(self, cipher: &dyn Cipher) -> common::Result<Credential> {
        let mut credential = Credential::new(
            self.kind,
            cipher.seal(self.secret.expose().trim())?,
            self.tier,
            self.visibility,
        );
        credential.owner_id = self.owner_id;
        credential.label = self.label;
        credential.project_id = self.project_id;
        credential.client_id = self.client_id;
        credential.sealed_client_secret = self
            .client_secret
            .map(|s| cipher.seal(s.expose().trim()))
            .transpose()?;
        credential.created_at = now_millis();
        Ok(credential)
    }
}

/// POST /admin/credentials
///
/// An owned public credential earns its owner the donation reward.
async fn add_credential(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<NewCredential>,
) -> Response {
    if body.secret.is_blank() {
        return admin_error(StatusCode::BAD_REQUEST, "secret must not be empty");
    }
    if let Some(owner) = body.owner_id {
        match state.store.get_user(owner).await {
            Ok(Some(_)) => {}
            Ok(None) => return admin_error(StatusCode::NOT_FOUND, format!("user {owner} not found")),
            Err(e) => return store_error(e),
        }
    }

    let credential = match body.seal(state.cipher.as_ref()) {
        Ok(credential) => credential,
        Err(e) => return admin_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    match state.pool.onboard(credential).await {
        Ok(id) => json_response(StatusCode::CREATED, json!({ "id": id })),
        Err(e) => store_error(e),
    }
}

/// DELETE /admin/credentials/{id}
async fn delete_credential(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    match state.pool.remove(id).await {
        Ok(()) => json_response(StatusCode::OK, json!({ "removed": id })),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct NewUser {
    name: String,
    api_key: Secret<String>,
    #[serde(default)]
    base_quota: Option<u64>,
    #[serde(default)]
    privileged: bool,
}

/// POST /admin/users
async fn add_user(State(state): State<AdminState>, axum::Json(body): axum::Json<NewUser>) -> Response {
    if body.name.trim().is_empty() || body.api_key.is_blank() {
        return admin_error(StatusCode::BAD_REQUEST, "name and api_key are required");
    }
    let mut user = User::new(
        body.name.trim(),
        body.api_key.expose(),
        body.base_quota.unwrap_or(state.default_base_quota),
    );
    user.privileged = body.privileged;

    match state.store.insert_user(user).await {
        Ok(id) => {
            info!(user_id = id, privileged = body.privileged, "user registered");
            json_response(StatusCode::CREATED, json!({ "id": id }))
        }
        Err(credential_pool::Error::Store(message)) => admin_error(StatusCode::CONFLICT, message),
        Err(e) => store_error(e),
    }
}

fn parse_kind(key: &str) -> Option<JobKind> {
    match key {
        "refresh" => Some(JobKind::Refresh),
        "verify" => Some(JobKind::Verify),
        _ => None,
    }
}

/// POST /admin/jobs/{kind}
async fn start_job(State(state): State<AdminState>, Path(key): Path<String>) -> Response {
    let Some(kind) = parse_kind(&key) else {
        return admin_error(
            StatusCode::BAD_REQUEST,
            format!("unknown job kind {key}, expected refresh or verify"),
        );
    };
    match state.maintenance.start(kind).await {
        Ok(job) => json_response(StatusCode::ACCEPTED, json!(job)),
        Err(e) => store_error(e),
    }
}

/// GET /admin/jobs/{id}
async fn job_status(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.maintenance.job(&id).await {
        Ok(Some(job)) => json_response(StatusCode::OK, json!(job)),
        Ok(None) => admin_error(StatusCode::NOT_FOUND, format!("job {id} not found")),
        Err(e) => store_error(e),
    }
}
