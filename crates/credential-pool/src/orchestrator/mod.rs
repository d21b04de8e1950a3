//! Per-request retry and fallback driver
//!
//! Drives one logical request through two composed state machines: the outer
//! one walks backend targets in priority order (`target`), the inner one
//! rotates credentials within a target's retry budget (`attempt`). This
//! module executes their actions: selection, token resolution, the backend
//! call under a deadline, failure feedback into the pool, and exactly one
//! usage log entry per target that made at least one attempt.

pub mod attempt;
pub mod stream;
pub mod target;

pub use attempt::{AttemptFailure, FailureRecord};
pub use stream::StreamHandle;

use std::sync::Arc;
use std::time::{Duration, Instant};

use provider::{Classification, Provider, Reply, UpstreamError};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::broker::{AccessToken, TokenBroker};
use crate::classify::classify_error;
use crate::cooldown::{ModelTable, canonical_model_id};
use crate::error::{Error, GatewayError};
use crate::model::{Credential, CredentialId, ModelGroup, UsageLogEntry, User, UserId};
use crate::now_millis;
use crate::pool::{CredentialPool, NoCandidateReason, Selection};
use crate::quota::QuotaEngine;
use crate::rate_limit::RateLimiter;
use crate::settings::RetrySettings;
use crate::store::Store;
use crate::usage::UsageLogger;
use attempt::{AttemptAction, AttemptEvent, AttemptState};
use stream::{Primed, PumpContext};
use target::{TargetAction, TargetEvent, TargetState};

/// Body text used when a credential yields no access token.
const TOKEN_UNAVAILABLE: &str = "token refresh failed: no usable access token";

/// One independently configured backend.
pub struct Target {
    pub name: String,
    /// Model id prefixes served; empty serves every model
    pub families: Vec<String>,
    pub provider: Arc<dyn Provider>,
}

impl Target {
    pub fn new(name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        Self {
            name: name.into(),
            families: Vec::new(),
            provider,
        }
    }

    pub fn with_families<I, S>(mut self, families: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.families = families
            .into_iter()
            .map(|f| canonical_model_id(f.as_ref()))
            .collect();
        self
    }

    pub fn serves(&self, model: &str) -> bool {
        let id = canonical_model_id(model);
        self.families.is_empty() || self.families.iter().any(|f| id.starts_with(f.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub user_id: UserId,
    pub model: String,
    /// Backend request body, passed through untouched
    pub payload: Value,
    pub stream: bool,
    pub request_id: String,
}

/// Where and how a successful request was served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub target: String,
    pub credential_id: CredentialId,
    /// Attempts on the serving target
    pub attempts: u32,
    /// Time to the complete reply, or to the first chunk when streaming
    pub latency_ms: u64,
}

#[derive(Debug)]
pub enum CompletionBody {
    Complete(Value),
    Stream(StreamHandle),
}

#[derive(Debug)]
pub struct Completion {
    pub body: CompletionBody,
    pub usage: UsageRecord,
}

/// A request that passed the rate and quota checks.
#[derive(Debug, Clone)]
pub struct Admission {
    pub user: User,
    pub group: ModelGroup,
}

/// Usage log fields fixed for one target's attempts.
#[derive(Debug, Clone)]
pub(crate) struct RequestLog {
    user_id: UserId,
    model: String,
    group: ModelGroup,
    target: String,
    credential_id: Option<CredentialId>,
    attempts: u32,
    started: Instant,
}

impl RequestLog {
    fn entry(&self, status: u16, success: bool) -> UsageLogEntry {
        UsageLogEntry {
            id: 0,
            user_id: self.user_id,
            credential_id: self.credential_id,
            model: self.model.clone(),
            group: self.group,
            target: self.target.clone(),
            status,
            success,
            latency_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            attempts: self.attempts,
            category: None,
            error_code: None,
            error_message: None,
            created_at: now_millis(),
        }
    }

    pub(crate) fn success(&self) -> UsageLogEntry {
        self.entry(200, true)
    }

    pub(crate) fn failure(
        &self,
        status: u16,
        classification: &Classification,
        message: &str,
    ) -> UsageLogEntry {
        UsageLogEntry {
            category: Some(classification.category),
            error_code: Some(classification.code.clone()),
            error_message: Some(crate::store::truncate(message, crate::store::MAX_ERROR_LEN)),
            ..self.entry(status, false)
        }
    }

    fn usage_record(&self) -> UsageRecord {
        UsageRecord {
            target: self.target.clone(),
            credential_id: self.credential_id.unwrap_or_default(),
            attempts: self.attempts,
            latency_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Count one attempt outcome; `None` is a success.
pub(crate) fn record_attempt(failure: Option<&Classification>) {
    let (outcome, category) = match failure {
        None => ("success", "none"),
        Some(c) => ("failure", c.category.as_str()),
    };
    metrics::counter!("gateway_attempts_total", "outcome" => outcome, "category" => category)
        .increment(1);
}

enum Ready {
    Complete(Value),
    Stream(Primed),
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    pool: Arc<CredentialPool>,
    broker: Arc<TokenBroker>,
    quota: Arc<QuotaEngine>,
    limiter: Arc<RateLimiter>,
    usage: UsageLogger,
    retry: RetrySettings,
    models: ModelTable,
    targets: Vec<Target>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<CredentialPool>,
        broker: Arc<TokenBroker>,
        quota: Arc<QuotaEngine>,
        limiter: Arc<RateLimiter>,
        usage: UsageLogger,
        retry: RetrySettings,
    ) -> Self {
        Self {
            store,
            pool,
            broker,
            quota,
            limiter,
            usage,
            retry,
            models: ModelTable::default(),
            targets: Vec::new(),
        }
    }

    pub fn with_models(mut self, models: ModelTable) -> Self {
        self.models = models;
        self
    }

    /// Append a target; earlier targets have priority.
    pub fn with_target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn models(&self) -> &ModelTable {
        &self.models
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Rate and quota admission. Privileged users skip both checks.
    pub async fn admit(&self, user_id: UserId, model: &str) -> Result<Admission, GatewayError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(GatewayError::UnknownUser(user_id))?;
        let group = self.models.group_for(model);

        if !user.privileged {
            let now = now_millis();
            self.limiter.check(&user, now).await?;
            self.quota.check(&user, group, now).await?;
        }
        debug!(user_id, model, group = group.as_str(), "request admitted");
        Ok(Admission { user, group })
    }

    /// Serve one logical request.
    #[instrument(
        skip(self, request),
        fields(request_id = %request.request_id, user_id = request.user_id, model = %request.model)
    )]
    pub async fn complete(&self, request: CompletionRequest) -> Result<Completion, GatewayError> {
        let admission = self.admit(request.user_id, &request.model).await?;
        let targets: Vec<&Target> = self
            .targets
            .iter()
            .filter(|t| t.serves(&request.model))
            .collect();
        if targets.is_empty() {
            return Err(GatewayError::UnsupportedModel(request.model.clone()));
        }

        let mut state = TargetState::new(request.model.clone(), targets.len());
        let mut event = TargetEvent::Start;
        let mut completion = None;
        loop {
            let (next, action) = target::handle_event(state, event);
            state = next;
            match action {
                TargetAction::Dispatch { index } => {
                    let target = targets[index];
                    event = match self.run_target(&request, &admission, target).await {
                        Ok(done) => {
                            completion = Some(done);
                            TargetEvent::Succeeded
                        }
                        Err(failure) => {
                            debug!(backend = %target.name, attempts = failure.attempts(), "target gave up");
                            TargetEvent::Failed(failure)
                        }
                    };
                }
                TargetAction::Complete => {
                    return completion.ok_or_else(|| {
                        GatewayError::Internal(Error::Store("completion missing after success".into()))
                    });
                }
                TargetAction::Surface(err) => {
                    warn!(attempts = state.attempts, kind = err.kind(), error = %err, "request failed");
                    return Err(err);
                }
            }
        }
    }

    async fn run_target(
        &self,
        request: &CompletionRequest,
        admission: &Admission,
        target: &Target,
    ) -> Result<Completion, AttemptFailure> {
        let user_id = admission.user.id;
        let group = admission.group;
        let started = Instant::now();
        let log_for = |credential_id: CredentialId, attempts: u32| RequestLog {
            user_id,
            model: request.model.clone(),
            group,
            target: target.name.clone(),
            credential_id: Some(credential_id),
            attempts,
            started,
        };

        let mut state = AttemptState::new(self.retry.max_retries.saturating_add(1));
        let mut event = AttemptEvent::Start;
        let mut selected: Option<Credential> = None;
        let mut completion = None;

        loop {
            let (next, action) = attempt::handle_event(state, event);
            state = next;
            match action {
                AttemptAction::Select => {
                    event = match self
                        .pool
                        .select(user_id, group, &state.excluded, now_millis())
                        .await
                    {
                        Ok(Selection::Credential(credential)) => {
                            let id = credential.id;
                            selected = Some(credential);
                            AttemptEvent::Selected(id)
                        }
                        Ok(Selection::NoCandidate(reason)) => AttemptEvent::NoCandidate(reason),
                        Err(e) => {
                            warn!(user_id, error = %e, "credential selection failed");
                            AttemptEvent::NoCandidate(NoCandidateReason::NoCredential)
                        }
                    };
                }

                AttemptAction::Call { credential_id } => {
                    let Some(credential) = selected.take() else {
                        event = AttemptEvent::NoCandidate(NoCandidateReason::NoCredential);
                        continue;
                    };
                    let log = log_for(credential_id, state.attempts);

                    event = match self.call(target, &credential, request).await {
                        Ok(Ready::Complete(value)) => {
                            record_attempt(None);
                            self.usage.record(log.success()).await;
                            info!(
                                backend = %target.name,
                                credential_id,
                                attempts = state.attempts,
                                "request completed"
                            );
                            completion = Some(Completion {
                                body: CompletionBody::Complete(value),
                                usage: log.usage_record(),
                            });
                            AttemptEvent::Succeeded
                        }
                        Ok(Ready::Stream(primed)) => {
                            let usage = log.usage_record();
                            info!(
                                backend = %target.name,
                                credential_id,
                                attempts = state.attempts,
                                "streaming reply started"
                            );
                            let handle = stream::spawn_pump(
                                primed,
                                PumpContext {
                                    pool: self.pool.clone(),
                                    usage: self.usage.clone(),
                                    credential,
                                    group,
                                    log,
                                },
                            );
                            completion = Some(Completion {
                                body: CompletionBody::Stream(handle),
                                usage,
                            });
                            AttemptEvent::Succeeded
                        }
                        Err(err) => {
                            let classification = classify_error(&err);
                            warn!(
                                backend = %target.name,
                                credential_id,
                                attempt = state.attempts,
                                status = err.status,
                                category = %classification.category,
                                retryable = classification.retryable,
                                "attempt failed"
                            );
                            self.pool
                                .report_failure(&credential, group, &classification, &err, now_millis())
                                .await;
                            record_attempt(Some(&classification));
                            AttemptEvent::Failed(FailureRecord {
                                credential_id,
                                status: err.status,
                                classification,
                                message: err.to_string(),
                            })
                        }
                    };
                }

                AttemptAction::Complete => {
                    return completion.ok_or(AttemptFailure::NoCandidate(NoCandidateReason::NoCredential));
                }

                AttemptAction::GiveUp(failure) => {
                    if let Some(last) = failure.last() {
                        let log = log_for(last.credential_id, failure.attempts());
                        self.usage
                            .record(log.failure(last.status, &last.classification, &last.message))
                            .await;
                    }
                    return Err(failure);
                }
            }
        }
    }

    /// Resolve a token and call the backend under the per-call deadline.
    async fn call(
        &self,
        target: &Target,
        credential: &Credential,
        request: &CompletionRequest,
    ) -> Result<Ready, UpstreamError> {
        let token = match self.broker.resolve(credential).await {
            AccessToken::Ready(token) => token,
            AccessToken::Unavailable => return Err(UpstreamError::new(0, TOKEN_UNAVAILABLE)),
        };
        let project = credential.project_id.as_deref().unwrap_or_default();
        let deadline = Duration::from_secs(self.retry.call_timeout_secs);

        tokio::time::timeout(
            deadline,
            send_and_prime(target.provider.as_ref(), token.expose(), project, request),
        )
        .await
        .unwrap_or_else(|_| Err(UpstreamError::timed_out(self.retry.call_timeout_secs)))
    }
}

async fn send_and_prime(
    provider: &dyn Provider,
    token: &str,
    project: &str,
    request: &CompletionRequest,
) -> Result<Ready, UpstreamError> {
    match provider
        .send(token, project, &request.payload, request.stream)
        .await?
    {
        Reply::Complete(value) => Ok(Ready::Complete(value)),
        Reply::Stream(body) => Ok(Ready::Stream(stream::prime(body).await?)),
    }
}
