//! Background credential maintenance
//!
//! Two bulk jobs, both run with bounded concurrency and committed to the
//! store in batches:
//!
//! - refresh: exchange every OAuth refresh token. Rejected tokens deactivate
//!   the credential; transient endpoint failures leave it untouched for the
//!   next cycle.
//! - verify: send a one-token probe through a backend target. A 200 or 429
//!   means the credential works; a second probe against a tier 3 model
//!   records whether it may serve tier 3.
//!
//! Credentials a job re-activates get their donation reward back through the
//! pool, if one was clawed back when they were disabled.
//!
//! Job progress is persisted as a `JobStatus` so callers can poll it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use provider::{Provider, UpstreamError};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::broker::{AccessToken, TokenBroker};
use crate::classify::classify_error;
use crate::error::{Error, Result};
use crate::model::{Credential, CredentialId, JobKind, JobState, JobStatus, SecretKind, Tier};
use crate::notify::{Notifier, StateChange};
use crate::now_millis;
use crate::pool::CredentialPool;
use crate::settings::MaintenanceSettings;
use crate::store::{CredentialQuery, CredentialUpdate, MAX_ERROR_LEN, Store, truncate};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-credential result of one job step.
enum Outcome {
    Healthy(CredentialUpdate),
    Broken(CredentialUpdate),
    /// Try again next cycle
    Unchanged,
}

fn broken(id: CredentialId, error: &str) -> Outcome {
    Outcome::Broken(CredentialUpdate {
        id,
        active: Some(false),
        last_error: Some(Some(truncate(error, MAX_ERROR_LEN))),
        ..Default::default()
    })
}

pub struct Maintenance {
    store: Arc<dyn Store>,
    broker: Arc<TokenBroker>,
    probe: Option<Arc<dyn Provider>>,
    pool: Option<Arc<CredentialPool>>,
    settings: MaintenanceSettings,
    notifier: Notifier,
}

impl Maintenance {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<TokenBroker>,
        settings: MaintenanceSettings,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            broker,
            probe: None,
            pool: None,
            settings,
            notifier,
        }
    }

    /// Backend used by verification probes.
    pub fn with_probe(mut self, provider: Arc<dyn Provider>) -> Self {
        self.probe = Some(provider);
        self
    }

    /// Pool that settles donation rewards for re-activated credentials.
    pub fn with_pool(mut self, pool: Arc<CredentialPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub async fn job(&self, id: &str) -> Result<Option<JobStatus>> {
        self.store.get_job(id.to_string()).await
    }

    pub async fn refresh_all(&self) -> Result<JobStatus> {
        let (job, credentials) = self.plan(JobKind::Refresh).await?;
        self.execute(job, credentials).await
    }

    pub async fn verify_all(&self) -> Result<JobStatus> {
        let (job, credentials) = self.plan(JobKind::Verify).await?;
        self.execute(job, credentials).await
    }

    /// Start a job in the background and return its initial status.
    pub async fn start(self: &Arc<Self>, kind: JobKind) -> Result<JobStatus> {
        let (job, credentials) = self.plan(kind).await?;
        let started = job.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let id = job.id.clone();
            if let Err(e) = this.execute(job, credentials).await {
                warn!(job_id = %id, error = %e, "maintenance job failed");
            }
        });
        Ok(started)
    }

    async fn plan(&self, kind: JobKind) -> Result<(JobStatus, Vec<Credential>)> {
        if kind == JobKind::Verify && self.probe.is_none() {
            return Err(Error::NotConfigured("verification probe target"));
        }
        let mut credentials = self.store.list_credentials(CredentialQuery::all()).await?;
        if kind == JobKind::Refresh {
            credentials.retain(|c| c.kind == SecretKind::OAuth);
        }

        let job = JobStatus {
            id: format!("{}_{}", kind.as_str(), uuid::Uuid::new_v4().simple()),
            kind,
            state: JobState::Running,
            total: credentials.len(),
            succeeded: 0,
            failed: 0,
            started_at: now_millis(),
            finished_at: None,
        };
        self.save(&job).await?;
        info!(job_id = %job.id, kind = kind.as_str(), total = job.total, "maintenance job started");
        Ok((job, credentials))
    }

    async fn execute(&self, job: JobStatus, credentials: Vec<Credential>) -> Result<JobStatus> {
        let broker = self.broker.clone();
        match job.kind {
            JobKind::Refresh => {
                self.run(job, credentials, move |credential| {
                    let broker = broker.clone();
                    async move { refresh_one(&broker, credential).await }
                })
                .await
            }
            JobKind::Verify => {
                let probe = self
                    .probe
                    .clone()
                    .ok_or(Error::NotConfigured("verification probe target"))?;
                let models = Arc::new((
                    self.settings.probe_model.clone(),
                    self.settings.tier3_probe_model.clone(),
                ));
                self.run(job, credentials, move |credential| {
                    let broker = broker.clone();
                    let probe = probe.clone();
                    let models = models.clone();
                    async move {
                        verify_one(&broker, probe.as_ref(), &models.0, &models.1, credential).await
                    }
                })
                .await
            }
        }
    }

    async fn run<F, Fut>(
        &self,
        mut job: JobStatus,
        credentials: Vec<Credential>,
        work: F,
    ) -> Result<JobStatus>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for credential in credentials {
            let semaphore = semaphore.clone();
            let step = work(credential);
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                step.await
            });
        }

        let batch_size = self.settings.batch_size.max(1);
        let mut pending = Vec::with_capacity(batch_size);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Outcome::Healthy(update)) => {
                    job.succeeded += 1;
                    pending.push(update);
                }
                Ok(Outcome::Broken(update)) => {
                    job.failed += 1;
                    pending.push(update);
                }
                Ok(Outcome::Unchanged) => job.failed += 1,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "maintenance step panicked");
                    job.failed += 1;
                }
            }
            if pending.len() >= batch_size {
                self.commit(std::mem::take(&mut pending)).await?;
                self.save(&job).await?;
            }
        }
        self.commit(pending).await?;

        job.state = JobState::Done;
        job.finished_at = Some(now_millis());
        self.save(&job).await?;
        info!(
            job_id = %job.id,
            kind = job.kind.as_str(),
            succeeded = job.succeeded,
            failed = job.failed,
            "maintenance job finished"
        );
        metrics::counter!("gateway_maintenance_jobs_total", "kind" => job.kind.as_str()).increment(1);
        Ok(job)
    }

    async fn commit(&self, updates: Vec<CredentialUpdate>) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let ids: Vec<CredentialId> = updates.iter().map(|u| u.id).collect();
        let activated: Vec<CredentialId> = updates
            .iter()
            .filter(|u| u.active == Some(true))
            .map(|u| u.id)
            .collect();
        let applied = self.store.apply_updates(updates).await?;
        debug!(applied, "maintenance batch committed");

        if let Some(pool) = &self.pool {
            for id in activated {
                if let Err(e) = pool.restore_reward(id).await {
                    warn!(credential_id = id, error = %e, "failed to restore donation reward");
                }
            }
        }
        for id in ids {
            self.notifier.notify(StateChange::CredentialChanged { id });
        }
        Ok(())
    }

    async fn save(&self, job: &JobStatus) -> Result<()> {
        self.store.put_job(job.clone()).await?;
        self.notifier.notify(StateChange::JobChanged { id: job.id.clone() });
        Ok(())
    }
}

async fn refresh_one(broker: &TokenBroker, credential: Credential) -> Outcome {
    let id = credential.id;
    match broker.refresh(&credential).await {
        Ok(token) => {
            debug!(credential_id = id, "background refresh succeeded");
            Outcome::Healthy(CredentialUpdate {
                id,
                access_token: Some((token.sealed, Some(token.expires_at))),
                active: Some(true),
                last_error: Some(None),
                ..Default::default()
            })
        }
        Err(e) if e.is_permanent() => {
            warn!(credential_id = id, error = %e, "refresh token rejected, deactivating credential");
            broken(id, &e.to_string())
        }
        Err(e) => {
            warn!(credential_id = id, error = %e, "background refresh failed (transient), will retry next cycle");
            Outcome::Unchanged
        }
    }
}

/// One-token request for `model`. 200 and 429 both prove the credential works.
async fn probe_model(
    provider: &dyn Provider,
    token: &str,
    project: &str,
    model: &str,
) -> std::result::Result<(), UpstreamError> {
    let payload = json!({
        "model": model,
        "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }],
        "generationConfig": { "maxOutputTokens": 1 },
    });
    match tokio::time::timeout(PROBE_TIMEOUT, provider.send(token, project, &payload, false)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.status == 429 => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(UpstreamError::timed_out(PROBE_TIMEOUT.as_secs())),
    }
}

async fn verify_one(
    broker: &TokenBroker,
    provider: &dyn Provider,
    model: &str,
    tier3_model: &str,
    credential: Credential,
) -> Outcome {
    let id = credential.id;
    let AccessToken::Ready(token) = broker.resolve(&credential).await else {
        return broken(id, "verification failed: no usable access token");
    };
    let Some(project) = credential.project_id.as_deref().filter(|p| !p.trim().is_empty()) else {
        return broken(id, "verification failed: credential has no project id");
    };

    if let Err(e) = probe_model(provider, token.expose(), project, model).await {
        let classification = classify_error(&e);
        warn!(
            credential_id = id,
            status = e.status,
            category = %classification.category,
            "verification probe failed, deactivating credential"
        );
        return broken(id, &format!("[{}] {}", classification.code, e));
    }

    let tier = match probe_model(provider, token.expose(), project, tier3_model).await {
        Ok(()) => Tier::Gemini3,
        Err(_) => Tier::Gemini25,
    };
    debug!(credential_id = id, tier = ?tier, "credential verified");
    Outcome::Healthy(CredentialUpdate {
        id,
        active: Some(true),
        tier: Some(tier),
        last_error: Some(None),
        ..Default::default()
    })
}

/// Spawn the periodic bulk refresh.
///
/// The first tick is skipped: tokens loaded at startup are refreshed on
/// demand when first used.
pub fn spawn_refresh_task(maintenance: Arc<Maintenance>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = maintenance.refresh_all().await {
                warn!(error = %e, "background refresh cycle failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::OAuthSettings;
    use crate::memory::MemoryStore;
    use crate::model::Visibility;
    use axum::Router;
    use axum::extract::Form;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use common::{PlaintextCipher, Secret};
    use provider::{Reply, SendFuture};
    use std::collections::HashMap;

    async fn token_endpoint(Form(form): Form<HashMap<String, String>>) -> axum::response::Response {
        match form.get("refresh_token").map(String::as_str) {
            Some("rt-good") => axum::Json(json!({
                "access_token": "at-fresh",
                "expires_in": 3600
            }))
            .into_response(),
            Some("rt-flaky") => (StatusCode::SERVICE_UNAVAILABLE, "backend busy").into_response(),
            _ => (StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#).into_response(),
        }
    }

    async fn spawn_endpoint() -> String {
        let app = Router::new().fallback(token_endpoint);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/token")
    }

    /// Answers probes by project id; tier 3 models only work for "p-t3"
    /// and the rate-limited project.
    struct ProbeBackend;

    impl Provider for ProbeBackend {
        fn name(&self) -> &str {
            "probe"
        }

        fn send<'a>(
            &'a self,
            _access_token: &'a str,
            project_id: &'a str,
            payload: &'a serde_json::Value,
            _stream: bool,
        ) -> SendFuture<'a> {
            let tier3 = payload["model"]
                .as_str()
                .is_some_and(|m| m.starts_with("gemini-3"));
            let result = match (project_id, tier3) {
                ("p-t3", _) | ("p-ok", false) => Ok(Reply::Complete(json!({}))),
                ("p-ok", true) => Err(UpstreamError::new(404, "model not found")),
                ("p-limited", _) => Err(UpstreamError::new(429, "too many requests")),
                _ => Err(UpstreamError::new(403, "PERMISSION_DENIED")),
            };
            Box::pin(async move { result })
        }
    }

    fn maintenance(store: Arc<MemoryStore>, endpoint: String, settings: MaintenanceSettings) -> Maintenance {
        let broker = Arc::new(TokenBroker::new(
            store.clone(),
            Arc::new(PlaintextCipher),
            reqwest::Client::new(),
            OAuthSettings {
                token_endpoint: endpoint,
                client_id: "sys-client".into(),
                client_secret: Some(Secret::new("sys-secret".into())),
            },
        ));
        Maintenance::new(store, broker, settings, Notifier::new())
    }

    async fn insert(store: &MemoryStore, kind: SecretKind, secret: &str, project: &str, active: bool) -> CredentialId {
        let mut c = Credential::new(kind, secret.into(), Tier::Gemini25, Visibility::Private);
        c.project_id = Some(project.into());
        c.active = active;
        store.insert_credential(c).await.unwrap()
    }

    fn small_batches() -> MaintenanceSettings {
        MaintenanceSettings {
            concurrency: 2,
            batch_size: 1,
            ..MaintenanceSettings::default()
        }
    }

    #[tokio::test]
    async fn refresh_all_commits_results() {
        let store = Arc::new(MemoryStore::new());
        let good = insert(&store, SecretKind::OAuth, "rt-good", "p1", true).await;
        let revived = insert(&store, SecretKind::OAuth, "rt-good", "p2", false).await;
        let revoked = insert(&store, SecretKind::OAuth, "rt-revoked", "p3", true).await;
        let flaky = insert(&store, SecretKind::OAuth, "rt-flaky", "p4", true).await;
        insert(&store, SecretKind::ApiKey, "AIza-key", "p5", true).await;

        let m = maintenance(store.clone(), spawn_endpoint().await, small_batches());
        let job = m.refresh_all().await.unwrap();
        assert_eq!(job.total, 4);
        assert_eq!(job.succeeded, 2);
        assert_eq!(job.failed, 2);
        assert_eq!(job.state, JobState::Done);
        assert_eq!(m.job(&job.id).await.unwrap(), Some(job));

        for id in [good, revived] {
            let c = store.get_credential(id).await.unwrap().unwrap();
            assert!(c.active);
            assert_eq!(c.sealed_access_token.as_deref(), Some("at-fresh"));
        }
        let c = store.get_credential(revoked).await.unwrap().unwrap();
        assert!(!c.active);
        assert!(c.last_error.unwrap().contains("invalid_grant"));

        let c = store.get_credential(flaky).await.unwrap().unwrap();
        assert!(c.active);
        assert!(c.last_error.is_none());
        assert!(c.sealed_access_token.is_none());
    }

    #[tokio::test]
    async fn reward_is_charged_once_across_disable_and_refresh_cycles() {
        use crate::model::{ModelGroup, PoolVisibilityMode, User};
        use crate::settings::{CooldownSettings, QuotaSettings};
        use provider::{Classification, ErrorCategory};

        let store = Arc::new(MemoryStore::new());
        let owner = store
            .insert_user(User::new("ann", "sk-ann", 100))
            .await
            .unwrap();
        store.adjust_bonus_quota(owner, 10_000).await.unwrap();
        let pool = Arc::new(CredentialPool::new(
            store.clone(),
            PoolVisibilityMode::FullShared,
            CooldownSettings::default(),
            QuotaSettings::default(),
            Notifier::new(),
        ));
        let mut donated = Credential::new(SecretKind::OAuth, "rt-good".into(), Tier::Gemini25, Visibility::Public);
        donated.owner_id = Some(owner);
        donated.project_id = Some("p-ann".into());
        let id = pool.onboard(donated).await.unwrap();

        let reward = QuotaSettings::default().donation_reward(Tier::Gemini25);
        let bonus = |store: Arc<MemoryStore>| async move {
            store.get_user(owner).await.unwrap().unwrap().bonus_quota
        };
        assert_eq!(bonus(store.clone()).await, 10_000 + reward);

        let m = maintenance(store.clone(), spawn_endpoint().await, small_batches()).with_pool(pool.clone());
        let auth = Classification {
            category: ErrorCategory::Auth,
            code: "PERMISSION_DENIED".into(),
            retryable: false,
            disable: true,
        };
        let err = UpstreamError::new(403, "billing account disabled");

        for _ in 0..3 {
            let c = store.get_credential(id).await.unwrap().unwrap();
            pool.report_failure(&c, ModelGroup::Flash, &auth, &err, now_millis()).await;
            assert!(!store.get_credential(id).await.unwrap().unwrap().active);
            assert_eq!(bonus(store.clone()).await, 10_000);

            m.refresh_all().await.unwrap();
            let c = store.get_credential(id).await.unwrap().unwrap();
            assert!(c.active);
            assert!(c.reward_held);
            assert_eq!(bonus(store.clone()).await, 10_000 + reward);
        }

        // a refresh of an already-rewarded credential pays nothing extra
        m.refresh_all().await.unwrap();
        assert_eq!(bonus(store.clone()).await, 10_000 + reward);
    }

    #[tokio::test]
    async fn reactivation_without_prior_reward_pays_nothing() {
        use crate::model::{PoolVisibilityMode, User};
        use crate::settings::{CooldownSettings, QuotaSettings};

        let store = Arc::new(MemoryStore::new());
        let owner = store
            .insert_user(User::new("bob", "sk-bob", 100))
            .await
            .unwrap();
        let pool = Arc::new(CredentialPool::new(
            store.clone(),
            PoolVisibilityMode::FullShared,
            CooldownSettings::default(),
            QuotaSettings::default(),
            Notifier::new(),
        ));
        // private donation, then revived by a refresh
        let mut private = Credential::new(SecretKind::OAuth, "rt-good".into(), Tier::Gemini25, Visibility::Private);
        private.owner_id = Some(owner);
        private.project_id = Some("p-bob".into());
        private.active = false;
        pool.onboard(private).await.unwrap();

        let m = maintenance(store.clone(), spawn_endpoint().await, small_batches()).with_pool(pool);
        m.refresh_all().await.unwrap();
        assert_eq!(store.get_user(owner).await.unwrap().unwrap().bonus_quota, 0);
    }

    #[tokio::test]
    async fn verify_all_sets_status_and_tier() {
        let store = Arc::new(MemoryStore::new());
        let ok = insert(&store, SecretKind::ApiKey, "k1", "p-ok", false).await;
        let t3 = insert(&store, SecretKind::ApiKey, "k2", "p-t3", true).await;
        let limited = insert(&store, SecretKind::ApiKey, "k3", "p-limited", true).await;
        let dead = insert(&store, SecretKind::ApiKey, "k4", "p-dead", true).await;

        let m = maintenance(store.clone(), "http://127.0.0.1:9/token".into(), small_batches())
            .with_probe(Arc::new(ProbeBackend));
        let job = m.verify_all().await.unwrap();
        assert_eq!((job.total, job.succeeded, job.failed), (4, 3, 1));

        let get = |id| {
            let store = store.clone();
            async move { store.get_credential(id).await.unwrap().unwrap() }
        };
        let c = get(ok).await;
        assert!(c.active);
        assert_eq!(c.tier, Tier::Gemini25);
        assert_eq!(get(t3).await.tier, Tier::Gemini3);
        assert!(get(limited).await.active);
        let c = get(dead).await;
        assert!(!c.active);
        assert!(c.last_error.unwrap().contains("PERMISSION_DENIED"));
    }

    #[tokio::test]
    async fn verify_needs_a_probe_target() {
        let store = Arc::new(MemoryStore::new());
        let m = maintenance(store, "http://127.0.0.1:9/token".into(), MaintenanceSettings::default());
        assert!(matches!(m.verify_all().await, Err(Error::NotConfigured(_))));
    }

    #[tokio::test]
    async fn started_job_is_pollable_until_done() {
        let store = Arc::new(MemoryStore::new());
        insert(&store, SecretKind::OAuth, "rt-good", "p1", true).await;
        let m = Arc::new(maintenance(store, spawn_endpoint().await, MaintenanceSettings::default()));
        let mut rx = m.notifier.subscribe();

        let started = m.start(JobKind::Refresh).await.unwrap();
        assert_eq!(started.state, JobState::Running);
        assert_eq!(started.total, 1);

        let done = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(StateChange::JobChanged { id }) = rx.recv().await {
                    let job = m.job(&id).await.unwrap().unwrap();
                    if job.state == JobState::Done {
                        return job;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(done.id, started.id);
        assert_eq!(done.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_task_skips_first_tick() {
        let store = Arc::new(MemoryStore::new());
        let m = Arc::new(maintenance(store, "http://127.0.0.1:9/token".into(), MaintenanceSettings::default()));
        let mut rx = m.notifier.subscribe();

        let handle = spawn_refresh_task(m.clone(), Duration::from_secs(60));
        assert!(
            tokio::time::timeout(Duration::from_secs(30), rx.recv())
                .await
                .is_err()
        );
        let change = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(change, StateChange::JobChanged { .. }));
        handle.abort();
    }
}
