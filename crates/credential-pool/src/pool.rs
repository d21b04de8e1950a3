//! Credential selection, health feedback and onboarding
//!
//! Selection is least-recently-used round robin over the credentials a user
//! may see under the process-wide visibility mode, preferring those not in
//! cooldown for the request's model group. The pick and its usage bump happen
//! under one lock so concurrent requests move on to the next credential.
//!
//! Failure reports feed classification results back into credential state:
//! broken credentials are disabled (with the donation reward clawed back),
//! rate-limited ones get their group cooldown aligned with the upstream
//! retry delay.
//!
//! A credential's `reward_held` flag tracks whether its owner is currently
//! credited the donation reward. Clawback and re-payment both flip it through
//! the store, so each is applied at most once per state change.

use std::collections::HashSet;
use std::sync::Arc;

use provider::{Classification, UpstreamError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::classify::{DEFAULT_RETRY_DELAY, parse_retry_delay};
use crate::cooldown::{backdated_last_used, in_cooldown};
use crate::error::Result;
use crate::model::{
    Credential, CredentialId, ModelGroup, PoolVisibilityMode, Tier, UserId, Visibility,
};
use crate::notify::{Notifier, StateChange};
use crate::settings::{CooldownSettings, QuotaSettings};
use crate::store::{CredentialQuery, Scope, Store};

/// Why selection found nothing to hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoCandidateReason {
    /// Tier 3 model, no usable tier 3 credential in view
    NoTierAccess,
    /// Full-shared mode and the user donates nothing
    NoPublicAccess,
    NoCredential,
}

#[derive(Debug, Clone)]
pub enum Selection {
    Credential(Credential),
    NoCandidate(NoCandidateReason),
}

/// Pick among sorted candidates: the first not cooling down, else the first.
///
/// `candidates` must already be in round-robin order.
pub fn pick<'a>(
    candidates: &'a [Credential],
    group: ModelGroup,
    cooldown: &CooldownSettings,
    now: u64,
) -> Option<&'a Credential> {
    candidates
        .iter()
        .find(|c| !in_cooldown(c, group, cooldown, now))
        .or_else(|| candidates.first())
}

/// Round-robin order: least recently used first, never-used before all.
pub fn round_robin_order(candidates: &mut [Credential]) {
    candidates.sort_by_key(|c| (c.last_used_at, c.id));
}

pub struct CredentialPool {
    store: Arc<dyn Store>,
    mode: PoolVisibilityMode,
    cooldown: CooldownSettings,
    quota: QuotaSettings,
    select_lock: Mutex<()>,
    notifier: Notifier,
}

impl CredentialPool {
    pub fn new(
        store: Arc<dyn Store>,
        mode: PoolVisibilityMode,
        cooldown: CooldownSettings,
        quota: QuotaSettings,
        notifier: Notifier,
    ) -> Self {
        info!(mode = ?mode, "credential pool initialized");
        Self {
            store,
            mode,
            cooldown,
            quota,
            select_lock: Mutex::new(()),
            notifier,
        }
    }

    pub fn mode(&self) -> PoolVisibilityMode {
        self.mode
    }

    pub fn cooldown_settings(&self) -> &CooldownSettings {
        &self.cooldown
    }

    async fn owns(&self, user_id: UserId, query: CredentialQuery) -> Result<bool> {
        let query = CredentialQuery {
            scope: Scope::Owned(user_id),
            active_only: true,
            ..query
        };
        Ok(self.store.count_credentials(query).await? > 0)
    }

    /// Credentials this user may draw on for `group`.
    pub async fn visible_scope(&self, user_id: UserId, group: ModelGroup) -> Result<Scope> {
        let shared = match self.mode {
            PoolVisibilityMode::Private => false,
            PoolVisibilityMode::Tier3Shared => {
                group != ModelGroup::Tier3
                    || self
                        .owns(user_id, CredentialQuery::all().tier(Tier::Gemini3))
                        .await?
            }
            PoolVisibilityMode::FullShared => {
                self.owns(user_id, CredentialQuery::all().visibility(Visibility::Public))
                    .await?
            }
        };
        Ok(if shared {
            Scope::OwnedOrPublic(user_id)
        } else {
            Scope::Owned(user_id)
        })
    }

    /// Select a credential for `user_id` and record the use.
    pub async fn select(
        &self,
        user_id: UserId,
        group: ModelGroup,
        excluded: &HashSet<CredentialId>,
        now: u64,
    ) -> Result<Selection> {
        let scope = self.visible_scope(user_id, group).await?;

        let _guard = self.select_lock.lock().await;
        let mut candidates: Vec<Credential> = self
            .store
            .list_credentials(CredentialQuery::new(scope).active())
            .await?
            .into_iter()
            .filter(|c| c.is_selectable() && c.serves(group) && !excluded.contains(&c.id))
            .collect();

        round_robin_order(&mut candidates);
        let Some(chosen) = pick(&candidates, group, &self.cooldown, now) else {
            let reason = self.no_candidate_reason(scope, group);
            debug!(user_id, group = group.as_str(), reason = ?reason, "no candidate credential");
            return Ok(Selection::NoCandidate(reason));
        };

        let mut chosen = chosen.clone();
        self.store.touch_credential(chosen.id, group, now).await?;
        chosen.last_used_at = Some(now);
        chosen.group_last_used.set(group, Some(now));
        chosen.total_requests += 1;

        debug!(
            user_id,
            credential_id = chosen.id,
            group = group.as_str(),
            candidates = candidates.len(),
            "credential selected"
        );
        metrics::counter!("gateway_selections_total", "group" => group.as_str()).increment(1);
        Ok(Selection::Credential(chosen))
    }

    fn no_candidate_reason(&self, scope: Scope, group: ModelGroup) -> NoCandidateReason {
        if group == ModelGroup::Tier3 {
            NoCandidateReason::NoTierAccess
        } else if self.mode == PoolVisibilityMode::FullShared && matches!(scope, Scope::Owned(_)) {
            NoCandidateReason::NoPublicAccess
        } else {
            NoCandidateReason::NoCredential
        }
    }

    /// Feed a classified failure back into credential state.
    ///
    /// Store errors are logged; the caller's retry decision does not depend
    /// on this bookkeeping succeeding.
    pub async fn report_failure(
        &self,
        credential: &Credential,
        group: ModelGroup,
        classification: &Classification,
        error: &UpstreamError,
        now: u64,
    ) {
        let id = credential.id;
        let message = format!("[{}] {}", classification.code, error);
        if let Err(e) = self.store.record_failure(id, message.clone()).await {
            warn!(credential_id = id, error = %e, "failed to record credential failure");
        }

        if classification.disable {
            self.disable(id, classification, message).await;
        }

        if error.status == 429 {
            let delay = parse_retry_delay(error).unwrap_or(DEFAULT_RETRY_DELAY);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            let configured = self.cooldown.length_ms(group);
            if let Some(at) = backdated_last_used(now, delay_ms, configured) {
                match self.store.set_group_last_used(id, group, Some(at)).await {
                    Ok(()) => debug!(
                        credential_id = id,
                        group = group.as_str(),
                        delay_ms,
                        "cooldown aligned with upstream retry delay"
                    ),
                    Err(e) => {
                        warn!(credential_id = id, error = %e, "failed to set credential cooldown")
                    }
                }
            }
        }

        self.notifier.notify(StateChange::CredentialChanged { id });
    }

    async fn disable(&self, id: CredentialId, classification: &Classification, message: String) {
        // Re-read so a credential disabled by a concurrent request is not
        // clawed back twice.
        let current = match self.store.get_credential(id).await {
            Ok(Some(c)) if c.active => c,
            Ok(_) => return,
            Err(e) => {
                warn!(credential_id = id, error = %e, "failed to load credential for disable");
                return;
            }
        };

        if let Err(e) = self.store.set_active(id, false, Some(message)).await {
            warn!(credential_id = id, error = %e, "failed to disable credential");
            return;
        }
        warn!(
            credential_id = id,
            category = %classification.category,
            code = %classification.code,
            "credential disabled"
        );
        metrics::counter!(
            "gateway_credentials_disabled_total",
            "category" => classification.category.as_str()
        )
        .increment(1);

        if let Some(owner) = current.owner_id {
            match self.store.set_reward_held(id, false).await {
                Ok(true) => self.adjust_reward(owner, id, current.tier, -1).await,
                Ok(false) => debug!(credential_id = id, "no donation reward held"),
                Err(e) => warn!(credential_id = id, error = %e, "failed to release donation reward"),
            }
        }
    }

    async fn adjust_reward(&self, owner: UserId, id: CredentialId, tier: Tier, sign: i64) {
        let reward = i64::try_from(self.quota.donation_reward(tier)).unwrap_or(i64::MAX);
        match self.store.adjust_bonus_quota(owner, sign.saturating_mul(reward)).await {
            Ok(bonus) => {
                if sign < 0 {
                    info!(user_id = owner, credential_id = id, reward, bonus, "donation reward clawed back");
                } else {
                    info!(user_id = owner, credential_id = id, reward, bonus, "donation reward restored");
                }
                self.notifier.notify(StateChange::UserChanged { id: owner });
            }
            Err(e) => warn!(user_id = owner, credential_id = id, error = %e, "failed to adjust donation reward"),
        }
    }

    /// Pay the donation reward again for a re-activated public credential
    /// whose reward was clawed back. A no-op for anything else.
    pub async fn restore_reward(&self, id: CredentialId) -> Result<()> {
        let Some(credential) = self.store.get_credential(id).await? else {
            return Ok(());
        };
        let Some(owner) = credential.owner_id else {
            return Ok(());
        };
        if credential.active
            && credential.is_public()
            && self.store.set_reward_held(id, true).await?
        {
            self.adjust_reward(owner, id, credential.tier, 1).await;
        }
        Ok(())
    }

    /// Add a credential; public credentials with an owner earn the donation reward.
    pub async fn onboard(&self, mut credential: Credential) -> Result<CredentialId> {
        let rewarded = credential.is_public() && credential.active && credential.owner_id.is_some();
        credential.reward_held = rewarded;
        let owner = credential.owner_id;
        let tier = credential.tier;
        let id = self.store.insert_credential(credential).await?;
        info!(credential_id = id, owner = ?owner, tier = ?tier, "credential onboarded");

        if let (true, Some(owner)) = (rewarded, owner) {
            let reward = self.quota.donation_reward(tier);
            self.store.adjust_bonus_quota(owner, reward as i64).await?;
            self.notifier.notify(StateChange::UserChanged { id: owner });
        }
        self.notifier.notify(StateChange::CredentialChanged { id });
        Ok(id)
    }

    /// Remove a credential; its usage history is kept without the reference.
    pub async fn remove(&self, id: CredentialId) -> Result<()> {
        self.store.unlink_credential(id).await?;
        info!(credential_id = id, "credential removed");
        self.notifier.notify(StateChange::CredentialChanged { id });
        Ok(())
    }

    /// Pool health summary for the health endpoint.
    ///
    /// All linked credentials active → healthy, some → degraded, none → unhealthy.
    pub async fn health(&self, now: u64) -> Result<serde_json::Value> {
        let all = self.store.list_credentials(CredentialQuery::all()).await?;
        let active: Vec<&Credential> = all.iter().filter(|c| c.is_selectable()).collect();
        let public = active.iter().filter(|c| c.is_public()).count();

        let mut cooling = serde_json::Map::new();
        for group in ModelGroup::ALL {
            let n = active
                .iter()
                .filter(|c| c.serves(group) && in_cooldown(c, group, &self.cooldown, now))
                .count();
            cooling.insert(group.as_str().to_string(), n.into());
        }

        let total = all.len();
        let status = if total > 0 && active.len() == total {
            "healthy"
        } else if !active.is_empty() {
            "degraded"
        } else {
            "unhealthy"
        };

        Ok(serde_json::json!({
            "status": status,
            "mode": self.mode,
            "credentials_total": total,
            "credentials_active": active.len(),
            "credentials_inactive": total - active.len(),
            "credentials_public": public,
            "cooling_down": cooling,
        }))
    }
}
