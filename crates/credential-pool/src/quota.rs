//! Daily quota ceilings and admission checks
//!
//! The quota day starts at a fixed UTC hour. Ceilings are derived per model
//! group from, in priority order, an explicit user override, the number of
//! active credentials the user owns, and configured floors. Usage is read
//! from the usage log, counting successful requests only. A ceiling or
//! allowance of 0 is not enforced.

use std::sync::Arc;

use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::model::{ModelGroup, Tier, User};
use crate::settings::QuotaSettings;
use crate::store::{CredentialQuery, Scope, Store, UsageQuery};

const HOUR_MS: u64 = 3_600_000;
const DAY_MS: u64 = 24 * HOUR_MS;

/// `[start, end)` of the quota day containing `now`.
pub fn day_window(now: u64, reset_hour_utc: u8) -> (u64, u64) {
    let offset = u64::from(reset_hour_utc % 24) * HOUR_MS;
    let shifted = now.saturating_sub(offset);
    let start = (shifted / DAY_MS) * DAY_MS + offset;
    let start = if start > now { start.saturating_sub(DAY_MS) } else { start };
    (start, start + DAY_MS)
}

/// Active credentials a user owns, by tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnedCounts {
    pub tier25: u64,
    pub tier3: u64,
}

impl OwnedCounts {
    pub fn total(&self) -> u64 {
        self.tier25 + self.tier3
    }
}

/// Group ceiling for a user. Pure.
pub fn ceiling(settings: &QuotaSettings, user: &User, owned: OwnedCounts, group: ModelGroup) -> u64 {
    let explicit = user.overrides.get(group);
    if explicit > 0 {
        return explicit;
    }

    let floor = settings.no_credential_floor(group);
    match group {
        ModelGroup::Flash | ModelGroup::Pro => owned
            .total()
            .saturating_mul(settings.reward(group))
            .max(floor),
        ModelGroup::Tier3 => {
            let derived = owned.tier3.saturating_mul(settings.reward_tier3);
            let partial = if owned.tier25 > 0 {
                settings.cred25_tier3
            } else {
                0
            };
            derived.max(partial).max(floor)
        }
    }
}

/// Per-group successful usage within the current quota day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailyUsage {
    pub flash: u64,
    pub pro: u64,
    pub tier3: u64,
}

impl DailyUsage {
    pub fn get(&self, group: ModelGroup) -> u64 {
        match group {
            ModelGroup::Flash => self.flash,
            ModelGroup::Pro => self.pro,
            ModelGroup::Tier3 => self.tier3,
        }
    }

    pub fn total(&self) -> u64 {
        self.flash + self.pro + self.tier3
    }
}

pub struct QuotaEngine {
    store: Arc<dyn Store>,
    settings: QuotaSettings,
}

impl QuotaEngine {
    pub fn new(store: Arc<dyn Store>, settings: QuotaSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &QuotaSettings {
        &self.settings
    }

    pub async fn owned_counts(&self, user_id: u64) -> Result<OwnedCounts> {
        let owned = CredentialQuery::new(Scope::Owned(user_id)).active();
        Ok(OwnedCounts {
            tier25: self.store.count_credentials(owned.tier(Tier::Gemini25)).await? as u64,
            tier3: self.store.count_credentials(owned.tier(Tier::Gemini3)).await? as u64,
        })
    }

    pub async fn ceiling(&self, user: &User, group: ModelGroup) -> Result<u64> {
        let owned = self.owned_counts(user.id).await?;
        Ok(ceiling(&self.settings, user, owned, group))
    }

    pub async fn usage(&self, user_id: u64, now: u64) -> Result<DailyUsage> {
        let (start, end) = day_window(now, self.settings.reset_hour_utc);
        let entries = self
            .store
            .list_usage(UsageQuery::new(user_id, start).until(end - 1).successful())
            .await?;
        let mut usage = DailyUsage::default();
        for entry in entries {
            match entry.group {
                ModelGroup::Flash => usage.flash += 1,
                ModelGroup::Pro => usage.pro += 1,
                ModelGroup::Tier3 => usage.tier3 += 1,
            }
        }
        Ok(usage)
    }

    /// Admission check for one request in `group`. Limits of 0 are skipped.
    pub async fn check(
        &self,
        user: &User,
        group: ModelGroup,
        now: u64,
    ) -> std::result::Result<(), GatewayError> {
        let usage = self.usage(user.id, now).await?;
        let limit = self.ceiling(user, group).await?;
        let used = usage.get(group);
        debug!(user_id = user.id, group = group.as_str(), used, limit, "quota check");
        if limit > 0 && used >= limit {
            return Err(GatewayError::QuotaExceeded {
                scope: group.as_str().to_string(),
                used,
                limit,
            });
        }

        let allowance = user.daily_allowance();
        if allowance > 0 && usage.total() >= allowance {
            return Err(GatewayError::QuotaExceeded {
                scope: "total".to_string(),
                used: usage.total(),
                limit: allowance,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::{Credential, SecretKind, UsageLogEntry, Visibility};

    const NOW: u64 = 1_700_000_000_000;

    fn user(id: u64) -> User {
        let mut u = User::new(format!("u{id}"), &format!("sk-{id}"), 10_000);
        u.id = id;
        u
    }

    fn counts(tier25: u64, tier3: u64) -> OwnedCounts {
        OwnedCounts { tier25, tier3 }
    }

    #[test]
    fn day_window_starts_at_reset_hour() {
        // 2023-11-14T22:13:20Z
        let (start, end) = day_window(NOW, 7);
        assert_eq!(end - start, DAY_MS);
        assert!(start <= NOW && NOW < end);
        assert_eq!((start % DAY_MS) / HOUR_MS, 7);

        // just before the reset hour belongs to the previous day
        let midnight = (NOW / DAY_MS) * DAY_MS;
        let (early, _) = day_window(midnight + 6 * HOUR_MS, 7);
        assert_eq!(early, midnight - DAY_MS + 7 * HOUR_MS);
        let (on_time, _) = day_window(midnight + 7 * HOUR_MS, 7);
        assert_eq!(on_time, midnight + 7 * HOUR_MS);
    }

    #[test]
    fn zero_credentials_get_exact_floor() {
        let s = QuotaSettings::default();
        let u = user(1);
        for group in ModelGroup::ALL {
            assert_eq!(ceiling(&s, &u, counts(0, 0), group), s.no_credential_floor(group));
        }
    }

    #[test]
    fn adding_credentials_never_lowers_ceiling() {
        let s = QuotaSettings::default();
        let u = user(1);
        for group in ModelGroup::ALL {
            let mut previous = 0;
            for (t25, t3) in [(0, 0), (1, 0), (2, 0), (2, 1), (3, 1), (3, 4)] {
                let current = ceiling(&s, &u, counts(t25, t3), group);
                assert!(current >= previous, "{group:?} dropped at ({t25}, {t3})");
                previous = current;
            }
        }
    }

    #[test]
    fn tier3_intermediate_floor() {
        let s = QuotaSettings::default();
        let u = user(1);
        assert_eq!(ceiling(&s, &u, counts(1, 0), ModelGroup::Tier3), s.cred25_tier3);
        assert_eq!(ceiling(&s, &u, counts(1, 1), ModelGroup::Tier3), s.reward_tier3);
    }

    #[test]
    fn override_wins() {
        let s = QuotaSettings::default();
        let mut u = user(1);
        u.overrides.pro = 3;
        assert_eq!(ceiling(&s, &u, counts(5, 5), ModelGroup::Pro), 3);
        assert_eq!(ceiling(&s, &u, counts(1, 0), ModelGroup::Flash), s.reward_flash);
    }

    fn entry(user_id: u64, group: ModelGroup, success: bool, at: u64) -> UsageLogEntry {
        UsageLogEntry {
            id: 0,
            user_id,
            credential_id: None,
            model: "m".into(),
            group,
            target: "t".into(),
            status: if success { 200 } else { 500 },
            success,
            latency_ms: 1,
            attempts: 1,
            category: None,
            error_code: None,
            error_message: None,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn check_counts_only_todays_successes() {
        let store = Arc::new(MemoryStore::new());
        let s = QuotaSettings {
            no_cred_pro: 2,
            ..QuotaSettings::default()
        };
        let engine = QuotaEngine::new(store.clone(), s);
        let u = user(1);

        store.insert_usage(entry(1, ModelGroup::Pro, true, NOW - 10)).await.unwrap();
        store.insert_usage(entry(1, ModelGroup::Pro, false, NOW - 5)).await.unwrap();
        store.insert_usage(entry(1, ModelGroup::Pro, true, NOW - 2 * DAY_MS)).await.unwrap();
        assert!(engine.check(&u, ModelGroup::Pro, NOW).await.is_ok());

        store.insert_usage(entry(1, ModelGroup::Pro, true, NOW - 1)).await.unwrap();
        let err = engine.check(&u, ModelGroup::Pro, NOW).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::QuotaExceeded { used: 2, limit: 2, .. }
        ));
        // other groups unaffected
        assert!(engine.check(&u, ModelGroup::Flash, NOW).await.is_ok());
    }

    #[tokio::test]
    async fn total_allowance_caps_all_groups() {
        let store = Arc::new(MemoryStore::new());
        let engine = QuotaEngine::new(store.clone(), QuotaSettings::default());
        let mut u = user(1);
        u.base_quota = 1;
        store.insert_usage(entry(1, ModelGroup::Flash, true, NOW)).await.unwrap();

        let err = engine.check(&u, ModelGroup::Pro, NOW).await.unwrap_err();
        match err {
            GatewayError::QuotaExceeded { scope, .. } => assert_eq!(scope, "total"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_limits_are_not_enforced() {
        let store = Arc::new(MemoryStore::new());
        let s = QuotaSettings {
            no_cred_tier3: 0,
            ..QuotaSettings::default()
        };
        let engine = QuotaEngine::new(store.clone(), s);
        let mut u = user(1);
        u.base_quota = 0;
        assert_eq!(u.daily_allowance(), 0);
        assert_eq!(engine.ceiling(&u, ModelGroup::Tier3).await.unwrap(), 0);

        // nothing used yet: a zero ceiling or allowance does not reject
        assert!(engine.check(&u, ModelGroup::Tier3, NOW).await.is_ok());
        store.insert_usage(entry(1, ModelGroup::Tier3, true, NOW - 1)).await.unwrap();
        store.insert_usage(entry(1, ModelGroup::Tier3, true, NOW)).await.unwrap();
        assert!(engine.check(&u, ModelGroup::Tier3, NOW).await.is_ok());

        // a non-zero ceiling still applies alongside an unlimited allowance
        u.overrides.tier3 = 2;
        let err = engine.check(&u, ModelGroup::Tier3, NOW).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::QuotaExceeded { used: 2, limit: 2, .. }
        ));
    }

    #[tokio::test]
    async fn owned_credentials_raise_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let engine = QuotaEngine::new(store.clone(), QuotaSettings::default());
        let u = user(1);
        let mut c = Credential::new(SecretKind::ApiKey, "k".into(), Tier::Gemini25, Visibility::Private);
        c.owner_id = Some(1);
        store.insert_credential(c.clone()).await.unwrap();
        c.active = false;
        store.insert_credential(c).await.unwrap();

        assert_eq!(engine.ceiling(&u, ModelGroup::Flash).await.unwrap(), 1000);
        assert_eq!(engine.ceiling(&u, ModelGroup::Tier3).await.unwrap(), 50);
    }
}
