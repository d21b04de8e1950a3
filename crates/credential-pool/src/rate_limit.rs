//! Sliding one-minute request limit per user
//!
//! Counts every usage log entry (any outcome) in the trailing 60 seconds.
//! Users who donate at least one active public credential get the higher
//! contributor limit.

use std::sync::Arc;

use tracing::debug;

use crate::error::GatewayError;
use crate::model::{User, Visibility};
use crate::settings::RateLimitSettings;
use crate::store::{CredentialQuery, Scope, Store, UsageQuery};

const WINDOW_MS: u64 = 60_000;

pub struct RateLimiter {
    store: Arc<dyn Store>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, settings: RateLimitSettings) -> Self {
        Self { store, settings }
    }

    /// Requests per minute allowed for this user.
    pub async fn limit_for(&self, user: &User) -> Result<u64, GatewayError> {
        let donated = CredentialQuery::new(Scope::Owned(user.id))
            .visibility(Visibility::Public)
            .active();
        let contributor = self.store.count_credentials(donated).await? > 0;
        Ok(if contributor {
            self.settings.contributor_rpm
        } else {
            self.settings.base_rpm
        })
    }

    pub async fn check(&self, user: &User, now: u64) -> Result<(), GatewayError> {
        let limit = self.limit_for(user).await?;
        let recent = self
            .store
            .count_usage(UsageQuery::new(user.id, now.saturating_sub(WINDOW_MS)).until(now))
            .await?;
        debug!(user_id = user.id, recent, limit, "rate check");
        if recent >= limit {
            return Err(GatewayError::RateLimited { limit });
        }
        Ok(())
    }
}
