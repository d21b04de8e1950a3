//! Tunables for cooldowns, quotas, rate limits, retries and maintenance.
//!
//! Every struct deserializes from its TOML section with per-field defaults,
//! so a config file only lists what it changes.

use serde::Deserialize;

use crate::model::{ModelGroup, Tier};

/// Per-group minimum idle interval between uses of one credential. 0 disables.
#[derive(Debug, Clone, Deserialize)]
pub struct CooldownSettings {
    #[serde(default = "default_cd_flash")]
    pub flash_secs: u64,
    #[serde(default = "default_cd_pro")]
    pub pro_secs: u64,
    #[serde(default = "default_cd_tier3")]
    pub tier3_secs: u64,
}

fn default_cd_flash() -> u64 {
    0
}

fn default_cd_pro() -> u64 {
    30
}

fn default_cd_tier3() -> u64 {
    60
}

impl Default for CooldownSettings {
    fn default() -> Self {
        Self {
            flash_secs: default_cd_flash(),
            pro_secs: default_cd_pro(),
            tier3_secs: default_cd_tier3(),
        }
    }
}

impl CooldownSettings {
    pub fn length_ms(&self, group: ModelGroup) -> u64 {
        let secs = match group {
            ModelGroup::Flash => self.flash_secs,
            ModelGroup::Pro => self.pro_secs,
            ModelGroup::Tier3 => self.tier3_secs,
        };
        secs.saturating_mul(1000)
    }
}

/// Daily quota rules.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaSettings {
    /// UTC hour at which the quota day rolls over
    #[serde(default = "default_reset_hour")]
    pub reset_hour_utc: u8,
    /// Allowance granted per owned active credential
    #[serde(default = "default_reward_flash")]
    pub reward_flash: u64,
    #[serde(default = "default_reward_pro")]
    pub reward_pro: u64,
    #[serde(default = "default_reward_tier3")]
    pub reward_tier3: u64,
    /// Floors for users owning no credential
    #[serde(default = "default_no_cred_flash")]
    pub no_cred_flash: u64,
    #[serde(default = "default_no_cred_pro")]
    pub no_cred_pro: u64,
    #[serde(default = "default_no_cred_tier3")]
    pub no_cred_tier3: u64,
    /// Tier 3 floor for users owning 2.5 credentials but no tier 3 one
    #[serde(default = "default_cred25_tier3")]
    pub cred25_tier3: u64,
    /// Base daily allowance for newly registered users
    #[serde(default = "default_base_quota")]
    pub default_base_quota: u64,
}

fn default_reset_hour() -> u8 {
    7
}

fn default_reward_flash() -> u64 {
    1000
}

fn default_reward_pro() -> u64 {
    250
}

fn default_reward_tier3() -> u64 {
    200
}

fn default_no_cred_flash() -> u64 {
    100
}

fn default_no_cred_pro() -> u64 {
    20
}

fn default_no_cred_tier3() -> u64 {
    10
}

fn default_cred25_tier3() -> u64 {
    50
}

fn default_base_quota() -> u64 {
    100
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            reset_hour_utc: default_reset_hour(),
            reward_flash: default_reward_flash(),
            reward_pro: default_reward_pro(),
            reward_tier3: default_reward_tier3(),
            no_cred_flash: default_no_cred_flash(),
            no_cred_pro: default_no_cred_pro(),
            no_cred_tier3: default_no_cred_tier3(),
            cred25_tier3: default_cred25_tier3(),
            default_base_quota: default_base_quota(),
        }
    }
}

impl QuotaSettings {
    pub fn reward(&self, group: ModelGroup) -> u64 {
        match group {
            ModelGroup::Flash => self.reward_flash,
            ModelGroup::Pro => self.reward_pro,
            ModelGroup::Tier3 => self.reward_tier3,
        }
    }

    pub fn no_credential_floor(&self, group: ModelGroup) -> u64 {
        match group {
            ModelGroup::Flash => self.no_cred_flash,
            ModelGroup::Pro => self.no_cred_pro,
            ModelGroup::Tier3 => self.no_cred_tier3,
        }
    }

    /// Bonus allowance granted for donating a credential of this tier, and
    /// clawed back when that credential is disabled.
    pub fn donation_reward(&self, tier: Tier) -> u64 {
        let base = self.reward_flash.saturating_add(self.reward_pro);
        match tier {
            Tier::Gemini25 => base,
            Tier::Gemini3 => base.saturating_add(self.reward_tier3),
        }
    }
}

/// Sliding one-minute request limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_base_rpm")]
    pub base_rpm: u64,
    /// Limit for users who donate at least one public credential
    #[serde(default = "default_contributor_rpm")]
    pub contributor_rpm: u64,
}

fn default_base_rpm() -> u64 {
    5
}

fn default_contributor_rpm() -> u64 {
    10
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            base_rpm: default_base_rpm(),
            contributor_rpm: default_contributor_rpm(),
        }
    }
}

/// Per-request retry budget.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    /// Retries per target; each target gets `max_retries + 1` attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Deadline for one backend call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_call_timeout() -> u64 {
    120
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

/// Background bulk refresh / verification.
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceSettings {
    /// 0 disables the periodic refresh task
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Concurrent outbound calls
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Results committed per store write
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Model used for the one-token verification probe
    #[serde(default = "default_probe_model")]
    pub probe_model: String,
    /// Probed after a successful verification to detect tier 3 access
    #[serde(default = "default_tier3_probe_model")]
    pub tier3_probe_model: String,
}

fn default_refresh_interval() -> u64 {
    1800
}

fn default_concurrency() -> usize {
    50
}

fn default_batch_size() -> usize {
    20
}

fn default_probe_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_tier3_probe_model() -> String {
    "gemini-3-pro-preview".to_string()
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
            concurrency: default_concurrency(),
            batch_size: default_batch_size(),
            probe_model: default_probe_model(),
            tier3_probe_model: default_tier3_probe_model(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_lengths_in_millis() {
        let cd = CooldownSettings {
            flash_secs: 0,
            pro_secs: 4,
            tier3_secs: 60,
        };
        assert_eq!(cd.length_ms(ModelGroup::Flash), 0);
        assert_eq!(cd.length_ms(ModelGroup::Pro), 4000);
        assert_eq!(cd.length_ms(ModelGroup::Tier3), 60_000);
    }

    #[test]
    fn donation_reward_adds_tier3_for_tier3_credentials() {
        let q = QuotaSettings {
            reward_flash: 1000,
            reward_pro: 250,
            reward_tier3: 200,
            ..QuotaSettings::default()
        };
        assert_eq!(q.donation_reward(Tier::Gemini25), 1250);
        assert_eq!(q.donation_reward(Tier::Gemini3), 1450);
    }

    #[test]
    fn serde_defaults_fill_missing_fields() {
        let cd: CooldownSettings = serde_json::from_str(r#"{"pro_secs": 5}"#).unwrap();
        assert_eq!(cd.pro_secs, 5);
        assert_eq!(cd.tier3_secs, 60);

        let m: MaintenanceSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(m.concurrency, 50);
    }
}
