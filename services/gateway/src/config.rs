//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The OAuth client secret comes from GATEWAY_OAUTH_CLIENT_SECRET or
//! `client_secret_file`, never from the TOML itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use common::Secret;
use credential_pool::{
    CooldownSettings, MIN_USAGE_RETENTION, MaintenanceSettings, ModelGroup, ModelTable, OAuthSettings,
    PoolVisibilityMode, QuotaSettings, RateLimitSettings, RetrySettings,
};
use serde::Deserialize;

pub const CLIENT_SECRET_ENV: &str = "GATEWAY_OAUTH_CLIENT_SECRET";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub cooldown: CooldownSettings,
    #[serde(default)]
    pub quota: QuotaSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub maintenance: MaintenanceSettings,
    #[serde(default)]
    pub models: ModelsConfig,
    /// Backend targets in fallback order
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Separate listener for the admin API; disabled when unset. Not
    /// authenticated, bind it to a private interface only.
    #[serde(default)]
    pub admin_listen_addr: Option<SocketAddr>,
    /// Upper bound for one outbound HTTP request to a target
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// How often the state snapshot is written; 0 writes only on shutdown
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
    /// Usage entries older than this are dropped; must cover a quota day
    #[serde(default = "default_usage_retention")]
    pub usage_retention_hours: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            snapshot_interval_secs: default_snapshot_interval(),
            usage_retention_hours: default_usage_retention(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub mode: PoolVisibilityMode,
    #[serde(flatten)]
    pub retry: RetrySettings,
}

#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file holding the client secret (alternative to the env var)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_endpoint: default_token_endpoint(),
            client_id: String::new(),
            client_secret: None,
            client_secret_file: None,
        }
    }
}

impl OAuthConfig {
    pub fn settings(&self) -> OAuthSettings {
        OAuthSettings {
            token_endpoint: self.token_endpoint.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }
}

/// Model id → group table on top of the built-in entries.
#[derive(Debug, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub entries: HashMap<String, ModelGroup>,
    #[serde(default = "default_fallback_group")]
    pub fallback: ModelGroup,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            fallback: default_fallback_group(),
        }
    }
}

impl ModelsConfig {
    pub fn table(&self) -> ModelTable {
        ModelTable::new(self.fallback)
            .with_entries(self.entries.iter().map(|(id, group)| (id, *group)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub url: String,
    /// Model id prefixes this target serves; empty serves everything
    #[serde(default)]
    pub families: Vec<String>,
}

fn default_timeout() -> u64 {
    120
}

fn default_max_connections() -> usize {
    1000
}

fn default_store_path() -> PathBuf {
    PathBuf::from("pool-gateway-state.json")
}

fn default_snapshot_interval() -> u64 {
    30
}

fn default_usage_retention() -> u64 {
    48
}

fn default_token_endpoint() -> String {
    OAuthSettings::default().token_endpoint
}

fn default_fallback_group() -> ModelGroup {
    ModelGroup::Flash
}

fn require_http(field: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )))
    }
}

fn require_positive(field: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

/// Env var first, then the file (trimmed, empty means unset).
fn resolve_secret(env: &str, file: Option<&Path>) -> common::Result<Option<Secret<String>>> {
    if let Ok(value) = std::env::var(env) {
        return Ok(Some(Secret::new(value)));
    }
    let Some(file) = file else {
        return Ok(None);
    };
    let value = std::fs::read_to_string(file).map_err(|e| {
        common::Error::Config(format!("failed to read {}: {e}", file.display()))
    })?;
    let value = value.trim().to_owned();
    Ok((!value.is_empty()).then(|| Secret::new(value)))
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve secrets.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        config.oauth.client_secret =
            resolve_secret(CLIENT_SECRET_ENV, config.oauth.client_secret_file.as_deref())?;

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_positive("server.timeout_secs", self.server.timeout_secs)?;
        require_positive("server.max_connections", self.server.max_connections as u64)?;
        require_positive("pool.call_timeout_secs", self.pool.retry.call_timeout_secs)?;
        require_positive("maintenance.concurrency", self.maintenance.concurrency as u64)?;
        require_positive("maintenance.batch_size", self.maintenance.batch_size as u64)?;
        if self.quota.reset_hour_utc >= 24 {
            return Err(common::Error::Config(format!(
                "quota.reset_hour_utc must be below 24, got: {}",
                self.quota.reset_hour_utc
            )));
        }
        require_http("oauth.token_endpoint", &self.oauth.token_endpoint)?;
        let min_retention_hours = MIN_USAGE_RETENTION.as_secs() / 3600;
        if self.store.usage_retention_hours < min_retention_hours {
            return Err(common::Error::Config(format!(
                "store.usage_retention_hours must be at least {min_retention_hours}, got: {}",
                self.store.usage_retention_hours
            )));
        }

        if self.targets.is_empty() {
            return Err(common::Error::Config(
                "at least one [[targets]] entry is required".into(),
            ));
        }
        for target in &self.targets {
            if target.name.trim().is_empty() {
                return Err(common::Error::Config("target name must not be empty".into()));
            }
            require_http(&format!("targets.{}.url", target.name), &target.url)?;
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("pool-gateway.toml")
    }
}
