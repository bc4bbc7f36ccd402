use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use defaults::*;
use duration_serde::duration;

/// Prefix for environment overrides, e.g. `DMM_BOOKBOT_DELIVERY__MAX_UPLOAD_SIZE`
pub const ENV_PREFIX: &str = "DMM_BOOKBOT_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub job_scheduling: JobSchedulingConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for page images, thumbnails and converted artifacts
    #[serde(default = "default_download_root")]
    pub download_root: PathBuf,
}

/// Recurring library sync settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Daily local time (`HH:MM`) every recurring sync is anchored to
    #[serde(default = "default_anchor_time")]
    pub anchor_time: String,
    /// IANA timezone the anchor time is expressed in
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Run missed syncs and rebuild recurring schedules when the scheduler starts
    #[serde(default = "default_reconcile_on_startup")]
    pub reconcile_on_startup: bool,
}

/// Concurrency limits for the job queue runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSchedulingConfig {
    #[serde(default = "default_global_max_jobs")]
    pub global_max_jobs: usize,
    #[serde(default = "default_sync_limit")]
    pub sync_limit: usize,
    #[serde(default = "default_download_limit")]
    pub download_limit: usize,
    #[serde(default = "default_conversion_limit")]
    pub conversion_limit: usize,
    #[serde(default = "default_upload_limit")]
    pub upload_limit: usize,
    #[serde(default = "default_maintenance_limit")]
    pub maintenance_limit: usize,
    #[serde(default = "default_poll_interval", with = "duration")]
    pub poll_interval: Duration,
    #[serde(default = "default_shutdown_grace", with = "duration")]
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_store_url")]
    pub store_url: String,
    #[serde(default = "default_library_url")]
    pub library_url: String,
    /// Login endpoint used directly by fast logins and as the discovery fallback
    #[serde(default = "default_login_url")]
    pub login_url: String,
    /// Substring of the post-login redirect that marks a successful login
    #[serde(default = "default_login_redirect_marker")]
    pub login_redirect_marker: String,
    #[serde(default = "default_request_timeout", with = "duration")]
    pub request_timeout: Duration,
    #[serde(default = "default_login_timeout", with = "duration")]
    pub login_timeout: Duration,
    #[serde(default = "default_max_listing_attempts")]
    pub max_listing_attempts: u32,
    #[serde(default = "default_page_retry_attempts")]
    pub page_retry_attempts: u32,
    #[serde(default = "default_retry_backoff", with = "duration")]
    pub retry_backoff: Duration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Artifacts at or above this size (bytes) are uploaded instead of sent directly
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    #[serde(default = "default_blob_upload_url")]
    pub blob_upload_url: String,
    /// Endpoint accepting `{url, token}` deletion requests, if the store supports revocation
    pub blob_delete_url: Option<String>,
    #[serde(default = "default_blob_upload_retries")]
    pub blob_upload_retries: u32,
    #[serde(default = "default_upload_retention", with = "duration")]
    pub upload_retention: Duration,
    #[serde(default = "default_upload_purge_interval", with = "duration")]
    pub upload_purge_interval: Duration,
}

fn parse_duration_default(value: &str) -> Duration {
    humantime::parse_duration(value).unwrap_or(Duration::from_secs(1))
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_download_root() -> PathBuf {
    PathBuf::from(DEFAULT_DOWNLOAD_ROOT)
}

fn default_anchor_time() -> String {
    DEFAULT_ANCHOR_TIME.to_string()
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

fn default_reconcile_on_startup() -> bool {
    DEFAULT_RECONCILE_ON_STARTUP
}

fn default_global_max_jobs() -> usize {
    DEFAULT_GLOBAL_MAX_JOBS
}

fn default_sync_limit() -> usize {
    DEFAULT_SYNC_LIMIT
}

fn default_download_limit() -> usize {
    DEFAULT_DOWNLOAD_LIMIT
}

fn default_conversion_limit() -> usize {
    DEFAULT_CONVERSION_LIMIT
}

fn default_upload_limit() -> usize {
    DEFAULT_UPLOAD_LIMIT
}

fn default_maintenance_limit() -> usize {
    DEFAULT_MAINTENANCE_LIMIT
}

fn default_poll_interval() -> Duration {
    parse_duration_default(DEFAULT_POLL_INTERVAL)
}

fn default_shutdown_grace() -> Duration {
    parse_duration_default(DEFAULT_SHUTDOWN_GRACE)
}

fn default_store_url() -> String {
    DEFAULT_STORE_URL.to_string()
}

fn default_library_url() -> String {
    DEFAULT_LIBRARY_URL.to_string()
}

fn default_login_url() -> String {
    DEFAULT_LOGIN_URL.to_string()
}

fn default_login_redirect_marker() -> String {
    DEFAULT_LOGIN_REDIRECT_MARKER.to_string()
}

fn default_request_timeout() -> Duration {
    parse_duration_default(DEFAULT_REQUEST_TIMEOUT)
}

fn default_login_timeout() -> Duration {
    parse_duration_default(DEFAULT_LOGIN_TIMEOUT)
}

fn default_max_listing_attempts() -> u32 {
    DEFAULT_MAX_LISTING_ATTEMPTS
}

fn default_page_retry_attempts() -> u32 {
    DEFAULT_PAGE_RETRY_ATTEMPTS
}

fn default_retry_backoff() -> Duration {
    parse_duration_default(DEFAULT_RETRY_BACKOFF)
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_max_upload_size() -> u64 {
    DEFAULT_MAX_UPLOAD_SIZE
}

fn default_blob_upload_url() -> String {
    DEFAULT_BLOB_UPLOAD_URL.to_string()
}

fn default_blob_upload_retries() -> u32 {
    DEFAULT_BLOB_UPLOAD_RETRIES
}

fn default_upload_retention() -> Duration {
    parse_duration_default(DEFAULT_UPLOAD_RETENTION)
}

fn default_upload_purge_interval() -> Duration {
    parse_duration_default(DEFAULT_UPLOAD_PURGE_INTERVAL)
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: Some(DEFAULT_MAX_CONNECTIONS),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_root: default_download_root(),
        }
    }
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            anchor_time: default_anchor_time(),
            timezone: default_timezone(),
            reconcile_on_startup: default_reconcile_on_startup(),
        }
    }
}

impl Default for JobSchedulingConfig {
    fn default() -> Self {
        Self {
            global_max_jobs: default_global_max_jobs(),
            sync_limit: default_sync_limit(),
            download_limit: default_download_limit(),
            conversion_limit: default_conversion_limit(),
            upload_limit: default_upload_limit(),
            maintenance_limit: default_maintenance_limit(),
            poll_interval: default_poll_interval(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            library_url: default_library_url(),
            login_url: default_login_url(),
            login_redirect_marker: default_login_redirect_marker(),
            request_timeout: default_request_timeout(),
            login_timeout: default_login_timeout(),
            max_listing_attempts: default_max_listing_attempts(),
            page_retry_attempts: default_page_retry_attempts(),
            retry_backoff: default_retry_backoff(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_upload_size: default_max_upload_size(),
            blob_upload_url: default_blob_upload_url(),
            blob_delete_url: None,
            blob_upload_retries: default_blob_upload_retries(),
            upload_retention: default_upload_retention(),
            upload_purge_interval: default_upload_purge_interval(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from_file(&config_file)
    }

    /// Load configuration from a TOML file layered over defaults, with
    /// `DMM_BOOKBOT_` environment overrides on top. A missing file is created
    /// with the default settings.
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        let path = Path::new(config_file);
        if !path.exists() {
            let contents = toml::to_string_pretty(&Self::default())?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, contents)?;
            info!("Created default config file: {}", config_file);
        }

        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {config_file}"))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        crate::job_scheduling::SyncAnchor::from_config(&self.scheduling)
            .context("Invalid [scheduling] section")?;

        let limits = &self.job_scheduling;
        if limits.global_max_jobs == 0 {
            anyhow::bail!("job_scheduling.global_max_jobs must be greater than zero");
        }
        for (name, value) in [
            ("sync_limit", limits.sync_limit),
            ("download_limit", limits.download_limit),
            ("conversion_limit", limits.conversion_limit),
            ("upload_limit", limits.upload_limit),
            ("maintenance_limit", limits.maintenance_limit),
        ] {
            if value == 0 {
                anyhow::bail!("job_scheduling.{name} must be greater than zero");
            }
        }
        if limits.poll_interval.is_zero() {
            anyhow::bail!("job_scheduling.poll_interval must be greater than zero");
        }
        if self.delivery.upload_purge_interval.is_zero() {
            anyhow::bail!("delivery.upload_purge_interval must be greater than zero");
        }

        if self.remote.max_listing_attempts == 0 || self.remote.page_retry_attempts == 0 {
            anyhow::bail!("remote retry attempts must be greater than zero");
        }

        Ok(())
    }
}
