//! Application configuration loaded from environment variables.
//!
//! Values are read once at startup; tests use `Config::default()`.

use crate::services::coalesce::CoalesceTolerances;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which durable store backs the scheduler and sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Firestore,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "firestore" => Ok(StoreBackend::Firestore),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(ConfigError::Invalid("STORE_BACKEND", s.to_string())),
        }
    }
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    pub port: u16,
    /// GCP project ID
    pub gcp_project_id: String,
    pub store_backend: StoreBackend,
    /// Host name recorded in sync locks
    pub hostname: String,

    // --- Scheduler ---
    pub sync_workers: usize,
    pub sync_interval: Duration,
    pub sync_jitter: Duration,
    pub worker_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub watchdog_interval: Duration,
    /// Heartbeat timeout while listing
    pub watchdog_listing_timeout: Duration,
    /// Heartbeat timeout for every other step
    pub watchdog_step_timeout: Duration,

    // --- Partial sync triggers ---
    pub trigger_poll_interval: Duration,
    /// Trigger-driven connections are listed anyway after this long
    pub trigger_force_poll_after: Duration,
    pub trigger_verify_token: String,
    pub trigger_path_uuid: String,

    /// Service kinds to download from first, in order
    pub download_priority: Vec<String>,
    pub coalesce: CoalesceTolerances,

    // --- Secrets ---
    /// Bearer token for the admin API
    pub admin_token: String,
}

impl Default for Config {
    /// Default config for testing only.
    fn default() -> Self {
        Self {
            port: 8080,
            gcp_project_id: "test-project".to_string(),
            store_backend: StoreBackend::Memory,
            hostname: "test-host".to_string(),
            sync_workers: 2,
            sync_interval: Duration::from_secs(3600),
            sync_jitter: Duration::from_secs(300),
            worker_poll_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(30),
            watchdog_interval: Duration::from_secs(60),
            watchdog_listing_timeout: Duration::from_secs(1800),
            watchdog_step_timeout: Duration::from_secs(600),
            trigger_poll_interval: Duration::from_secs(300),
            trigger_force_poll_after: Duration::from_secs(86400),
            trigger_verify_token: "test_verify_token".to_string(),
            trigger_path_uuid: "test-trigger-uuid".to_string(),
            download_priority: Vec::new(),
            coalesce: CoalesceTolerances::default(),
            admin_token: "test_admin_token".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let coalesce = CoalesceTolerances {
            start_leeway: chrono::Duration::seconds(env_parse("COALESCE_START_LEEWAY_SECS", 180)?),
            tz_error_window: chrono::Duration::hours(env_parse(
                "COALESCE_TZ_ERROR_WINDOW_HOURS",
                38,
            )?),
            half_zone: chrono::Duration::minutes(env_parse("COALESCE_HALF_ZONE_MINUTES", 30)?),
        };

        Ok(Self {
            port: env_parse("PORT", 8080)?,
            gcp_project_id: env::var("GCP_PROJECT_ID").unwrap_or_else(|_| "local-dev".to_string()),
            store_backend: env::var("STORE_BACKEND")
                .unwrap_or_else(|_| "firestore".to_string())
                .parse()?,
            hostname: env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            sync_workers: env_parse("SYNC_WORKERS", 4)?,
            sync_interval: env_secs("SYNC_INTERVAL_SECS", 3600)?,
            sync_jitter: env_secs("SYNC_JITTER_SECS", 300)?,
            worker_poll_interval: env_secs("WORKER_POLL_INTERVAL_SECS", 5)?,
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL_SECS", 30)?,
            watchdog_interval: env_secs("WATCHDOG_INTERVAL_SECS", 60)?,
            watchdog_listing_timeout: env_secs("WATCHDOG_LISTING_TIMEOUT_SECS", 1800)?,
            watchdog_step_timeout: env_secs("WATCHDOG_STEP_TIMEOUT_SECS", 600)?,
            trigger_poll_interval: env_secs("TRIGGER_POLL_INTERVAL_SECS", 300)?,
            trigger_force_poll_after: env_secs("TRIGGER_FORCE_POLL_AFTER_SECS", 86400)?,
            trigger_verify_token: env::var("TRIGGER_VERIFY_TOKEN")
                .map(|v| v.trim().to_string())
                .map_err(|_| ConfigError::Missing("TRIGGER_VERIFY_TOKEN"))?,
            trigger_path_uuid: env::var("TRIGGER_PATH_UUID")
                .map(|v| v.trim().to_string())
                .map_err(|_| ConfigError::Missing("TRIGGER_PATH_UUID"))?,
            download_priority: env::var("DOWNLOAD_PRIORITY")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            coalesce,
            admin_token: env::var("ADMIN_TOKEN")
                .map(|v| v.trim().to_string())
                .map_err(|_| ConfigError::Missing("ADMIN_TOKEN"))?,
        })
    }
}

fn env_parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, raw)),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    env_parse(name, default).map(Duration::from_secs)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
