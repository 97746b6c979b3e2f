//! User scheduling state and the per-user sync lock.

use crate::models::connection::FlowException;
use crate::time_utils::format_utc_rfc3339;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a run currently is; drives the watchdog's timeout choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    Locked,
    Listing,
    Downloading,
    Uploading,
    Finalizing,
}

/// Sync account stored in the `users` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Document id
    pub id: String,
    /// When the user is next due; `None` means never scheduled.
    #[serde(default)]
    pub next_sync: Option<DateTime<Utc>>,
    /// RFC3339 copy of `next_sync` used to order the due queue
    #[serde(default)]
    pub next_sync_key: Option<String>,
    /// Next run lists every connection in full
    #[serde(default)]
    pub force_exhaustive: bool,
    #[serde(default)]
    pub last_synchronized: Option<DateTime<Utc>>,
    #[serde(default)]
    pub flow_exceptions: Vec<FlowException>,
    #[serde(default)]
    pub blocking_error_count: u32,
    #[serde(default)]
    pub nonblocking_error_count: u32,
    #[serde(default)]
    pub exclusion_count: u32,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            next_sync: None,
            next_sync_key: None,
            force_exhaustive: false,
            last_synchronized: None,
            flow_exceptions: Vec::new(),
            blocking_error_count: 0,
            nonblocking_error_count: 0,
            exclusion_count: 0,
        }
    }

    pub fn schedule_at(&mut self, at: DateTime<Utc>) {
        self.next_sync = Some(at);
        self.next_sync_key = Some(format_utc_rfc3339(at));
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_sync.is_some_and(|t| t <= now)
    }
}

/// Claim on a user held by one worker, stored in `sync_locks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLock {
    pub user_id: String,
    /// Unique per run.
    pub owner: String,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub step: SyncStep,
    #[serde(default)]
    pub progress: Option<f32>,
}

impl SyncLock {
    pub fn new(user_id: &str, owner: &str, host: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            owner: owner.to_string(),
            host: host.to_string(),
            started_at: now,
            heartbeat_at: now,
            step: SyncStep::Locked,
            progress: None,
        }
    }
}
