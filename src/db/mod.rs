// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Durable store for users, connections, activity records and sync locks.
//!
//! [`SyncStore`] is implemented by [`FirestoreDb`] for deployments and by
//! [`MemoryStore`] for tests and local runs.

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreDb;
pub use memory::MemoryStore;

use crate::error::AppError;
use crate::models::{ActivityRecord, ConnectionRecord, SyncLock, SyncStep, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Collection names as constants.
pub mod collections {
    pub const USERS: &str = "users";
    pub const CONNECTIONS: &str = "connections";
    pub const ACTIVITY_RECORDS: &str = "activity_records";
    /// One document per locked user, keyed by user id
    pub const SYNC_LOCKS: &str = "sync_locks";
}

/// Everything a finished run writes back, committed together with the
/// release of the run's lock.
#[derive(Debug, Clone)]
pub struct RunCommit {
    pub user: User,
    pub connections: Vec<ConnectionRecord>,
    pub records: Vec<ActivityRecord>,
    pub pruned_record_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl RunCommit {
    /// Keep triggers that arrived while the run was in progress: the
    /// connection stays flagged and the user is due again right away.
    pub fn reconcile_concurrent_triggers(&mut self, stored: &[ConnectionRecord], now: DateTime<Utc>) {
        let mut retrigger = false;
        for connection in &mut self.connections {
            let Some(current) = stored.iter().find(|c| c.id == connection.id) else {
                continue;
            };
            if let Some(at) = current.last_triggered_at {
                if current.trigger_pending && at > self.started_at {
                    connection.mark_triggered(at);
                    retrigger = true;
                }
            }
        }
        if retrigger && self.user.next_sync.is_none_or(|t| t > now) {
            self.user.schedule_at(now);
        }
    }
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError>;

    async fn upsert_user(&self, user: &User) -> Result<(), AppError>;

    async fn get_connections(&self, user_id: &str) -> Result<Vec<ConnectionRecord>, AppError>;

    async fn upsert_connection(&self, connection: &ConnectionRecord) -> Result<(), AppError>;

    /// Connections of `service` whose external account id is in `external_ids`.
    async fn find_connections(
        &self,
        service: &str,
        external_ids: &[String],
    ) -> Result<Vec<ConnectionRecord>, AppError>;

    /// Narrow write flagging a pending partial-sync trigger.
    async fn flag_connection_triggered(
        &self,
        connection_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Narrow early write recording UIDs delivered to a connection.
    async fn mark_synchronized(&self, connection_id: &str, uids: &[String]) -> Result<(), AppError>;

    async fn get_activity_records(&self, user_id: &str) -> Result<Vec<ActivityRecord>, AppError>;

    /// Unlocked users due at `now`, earliest first.
    async fn due_users(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, AppError>;

    /// Make the user due no later than `at`.
    async fn schedule_user(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        force_exhaustive: bool,
    ) -> Result<(), AppError>;

    async fn get_lock(&self, user_id: &str) -> Result<Option<SyncLock>, AppError>;

    async fn list_locks(&self) -> Result<Vec<SyncLock>, AppError>;

    /// Compare-and-swap claim: succeeds only if the user holds no lock.
    async fn try_claim_user(&self, lock: &SyncLock) -> Result<bool, AppError>;

    /// Refresh the heartbeat; false if `owner` no longer holds the lock.
    async fn renew_lock(
        &self,
        user_id: &str,
        owner: &str,
        step: SyncStep,
        progress: Option<f32>,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Remove the lock if `owner` still holds it.
    async fn release_lock(&self, user_id: &str, owner: &str) -> Result<bool, AppError>;

    /// Write back a run and release its lock. Fails with `LockLost` if
    /// `owner` no longer holds the lock, in which case nothing is written.
    async fn finalize_run(&self, owner: &str, commit: RunCommit) -> Result<(), AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_reconcile_keeps_late_triggers() {
        let started_at = Utc::now() - Duration::minutes(5);
        let now = Utc::now();
        let mut user = User::new("u1");
        user.schedule_at(now + Duration::hours(1));

        let mut early = ConnectionRecord::new("c1", "u1", "sandbox", "a");
        let late = ConnectionRecord::new("c2", "u1", "sandbox", "b");
        let mut commit = RunCommit {
            user,
            connections: vec![early.clone(), late.clone()],
            records: Vec::new(),
            pruned_record_ids: Vec::new(),
            started_at,
        };

        early.mark_triggered(started_at - Duration::minutes(1));
        let mut late_stored = late;
        late_stored.mark_triggered(now - Duration::minutes(1));

        commit.reconcile_concurrent_triggers(&[early, late_stored], now);
        assert!(!commit.connections[0].trigger_pending);
        assert!(commit.connections[1].trigger_pending);
        assert_eq!(commit.user.next_sync, Some(now));
    }
}
