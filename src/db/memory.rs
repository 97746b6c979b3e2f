// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-process store backed by `DashMap`, for tests and local runs.
//!
//! The lock map is the source of truth for claims: a claim is a vacant-entry
//! insert and the finalize write happens while the occupied entry is held.

use crate::db::{RunCommit, SyncStore};
use crate::error::AppError;
use crate::models::{ActivityRecord, ConnectionRecord, SyncLock, SyncStep, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<String, User>,
    connections: DashMap<String, ConnectionRecord>,
    records: DashMap<String, ActivityRecord>,
    locks: DashMap<String, SyncLock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_commit(&self, commit: RunCommit) {
        for id in &commit.pruned_record_ids {
            self.records.remove(id);
        }
        for record in commit.records {
            self.records.insert(record.id.clone(), record);
        }
        for connection in commit.connections {
            self.connections.insert(connection.id.clone(), connection);
        }
        self.users.insert(commit.user.id.clone(), commit.user);
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }

    async fn upsert_user(&self, user: &User) -> Result<(), AppError> {
        self.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get_connections(&self, user_id: &str) -> Result<Vec<ConnectionRecord>, AppError> {
        let mut connections: Vec<ConnectionRecord> = self
            .connections
            .iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.clone())
            .collect();
        connections.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(connections)
    }

    async fn upsert_connection(&self, connection: &ConnectionRecord) -> Result<(), AppError> {
        self.connections
            .insert(connection.id.clone(), connection.clone());
        Ok(())
    }

    async fn find_connections(
        &self,
        service: &str,
        external_ids: &[String],
    ) -> Result<Vec<ConnectionRecord>, AppError> {
        Ok(self
            .connections
            .iter()
            .filter(|c| c.service == service && external_ids.contains(&c.external_id))
            .map(|c| c.clone())
            .collect())
    }

    async fn flag_connection_triggered(
        &self,
        connection_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut connection = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| AppError::NotFound(format!("connection {}", connection_id)))?;
        connection.mark_triggered(at);
        Ok(())
    }

    async fn mark_synchronized(&self, connection_id: &str, uids: &[String]) -> Result<(), AppError> {
        let mut connection = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| AppError::NotFound(format!("connection {}", connection_id)))?;
        connection
            .synchronized_activities
            .extend(uids.iter().cloned());
        Ok(())
    }

    async fn get_activity_records(&self, user_id: &str) -> Result<Vec<ActivityRecord>, AppError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.clone())
            .collect())
    }

    async fn due_users(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, AppError> {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .users
            .iter()
            .filter(|u| u.is_due(now) && !self.locks.contains_key(&u.id))
            .filter_map(|u| u.next_sync.map(|t| (t, u.id.clone())))
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn schedule_user(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        force_exhaustive: bool,
    ) -> Result<(), AppError> {
        let mut user = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| User::new(user_id));
        if user.next_sync.is_none_or(|t| t > at) {
            user.schedule_at(at);
        }
        user.force_exhaustive |= force_exhaustive;
        Ok(())
    }

    async fn get_lock(&self, user_id: &str) -> Result<Option<SyncLock>, AppError> {
        Ok(self.locks.get(user_id).map(|l| l.clone()))
    }

    async fn list_locks(&self) -> Result<Vec<SyncLock>, AppError> {
        Ok(self.locks.iter().map(|l| l.clone()).collect())
    }

    async fn try_claim_user(&self, lock: &SyncLock) -> Result<bool, AppError> {
        match self.locks.entry(lock.user_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(lock.clone());
                Ok(true)
            }
        }
    }

    async fn renew_lock(
        &self,
        user_id: &str,
        owner: &str,
        step: SyncStep,
        progress: Option<f32>,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        match self.locks.get_mut(user_id) {
            Some(mut lock) if lock.owner == owner => {
                lock.step = step;
                lock.progress = progress;
                lock.heartbeat_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, user_id: &str, owner: &str) -> Result<bool, AppError> {
        Ok(self
            .locks
            .remove_if(user_id, |_, lock| lock.owner == owner)
            .is_some())
    }

    async fn finalize_run(&self, owner: &str, mut commit: RunCommit) -> Result<(), AppError> {
        let user_id = commit.user.id.clone();
        let stored = self.get_connections(&user_id).await?;
        commit.reconcile_concurrent_triggers(&stored, Utc::now());

        match self.locks.entry(user_id.clone()) {
            Entry::Occupied(lock) if lock.get().owner == owner => {
                self.write_commit(commit);
                lock.remove();
                Ok(())
            }
            _ => Err(AppError::LockLost(user_id)),
        }
    }
}
