// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-run error and exclusion journals.
//!
//! Each run starts with empty journals and replaces the persisted ones when
//! it finishes: only blocking errors and permanent exclusions are written
//! back, so anything transient disappears on the next clean run.

use crate::db::SyncStore;
use crate::error::AppError;
use crate::models::connection::ExcludedActivity;
use crate::models::{ConnectionId, ConnectionRecord, SyncErrorEntry};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct SyncJournal {
    errors: BTreeMap<ConnectionId, Vec<SyncErrorEntry>>,
    exclusions: BTreeMap<ConnectionId, BTreeMap<String, ExcludedActivity>>,
}

impl SyncJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&mut self, connection_id: &str, entry: SyncErrorEntry) {
        self.errors
            .entry(connection_id.to_string())
            .or_default()
            .push(entry);
    }

    /// Record an exclusion under an already sanitized key.
    pub fn record_exclusion(&mut self, connection_id: &str, key: String, exclusion: ExcludedActivity) {
        self.exclusions
            .entry(connection_id.to_string())
            .or_default()
            .insert(key, exclusion);
    }

    pub fn errors(&self, connection_id: &str) -> &[SyncErrorEntry] {
        self.errors
            .get(connection_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Exclusions raised this run, permanent or not.
    pub fn exclusions(&self, connection_id: &str) -> Option<&BTreeMap<String, ExcludedActivity>> {
        self.exclusions.get(connection_id)
    }

    pub fn has_blocking_errors(&self) -> bool {
        self.errors.values().flatten().any(|e| e.block)
    }

    /// Some error asks for the next run to list everything.
    pub fn triggers_exhaustive(&self) -> bool {
        self.errors.values().flatten().any(|e| e.trigger_exhaustive)
    }

    pub fn nonblocking_error_count(&self) -> u32 {
        self.errors.values().flatten().filter(|e| !e.block).count() as u32
    }

    /// Temporary exclusions are never persisted but still count for the user.
    pub fn temporary_exclusion_count(&self) -> u32 {
        self.exclusions
            .values()
            .flat_map(BTreeMap::values)
            .filter(|e| !e.permanent)
            .count() as u32
    }

    /// Replace a connection's persisted journals with this run's.
    ///
    /// A connection skipped for persisted blocking errors keeps them.
    pub fn write_back(&self, connection: &mut ConnectionRecord, carried_over: bool) {
        if !carried_over {
            connection.sync_errors = self
                .errors(&connection.id)
                .iter()
                .filter(|e| e.block)
                .cloned()
                .collect();
        }
        if let Some(exclusions) = self.exclusions.get(&connection.id) {
            connection.excluded_activities.extend(
                exclusions
                    .iter()
                    .filter(|(_, e)| e.permanent)
                    .map(|(k, e)| (k.clone(), e.clone())),
            );
        }
    }
}

/// Dismiss every error and exclusion of `user_id` carrying `clear_group`.
///
/// Affected connections are forced exhaustive and the user is scheduled
/// right away. Returns the number of entries removed.
pub async fn dismiss_clear_group(
    store: &dyn SyncStore,
    user_id: &str,
    clear_group: &str,
    now: DateTime<Utc>,
) -> Result<usize, AppError> {
    if store.get_user(user_id).await?.is_none() {
        return Err(AppError::NotFound(format!("user {}", user_id)));
    }
    if store.get_lock(user_id).await?.is_some() {
        return Err(AppError::UserLocked(user_id.to_string()));
    }

    let mut removed = 0;
    for mut connection in store.get_connections(user_id).await? {
        let count = connection.dismiss_clear_group(clear_group);
        if count > 0 {
            store.upsert_connection(&connection).await?;
            removed += count;
        }
    }

    if removed > 0 {
        store.schedule_user(user_id, now, false).await?;
    }
    tracing::info!(user_id, clear_group, removed, "Dismissed clear group");
    Ok(removed)
}
