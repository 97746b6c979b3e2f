// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Reclaims users whose run stopped heartbeating.

use crate::error::AppError;
use crate::models::{SyncLock, SyncStep};
use crate::time_utils::to_chrono;
use crate::AppState;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Heartbeat age after which a lock is considered abandoned.
fn timeout_for(state: &AppState, lock: &SyncLock) -> chrono::Duration {
    match lock.step {
        SyncStep::Listing => to_chrono(state.config.watchdog_listing_timeout),
        _ => to_chrono(state.config.watchdog_step_timeout),
    }
}

/// Release every stale lock and make its user due now. A local run still
/// holding the lock is aborted first. Returns the number of locks released.
pub async fn check_once(state: &AppState, now: DateTime<Utc>) -> Result<usize, AppError> {
    let mut released = 0;
    for lock in state.store.list_locks().await? {
        let age = now - lock.heartbeat_at;
        if age <= timeout_for(state, &lock) {
            continue;
        }

        tracing::warn!(
            user_id = %lock.user_id,
            owner = %lock.owner,
            host = %lock.host,
            step = ?lock.step,
            age_secs = age.num_seconds(),
            "Sync lock timed out"
        );

        if let Some((_, run)) = state
            .active_runs
            .remove_if(&lock.user_id, |_, run| run.owner == lock.owner)
        {
            run.handle.abort();
        }
        if state.store.release_lock(&lock.user_id, &lock.owner).await? {
            state.store.schedule_user(&lock.user_id, now, false).await?;
            released += 1;
        }
    }

    state.active_runs.retain(|_, run| !run.handle.is_finished());
    Ok(released)
}

/// Check forever.
pub async fn run(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(state.config.watchdog_interval);
    loop {
        ticker.tick().await;
        match check_once(&state, Utc::now()).await {
            Ok(0) => {}
            Ok(released) => tracing::info!(released, "Watchdog released stale locks"),
            Err(e) => tracing::error!(error = %e, "Watchdog check failed"),
        }
    }
}
