// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Admin API routes.

use crate::error::{AppError, Result};
use crate::models::{SyncLock, User};
use crate::services::journal::dismiss_clear_group;
use crate::AppState;
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

/// Admin routes (require the admin bearer token).
/// The auth middleware is applied in routes/mod.rs for these routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/users/{user_id}", get(get_user_status))
        .route(
            "/api/users/{user_id}/dismiss/{clear_group}",
            post(dismiss),
        )
}

// ─── Status ──────────────────────────────────────────────────

/// Errors and exclusions recorded on one connection.
#[derive(Serialize)]
pub struct ConnectionStatus {
    pub id: String,
    pub service: String,
    pub blocking_errors: usize,
    pub excluded_activities: usize,
    pub trigger_pending: bool,
    pub clear_groups: Vec<String>,
}

#[derive(Serialize)]
pub struct UserStatusResponse {
    pub user: User,
    pub lock: Option<SyncLock>,
    pub connections: Vec<ConnectionStatus>,
}

/// Scheduling state, lock and per-connection error summary for a user.
async fn get_user_status(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UserStatusResponse>> {
    let user = state
        .store
        .get_user(&user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))?;
    let lock = state.store.get_lock(&user_id).await?;

    let connections = state
        .store
        .get_connections(&user_id)
        .await?
        .into_iter()
        .map(|c| {
            let mut clear_groups: Vec<String> = c
                .sync_errors
                .iter()
                .filter_map(|e| e.clear_group().map(str::to_string))
                .chain(
                    c.excluded_activities
                        .values()
                        .filter_map(|e| e.reason.clear_group.clone()),
                )
                .collect();
            clear_groups.sort();
            clear_groups.dedup();
            ConnectionStatus {
                blocking_errors: c.blocking_errors().count(),
                excluded_activities: c.excluded_activities.len(),
                trigger_pending: c.trigger_pending,
                clear_groups,
                id: c.id,
                service: c.service,
            }
        })
        .collect();

    Ok(Json(UserStatusResponse {
        user,
        lock,
        connections,
    }))
}

// ─── Dismissal ───────────────────────────────────────────────

#[derive(Serialize)]
pub struct DismissResponse {
    pub removed: usize,
}

/// Dismiss every error and exclusion in a clear group.
async fn dismiss(
    State(state): State<Arc<AppState>>,
    Path((user_id, clear_group)): Path<(String, String)>,
) -> Result<Json<DismissResponse>> {
    let removed =
        dismiss_clear_group(state.store.as_ref(), &user_id, &clear_group, Utc::now()).await?;
    Ok(Json(DismissResponse { removed }))
}
