// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Errors surfaced by the store, the sync runs and the HTTP routes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// No connector is registered for this service kind.
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// A sync run currently holds this user's lock.
    #[error("User {0} is being synchronized")]
    UserLocked(String),

    #[error("Database error: {0}")]
    Database(String),

    /// The sync lock for this user is no longer held by the caller.
    #[error("Sync lock lost for user {0}")]
    LockLost(String),
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.clone())),
            AppError::UnknownService(service) => (
                StatusCode::NOT_FOUND,
                "unknown_service",
                Some(service.clone()),
            ),
            AppError::UserLocked(user_id) => (
                StatusCode::CONFLICT,
                "sync_in_progress",
                Some(user_id.clone()),
            ),
            AppError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None)
            }
            AppError::LockLost(user_id) => {
                tracing::warn!(user_id = %user_id, "Sync lock lost");
                (StatusCode::CONFLICT, "lock_lost", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers and store operations
pub type Result<T> = std::result::Result<T, AppError>;
