// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Inbound partial-sync trigger callbacks from connected services.

use crate::error::{AppError, Result};
use crate::services::trigger::flag_partial_sync_trigger;
use crate::AppState;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Trigger routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route(
        "/sync/remote_trigger/{service}/{uuid}",
        get(verify).post(handle_trigger),
    )
}

/// Subscription verification query params.
#[derive(Deserialize)]
struct VerifyParams {
    #[serde(rename = "hub.mode")]
    mode: String,
    #[serde(rename = "hub.challenge")]
    challenge: String,
    #[serde(rename = "hub.verify_token")]
    verify_token: String,
}

/// Verification response.
#[derive(Serialize, Default)]
struct VerifyResponse {
    #[serde(rename = "hub.challenge")]
    challenge: String,
}

/// Verify a trigger subscription (GET).
async fn verify(
    State(state): State<Arc<AppState>>,
    Path((service, uuid)): Path<(String, String)>,
    Query(params): Query<VerifyParams>,
) -> impl IntoResponse {
    if uuid != state.config.trigger_path_uuid || state.registry.get(&service).is_none() {
        tracing::warn!(
            service = %service,
            received_uuid = %uuid,
            "Security Alert: trigger path mismatch (verify)"
        );
        return (StatusCode::NOT_FOUND, Json(VerifyResponse::default()));
    }

    if params.mode == "subscribe" && params.verify_token == state.config.trigger_verify_token {
        tracing::info!(service = %service, "Trigger subscription verified");
        (
            StatusCode::OK,
            Json(VerifyResponse {
                challenge: params.challenge,
            }),
        )
    } else {
        tracing::warn!(
            service = %service,
            mode = %params.mode,
            "Trigger verification failed: invalid token"
        );
        (StatusCode::FORBIDDEN, Json(VerifyResponse::default()))
    }
}

/// Handle a pushed trigger (POST).
async fn handle_trigger(
    State(state): State<Arc<AppState>>,
    Path((service, uuid)): Path<(String, String)>,
    Json(payload): Json<serde_json::Value>,
) -> Result<StatusCode> {
    if uuid != state.config.trigger_path_uuid {
        tracing::warn!(
            service = %service,
            received_uuid = %uuid,
            "Security Alert: trigger path UUID mismatch"
        );
        return Ok(StatusCode::NOT_FOUND);
    }
    let Some(connector) = state.registry.get(&service) else {
        tracing::warn!(service = %service, "Trigger for unknown service");
        return Err(AppError::UnknownService(service));
    };

    let external_ids = match connector.service_record_ids_for_partial_sync_trigger(&payload) {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(service = %service, error = %e, "Failed to parse trigger payload");
            // Still 200 so the service does not retry a payload we cannot read
            return Ok(StatusCode::OK);
        }
    };

    flag_partial_sync_trigger(state.store.as_ref(), &service, &external_ids, Utc::now()).await?;
    Ok(StatusCode::OK)
}
