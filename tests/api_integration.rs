// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Admin API and health endpoint tests.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use chrono::Utc;
use fitsync::models::{
    ErrorScope, ReasonCode, SyncErrorEntry, SyncLock, SyncStep, UserException,
};
use std::sync::Arc;
use tower::ServiceExt;

mod common;
use common::{connection, create_test_app, seed_user};

const ADMIN_TOKEN: &str = "test_admin_token"; // Matches Config::default()

fn dismiss_request(user_id: &str, group: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/api/users/{}/dismiss/{}", user_id, group));
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

async fn seed_blocked_user(state: &fitsync::AppState) {
    seed_user(state, "u1", &[("c1", "sandbox", "acct-a")]).await;
    let mut conn = connection(state, "u1", "c1").await;
    conn.sync_errors.push(SyncErrorEntry {
        message: "token revoked".to_string(),
        step: SyncStep::Listing,
        scope: ErrorScope::Account,
        block: true,
        user_exception: Some(
            UserException::new(ReasonCode::Authorization).with_clear_group("reauth"),
        ),
        trigger_exhaustive: false,
        recorded_at: Utc::now(),
    });
    state.store.upsert_connection(&conn).await.unwrap();
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health() {
    let (app, _state) = create_test_app(&[]);
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("X-Frame-Options").unwrap(), "DENY");
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["active_runs"], 0);
}

#[tokio::test]
async fn test_dismiss_requires_token() {
    let (app, _state) = create_test_app(&[]);

    let response = app
        .clone()
        .oneshot(dismiss_request("u1", "reauth", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(dismiss_request("u1", "reauth", Some("wrong_token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_dismiss_clears_group_and_schedules() {
    let sandbox = Arc::new(fitsync::connectors::SandboxConnector::new("sandbox"));
    let (app, state) = create_test_app(&[sandbox]);
    seed_blocked_user(&state).await;

    let response = app
        .oneshot(dismiss_request("u1", "reauth", Some(ADMIN_TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["removed"], 1);

    let conn = connection(&state, "u1", "c1").await;
    assert!(conn.sync_errors.is_empty());
    assert!(conn.force_exhaustive);
    assert!(state.store.get_user("u1").await.unwrap().unwrap().is_due(Utc::now()));
}

#[tokio::test]
async fn test_dismiss_unknown_user() {
    let (app, _state) = create_test_app(&[]);
    let response = app
        .oneshot(dismiss_request("nobody", "reauth", Some(ADMIN_TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "not_found");
}

#[tokio::test]
async fn test_dismiss_while_locked_conflicts() {
    let (app, state) = create_test_app(&[]);
    seed_blocked_user(&state).await;
    state
        .store
        .try_claim_user(&SyncLock::new("u1", "w1", "host", Utc::now()))
        .await
        .unwrap();

    let response = app
        .oneshot(dismiss_request("u1", "reauth", Some(ADMIN_TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["error"], "sync_in_progress");
    assert_eq!(connection(&state, "u1", "c1").await.sync_errors.len(), 1);
}

#[tokio::test]
async fn test_user_status() {
    let (app, state) = create_test_app(&[]);
    seed_blocked_user(&state).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/users/u1")
                .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["user"]["id"], "u1");
    assert!(json["lock"].is_null());
    assert_eq!(json["connections"][0]["blocking_errors"], 1);
    assert_eq!(json["connections"][0]["clear_groups"][0], "reauth");
}
