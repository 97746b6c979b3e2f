// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use fitsync::config::Config;
use fitsync::connectors::{ConnectorRegistry, SandboxConnector};
use fitsync::db::{FirestoreDb, MemoryStore, SyncStore};
use fitsync::error::AppError;
use fitsync::models::{Activity, ActivityType, ConnectionRecord, SyncLock, User};
use fitsync::routes::create_router;
use fitsync::services::scheduler::run_claimed_user;
use fitsync::services::SyncReport;
use fitsync::AppState;
use std::sync::Arc;

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Create a test database connection.
#[allow(dead_code)]
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
}

/// Create a test state over a fresh in-memory store.
#[allow(dead_code)]
pub fn create_test_state(connectors: &[Arc<SandboxConnector>]) -> Arc<AppState> {
    create_test_state_with(Config::default(), Arc::new(MemoryStore::new()), connectors)
}

#[allow(dead_code)]
pub fn create_test_state_with(
    config: Config,
    store: Arc<dyn SyncStore>,
    connectors: &[Arc<SandboxConnector>],
) -> Arc<AppState> {
    let registry = connectors
        .iter()
        .fold(ConnectorRegistry::new(), |registry, connector| {
            registry.register(connector.clone())
        });
    Arc::new(AppState::new(config, store, registry))
}

/// Create a test app with offline dependencies.
/// Returns the router and the shared state.
#[allow(dead_code)]
pub fn create_test_app(connectors: &[Arc<SandboxConnector>]) -> (axum::Router, Arc<AppState>) {
    let state = create_test_state(connectors);
    (create_router(state.clone()), state)
}

/// Store a due user with connections given as `(id, service, account)`.
#[allow(dead_code)]
pub async fn seed_user(state: &AppState, user_id: &str, connections: &[(&str, &str, &str)]) {
    let mut user = User::new(user_id);
    user.schedule_at(Utc::now() - Duration::minutes(1));
    state.store.upsert_user(&user).await.unwrap();
    for (id, service, account) in connections {
        state
            .store
            .upsert_connection(&ConnectionRecord::new(*id, user_id, *service, *account))
            .await
            .unwrap();
    }
}

/// Claim the user and run one sync to completion.
#[allow(dead_code)]
pub async fn run_user(state: &AppState, user_id: &str) -> Result<SyncReport, AppError> {
    let owner = format!("test-owner-{}", user_id);
    let lock = SyncLock::new(user_id, &owner, &state.config.hostname, Utc::now());
    assert!(state.store.try_claim_user(&lock).await.unwrap());
    run_claimed_user(state, user_id, &owner).await
}

#[allow(dead_code)]
pub async fn connection(state: &AppState, user_id: &str, connection_id: &str) -> ConnectionRecord {
    state
        .store
        .get_connections(user_id)
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.id == connection_id)
        .unwrap()
}

/// A one hour run starting at 08:00 local time, UTC+2.
#[allow(dead_code)]
pub fn morning_run(day: u32) -> Activity {
    let tz = FixedOffset::east_opt(2 * 3600).unwrap();
    let start = tz.with_ymd_and_hms(2024, 6, day, 8, 0, 0).unwrap();
    Activity::new(start, ActivityType::Running)
        .with_end(start + Duration::hours(1))
        .with_name("Morning Run")
        .with_distance(10_000.0)
}

#[allow(dead_code)]
pub fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}
