// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Fitsync server
//!
//! Runs the sync worker pool, the lock watchdog and the trigger poller next
//! to the HTTP API.

use fitsync::{
    config::{Config, StoreBackend},
    connectors::{ConnectorRegistry, SandboxConnector},
    db::{FirestoreDb, MemoryStore, SyncStore},
    services::{scheduler::Scheduler, trigger, watchdog},
    AppState,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging for GCP
    init_logging();

    // Load configuration from environment
    let config = Config::from_env().expect("Failed to load configuration");
    tracing::info!(
        port = config.port,
        backend = ?config.store_backend,
        workers = config.sync_workers,
        "Starting Fitsync"
    );

    let store: Arc<dyn SyncStore> = match config.store_backend {
        StoreBackend::Firestore => Arc::new(
            FirestoreDb::new(&config.gcp_project_id)
                .await
                .expect("Failed to connect to Firestore"),
        ),
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Service connectors are registered here, once
    let registry = ConnectorRegistry::new()
        .with_download_priority(config.download_priority.clone())
        .register(Arc::new(SandboxConnector::new("sandbox")));
    tracing::info!(
        services = ?registry.download_order(),
        "Connector registry initialized"
    );

    let state = Arc::new(AppState::new(config.clone(), store, registry));

    tokio::spawn(Scheduler::new(state.clone()).run());
    tokio::spawn(watchdog::run(state.clone()));
    tokio::spawn(trigger::run_poller(state.clone()));

    // Build router
    let app = fitsync::routes::create_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fitsync=debug".parse().expect("valid directive"))
                .add_directive("info".parse().expect("valid directive")),
        )
        .with(format)
        .init();
}
