// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Partial-sync triggers: a service signals that some of its accounts have
//! new data, and the owning users become due right away.

use crate::db::SyncStore;
use crate::error::AppError;
use crate::AppState;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Flag the connections of `service` for `external_ids` and schedule their
/// users now. Unknown ids are ignored. Returns the number flagged.
pub async fn flag_partial_sync_trigger(
    store: &dyn SyncStore,
    service: &str,
    external_ids: &[String],
    now: DateTime<Utc>,
) -> Result<usize, AppError> {
    if external_ids.is_empty() {
        return Ok(0);
    }
    let connections = store.find_connections(service, external_ids).await?;
    for connection in &connections {
        store.flag_connection_triggered(&connection.id, now).await?;
        store.schedule_user(&connection.user_id, now, false).await?;
    }

    tracing::info!(
        service,
        requested = external_ids.len(),
        flagged = connections.len(),
        "Partial sync trigger"
    );
    Ok(connections.len())
}

/// Poll every connector whose triggers must be polled. Returns the number
/// of connections flagged.
pub async fn poll_once(state: &AppState, now: DateTime<Utc>) -> Result<usize, AppError> {
    let mut flagged = 0;
    for service in state.registry.services() {
        let Some(connector) = state.registry.get(service) else {
            continue;
        };
        let capabilities = connector.capabilities();
        if !capabilities.partial_sync_trigger_requires_polling {
            continue;
        }

        for index in 0..capabilities.partial_sync_trigger_poll_multiple {
            match connector.poll_partial_sync_trigger(index).await {
                Ok(external_ids) => {
                    flagged +=
                        flag_partial_sync_trigger(state.store.as_ref(), service, &external_ids, now)
                            .await?;
                }
                Err(e) => {
                    tracing::warn!(service, index, error = %e, "Trigger poll failed");
                }
            }
        }
    }
    Ok(flagged)
}

/// Poll forever.
pub async fn run_poller(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(state.config.trigger_poll_interval);
    loop {
        ticker.tick().await;
        if let Err(e) = poll_once(&state, Utc::now()).await {
            tracing::error!(error = %e, "Trigger polling failed");
        }
    }
}
