// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Fitsync: keep a user's activities synchronized across fitness services
//!
//! This crate provides the sync engine (coalescing, eligibility and the
//! per-user run), the distributed scheduler that drives it, and a small
//! HTTP surface for partial-sync triggers and administration.

pub mod config;
pub mod connectors;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod time_utils;

use config::Config;
use connectors::ConnectorRegistry;
use dashmap::DashMap;
use db::SyncStore;
use services::scheduler::ActiveRun;
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn SyncStore>,
    pub registry: ConnectorRegistry,
    /// Runs executing in this process, keyed by user id
    pub active_runs: DashMap<String, ActiveRun>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn SyncStore>, registry: ConnectorRegistry) -> Self {
        Self {
            config,
            store,
            registry,
            active_runs: DashMap::new(),
        }
    }
}
