// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Explicit registry of connectors, built once at startup.

use crate::connectors::Connector;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
    /// Registration order
    order: Vec<String>,
    priority: Vec<String>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Service kinds to prefer when downloading, most preferred first.
    pub fn with_download_priority(mut self, priority: Vec<String>) -> Self {
        self.priority = priority;
        self
    }

    /// Register a connector. A later registration of the same kind replaces it.
    pub fn register(mut self, connector: Arc<dyn Connector>) -> Self {
        let service = connector.service().to_string();
        if self.connectors.insert(service.clone(), connector).is_none() {
            self.order.push(service);
        }
        self
    }

    pub fn get(&self, service: &str) -> Option<&Arc<dyn Connector>> {
        self.connectors.get(service)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Position of `service` in download order; unknown kinds sort last.
    pub fn download_rank(&self, service: &str) -> usize {
        self.download_order()
            .iter()
            .position(|s| s == service)
            .unwrap_or(usize::MAX)
    }

    /// Configured priority first, then the rest in registration order.
    pub fn download_order(&self) -> Vec<String> {
        let mut order: Vec<String> = self
            .priority
            .iter()
            .filter(|s| self.connectors.contains_key(*s))
            .cloned()
            .collect();
        for service in &self.order {
            if !order.contains(service) {
                order.push(service.clone());
            }
        }
        order
    }
}
