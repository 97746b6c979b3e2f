// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! The seam to external activity services.
//!
//! Each service implements [`Connector`]; instances are assembled once into a
//! [`ConnectorRegistry`] at startup and handed to the scheduler.

pub mod registry;
pub mod sandbox;

pub use registry::ConnectorRegistry;
pub use sandbox::SandboxConnector;

use crate::models::{
    Activity, ActivityType, ConnectionRecord, ErrorScope, ReasonCode, UserException,
};
use async_trait::async_trait;
use std::collections::BTreeSet;

/// Static description of what a service can do.
#[derive(Debug, Clone)]
pub struct ConnectorCapabilities {
    pub supported_types: BTreeSet<ActivityType>,
    pub supplies_activities: bool,
    pub receives_activities: bool,
    pub receives_stationary: bool,
    /// Accepts activities without GPS that still carry sensor data.
    pub receives_non_gps_with_sensor_data: bool,
    /// Needs stored credentials beyond the OAuth token.
    pub requires_extended_authorization: bool,
    /// Non-exhaustive listing only happens after a trigger.
    pub partial_sync_requires_trigger: bool,
    pub partial_sync_trigger_requires_polling: bool,
    /// How many poll indexes the trigger poller walks.
    pub partial_sync_trigger_poll_multiple: u32,
}

impl Default for ConnectorCapabilities {
    fn default() -> Self {
        Self {
            supported_types: ActivityType::ALL.into_iter().collect(),
            supplies_activities: true,
            receives_activities: true,
            receives_stationary: true,
            receives_non_gps_with_sensor_data: true,
            requires_extended_authorization: false,
            partial_sync_requires_trigger: false,
            partial_sync_trigger_requires_polling: false,
            partial_sync_trigger_poll_multiple: 1,
        }
    }
}

impl ConnectorCapabilities {
    pub fn supports(&self, activity_type: ActivityType) -> bool {
        self.supported_types.contains(&activity_type)
    }
}

/// Recoverable upstream failure, possibly blocking the connection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ServiceException {
    pub message: String,
    pub scope: ErrorScope,
    pub block: bool,
    pub user_exception: Option<UserException>,
    /// Clearing this error should force a full re-listing.
    pub trigger_exhaustive: bool,
}

impl ServiceException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            scope: ErrorScope::Account,
            block: false,
            user_exception: None,
            trigger_exhaustive: false,
        }
    }

    pub fn with_scope(mut self, scope: ErrorScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn blocking(mut self) -> Self {
        self.block = true;
        self
    }

    pub fn with_user_exception(mut self, exception: UserException) -> Self {
        self.user_exception = Some(exception);
        self
    }

    pub fn trigger_exhaustive(mut self) -> Self {
        self.trigger_exhaustive = true;
        self
    }

    /// Reason shown to the user, defaulting to `fallback`.
    pub fn reason_or(&self, fallback: ReasonCode) -> UserException {
        self.user_exception
            .clone()
            .unwrap_or_else(|| UserException::new(fallback))
    }
}

/// One activity cannot be synced from or to a connection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ActivityExcludeException {
    pub message: String,
    /// Permanent exclusions persist until the user clears them.
    pub permanent: bool,
    pub external_id: Option<String>,
    pub user_exception: UserException,
}

impl ActivityExcludeException {
    pub fn new(message: impl Into<String>, reason: ReasonCode, permanent: bool) -> Self {
        Self {
            message: message.into(),
            permanent,
            external_id: None,
            user_exception: UserException::new(reason),
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }
}

/// Error returned by a connector operation.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("service error: {0}")]
    Service(ServiceException),

    /// Recorded as non-blocking; processing continues.
    #[error("service warning: {0}")]
    Warning(ServiceException),

    #[error("activity excluded: {0}")]
    Exclude(ActivityExcludeException),

    /// Anything not classified by the connector.
    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

impl ConnectorError {
    /// Classify into a service exception; unclassified errors block the
    /// whole service.
    pub fn into_service_exception(self, fallback: ReasonCode) -> ServiceException {
        match self {
            ConnectorError::Service(e) | ConnectorError::Warning(e) => e,
            ConnectorError::Exclude(e) => ServiceException::new(e.message)
                .with_user_exception(e.user_exception),
            ConnectorError::Unclassified(err) => ServiceException::new(format!("{:#}", err))
                .with_scope(ErrorScope::Service)
                .blocking()
                .with_user_exception(UserException::new(fallback)),
        }
    }
}

/// Result of listing one connection.
#[derive(Debug, Default)]
pub struct ListResult {
    /// Each activity carries a service data entry keyed by the connection id.
    pub activities: Vec<Activity>,
    pub exclusions: Vec<ActivityExcludeException>,
}

/// An external activity service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Service kind, unique within a registry.
    fn service(&self) -> &str;

    fn capabilities(&self) -> &ConnectorCapabilities;

    async fn list_activities(
        &self,
        connection: &ConnectionRecord,
        exhaustive: bool,
    ) -> Result<ListResult, ConnectorError>;

    async fn download_activity(
        &self,
        connection: &ConnectionRecord,
        activity: &Activity,
    ) -> Result<Activity, ConnectorError>;

    /// Returns the external id of the uploaded activity.
    async fn upload_activity(
        &self,
        connection: &ConnectionRecord,
        activity: &Activity,
    ) -> Result<String, ConnectorError>;

    /// Whether the connection still needs setup before it can receive.
    fn requires_configuration(&self, _connection: &ConnectionRecord) -> bool {
        false
    }

    async fn subscribe_partial_sync_trigger(
        &self,
        _connection: &ConnectionRecord,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn unsubscribe_partial_sync_trigger(
        &self,
        _connection: &ConnectionRecord,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// External account ids with new data, for polled triggers.
    async fn poll_partial_sync_trigger(&self, _index: u32) -> Result<Vec<String>, ConnectorError> {
        Ok(Vec::new())
    }

    /// External account ids named by a pushed trigger payload.
    fn service_record_ids_for_partial_sync_trigger(
        &self,
        _payload: &serde_json::Value,
    ) -> Result<Vec<String>, ConnectorError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unclassified_is_service_scope_blocking() {
        let err = ConnectorError::Unclassified(anyhow::anyhow!("socket closed"));
        let exc = err.into_service_exception(ReasonCode::ListingError);
        assert_eq!(exc.scope, ErrorScope::Service);
        assert!(exc.block);
        assert_eq!(
            exc.user_exception.map(|e| e.reason),
            Some(ReasonCode::ListingError)
        );
    }

    #[test]
    fn test_default_capabilities_support_everything() {
        let caps = ConnectorCapabilities::default();
        assert!(ActivityType::ALL.iter().all(|t| caps.supports(*t)));
    }
}
