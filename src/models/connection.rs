// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! A user's linked account on an external service, with its sync journals.

use crate::models::activity::ConnectionId;
use crate::models::exception::{ErrorScope, UserException};
use crate::models::user::SyncStep;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use validator::Validate;

/// Opaque credential blob owned by the connector, stored base64-encoded.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Authorization(pub Vec<u8>);

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Authorization({} bytes)", self.0.len())
    }
}

impl Serialize for Authorization {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Authorization {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Authorization)
            .map_err(serde::de::Error::custom)
    }
}

/// Per-connection settings chosen by the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub sync_private: bool,
    #[serde(default)]
    pub allow_flow_exception_bypass_via_self: bool,
    /// Destination folder for file-drop style services.
    #[serde(default)]
    #[validate(length(min = 1, max = 256))]
    pub folder: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// A persisted or run-local error raised by a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub message: String,
    pub step: SyncStep,
    pub scope: ErrorScope,
    pub block: bool,
    #[serde(default)]
    pub user_exception: Option<UserException>,
    #[serde(default)]
    pub trigger_exhaustive: bool,
    pub recorded_at: DateTime<Utc>,
}

impl SyncErrorEntry {
    pub fn clear_group(&self) -> Option<&str> {
        self.user_exception
            .as_ref()
            .and_then(|e| e.clear_group.as_deref())
    }
}

/// A single activity excluded from a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedActivity {
    pub external_id: String,
    pub message: String,
    pub reason: UserException,
    pub permanent: bool,
    pub effective_at: DateTime<Utc>,
}

/// User rule restricting propagation between two connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowException {
    pub source: ConnectionId,
    pub target: ConnectionId,
    #[serde(default)]
    pub allow_to_target: bool,
    #[serde(default)]
    pub allow_to_source: bool,
}

/// Make an external id or UID safe to use as a map key in the store.
pub fn sanitize_key(id: &str) -> String {
    urlencoding::encode(id).replace('.', "%2E")
}

/// Durable connection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub user_id: String,
    /// Connector kind, the registry key.
    pub service: String,
    /// Account id on the external service.
    pub external_id: String,
    #[serde(default)]
    pub authorization: Option<Authorization>,
    #[serde(default)]
    pub extended_authorization: Option<Authorization>,
    #[serde(default)]
    pub config: ConnectionConfig,
    /// Blocking errors only.
    #[serde(default)]
    pub sync_errors: Vec<SyncErrorEntry>,
    /// Permanent exclusions only, keyed by sanitized external id.
    #[serde(default)]
    pub excluded_activities: BTreeMap<String, ExcludedActivity>,
    #[serde(default)]
    pub synchronized_activities: BTreeSet<String>,
    #[serde(default)]
    pub partial_sync_trigger_subscribed: bool,
    #[serde(default)]
    pub trigger_pending: bool,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_listed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub force_exhaustive: bool,
}

impl ConnectionRecord {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        service: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            service: service.into(),
            external_id: external_id.into(),
            authorization: None,
            extended_authorization: None,
            config: ConnectionConfig::default(),
            sync_errors: Vec::new(),
            excluded_activities: BTreeMap::new(),
            synchronized_activities: BTreeSet::new(),
            partial_sync_trigger_subscribed: false,
            trigger_pending: false,
            last_triggered_at: None,
            last_listed_at: None,
            force_exhaustive: false,
        }
    }

    pub fn blocking_errors(&self) -> impl Iterator<Item = &SyncErrorEntry> {
        self.sync_errors.iter().filter(|e| e.block)
    }

    pub fn has_blocking_errors(&self) -> bool {
        self.blocking_errors().next().is_some()
    }

    pub fn exclusion_for(&self, external_id: &str) -> Option<&ExcludedActivity> {
        self.excluded_activities.get(&sanitize_key(external_id))
    }

    pub fn has_synchronized(&self, uids: &BTreeSet<String>) -> bool {
        !self.synchronized_activities.is_disjoint(uids)
    }

    /// Remove errors and exclusions in `clear_group`; returns how many went.
    pub fn dismiss_clear_group(&mut self, clear_group: &str) -> usize {
        let before = self.sync_errors.len() + self.excluded_activities.len();
        self.sync_errors
            .retain(|e| e.clear_group() != Some(clear_group));
        self.excluded_activities
            .retain(|_, e| e.reason.clear_group.as_deref() != Some(clear_group));
        let removed = before - self.sync_errors.len() - self.excluded_activities.len();
        if removed > 0 {
            self.force_exhaustive = true;
        }
        removed
    }

    /// Flag that the external service reported new data.
    pub fn mark_triggered(&mut self, at: DateTime<Utc>) {
        self.trigger_pending = true;
        self.last_triggered_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::exception::ReasonCode;

    fn error_in_group(group: &str, block: bool) -> SyncErrorEntry {
        SyncErrorEntry {
            message: "expired".to_string(),
            step: SyncStep::Listing,
            scope: ErrorScope::Account,
            block,
            user_exception: Some(
                UserException::new(ReasonCode::Authorization).with_clear_group(group),
            ),
            trigger_exhaustive: false,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_authorization_round_trips_as_base64() {
        let mut conn = ConnectionRecord::new("c1", "u1", "sandbox", "ext-1");
        conn.authorization = Some(Authorization(b"secret-token".to_vec()));
        let json = serde_json::to_value(&conn).unwrap();
        assert_eq!(json["authorization"], "c2VjcmV0LXRva2Vu");
        let back: ConnectionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, conn);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ConnectionConfig::default();
        assert!(config.validate().is_ok());
        config.folder = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dismiss_clear_group() {
        let mut conn = ConnectionRecord::new("c1", "u1", "sandbox", "ext-1");
        conn.sync_errors.push(error_in_group("auth", true));
        conn.sync_errors.push(error_in_group("other", true));
        conn.excluded_activities.insert(
            sanitize_key("act.1"),
            ExcludedActivity {
                external_id: "act.1".to_string(),
                message: "bad".to_string(),
                reason: UserException::new(ReasonCode::Corrupt).with_clear_group("auth"),
                permanent: true,
                effective_at: Utc::now(),
            },
        );

        assert_eq!(conn.dismiss_clear_group("auth"), 2);
        assert_eq!(conn.sync_errors.len(), 1);
        assert!(conn.excluded_activities.is_empty());
        assert!(conn.force_exhaustive);

        let mut untouched = ConnectionRecord::new("c2", "u1", "sandbox", "ext-2");
        assert_eq!(untouched.dismiss_clear_group("auth"), 0);
        assert!(!untouched.force_exhaustive);
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("a/b.c"), "a%2Fb%2Ec");
        assert!(ConnectionRecord::new("c", "u", "s", "e")
            .exclusion_for("x.y")
            .is_none());
    }
}
