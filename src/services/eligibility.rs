// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Decides which connections should receive a canonical activity.

use crate::connectors::Connector;
use crate::models::connection::{sanitize_key, ExcludedActivity};
use crate::models::{
    Activity, ConnectionId, ConnectionRecord, FlowException, ReasonCode, UserException,
};
use std::collections::BTreeMap;
use validator::Validate;

/// One of the user's connections as seen by the resolver.
pub struct Candidate<'a> {
    pub connection: &'a ConnectionRecord,
    pub connector: &'a dyn Connector,
    /// Set when the connection is excluded for the rest of the run.
    pub blocked: Option<&'a UserException>,
    /// Exclusions raised during this run, keyed like the persisted ones.
    pub run_exclusions: Option<&'a BTreeMap<String, ExcludedActivity>>,
}

impl Candidate<'_> {
    fn id(&self) -> &str {
        &self.connection.id
    }

    fn holds(&self, activity: &Activity) -> bool {
        activity.is_held_by(self.id()) || self.connection.has_synchronized(&activity.uids)
    }

    fn activity_exclusion(&self, activity: &Activity) -> Option<&UserException> {
        activity.uids.iter().find_map(|uid| {
            let key = sanitize_key(uid);
            self.run_exclusions
                .and_then(|run| run.get(&key))
                .or_else(|| self.connection.excluded_activities.get(&key))
                .map(|excluded| &excluded.reason)
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Eligibility {
    /// Destinations, in candidate order.
    pub eligible: Vec<ConnectionId>,
    pub rejected: BTreeMap<ConnectionId, UserException>,
}

/// Flow from `from` to `to` is forbidden by some rule.
pub fn flow_blocked(rules: &[FlowException], from: &str, to: &str) -> bool {
    rules.iter().any(|rule| {
        (rule.source == from && rule.target == to && !rule.allow_to_target)
            || (rule.target == from && rule.source == to && !rule.allow_to_source)
    })
}

/// Whether the activity may reach `candidate`, directly from the origin or
/// through a holder that allows bypass via itself.
fn flow_allows(
    activity: &Activity,
    origin: Option<&str>,
    candidate: &str,
    candidates: &[Candidate<'_>],
    rules: &[FlowException],
) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    if !flow_blocked(rules, origin, candidate) {
        return true;
    }
    candidates.iter().any(|intermediate| {
        let id = intermediate.id();
        id != origin
            && id != candidate
            && intermediate.holds(activity)
            && intermediate
                .connection
                .config
                .allow_flow_exception_bypass_via_self
            && !flow_blocked(rules, id, candidate)
    })
}

/// Partition the user's connections into destinations and rejections.
/// Connections already holding the activity appear in neither.
pub fn resolve(
    activity: &Activity,
    origin: Option<&str>,
    candidates: &[Candidate<'_>],
    rules: &[FlowException],
) -> Eligibility {
    let mut result = Eligibility::default();

    for candidate in candidates {
        if candidate.holds(activity) {
            continue;
        }
        let capabilities = candidate.connector.capabilities();

        let rejection = if !capabilities.receives_activities
            || !capabilities.supports(activity.activity_type)
        {
            Some(UserException::new(ReasonCode::TypeUnsupported))
        } else if let Some(blocked) = candidate.blocked {
            Some(blocked.clone())
        } else if let Some(excluded) = candidate.activity_exclusion(activity) {
            Some(excluded.clone())
        } else if !flow_allows(activity, origin, candidate.id(), candidates, rules) {
            Some(UserException::new(ReasonCode::FlowException))
        } else if candidate.connector.requires_configuration(candidate.connection)
            || candidate.connection.config.validate().is_err()
        {
            Some(UserException::new(ReasonCode::NotConfigured))
        } else if activity.is_stationary() && !capabilities.receives_stationary {
            Some(UserException::new(ReasonCode::StationaryUnsupported))
        } else if !activity.has_gps()
            && activity.stats.has_sensor_data()
            && !capabilities.receives_non_gps_with_sensor_data
        {
            Some(UserException::new(ReasonCode::NonGPSUnsupported))
        } else if activity.private && !candidate.connection.config.sync_private {
            Some(UserException::new(ReasonCode::Private))
        } else {
            None
        };

        match rejection {
            Some(exception) => {
                tracing::debug!(
                    connection_id = %candidate.id(),
                    reason = %exception.reason,
                    "Destination rejected"
                );
                result.rejected.insert(candidate.id().to_string(), exception);
            }
            None => result.eligible.push(candidate.id().to_string()),
        }
    }

    result
}
