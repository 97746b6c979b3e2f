// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Durable per-user record of one canonical activity and where it lives.

use crate::models::activity::{Activity, ActivityTime, ActivityType, ConnectionId};
use crate::models::exception::UserException;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The activity exists on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub processed_at: DateTime<Utc>,
    /// Set when this service put the activity there.
    #[serde(default)]
    pub synchronized_at: Option<DateTime<Utc>>,
}

/// The activity is not on a connection, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Absence {
    pub processed_at: DateTime<Utc>,
    pub exception: UserException,
}

/// Stored snapshot of a canonical activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Document id, fixed at creation.
    pub id: String,
    pub user_id: String,
    pub start: ActivityTime,
    #[serde(default)]
    pub end: Option<ActivityTime>,
    pub activity_type: ActivityType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub distance_meters: Option<f64>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub stationary: bool,
    #[serde(default)]
    pub uids: BTreeSet<String>,
    #[serde(default)]
    presence: BTreeMap<ConnectionId, Presence>,
    #[serde(default)]
    absence: BTreeMap<ConnectionId, Absence>,
    /// Seen during the current run; never persisted.
    #[serde(skip)]
    pub touched: bool,
}

impl ActivityRecord {
    pub fn from_activity(user_id: &str, activity: &Activity) -> Self {
        let first_uid = activity
            .uids
            .iter()
            .next()
            .cloned()
            .unwrap_or_else(|| activity.calculate_uid());
        let mut record = Self {
            id: format!("{}_{}", user_id, first_uid),
            user_id: user_id.to_string(),
            start: activity.start,
            end: activity.end,
            activity_type: activity.activity_type,
            name: None,
            distance_meters: None,
            private: false,
            stationary: false,
            uids: BTreeSet::new(),
            presence: BTreeMap::new(),
            absence: BTreeMap::new(),
            touched: true,
        };
        record.update_from(activity);
        record
    }

    /// Refresh the snapshot from the canonical activity and mark it touched.
    pub fn update_from(&mut self, activity: &Activity) {
        self.start = activity.start;
        self.end = activity.end;
        self.activity_type = activity.activity_type;
        self.name = activity.name.clone();
        self.distance_meters = activity.stats.distance_meters();
        self.private = activity.private;
        self.stationary = activity.is_stationary();
        self.uids.extend(activity.uids.iter().cloned());
        self.touched = true;
    }

    pub fn matches(&self, activity: &Activity) -> bool {
        !self.uids.is_disjoint(&activity.uids)
    }

    /// Record that the activity is on `connection_id`. An earlier processed
    /// time is kept so the origin stays stable.
    pub fn set_presence(
        &mut self,
        connection_id: &str,
        processed_at: DateTime<Utc>,
        synchronized_at: Option<DateTime<Utc>>,
    ) {
        self.absence.remove(connection_id);
        let entry = self
            .presence
            .entry(connection_id.to_string())
            .or_insert(Presence {
                processed_at,
                synchronized_at: None,
            });
        if synchronized_at.is_some() {
            entry.synchronized_at = synchronized_at;
        }
    }

    pub fn set_absence(
        &mut self,
        connection_id: &str,
        exception: UserException,
        processed_at: DateTime<Utc>,
    ) {
        self.presence.remove(connection_id);
        self.absence.insert(
            connection_id.to_string(),
            Absence {
                processed_at,
                exception,
            },
        );
    }

    /// Drop any absence for a connection that is now eligible again.
    pub fn clear_absence(&mut self, connection_id: &str) {
        self.absence.remove(connection_id);
    }

    /// Forget a connection that no longer belongs to the user.
    pub fn forget_connection(&mut self, connection_id: &str) {
        self.presence.remove(connection_id);
        self.absence.remove(connection_id);
    }

    pub fn presence(&self) -> &BTreeMap<ConnectionId, Presence> {
        &self.presence
    }

    pub fn absence(&self) -> &BTreeMap<ConnectionId, Absence> {
        &self.absence
    }

    /// Connection where the activity was first seen.
    pub fn origin(&self) -> Option<&ConnectionId> {
        self.presence
            .iter()
            .min_by(|(a_id, a), (b_id, b)| {
                a.processed_at
                    .cmp(&b.processed_at)
                    .then_with(|| a_id.cmp(b_id))
            })
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::exception::ReasonCode;
    use crate::models::activity::ServiceData;
    use chrono::TimeZone;

    fn activity() -> Activity {
        let mut act = Activity::new(
            Utc.with_ymd_and_hms(2021, 5, 1, 8, 0, 0).unwrap(),
            ActivityType::Running,
        );
        act.uids.insert(act.calculate_uid());
        act.service_data
            .insert("conn-a".to_string(), ServiceData::new("a-1"));
        act
    }

    #[test]
    fn test_presence_and_absence_are_exclusive() {
        let now = Utc::now();
        let mut record = ActivityRecord::from_activity("user-1", &activity());

        record.set_absence("conn-b", ReasonCode::Private.into(), now);
        assert!(record.absence().contains_key("conn-b"));

        record.set_presence("conn-b", now, Some(now));
        assert!(!record.absence().contains_key("conn-b"));
        assert!(record.presence()["conn-b"].synchronized_at.is_some());

        record.set_absence("conn-b", ReasonCode::UploadError.into(), now);
        assert!(!record.presence().contains_key("conn-b"));
    }

    #[test]
    fn test_origin_is_earliest_presence() {
        let early = Utc.with_ymd_and_hms(2021, 5, 1, 9, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2021, 5, 2, 9, 0, 0).unwrap();
        let mut record = ActivityRecord::from_activity("user-1", &activity());
        record.set_presence("conn-z", early, None);
        record.set_presence("conn-a", late, None);
        assert_eq!(record.origin().map(String::as_str), Some("conn-z"));

        // Re-seeing a connection keeps its first processed time.
        record.set_presence("conn-a", early - chrono::Duration::days(1), None);
        assert_eq!(record.origin().map(String::as_str), Some("conn-z"));
    }

    #[test]
    fn test_matches_by_uid() {
        let act = activity();
        let record = ActivityRecord::from_activity("user-1", &act);
        assert!(record.matches(&act));
        assert!(record.id.starts_with("user-1_"));

        let mut other = act.clone();
        other.uids = BTreeSet::from(["unrelated".to_string()]);
        assert!(!record.matches(&other));
    }
}
