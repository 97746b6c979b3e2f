// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-flight activity model used during a single synchronization run.

use crate::models::stats::{ActivityStatistic, ActivityStatistics, StatUnit};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Identifier of one user's linked account on an external service.
pub type ConnectionId = String;

/// Kind of activity. Some types are more specific variants of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActivityType {
    Running,
    Cycling,
    MountainBiking,
    Walking,
    Hiking,
    DownhillSkiing,
    CrossCountrySkiing,
    RollerSkiing,
    Snowboarding,
    Skating,
    Swimming,
    Wheelchair,
    Rowing,
    Elliptical,
    Gym,
    Climbing,
    StrengthTraining,
    Other,
}

/// Families of related types: (general type, more specific variants).
const TYPE_FAMILIES: &[(ActivityType, &[ActivityType])] = &[
    (ActivityType::Cycling, &[ActivityType::MountainBiking]),
    (ActivityType::Walking, &[ActivityType::Hiking]),
    (ActivityType::CrossCountrySkiing, &[ActivityType::RollerSkiing]),
];

impl ActivityType {
    pub const ALL: [ActivityType; 18] = [
        ActivityType::Running,
        ActivityType::Cycling,
        ActivityType::MountainBiking,
        ActivityType::Walking,
        ActivityType::Hiking,
        ActivityType::DownhillSkiing,
        ActivityType::CrossCountrySkiing,
        ActivityType::RollerSkiing,
        ActivityType::Snowboarding,
        ActivityType::Skating,
        ActivityType::Swimming,
        ActivityType::Wheelchair,
        ActivityType::Rowing,
        ActivityType::Elliptical,
        ActivityType::Gym,
        ActivityType::Climbing,
        ActivityType::StrengthTraining,
        ActivityType::Other,
    ];

    /// The general type heading this type's family, if it belongs to one.
    pub fn family(self) -> Option<ActivityType> {
        TYPE_FAMILIES
            .iter()
            .find(|(general, specific)| *general == self || specific.contains(&self))
            .map(|(general, _)| *general)
    }

    fn specificity(self) -> u8 {
        if self == ActivityType::Other {
            0
        } else if TYPE_FAMILIES.iter().any(|(_, specific)| specific.contains(&self)) {
            2
        } else {
            1
        }
    }

    /// Both types are members of the same family.
    pub fn are_variants(a: ActivityType, b: ActivityType) -> bool {
        a == b || (a.family().is_some() && a.family() == b.family())
    }

    /// Whether two sources' types may describe the same activity.
    pub fn is_compatible(a: ActivityType, b: ActivityType) -> bool {
        a == ActivityType::Other || b == ActivityType::Other || ActivityType::are_variants(a, b)
    }

    /// The more specific of two compatible types. `Other` never wins.
    pub fn pick_most_specific(a: ActivityType, b: ActivityType) -> ActivityType {
        match a.specificity().cmp(&b.specificity()) {
            std::cmp::Ordering::Greater => a,
            std::cmp::Ordering::Less => b,
            std::cmp::Ordering::Equal => a.min(b),
        }
    }
}

/// A timestamp that may or may not carry its UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum ActivityTime {
    Aware(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
}

impl ActivityTime {
    pub fn is_aware(&self) -> bool {
        matches!(self, ActivityTime::Aware(_))
    }

    /// The local wall-clock reading, dropping any offset.
    pub fn wall_clock(&self) -> NaiveDateTime {
        match self {
            ActivityTime::Aware(t) => t.naive_local(),
            ActivityTime::Naive(n) => *n,
        }
    }

    pub fn utc(&self) -> Option<DateTime<Utc>> {
        match self {
            ActivityTime::Aware(t) => Some(t.with_timezone(&Utc)),
            ActivityTime::Naive(_) => None,
        }
    }

    pub fn offset(&self) -> Option<FixedOffset> {
        match self {
            ActivityTime::Aware(t) => Some(*t.offset()),
            ActivityTime::Naive(_) => None,
        }
    }

    /// Localize a naive time into `offset`. Aware times are returned unchanged.
    pub fn localized(&self, offset: FixedOffset) -> ActivityTime {
        match self {
            ActivityTime::Aware(_) => *self,
            ActivityTime::Naive(n) => offset
                .from_local_datetime(n)
                .single()
                .map(ActivityTime::Aware)
                .unwrap_or(*self),
        }
    }

    /// Key for most-recent-first ordering; naive times are taken as UTC.
    pub fn sort_key(&self) -> NaiveDateTime {
        match self {
            ActivityTime::Aware(t) => t.naive_utc(),
            ActivityTime::Naive(n) => *n,
        }
    }

    /// Second-resolution representation used for UIDs.
    fn uid_component(&self) -> String {
        match self {
            ActivityTime::Aware(t) => t
                .with_timezone(&Utc)
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string(),
            ActivityTime::Naive(n) => n.format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }

    /// Signed difference `self - other`, comparing instants when both are
    /// aware and wall clocks otherwise.
    pub fn delta(&self, other: &ActivityTime) -> Duration {
        match (self.utc(), other.utc()) {
            (Some(a), Some(b)) => a - b,
            _ => self.wall_clock() - other.wall_clock(),
        }
    }
}

impl From<DateTime<FixedOffset>> for ActivityTime {
    fn from(value: DateTime<FixedOffset>) -> Self {
        ActivityTime::Aware(value)
    }
}

impl From<DateTime<Utc>> for ActivityTime {
    fn from(value: DateTime<Utc>) -> Self {
        ActivityTime::Aware(value.fixed_offset())
    }
}

impl From<NaiveDateTime> for ActivityTime {
    fn from(value: NaiveDateTime) -> Self {
        ActivityTime::Naive(value)
    }
}

/// Opaque per-connection data for an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceData {
    /// The activity's id on the external service.
    pub external_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ServiceData {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            payload: serde_json::Value::Null,
        }
    }
}

/// A GPS/sensor sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    #[serde(default)]
    pub timestamp: Option<NaiveDateTime>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub heart_rate: Option<f64>,
}

impl Waypoint {
    pub fn at(latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp: None,
            latitude: Some(latitude),
            longitude: Some(longitude),
            altitude: None,
            heart_rate: None,
        }
    }

    pub fn has_location(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// Which connection contributed fields that need a deterministic tie-break.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSources {
    pub start: Option<ConnectionId>,
    pub name: Option<ConnectionId>,
    pub notes: Option<ConnectionId>,
}

/// One activity as seen during a run, possibly merged from several sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub start: ActivityTime,
    #[serde(default)]
    pub end: Option<ActivityTime>,
    pub activity_type: ActivityType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub stationary: Option<bool>,
    #[serde(default)]
    pub gps: Option<bool>,
    #[serde(default)]
    pub stats: ActivityStatistics,
    #[serde(default)]
    pub waypoints: Vec<Waypoint>,
    /// Per-connection payloads; the keys are the connections holding it.
    #[serde(default)]
    pub service_data: BTreeMap<ConnectionId, ServiceData>,
    #[serde(default)]
    pub uids: BTreeSet<String>,
    #[serde(default)]
    pub sources: FieldSources,
}

impl Activity {
    pub fn new(start: impl Into<ActivityTime>, activity_type: ActivityType) -> Self {
        Self {
            start: start.into(),
            end: None,
            activity_type,
            name: None,
            notes: None,
            private: false,
            stationary: None,
            gps: None,
            stats: ActivityStatistics::default(),
            waypoints: Vec::new(),
            service_data: BTreeMap::new(),
            uids: BTreeSet::new(),
            sources: FieldSources::default(),
        }
    }

    pub fn with_end(mut self, end: impl Into<ActivityTime>) -> Self {
        self.end = Some(end.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_distance(mut self, meters: f64) -> Self {
        self.stats.distance = Some(ActivityStatistic::with_value(StatUnit::Meters, meters));
        self
    }

    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// UID for this source's view: hash of type and start to the second.
    pub fn calculate_uid(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{:?}", self.activity_type).as_bytes());
        hasher.update(b"|");
        hasher.update(self.start.uid_component().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Connections currently holding this activity.
    pub fn holders(&self) -> impl Iterator<Item = &ConnectionId> {
        self.service_data.keys()
    }

    pub fn is_held_by(&self, connection_id: &str) -> bool {
        self.service_data.contains_key(connection_id)
    }

    /// Elapsed duration from start and end, falling back to timer time.
    pub fn duration(&self) -> Option<Duration> {
        if let Some(end) = &self.end {
            return Some(end.delta(&self.start));
        }
        self.stats
            .timer_time
            .as_ref()
            .and_then(|t| t.value_in(StatUnit::Seconds))
            .map(|secs| Duration::milliseconds((secs * 1000.0) as i64))
    }

    /// Whether the activity has any located waypoints.
    pub fn has_gps(&self) -> bool {
        self.gps
            .unwrap_or_else(|| self.waypoints.iter().any(Waypoint::has_location))
    }

    /// Stationary if explicitly flagged, or if there is no distance or GPS.
    pub fn is_stationary(&self) -> bool {
        self.stationary.unwrap_or_else(|| {
            !self.has_gps() && self.stats.distance_meters().is_none_or(|d| d <= 0.0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn naive(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_type_hierarchy() {
        use ActivityType::*;
        assert!(ActivityType::are_variants(Cycling, MountainBiking));
        assert!(!ActivityType::are_variants(Cycling, Running));
        assert!(ActivityType::is_compatible(Other, Swimming));
        assert!(!ActivityType::is_compatible(Hiking, Cycling));

        assert_eq!(ActivityType::pick_most_specific(Cycling, MountainBiking), MountainBiking);
        assert_eq!(ActivityType::pick_most_specific(MountainBiking, Cycling), MountainBiking);
        assert_eq!(ActivityType::pick_most_specific(Other, Running), Running);
        assert_eq!(ActivityType::pick_most_specific(Running, Other), Running);
    }

    #[test]
    fn test_uid_is_stable_to_the_second() {
        let a = Activity::new(naive(8, 0, 0), ActivityType::Running);
        let mut b = a.clone();
        b.start = ActivityTime::Naive(naive(8, 0, 0) + Duration::milliseconds(400));
        assert_eq!(a.calculate_uid(), b.calculate_uid());

        let c = Activity::new(naive(8, 0, 0), ActivityType::Cycling);
        assert_ne!(a.calculate_uid(), c.calculate_uid());
    }

    #[test]
    fn test_localized_naive_time() {
        let offset = FixedOffset::west_opt(6 * 3600).unwrap();
        let t = ActivityTime::Naive(naive(15, 12, 22)).localized(offset);
        assert!(t.is_aware());
        assert_eq!(t.wall_clock(), naive(15, 12, 22));
        assert_eq!(t.utc().unwrap().naive_utc(), naive(21, 12, 22));
    }

    #[test]
    fn test_duration_prefers_end_time() {
        let act = Activity::new(naive(8, 0, 0), ActivityType::Running).with_end(naive(8, 30, 0));
        assert_eq!(act.duration(), Some(Duration::minutes(30)));
    }

    #[test]
    fn test_stationary_inference() {
        let act = Activity::new(naive(8, 0, 0), ActivityType::Gym);
        assert!(act.is_stationary());

        let act = act.with_distance(1200.0);
        assert!(!act.is_stationary());
    }
}
