// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Merging per-connection activity lists into one deduplicated canonical set.
//!
//! Accumulation runs in two phases: [`plan`] decides, against an unchanged
//! snapshot of the canonical set, where each incoming activity goes; [`apply`]
//! then commits the plan. The merge of two activities is commutative so the
//! canonical result does not depend on the order connections are listed in.

use crate::models::activity::{Activity, ActivityTime, ActivityType, ConnectionId, FieldSources};
use chrono::{Duration, Timelike};
use std::collections::BTreeMap;

/// Start-time tolerances for deciding two reports are one activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalesceTolerances {
    /// Maximum start difference, inclusive.
    pub start_leeway: Duration,
    /// Widest wall-clock gap attributed to a wrong timezone.
    pub tz_error_window: Duration,
    /// Offset remainder of half-hour zones.
    pub half_zone: Duration,
}

impl Default for CoalesceTolerances {
    fn default() -> Self {
        Self {
            start_leeway: Duration::minutes(3),
            tz_error_window: Duration::hours(38),
            half_zone: Duration::minutes(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulateMode {
    /// Unmatched activities become new canonical entries.
    Full,
    /// Only enrich existing entries; unmatched activities are dropped.
    UpdateOnly,
}

/// Why two activities were matched, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchRule {
    Uid,
    StartTime,
    WallClock,
    TimezoneError,
}

/// Where each incoming activity goes, computed against a snapshot.
#[derive(Debug, Default)]
pub struct AccumulatePlan {
    merges: Vec<(usize, Activity)>,
    appends: Vec<Activity>,
    skipped: usize,
}

impl AccumulatePlan {
    pub fn is_empty(&self) -> bool {
        self.merges.is_empty() && self.appends.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AccumulateSummary {
    pub merged: usize,
    pub appended: usize,
    pub skipped: usize,
}

/// Match rule for two start times, if any applies.
pub fn start_times_match(
    a: &ActivityTime,
    b: &ActivityTime,
    tolerances: &CoalesceTolerances,
) -> Option<MatchRule> {
    if a.is_aware() == b.is_aware() {
        if a.delta(b).abs() <= tolerances.start_leeway {
            return Some(MatchRule::StartTime);
        }
    } else if (a.wall_clock() - b.wall_clock()).abs() <= tolerances.start_leeway {
        return Some(MatchRule::WallClock);
    }

    let (a_wall, b_wall) = (a.wall_clock(), b.wall_clock());
    if (a_wall - b_wall).abs() > tolerances.tz_error_window || a_wall.second() != b_wall.second()
    {
        return None;
    }
    // Minute and second fields, truncated to the whole second.
    let minutes_apart = (i64::from(a_wall.minute()) - i64::from(b_wall.minute())).rem_euclid(60);
    let half = tolerances.half_zone.num_minutes().rem_euclid(60);
    if minutes_apart == 0 || minutes_apart == half || minutes_apart == (60 - half) % 60 {
        return Some(MatchRule::TimezoneError);
    }
    None
}

/// Whether `incoming` describes the same activity as `existing`.
fn match_rule(
    existing: &Activity,
    incoming: &Activity,
    connection_id: &str,
    tolerances: &CoalesceTolerances,
) -> Option<MatchRule> {
    // A connection never holds one activity twice.
    if let (Some(held), Some(new)) = (
        existing.service_data.get(connection_id),
        incoming.service_data.get(connection_id),
    ) {
        if held.external_id != new.external_id {
            return None;
        }
    }
    if !existing.uids.is_disjoint(&incoming.uids) {
        return Some(MatchRule::Uid);
    }
    if !ActivityType::is_compatible(existing.activity_type, incoming.activity_type) {
        return None;
    }
    start_times_match(&existing.start, &incoming.start, tolerances)
}

/// Best match in `candidates`: strongest rule, then smallest start gap.
fn find_match(
    candidates: &[Activity],
    incoming: &Activity,
    connection_id: &str,
    tolerances: &CoalesceTolerances,
) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter_map(|(idx, existing)| {
            match_rule(existing, incoming, connection_id, tolerances).map(|rule| {
                let gap = (existing.start.wall_clock() - incoming.start.wall_clock()).abs();
                (rule, gap, idx)
            })
        })
        .min()
        .map(|(_, _, idx)| idx)
}

/// Normalize a freshly listed activity: key its service data by the
/// connection, compute its UID and stamp field sources.
fn prepare(mut activity: Activity, connection_id: &str) -> Activity {
    if !activity.service_data.contains_key(connection_id) {
        if let Some((_, data)) = activity.service_data.pop_first() {
            activity.service_data.clear();
            activity.service_data.insert(connection_id.to_string(), data);
        }
    }
    let uid = activity.calculate_uid();
    activity.uids.insert(uid);

    let source = Some(connection_id.to_string());
    activity.sources = FieldSources {
        start: activity.sources.start.take().or_else(|| source.clone()),
        name: activity
            .sources
            .name
            .take()
            .or_else(|| activity.name.as_ref().and(source.clone())),
        notes: activity
            .sources
            .notes
            .take()
            .or_else(|| activity.notes.as_ref().and(source.clone())),
    };
    activity
}

/// Already merged from this connection under the same external id.
fn already_merged(existing: &Activity, incoming: &Activity, connection_id: &str) -> bool {
    match (
        existing.service_data.get(connection_id),
        incoming.service_data.get(connection_id),
    ) {
        (Some(held), Some(new)) => {
            held.external_id == new.external_id && incoming.uids.is_subset(&existing.uids)
        }
        _ => false,
    }
}

/// Phase one: decide where each incoming activity goes.
pub fn plan(
    canonical: &[Activity],
    connection_id: &str,
    incoming: Vec<Activity>,
    mode: AccumulateMode,
    tolerances: &CoalesceTolerances,
) -> AccumulatePlan {
    let mut plan = AccumulatePlan::default();
    // Merges into the same existing entry are folded together here.
    let mut merges: BTreeMap<usize, Activity> = BTreeMap::new();

    for activity in incoming {
        let activity = prepare(activity, connection_id);

        if let Some(idx) = find_match(canonical, &activity, connection_id, tolerances) {
            if already_merged(&canonical[idx], &activity, connection_id) {
                plan.skipped += 1;
                continue;
            }
            let folded = match merges.remove(&idx) {
                Some(previous) => coalesce_pair(&previous, &activity),
                None => activity,
            };
            merges.insert(idx, folded);
        } else if let Some(idx) = find_match(&plan.appends, &activity, connection_id, tolerances)
        {
            plan.appends[idx] = coalesce_pair(&plan.appends[idx], &activity);
        } else if mode == AccumulateMode::Full {
            plan.appends.push(activity);
        } else {
            plan.skipped += 1;
        }
    }

    plan.merges = merges.into_iter().collect();
    plan
}

/// Phase two: commit a plan produced against the same canonical set.
pub fn apply(canonical: &mut Vec<Activity>, plan: AccumulatePlan) -> AccumulateSummary {
    let summary = AccumulateSummary {
        merged: plan.merges.len(),
        appended: plan.appends.len(),
        skipped: plan.skipped,
    };
    for (idx, incoming) in plan.merges {
        if let Some(existing) = canonical.get_mut(idx) {
            *existing = coalesce_pair(existing, &incoming);
        }
    }
    canonical.extend(plan.appends);
    summary
}

/// Merge `incoming` activities listed from `connection_id` into `canonical`.
pub fn accumulate(
    canonical: &mut Vec<Activity>,
    connection_id: &str,
    incoming: Vec<Activity>,
    mode: AccumulateMode,
    tolerances: &CoalesceTolerances,
) -> AccumulateSummary {
    let plan = plan(canonical, connection_id, incoming, mode, tolerances);
    let summary = apply(canonical, plan);
    tracing::debug!(
        connection_id,
        merged = summary.merged,
        appended = summary.appended,
        skipped = summary.skipped,
        canonical = canonical.len(),
        "Accumulated activities"
    );
    summary
}

/// `a`'s source wins a tie against `b`'s.
fn source_precedes(a: &Option<ConnectionId>, b: &Option<ConnectionId>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a <= b,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => true,
    }
}

fn pick_text(
    a: &Option<String>,
    a_source: &Option<ConnectionId>,
    b: &Option<String>,
    b_source: &Option<ConnectionId>,
) -> (Option<String>, Option<ConnectionId>) {
    let a_set = a.as_deref().is_some_and(|s| !s.is_empty());
    let b_set = b.as_deref().is_some_and(|s| !s.is_empty());
    match (a_set, b_set) {
        (true, false) => (a.clone(), a_source.clone()),
        (false, true) => (b.clone(), b_source.clone()),
        (true, true) if !source_precedes(a_source, b_source) => (b.clone(), b_source.clone()),
        _ => (a.clone(), a_source.clone()),
    }
}

/// Commutative merge of two reports of the same activity.
pub fn coalesce_pair(a: &Activity, b: &Activity) -> Activity {
    let a_first = match (a.start.is_aware(), b.start.is_aware()) {
        (true, false) => true,
        (false, true) => false,
        _ => source_precedes(&a.sources.start, &b.sources.start),
    };
    let (start, start_source) = if a_first {
        (a.start, a.sources.start.clone())
    } else {
        (b.start, b.sources.start.clone())
    };

    let mut end = match (a.end, b.end) {
        (Some(x), Some(y)) if x.is_aware() != y.is_aware() => Some(if x.is_aware() { x } else { y }),
        (Some(x), Some(y)) => Some(if a_first { x } else { y }),
        (x, None) => x,
        (None, y) => y,
    };
    if let (Some(offset), Some(e)) = (start.offset(), end) {
        end = Some(e.localized(offset));
    }

    let (name, name_source) = pick_text(&a.name, &a.sources.name, &b.name, &b.sources.name);
    let (notes, notes_source) = pick_text(&a.notes, &a.sources.notes, &b.notes, &b.sources.notes);

    let stationary = match (a.stationary, b.stationary) {
        (Some(x), Some(y)) => Some(x && y),
        (x, None) => x,
        (None, y) => y,
    };
    let gps = match (a.gps, b.gps) {
        (Some(x), Some(y)) => Some(x || y),
        (x, None) => x,
        (None, y) => y,
    };

    let waypoints = if a.waypoints.len() > b.waypoints.len()
        || (a.waypoints.len() == b.waypoints.len() && a_first)
    {
        a.waypoints.clone()
    } else {
        b.waypoints.clone()
    };

    let mut service_data = a.service_data.clone();
    for (connection_id, data) in &b.service_data {
        service_data
            .entry(connection_id.clone())
            .and_modify(|held| {
                if data.external_id < held.external_id {
                    *held = data.clone();
                }
            })
            .or_insert_with(|| data.clone());
    }

    Activity {
        start,
        end,
        activity_type: ActivityType::pick_most_specific(a.activity_type, b.activity_type),
        name,
        notes,
        private: a.private || b.private,
        stationary,
        gps,
        stats: a.stats.coalesce(&b.stats),
        waypoints,
        service_data,
        uids: a.uids.union(&b.uids).cloned().collect(),
        sources: FieldSources {
            start: start_source,
            name: name_source,
            notes: notes_source,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::activity::ServiceData;
    use chrono::{FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};

    fn naive(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn listed(start: impl Into<ActivityTime>, kind: ActivityType, external_id: &str) -> Activity {
        let mut act = Activity::new(start, kind);
        act.service_data
            .insert("listing".to_string(), ServiceData::new(external_id));
        act
    }

    fn run(batches: Vec<(&str, Activity)>) -> Vec<Activity> {
        let tolerances = CoalesceTolerances::default();
        let mut canonical = Vec::new();
        for (connection_id, activity) in batches {
            accumulate(
                &mut canonical,
                connection_id,
                vec![activity],
                AccumulateMode::Full,
                &tolerances,
            );
        }
        canonical
    }

    fn assert_commutative(a: (&str, Activity), b: (&str, Activity)) {
        let forward = run(vec![a.clone(), b.clone()]);
        let backward = run(vec![b, a]);
        assert_eq!(forward.len(), 1, "expected a merge");
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_merge_is_commutative() {
        let aware = Utc.with_ymd_and_hms(2021, 5, 1, 8, 0, 0).unwrap();
        let a = listed(aware, ActivityType::Cycling, "a-1")
            .with_name("Morning ride")
            .with_distance(20_000.0);
        let b = listed(aware + Duration::seconds(90), ActivityType::MountainBiking, "b-1")
            .with_name("Trail loop")
            .with_distance(21_000.0)
            .with_private(true);
        assert_commutative(("conn-a", a), ("conn-b", b));

        let a = listed(naive(8, 0, 0), ActivityType::Other, "a-2");
        let b = listed(aware + Duration::seconds(30), ActivityType::Walking, "b-2");
        assert_commutative(("conn-a", a), ("conn-b", b));
    }

    #[test]
    fn test_merged_fields() {
        let aware = Utc.with_ymd_and_hms(2021, 5, 1, 8, 0, 0).unwrap();
        let a = listed(naive(8, 1, 0), ActivityType::Cycling, "a-1").with_name("Ride");
        let mut b = listed(aware, ActivityType::MountainBiking, "b-1").with_private(true);
        b.stationary = Some(false);

        let merged = run(vec![("conn-a", a), ("conn-b", b)]);
        assert_eq!(merged.len(), 1);
        let m = &merged[0];
        assert!(m.start.is_aware());
        assert_eq!(m.activity_type, ActivityType::MountainBiking);
        assert_eq!(m.name.as_deref(), Some("Ride"));
        assert!(m.private);
        assert_eq!(m.stationary, Some(false));
        assert_eq!(m.uids.len(), 2);
        assert!(m.is_held_by("conn-a") && m.is_held_by("conn-b"));
    }

    #[test]
    fn test_leeway_boundary() {
        let a = listed(naive(8, 0, 0), ActivityType::Running, "a-1");
        let at_boundary = listed(naive(8, 3, 0), ActivityType::Running, "b-1");
        assert_eq!(run(vec![("conn-a", a.clone()), ("conn-b", at_boundary)]).len(), 1);

        let beyond = listed(
            naive(8, 3, 0) + Duration::microseconds(1),
            ActivityType::Running,
            "b-2",
        );
        assert_eq!(run(vec![("conn-a", a), ("conn-b", beyond)]).len(), 2);
    }

    #[test]
    fn test_unrelated_types_never_merge() {
        let a = listed(naive(8, 0, 0), ActivityType::Running, "a-1");
        let b = listed(naive(8, 0, 0), ActivityType::Cycling, "b-1");
        assert_eq!(run(vec![("conn-a", a), ("conn-b", b)]).len(), 2);

        let a = listed(naive(8, 0, 0), ActivityType::Hiking, "a-2");
        let b = listed(naive(8, 0, 0), ActivityType::MountainBiking, "b-2");
        assert_eq!(run(vec![("conn-a", a), ("conn-b", b)]).len(), 2);
    }

    #[test]
    fn test_timezone_error_recovery() {
        let utc = Utc.with_ymd_and_hms(2021, 5, 1, 9, 12, 22).unwrap();
        let minus_six = FixedOffset::west_opt(6 * 3600).unwrap();
        let local = minus_six.with_ymd_and_hms(2021, 5, 1, 15, 12, 22).unwrap();

        let a = listed(utc, ActivityType::Running, "a-1");
        let b = listed(local, ActivityType::Running, "b-1");
        assert_eq!(run(vec![("conn-a", a.clone()), ("conn-b", b)]).len(), 1);

        let far = listed(utc + Duration::hours(50), ActivityType::Running, "b-2");
        assert_eq!(run(vec![("conn-a", a.clone()), ("conn-b", far)]).len(), 2);

        let half_zone = listed(naive(14, 42, 22), ActivityType::Running, "b-3");
        assert_eq!(run(vec![("conn-a", a.clone()), ("conn-b", half_zone)]).len(), 1);

        let off_by_minutes = listed(naive(14, 52, 22), ActivityType::Running, "b-4");
        assert_eq!(run(vec![("conn-a", a), ("conn-b", off_by_minutes)]).len(), 2);
    }

    #[test]
    fn test_timezone_error_ignores_subsecond_noise() {
        let utc =
            Utc.with_ymd_and_hms(2021, 5, 1, 9, 12, 22).unwrap() + Duration::milliseconds(400);
        let a = listed(utc, ActivityType::Running, "a-1");
        let b = listed(naive(15, 12, 22), ActivityType::Running, "b-1");
        assert_eq!(run(vec![("conn-a", a.clone()), ("conn-b", b)]).len(), 1);

        let half_zone = listed(
            naive(14, 42, 22) + Duration::milliseconds(999),
            ActivityType::Running,
            "b-2",
        );
        assert_eq!(run(vec![("conn-a", a.clone()), ("conn-b", half_zone)]).len(), 1);

        let other_second = listed(naive(15, 12, 23), ActivityType::Running, "b-3");
        assert_eq!(run(vec![("conn-a", a), ("conn-b", other_second)]).len(), 2);
    }

    #[test]
    fn test_update_only_never_appends() {
        let tolerances = CoalesceTolerances::default();
        let mut canonical = run(vec![(
            "conn-a",
            listed(naive(8, 0, 0), ActivityType::Running, "a-1"),
        )]);

        let summary = accumulate(
            &mut canonical,
            "conn-b",
            vec![
                listed(naive(8, 1, 0), ActivityType::Running, "b-1"),
                listed(naive(18, 17, 0), ActivityType::Running, "b-2"),
            ],
            AccumulateMode::UpdateOnly,
            &tolerances,
        );

        assert_eq!(summary.merged, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(canonical.len(), 1);
        assert!(canonical[0].is_held_by("conn-b"));
    }

    #[test]
    fn test_reaccumulating_is_idempotent() {
        let tolerances = CoalesceTolerances::default();
        let batch = vec![
            listed(naive(8, 0, 0), ActivityType::Running, "a-1").with_distance(5000.0),
            listed(naive(17, 0, 0), ActivityType::Swimming, "a-2"),
        ];
        let mut canonical = Vec::new();
        accumulate(&mut canonical, "conn-a", batch.clone(), AccumulateMode::Full, &tolerances);
        let once = canonical.clone();
        let summary =
            accumulate(&mut canonical, "conn-a", batch, AccumulateMode::Full, &tolerances);

        assert_eq!(summary.skipped, 2);
        assert_eq!(canonical, once);
    }

    #[test]
    fn test_same_connection_activities_stay_apart() {
        let tolerances = CoalesceTolerances::default();
        let mut canonical = Vec::new();
        accumulate(
            &mut canonical,
            "conn-a",
            vec![
                listed(naive(8, 0, 0), ActivityType::Running, "a-1"),
                listed(naive(8, 2, 0), ActivityType::Running, "a-2"),
            ],
            AccumulateMode::Full,
            &tolerances,
        );
        assert_eq!(canonical.len(), 2);
    }

    #[test]
    fn test_plan_does_not_touch_snapshot() {
        let tolerances = CoalesceTolerances::default();
        let canonical = run(vec![(
            "conn-a",
            listed(naive(8, 0, 0), ActivityType::Running, "a-1"),
        )]);
        let snapshot = canonical.clone();
        let plan = plan(
            &canonical,
            "conn-b",
            vec![listed(naive(8, 0, 30), ActivityType::Running, "b-1")],
            AccumulateMode::Full,
            &tolerances,
        );
        assert!(!plan.is_empty());
        assert_eq!(canonical, snapshot);
    }
}
