// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Checks run on a downloaded activity before it is uploaded anywhere.

use crate::models::{Activity, ActivityStatistic, ActivityTime, ReasonCode, StatUnit};
use chrono::{Duration, FixedOffset};
use geo::{Distance, Haversine, Point};

/// Fastest plausible average speed, in km/h.
const MAX_SPEED_KMH: f64 = 350.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SanityError {
    #[error("activity timezone could not be resolved")]
    UnknownTimezone,

    #[error("activity ends before it starts")]
    EndBeforeStart,

    #[error("activity is shorter than one second")]
    TooShort,

    #[error("invalid distance: {0}")]
    InvalidDistance(f64),

    #[error("implausible average speed: {0:.1} km/h")]
    ImplausibleSpeed(f64),

    #[error("waypoint {0} has invalid coordinates")]
    InvalidCoordinates(usize),
}

impl SanityError {
    pub fn reason(&self) -> ReasonCode {
        match self {
            SanityError::UnknownTimezone => ReasonCode::UnknownTZ,
            _ => ReasonCode::SanityError,
        }
    }
}

/// Offset implied by longitude alone, whole hours.
fn nautical_offset(longitude: f64) -> Option<FixedOffset> {
    let hours = (longitude / 15.0).round() as i32;
    FixedOffset::east_opt(hours * 3600)
}

/// Give a naive download the offset the canonical activity already carries,
/// falling back to the first waypoint's longitude.
pub fn resolve_timezone(downloaded: &mut Activity, canonical: &Activity) -> Result<(), SanityError> {
    if downloaded.start.is_aware() {
        return Ok(());
    }
    let offset = canonical
        .start
        .offset()
        .or_else(|| downloaded.end.and_then(|e| e.offset()))
        .or_else(|| {
            downloaded
                .waypoints
                .iter()
                .find_map(|w| w.longitude)
                .and_then(nautical_offset)
        })
        .ok_or(SanityError::UnknownTimezone)?;

    downloaded.start = downloaded.start.localized(offset);
    downloaded.end = downloaded.end.map(|e| e.localized(offset));
    Ok(())
}

fn valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
        && !(latitude == 0.0 && longitude == 0.0)
}

/// Track length over the located waypoints, in meters.
fn waypoint_distance(activity: &Activity) -> Option<f64> {
    let points: Vec<Point<f64>> = activity
        .waypoints
        .iter()
        .filter_map(|w| Some(Point::new(w.longitude?, w.latitude?)))
        .collect();
    if points.len() < 2 {
        return None;
    }
    Some(
        points
            .windows(2)
            .map(|pair| Haversine.distance(pair[0], pair[1]))
            .sum(),
    )
}

/// Validate an activity, filling in distance from waypoints if missing.
pub fn check(activity: &mut Activity) -> Result<(), SanityError> {
    if !matches!(activity.start, ActivityTime::Aware(_)) {
        return Err(SanityError::UnknownTimezone);
    }

    for (index, waypoint) in activity.waypoints.iter().enumerate() {
        if let (Some(lat), Some(lon)) = (waypoint.latitude, waypoint.longitude) {
            if !valid_coordinate(lat, lon) {
                return Err(SanityError::InvalidCoordinates(index));
            }
        }
    }

    if activity.stats.distance_meters().is_none() {
        if let Some(meters) = waypoint_distance(activity) {
            activity.stats.distance = Some(ActivityStatistic::with_value(StatUnit::Meters, meters));
        }
    }

    let duration = activity.duration();
    if let Some(duration) = duration {
        if activity.end.is_some() && duration <= Duration::zero() {
            return Err(SanityError::EndBeforeStart);
        }
        if duration < Duration::seconds(1) {
            return Err(SanityError::TooShort);
        }
    }

    if let Some(meters) = activity.stats.distance_meters() {
        if !meters.is_finite() || meters < 0.0 {
            return Err(SanityError::InvalidDistance(meters));
        }
        if let Some(duration) = duration {
            let hours = duration.num_milliseconds() as f64 / 3_600_000.0;
            let kmh = (meters / 1000.0) / hours;
            if kmh > MAX_SPEED_KMH {
                return Err(SanityError::ImplausibleSpeed(kmh));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivityType, Waypoint};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn run(minutes: i64) -> Activity {
        let start = Utc.with_ymd_and_hms(2021, 5, 1, 8, 0, 0).unwrap();
        Activity::new(start, ActivityType::Running).with_end(start + Duration::minutes(minutes))
    }

    #[test]
    fn test_valid_activity_passes() {
        let mut act = run(30).with_distance(6000.0);
        assert_eq!(check(&mut act), Ok(()));
    }

    #[test]
    fn test_duration_checks() {
        assert_eq!(check(&mut run(0)), Err(SanityError::EndBeforeStart));
        assert_eq!(check(&mut run(-5)), Err(SanityError::EndBeforeStart));
    }

    #[test]
    fn test_distance_and_speed_checks() {
        let mut negative = run(30).with_distance(-1.0);
        assert_eq!(check(&mut negative), Err(SanityError::InvalidDistance(-1.0)));

        let mut nan = run(30).with_distance(f64::NAN);
        assert!(matches!(check(&mut nan), Err(SanityError::InvalidDistance(_))));

        // 200 km in 30 minutes is 400 km/h.
        let mut fast = run(30).with_distance(200_000.0);
        assert!(matches!(check(&mut fast), Err(SanityError::ImplausibleSpeed(_))));
    }

    #[test]
    fn test_coordinates() {
        let mut act = run(30);
        act.waypoints = vec![Waypoint::at(37.4, -122.2), Waypoint::at(0.0, 0.0)];
        assert_eq!(check(&mut act), Err(SanityError::InvalidCoordinates(1)));

        act.waypoints = vec![Waypoint::at(91.0, 10.0)];
        assert_eq!(check(&mut act), Err(SanityError::InvalidCoordinates(0)));
    }

    #[test]
    fn test_distance_filled_from_waypoints() {
        let mut act = run(30);
        act.waypoints = vec![Waypoint::at(37.40, -122.20), Waypoint::at(37.41, -122.20)];
        assert_eq!(check(&mut act), Ok(()));
        let meters = act.stats.distance_meters().unwrap();
        assert!((meters - 1112.0).abs() < 5.0, "got {}", meters);
    }

    #[test]
    fn test_timezone_resolution() {
        let naive = NaiveDate::from_ymd_opt(2021, 5, 1)
            .unwrap()
            .and_hms_opt(2, 0, 0)
            .unwrap();
        let canonical = Activity::new(
            FixedOffset::west_opt(6 * 3600)
                .unwrap()
                .with_ymd_and_hms(2021, 5, 1, 2, 0, 0)
                .unwrap(),
            ActivityType::Running,
        );

        let mut downloaded = Activity::new(naive, ActivityType::Running);
        resolve_timezone(&mut downloaded, &canonical).unwrap();
        assert_eq!(downloaded.start, canonical.start);

        let mut orphan = Activity::new(naive, ActivityType::Running);
        let naive_canonical = orphan.clone();
        assert_eq!(
            resolve_timezone(&mut orphan, &naive_canonical),
            Err(SanityError::UnknownTimezone)
        );

        let mut located = Activity::new(naive, ActivityType::Running);
        located.waypoints = vec![Waypoint::at(37.4, -122.2)];
        resolve_timezone(&mut located, &naive_canonical).unwrap();
        assert_eq!(located.start.offset(), FixedOffset::west_opt(8 * 3600));
    }
}
