use chrono::{Duration, FixedOffset, NaiveDate, TimeZone};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use fitsync::models::{Activity, ActivityType, ServiceData};
use fitsync::services::coalesce::coalesce_pair;
use fitsync::services::{accumulate, AccumulateMode, CoalesceTolerances};
use std::hint::black_box;

const DAYS: i64 = 365;

/// A year of daily runs as reported by a timezone-aware service.
fn aware_history(connection: &str) -> Vec<Activity> {
    let tz = FixedOffset::east_opt(2 * 3600).expect("valid offset");
    let first = tz
        .with_ymd_and_hms(2024, 1, 1, 7, 30, 0)
        .single()
        .expect("valid start");
    (0..DAYS)
        .map(|day| {
            let start = first + Duration::days(day);
            let mut activity = Activity::new(start, ActivityType::Running)
                .with_end(start + Duration::minutes(45))
                .with_name(format!("Run {}", day))
                .with_distance(8_000.0 + day as f64);
            activity.service_data.insert(
                connection.to_string(),
                ServiceData::new(format!("{}-{}", connection, day)),
            );
            activity
        })
        .collect()
}

/// The same runs seen by a service that only records local wall-clock time,
/// one minute late.
fn naive_history(connection: &str) -> Vec<Activity> {
    let first = NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(7, 31, 0))
        .expect("valid start");
    (0..DAYS)
        .map(|day| {
            let start = first + Duration::days(day);
            let mut activity = Activity::new(start, ActivityType::Running)
                .with_end(start + Duration::minutes(45));
            activity.service_data.insert(
                connection.to_string(),
                ServiceData::new(format!("{}-{}", connection, day)),
            );
            activity
        })
        .collect()
}

fn benchmark_accumulate(c: &mut Criterion) {
    let tolerances = CoalesceTolerances::default();
    let aware = aware_history("conn-a");
    let naive = naive_history("conn-b");

    let mut seeded = Vec::new();
    accumulate(
        &mut seeded,
        "conn-a",
        aware.clone(),
        AccumulateMode::Full,
        &tolerances,
    );

    let mut group = c.benchmark_group("accumulate");

    group.bench_function("first_listing_into_empty", |b| {
        b.iter_batched(
            || (Vec::new(), aware.clone()),
            |(mut canonical, incoming)| {
                accumulate(
                    &mut canonical,
                    "conn-a",
                    black_box(incoming),
                    AccumulateMode::Full,
                    &tolerances,
                )
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("naive_listing_matches_aware", |b| {
        b.iter_batched(
            || (seeded.clone(), naive.clone()),
            |(mut canonical, incoming)| {
                accumulate(
                    &mut canonical,
                    "conn-b",
                    black_box(incoming),
                    AccumulateMode::Full,
                    &tolerances,
                )
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("update_only_relisting", |b| {
        b.iter_batched(
            || (seeded.clone(), aware.clone()),
            |(mut canonical, incoming)| {
                accumulate(
                    &mut canonical,
                    "conn-a",
                    black_box(incoming),
                    AccumulateMode::UpdateOnly,
                    &tolerances,
                )
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();

    let (a, b) = (&seeded[0], &naive[0]);
    c.bench_function("coalesce_pair", |bench| {
        bench.iter(|| coalesce_pair(black_box(a), black_box(b)))
    });
}

criterion_group!(benches, benchmark_accumulate);
criterion_main!(benches);
