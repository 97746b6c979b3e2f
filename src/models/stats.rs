//! Activity statistics with explicit units and sample-weighted merging.
//!
//! Each statistic carries a sample count per field so that repeated merges
//! from several sources re-average correctly regardless of merge order.

use serde::{Deserialize, Serialize};

/// Physical dimension of a statistic; conversions only happen within one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Length,
    Time,
    Energy,
    Speed,
    HeartRate,
    Cadence,
    Power,
    Temperature,
}

/// Unit of a statistic. Values are never stored without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatUnit {
    Meters,
    Kilometers,
    Miles,
    Feet,
    Seconds,
    Kilocalories,
    Kilojoules,
    MetersPerSecond,
    KilometersPerHour,
    MilesPerHour,
    BeatsPerMinute,
    RevolutionsPerMinute,
    StepsPerMinute,
    Watts,
    DegreesCelsius,
    DegreesFahrenheit,
}

impl StatUnit {
    pub fn dimension(self) -> Dimension {
        match self {
            StatUnit::Meters | StatUnit::Kilometers | StatUnit::Miles | StatUnit::Feet => {
                Dimension::Length
            }
            StatUnit::Seconds => Dimension::Time,
            StatUnit::Kilocalories | StatUnit::Kilojoules => Dimension::Energy,
            StatUnit::MetersPerSecond | StatUnit::KilometersPerHour | StatUnit::MilesPerHour => {
                Dimension::Speed
            }
            StatUnit::BeatsPerMinute => Dimension::HeartRate,
            StatUnit::RevolutionsPerMinute | StatUnit::StepsPerMinute => Dimension::Cadence,
            StatUnit::Watts => Dimension::Power,
            StatUnit::DegreesCelsius | StatUnit::DegreesFahrenheit => Dimension::Temperature,
        }
    }

    /// Canonical unit for the dimension; mixed-unit merges happen here.
    pub fn canonical(self) -> StatUnit {
        match self.dimension() {
            Dimension::Length => StatUnit::Meters,
            Dimension::Time => StatUnit::Seconds,
            Dimension::Energy => StatUnit::Kilojoules,
            Dimension::Speed => StatUnit::MetersPerSecond,
            Dimension::HeartRate => StatUnit::BeatsPerMinute,
            Dimension::Cadence => StatUnit::RevolutionsPerMinute,
            Dimension::Power => StatUnit::Watts,
            Dimension::Temperature => StatUnit::DegreesCelsius,
        }
    }

    fn to_canonical(self, value: f64) -> f64 {
        match self {
            StatUnit::Kilometers => value * 1000.0,
            StatUnit::Miles => value * 1609.344,
            StatUnit::Feet => value * 0.3048,
            StatUnit::Kilocalories => value * 4.184,
            StatUnit::KilometersPerHour => value / 3.6,
            StatUnit::MilesPerHour => value * 0.44704,
            // One stride per revolution.
            StatUnit::StepsPerMinute => value / 2.0,
            StatUnit::DegreesFahrenheit => (value - 32.0) * 5.0 / 9.0,
            _ => value,
        }
    }

    fn from_canonical(self, value: f64) -> f64 {
        match self {
            StatUnit::Kilometers => value / 1000.0,
            StatUnit::Miles => value / 1609.344,
            StatUnit::Feet => value / 0.3048,
            StatUnit::Kilocalories => value / 4.184,
            StatUnit::KilometersPerHour => value * 3.6,
            StatUnit::MilesPerHour => value / 0.44704,
            StatUnit::StepsPerMinute => value * 2.0,
            StatUnit::DegreesFahrenheit => value * 9.0 / 5.0 + 32.0,
            _ => value,
        }
    }

    /// Convert a value between units of the same dimension.
    pub fn convert(self, value: f64, target: StatUnit) -> Option<f64> {
        if self == target {
            return Some(value);
        }
        if self.dimension() != target.dimension() {
            return None;
        }
        Some(target.from_canonical(self.to_canonical(value)))
    }
}

/// Number of samples contributing to each field of a statistic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSamples {
    #[serde(default)]
    pub value: u32,
    #[serde(default)]
    pub average: u32,
    #[serde(default)]
    pub min: u32,
    #[serde(default)]
    pub max: u32,
    #[serde(default)]
    pub gain: u32,
    #[serde(default)]
    pub loss: u32,
}

/// A single named statistic (distance, heart rate, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityStatistic {
    pub unit: StatUnit,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub average: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub gain: Option<f64>,
    #[serde(default)]
    pub loss: Option<f64>,
    #[serde(default)]
    pub samples: StatSamples,
}

#[derive(Clone, Copy)]
enum FieldMerge {
    Weighted,
    Minimum,
    Maximum,
}

fn merge_field(
    a: Option<f64>,
    a_samples: u32,
    b: Option<f64>,
    b_samples: u32,
    how: FieldMerge,
) -> (Option<f64>, u32) {
    match (a, b) {
        (None, None) => (None, 0),
        (Some(x), None) => (Some(x), a_samples.max(1)),
        (None, Some(y)) => (Some(y), b_samples.max(1)),
        (Some(x), Some(y)) => {
            let wa = a_samples.max(1);
            let wb = b_samples.max(1);
            let merged = match how {
                FieldMerge::Minimum => x.min(y),
                FieldMerge::Maximum => x.max(y),
                FieldMerge::Weighted => {
                    (x * f64::from(wa) + y * f64::from(wb)) / f64::from(wa + wb)
                }
            };
            (Some(merged), wa + wb)
        }
    }
}

impl ActivityStatistic {
    pub fn new(unit: StatUnit) -> Self {
        Self {
            unit,
            value: None,
            average: None,
            min: None,
            max: None,
            gain: None,
            loss: None,
            samples: StatSamples::default(),
        }
    }

    /// Statistic with a single sampled value.
    pub fn with_value(unit: StatUnit, value: f64) -> Self {
        let mut stat = Self::new(unit);
        stat.value = Some(value);
        stat.samples.value = 1;
        stat
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.average.is_none()
            && self.min.is_none()
            && self.max.is_none()
            && self.gain.is_none()
            && self.loss.is_none()
    }

    /// Express this statistic in another unit of the same dimension.
    pub fn as_unit(&self, target: StatUnit) -> Option<ActivityStatistic> {
        let conv = |v: Option<f64>| match v {
            Some(v) => self.unit.convert(v, target).map(Some),
            None => Some(None),
        };
        Some(ActivityStatistic {
            unit: target,
            value: conv(self.value)?,
            average: conv(self.average)?,
            min: conv(self.min)?,
            max: conv(self.max)?,
            gain: conv(self.gain)?,
            loss: conv(self.loss)?,
            samples: self.samples,
        })
    }

    /// Value of this statistic in `target` units, if any.
    pub fn value_in(&self, target: StatUnit) -> Option<f64> {
        self.value.and_then(|v| self.unit.convert(v, target))
    }

    /// Merge two observations of the same statistic.
    ///
    /// Commutative: `a.coalesce(&b) == b.coalesce(&a)`.
    pub fn coalesce(&self, other: &ActivityStatistic) -> ActivityStatistic {
        let pair = if self.unit == other.unit {
            Some((self.clone(), other.clone()))
        } else {
            let canonical = self.unit.canonical();
            self.as_unit(canonical).zip(other.as_unit(canonical))
        };

        let Some((a, b)) = pair else {
            tracing::debug!(
                left = ?self.unit,
                right = ?other.unit,
                "Incompatible statistic units, keeping the richer side"
            );
            return if other.sample_total() > self.sample_total() {
                other.clone()
            } else {
                self.clone()
            };
        };

        let (value, value_n) = merge_field(
            a.value,
            a.samples.value,
            b.value,
            b.samples.value,
            FieldMerge::Weighted,
        );
        let (average, average_n) = merge_field(
            a.average,
            a.samples.average,
            b.average,
            b.samples.average,
            FieldMerge::Weighted,
        );
        let (min, min_n) = merge_field(a.min, a.samples.min, b.min, b.samples.min, FieldMerge::Minimum);
        let (max, max_n) = merge_field(a.max, a.samples.max, b.max, b.samples.max, FieldMerge::Maximum);
        let (gain, gain_n) = merge_field(
            a.gain,
            a.samples.gain,
            b.gain,
            b.samples.gain,
            FieldMerge::Weighted,
        );
        let (loss, loss_n) = merge_field(
            a.loss,
            a.samples.loss,
            b.loss,
            b.samples.loss,
            FieldMerge::Weighted,
        );

        ActivityStatistic {
            unit: a.unit,
            value,
            average,
            min,
            max,
            gain,
            loss,
            samples: StatSamples {
                value: value_n,
                average: average_n,
                min: min_n,
                max: max_n,
                gain: gain_n,
                loss: loss_n,
            },
        }
    }

    fn sample_total(&self) -> u32 {
        let s = &self.samples;
        s.value + s.average + s.min + s.max + s.gain + s.loss
    }
}

fn coalesce_opt(
    a: &Option<ActivityStatistic>,
    b: &Option<ActivityStatistic>,
) -> Option<ActivityStatistic> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.coalesce(y)),
        (Some(x), None) | (None, Some(x)) => Some(x.clone()),
        (None, None) => None,
    }
}

/// The full set of statistics for an activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityStatistics {
    #[serde(default)]
    pub distance: Option<ActivityStatistic>,
    #[serde(default)]
    pub timer_time: Option<ActivityStatistic>,
    #[serde(default)]
    pub moving_time: Option<ActivityStatistic>,
    #[serde(default)]
    pub energy: Option<ActivityStatistic>,
    #[serde(default)]
    pub speed: Option<ActivityStatistic>,
    #[serde(default)]
    pub elevation: Option<ActivityStatistic>,
    #[serde(default)]
    pub heart_rate: Option<ActivityStatistic>,
    #[serde(default)]
    pub cadence: Option<ActivityStatistic>,
    #[serde(default)]
    pub power: Option<ActivityStatistic>,
    #[serde(default)]
    pub temperature: Option<ActivityStatistic>,
}

impl ActivityStatistics {
    /// Merge with another source's statistics, field by field.
    pub fn coalesce(&self, other: &ActivityStatistics) -> ActivityStatistics {
        ActivityStatistics {
            distance: coalesce_opt(&self.distance, &other.distance),
            timer_time: coalesce_opt(&self.timer_time, &other.timer_time),
            moving_time: coalesce_opt(&self.moving_time, &other.moving_time),
            energy: coalesce_opt(&self.energy, &other.energy),
            speed: coalesce_opt(&self.speed, &other.speed),
            elevation: coalesce_opt(&self.elevation, &other.elevation),
            heart_rate: coalesce_opt(&self.heart_rate, &other.heart_rate),
            cadence: coalesce_opt(&self.cadence, &other.cadence),
            power: coalesce_opt(&self.power, &other.power),
            temperature: coalesce_opt(&self.temperature, &other.temperature),
        }
    }

    /// Distance in meters, if known.
    pub fn distance_meters(&self) -> Option<f64> {
        self.distance
            .as_ref()
            .and_then(|d| d.value_in(StatUnit::Meters))
    }

    /// True if any sensor statistic besides distance/time is present.
    pub fn has_sensor_data(&self) -> bool {
        [
            &self.heart_rate,
            &self.cadence,
            &self.power,
            &self.temperature,
        ]
        .iter()
        .any(|s| s.as_ref().is_some_and(|s| !s.is_empty()))
    }
}
