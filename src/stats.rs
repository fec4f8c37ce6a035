use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use ordered_float::OrderedFloat;

use crate::trend::{TrendPoint, TrendSeries};

/// Number of hour/weekday buckets reported as peaks.
pub const PEAK_BUCKETS: usize = 3;

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Full-precision statistics over one trend series. Rounding is left to
/// the formatting helpers in [`crate::units`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsSummary {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
    pub std_dev: f64,
    /// Hours of day (UTC, 0-23), highest mean first.
    pub peak_hours: Vec<u32>,
    /// Weekdays (UTC), highest mean first.
    pub peak_days: Vec<Weekday>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation; a single value has no spread.
fn sample_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let squared: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (squared / (values.len() - 1) as f64).sqrt()
}

/// Linear interpolation between closest ranks over ascending `sorted`.
pub fn percentile(sorted: &[f64], quantile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = quantile.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

#[derive(Default)]
struct Bucket {
    total: f64,
    count: usize,
}

impl Bucket {
    fn record(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }

    fn mean(&self) -> f64 {
        self.total / self.count as f64
    }
}

// BTreeMap iterates keys ascending and the sort is stable, so equal means
// keep ascending key order.
fn top_buckets<K: Ord + Copy>(buckets: &BTreeMap<K, Bucket>) -> Vec<K> {
    let mut means: Vec<(K, f64)> = buckets
        .iter()
        .map(|(key, bucket)| (*key, bucket.mean()))
        .collect();
    means.sort_by_key(|(_, value)| std::cmp::Reverse(OrderedFloat(*value)));
    means
        .into_iter()
        .take(PEAK_BUCKETS)
        .map(|(key, _)| key)
        .collect()
}

fn peak_hours(points: &[TrendPoint]) -> Vec<u32> {
    let mut buckets: BTreeMap<u32, Bucket> = BTreeMap::new();
    for point in points {
        buckets
            .entry(point.timestamp().hour())
            .or_default()
            .record(point.avg);
    }
    top_buckets(&buckets)
}

fn peak_days(points: &[TrendPoint]) -> Vec<Weekday> {
    let mut buckets: BTreeMap<u32, Bucket> = BTreeMap::new();
    for point in points {
        buckets
            .entry(point.timestamp().weekday().num_days_from_monday())
            .or_default()
            .record(point.avg);
    }
    top_buckets(&buckets)
        .into_iter()
        .map(|index| WEEKDAYS[index as usize])
        .collect()
}

/// Computes statistics over `series`. Returns `None` when there is no
/// usable data: an empty series, or one where every point carries a
/// non-finite value.
pub fn compute(series: &TrendSeries) -> Option<StatisticsSummary> {
    let points: Vec<TrendPoint> = series
        .sorted()
        .into_iter()
        .filter(|p| p.min.is_finite() && p.avg.is_finite() && p.max.is_finite())
        .collect();
    let (first, last) = (points.first()?, points.last()?);

    let averages: Vec<f64> = points.iter().map(|p| p.avg).collect();
    let mut ranked = averages.clone();
    ranked.sort_by_key(|value| OrderedFloat(*value));

    let avg = mean(&averages);
    let min = points
        .iter()
        .map(|p| p.min.min(p.avg))
        .fold(f64::INFINITY, f64::min);
    let max = points
        .iter()
        .map(|p| p.max.max(p.avg))
        .fold(f64::NEG_INFINITY, f64::max);

    Some(StatisticsSummary {
        count: points.len(),
        avg,
        min,
        max,
        p95: percentile(&ranked, 0.95)?,
        p99: percentile(&ranked, 0.99)?,
        std_dev: sample_std_dev(&averages, avg),
        peak_hours: peak_hours(&points),
        peak_days: peak_days(&points),
        period_start: first.timestamp(),
        period_end: last.timestamp(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{hour_label, weekday_name};

    fn flat(clock: i64, value: f64) -> TrendPoint {
        TrendPoint::new(clock, value, value, value, 60)
    }

    #[test]
    fn empty_series_has_no_statistics() {
        assert!(compute(&TrendSeries::default()).is_none());
    }

    #[test]
    fn non_finite_points_are_not_treated_as_data() {
        let series = TrendSeries::new(vec![TrendPoint::new(0, f64::NAN, f64::NAN, f64::NAN, 1)]);
        assert!(compute(&series).is_none());
    }

    #[test]
    fn three_hourly_points() {
        let series = TrendSeries::new(vec![flat(0, 10.0), flat(3600, 20.0), flat(7200, 30.0)]);
        let stats = compute(&series).unwrap();

        assert_eq!(stats.count, 3);
        assert!((stats.avg - 20.0).abs() < 1e-9);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 30.0);
        assert!((stats.p95 - 29.0).abs() < 1e-9);
        assert!((stats.p99 - 29.8).abs() < 1e-9);
        assert!((stats.std_dev - 10.0).abs() < 1e-9);

        let hours: Vec<String> = stats.peak_hours.iter().map(|h| hour_label(*h)).collect();
        assert_eq!(hours, vec!["02:00", "01:00", "00:00"]);
        // 1970-01-01 was a Thursday.
        let days: Vec<&str> = stats.peak_days.iter().map(|d| weekday_name(*d)).collect();
        assert_eq!(days, vec!["Thursday"]);
        assert_eq!(stats.period_start.timestamp(), 0);
        assert_eq!(stats.period_end.timestamp(), 7200);
    }

    #[test]
    fn extrema_come_from_min_and_max_fields() {
        let series = TrendSeries::new(vec![
            TrendPoint::new(0, 2.0, 10.0, 40.0, 60),
            TrendPoint::new(3600, 5.0, 20.0, 90.0, 60),
        ]);
        let stats = compute(&series).unwrap();
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 90.0);
        assert!(stats.min <= stats.avg && stats.avg <= stats.max);
        assert!(stats.p95 <= stats.p99);
    }

    #[test]
    fn peak_ties_break_on_ascending_key() {
        let day = 24 * 3600;
        let series = TrendSeries::new(vec![
            flat(5 * 3600, 50.0),
            flat(3 * 3600, 50.0),
            flat(9 * 3600, 10.0),
            flat(day + 3 * 3600, 50.0),
            flat(day + 12 * 3600, 70.0),
        ]);
        let stats = compute(&series).unwrap();
        assert_eq!(stats.peak_hours, vec![12, 3, 5]);
        // Thursday holds 50, 50, 10 (mean 36.67); Friday 50, 70 (mean 60).
        assert_eq!(stats.peak_days, vec![Weekday::Fri, Weekday::Thu]);
    }

    #[test]
    fn reordered_series_yields_identical_summary() {
        let points: Vec<TrendPoint> = (0..48)
            .map(|i| flat(i * 3600, ((i * 37) % 11) as f64))
            .collect();
        let mut reversed = points.clone();
        reversed.reverse();

        let forward = compute(&TrendSeries::new(points)).unwrap();
        let backward = compute(&TrendSeries::new(reversed)).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward.peak_hours.len(), PEAK_BUCKETS);
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 0.0), Some(1.0));
        assert_eq!(percentile(&sorted, 1.0), Some(4.0));
        assert_eq!(percentile(&sorted, 0.5), Some(2.5));
        assert_eq!(percentile(&[], 0.5), None);
        assert_eq!(percentile(&[7.0], 0.95), Some(7.0));
    }

    #[test]
    fn single_point_has_zero_spread() {
        let stats = compute(&TrendSeries::new(vec![flat(0, 42.0)])).unwrap();
        assert_eq!(stats.std_dev, 0.0);
        assert_eq!(stats.p95, 42.0);
    }
}
