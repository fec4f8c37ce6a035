use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::{self, Deserializer};
use serde::Deserialize;

/// One hourly min/avg/max aggregate as returned by `trend.get`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrendPoint {
    #[serde(deserialize_with = "lenient")]
    pub clock: i64,
    #[serde(rename = "value_min", deserialize_with = "lenient")]
    pub min: f64,
    #[serde(rename = "value_avg", deserialize_with = "lenient")]
    pub avg: f64,
    #[serde(rename = "value_max", deserialize_with = "lenient")]
    pub max: f64,
    #[serde(rename = "num", deserialize_with = "lenient", default)]
    pub samples: u64,
}

impl TrendPoint {
    pub fn new(clock: i64, min: f64, avg: f64, max: f64, samples: u64) -> Self {
        TrendPoint {
            clock,
            min,
            avg,
            max,
            samples,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.clock, 0)
            .single()
            .unwrap_or_default()
    }
}

/// Trend points for one item over one resolved window. Source order is not
/// guaranteed; use [`TrendSeries::sorted`] before any windowed work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendSeries {
    points: Vec<TrendPoint>,
}

impl TrendSeries {
    pub fn new(points: Vec<TrendPoint>) -> Self {
        TrendSeries { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> &[TrendPoint] {
        &self.points
    }

    pub fn sorted(&self) -> Vec<TrendPoint> {
        let mut sorted = self.points.clone();
        sorted.sort_by_key(|point| point.clock);
        sorted
    }
}

/// Zabbix encodes most numbers as JSON strings; accept either form.
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Text(String),
        Value(T),
    }

    match Raw::<T>::deserialize(deserializer)? {
        Raw::Text(text) => text.trim().parse().map_err(de::Error::custom),
        Raw::Value(value) => Ok(value),
    }
}
