use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, TimeZone};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

const ROLLING_WINDOW_DAYS: i64 = 30;

/// Symbolic window understood by the resolver. Always relative to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum TimeRangeKind {
    #[strum(to_string = "last_30_days")]
    Last30Days,
    #[strum(to_string = "previous_month")]
    PreviousMonth,
    #[strum(to_string = "current_month")]
    CurrentMonth,
}

impl TimeRangeKind {
    pub fn label(&self) -> &'static str {
        match self {
            TimeRangeKind::Last30Days => "Last 30 days",
            TimeRangeKind::PreviousMonth => "Previous month",
            TimeRangeKind::CurrentMonth => "Current month",
        }
    }

    pub fn resolve(&self, now: DateTime<Local>) -> Result<TimeRange, TimeframeError> {
        let (start, end) = match self {
            TimeRangeKind::Last30Days => (now - Duration::days(ROLLING_WINDOW_DAYS), now),
            TimeRangeKind::PreviousMonth => {
                let first_of_current = start_of_month(now.year(), now.month())?;
                let (year, month) = previous_month(now.year(), now.month());
                let first_of_previous = start_of_month(year, month)?;
                (first_of_previous, first_of_current - Duration::seconds(1))
            }
            TimeRangeKind::CurrentMonth => (start_of_month(now.year(), now.month())?, now),
        };
        Ok(TimeRange {
            kind: *self,
            start,
            end,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub kind: TimeRangeKind,
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
}

impl TimeRange {
    pub fn start_ts(&self) -> i64 {
        self.start.timestamp()
    }

    pub fn end_ts(&self) -> i64 {
        self.end.timestamp()
    }

    pub fn describe(&self) -> String {
        format!(
            "{} ({} -> {})",
            self.kind.label(),
            self.start.format("%Y-%m-%d %H:%M:%S"),
            self.end.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TimeframeError {
    #[error("unknown time range kind '{0}' (expected one of: {})", expected_kinds())]
    UnknownKind(String),
    #[error("no valid local time at the start of {year}-{month:02}")]
    MissingLocalTime { year: i32, month: u32 },
}

fn expected_kinds() -> String {
    TimeRangeKind::iter()
        .map(|kind| kind.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn start_of_month(year: i32, month: u32) -> Result<DateTime<Local>, TimeframeError> {
    let missing = TimeframeError::MissingLocalTime { year, month };
    let Some(date) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return Err(missing);
    };
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    // Some zones skip midnight on DST changes; the first valid instant is then 01:00.
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            Local
                .from_local_datetime(&(midnight + Duration::hours(1)))
                .earliest()
        })
        .ok_or(missing)
}

pub fn parse_kind(raw: &str) -> Result<TimeRangeKind, TimeframeError> {
    TimeRangeKind::from_str(raw.trim()).map_err(|_| TimeframeError::UnknownKind(raw.to_string()))
}

/// Resolves a symbolic expression against the current wall clock.
pub fn resolve(expression: &str) -> Result<TimeRange, TimeframeError> {
    resolve_at(expression, Local::now())
}

pub fn resolve_at(expression: &str, now: DateTime<Local>) -> Result<TimeRange, TimeframeError> {
    parse_kind(expression)?.resolve(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn last_30_days_ends_now() {
        let now = local(2025, 11, 28, 13, 30, 42);
        let range = resolve_at("last_30_days", now).unwrap();
        assert_eq!(range.end, now);
        assert_eq!(range.end_ts() - range.start_ts(), 30 * 24 * 3600);
        assert_eq!(range.kind, TimeRangeKind::Last30Days);
    }

    #[test]
    fn previous_month_covers_whole_prior_month_on_any_day() {
        for day in 1..=28 {
            let now = local(2025, 3, day, 12, 0, 0);
            let range = resolve_at("previous_month", now).unwrap();
            assert_eq!(range.start, local(2025, 2, 1, 0, 0, 0));
            assert_eq!(range.end, local(2025, 2, 28, 23, 59, 59));
        }
    }

    #[test]
    fn previous_month_wraps_year() {
        let now = local(2025, 1, 15, 9, 0, 0);
        let range = resolve_at("previous_month", now).unwrap();
        assert_eq!(range.start, local(2024, 12, 1, 0, 0, 0));
        assert_eq!(range.end.month(), 12);
        assert_eq!(range.end.day(), 31);
        assert_eq!(
            (range.end.hour(), range.end.minute(), range.end.second()),
            (23, 59, 59)
        );
    }

    #[test]
    fn current_month_starts_on_the_first() {
        let now = local(2025, 6, 17, 8, 45, 0);
        let range = resolve_at("current_month", now).unwrap();
        assert_eq!(range.start, local(2025, 6, 1, 0, 0, 0));
        assert_eq!(range.end, now);
    }

    #[test]
    fn resolving_twice_at_same_instant_is_identical() {
        let now = local(2025, 8, 10, 10, 10, 10);
        for kind in TimeRangeKind::iter() {
            assert_eq!(kind.resolve(now).unwrap(), kind.resolve(now).unwrap());
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = resolve_at("last_quarter", local(2025, 8, 10, 10, 0, 0)).unwrap_err();
        assert!(matches!(err, TimeframeError::UnknownKind(ref raw) if raw == "last_quarter"));
        assert!(err.to_string().contains("previous_month"));
    }

    #[test]
    fn invalid_month_names_the_requested_month() {
        let err = start_of_month(2025, 13).unwrap_err();
        assert!(matches!(err, TimeframeError::MissingLocalTime { year: 2025, month: 13 }));
        assert_eq!(err.to_string(), "no valid local time at the start of 2025-13");
    }

    #[test]
    fn kinds_round_trip_through_their_names() {
        assert_eq!(parse_kind("current_month").unwrap(), TimeRangeKind::CurrentMonth);
        assert_eq!(TimeRangeKind::Last30Days.to_string(), "last_30_days");
    }
}
