//! Presentation helpers. Statistics are kept at full precision everywhere
//! else; rounding to two decimals happens only here.

use chrono::Weekday;

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Format bytes to human-readable format (B, KiB, MiB, GiB, TiB)
pub fn format_bytes(value: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut val = value;
    let mut unit = "B";
    for next in &UNITS {
        unit = next;
        if val.abs() < 1024.0 || *next == "TiB" {
            break;
        }
        val /= 1024.0;
    }
    if unit == "B" {
        format!("{val:.0}{unit}")
    } else {
        format!("{val:.1}{unit}")
    }
}

/// Two-decimal rendering of a raw value
pub fn format_number(value: f64) -> String {
    format!("{value:.2}")
}

/// Render a value with the item's Zabbix unit string
pub fn format_measure(value: f64, units: &str) -> String {
    match units.trim() {
        "" => format_number(value),
        "%" => format!("{}%", format_number(value)),
        "B" => format_bytes(value),
        other => format!("{} {other}", format_number(value)),
    }
}

/// Hour of day as `HH:00`
pub fn hour_label(hour: u32) -> String {
    format!("{hour:02}:00")
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Month name for a 1-based month number
pub fn month_name(month: u32) -> &'static str {
    month
        .checked_sub(1)
        .and_then(|index| MONTH_NAMES.get(index as usize))
        .copied()
        .unwrap_or("unknown month")
}

pub fn join_hours(hours: &[u32]) -> String {
    hours
        .iter()
        .map(|h| hour_label(*h))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn join_days(days: &[Weekday]) -> String {
    days.iter()
        .map(|d| weekday_name(*d))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_handles_various_sizes() {
        assert_eq!(format_bytes(512.0), "512B");
        assert_eq!(format_bytes(1024.0), "1.0KiB");
        assert_eq!(format_bytes(1536.0), "1.5KiB");
        assert_eq!(format_bytes(1_048_576.0), "1.0MiB");
        assert_eq!(format_bytes(1_073_741_824.0), "1.0GiB");
    }

    #[test]
    fn measures_round_to_two_decimals() {
        assert_eq!(format_measure(12.345_678, "%"), "12.35%");
        assert_eq!(format_measure(3.0, ""), "3.00");
        assert_eq!(format_measure(0.5, "s"), "0.50 s");
        assert_eq!(format_measure(2048.0, "B"), "2.0KiB");
    }

    #[test]
    fn labels_for_hours_days_and_months() {
        assert_eq!(hour_label(2), "02:00");
        assert_eq!(join_hours(&[14, 9]), "14:00, 09:00");
        assert_eq!(join_days(&[Weekday::Mon, Weekday::Sun]), "Monday, Sunday");
        assert_eq!(month_name(1), "January");
        assert_eq!(month_name(12), "December");
        assert_eq!(month_name(0), "unknown month");
    }
}
