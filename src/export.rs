use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone};
use log::info;
use serde::Serialize;

use crate::trend::TrendSeries;

const MAX_FILE_STEM: usize = 100;
const MAX_ITEM_STEM: usize = 50;
const RUN_FOLDER_FORMAT: &str = "%Y%m%d_%H%M%S";

fn is_reserved(ch: char) -> bool {
    matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
}

/// Make `value` safe to use as a file name on every platform.
pub fn sanitize_filename(value: &str) -> String {
    let mut cleaned = String::with_capacity(value.len());
    for ch in value.chars() {
        let mapped = if is_reserved(ch) || ch.is_whitespace() {
            '_'
        } else {
            ch
        };
        if mapped == '_' && cleaned.ends_with('_') {
            continue;
        }
        cleaned.push(mapped);
    }
    let truncated: String = cleaned.chars().take(MAX_FILE_STEM).collect();
    truncated.trim_matches('_').to_string()
}

/// File stem shared by every artifact of one (host, item) pair.
pub fn item_stem(host_name: &str, item_name: &str) -> String {
    let joined = sanitize_filename(&format!("{host_name}_{item_name}"));
    joined.chars().take(MAX_ITEM_STEM).collect()
}

pub fn timestamp_label<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format(RUN_FOLDER_FORMAT).to_string()
}

/// `<stem>_<YYYYmmdd_HHMMSS>.<ext>`, so repeated runs never overwrite.
pub fn timestamped_file_name(stem: &str, extension: &str, now: &DateTime<Local>) -> String {
    format!("{}_{}.{extension}", sanitize_filename(stem), timestamp_label(now))
}

/// Creates `<base>/downloads/<YYYYmmdd_HHMMSS>` and returns it.
pub fn create_run_folder(base_dir: &Path, now: &DateTime<Local>) -> io::Result<PathBuf> {
    let folder = base_dir.join("downloads").join(timestamp_label(now));
    fs::create_dir_all(&folder)?;
    info!("Created output folder: {}", folder.display());
    Ok(folder)
}

#[derive(Serialize)]
struct TrendRow {
    timestamp: i64,
    iso_datetime: String,
    min: f64,
    avg: f64,
    max: f64,
    sample_count: u64,
}

/// Writes the raw trend points as `<stem>_trends.csv` inside `dir`.
pub fn write_trend_csv(
    series: &TrendSeries,
    dir: &Path,
    host_name: &str,
    item_name: &str,
) -> Result<PathBuf, csv::Error> {
    let path = dir.join(format!("{}_trends.csv", item_stem(host_name, item_name)));
    let mut writer = csv::Writer::from_path(&path)?;
    for point in series.sorted() {
        let iso_datetime = Local
            .timestamp_opt(point.clock, 0)
            .single()
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_default();
        writer.serialize(TrendRow {
            timestamp: point.clock,
            iso_datetime,
            min: point.min,
            avg: point.avg,
            max: point.max,
            sample_count: point.samples,
        })?;
    }
    writer.flush()?;
    info!("Saved trend data to: {}", path.display());
    Ok(path)
}
