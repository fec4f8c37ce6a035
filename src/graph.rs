use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use image::RgbImage;
use log::{info, warn};
use plotters::prelude::*;
use plotters::series::LineSeries;
use plotters::style::RGBColor;

use crate::trend::{TrendPoint, TrendSeries};
use crate::units::format_measure;

const AVG_BLUE: RGBColor = RGBColor(31, 119, 180);
const BAND_BLUE: RGBColor = RGBColor(120, 170, 220);

/// Outline of the min–max band: maxima left to right, then minima back.
pub fn band_outline(points: &[TrendPoint]) -> Vec<(DateTime<Utc>, f64)> {
    let upper = points.iter().map(|p| (p.timestamp(), p.max));
    let lower = points.iter().rev().map(|p| (p.timestamp(), p.min));
    upper.chain(lower).collect()
}

/// Time axis bounds; a single point is widened to one hour.
pub fn time_bounds(points: &[TrendPoint]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let min_ts = points.iter().map(TrendPoint::timestamp).min()?;
    let max_ts = points.iter().map(TrendPoint::timestamp).max()?;
    if min_ts == max_ts {
        return Some((min_ts, max_ts + Duration::hours(1)));
    }
    Some((min_ts, max_ts))
}

/// Padded value axis bounds. Non-negative data keeps a zero floor.
pub fn value_bounds(points: &[TrendPoint]) -> Option<(f64, f64)> {
    let lo = points
        .iter()
        .map(|p| p.min.min(p.avg))
        .fold(f64::INFINITY, f64::min);
    let hi = points
        .iter()
        .map(|p| p.max.max(p.avg))
        .fold(f64::NEG_INFINITY, f64::max);
    if !lo.is_finite() || !hi.is_finite() {
        return None;
    }
    let mut pad = (hi - lo) * 0.1;
    if pad == 0.0 {
        pad = (hi.abs() * 0.1).max(1.0);
    }
    let lower = if lo >= 0.0 { (lo - pad).max(0.0) } else { lo - pad };
    Some((lower, hi + pad))
}

/// Renders the min/avg/max trend chart into an in-memory RGB image.
pub fn render_band_chart(
    series: &TrendSeries,
    title: &str,
    units: &str,
    (width, height): (u32, u32),
) -> Result<RgbImage> {
    let points: Vec<TrendPoint> = series
        .sorted()
        .into_iter()
        .filter(|p| p.min.is_finite() && p.avg.is_finite() && p.max.is_finite())
        .collect();
    let (Some((min_ts, max_ts)), Some((y_lo, y_hi))) = (time_bounds(&points), value_bounds(&points))
    else {
        warn!("No trend points to plot for {title}");
        bail!("no trend points to plot");
    };

    let mut buffer = vec![0u8; width as usize * height as usize * 3];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
        root.fill(&WHITE)?;
        let mut chart = ChartBuilder::on(&root)
            .caption(title, ("sans-serif", 18).into_font())
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(60)
            .build_cartesian_2d(min_ts..max_ts, y_lo..y_hi)?;

        chart
            .configure_mesh()
            .x_labels(8)
            .y_labels(6)
            .x_label_formatter(&|dt| dt.format("%d/%m").to_string())
            .y_label_formatter(&|v| format_measure(*v, units))
            .light_line_style(WHITE.mix(0.2))
            .draw()?;

        chart
            .draw_series(std::iter::once(Polygon::new(
                band_outline(&points),
                BAND_BLUE.mix(0.35).filled(),
            )))?
            .label("Min-Max")
            .legend(|(x, y)| Rectangle::new([(x, y - 4), (x + 10, y + 4)], BAND_BLUE.filled()));

        chart
            .draw_series(LineSeries::new(
                points.iter().map(|p| (p.timestamp(), p.avg)),
                AVG_BLUE.stroke_width(2),
            ))?
            .label("Average")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 10, y)], AVG_BLUE));

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()?;

        root.present()?;
    }

    let Some(image) = RgbImage::from_raw(width, height, buffer) else {
        bail!("chart buffer does not match {width}x{height}");
    };
    info!("Rendered trend chart for {title} ({width}x{height})");
    Ok(image)
}
