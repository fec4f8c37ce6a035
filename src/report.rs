use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local};
use image::RgbImage;
use log::{error, info, warn};
use serde::Deserialize;

use crate::config::Config;
use crate::export::timestamped_file_name;
use crate::graph::render_band_chart;
use crate::stats::StatisticsSummary;
use crate::trend::TrendSeries;
use crate::units::{format_measure, month_name};

pub const DEFAULT_REPORT_NAME: &str = "executive_report";
pub const NO_OBSERVATIONS: &str = "No observations";
pub const DEFAULT_INCIDENTS: &str = "No service incidents were reported.";
pub const DEFAULT_RISKS: &str = "No service risks were recorded during the period.";
pub const DEFAULT_ALERTS: &str = "No alerts affecting operational continuity were observed.";

/// Pixel size of the trend charts embedded in the report.
pub const REPORT_CHART_SIZE: (u32, u32) = (900, 300);

const OPERATIVE_INTRO: &str = "The main operational topics of the service are presented below, \
including relevant incidents, risks and alerts for the period.";

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default
    } else {
        trimmed
    }
}

/// Operator-supplied operative text for one host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostReportConfig {
    pub incidents: String,
    pub risks: String,
    pub alerts: String,
}

impl HostReportConfig {
    pub fn incidents(&self) -> &str {
        or_default(&self.incidents, DEFAULT_INCIDENTS)
    }

    pub fn risks(&self) -> &str {
        or_default(&self.risks, DEFAULT_RISKS)
    }

    pub fn alerts(&self) -> &str {
        or_default(&self.alerts, DEFAULT_ALERTS)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DimensionsConfig {
    pub performance: String,
    pub contingency: String,
    pub support: String,
    pub updates: String,
    pub backups: String,
}

impl DimensionsConfig {
    pub fn performance(&self) -> &str {
        or_default(&self.performance, NO_OBSERVATIONS)
    }

    pub fn contingency(&self) -> &str {
        or_default(&self.contingency, NO_OBSERVATIONS)
    }

    pub fn support(&self) -> &str {
        or_default(&self.support, NO_OBSERVATIONS)
    }

    pub fn updates(&self) -> &str {
        or_default(&self.updates, NO_OBSERVATIONS)
    }

    pub fn backups(&self) -> &str {
        or_default(&self.backups, NO_OBSERVATIONS)
    }

    pub fn rows(&self) -> [(&'static str, &str); 5] {
        [
            ("Performance", self.performance()),
            ("Contingency", self.contingency()),
            ("Support", self.support()),
            ("Updates", self.updates()),
            ("Backups", self.backups()),
        ]
    }
}

/// Cross-host report settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GlobalReportConfig {
    pub name: String,
    #[serde(alias = "uptime_fecha")]
    pub uptime_last_boot: String,
    #[serde(alias = "uptime_servidor")]
    pub uptime_server: String,
    #[serde(alias = "uptime_bd")]
    pub uptime_database: String,
    pub dimensions: DimensionsConfig,
}

impl Default for GlobalReportConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_REPORT_NAME.to_string(),
            uptime_last_boot: String::new(),
            uptime_server: String::new(),
            uptime_database: String::new(),
            dimensions: DimensionsConfig::default(),
        }
    }
}

impl GlobalReportConfig {
    pub fn report_name(&self) -> &str {
        or_default(&self.name, DEFAULT_REPORT_NAME)
    }

    /// Only the uptime fields that were filled in.
    pub fn uptime_rows(&self) -> Vec<(&'static str, &str)> {
        [
            ("Last start date", self.uptime_last_boot.trim()),
            ("Server uptime", self.uptime_server.trim()),
            ("Database uptime", self.uptime_database.trim()),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .collect()
    }
}

/// One item's contribution to the report.
#[derive(Debug, Clone)]
pub struct ReportItemEntry {
    pub host_name: String,
    pub item_name: String,
    pub units: String,
    pub series: TrendSeries,
    pub statistics: Option<StatisticsSummary>,
    pub narrative: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub header: Option<Vec<String>>,
    pub rows: Vec<Vec<String>>,
    /// Column shares of the content width; they sum to 1.
    pub widths: Vec<f32>,
}

impl Table {
    fn key_value<'a, I>(rows: I, widths: Vec<f32>) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Table {
            header: None,
            rows: rows
                .into_iter()
                .map(|(k, v)| vec![k.to_string(), v.to_string()])
                .collect(),
            widths,
        }
    }
}

/// Layout-independent report content, consumed by the PDF writer.
#[derive(Debug, Clone)]
pub enum Block {
    HostHeader(String),
    Divider,
    Heading(String),
    Paragraph { label: Option<String>, text: String },
    Table(Table),
    ItemTitle(String),
    Chart(RgbImage),
    Cards(Vec<(String, String)>),
    Spacer(f32),
    PageBreak,
}

#[derive(Debug, Clone)]
pub struct ReportDocument {
    pub title: String,
    pub blocks: Vec<Block>,
}

impl ReportDocument {
    pub fn page_breaks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b, Block::PageBreak))
            .count()
    }

    pub fn host_headers(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::HostHeader(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The first table following the heading `title`, if any.
    pub fn table_after(&self, title: &str) -> Option<&Table> {
        let start = self
            .blocks
            .iter()
            .position(|b| matches!(b, Block::Heading(h) if h == title))?;
        self.blocks[start..].iter().find_map(|b| match b {
            Block::Table(table) => Some(table),
            _ => None,
        })
    }

    pub fn has_heading(&self, title: &str) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, Block::Heading(h) if h == title))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("cannot write report {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("PDF rendering failed: {0}")]
    Pdf(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorState {
    Empty,
    Accumulating,
    Rendered(PathBuf),
    RenderFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutcome {
    Rendered(PathBuf),
    NothingToRender,
}

pub const SEVERITY_HEADING: &str = "Severity glossary";
pub const DIMENSIONS_HEADING: &str = "Dimension summary";
pub const UPTIME_HEADING: &str = "Uptime information";
pub const ITEMS_HEADING: &str = "Monitoring items";

/// Collects per-item results and renders them as one PDF per run.
#[derive(Debug)]
pub struct ReportAggregator {
    output_dir: PathBuf,
    entries: Vec<ReportItemEntry>,
    state: AggregatorState,
}

impl ReportAggregator {
    pub fn new(output_dir: &Path) -> Self {
        ReportAggregator {
            output_dir: output_dir.to_path_buf(),
            entries: Vec::new(),
            state: AggregatorState::Empty,
        }
    }

    pub fn state(&self) -> &AggregatorState {
        &self.state
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, entry: ReportItemEntry) {
        info!(
            "Added {} / {} to report",
            entry.host_name, entry.item_name
        );
        self.entries.push(entry);
        self.state = AggregatorState::Accumulating;
    }

    /// Entries grouped by host, hosts in first-seen order.
    pub fn grouped(&self) -> Vec<(&str, Vec<&ReportItemEntry>)> {
        let mut groups: Vec<(&str, Vec<&ReportItemEntry>)> = Vec::new();
        for entry in &self.entries {
            match groups.iter_mut().find(|(host, _)| *host == entry.host_name) {
                Some((_, items)) => items.push(entry),
                None => groups.push((entry.host_name.as_str(), vec![entry])),
            }
        }
        groups
    }

    pub fn assemble(&self, config: &Config, now: &DateTime<Local>) -> ReportDocument {
        let report = &config.report;
        let mut blocks = Vec::new();

        for (index, (host_name, items)) in self.grouped().into_iter().enumerate() {
            if index > 0 {
                blocks.push(Block::PageBreak);
            }
            let host = config.host(host_name);

            blocks.push(Block::HostHeader(host_name.to_string()));
            blocks.push(Block::Divider);
            blocks.push(Block::Paragraph {
                label: None,
                text: format!(
                    "Report generated: {} {} {}",
                    now.day(),
                    month_name(now.month()),
                    now.year()
                ),
            });
            blocks.push(Block::Spacer(4.0));

            blocks.push(Block::Paragraph {
                label: None,
                text: OPERATIVE_INTRO.to_string(),
            });
            for (label, text) in [
                ("Service incidents:", host.incidents()),
                ("Service risks:", host.risks()),
                ("Alert incidents:", host.alerts()),
            ] {
                blocks.push(Block::Paragraph {
                    label: Some(label.to_string()),
                    text: text.to_string(),
                });
            }
            blocks.push(Block::Spacer(5.0));

            blocks.push(Block::Heading(SEVERITY_HEADING.to_string()));
            blocks.push(Block::Table(severity_table()));
            blocks.push(Block::Spacer(5.0));

            blocks.push(Block::Heading(DIMENSIONS_HEADING.to_string()));
            let mut dimensions = Table::key_value(report.dimensions.rows(), vec![0.25, 0.75]);
            dimensions.header = Some(vec!["Dimension".to_string(), "Assessment".to_string()]);
            blocks.push(Block::Table(dimensions));
            blocks.push(Block::Spacer(5.0));

            let uptime = report.uptime_rows();
            if !uptime.is_empty() {
                blocks.push(Block::Heading(UPTIME_HEADING.to_string()));
                blocks.push(Block::Table(Table::key_value(uptime, vec![0.35, 0.65])));
                blocks.push(Block::Spacer(5.0));
            }

            blocks.push(Block::Heading(ITEMS_HEADING.to_string()));
            for entry in items {
                item_blocks(entry, &mut blocks);
            }
        }

        ReportDocument {
            title: report.report_name().to_string(),
            blocks,
        }
    }

    pub fn render(&mut self, report_name: &str, config: &Config) -> Result<RenderOutcome, ReportError> {
        self.render_at(report_name, config, &Local::now())
    }

    /// Writes `<name>_<timestamp>.pdf` and clears the accumulated entries.
    pub fn render_at(
        &mut self,
        report_name: &str,
        config: &Config,
        now: &DateTime<Local>,
    ) -> Result<RenderOutcome, ReportError> {
        if self.entries.is_empty() {
            warn!("No items data to generate report");
            return Ok(RenderOutcome::NothingToRender);
        }
        let name = or_default(report_name, config.report.report_name());
        let path = self.output_dir.join(timestamped_file_name(name, "pdf", now));
        let document = self.assemble(config, now);

        match crate::pdf::write_pdf(&document, &path) {
            Ok(()) => {
                info!("PDF report generated: {}", path.display());
                self.entries.clear();
                self.state = AggregatorState::Rendered(path.clone());
                Ok(RenderOutcome::Rendered(path))
            }
            Err(e) => {
                error!("Failed to generate PDF: {e}");
                self.state = AggregatorState::RenderFailed;
                Err(e)
            }
        }
    }
}

fn severity_table() -> Table {
    let row = |cells: [&str; 3]| cells.iter().map(|c| c.to_string()).collect::<Vec<_>>();
    Table {
        header: Some(row(["Symbol", "Level", "Description"])),
        rows: vec![
            row(["G", "Grave", "Requires immediate attention"]),
            row(["M", "Medium", "Requires follow-up"]),
            row(["L", "Low", "Informational"]),
        ],
        widths: vec![0.15, 0.2, 0.65],
    }
}

fn item_blocks(entry: &ReportItemEntry, blocks: &mut Vec<Block>) {
    blocks.push(Block::ItemTitle(entry.item_name.to_uppercase()));

    if !entry.series.is_empty() {
        match render_band_chart(&entry.series, &entry.item_name, &entry.units, REPORT_CHART_SIZE) {
            Ok(image) => blocks.push(Block::Chart(image)),
            Err(e) => error!(
                "Failed to create chart for {} / {}: {e}",
                entry.host_name, entry.item_name
            ),
        }
    }

    if let Some(stats) = &entry.statistics {
        let card = |label: &str, value: f64| (label.to_string(), format_measure(value, &entry.units));
        blocks.push(Block::Cards(vec![
            card("AVERAGE", stats.avg),
            card("MINIMUM", stats.min),
            card("MAXIMUM", stats.max),
            card("P95", stats.p95),
        ]));
    }

    if let Some(narrative) = entry.narrative.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        blocks.push(Block::Paragraph {
            label: Some("Analysis:".to_string()),
            text: narrative.replace('\n', " "),
        });
    }
    blocks.push(Block::Spacer(8.0));
}
