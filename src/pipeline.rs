//! Download-analyse-report run for a batch of selected items.
//!
//! A run executes on one worker thread and reports back over an mpsc
//! channel. Items are processed one after another in selection order;
//! failures of one item never stop the others.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Local};
use log::{error, info, warn};

use crate::chart::{save_chart, ChartError, ChartFiles, ChartSource};
use crate::config::Config;
use crate::export::{create_run_folder, item_stem, write_trend_csv};
use crate::report::{RenderOutcome, ReportAggregator, ReportItemEntry};
use crate::stats::{compute, StatisticsSummary};
use crate::summary::{assemble, write_sidecar, NarrativeUnavailable, Narrator};
use crate::timeframe::{TimeRange, TimeRangeKind, TimeframeError};
use crate::trend::TrendSeries;
use crate::zabbix::{ApiError, Host, Item, TrendSource};

/// One (host, item) pair queued for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedItem {
    pub host: Host,
    pub item: Item,
}

/// Queues every item named in `item_names` (by name or key) on every host,
/// keeping request order and skipping duplicates.
pub fn select_items(inventory: &[(Host, Vec<Item>)], item_names: &[String]) -> Vec<SelectedItem> {
    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    for name in item_names {
        for (host, items) in inventory {
            let Some(item) = items.iter().find(|i| i.name == *name || i.key == *name) else {
                warn!("Item '{name}' not found on host {}", host.name);
                continue;
            };
            if seen.insert((host.id.clone(), item.id.clone())) {
                selected.push(SelectedItem {
                    host: host.clone(),
                    item: item.clone(),
                });
            }
        }
    }
    selected
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub period: TimeRangeKind,
    pub pdf: bool,
    pub narrative: bool,
    pub crop: bool,
    pub report_name: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            period: TimeRangeKind::PreviousMonth,
            pdf: false,
            narrative: false,
            crop: true,
            report_name: None,
        }
    }
}

/// Everything the caller hands to a run. Not mutated by the worker.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub selections: Vec<SelectedItem>,
    pub options: RunOptions,
    pub config: Config,
}

/// Network collaborators of a run.
#[derive(Clone)]
pub struct Collaborators {
    pub trends: Arc<dyn TrendSource>,
    pub charts: Arc<dyn ChartSource>,
    pub narrator: Option<Arc<dyn Narrator>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error("no trend data available for the period")]
    NoData,
    #[error("trend fetch failed: {0}")]
    TrendFetch(#[from] ApiError),
    #[error("chart unavailable: {0}")]
    Chart(#[from] ChartError),
    #[error("cannot write trend CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Statistics side of one item.
#[derive(Debug)]
pub struct Analysis {
    pub statistics: StatisticsSummary,
    pub csv: PathBuf,
    pub narrative: Result<String, NarrativeUnavailable>,
    pub sidecar: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ItemOutcome {
    pub host_name: String,
    pub item_name: String,
    pub chart: Result<ChartFiles, ItemError>,
    pub analysis: Result<Analysis, ItemError>,
}

impl ItemOutcome {
    /// Chart and statistics succeeded, and the narrative either arrived or
    /// was never requested.
    pub fn is_complete(&self) -> bool {
        let narrative_ok = match &self.analysis {
            Ok(analysis) => matches!(
                analysis.narrative,
                Ok(_) | Err(NarrativeUnavailable::Disabled)
            ),
            Err(_) => false,
        };
        self.chart.is_ok() && narrative_ok
    }

    pub fn detail(&self) -> String {
        let mut problems = Vec::new();
        if let Err(e) = &self.chart {
            problems.push(e.to_string());
        }
        match &self.analysis {
            Err(e) => problems.push(e.to_string()),
            Ok(analysis) => match &analysis.narrative {
                Ok(_) | Err(NarrativeUnavailable::Disabled) => {}
                Err(e) => problems.push(e.to_string()),
            },
        }
        if problems.is_empty() {
            "ok".to_string()
        } else {
            problems.join("; ")
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemStatus {
    pub host_name: String,
    pub item_name: String,
    pub complete: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportStatus {
    NotRequested,
    Rendered(PathBuf),
    NothingToRender,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub total: usize,
    pub output_dir: PathBuf,
    pub range: TimeRange,
    pub report: ReportStatus,
    pub items: Vec<ItemStatus>,
}

#[derive(Debug)]
pub enum RunEvent {
    ItemStarted {
        index: usize,
        total: usize,
        host_name: String,
        item_name: String,
    },
    ItemFinished(ItemOutcome),
    Progress(f64),
    ReportRendered(PathBuf),
    ReportFailed(String),
    Completed(RunSummary),
    Aborted(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Timeframe(#[from] TimeframeError),
    #[error("cannot create output folder under {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn emit(events: &Sender<RunEvent>, event: RunEvent) {
    // The caller may stop listening; the run still completes.
    let _ = events.send(event);
}

/// Starts the run on a worker thread.
pub fn spawn_run(
    context: SessionContext,
    collaborators: Collaborators,
) -> (JoinHandle<Result<RunSummary, RunError>>, Receiver<RunEvent>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let result = run_pipeline(&context, &collaborators, Local::now(), &tx);
        if let Err(e) = &result {
            error!("Run aborted: {e}");
            emit(&tx, RunEvent::Aborted(e.to_string()));
        }
        result
    });
    (handle, rx)
}

pub fn run_pipeline(
    context: &SessionContext,
    collaborators: &Collaborators,
    now: DateTime<Local>,
    events: &Sender<RunEvent>,
) -> Result<RunSummary, RunError> {
    let options = &context.options;
    let config = &context.config;
    let range = options.period.resolve(now)?;
    info!("Analysis period: {}", range.describe());

    let base_dir = &config.output.base_dir;
    let folder = create_run_folder(base_dir, &now).map_err(|source| RunError::OutputDir {
        path: base_dir.clone(),
        source,
    })?;

    let mut aggregator = ReportAggregator::new(&folder);
    let total = context.selections.len();
    let mut items = Vec::with_capacity(total);

    for (index, selected) in context.selections.iter().enumerate() {
        emit(
            events,
            RunEvent::ItemStarted {
                index: index + 1,
                total,
                host_name: selected.host.name.clone(),
                item_name: selected.item.name.clone(),
            },
        );
        info!(
            "Processing {}/{}: {} on {}",
            index + 1,
            total,
            selected.item.name,
            selected.host.name
        );

        let chart = fetch_chart(selected, &range, collaborators, config, options.crop, &folder);
        let fetched = collaborators
            .trends
            .get_trend_points(&selected.item.id, range.start_ts(), range.end_ts());
        let analysis = match fetched {
            Ok(series) => {
                let analysis = analyse(selected, &series, &range, collaborators, options, &folder, &now);
                if let (true, Ok(done)) = (options.pdf, &analysis) {
                    aggregator.add(report_entry(selected, series, done));
                }
                analysis
            }
            Err(e) => {
                error!(
                    "Trend fetch failed for {} / {}: {e}",
                    selected.host.name, selected.item.name
                );
                Err(ItemError::TrendFetch(e))
            }
        };

        let outcome = ItemOutcome {
            host_name: selected.host.name.clone(),
            item_name: selected.item.name.clone(),
            chart,
            analysis,
        };
        items.push(ItemStatus {
            host_name: outcome.host_name.clone(),
            item_name: outcome.item_name.clone(),
            complete: outcome.is_complete(),
            detail: outcome.detail(),
        });
        emit(events, RunEvent::ItemFinished(outcome));
        emit(events, RunEvent::Progress((index + 1) as f64 / total as f64));
    }

    let report = if options.pdf {
        let name = options
            .report_name
            .as_deref()
            .unwrap_or_else(|| config.report.report_name());
        match aggregator.render_at(name, config, &now) {
            Ok(RenderOutcome::Rendered(path)) => {
                emit(events, RunEvent::ReportRendered(path.clone()));
                ReportStatus::Rendered(path)
            }
            Ok(RenderOutcome::NothingToRender) => ReportStatus::NothingToRender,
            Err(e) => {
                emit(events, RunEvent::ReportFailed(e.to_string()));
                ReportStatus::Failed(e.to_string())
            }
        }
    } else {
        ReportStatus::NotRequested
    };

    let summary = RunSummary {
        succeeded: items.iter().filter(|status| status.complete).count(),
        total,
        output_dir: folder,
        range,
        report,
        items,
    };
    info!(
        "Run finished: {}/{} items complete",
        summary.succeeded, summary.total
    );
    emit(events, RunEvent::Completed(summary.clone()));
    Ok(summary)
}

fn fetch_chart(
    selected: &SelectedItem,
    range: &TimeRange,
    collaborators: &Collaborators,
    config: &Config,
    crop: bool,
    folder: &Path,
) -> Result<ChartFiles, ItemError> {
    let result = collaborators
        .charts
        .fetch_chart_bitmap(
            &selected.item.id,
            range.start_ts(),
            range.end_ts(),
            config.output.chart_width,
            config.output.chart_height,
        )
        .and_then(|bytes| {
            save_chart(
                &bytes,
                folder,
                &item_stem(&selected.host.name, &selected.item.name),
                crop,
            )
        });
    result.map_err(|e| {
        error!(
            "Chart download failed for {} / {}: {e}",
            selected.host.name, selected.item.name
        );
        ItemError::Chart(e)
    })
}

fn analyse(
    selected: &SelectedItem,
    series: &TrendSeries,
    range: &TimeRange,
    collaborators: &Collaborators,
    options: &RunOptions,
    folder: &Path,
    now: &DateTime<Local>,
) -> Result<Analysis, ItemError> {
    let host = &selected.host.name;
    let item = &selected.item.name;
    if series.is_empty() {
        warn!("No trend data for {host} / {item}");
        return Err(ItemError::NoData);
    }
    info!("Retrieved {} trend points for {host} / {item}", series.len());

    let csv = write_trend_csv(series, folder, host, item)?;
    let statistics = compute(series).ok_or_else(|| {
        warn!("Trend data for {host} / {item} has no finite values");
        ItemError::NoData
    })?;

    let payload = assemble(item, host, &statistics, range.kind.label(), &selected.item.units);
    let narrative = match (&collaborators.narrator, options.narrative) {
        (Some(narrator), true) => narrator.narrate(&payload),
        _ => Err(NarrativeUnavailable::Disabled),
    };
    let sidecar = match &narrative {
        Ok(text) => match write_sidecar(folder, &payload, text, now) {
            Ok(path) => Some(path),
            Err(e) => {
                error!("Cannot write conclusion for {host} / {item}: {e}");
                None
            }
        },
        Err(NarrativeUnavailable::Disabled) => None,
        Err(e) => {
            warn!("No conclusion for {host} / {item}: {e}");
            None
        }
    };

    Ok(Analysis {
        statistics,
        csv,
        narrative,
        sidecar,
    })
}

fn report_entry(selected: &SelectedItem, series: TrendSeries, analysis: &Analysis) -> ReportItemEntry {
    ReportItemEntry {
        host_name: selected.host.name.clone(),
        item_name: selected.item.name.clone(),
        units: selected.item.units.clone(),
        series,
        statistics: Some(analysis.statistics.clone()),
        narrative: analysis.narrative.as_ref().ok().cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::png_fixture;
    use crate::trend::TrendPoint;
    use chrono::TimeZone;
    use std::collections::HashMap;

    struct FakeTrends(HashMap<String, Vec<TrendPoint>>);

    impl TrendSource for FakeTrends {
        fn get_trend_points(&self, item_id: &str, _: i64, _: i64) -> Result<TrendSeries, ApiError> {
            if item_id == "broken" {
                return Err(ApiError::Connectivity("timed out".to_string()));
            }
            Ok(TrendSeries::new(self.0.get(item_id).cloned().unwrap_or_default()))
        }
    }

    struct FakeCharts;

    impl ChartSource for FakeCharts {
        fn fetch_chart_bitmap(&self, item_id: &str, _: i64, _: i64, _: u32, _: u32) -> Result<Vec<u8>, ChartError> {
            if item_id == "no-chart" {
                return Err(ChartError::SessionExpired);
            }
            Ok(png_fixture(90, 40))
        }
    }

    struct FakeNarrator;

    impl Narrator for FakeNarrator {
        fn narrate(&self, payload: &crate::summary::SummaryPayload) -> Result<String, NarrativeUnavailable> {
            Ok(format!("Reviewing {}, load is steady.", payload.item_name))
        }
    }

    struct FailingNarrator;

    impl Narrator for FailingNarrator {
        fn narrate(&self, _: &crate::summary::SummaryPayload) -> Result<String, NarrativeUnavailable> {
            Err(NarrativeUnavailable::Status(500))
        }
    }

    fn host(id: &str, name: &str) -> Host {
        Host {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    fn item(id: &str, name: &str) -> Item {
        Item {
            id: id.to_string(),
            name: name.to_string(),
            key: format!("key.{id}"),
            value_type: "0".to_string(),
            units: "%".to_string(),
        }
    }

    fn points() -> Vec<TrendPoint> {
        // February 2025, hourly
        let base = 1_738_368_000;
        (0..48)
            .map(|h| TrendPoint::new(base + h * 3600, 1.0, 10.0 + (h % 24) as f64, 40.0, 60))
            .collect()
    }

    fn collaborators(narrator: Option<Arc<dyn Narrator>>) -> Collaborators {
        let mut data = HashMap::new();
        for id in ["1", "2", "3", "no-chart"] {
            data.insert(id.to_string(), points());
        }
        Collaborators {
            trends: Arc::new(FakeTrends(data)),
            charts: Arc::new(FakeCharts),
            narrator,
        }
    }

    fn context(base: &Path, selections: Vec<SelectedItem>, options: RunOptions) -> SessionContext {
        let mut config = Config::default();
        config.output.base_dir = base.to_path_buf();
        SessionContext {
            selections,
            options,
            config,
        }
    }

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap()
    }

    fn run(context: &SessionContext, collaborators: &Collaborators) -> (RunSummary, Vec<RunEvent>) {
        let (tx, rx) = mpsc::channel();
        let summary = run_pipeline(context, collaborators, now(), &tx).unwrap();
        drop(tx);
        (summary, rx.iter().collect())
    }

    #[test]
    fn selection_dedupes_and_keeps_order() {
        let inventory = vec![
            (host("10", "web-01"), vec![item("1", "CPU"), item("2", "Memory")]),
            (host("11", "db-01"), vec![item("3", "CPU")]),
        ];
        let names = vec!["CPU".to_string(), "key.2".to_string(), "CPU".to_string(), "Disk".to_string()];
        let selected = select_items(&inventory, &names);
        let pairs: Vec<(&str, &str)> = selected
            .iter()
            .map(|s| (s.host.name.as_str(), s.item.id.as_str()))
            .collect();
        assert_eq!(pairs, vec![("web-01", "1"), ("db-01", "3"), ("web-01", "2")]);
    }

    #[test]
    fn no_api_key_still_produces_csv_and_charts() {
        let tmp = tempfile::tempdir().unwrap();
        let options = RunOptions {
            narrative: true,
            ..RunOptions::default()
        };
        let ctx = context(tmp.path(), vec![SelectedItem { host: host("10", "web-01"), item: item("1", "CPU") }], options);
        let (summary, events) = run(&ctx, &collaborators(None));

        assert_eq!((summary.succeeded, summary.total), (1, 1));
        assert_eq!(summary.report, ReportStatus::NotRequested);
        assert_eq!(summary.output_dir, tmp.path().join("downloads").join("20250310_080000"));
        assert!(summary.output_dir.join("web-01_CPU_trends.csv").exists());
        assert!(summary.output_dir.join("web-01_CPU_chart.png").exists());
        assert!(summary.output_dir.join("web-01_CPU_legend.png").exists());
        assert!(!summary.output_dir.join("web-01_CPU_conclusion.txt").exists());

        let outcome = events
            .iter()
            .find_map(|e| match e {
                RunEvent::ItemFinished(outcome) => Some(outcome),
                _ => None,
            })
            .unwrap();
        let analysis = outcome.analysis.as_ref().unwrap();
        assert_eq!(analysis.narrative, Err(NarrativeUnavailable::Disabled));
        assert!(analysis.sidecar.is_none());
        assert!(matches!(events.last(), Some(RunEvent::Completed(_))));
    }

    #[test]
    fn failures_stay_with_their_item() {
        let tmp = tempfile::tempdir().unwrap();
        let selections = vec![
            SelectedItem { host: host("10", "web-01"), item: item("broken", "CPU") },
            SelectedItem { host: host("10", "web-01"), item: item("empty", "Swap") },
            SelectedItem { host: host("10", "web-01"), item: item("no-chart", "Disk") },
            SelectedItem { host: host("10", "web-01"), item: item("1", "Memory") },
        ];
        let ctx = context(tmp.path(), selections, RunOptions { crop: false, ..RunOptions::default() });
        let (summary, events) = run(&ctx, &collaborators(None));

        assert_eq!((summary.succeeded, summary.total), (1, 4));
        let outcomes: Vec<&ItemOutcome> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::ItemFinished(o) => Some(o),
                _ => None,
            })
            .collect();
        assert!(matches!(outcomes[0].analysis, Err(ItemError::TrendFetch(_))));
        assert!(matches!(outcomes[1].analysis, Err(ItemError::NoData)));
        assert!(outcomes[1].chart.is_ok());
        assert!(matches!(outcomes[2].chart, Err(ItemError::Chart(ChartError::SessionExpired))));
        assert!(outcomes[2].analysis.is_ok());
        assert!(outcomes[3].is_complete());
        assert!(summary.output_dir.join("web-01_Memory_full.png").exists());
        assert_eq!(summary.items[2].detail, "chart unavailable: web session expired (received the login page)");

        let progress: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn narrative_and_report_across_hosts() {
        let tmp = tempfile::tempdir().unwrap();
        let selections = vec![
            SelectedItem { host: host("10", "web-01"), item: item("1", "CPU") },
            SelectedItem { host: host("11", "db-01"), item: item("2", "CPU") },
        ];
        let options = RunOptions {
            pdf: true,
            narrative: true,
            report_name: Some("monthly".to_string()),
            ..RunOptions::default()
        };
        let ctx = context(tmp.path(), selections, options);
        let (summary, events) = run(&ctx, &collaborators(Some(Arc::new(FakeNarrator))));

        assert_eq!(summary.succeeded, 2);
        let conclusion = summary.output_dir.join("db-01_CPU_conclusion.txt");
        let text = std::fs::read_to_string(conclusion).unwrap();
        assert!(text.contains("Reviewing CPU, load is steady."));

        let expected = summary.output_dir.join("monthly_20250310_080000.pdf");
        assert_eq!(summary.report, ReportStatus::Rendered(expected.clone()));
        assert!(expected.exists());
        assert!(events
            .iter()
            .any(|e| matches!(e, RunEvent::ReportRendered(p) if *p == expected)));
    }

    fn finished(events: &[RunEvent]) -> Vec<&ItemOutcome> {
        events
            .iter()
            .filter_map(|e| match e {
                RunEvent::ItemFinished(o) => Some(o),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn report_skipped_when_no_item_has_data() {
        let tmp = tempfile::tempdir().unwrap();
        let selections = vec![
            SelectedItem { host: host("10", "web-01"), item: item("empty", "Swap") },
            SelectedItem { host: host("11", "db-01"), item: item("also-empty", "Swap") },
        ];
        let options = RunOptions {
            pdf: true,
            ..RunOptions::default()
        };
        let ctx = context(tmp.path(), selections, options);
        let (summary, events) = run(&ctx, &collaborators(None));

        assert_eq!(summary.report, ReportStatus::NothingToRender);
        let pdfs = std::fs::read_dir(&summary.output_dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "pdf"))
            .count();
        assert_eq!(pdfs, 0);
        assert!(!events.iter().any(|e| matches!(e, RunEvent::ReportRendered(_))));
    }

    #[test]
    fn failed_narrative_keeps_statistics_and_report() {
        let tmp = tempfile::tempdir().unwrap();
        let options = RunOptions {
            pdf: true,
            narrative: true,
            ..RunOptions::default()
        };
        let ctx = context(tmp.path(), vec![SelectedItem { host: host("10", "web-01"), item: item("1", "CPU") }], options);
        let (summary, events) = run(&ctx, &collaborators(Some(Arc::new(FailingNarrator))));

        let outcomes = finished(&events);
        let outcome = outcomes[0];
        assert!(!outcome.is_complete());
        let analysis = outcome.analysis.as_ref().unwrap();
        assert_eq!(analysis.narrative, Err(NarrativeUnavailable::Status(500)));
        assert_eq!(analysis.statistics.count, 48);
        assert!(analysis.sidecar.is_none());
        assert!(analysis.csv.exists());
        assert!(!summary.output_dir.join("web-01_CPU_conclusion.txt").exists());

        assert_eq!(summary.succeeded, 0);
        assert!(matches!(summary.report, ReportStatus::Rendered(ref path) if path.exists()));
    }

    #[test]
    fn unwritable_conclusion_keeps_statistics() {
        let tmp = tempfile::tempdir().unwrap();
        let folder = tmp.path().join("downloads").join("20250310_080000");
        // a directory where the conclusion file should go
        std::fs::create_dir_all(folder.join("web-01_CPU_conclusion.txt")).unwrap();
        let options = RunOptions {
            narrative: true,
            ..RunOptions::default()
        };
        let ctx = context(tmp.path(), vec![SelectedItem { host: host("10", "web-01"), item: item("1", "CPU") }], options);
        let (summary, events) = run(&ctx, &collaborators(Some(Arc::new(FakeNarrator))));

        let outcomes = finished(&events);
        let analysis = outcomes[0].analysis.as_ref().unwrap();
        assert_eq!(analysis.statistics.count, 48);
        assert!(analysis.narrative.is_ok());
        assert!(analysis.sidecar.is_none());
        assert_eq!(summary.succeeded, 1);
    }

    #[test]
    fn spawned_run_reports_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), Vec::new(), RunOptions::default());
        let (handle, events) = spawn_run(ctx, collaborators(None));
        let collected: Vec<RunEvent> = events.iter().collect();
        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.total, 0);
        assert!(matches!(collected.last(), Some(RunEvent::Completed(_))));
    }
}
