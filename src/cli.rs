use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};
use log::{debug, info, warn};
use strum::IntoEnumIterator;

use crate::chart::{ChartDownloader, ChartSource};
use crate::config::{load_config, Config};
use crate::pipeline::{
    select_items, spawn_run, Collaborators, ReportStatus, RunEvent, RunOptions, RunSummary,
    SessionContext,
};
use crate::summary::{NarrativeClient, Narrator};
use crate::timeframe::{parse_kind, TimeRangeKind};
use crate::zabbix::{common_item_names, matches_filter, Host, Item, Template, ZabbixClient};

#[derive(Parser)]
#[command(name = "zabbix-extractor", version)]
#[command(about = "Extract Zabbix trend statistics, charts and PDF reports")]
pub struct Cli {
    /// Path to the TOML config (or set ZABBIX_EXTRACTOR_CONFIG)
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List templates on the server
    Templates {
        /// Case-insensitive name filter
        #[arg(long)]
        filter: Option<String>,
    },
    /// List hosts linked to a template
    Hosts {
        /// Template name or id
        #[arg(long)]
        template: String,
        /// Case-insensitive name filter
        #[arg(long)]
        filter: Option<String>,
    },
    /// List graphable items of a template's hosts
    Items {
        /// Template name or id
        #[arg(long)]
        template: String,
        /// Restrict to these hosts (repeatable; default: all hosts)
        #[arg(long = "host")]
        hosts: Vec<String>,
        /// Case-insensitive name filter
        #[arg(long)]
        filter: Option<String>,
        /// Only show item names present on every selected host
        #[arg(long)]
        common: bool,
    },
    /// Download charts and trends for selected items and analyse them
    Run {
        /// Template name or id
        #[arg(long)]
        template: String,
        /// Restrict to these hosts (repeatable; default: all hosts)
        #[arg(long = "host")]
        hosts: Vec<String>,
        /// Item name or key to extract (repeatable)
        #[arg(long = "item", required = true)]
        items: Vec<String>,
        /// Analysis window: last_30_days, previous_month or current_month
        #[arg(long, default_value = "previous_month", value_parser = parse_kind)]
        period: TimeRangeKind,
        /// Also render an aggregated PDF report
        #[arg(long)]
        pdf: bool,
        /// Request a narrative conclusion per item (needs an API key)
        #[arg(long)]
        narrative: bool,
        /// Save full chart images instead of chart + legend
        #[arg(long = "no-crop")]
        no_crop: bool,
        /// Base name of the PDF report
        #[arg(long = "report-name")]
        report_name: Option<String>,
    },
    /// Show the supported analysis windows as they resolve now
    Periods,
}

fn configure_logging(verbose: bool) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    builder.format(|buf, record| writeln!(buf, "{}", record.args()));
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    let _ = builder.try_init();
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    configure_logging(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Periods => print_periods()?,
        Commands::Templates { filter } => {
            let client = connect(&config)?;
            let templates = client.list_templates()?;
            client.disconnect();
            let mut table = themed_table();
            table.set_header(header_cells(&["ID", "Template"]));
            for template in templates
                .iter()
                .filter(|t| matches_filter(&t.name, filter.as_deref()))
            {
                table.add_row(vec![value_cell(&template.id), label_cell(&template.name)]);
            }
            println!("{table}");
        }
        Commands::Hosts { template, filter } => {
            let client = connect(&config)?;
            let template = find_template(&client.list_templates()?, &template)?;
            let hosts = client.list_hosts_for_template(&template.id)?;
            client.disconnect();
            let mut table = themed_table();
            table.set_header(header_cells(&["ID", "Host"]));
            for host in hosts
                .iter()
                .filter(|h| matches_filter(&h.name, filter.as_deref()))
            {
                table.add_row(vec![value_cell(&host.id), label_cell(&host.name)]);
            }
            println!("Hosts of {}\n{table}", template.name);
        }
        Commands::Items {
            template,
            hosts,
            filter,
            common,
        } => {
            let client = connect(&config)?;
            let inventory = load_inventory(&client, &template, &hosts)?;
            client.disconnect();
            println!("{}", items_table(&inventory, filter.as_deref(), common));
        }
        Commands::Run {
            template,
            hosts,
            items,
            period,
            pdf,
            narrative,
            no_crop,
            report_name,
        } => {
            let options = RunOptions {
                period,
                pdf,
                narrative,
                crop: config.output.crop && !no_crop,
                report_name,
            };
            execute_run(config, &template, &hosts, &items, options)?;
        }
    }
    Ok(())
}

fn connect(config: &Config) -> Result<ZabbixClient> {
    let server = &config.server;
    ZabbixClient::connect(
        &server.url,
        &server.user,
        &server.password,
        Duration::from_secs(server.timeout_secs),
    )
    .with_context(|| format!("cannot connect to '{}'", server.url))
}

fn find_template(templates: &[Template], wanted: &str) -> Result<Template> {
    templates
        .iter()
        .find(|t| t.id == wanted || t.name == wanted)
        .or_else(|| {
            templates
                .iter()
                .find(|t| t.name.eq_ignore_ascii_case(wanted))
        })
        .cloned()
        .ok_or_else(|| anyhow!("template '{wanted}' not found"))
}

fn pick_hosts(all: Vec<Host>, wanted: &[String]) -> Result<Vec<Host>> {
    if wanted.is_empty() {
        return Ok(all);
    }
    let mut picked = Vec::new();
    for name in wanted {
        match all.iter().find(|h| h.name == *name || h.id == *name) {
            Some(host) => picked.push(host.clone()),
            None => bail!("host '{name}' is not linked to the template"),
        }
    }
    Ok(picked)
}

fn load_inventory(
    client: &ZabbixClient,
    template: &str,
    hosts: &[String],
) -> Result<Vec<(Host, Vec<Item>)>> {
    let template = find_template(&client.list_templates()?, template)?;
    let hosts = pick_hosts(client.list_hosts_for_template(&template.id)?, hosts)?;
    let mut inventory = Vec::with_capacity(hosts.len());
    for host in hosts {
        let items = client.list_graphable_items(&host.id)?;
        inventory.push((host, items));
    }
    Ok(inventory)
}

fn execute_run(
    config: Config,
    template: &str,
    hosts: &[String],
    items: &[String],
    options: RunOptions,
) -> Result<()> {
    let client = Arc::new(connect(&config)?);
    let inventory = load_inventory(&client, template, hosts)?;
    let selections = select_items(&inventory, items);
    if selections.is_empty() {
        client.disconnect();
        bail!("none of the requested items exist on the selected hosts");
    }
    info!("Queued {} item(s)", selections.len());

    let server = &config.server;
    let downloader = ChartDownloader::connect(
        client.base_url(),
        &server.user,
        &server.password,
        Duration::from_secs(server.chart_timeout_secs),
    )?;
    if !downloader.is_logged_in() {
        warn!("Web login failed; chart downloads will likely return the login page");
    }
    let charts: Arc<dyn ChartSource> = Arc::new(downloader);
    let narrator: Option<Arc<dyn Narrator>> = if options.narrative {
        let narrative = NarrativeClient::new(&config.narrative)?;
        if narrative.is_enabled() {
            Some(Arc::new(narrative))
        } else {
            warn!("No narrative API key configured; conclusions are skipped");
            None
        }
    } else {
        None
    };

    let collaborators = Collaborators {
        trends: client.clone(),
        charts,
        narrator,
    };
    let context = SessionContext {
        selections,
        options,
        config,
    };

    let (handle, events) = spawn_run(context, collaborators);
    for event in events {
        match event {
            RunEvent::ItemStarted {
                index,
                total,
                host_name,
                item_name,
            } => println!("[{index}/{total}] {host_name} / {item_name}"),
            RunEvent::ItemFinished(outcome) => {
                debug!("{} / {}: {}", outcome.host_name, outcome.item_name, outcome.detail());
            }
            RunEvent::Progress(fraction) => debug!("Progress: {:.0}%", fraction * 100.0),
            RunEvent::ReportRendered(path) => println!("Report: {}", path.display()),
            RunEvent::ReportFailed(reason) => eprintln!("Report failed: {reason}"),
            RunEvent::Completed(summary) => print_summary(&summary),
            RunEvent::Aborted(reason) => eprintln!("Run aborted: {reason}"),
        }
    }
    let result = handle
        .join()
        .map_err(|_| anyhow!("worker thread panicked"));
    client.disconnect();
    result??;
    Ok(())
}

fn items_table(inventory: &[(Host, Vec<Item>)], filter: Option<&str>, common: bool) -> Table {
    let mut table = themed_table();
    if common {
        table.set_header(header_cells(&["Common item"]));
        let names = common_item_names(inventory.iter().map(|(_, items)| items.as_slice()));
        for name in names.iter().filter(|n| matches_filter(n, filter)) {
            table.add_row(vec![label_cell(name)]);
        }
        return table;
    }
    table.set_header(header_cells(&["Host", "ID", "Item", "Key", "Units"]));
    for (host, items) in inventory {
        for item in items.iter().filter(|i| matches_filter(&i.name, filter)) {
            table.add_row(vec![
                label_cell(&host.name),
                value_cell(&item.id),
                Cell::new(&item.name),
                Cell::new(&item.key),
                Cell::new(&item.units),
            ]);
        }
    }
    table
}

fn print_periods() -> Result<()> {
    let now = Local::now();
    let mut table = themed_table();
    table.set_header(header_cells(&["Period", "Label", "Start", "End"]));
    for kind in TimeRangeKind::iter() {
        let range = kind.resolve(now)?;
        table.add_row(vec![
            label_cell(&kind.to_string()),
            Cell::new(kind.label()),
            value_cell(range.start.format("%Y-%m-%d %H:%M:%S")),
            value_cell(range.end.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let mut overview = themed_table();
    overview.set_header(header_cells(&["Field", "Value"]));
    overview.add_row(vec![label_cell("Period"), value_cell(summary.range.describe())]);
    overview.add_row(vec![
        label_cell("Items complete"),
        value_cell(format!("{}/{}", summary.succeeded, summary.total)),
    ]);
    overview.add_row(vec![
        label_cell("Output folder"),
        value_cell(summary.output_dir.display()),
    ]);
    let report = match &summary.report {
        ReportStatus::NotRequested => "not requested".to_string(),
        ReportStatus::Rendered(path) => path.display().to_string(),
        ReportStatus::NothingToRender => "nothing to render".to_string(),
        ReportStatus::Failed(reason) => format!("failed: {reason}"),
    };
    overview.add_row(vec![label_cell("PDF report"), value_cell(report)]);
    println!("\nSummary\n{overview}");

    let mut items = themed_table();
    items.set_header(header_cells(&["Host", "Item", "Status", "Detail"]));
    for status in &summary.items {
        items.add_row(vec![
            label_cell(&status.host_name),
            Cell::new(&status.item_name),
            status_cell(status.complete),
            Cell::new(&status.detail),
        ]);
    }
    println!("\nItems\n{items}");
}

fn themed_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn header_cells(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .map(|label| {
            Cell::new(*label)
                .add_attribute(Attribute::Bold)
                .fg(Color::Cyan)
        })
        .collect()
}

fn label_cell(text: &str) -> Cell {
    Cell::new(text).add_attribute(Attribute::Bold)
}

fn value_cell<T: std::fmt::Display>(value: T) -> Cell {
    Cell::new(value.to_string()).set_alignment(CellAlignment::Right)
}

fn status_cell(complete: bool) -> Cell {
    if complete {
        Cell::new("ok").fg(Color::Green)
    } else {
        Cell::new("incomplete").fg(Color::Red)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            value_type: "3".to_string(),
            units: "B".to_string(),
        }
    }

    #[test]
    fn template_lookup_by_id_or_name() {
        let templates = vec![
            Template {
                id: "10001".to_string(),
                name: "Linux by Zabbix agent".to_string(),
            },
            Template {
                id: "10002".to_string(),
                name: "PostgreSQL".to_string(),
            },
        ];
        assert_eq!(find_template(&templates, "10002").unwrap().name, "PostgreSQL");
        assert_eq!(find_template(&templates, "postgresql").unwrap().id, "10002");
        assert!(find_template(&templates, "Windows").is_err());
    }

    #[test]
    fn host_selection_keeps_requested_order() {
        let all = vec![host("1", "app-01"), host("2", "db-01")];
        let picked = pick_hosts(all.clone(), &["db-01".to_string(), "1".to_string()]).unwrap();
        assert_eq!(picked, vec![host("2", "db-01"), host("1", "app-01")]);
        assert_eq!(pick_hosts(all.clone(), &[]).unwrap(), all);
        assert!(pick_hosts(all, &["web-09".to_string()]).is_err());
    }

    #[test]
    fn items_table_lists_common_names() {
        let inventory = vec![
            (host("1", "app-01"), vec![item("1", "CPU"), item("2", "Memory")]),
            (host("2", "db-01"), vec![item("3", "CPU")]),
        ];
        let common = items_table(&inventory, None, true).to_string();
        assert!(common.contains("CPU"));
        assert!(!common.contains("Memory"));

        let all = items_table(&inventory, Some("mem"), false).to_string();
        assert!(all.contains("key.2"));
        assert!(!all.contains("key.3"));
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::parse_from([
            "zabbix-extractor",
            "run",
            "--template",
            "PostgreSQL",
            "--item",
            "CPU",
            "--item",
            "Memory",
            "--period",
            "current_month",
            "--pdf",
            "--no-crop",
        ]);
        match cli.command {
            Commands::Run {
                items,
                period,
                pdf,
                no_crop,
                narrative,
                ..
            } => {
                assert_eq!(items, vec!["CPU", "Memory"]);
                assert_eq!(period, TimeRangeKind::CurrentMonth);
                assert!(pdf && no_crop && !narrative);
            }
            _ => panic!("expected run"),
        }
        assert!(Cli::try_parse_from(["zabbix-extractor", "run", "--template", "T", "--item", "CPU", "--period", "yesterday"]).is_err());
    }
}
