use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Datelike, Local};
use log::{info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::config::NarrativeConfig;
use crate::export::item_stem;
use crate::stats::StatisticsSummary;
use crate::units::{format_measure, join_days, join_hours, month_name};

const SYSTEM_PROMPT: &str = "You are a database administrator. Answer with descriptive \
conclusions in a single paragraph, without bullet points or recommendations.";

/// Everything the narrative step and the sidecar file need for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryPayload {
    pub item_name: String,
    pub host_name: String,
    pub period_label: String,
    pub units: String,
    pub statistics: StatisticsSummary,
}

pub fn assemble(
    item_name: &str,
    host_name: &str,
    statistics: &StatisticsSummary,
    period_label: &str,
    units: &str,
) -> SummaryPayload {
    SummaryPayload {
        item_name: item_name.to_string(),
        host_name: host_name.to_string(),
        period_label: period_label.to_string(),
        units: units.to_string(),
        statistics: statistics.clone(),
    }
}

impl SummaryPayload {
    fn measure(&self, value: f64) -> String {
        format_measure(value, &self.units)
    }

    pub fn month_name(&self) -> &'static str {
        month_name(self.statistics.period_start.month())
    }

    pub fn prompt(&self) -> String {
        let stats = &self.statistics;
        format!(
            "Act as a database administrator writing a brief, clear executive summary.\n\
             Rules:\n\
             - Do not mention percentiles, deviations or other advanced statistical terms.\n\
             - Use a descriptive tone: 'It is observed that...', 'It is confirmed that...'.\n\n\
             Data:\n\
             - Item: {item}\n\
             - Host: {host}\n\
             - Month: {month}\n\
             - Average: {avg}\n\
             - 95th percentile (P95): {p95}\n\
             - Maximum recorded: {max}\n\
             - Peak hours: {hours}\n\n\
             Required structure: start with \"Reviewing {item}\", describe the findings for normal \
             load and state whether saturation peaks are sustained or frequent. Write a single \
             flowing paragraph.",
            item = self.item_name,
            host = self.host_name,
            month = self.month_name(),
            avg = self.measure(stats.avg),
            p95 = self.measure(stats.p95),
            max = self.measure(stats.max),
            hours = join_hours(&stats.peak_hours),
        )
    }
}

/// Why no narrative is attached to an item. None of these stop the run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NarrativeUnavailable {
    #[error("narrative generation is disabled (no API key)")]
    Disabled,
    #[error("narrative request failed: {0}")]
    Request(String),
    #[error("narrative service answered HTTP {0}")]
    Status(u16),
    #[error("malformed narrative response: {0}")]
    Malformed(String),
}

/// Source of narrative text for a summary.
pub trait Narrator: Send + Sync {
    fn narrate(&self, payload: &SummaryPayload) -> Result<String, NarrativeUnavailable>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

/// Chat-completion client for an OpenAI-compatible endpoint.
pub struct NarrativeClient {
    http: reqwest::blocking::Client,
    api_key: Option<String>,
    config: NarrativeConfig,
}

impl NarrativeClient {
    pub fn new(config: &NarrativeConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);
        Ok(NarrativeClient {
            http,
            api_key,
            config: config.clone(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn request_narrative(
        &self,
        payload: &SummaryPayload,
    ) -> Result<String, NarrativeUnavailable> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(NarrativeUnavailable::Disabled)?;

        let prompt = payload.prompt();
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        info!("Sending request to narrative API...");
        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .map_err(|e| NarrativeUnavailable::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NarrativeUnavailable::Status(status.as_u16()));
        }
        let body: Value = response
            .json()
            .map_err(|e| NarrativeUnavailable::Malformed(e.to_string()))?;
        let conclusion = parse_completion(&body)?;
        info!("Received narrative conclusion");
        Ok(conclusion)
    }
}

impl Narrator for NarrativeClient {
    fn narrate(&self, payload: &SummaryPayload) -> Result<String, NarrativeUnavailable> {
        self.request_narrative(payload)
    }
}

/// Extracts `choices[0].message.content` from a chat-completion body.
pub fn parse_completion(body: &Value) -> Result<String, NarrativeUnavailable> {
    let content = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            NarrativeUnavailable::Malformed("missing choices[0].message.content".to_string())
        })?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        warn!("Narrative service returned empty content");
        return Err(NarrativeUnavailable::Malformed("empty content".to_string()));
    }
    Ok(trimmed.to_string())
}

pub fn render_sidecar(payload: &SummaryPayload, narrative: &str, now: &DateTime<Local>) -> String {
    let stats = &payload.statistics;
    let rule = "=".repeat(60);
    let thin = "-".repeat(40);
    let mut out = String::new();
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "METRIC ANALYSIS - {}", payload.item_name);
    let _ = writeln!(out, "Host: {}", payload.host_name);
    let _ = writeln!(out, "{rule}\n");
    let _ = writeln!(out, "STATISTICS ({}):", payload.period_label);
    let _ = writeln!(
        out,
        "   * Period: {} to {}",
        stats.period_start.format("%Y-%m-%d"),
        stats.period_end.format("%Y-%m-%d")
    );
    let _ = writeln!(out, "   * Samples: {}", stats.count);
    let _ = writeln!(out, "   * Average: {}", payload.measure(stats.avg));
    let _ = writeln!(out, "   * Maximum: {}", payload.measure(stats.max));
    let _ = writeln!(out, "   * Minimum: {}", payload.measure(stats.min));
    let _ = writeln!(out, "   * P95: {}", payload.measure(stats.p95));
    let _ = writeln!(out, "   * P99: {}", payload.measure(stats.p99));
    let _ = writeln!(out, "   * Std. deviation: {:.2}", stats.std_dev);
    let _ = writeln!(out, "   * Peak hours: {}", join_hours(&stats.peak_hours));
    let _ = writeln!(out, "   * Peak days: {}\n", join_days(&stats.peak_days));
    let _ = writeln!(out, "CONCLUSION:");
    let _ = writeln!(out, "{thin}");
    let _ = writeln!(out, "{narrative}");
    let _ = writeln!(out, "{thin}\n");
    let _ = writeln!(out, "Generated: {}", now.format("%Y-%m-%d %H:%M:%S"));
    out
}

/// Writes `<stem>_conclusion.txt` next to the item's CSV.
pub fn write_sidecar(
    dir: &Path,
    payload: &SummaryPayload,
    narrative: &str,
    now: &DateTime<Local>,
) -> io::Result<PathBuf> {
    let path = dir.join(format!(
        "{}_conclusion.txt",
        item_stem(&payload.host_name, &payload.item_name)
    ));
    fs::write(&path, render_sidecar(payload, narrative, now))?;
    info!("Saved conclusion to: {}", path.display());
    Ok(path)
}
