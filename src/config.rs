use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::report::{GlobalReportConfig, HostReportConfig};

pub const CONFIG_ENV: &str = "ZABBIX_EXTRACTOR_CONFIG";
pub const DEFAULT_NARRATIVE_ENDPOINT: &str = "https://api.deepseek.com/v1/chat/completions";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub narrative: NarrativeConfig,
    pub output: OutputConfig,
    pub report: GlobalReportConfig,
    /// Per-host operative text, keyed by host display name
    pub hosts: BTreeMap<String, HostReportConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Frontend URL, with or without the trailing `/api_jsonrpc.php`
    pub url: String,
    pub user: String,
    pub password: String,
    /// Timeout for API calls in seconds
    pub timeout_secs: u64,
    /// Timeout for chart downloads in seconds
    pub chart_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: String::new(),
            password: String::new(),
            timeout_secs: 10,
            chart_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NarrativeConfig {
    /// Chat-completion API key; narratives are skipped without one
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_NARRATIVE_ENDPOINT.to_string(),
            model: "deepseek-chat".to_string(),
            max_tokens: 250,
            temperature: 0.3,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Run folders are created under `<base_dir>/downloads/`
    pub base_dir: PathBuf,
    pub chart_width: u32,
    pub chart_height: u32,
    /// Split downloaded charts into graph and legend images
    pub crop: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            chart_width: 900,
            chart_height: 200,
            crop: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

pub fn default_config_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("zabbix-extractor").join("config.toml")
}

pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        if let Some(stripped) = env_path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        }
        return PathBuf::from(env_path);
    }
    default_config_path()
}

impl Config {
    pub fn from_toml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Environment variables win over the file.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("ZABBIX_URL") {
            self.server.url = url;
        }
        if let Some(user) = lookup("ZABBIX_USER") {
            self.server.user = user;
        }
        if let Some(password) = lookup("ZABBIX_PASSWORD") {
            self.server.password = password;
        }
        if let Some(key) = lookup("NARRATIVE_API_KEY") {
            self.narrative.api_key = Some(key);
        }
    }

    pub fn host(&self, host_name: &str) -> HostReportConfig {
        self.hosts.get(host_name).cloned().unwrap_or_default()
    }
}

/// Load configuration from a TOML file. If the file doesn't exist, default
/// values are returned. Environment overrides are applied either way.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = resolve_config_path(path);
    let mut config = if path.exists() {
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Config::from_toml(&contents, &path)?
    } else {
        Config::default()
    };
    config.apply_overrides(|name| std::env::var(name).ok().filter(|v| !v.is_empty()));
    Ok(config)
}
