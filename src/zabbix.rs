//! JSON-RPC client for the Zabbix API.
//!
//! Only the calls the extractor needs are wrapped: version discovery,
//! login/logout, inventory listing and `trend.get`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::trend::{TrendPoint, TrendSeries};

const API_PATH: &str = "/api_jsonrpc.php";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("cannot reach the Zabbix server: {0}")]
    Connectivity(String),
    #[error("Zabbix API error in {method}: {message}")]
    Api { method: String, message: String },
    #[error("unexpected response to {method}: {reason}")]
    Decode { method: String, reason: String },
}

fn describe_transport(error: &reqwest::Error) -> String {
    let text = error.to_string().to_lowercase();
    if error.is_timeout() {
        "timed out waiting for the server".to_string()
    } else if text.contains("dns") || text.contains("resolve") {
        "could not resolve the server name; check the URL".to_string()
    } else if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
        "TLS/certificate error; check the certificate or try http://".to_string()
    } else if text.contains("refused") {
        "connection refused; is the Zabbix frontend running?".to_string()
    } else if error.is_connect() {
        "could not connect; check that the URL is correct and reachable".to_string()
    } else {
        error.to_string()
    }
}

fn classify_login_error(message: &str) -> ApiError {
    let lower = message.to_lowercase();
    if lower.contains("incorrect") || lower.contains("invalid") || lower.contains("login") {
        ApiError::Authentication("incorrect user name or password".to_string())
    } else if lower.contains("permission") {
        ApiError::Authentication("no permission to access the API".to_string())
    } else {
        ApiError::Api {
            method: "user.login".to_string(),
            message: message.to_string(),
        }
    }
}

/// Splits a user-supplied URL into (frontend base, API endpoint).
pub fn normalize_url(url: &str) -> (String, String) {
    let trimmed = url.trim().trim_end_matches('/');
    match trimmed.strip_suffix(API_PATH) {
        Some(base) => (base.to_string(), trimmed.to_string()),
        None => (trimmed.to_string(), format!("{trimmed}{API_PATH}")),
    }
}

/// Parsed `major.minor` API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some(ApiVersion { major, minor })
    }

    const fn at_least(&self, major: u32, minor: u32) -> bool {
        self.major > major || (self.major == major && self.minor >= minor)
    }

    /// 5.4 renamed the `user` login parameter to `username`.
    pub fn login_user_field(&self) -> &'static str {
        if self.at_least(5, 4) {
            "username"
        } else {
            "user"
        }
    }

    /// 6.4+ accepts the session token as a bearer header.
    pub fn uses_bearer_auth(&self) -> bool {
        self.at_least(6, 4)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Template {
    #[serde(rename = "templateid")]
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Host {
    #[serde(rename = "hostid")]
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Item {
    #[serde(rename = "itemid")]
    pub id: String,
    pub name: String,
    #[serde(rename = "key_")]
    pub key: String,
    #[serde(default)]
    pub value_type: String,
    #[serde(default)]
    pub units: String,
}

impl Item {
    /// 0 = numeric float, 3 = numeric unsigned
    pub fn is_graphable(&self) -> bool {
        matches!(self.value_type.as_str(), "0" | "3")
    }
}

/// Case-insensitive substring match, empty needle matches everything.
pub fn matches_filter(name: &str, filter: Option<&str>) -> bool {
    match filter.map(str::trim) {
        None | Some("") => true,
        Some(needle) => name.to_lowercase().contains(&needle.to_lowercase()),
    }
}

/// Item names present on every host, sorted.
pub fn common_item_names<'a, I>(per_host: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a [Item]>,
{
    let mut common: Option<BTreeSet<String>> = None;
    for items in per_host {
        let names: BTreeSet<String> = items.iter().map(|item| item.name.clone()).collect();
        common = Some(match common {
            None => names,
            Some(acc) => acc.intersection(&names).cloned().collect(),
        });
    }
    common.map(|set| set.into_iter().collect()).unwrap_or_default()
}

/// Anything that can provide trend points for an item.
pub trait TrendSource: Send + Sync {
    fn get_trend_points(&self, item_id: &str, start: i64, end: i64)
        -> Result<TrendSeries, ApiError>;
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

/// Authenticated API session. Read-only once connected, so it can be shared
/// with worker threads behind an `Arc`.
pub struct ZabbixClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_url: String,
    version: ApiVersion,
    token: String,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ZabbixClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZabbixClient")
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

fn post_rpc(
    http: &reqwest::blocking::Client,
    api_url: &str,
    body: &Value,
    bearer: Option<&str>,
) -> Result<RpcResponse, ApiError> {
    let method = body["method"].as_str().unwrap_or("?").to_string();
    let mut request = http.post(api_url).json(body);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .map_err(|e| ApiError::Connectivity(describe_transport(&e)))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::Connectivity(format!(
            "HTTP {status} from {api_url}"
        )));
    }
    response.json().map_err(|e| ApiError::Decode {
        method,
        reason: e.to_string(),
    })
}

fn rpc_result(method: &str, response: RpcResponse) -> Result<Value, ApiError> {
    if let Some(error) = response.error {
        let message = if error.data.is_empty() {
            error.message
        } else {
            format!("{} {}", error.message, error.data)
        };
        return Err(ApiError::Api {
            method: method.to_string(),
            message,
        });
    }
    response.result.ok_or_else(|| ApiError::Decode {
        method: method.to_string(),
        reason: "neither result nor error present".to_string(),
    })
}

fn decode<T: for<'de> Deserialize<'de>>(method: &str, value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Decode {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

impl ZabbixClient {
    /// Logs in and returns a ready session.
    pub fn connect(
        url: &str,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let (base_url, api_url) = normalize_url(url);
        if base_url.is_empty() {
            return Err(ApiError::Connectivity("no server URL configured".to_string()));
        }
        info!("Connecting to Zabbix at {api_url}");

        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Connectivity(e.to_string()))?;

        let version_body = json!({"jsonrpc": "2.0", "method": "apiinfo.version", "params": [], "id": 1});
        let raw_version = rpc_result("apiinfo.version", post_rpc(&http, &api_url, &version_body, None)?)?;
        let version = raw_version
            .as_str()
            .and_then(ApiVersion::parse)
            .ok_or_else(|| ApiError::Decode {
                method: "apiinfo.version".to_string(),
                reason: format!("unparseable version {raw_version}"),
            })?;
        debug!("Server API version {}.{}", version.major, version.minor);

        let mut params = serde_json::Map::new();
        params.insert(version.login_user_field().to_string(), json!(user));
        params.insert("password".to_string(), json!(password));
        let login_body = json!({"jsonrpc": "2.0", "method": "user.login", "params": params, "id": 2});
        let response = post_rpc(&http, &api_url, &login_body, None)?;
        let token = match rpc_result("user.login", response) {
            Ok(value) => value.as_str().map(str::to_string).ok_or_else(|| ApiError::Decode {
                method: "user.login".to_string(),
                reason: "session token is not a string".to_string(),
            })?,
            Err(ApiError::Api { message, .. }) => {
                warn!("Zabbix login rejected: {message}");
                return Err(classify_login_error(&message));
            }
            Err(other) => return Err(other),
        };
        info!(
            "Successfully connected. Session: {}...",
            token.chars().take(8).collect::<String>()
        );

        Ok(ZabbixClient {
            http,
            base_url,
            api_url,
            version,
            token,
            next_id: AtomicU64::new(3),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn call(&self, method: &str, params: Value) -> Result<Value, ApiError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut body = json!({"jsonrpc": "2.0", "method": method, "params": params, "id": id});
        let bearer = if self.version.uses_bearer_auth() {
            Some(self.token.as_str())
        } else {
            body["auth"] = json!(self.token);
            None
        };
        rpc_result(method, post_rpc(&self.http, &self.api_url, &body, bearer)?)
    }

    pub fn list_templates(&self) -> Result<Vec<Template>, ApiError> {
        let value = self.call(
            "template.get",
            json!({"output": ["templateid", "name"], "sortfield": "name"}),
        )?;
        let templates: Vec<Template> = decode("template.get", value)?;
        info!("Found {} templates", templates.len());
        Ok(templates)
    }

    pub fn list_hosts_for_template(&self, template_id: &str) -> Result<Vec<Host>, ApiError> {
        let value = self.call(
            "host.get",
            json!({"output": ["hostid", "name"], "templateids": template_id, "sortfield": "name"}),
        )?;
        let hosts: Vec<Host> = decode("host.get", value)?;
        info!("Found {} hosts for template {template_id}", hosts.len());
        Ok(hosts)
    }

    /// Enabled, numeric items of a host.
    pub fn list_graphable_items(&self, host_id: &str) -> Result<Vec<Item>, ApiError> {
        let value = self.call(
            "item.get",
            json!({
                "output": ["itemid", "name", "key_", "value_type", "units"],
                "hostids": host_id,
                "sortfield": "name",
                "filter": {"status": 0, "value_type": [0, 3]}
            }),
        )?;
        let items: Vec<Item> = decode("item.get", value)?;
        let graphable: Vec<Item> = items.into_iter().filter(Item::is_graphable).collect();
        info!("Found {} graphable items for host {host_id}", graphable.len());
        Ok(graphable)
    }

    /// Best effort; failures are only logged.
    pub fn disconnect(&self) {
        match self.call("user.logout", json!([])) {
            Ok(_) => info!("Disconnected from Zabbix"),
            Err(e) => debug!("Logout failed: {e}"),
        }
    }
}

impl TrendSource for ZabbixClient {
    fn get_trend_points(
        &self,
        item_id: &str,
        start: i64,
        end: i64,
    ) -> Result<TrendSeries, ApiError> {
        info!("Fetching trends for item {item_id}: {start} -> {end}");
        let value = self.call(
            "trend.get",
            json!({
                "itemids": item_id,
                "time_from": start,
                "time_till": end,
                "output": ["itemid", "clock", "num", "value_min", "value_avg", "value_max"]
            }),
        )?;
        let points: Vec<TrendPoint> = decode("trend.get", value)?;
        info!("Retrieved {} trend data points", points.len());
        Ok(TrendSeries::new(points))
    }
}
