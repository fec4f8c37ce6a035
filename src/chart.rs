use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, TimeZone};
use image::{DynamicImage, GenericImageView, ImageFormat};
use log::{error, info, warn};

use crate::export::sanitize_filename;

/// Share of the server-rendered image taken by the graph; the rest is legend.
pub const CHART_HEIGHT_RATIO: f64 = 0.75;

const CHART_ENDPOINTS: [&str; 2] = ["chart.php", "chart2.php"];

#[derive(Debug, thiserror::Error)]
pub enum ChartError {
    #[error("chart request failed: {0}")]
    Request(String),
    #[error("chart endpoint answered HTTP {0}")]
    Http(u16),
    #[error("web session expired (received the login page)")]
    SessionExpired,
    #[error("unexpected content type '{0}'")]
    NotAnImage(String),
    #[error("cannot decode chart image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("cannot save {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Anything that can produce a pre-rendered chart bitmap for an item.
pub trait ChartSource: Send + Sync {
    fn fetch_chart_bitmap(
        &self,
        item_id: &str,
        start: i64,
        end: i64,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, ChartError>;
}

fn looks_like_login_page(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("sign in") || lower.contains("login")
}

fn frontend_time(ts: i64) -> String {
    Local
        .timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

pub fn chart_query(
    item_id: &str,
    start: i64,
    end: i64,
    width: u32,
    height: u32,
) -> Vec<(&'static str, String)> {
    vec![
        ("itemids[]", item_id.to_string()),
        ("from", frontend_time(start)),
        ("to", frontend_time(end)),
        ("width", width.to_string()),
        ("height", height.to_string()),
        ("profileIdx", "web.item.graph".to_string()),
    ]
}

/// Web-frontend session used for `chart.php`, which the JSON-RPC token
/// does not authorise.
pub struct ChartDownloader {
    http: reqwest::blocking::Client,
    base_url: String,
    logged_in: bool,
}

impl ChartDownloader {
    /// Logs into the frontend. A failed login is logged, not fatal; chart
    /// requests will then report an expired session per item.
    pub fn connect(
        base_url: &str,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, ChartError> {
        let http = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .map_err(|e| ChartError::Request(e.to_string()))?;
        let mut downloader = ChartDownloader {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            logged_in: false,
        };
        downloader.logged_in = downloader.web_login(user, password);
        Ok(downloader)
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    fn web_login(&self, user: &str, password: &str) -> bool {
        let login_url = format!("{}/index.php", self.base_url);
        info!("Web login to: {login_url}");
        let response = match self
            .http
            .post(&login_url)
            .form(&[("name", user), ("password", password), ("enter", "Sign in")])
            .send()
        {
            Ok(response) => response,
            Err(e) => {
                error!("Web login error: {e}");
                return false;
            }
        };
        let status = response.status();
        let final_url = response.url().to_string();
        let body = response.text().unwrap_or_default();
        if status.is_success() && !final_url.contains("login") && !body.to_lowercase().contains("sign in") {
            info!("Web login successful");
            true
        } else {
            error!("Web login failed. Status: {status}");
            false
        }
    }

    fn try_endpoint(
        &self,
        endpoint: &str,
        query: &[(&'static str, String)],
    ) -> Result<Vec<u8>, ChartError> {
        let url = format!("{}/{endpoint}", self.base_url);
        info!("Requesting: {url}");
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .map_err(|e| ChartError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChartError::Http(status.as_u16()));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .bytes()
            .map_err(|e| ChartError::Request(e.to_string()))?;

        if content_type.contains("image") {
            info!("Downloaded image ({} bytes)", body.len());
            return Ok(body.to_vec());
        }
        let text = String::from_utf8_lossy(&body);
        if looks_like_login_page(&text) {
            return Err(ChartError::SessionExpired);
        }
        Err(ChartError::NotAnImage(content_type))
    }
}

impl ChartSource for ChartDownloader {
    /// Tries `chart.php` first, then the legacy `chart2.php`.
    fn fetch_chart_bitmap(
        &self,
        item_id: &str,
        start: i64,
        end: i64,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, ChartError> {
        let query = chart_query(item_id, start, end, width, height);
        let mut last_error = ChartError::Request("no chart endpoint tried".to_string());
        for endpoint in CHART_ENDPOINTS {
            match self.try_endpoint(endpoint, &query) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    warn!("{endpoint} failed for item {item_id}: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Graph and legend halves of a server-rendered chart.
pub struct ChartParts {
    pub chart: DynamicImage,
    pub legend: DynamicImage,
}

pub fn split_into_chart_and_legend(bytes: &[u8]) -> Result<ChartParts, ChartError> {
    let image = image::load_from_memory(bytes).map_err(ChartError::Decode)?;
    let (width, height) = image.dimensions();
    info!("Processing image: {width}x{height} pixels");
    let split = (height as f64 * CHART_HEIGHT_RATIO) as u32;
    Ok(ChartParts {
        chart: image.crop_imm(0, 0, width, split),
        legend: image.crop_imm(0, split, width, height - split),
    })
}

pub fn save_png(image: &DynamicImage, path: &Path) -> Result<(), ChartError> {
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|source| ChartError::Save {
            path: path.to_path_buf(),
            source,
        })?;
    info!("Saved: {}", path.display());
    Ok(())
}

/// Image files written for one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ChartFiles {
    Split { chart: PathBuf, legend: PathBuf },
    Full(PathBuf),
}

impl ChartFiles {
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            ChartFiles::Split { chart, legend } => vec![chart.as_path(), legend.as_path()],
            ChartFiles::Full(path) => vec![path.as_path()],
        }
    }
}

/// Decodes `bytes` and writes either graph + legend or the full image.
pub fn save_chart(bytes: &[u8], dir: &Path, name: &str, crop: bool) -> Result<ChartFiles, ChartError> {
    let stem = sanitize_filename(name);
    if crop {
        let parts = split_into_chart_and_legend(bytes)?;
        let chart = dir.join(format!("{stem}_chart.png"));
        let legend = dir.join(format!("{stem}_legend.png"));
        save_png(&parts.chart, &chart)?;
        save_png(&parts.legend, &legend)?;
        Ok(ChartFiles::Split { chart, legend })
    } else {
        let image = image::load_from_memory(bytes).map_err(ChartError::Decode)?;
        let full = dir.join(format!("{stem}_full.png"));
        save_png(&image, &full)?;
        Ok(ChartFiles::Full(full))
    }
}

#[cfg(test)]
pub(crate) fn png_fixture(width: u32, height: u32) -> Vec<u8> {
    use image::{ImageOutputFormat, Rgb, RgbImage};
    use std::io::Cursor;

    let img = RgbImage::from_fn(width, height, |_, y| {
        if y < height / 2 {
            Rgb([255, 255, 255])
        } else {
            Rgb([20, 40, 80])
        }
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
        .unwrap();
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_is_three_quarters_graph() {
        let parts = split_into_chart_and_legend(&png_fixture(90, 40)).unwrap();
        assert_eq!(parts.chart.dimensions(), (90, 30));
        assert_eq!(parts.legend.dimensions(), (90, 10));

        let odd = split_into_chart_and_legend(&png_fixture(10, 201)).unwrap();
        assert_eq!(odd.chart.height() + odd.legend.height(), 201);
        assert_eq!(odd.chart.height(), 150);
    }

    #[test]
    fn non_image_bytes_fail_to_decode() {
        assert!(matches!(
            split_into_chart_and_legend(b"<html>Sign in</html>"),
            Err(ChartError::Decode(_))
        ));
    }

    #[test]
    fn saves_split_or_full_images() {
        let tmp = tempfile::tempdir().unwrap();
        let bytes = png_fixture(60, 20);

        let split = save_chart(&bytes, tmp.path(), "web 01_CPU load", true).unwrap();
        match &split {
            ChartFiles::Split { chart, legend } => {
                assert_eq!(chart.file_name().unwrap(), "web_01_CPU_load_chart.png");
                assert!(chart.exists() && legend.exists());
                let reloaded = image::open(chart).unwrap();
                assert_eq!(reloaded.dimensions(), (60, 15));
            }
            other => panic!("expected split files, got {other:?}"),
        }

        let full = save_chart(&bytes, tmp.path(), "web 01_CPU load", false).unwrap();
        assert_eq!(full.paths().len(), 1);
        assert!(full.paths()[0].ends_with("web_01_CPU_load_full.png"));
    }

    #[test]
    fn query_targets_the_item_and_size() {
        let query = chart_query("23296", 0, 3600, 900, 200);
        assert_eq!(query[0], ("itemids[]", "23296".to_string()));
        assert_eq!(query[3], ("width", "900".to_string()));
        assert_eq!(query[4], ("height", "200".to_string()));
        assert_eq!(query[5], ("profileIdx", "web.item.graph".to_string()));
    }

    #[test]
    fn unreachable_frontend_leaves_session_logged_out() {
        let downloader =
            ChartDownloader::connect("http://127.0.0.1:9/", "Admin", "zabbix", Duration::from_secs(2)).unwrap();
        assert!(!downloader.is_logged_in());
    }

    #[test]
    fn login_page_detection() {
        assert!(looks_like_login_page("<form>Sign in</form>"));
        assert!(!looks_like_login_page("GIF89a"));
    }
}
