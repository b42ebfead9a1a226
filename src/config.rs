use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::congestion::CongestionThresholds;
use crate::detect::{DetectionFilter, PERSON_CLASS_ID};
use crate::snapshot::SiteMetadata;
use crate::window::RollingWindow;

const DEFAULT_CAMERA_URL: &str = "http://172.20.10.6";
const DEFAULT_STREAM_PATH: &str = ":81/stream";
const DEFAULT_CAPTURE_PATH: &str = "/capture";
const DEFAULT_CONF_THRESHOLD: f32 = 0.35;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_REENTRY_GRACE_SECS: u64 = 45;
const DEFAULT_SHORT_WINDOW_SECS: u64 = 5 * 60;
const DEFAULT_LONG_WINDOW_SECS: u64 = 30 * 60;
const DEFAULT_LOW_MAX: u32 = 1;
const DEFAULT_MEDIUM_MAX: u32 = 3;
const DEFAULT_POST_INTERVAL_SECS: u64 = 60;
const DEFAULT_POST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FALLBACK_PATH: &str = "local_metrics.csv";
const DEFAULT_COUNTER_PATH: &str = ".counter";
const DEFAULT_DEVICE_ID: &str = "esp32cam-01";
const DEFAULT_LAT: f64 = 51.0189;
const DEFAULT_LNG: f64 = -114.1594;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AggregatorConfigFile {
    camera: Option<CameraConfigFile>,
    detection: Option<DetectionConfigFile>,
    tracking: Option<TrackingConfigFile>,
    windows: Option<WindowConfigFile>,
    congestion: Option<CongestionConfigFile>,
    reporting: Option<ReportingConfigFile>,
    site: Option<SiteConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    base_url: Option<String>,
    stream_path: Option<String>,
    capture_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    min_confidence: Option<f32>,
    iou_threshold: Option<f32>,
    class_id: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingConfigFile {
    reentry_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct WindowConfigFile {
    short_secs: Option<u64>,
    long_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CongestionConfigFile {
    low_max: Option<u32>,
    medium_max: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ReportingConfigFile {
    interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
    collector_url: Option<String>,
    api_key: Option<String>,
    fallback_path: Option<PathBuf>,
    counter_path: Option<PathBuf>,
    obfuscate: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct SiteConfigFile {
    device_id: Option<String>,
    lat: Option<f64>,
    lng: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub camera: CameraSettings,
    pub detection: DetectionFilter,
    pub reentry_grace: Duration,
    pub windows: WindowSettings,
    pub congestion: CongestionSettings,
    pub reporting: ReportingSettings,
    pub site: SiteMetadata,
}

/// Camera endpoints. Frame acquisition lives outside this crate; these are
/// carried so the daemon can report what the upstream pipeline reads from.
#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub base_url: String,
    pub stream_path: String,
    pub capture_path: String,
}

impl CameraSettings {
    pub fn stream_url(&self) -> String {
        format!("{}{}", self.base_url, self.stream_path)
    }

    pub fn capture_url(&self) -> String {
        format!("{}{}", self.base_url, self.capture_path)
    }
}

#[derive(Debug, Clone)]
pub struct WindowSettings {
    pub short: Duration,
    pub long: Duration,
}

#[derive(Debug, Clone)]
pub struct CongestionSettings {
    pub low_max: u32,
    pub medium_max: u32,
}

#[derive(Debug, Clone)]
pub struct ReportingSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub collector_url: Option<String>,
    pub api_key: Option<String>,
    pub fallback_path: PathBuf,
    pub counter_path: Option<PathBuf>,
    pub obfuscate: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self::from_file(AggregatorConfigFile::default())
    }
}

impl AggregatorConfig {
    /// Load from the file named by `PATHGUARD_CONFIG` (if any), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PATHGUARD_CONFIG").ok();
        Self::load_from(
            config_path
                .as_deref()
                .filter(|path| !path.trim().is_empty())
                .map(Path::new),
        )
    }

    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AggregatorConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let tracking = file.tracking.unwrap_or_default();
        let windows = file.windows.unwrap_or_default();
        let congestion = file.congestion.unwrap_or_default();
        let reporting = file.reporting.unwrap_or_default();
        let site = file.site.unwrap_or_default();

        Self {
            camera: CameraSettings {
                base_url: camera
                    .base_url
                    .unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
                stream_path: camera
                    .stream_path
                    .unwrap_or_else(|| DEFAULT_STREAM_PATH.to_string()),
                capture_path: camera
                    .capture_path
                    .unwrap_or_else(|| DEFAULT_CAPTURE_PATH.to_string()),
            },
            detection: DetectionFilter {
                min_confidence: detection.min_confidence.unwrap_or(DEFAULT_CONF_THRESHOLD),
                iou_threshold: detection.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
                class_id: detection.class_id.unwrap_or(PERSON_CLASS_ID),
            },
            reentry_grace: Duration::from_secs(
                tracking
                    .reentry_grace_secs
                    .unwrap_or(DEFAULT_REENTRY_GRACE_SECS),
            ),
            windows: WindowSettings {
                short: Duration::from_secs(windows.short_secs.unwrap_or(DEFAULT_SHORT_WINDOW_SECS)),
                long: Duration::from_secs(windows.long_secs.unwrap_or(DEFAULT_LONG_WINDOW_SECS)),
            },
            congestion: CongestionSettings {
                low_max: congestion.low_max.unwrap_or(DEFAULT_LOW_MAX),
                medium_max: congestion.medium_max.unwrap_or(DEFAULT_MEDIUM_MAX),
            },
            reporting: ReportingSettings {
                interval: Duration::from_secs(
                    reporting.interval_secs.unwrap_or(DEFAULT_POST_INTERVAL_SECS),
                ),
                timeout: Duration::from_secs(
                    reporting.timeout_secs.unwrap_or(DEFAULT_POST_TIMEOUT_SECS),
                ),
                collector_url: reporting.collector_url,
                api_key: reporting.api_key,
                fallback_path: reporting
                    .fallback_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FALLBACK_PATH)),
                // An empty path keeps snapshot ids in memory only.
                counter_path: match reporting.counter_path {
                    Some(path) if path.as_os_str().is_empty() => None,
                    Some(path) => Some(path),
                    None => Some(PathBuf::from(DEFAULT_COUNTER_PATH)),
                },
                obfuscate: reporting.obfuscate.unwrap_or(false),
            },
            site: SiteMetadata {
                device_id: site
                    .device_id
                    .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
                lat: site.lat.unwrap_or(DEFAULT_LAT),
                lng: site.lng.unwrap_or(DEFAULT_LNG),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("PATHGUARD_CAMERA_URL") {
            self.camera.base_url = url;
        }
        if let Some(url) = env_string("PATHGUARD_COLLECTOR_URL") {
            self.reporting.collector_url = Some(url);
        }
        if let Some(key) = env_string("PATHGUARD_API_KEY") {
            self.reporting.api_key = Some(key);
        }
        if let Some(device_id) = env_string("PATHGUARD_DEVICE_ID") {
            self.site.device_id = device_id;
        }
        if let Some(lat) = env_parse::<f64>("PATHGUARD_LAT", "a number")? {
            self.site.lat = lat;
        }
        if let Some(lng) = env_parse::<f64>("PATHGUARD_LNG", "a number")? {
            self.site.lng = lng;
        }
        if let Some(conf) = env_parse::<f32>("PATHGUARD_CONF_THRESHOLD", "a number")? {
            self.detection.min_confidence = conf;
        }
        if let Some(secs) =
            env_parse::<u64>("PATHGUARD_REENTRY_GRACE_SECS", "an integer number of seconds")?
        {
            self.reentry_grace = Duration::from_secs(secs);
        }
        if let Some(secs) =
            env_parse::<u64>("PATHGUARD_POST_INTERVAL_SECS", "an integer number of seconds")?
        {
            self.reporting.interval = Duration::from_secs(secs);
        }
        if let Some(secs) =
            env_parse::<u64>("PATHGUARD_POST_TIMEOUT_SECS", "an integer number of seconds")?
        {
            self.reporting.timeout = Duration::from_secs(secs);
        }
        if let Some(path) = env_string("PATHGUARD_FALLBACK_PATH") {
            self.reporting.fallback_path = PathBuf::from(path);
        }
        if let Some(raw) = env_string("PATHGUARD_OBFUSCATE") {
            self.reporting.obfuscate = parse_flag(&raw)
                .ok_or_else(|| anyhow!("PATHGUARD_OBFUSCATE must be true/false (got '{}')", raw))?;
        }
        Ok(())
    }

    /// Reject configurations the aggregator could not run with.
    pub fn validate(&mut self) -> Result<()> {
        RollingWindow::new(self.windows.short).context("windows.short_secs")?;
        RollingWindow::new(self.windows.long).context("windows.long_secs")?;
        if self.windows.short > self.windows.long {
            return Err(anyhow!(
                "short window ({}s) must not exceed long window ({}s)",
                self.windows.short.as_secs(),
                self.windows.long.as_secs()
            ));
        }
        self.thresholds()?;
        if self.reporting.interval.is_zero() {
            return Err(anyhow!("reporting interval must be greater than zero"));
        }
        if self.reporting.timeout.is_zero() {
            return Err(anyhow!("network timeout must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.detection.min_confidence) {
            return Err(anyhow!("detection confidence threshold must be within 0..=1"));
        }
        if !(0.0..=1.0).contains(&self.detection.iou_threshold) {
            return Err(anyhow!("detection IoU threshold must be within 0..=1"));
        }
        if !(-90.0..=90.0).contains(&self.site.lat) {
            return Err(anyhow!("latitude {} out of range", self.site.lat));
        }
        if !(-180.0..=180.0).contains(&self.site.lng) {
            return Err(anyhow!("longitude {} out of range", self.site.lng));
        }
        self.site.device_id = self.site.device_id.trim().to_string();
        if self.site.device_id.is_empty() {
            return Err(anyhow!("device id must not be empty"));
        }
        if self.site.device_id.chars().any(char::is_control) {
            return Err(anyhow!(
                "device id {:?} must not contain control characters",
                self.site.device_id
            ));
        }
        if let Some(raw) = self.reporting.collector_url.as_deref() {
            let parsed = url::Url::parse(raw)
                .map_err(|e| anyhow!("invalid collector url '{}': {}", raw, e))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(anyhow!(
                    "collector url must use http or https, got '{}'",
                    parsed.scheme()
                ));
            }
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Result<CongestionThresholds> {
        CongestionThresholds::new(self.congestion.low_max, self.congestion.medium_max)
    }
}

fn read_config_file(path: &Path) -> Result<AggregatorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, expected: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be {}", key, expected)),
        None => Ok(None),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
