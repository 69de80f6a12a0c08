//! Runtime configuration: file discovery, parsing and `VOUCHERSCAN_*` overrides

use crate::camera::{CameraConfig, Constraints, Facing, PixelFormat};
use crate::detect::TesseractConfig;
use crate::error::{Error, Result};
use crate::frame::RegionOfInterest;
use crate::scanner::{ScanMode, ScanOptions};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "VOUCHERSCAN_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoucherConfig {
    /// Camera selection and capture format
    pub camera: CameraOptions,
    /// Scan loop cadence and OCR region
    pub scan: ScanSettings,
    /// Tesseract invocation
    pub ocr: TesseractConfig,
    /// Logging and metrics
    pub logging: LoggingOptions,
    /// Where results are written
    pub output: OutputOptions,
}

impl VoucherConfig {
    /// Load from an explicit path, a discovered file, or defaults, then apply
    /// environment overrides.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = explicit_path {
            Self::from_file(path)?
        } else if let Some(path) = Self::discover_file()? {
            tracing::info!("Using configuration file: {}", path.display());
            Self::from_file(&path)?
        } else {
            tracing::debug!("No voucherscan.toml / voucherscan.yaml found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn discover_file() -> Result<Option<PathBuf>> {
        let cwd =
            env::current_dir().map_err(|e| Error::Config(format!("Failed to read cwd: {e}")))?;
        let local = ["voucherscan.toml", "voucherscan.yaml", "voucherscan.yml"]
            .into_iter()
            .map(|name| cwd.join(name));

        let xdg = env::var_os("XDG_CONFIG_HOME")
            .map(|dir| PathBuf::from(dir).join("voucherscan"))
            .into_iter()
            .flat_map(|base| ["config.toml", "config.yaml"].map(|name| base.join(name)));

        Ok(local.chain(xdg).find(|path| path.exists()))
    }

    /// Parse a TOML or YAML file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        Self::parse(&contents, &extension)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Parse configuration text in the given format (`toml`, `yaml` or `yml`).
    pub fn parse(contents: &str, format: &str) -> Result<Self> {
        match format {
            "toml" => toml::from_str(contents)
                .map_err(|e| Error::Config(format!("Failed to parse TOML: {e}"))),
            "yaml" | "yml" => serde_yaml::from_str(contents)
                .map_err(|e| Error::Config(format!("Failed to parse YAML: {e}"))),
            other => Err(Error::Config(format!(
                "Unsupported config format '{other}', expected toml/yaml"
            ))),
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(format!("{ENV_PREFIX}{key}")).ok());
    }

    /// Apply overrides from `lookup`, which receives keys without the
    /// `VOUCHERSCAN_` prefix (e.g. `CAMERA_INDEX`).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.camera.apply_overrides(&lookup);
        self.scan.apply_overrides(&lookup);
        if let Some(binary) = lookup("TESSERACT") {
            self.ocr.binary = PathBuf::from(binary);
        }
        if let Some(language) = lookup("OCR_LANGUAGE") {
            self.ocr.language = language;
        }
        if let Some(dir) = lookup("TESSDATA_DIR") {
            self.ocr.tessdata_dir = non_empty_path(dir);
        }
        self.logging.apply_overrides(&lookup);
        if let Some(socket) = lookup("UNIX_SOCKET") {
            self.output.unix_socket = non_empty_path(socket);
        }
        if let Some(json) = lookup("JSON").and_then(|v| parse_flag(&v)) {
            self.output.json = json;
        }
    }

    /// Resolved camera configuration for the V4L2 source
    pub fn camera_config(&self) -> Result<CameraConfig> {
        self.camera.to_camera_config()
    }

    /// Resolved scan loop options
    pub fn scan_options(&self) -> Result<ScanOptions> {
        let facing = self.camera_config()?.facing;
        Ok(self.scan.to_scan_options(Constraints { facing }))
    }
}

fn non_empty_path(value: String) -> Option<PathBuf> {
    if value.trim().is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Camera overrides merged onto `CameraConfig::default()`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraOptions {
    /// Numeric device index (`/dev/videoN`)
    pub device_index: Option<usize>,
    /// Device name substring
    pub device_name: Option<String>,
    /// Preferred facing (`environment` or `user`)
    pub facing: Option<String>,
    /// Frame width in pixels
    pub width: Option<u32>,
    /// Frame height in pixels
    pub height: Option<u32>,
    /// Frames per second
    pub fps: Option<u32>,
    /// Pixel format (mjpeg/yuyv/rgb24)
    pub format: Option<String>,
    /// V4L2 buffer count
    pub buffer_count: Option<u32>,
}

impl CameraOptions {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("CAMERA_DEVICE") {
            self.device_name = Some(name);
            self.device_index = None;
        }
        if let Some(index) = lookup("CAMERA_INDEX").and_then(|v| v.parse().ok()) {
            self.device_index = Some(index);
            self.device_name = None;
        }
        if let Some(facing) = lookup("CAMERA_FACING") {
            self.facing = Some(facing);
        }
        if let Some(width) = lookup("CAMERA_WIDTH") {
            self.width = width.parse().ok();
        }
        if let Some(height) = lookup("CAMERA_HEIGHT") {
            self.height = height.parse().ok();
        }
        if let Some(fps) = lookup("CAMERA_FPS") {
            self.fps = fps.parse().ok();
        }
        if let Some(format) = lookup("CAMERA_FORMAT") {
            self.format = Some(format);
        }
        if let Some(buffers) = lookup("CAMERA_BUFFERS") {
            self.buffer_count = buffers.parse().ok();
        }
    }

    /// Merge overrides onto the default camera configuration.
    pub fn to_camera_config(&self) -> Result<CameraConfig> {
        let mut config = CameraConfig::default();

        if let Some(name) = &self.device_name {
            config.device_name = Some(name.clone());
            config.device_index = None;
        }
        if let Some(index) = self.device_index {
            config.device_index = Some(index);
            if self.device_name.is_none() {
                config.device_name = None;
            }
        }
        if let Some(facing) = &self.facing {
            config.facing = Facing::parse(facing).ok_or_else(|| {
                Error::Config(format!(
                    "Unknown camera facing '{facing}'. Use environment or user"
                ))
            })?;
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(fps) = self.fps {
            config.fps = fps.max(1);
        }
        if let Some(format) = &self.format {
            config.format = PixelFormat::parse(format).ok_or_else(|| {
                Error::Config(format!(
                    "Unknown pixel format '{format}'. Use mjpeg, yuyv, or rgb24"
                ))
            })?;
        }
        if let Some(buffers) = self.buffer_count {
            config.buffer_count = buffers.max(2);
        }

        Ok(config)
    }
}

/// Scan loop settings as written in config files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Mode used when none is given on the command line
    pub mode: ScanMode,
    /// QR polling interval in milliseconds
    pub qr_interval_ms: u64,
    /// OCR polling interval in milliseconds
    pub ocr_interval_ms: u64,
    /// Empty attempts tolerated before hinting (0 disables)
    pub hint_threshold: u32,
    /// Release-to-acquire delay in milliseconds
    pub switch_delay_ms: u64,
    /// Detection timeout in milliseconds (0 disables)
    pub recognition_timeout_ms: u64,
    /// OCR crop band
    pub region: RegionOfInterest,
}

impl Default for ScanSettings {
    fn default() -> Self {
        let options = ScanOptions::default();
        Self {
            mode: ScanMode::default(),
            qr_interval_ms: options.qr_interval.as_millis() as u64,
            ocr_interval_ms: options.ocr_interval.as_millis() as u64,
            hint_threshold: options.hint_threshold,
            switch_delay_ms: options.switch_delay.as_millis() as u64,
            recognition_timeout_ms: options
                .recognition_timeout
                .map_or(0, |timeout| timeout.as_millis() as u64),
            region: options.region,
        }
    }
}

impl ScanSettings {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(mode) = lookup("SCAN_MODE").and_then(|v| v.parse().ok()) {
            self.mode = mode;
        }
        if let Some(ms) = lookup("QR_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.qr_interval_ms = ms;
        }
        if let Some(ms) = lookup("OCR_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.ocr_interval_ms = ms;
        }
        if let Some(threshold) = lookup("HINT_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.hint_threshold = threshold;
        }
        if let Some(ms) = lookup("SWITCH_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.switch_delay_ms = ms;
        }
        if let Some(ms) = lookup("RECOGNITION_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.recognition_timeout_ms = ms;
        }
    }

    /// Runtime options for the controller
    pub fn to_scan_options(&self, constraints: Constraints) -> ScanOptions {
        ScanOptions {
            qr_interval: Duration::from_millis(self.qr_interval_ms.max(1)),
            ocr_interval: Duration::from_millis(self.ocr_interval_ms.max(1)),
            hint_threshold: self.hint_threshold,
            switch_delay: Duration::from_millis(self.switch_delay_ms),
            recognition_timeout: (self.recognition_timeout_ms > 0)
                .then(|| Duration::from_millis(self.recognition_timeout_ms)),
            region: self.region.normalized(),
            constraints,
        }
    }
}

/// Result output settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    /// Print JSON lines instead of human-readable text
    pub json: bool,
    /// Unix socket path for streaming scan events
    pub unix_socket: Option<PathBuf>,
}

/// Structured logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Default filter directive (overridable via `VOUCHERSCAN_LOG_LEVEL`)
    pub level: String,
    /// Optional log file
    pub file: Option<PathBuf>,
    /// ANSI colors on stderr
    pub color: bool,
    /// Periodic metrics summaries over tracing
    pub metrics: bool,
    /// Metrics window in seconds
    pub metrics_interval_secs: u64,
    /// Rotation applied to `file`
    pub rotation: Option<LogRotation>,
    /// Bind address for the metrics HTTP endpoint (e.g. "127.0.0.1:9900")
    pub metrics_endpoint: Option<String>,
    /// Metrics endpoint body format
    pub metrics_format: MetricsFormat,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            color: true,
            metrics: false,
            metrics_interval_secs: 60,
            rotation: None,
            metrics_endpoint: None,
            metrics_format: MetricsFormat::Json,
        }
    }
}

impl LoggingOptions {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("LOG_LEVEL") {
            self.level = level;
        }
        if let Some(file) = lookup("LOG_FILE") {
            self.file = non_empty_path(file);
        }
        if let Some(color) = lookup("LOG_COLOR").and_then(|v| parse_flag(&v)) {
            self.color = color;
        }
        if let Some(metrics) = lookup("LOG_METRICS").and_then(|v| parse_flag(&v)) {
            self.metrics = metrics;
        }
        if let Some(secs) = lookup("LOG_METRICS_INTERVAL").and_then(|v| v.parse::<u64>().ok()) {
            self.metrics_interval_secs = secs.max(5);
        }
        if let Some(rotation) = lookup("LOG_ROTATION").and_then(|v| LogRotation::parse(&v)) {
            self.rotation = Some(rotation);
        }
        if let Some(endpoint) = lookup("METRICS_ENDPOINT") {
            self.metrics_endpoint = Some(endpoint).filter(|e| !e.trim().is_empty());
        }
        if let Some(format) = lookup("METRICS_FORMAT").and_then(|v| MetricsFormat::parse(&v)) {
            self.metrics_format = format;
        }
    }
}

/// Log file rotation policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// New file every hour
    Hourly,
    /// New file every day
    Daily,
}

impl LogRotation {
    /// Parse a rotation name (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            _ => None,
        }
    }
}

/// Metrics endpoint body format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricsFormat {
    /// JSON document
    Json,
    /// Prometheus text exposition
    Prometheus,
}

impl MetricsFormat {
    /// Parse a format name (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "prometheus" | "prom" => Some(Self::Prometheus),
            _ => None,
        }
    }
}

impl FromStr for MetricsFormat {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| {
            format!("Unsupported metrics format '{value}', expected 'json' or 'prometheus'")
        })
    }
}
