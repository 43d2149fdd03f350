use crate::detection::DetectionParams;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Plain environment variables an operator can set on the container, mapped to
/// the configuration key they override. These win over every other source.
const OPERATOR_VARIABLES: [(&str, &str); 6] = [
    ("PORT", "server.port"),
    ("MODEL_PATH", "model.path"),
    ("MAX_FRAMES", "decoder.max_frames"),
    ("WORKER_COUNT", "executor.worker_count"),
    ("QUEUE_DEPTH", "executor.queue_depth"),
    ("REQUEST_TIMEOUT_MS", "handler.request_timeout_ms"),
];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub model: ModelConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub handler: HandlerConfig,
    #[serde(default)]
    pub quality: QualityConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    10000
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub path: PathBuf,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub labels_path: Option<PathBuf>,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_iou_threshold() -> f32 {
    0.7
}

fn default_input_size() -> u32 {
    640
}

impl ModelConfig {
    pub fn detection_params(&self) -> DetectionParams {
        DetectionParams {
            confidence_threshold: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
        }
    }

    pub fn model_name(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string())
    }

    fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(format!(
                "model.confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(format!(
                "model.iou_threshold must be within [0, 1], got {}",
                self.iou_threshold
            ));
        }
        if self.input_size == 0 {
            return Err("model.input_size must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_queue_depth() -> usize {
    64
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DecoderConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    #[serde(default)]
    pub sample_fps: Option<f64>,
    /// Largest accepted picture, in pixels, for images and video frames alike.
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_max_frames() -> usize {
    300
}

fn default_max_pixels() -> u64 {
    7680 * 4320
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            max_frames: default_max_frames(),
            sample_fps: None,
            max_pixels: default_max_pixels(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HandlerConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default)]
    pub accept_partial_video: bool,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_payload_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            accept_partial_video: false,
        }
    }
}

/// Still-image acceptance thresholds, applied to image requests only.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QualityConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub reject: bool,
    #[serde(default = "default_min_side")]
    pub min_side: u32,
    #[serde(default = "default_min_sharpness")]
    pub min_sharpness: f64,
    #[serde(default = "default_min_brightness")]
    pub min_brightness: f64,
    #[serde(default = "default_max_brightness")]
    pub max_brightness: f64,
}

fn default_min_side() -> u32 {
    100
}

fn default_min_sharpness() -> f64 {
    50.0
}

fn default_min_brightness() -> f64 {
    30.0
}

fn default_max_brightness() -> f64 {
    225.0
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            reject: false,
            min_side: default_min_side(),
            min_sharpness: default_min_sharpness(),
            min_brightness: default_min_brightness(),
            max_brightness: default_max_brightness(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        self.model.validate()?;
        if self.executor.worker_count == 0 {
            return Err("executor.worker_count must be at least 1".to_string());
        }
        if self.executor.queue_depth == 0 {
            return Err("executor.queue_depth must be at least 1".to_string());
        }
        if self.decoder.max_frames == 0 {
            return Err("decoder.max_frames must be at least 1".to_string());
        }
        if self.decoder.max_pixels == 0 {
            return Err("decoder.max_pixels must be at least 1".to_string());
        }
        if let Some(fps) = self.decoder.sample_fps {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(format!("decoder.sample_fps must be positive, got {}", fps));
            }
        }
        if self.handler.request_timeout_ms == 0 {
            return Err("handler.request_timeout_ms must be positive".to_string());
        }
        if self.quality.min_brightness > self.quality.max_brightness {
            return Err("quality.min_brightness exceeds quality.max_brightness".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("failed to determine the current directory: {}", e))
    })?;

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let overrides: Vec<(&str, String)> = OPERATOR_VARIABLES
        .iter()
        .filter_map(|(variable, key)| std::env::var(variable).ok().map(|value| (*key, value)))
        .collect();

    build_configuration(
        &base_path.join("configuration"),
        &environment,
        &overrides,
    )
}

/// Layers `base.yaml`, the environment file, `APP_*` variables and finally the
/// operator overrides, then validates the result.
pub fn build_configuration(
    configuration_directory: &Path,
    environment: &Environment,
    overrides: &[(&str, String)],
) -> Result<Config, config::ConfigError> {
    let mut builder = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        );

    for (key, value) in overrides {
        builder = builder.set_override(*key, value.as_str())?;
    }

    let config = builder.build()?.try_deserialize::<Config>()?;

    if let Err(e) = config.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}
