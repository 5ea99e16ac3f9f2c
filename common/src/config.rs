use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub persist: PersistConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Snapshot endpoint URL in `http` mode, frame directory in `dir` mode.
    pub url: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_resolution")]
    pub resolution: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_web_root")]
    pub web_root: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistConfig {
    #[serde(default = "default_persist_dir")]
    pub dir: String,
    /// Floor on the spacing between persisted frames, even during motion.
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
    /// Ceiling on the gap between persisted frames while the scene is idle.
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_window")]
    pub window_secs: u64,
    #[serde(default = "default_cull_interval")]
    pub cull_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    #[serde(default = "default_detect_interval")]
    pub detect_interval_secs: u64,
    /// Per-pixel difference against the background model counted as foreground.
    #[serde(default = "default_diff_threshold")]
    pub diff_threshold: u8,
    /// Foreground regions smaller than this many pixels are dropped as noise.
    #[serde(default = "default_min_area")]
    pub min_area: u32,
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,
    /// Exponential moving average weight for new frames in the background model.
    #[serde(default = "default_model_weight")]
    pub model_weight: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            web_root: default_web_root(),
        }
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            dir: default_persist_dir(),
            min_interval_secs: default_min_interval(),
            max_interval_secs: default_max_interval(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
            cull_interval_secs: default_cull_interval(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            detect_interval_secs: default_detect_interval(),
            diff_threshold: default_diff_threshold(),
            min_area: default_min_area(),
            blur_sigma: default_blur_sigma(),
            model_weight: default_model_weight(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_mode() -> String {
    "http".into()
}
fn default_fps() -> f64 {
    5.0
}
fn default_resolution() -> String {
    "640x480".into()
}
fn default_port() -> u16 {
    8000
}
fn default_web_root() -> String {
    "web".into()
}
fn default_persist_dir() -> String {
    "imgs".into()
}
fn default_min_interval() -> u64 {
    5
}
fn default_max_interval() -> u64 {
    300
}
fn default_window() -> u64 {
    86400
}
fn default_cull_interval() -> u64 {
    60
}
fn default_detect_interval() -> u64 {
    1
}
fn default_diff_threshold() -> u8 {
    5
}
fn default_min_area() -> u32 {
    500
}
fn default_blur_sigma() -> f32 {
    3.8
}
fn default_model_weight() -> f32 {
    0.5
}
fn default_log_level() -> String {
    "info".into()
}
