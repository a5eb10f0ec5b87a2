use image::ImageFormat;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub input: InputConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    pub path: PathBuf,
    /// Decoder executable, looked up on `PATH` unless absolute.
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub dir: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
}

/// Size and shape thresholds for candidate regions.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_min_contour_area")]
    pub min_contour_area: u32,
    /// Exclusive lower bound on bounding-box width / height.
    #[serde(default = "default_aspect_ratio_min")]
    pub aspect_ratio_min: f64,
    /// Exclusive upper bound on bounding-box width / height.
    #[serde(default = "default_aspect_ratio_max")]
    pub aspect_ratio_max: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    /// Minimum frame-index distance between two saved frames.
    #[serde(default = "default_min_frame_gap")]
    pub min_frame_gap: u64,
    /// Intended cap on saved frames per scene. Reported, not enforced.
    #[serde(default = "default_max_images_per_scene")]
    pub max_images_per_scene: u32,
}

/// Tuning for the per-pixel Gaussian mixture background model.
///
/// Variances are in squared luma units. Thresholds are squared Mahalanobis
/// distances, so `var_threshold = 16` accepts pixels within 4 sigma.
#[derive(Debug, Clone, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default = "default_history")]
    pub history: u32,
    #[serde(default = "default_var_threshold")]
    pub var_threshold: f32,
    #[serde(default = "default_var_threshold_gen")]
    pub var_threshold_gen: f32,
    #[serde(default = "default_var_init")]
    pub var_init: f32,
    #[serde(default = "default_var_min")]
    pub var_min: f32,
    #[serde(default = "default_var_max")]
    pub var_max: f32,
    #[serde(default = "default_max_modes")]
    pub max_modes: usize,
    #[serde(default = "default_background_ratio")]
    pub background_ratio: f32,
    #[serde(default = "default_complexity_reduction")]
    pub complexity_reduction: f32,
    /// Fixed learning rate. When absent the model uses `1 / history`, so an
    /// object has to stay put for a sizeable part of `history` frames before
    /// it fades into the background.
    #[serde(default)]
    pub learning_rate: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_contour_area: default_min_contour_area(),
            aspect_ratio_min: default_aspect_ratio_min(),
            aspect_ratio_max: default_aspect_ratio_max(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_frame_gap: default_min_frame_gap(),
            max_images_per_scene: default_max_images_per_scene(),
        }
    }
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            history: default_history(),
            var_threshold: default_var_threshold(),
            var_threshold_gen: default_var_threshold_gen(),
            var_init: default_var_init(),
            var_min: default_var_min(),
            var_max: default_var_max(),
            max_modes: default_max_modes(),
            background_ratio: default_background_ratio(),
            complexity_reduction: default_complexity_reduction(),
            learning_rate: None,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            pause_poll_ms: default_pause_poll_ms(),
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
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detection;
        if !(d.aspect_ratio_min > 0.0 && d.aspect_ratio_min < d.aspect_ratio_max) {
            return Err(ConfigError::Invalid(format!(
                "aspect ratio bounds must satisfy 0 < min < max, got ({}, {})",
                d.aspect_ratio_min, d.aspect_ratio_max
            )));
        }
        if self.output.image_format().is_none() {
            return Err(ConfigError::Invalid(format!(
                "unsupported output extension {:?}",
                self.output.extension
            )));
        }
        let b = &self.background;
        if b.max_modes == 0 || b.max_modes > u8::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "background.max_modes must be in 1..=255, got {}",
                b.max_modes
            )));
        }
        if b.history == 0 {
            return Err(ConfigError::Invalid("background.history must be positive".into()));
        }
        if !(b.var_min > 0.0 && b.var_min <= b.var_max) {
            return Err(ConfigError::Invalid(format!(
                "background variance bounds must satisfy 0 < var_min <= var_max, got ({}, {})",
                b.var_min, b.var_max
            )));
        }
        if let Some(rate) = b.learning_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::Invalid(format!(
                    "background.learning_rate must be within [0, 1], got {rate}"
                )));
            }
        }
        Ok(())
    }
}

impl OutputConfig {
    /// Encoder format implied by `extension`, if the image crate knows it.
    pub fn image_format(&self) -> Option<ImageFormat> {
        ImageFormat::from_extension(&self.extension).filter(|f| f.writing_enabled())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}
fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}
fn default_extension() -> String {
    "jpg".into()
}
fn default_min_contour_area() -> u32 {
    1500
}
fn default_aspect_ratio_min() -> f64 {
    0.3
}
fn default_aspect_ratio_max() -> f64 {
    0.9
}
fn default_min_frame_gap() -> u64 {
    30
}
fn default_max_images_per_scene() -> u32 {
    5
}
fn default_history() -> u32 {
    500
}
fn default_var_threshold() -> f32 {
    16.0
}
fn default_var_threshold_gen() -> f32 {
    9.0
}
fn default_var_init() -> f32 {
    15.0
}
fn default_var_min() -> f32 {
    4.0
}
fn default_var_max() -> f32 {
    75.0
}
fn default_max_modes() -> usize {
    5
}
fn default_background_ratio() -> f32 {
    0.9
}
fn default_complexity_reduction() -> f32 {
    0.05
}
fn default_pause_poll_ms() -> u64 {
    100
}
fn default_log_level() -> String {
    "info".into()
}
