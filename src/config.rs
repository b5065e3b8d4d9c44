use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AsciiError, Result};

/// x264 presets indexed by compression speed, slowest (best compression) first.
pub const X264_PRESETS: [&str; 10] = ["placebo", "veryslow", "slower", "slow", "medium", "fast", "faster", "veryfast", "superfast", "ultrafast"];

const CONFIG_FILE_STEM: &str = "img2ascii";

/// Maximum number of glyphs across the width and down the height of the output.
///
/// The final grid hits one of the two counts exactly, whichever the source's
/// aspect ratio makes binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleTarget {
    pub horizontal: u32,
    pub vertical: u32,
}

impl ScaleTarget {
    pub fn new(horizontal: u32, vertical: u32) -> Self {
        Self { horizontal, vertical }
    }

    pub fn validate(&self) -> Result<()> {
        if self.horizontal == 0 || self.vertical == 0 {
            return Err(AsciiError::config(format!("character counts must be non-zero, got {}x{}", self.horizontal, self.vertical)));
        }
        Ok(())
    }
}

impl Default for ScaleTarget {
    fn default() -> Self {
        Self::new(100, 100)
    }
}

/// Intensity bounds used when quantizing a pixel to a ramp index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantization {
    pub min_bit: u32,
    pub max_bit: u32,
}

impl Quantization {
    pub fn validate(&self) -> Result<()> {
        if self.min_bit >= self.max_bit {
            return Err(AsciiError::config(format!("min_bit ({}) must be below max_bit ({})", self.min_bit, self.max_bit)));
        }
        Ok(())
    }
}

impl Default for Quantization {
    fn default() -> Self {
        Self { min_bit: 0, max_bit: 256 }
    }
}

/// What the video writer does when the encoder rejects a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FrameErrorPolicy {
    /// Log the failure and drop the frame.
    #[default]
    Skip,
    /// Stop the conversion and return the error.
    Abort,
}

/// Location of the ffmpeg tools used for video decode, encode and muxing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self { ffmpeg: default_ffmpeg(), ffprobe: default_ffprobe() }
    }
}

impl FfmpegConfig {
    pub fn ffmpeg_cmd(&self) -> &Path {
        &self.ffmpeg
    }

    pub fn ffprobe_cmd(&self) -> &Path {
        &self.ffprobe
    }
}

/// Named bundle of grid and rendering settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Preset {
    pub horizontal: u32,
    pub vertical: u32,
    #[serde(default)]
    pub ramp_level: usize,
    #[serde(default = "default_upscale")]
    pub upscale: u32,
}

fn default_upscale() -> u32 {
    1
}

fn default_batch_size() -> usize {
    50
}

fn default_font_size_constant() -> u32 {
    3200
}

fn default_compression_speed() -> u8 {
    2
}

fn default_preset_name() -> String {
    "default".to_string()
}

fn builtin_presets() -> HashMap<String, Preset> {
    HashMap::from([
        ("default".to_string(), Preset { horizontal: 200, vertical: 200, ramp_level: 0, upscale: 1 }),
        ("small".to_string(), Preset { horizontal: 80, vertical: 80, ramp_level: 1, upscale: 1 }),
        ("large".to_string(), Preset { horizontal: 400, vertical: 400, ramp_level: 0, upscale: 2 }),
    ])
}

/// Application configuration loaded from `img2ascii.json` / `img2ascii.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "builtin_presets")]
    pub presets: HashMap<String, Preset>,
    #[serde(default = "default_preset_name")]
    pub default_preset: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_font_size_constant")]
    pub font_size_constant: u32,
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    #[serde(default)]
    pub quantization: Quantization,
    #[serde(default)]
    pub on_frame_error: FrameErrorPolicy,
    #[serde(default = "default_compression_speed")]
    pub compression_speed: u8,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            presets: builtin_presets(),
            default_preset: default_preset_name(),
            batch_size: default_batch_size(),
            font_size_constant: default_font_size_constant(),
            font_path: None,
            quantization: Quantization::default(),
            on_frame_error: FrameErrorPolicy::default(),
            compression_speed: default_compression_speed(),
            ffmpeg: FfmpegConfig::default(),
        }
    }
}

impl AppConfig {
    /// Parse a config file, picking JSON or TOML from its extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| AsciiError::config(format!("reading config {}: {}", path.display(), e)))?;
        let is_toml = path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        let cfg: AppConfig = if is_toml {
            toml::from_str(&text).map_err(|e| AsciiError::config(format!("parsing config toml {}: {}", path.display(), e)))?
        } else {
            serde_json::from_str(&text).map_err(|e| AsciiError::config(format!("parsing config json {}: {}", path.display(), e)))?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `explicit` if given, else the first config found in the user
    /// config directory or the working directory, else the built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::from_file(p);
        }
        for p in Self::search_paths() {
            if p.exists() {
                log::info!("Using config {}", p.display());
                return Self::from_file(&p);
            }
        }
        Ok(Self::default())
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut tried: Vec<PathBuf> = Vec::new();
        if let Some(d) = dirs::config_dir() {
            let d = d.join(CONFIG_FILE_STEM);
            tried.push(d.join(format!("{}.json", CONFIG_FILE_STEM)));
            tried.push(d.join(format!("{}.toml", CONFIG_FILE_STEM)));
        }
        tried.push(PathBuf::from(format!("{}.json", CONFIG_FILE_STEM)));
        tried.push(PathBuf::from(format!("{}.toml", CONFIG_FILE_STEM)));
        tried
    }

    pub fn validate(&self) -> Result<()> {
        if !self.presets.contains_key(&self.default_preset) {
            return Err(AsciiError::config(format!("default preset '{}' is not defined", self.default_preset)));
        }
        self.quantization.validate()?;
        if self.batch_size == 0 {
            return Err(AsciiError::config("batch_size must be at least 1"));
        }
        if usize::from(self.compression_speed) >= X264_PRESETS.len() {
            return Err(AsciiError::config(format!("compression_speed must be 0-9, got {}", self.compression_speed)));
        }
        Ok(())
    }

    pub fn preset(&self, name: &str) -> Option<&Preset> {
        self.presets.get(name)
    }

    /// Conversion options for the named preset, with the rest of this config applied.
    pub fn options_for(&self, preset_name: &str) -> Result<ConversionOptions> {
        let preset = self.preset(preset_name).ok_or_else(|| AsciiError::config(format!("preset '{}' not found", preset_name)))?;
        Ok(ConversionOptions {
            target: ScaleTarget::new(preset.horizontal, preset.vertical),
            ramp_level: preset.ramp_level,
            upscale: preset.upscale,
            quantization: self.quantization,
            font_size_constant: self.font_size_constant,
            font_path: self.font_path.clone(),
            batch_size: self.batch_size,
            on_frame_error: self.on_frame_error,
            compression_speed: self.compression_speed,
            ffmpeg: self.ffmpeg.clone(),
        })
    }
}

/// Everything one conversion session needs, fixed for the length of the run.
#[derive(Debug, Clone)]
pub struct ConversionOptions {
    /// Glyph grid bounds
    pub target: ScaleTarget,
    /// Ramp selector, taken modulo the number of ramps
    pub ramp_level: usize,
    /// Font-size multiplier for the rendered image
    pub upscale: u32,
    pub quantization: Quantization,
    /// Divided by the column count to get the font size
    pub font_size_constant: u32,
    /// Monospace font to render with; system fonts are searched when unset
    pub font_path: Option<PathBuf>,
    /// Frames buffered between encoder flushes
    pub batch_size: usize,
    pub on_frame_error: FrameErrorPolicy,
    /// Index into [`X264_PRESETS`]
    pub compression_speed: u8,
    pub ffmpeg: FfmpegConfig,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            target: ScaleTarget::default(),
            ramp_level: 0,
            upscale: 1,
            quantization: Quantization::default(),
            font_size_constant: default_font_size_constant(),
            font_path: None,
            batch_size: default_batch_size(),
            on_frame_error: FrameErrorPolicy::default(),
            compression_speed: default_compression_speed(),
            ffmpeg: FfmpegConfig::default(),
        }
    }
}

impl ConversionOptions {
    /// Set the glyph grid bounds
    pub fn with_target(mut self, horizontal: u32, vertical: u32) -> Self {
        self.target = ScaleTarget::new(horizontal, vertical);
        self
    }

    /// Select the glyph ramp
    pub fn with_ramp_level(mut self, ramp_level: usize) -> Self {
        self.ramp_level = ramp_level;
        self
    }

    /// Set the font-size multiplier
    pub fn with_upscale(mut self, upscale: u32) -> Self {
        self.upscale = upscale;
        self
    }

    /// Set the intensity bounds
    pub fn with_quantization(mut self, min_bit: u32, max_bit: u32) -> Self {
        self.quantization = Quantization { min_bit, max_bit };
        self
    }

    /// Use a specific font file
    pub fn with_font_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_path = Some(path.into());
        self
    }

    /// Set the encoder flush cadence
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_frame_error_policy(mut self, policy: FrameErrorPolicy) -> Self {
        self.on_frame_error = policy;
        self
    }

    pub fn with_compression_speed(mut self, speed: u8) -> Self {
        self.compression_speed = speed;
        self
    }

    /// Font size in pixels per em: integer `font_size_constant / horizontal`, times `upscale`.
    pub fn font_size(&self) -> u32 {
        (self.font_size_constant / self.target.horizontal.max(1)) * self.upscale
    }

    pub fn x264_preset(&self) -> &'static str {
        X264_PRESETS[usize::from(self.compression_speed).min(X264_PRESETS.len() - 1)]
    }

    pub fn validate(&self) -> Result<()> {
        self.target.validate()?;
        self.quantization.validate()?;
        if self.batch_size == 0 {
            return Err(AsciiError::config("batch_size must be at least 1"));
        }
        if self.upscale == 0 {
            return Err(AsciiError::config("upscale must be at least 1"));
        }
        if self.font_size() == 0 {
            return Err(AsciiError::config(format!(
                "font size rounds to zero: font_size_constant {} is smaller than {} columns",
                self.font_size_constant, self.target.horizontal
            )));
        }
        if usize::from(self.compression_speed) >= X264_PRESETS.len() {
            return Err(AsciiError::config(format!("compression_speed must be 0-9, got {}", self.compression_speed)));
        }
        Ok(())
    }
}
