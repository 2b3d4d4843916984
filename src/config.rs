use crate::error::{RenderError, RenderResult};
use hex_color::HexColor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide settings for tool lookup, subprocess budgets and encoder knobs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub ffmpeg_path: Option<PathBuf>,   // explicit binary, otherwise looked up on PATH
    pub ffprobe_path: Option<PathBuf>,
    pub temp_root: Option<PathBuf>,     // parent of per-job scratch dirs (default: OS temp)
    pub probe_timeout_secs: u64,
    pub encode_timeout_secs: u64,
    pub crf: u32,
    pub preset: String,
    pub audio_bitrate: String,
    pub pad_color: String,              // letterbox bars, "#RRGGBB"
    pub normalize_concurrency: usize,
    pub max_upload_video_secs: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            temp_root: None,
            probe_timeout_secs: 30,
            encode_timeout_secs: 600,
            crf: 20,
            preset: "veryfast".to_string(),
            audio_bitrate: "192k".to_string(),
            pad_color: "#000000".to_string(),
            normalize_concurrency: 1,
            max_upload_video_secs: 120.0,
        }
    }
}

impl Config {
    /// Defaults overridden by `SLIDECAST_*` environment variables.
    pub fn from_env() -> RenderResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RenderResult<Self> {
        let mut cfg = Config::default();
        if let Some(v) = lookup("SLIDECAST_FFMPEG") {
            cfg.ffmpeg_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SLIDECAST_FFPROBE") {
            cfg.ffprobe_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SLIDECAST_TEMP_DIR") {
            cfg.temp_root = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SLIDECAST_PROBE_TIMEOUT") {
            cfg.probe_timeout_secs = parse_number("SLIDECAST_PROBE_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("SLIDECAST_ENCODE_TIMEOUT") {
            cfg.encode_timeout_secs = parse_number("SLIDECAST_ENCODE_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("SLIDECAST_CONCURRENCY") {
            cfg.normalize_concurrency = parse_number("SLIDECAST_CONCURRENCY", &v)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> RenderResult<()> {
        if self.probe_timeout_secs == 0 || self.encode_timeout_secs == 0 {
            return Err(RenderError::invalid_job("timeouts must be non-zero"));
        }
        if self.normalize_concurrency == 0 {
            return Err(RenderError::invalid_job("normalizeConcurrency must be at least 1"));
        }
        if self.crf > 51 {
            return Err(RenderError::invalid_job(format!("crf {} is outside 0..=51", self.crf)));
        }
        self.ffmpeg_pad_color()?;
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn encode_timeout(&self) -> Duration {
        Duration::from_secs(self.encode_timeout_secs)
    }

    /// Pad color in ffmpeg's `0xRRGGBB` notation.
    pub fn ffmpeg_pad_color(&self) -> RenderResult<String> {
        let color = HexColor::parse(&self.pad_color)
            .map_err(|e| RenderError::invalid_job(format!("padColor '{}': {}", self.pad_color, e)))?;
        Ok(format!("0x{:02X}{:02X}{:02X}", color.r, color.g, color.b))
    }

    /// Overlay a partial JSON object (camelCase keys) on top of this config.
    pub fn merged_with(&self, overrides: &serde_json::Value) -> RenderResult<Self> {
        let mut base = serde_json::to_value(self)
            .map_err(|e| RenderError::invalid_job(format!("config: {e}")))?;
        if let (Some(base_map), Some(over_map)) = (base.as_object_mut(), overrides.as_object()) {
            for (k, v) in over_map {
                base_map.insert(k.clone(), v.clone());
            }
        }
        let merged: Config = serde_json::from_value(base)
            .map_err(|e| RenderError::invalid_job(format!("config: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> RenderResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RenderError::invalid_job(format!("{key}={value} is not a valid number")))
}
