use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Fixed output frame size. Every job renders at exactly this resolution.
pub const TARGET_WIDTH: u32 = 1080;
pub const TARGET_HEIGHT: u32 = 1920;

pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_PER_ITEM_MIN_SECS: f64 = 10.0;
pub const DEFAULT_TOTAL_MIN_SECS: f64 = 30.0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MediaKind {
    Image,
    Video,
}

/// One resolved input file. Built once by the prober and never mutated.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub path: PathBuf,
    pub kind: MediaKind,
    pub width: u32,
    pub height: u32,
    pub duration: Option<f64>, // natural length in seconds, videos only
}

/// Avatar placed on top of the final frame, in output pixel coordinates.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Overlay {
    pub path: PathBuf,
    pub x: i32,
    pub y: i32,
    pub width: u32, // avatar is scaled to this width, height follows its aspect
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderSettings {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub requested_duration: Option<f64>, // advisory, see duration::compute_duration
    pub per_item_min: f64,
    pub total_min: f64,
    pub overlay: Option<Overlay>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            width: TARGET_WIDTH,
            height: TARGET_HEIGHT,
            requested_duration: None,
            per_item_min: DEFAULT_PER_ITEM_MIN_SECS,
            total_min: DEFAULT_TOTAL_MIN_SECS,
            overlay: None,
        }
    }
}

/// Input entry as it arrives from the upload layer; the kind may be omitted
/// and is then inferred from the file name.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JobItem {
    pub path: PathBuf,
    #[serde(default)]
    pub kind: Option<MediaKind>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub items: Vec<JobItem>,
    pub audio_path: PathBuf,
    #[serde(default)]
    pub settings: RenderSettings,
    pub output_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub output_path: PathBuf,
    pub duration: f64,
}
