use crate::config::Config;
use crate::error::{RenderError, RenderResult};
use crate::letterbox::letterbox;
use crate::tools::ToolLocator;
use crate::types::{MediaItem, MediaKind, RenderSettings};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Silent, letterboxed, fixed-size intermediate produced for one input item.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedClip {
    pub index: usize,
    pub path: PathBuf,
    pub duration: f64,
}

/// Escape a path for an ffmpeg concat list entry (`file '...'`).
pub fn escape_concat_path(path: &Path) -> String {
    // single quotes close the quoted string, emit an escaped quote, reopen
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

fn clip_duration(item: &MediaItem, slot: f64) -> f64 {
    match item.kind {
        MediaKind::Image => slot,
        MediaKind::Video => item.duration.map_or(slot, |d| d.min(slot)),
    }
}

fn secs(value: f64) -> String {
    format!("{value:.3}")
}

/// libx264 arguments shared by every clip so the stream-copy join sees
/// identical parameters.
pub fn encoder_args(cfg: &Config, fps: u32) -> Vec<OsString> {
    let gop = (fps * 2).to_string();
    let crf = cfg.crf.to_string();
    [
        "-c:v", "libx264",
        "-preset", cfg.preset.as_str(),
        "-crf", crf.as_str(),
        "-profile:v", "high",
        "-g", gop.as_str(),                    // keyframe every two seconds
        "-pix_fmt", "yuv420p",                 // Broad compatibility
        "-color_range", "tv",
        "-colorspace", "bt709",
        "-color_primaries", "bt709",
        "-color_trc", "bt709",
        "-video_track_timescale", "90000",
    ]
    .into_iter()
    .map(OsString::from)
    .collect()
}

/// Full ffmpeg argument list that turns `item` into a clip of `slot` seconds.
/// Images are looped for the slot; videos are cut at `slot` but never looped.
pub fn normalize_args(
    item: &MediaItem,
    slot: f64,
    settings: &RenderSettings,
    cfg: &Config,
    pad_color: &str,
    out: &Path,
) -> Vec<OsString> {
    let fps = settings.fps.to_string();
    let lb = letterbox(item.width, item.height, settings.width, settings.height);
    let vf = format!("{},format=yuv420p", lb.filter(settings.width, settings.height, pad_color));

    let duration = clip_duration(item, slot);

    let mut args: Vec<OsString> = Vec::new();
    if item.kind == MediaKind::Image {
        args.extend(["-loop", "1", "-framerate", fps.as_str()].map(OsString::from));
    }
    args.push("-t".into());
    args.push(secs(duration).into());
    args.push("-i".into());
    args.push(item.path.as_os_str().to_os_string());

    args.extend(["-vf", vf.as_str(), "-r", fps.as_str(), "-an"].map(OsString::from));
    args.extend(encoder_args(cfg, settings.fps));
    if item.kind == MediaKind::Image {
        args.extend(["-tune", "stillimage"].map(OsString::from));
    }
    args.push("-t".into());
    args.push(secs(duration).into());
    args.push(out.as_os_str().to_os_string());
    args
}

pub async fn normalize_clip(
    tools: &ToolLocator,
    cfg: &Config,
    settings: &RenderSettings,
    item: &MediaItem,
    index: usize,
    slot: f64,
    out: PathBuf,
    on_progress: impl FnMut(f32),
) -> RenderResult<NormalizedClip> {
    let pad_color = cfg.ffmpeg_pad_color()?;
    let args = normalize_args(item, slot, settings, cfg, &pad_color, &out);
    let duration = clip_duration(item, slot);

    debug!(index, path = %item.path.display(), kind = ?item.kind, duration, "normalizing clip");
    tools
        .run_ffmpeg(&args, cfg.encode_timeout(), Some(duration), on_progress)
        .await
        .map_err(|e| {
            e.into_render_error("ffmpeg", format!("normalize clip {index}"), |msg| {
                RenderError::clip_encode(&item.path, msg)
            })
        })?;

    Ok(NormalizedClip { index, path: out, duration })
}

pub fn concat_list(clips: &[NormalizedClip]) -> String {
    let mut list = String::with_capacity(clips.len() * 64);
    for clip in clips {
        list.push_str("file ");
        list.push_str(&escape_concat_path(&clip.path));
        list.push('\n');
    }
    list
}

pub fn concat_args(list: &Path, out: &Path) -> Vec<OsString> {
    let mut args = Vec::from(["-f", "concat", "-safe", "0", "-i"].map(OsString::from));
    args.push(list.as_os_str().to_os_string());
    args.extend(["-map", "0:v:0", "-c", "copy", "-an"].map(OsString::from));
    args.push(out.as_os_str().to_os_string());
    args
}

/// Join clips in the given order with a stream copy. On failure the partial
/// output is removed.
pub async fn concatenate(
    tools: &ToolLocator,
    cfg: &Config,
    clips: &[NormalizedClip],
    list_path: &Path,
    out: &Path,
    on_progress: impl FnMut(f32),
) -> RenderResult<PathBuf> {
    if clips.is_empty() {
        return Err(RenderError::Concatenation("no clips to join".into()));
    }
    tokio::fs::write(list_path, concat_list(clips)).await?;

    let total: f64 = clips.iter().map(|c| c.duration).sum();
    info!(clips = clips.len(), total, "joining clips");

    let res = tools
        .run_ffmpeg(&concat_args(list_path, out), cfg.encode_timeout(), Some(total), on_progress)
        .await;
    if let Err(e) = res {
        let _ = tokio::fs::remove_file(out).await;
        return Err(e.into_render_error("ffmpeg", "concat", RenderError::Concatenation));
    }
    Ok(out.to_path_buf())
}
