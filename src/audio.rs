use crate::config::Config;
use crate::error::{RenderError, RenderResult};
use crate::probe::{infer_kind, probe};
use crate::tools::ToolLocator;
use crate::types::{MediaKind, Overlay, RenderSettings};
use crate::video::encoder_args;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::info;

/// Audio and video lengths closer than this are treated as equal.
pub const DURATION_TOLERANCE_SECS: f64 = 0.05;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReconcileMode {
    Trim,
    Loop,
    Passthrough,
}

/// How the soundtrack is conformed to the video. The video length always
/// wins; audio is cut or repeated to match it, never the other way round.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilePlan {
    pub mode: ReconcileMode,
    pub effective_duration: f64, // final output length, always the video length
    pub audio_duration: f64,
    pub plays: u32,              // how many times the track is heard, partially or fully
}

pub fn plan_audio(video_duration: f64, audio_duration: f64) -> ReconcilePlan {
    let mode = if (audio_duration - video_duration).abs() <= DURATION_TOLERANCE_SECS {
        ReconcileMode::Passthrough
    } else if audio_duration > video_duration {
        ReconcileMode::Trim
    } else {
        ReconcileMode::Loop
    };
    let plays = match mode {
        ReconcileMode::Loop => (video_duration / audio_duration).ceil() as u32,
        _ => 1,
    };
    ReconcilePlan { mode, effective_duration: video_duration, audio_duration, plays }
}

/// Probe the soundtrack and decide between trim, loop and passthrough.
pub async fn reconcile(
    tools: &ToolLocator,
    cfg: &Config,
    video_duration: f64,
    audio_path: &Path,
) -> RenderResult<ReconcilePlan> {
    let pr = probe(tools, audio_path, cfg.probe_timeout()).await?;
    if !pr.audio {
        return Err(RenderError::probe(audio_path, "no audio stream"));
    }
    let audio_duration = pr
        .duration
        .ok_or_else(|| RenderError::probe(audio_path, "audio duration is unknown"))?;

    let plan = plan_audio(video_duration, audio_duration);
    info!(video_duration, audio_duration, mode = ?plan.mode, plays = plan.plays, "audio reconciled");
    Ok(plan)
}

// Input options that keep an avatar running for as long as the main video.
fn overlay_input_args(path: &Path) -> Vec<OsString> {
    let is_gif = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("gif"))
        .unwrap_or(false);
    let opts: &[&str] = if is_gif {
        &["-ignore_loop", "0"]
    } else if infer_kind(path) == Some(MediaKind::Image) {
        &["-loop", "1"]
    } else {
        &["-stream_loop", "-1"]
    };
    let mut args: Vec<OsString> = opts.iter().map(OsString::from).collect();
    args.push("-i".into());
    args.push(path.as_os_str().to_os_string());
    args
}

pub fn overlay_filter(overlay: &Overlay) -> String {
    format!(
        "[2:v]scale={}:-2[avatar];[0:v][avatar]overlay={}:{}:shortest=1:eof_action=pass,format=yuv420p[v]",
        overlay.width, overlay.x, overlay.y
    )
}

/// ffmpeg arguments for the final container. The video is stream-copied
/// unless an overlay forces a re-encode; audio is always AAC.
pub fn mux_args(
    video: &Path,
    audio: &Path,
    plan: &ReconcilePlan,
    settings: &RenderSettings,
    cfg: &Config,
    out: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-i".into(), video.as_os_str().to_os_string()];

    if plan.mode == ReconcileMode::Loop {
        args.extend(["-stream_loop", "-1"].map(OsString::from));
    }
    args.push("-i".into());
    args.push(audio.as_os_str().to_os_string());

    match &settings.overlay {
        Some(overlay) => {
            args.extend(overlay_input_args(&overlay.path));
            args.push("-filter_complex".into());
            args.push(overlay_filter(overlay).into());
            args.extend(["-map", "[v]", "-map", "1:a:0"].map(OsString::from));
            args.extend(encoder_args(cfg, settings.fps));
            args.extend(["-r".to_string(), settings.fps.to_string()].map(OsString::from));
        }
        None => {
            args.extend(["-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy"].map(OsString::from));
        }
    }

    args.extend(["-c:a", "aac", "-b:a", cfg.audio_bitrate.as_str()].map(OsString::from));

    // hard cap; for loops this also absorbs overshoot at the loop boundary
    if plan.mode != ReconcileMode::Passthrough {
        args.push("-t".into());
        args.push(format!("{:.3}", plan.effective_duration).into());
    }

    args.extend(["-movflags", "+faststart"].map(OsString::from));
    args.push(out.as_os_str().to_os_string());
    args
}

/// Write the final MP4. ffmpeg writes to a hidden sibling first; the sibling
/// is deleted when dropped, so an error or a cancelled job leaves nothing
/// behind, and it is only linked under the requested name if that name is
/// still free.
pub async fn mux(
    tools: &ToolLocator,
    cfg: &Config,
    settings: &RenderSettings,
    video: &Path,
    audio: &Path,
    plan: &ReconcilePlan,
    out: &Path,
    on_progress: impl FnMut(f32),
) -> RenderResult<PathBuf> {
    let partial = partial_output(out)?;
    let args = mux_args(video, audio, plan, settings, cfg, &partial);

    info!(out = %out.display(), mode = ?plan.mode, overlay = settings.overlay.is_some(), "muxing");
    tools
        .run_ffmpeg(&args, cfg.encode_timeout(), Some(plan.effective_duration), on_progress)
        .await
        .map_err(|e| e.into_render_error("ffmpeg", "mux", RenderError::Mux))?;

    partial.persist_noclobber(out).map_err(|e| {
        if e.error.kind() == io::ErrorKind::AlreadyExists {
            RenderError::invalid_job(format!("output '{}' already exists", out.display()))
        } else {
            RenderError::Mux(format!("could not move output into place: {}", e.error))
        }
    })?;
    Ok(out.to_path_buf())
}

fn partial_output(out: &Path) -> RenderResult<TempPath> {
    let dir = match out.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = out
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.mp4".to_string());
    let file = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".partial.mp4")
        .tempfile_in(dir)?;
    Ok(file.into_temp_path())
}
