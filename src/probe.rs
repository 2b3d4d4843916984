use crate::error::{RenderError, RenderResult};
use crate::tools::ToolLocator;
use crate::types::{MediaItem, MediaKind};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub duration: Option<f64>,    // Length in seconds (None if unknown)
    pub width: Option<u32>,       // Video width in pixels (None if no video)
    pub height: Option<u32>,      // Video height in pixels (None if no video)
    pub fps: Option<f64>,         // Frames per second (None if no video/unknown)
    pub audio: bool,              // True if file has audio track
    pub video: bool,              // True if file has video track
    pub audio_codec: Option<String>,
    pub rotation: i32,            // display rotation in degrees; width/height are already rotated
}

/// Analyze one media file with ffprobe. Read-only; never retried.
pub async fn probe(tools: &ToolLocator, input: &Path, limit: Duration) -> RenderResult<ProbeResult> {
    if !input.is_file() {
        return Err(RenderError::probe(input, "file does not exist or is not readable"));
    }

    let args: Vec<OsString> = vec![
        "-v".into(), "error".into(),              // Only show errors
        "-print_format".into(), "json".into(),
        "-show_streams".into(),
        "-show_format".into(),
        input.as_os_str().to_os_string(),
    ];

    let stdout = tools
        .run_ffprobe(&args, limit)
        .await
        .map_err(|e| e.into_render_error("ffprobe", "probe", |msg| RenderError::probe(input, msg)))?;

    let result = parse_probe_json(&stdout).map_err(|msg| RenderError::probe(input, msg))?;
    debug!(path = %input.display(), ?result, "probed");
    Ok(result)
}

pub fn parse_probe_json(stdout: &[u8]) -> Result<ProbeResult, String> {
    let v: serde_json::Value = serde_json::from_slice(stdout).map_err(|e| format!("unreadable ffprobe output: {e}"))?;

    // container level first, stream level as fallback
    let mut duration = v.get("format")
        .and_then(|f| f.get("duration"))
        .and_then(|d| d.as_str())
        .and_then(|s| s.parse::<f64>().ok());

    let mut out = ProbeResult::default();

    if let Some(arr) = v.get("streams").and_then(|s| s.as_array()) {
        for st in arr {
            match st.get("codec_type").and_then(|x| x.as_str()) {
                // first video stream wins; cover art in audio files shows up as a second one
                Some("video") if !out.video => {
                    out.video = true;
                    let coded_w = st.get("width").and_then(|x| x.as_u64()).map(|x| x as u32);
                    let coded_h = st.get("height").and_then(|x| x.as_u64()).map(|x| x as u32);
                    out.rotation = stream_rotation(st);
                    (out.width, out.height) = display_size(coded_w, coded_h, sample_aspect(st), out.rotation);
                    if let Some(fr) = st.get("avg_frame_rate").and_then(|x| x.as_str()) {
                        out.fps = parse_fps(fr);
                    }
                    if duration.is_none() {
                        duration = st.get("duration")
                            .and_then(|x| x.as_str())
                            .and_then(|s| s.parse::<f64>().ok());
                    }
                }
                Some("audio") if !out.audio => {
                    out.audio = true;
                    out.audio_codec = st.get("codec_name").and_then(|x| x.as_str()).map(str::to_string);
                    if duration.is_none() {
                        duration = st.get("duration")
                            .and_then(|x| x.as_str())
                            .and_then(|s| s.parse::<f64>().ok());
                    }
                }
                _ => {}
            }
        }
    }

    if !out.video && !out.audio {
        return Err("no decodable audio or video stream".into());
    }
    out.duration = duration.filter(|d| d.is_finite() && *d > 0.0);
    Ok(out)
}

// Display-matrix rotation (newer ffprobe) or the legacy `rotate` tag.
fn stream_rotation(st: &serde_json::Value) -> i32 {
    let from_side_data = st
        .get("side_data_list")
        .and_then(|l| l.as_array())
        .and_then(|l| l.iter().find_map(|sd| sd.get("rotation").and_then(|r| r.as_f64())));
    let from_tag = || {
        st.get("tags")
            .and_then(|t| t.get("rotate"))
            .and_then(|r| r.as_str())
            .and_then(|r| r.trim().parse::<f64>().ok())
    };
    from_side_data.or_else(from_tag).map(|r| r.round() as i32).unwrap_or(0)
}

fn sample_aspect(st: &serde_json::Value) -> Option<(u32, u32)> {
    let sar = st.get("sample_aspect_ratio").and_then(|x| x.as_str())?;
    let (num, den) = sar.split_once(':')?;
    let (num, den): (u32, u32) = (num.parse().ok()?, den.parse().ok()?);
    (num > 0 && den > 0).then_some((num, den))
}

// Size of the frame as ffmpeg hands it to the filter chain: non-square
// pixels stretched to square, then auto-rotated.
fn display_size(
    width: Option<u32>,
    height: Option<u32>,
    sar: Option<(u32, u32)>,
    rotation: i32,
) -> (Option<u32>, Option<u32>) {
    let (Some(mut w), Some(h)) = (width, height) else {
        return (width, height);
    };
    if let Some((num, den)) = sar {
        if num != den {
            w = ((w as f64 * num as f64 / den as f64).round() as u32).max(1);
        }
    }
    if rotation.rem_euclid(180) == 90 {
        (Some(h), Some(w))
    } else {
        (Some(w), Some(h))
    }
}

// ffmpeg reports frame rates as fractions ("30000/1001") or decimals
fn parse_fps(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 || num == 0.0 { return None; }
        Some(num / den)
    } else {
        s.parse().ok().filter(|f: &f64| *f > 0.0)
    }
}

/// Guess image vs video from the file name.
pub fn infer_kind(path: &Path) -> Option<MediaKind> {
    let mime = mime_guess::from_path(path).first()?;
    if mime.type_() == mime_guess::mime::IMAGE {
        Some(MediaKind::Image)
    } else if mime.type_() == mime_guess::mime::VIDEO {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// Turn an uploaded path into a fully described MediaItem.
pub async fn resolve_item(
    tools: &ToolLocator,
    path: &Path,
    declared: Option<MediaKind>,
    limit: Duration,
) -> RenderResult<MediaItem> {
    let kind = declared
        .or_else(|| infer_kind(path))
        .ok_or_else(|| RenderError::probe(path, "cannot tell whether this is an image or a video"))?;

    match kind {
        MediaKind::Image => {
            // header read is enough for the still formats the image crate knows
            if let Ok((width, height)) = image::image_dimensions(path) {
                if width > 0 && height > 0 {
                    return Ok(MediaItem { path: path.to_path_buf(), kind, width, height, duration: None });
                }
            }
            let pr = probe(tools, path, limit).await?;
            let (width, height) = dimensions(&pr).ok_or_else(|| RenderError::probe(path, "image has no dimensions"))?;
            Ok(MediaItem { path: path.to_path_buf(), kind, width, height, duration: None })
        }
        MediaKind::Video => {
            let pr = probe(tools, path, limit).await?;
            if !pr.video {
                return Err(RenderError::probe(path, "no video stream"));
            }
            let (width, height) = dimensions(&pr).ok_or_else(|| RenderError::probe(path, "video has no dimensions"))?;
            let duration = pr.duration.ok_or_else(|| RenderError::probe(path, "video duration is unknown"))?;
            Ok(MediaItem { path: path.to_path_buf(), kind, width, height, duration: Some(duration) })
        }
    }
}

fn dimensions(pr: &ProbeResult) -> Option<(u32, u32)> {
    match (pr.width, pr.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
        _ => None,
    }
}

/// Upload-time check that videos are not over-long. Without a prober this
/// degrades to a warning instead of refusing the upload.
pub async fn validate_upload(
    tools: Option<&ToolLocator>,
    path: &Path,
    max_video_secs: f64,
    limit: Duration,
) -> RenderResult<Option<MediaKind>> {
    let kind = infer_kind(path);
    if kind != Some(MediaKind::Video) {
        return Ok(kind);
    }
    let Some(tools) = tools else {
        warn!(path = %path.display(), "ffprobe unavailable, skipping video duration check");
        return Ok(kind);
    };
    let pr = probe(tools, path, limit).await?;
    if let Some(d) = pr.duration {
        if d > max_video_secs {
            return Err(RenderError::probe(
                path,
                format!("video is {d:.1}s long, the limit is {max_video_secs:.0}s"),
            ));
        }
    }
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SAMPLE: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080,
             "avg_frame_rate": "30000/1001", "duration": "12.000"},
            {"codec_type": "audio", "codec_name": "aac", "duration": "11.98"}
        ],
        "format": {"duration": "12.034"}
    }"#;

    #[test]
    fn parses_streams_and_format_duration() {
        let pr = parse_probe_json(SAMPLE.as_bytes()).unwrap();
        assert!(pr.video && pr.audio);
        assert_eq!((pr.width, pr.height), (Some(1920), Some(1080)));
        assert!((pr.fps.unwrap() - 29.97).abs() < 0.01);
        assert_eq!(pr.duration, Some(12.034));
        assert_eq!(pr.audio_codec.as_deref(), Some("aac"));
    }

    #[test]
    fn portrait_phone_clip_reports_display_size() {
        let json = r#"{"streams":[{"codec_type":"video","width":1920,"height":1080,
            "side_data_list":[{"side_data_type":"Display Matrix","rotation":-90}]}],
            "format":{"duration":"8.0"}}"#;
        let pr = parse_probe_json(json.as_bytes()).unwrap();
        assert_eq!(pr.rotation, -90);
        assert_eq!((pr.width, pr.height), (Some(1080), Some(1920)));
        let lb = crate::letterbox::letterbox(pr.width.unwrap(), pr.height.unwrap(), 1080, 1920);
        assert_eq!((lb.width, lb.height, lb.left, lb.top), (1080, 1920, 0, 0));

        let legacy = r#"{"streams":[{"codec_type":"video","width":1280,"height":720,
            "tags":{"rotate":"270"}}],"format":{}}"#;
        let pr = parse_probe_json(legacy.as_bytes()).unwrap();
        assert_eq!((pr.width, pr.height), (Some(720), Some(1280)));

        let upside_down = r#"{"streams":[{"codec_type":"video","width":1280,"height":720,
            "side_data_list":[{"rotation":180}]}],"format":{}}"#;
        let pr = parse_probe_json(upside_down.as_bytes()).unwrap();
        assert_eq!((pr.width, pr.height), (Some(1280), Some(720)));
    }

    #[test]
    fn anamorphic_pixels_are_squared() {
        let json = r#"{"streams":[{"codec_type":"video","width":720,"height":576,
            "sample_aspect_ratio":"16:15"}],"format":{}}"#;
        let pr = parse_probe_json(json.as_bytes()).unwrap();
        assert_eq!((pr.width, pr.height), (Some(768), Some(576)));

        let unknown = r#"{"streams":[{"codec_type":"video","width":640,"height":480,
            "sample_aspect_ratio":"0:1"}],"format":{}}"#;
        let pr = parse_probe_json(unknown.as_bytes()).unwrap();
        assert_eq!((pr.width, pr.height), (Some(640), Some(480)));
    }

    #[test]
    fn falls_back_to_stream_duration() {
        let json = r#"{"streams":[{"codec_type":"audio","codec_name":"mp3","duration":"15.5"}],"format":{}}"#;
        let pr = parse_probe_json(json.as_bytes()).unwrap();
        assert!(pr.audio && !pr.video);
        assert_eq!(pr.duration, Some(15.5));
    }

    #[test]
    fn rejects_files_without_streams() {
        assert!(parse_probe_json(br#"{"streams":[],"format":{"duration":"1.0"}}"#).is_err());
        assert!(parse_probe_json(b"not json").is_err());
    }

    #[test]
    fn fps_parsing() {
        assert_eq!(parse_fps("25/1"), Some(25.0));
        assert_eq!(parse_fps("0/0"), None);
        assert_eq!(parse_fps("29.97"), Some(29.97));
        assert_eq!(parse_fps("garbage"), None);
    }

    #[test]
    fn kind_inference_by_extension() {
        assert_eq!(infer_kind(Path::new("/u/a.JPG")), Some(MediaKind::Image));
        assert_eq!(infer_kind(Path::new("/u/a.png")), Some(MediaKind::Image));
        assert_eq!(infer_kind(Path::new("/u/clip.mp4")), Some(MediaKind::Video));
        assert_eq!(infer_kind(Path::new("/u/clip.mov")), Some(MediaKind::Video));
        assert_eq!(infer_kind(Path::new("/u/song.mp3")), None);
        assert_eq!(infer_kind(Path::new("/u/noext")), None);
    }

    #[tokio::test]
    async fn missing_file_is_a_probe_error() {
        let tools = ToolLocator::from_paths("ffmpeg", "ffprobe");
        let err = probe(&tools, Path::new("/nope/missing.mp4"), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RenderError::Probe { .. }));
    }

    #[tokio::test]
    async fn image_dimensions_come_from_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        image::RgbImage::new(30, 20).save(&path).unwrap();

        // ffprobe is never reached for a readable png
        let tools = ToolLocator::from_paths("/nope/ffmpeg", "/nope/ffprobe");
        let item = resolve_item(&tools, &path, None, Duration::from_secs(1)).await.unwrap();
        assert_eq!(item.kind, MediaKind::Image);
        assert_eq!((item.width, item.height), (30, 20));
        assert_eq!(item.path, PathBuf::from(&path));
    }

    #[tokio::test]
    async fn upload_validation_degrades_without_prober() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.mp4");
        std::fs::write(&path, b"whatever").unwrap();
        let kind = validate_upload(None, &path, 1.0, Duration::from_secs(1)).await.unwrap();
        assert_eq!(kind, Some(MediaKind::Video));
    }
}
