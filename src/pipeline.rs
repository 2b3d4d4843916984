use crate::audio::{mux, reconcile};
use crate::config::Config;
use crate::duration::plan_slots;
use crate::error::{RenderError, RenderResult};
use crate::probe::{probe, resolve_item};
use crate::progress::{PhaseWeights, ProgressEvent, ProgressReporter};
use crate::tools::ToolLocator;
use crate::types::{JobRequest, JobResult, MediaItem, RenderSettings};
use crate::video::{concatenate, normalize_clip, NormalizedClip};
use crate::workspace::JobWorkspace;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, instrument, warn};

/// Renders slideshow jobs. Holds the resolved media tools, so building one
/// fails up front when ffmpeg or ffprobe is missing.
#[derive(Debug, Clone)]
pub struct Renderer {
    tools: ToolLocator,
    cfg: Config,
}

impl Renderer {
    pub fn new(tools: ToolLocator, cfg: Config) -> Self {
        Self { tools, cfg }
    }

    pub fn from_config(cfg: Config) -> RenderResult<Self> {
        cfg.validate()?;
        let tools = ToolLocator::locate(&cfg)?;
        Ok(Self { tools, cfg })
    }

    pub fn tools(&self) -> &ToolLocator {
        &self.tools
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Run one job end to end. Either the output file exists and is complete,
    /// or an error is returned and nothing the job created is left behind
    /// except untouched inputs.
    #[instrument(skip_all, fields(items = job.items.len(), out = %job.output_path.display()))]
    pub async fn render(
        &self,
        job: &JobRequest,
        progress: Option<UnboundedSender<ProgressEvent>>,
    ) -> RenderResult<JobResult> {
        validate_job(job)?;
        if let Some(parent) = job.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let workspace = JobWorkspace::create(self.cfg.temp_root.as_deref())?;
        let result = self.render_in(job, &workspace, progress).await;

        if let Err(e) = workspace.close() {
            warn!("job workspace cleanup failed: {e}");
        }
        result
    }

    async fn render_in(
        &self,
        job: &JobRequest,
        workspace: &JobWorkspace,
        progress: Option<UnboundedSender<ProgressEvent>>,
    ) -> RenderResult<JobResult> {
        let settings = &job.settings;
        let reporter = ProgressReporter::new(progress, PhaseWeights::for_items(job.items.len()));
        reporter.phase(0, 0.0, "probing");

        let mut items = Vec::with_capacity(job.items.len());
        for entry in &job.items {
            items.push(resolve_item(&self.tools, &entry.path, entry.kind, self.cfg.probe_timeout()).await?);
        }

        let slots = plan_slots(&items, settings);
        info!(total = slots.iter().sum::<f64>(), ?slots, "slots planned");

        let clips = self.normalize_all(&items, &slots, settings, workspace, &reporter).await?;

        let concat_phase = reporter.weights().concat_phase();
        let joined = {
            let r = reporter.clone();
            concatenate(
                &self.tools,
                &self.cfg,
                &clips,
                &workspace.concat_list_path(),
                &workspace.joined_video_path(),
                move |p| r.phase(concat_phase, p, "joining clips"),
            )
            .await?
        };

        let planned: f64 = clips.iter().map(|c| c.duration).sum();
        let video_duration = match probe(&self.tools, &joined, self.cfg.probe_timeout()).await {
            Ok(pr) => pr.duration.unwrap_or(planned),
            Err(e) => return Err(RenderError::Concatenation(format!("joined video is unreadable: {e}"))),
        };

        let plan = reconcile(&self.tools, &self.cfg, video_duration, &job.audio_path).await?;

        let mux_phase = reporter.weights().mux_phase();
        {
            let r = reporter.clone();
            mux(
                &self.tools,
                &self.cfg,
                settings,
                &joined,
                &job.audio_path,
                &plan,
                &job.output_path,
                move |p| r.phase(mux_phase, p, "muxing"),
            )
            .await?;
        }

        info!(duration = plan.effective_duration, mode = ?plan.mode, "render complete");
        reporter.complete();
        Ok(JobResult { output_path: job.output_path.clone(), duration: plan.effective_duration })
    }

    async fn normalize_all(
        &self,
        items: &[MediaItem],
        slots: &[f64],
        settings: &RenderSettings,
        workspace: &JobWorkspace,
        reporter: &ProgressReporter,
    ) -> RenderResult<Vec<NormalizedClip>> {
        let total = items.len();
        run_ordered(total, self.cfg.normalize_concurrency, move |index| {
            let r = reporter.clone();
            let stage = format!("preparing item {}/{}", index + 1, total);
            normalize_clip(
                &self.tools,
                &self.cfg,
                settings,
                &items[index],
                index,
                slots[index],
                workspace.clip_path(index),
                move |p| r.phase(index, p, &stage),
            )
        })
        .await
    }
}

/// Run `task(0..count)` with at most `concurrency` in flight and return the
/// results in index order, whatever order they finish in. The first error
/// wins and drops the rest, which kills their subprocesses.
pub async fn run_ordered<T, F, Fut>(count: usize, concurrency: usize, task: F) -> RenderResult<Vec<T>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = RenderResult<T>>,
{
    stream::iter(0..count)
        .map(task)
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

fn validate_job(job: &JobRequest) -> RenderResult<()> {
    if job.items.is_empty() {
        return Err(RenderError::invalid_job("at least one image or video is required"));
    }
    validate_settings(&job.settings)?;
    if !job.audio_path.is_file() {
        return Err(RenderError::probe(&job.audio_path, "audio file does not exist"));
    }
    if job.output_path.exists() {
        return Err(RenderError::invalid_job(format!(
            "output '{}' already exists",
            job.output_path.display()
        )));
    }
    Ok(())
}

fn validate_settings(s: &RenderSettings) -> RenderResult<()> {
    if s.fps == 0 || s.fps > 120 {
        return Err(RenderError::invalid_job(format!("fps {} is out of range", s.fps)));
    }
    if s.width == 0 || s.height == 0 || s.width % 2 != 0 || s.height % 2 != 0 {
        // yuv420p needs even dimensions
        return Err(RenderError::invalid_job(format!("resolution {}x{} must be even and non-zero", s.width, s.height)));
    }
    // a zero per-item minimum can leave images with an empty slot
    if !(s.per_item_min > 0.0 && s.per_item_min.is_finite()) {
        return Err(RenderError::invalid_job("perItemMin must be a positive number of seconds"));
    }
    if !(s.total_min >= 0.0 && s.total_min.is_finite()) {
        return Err(RenderError::invalid_job("totalMin must be non-negative"));
    }
    if let Some(overlay) = &s.overlay {
        if overlay.width == 0 || !overlay.path.is_file() {
            return Err(RenderError::invalid_job(format!(
                "overlay '{}' is missing or has zero width",
                overlay.path.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobItem;
    use std::path::PathBuf;
    use std::time::Duration;

    #[tokio::test]
    async fn ordered_results_survive_out_of_order_completion() {
        // earlier indices sleep longer so they finish last
        let out = run_ordered(5, 5, |i| async move {
            tokio::time::sleep(Duration::from_millis(10 * (5 - i as u64))).await;
            Ok::<_, RenderError>(i)
        })
        .await
        .unwrap();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn first_failure_aborts_the_batch() {
        let res = run_ordered(4, 1, |i| async move {
            if i == 2 {
                Err(RenderError::clip_encode(format!("/in/{i}.png"), "corrupt"))
            } else {
                Ok(i)
            }
        })
        .await;
        assert!(matches!(res, Err(RenderError::ClipEncode { .. })));
    }

    fn job(dir: &std::path::Path) -> JobRequest {
        let audio = dir.join("song.mp3");
        std::fs::write(&audio, b"not really audio").unwrap();
        JobRequest {
            items: vec![JobItem { path: dir.join("a.png"), kind: None }],
            audio_path: audio,
            settings: RenderSettings::default(),
            output_path: dir.join("out.mp4"),
        }
    }

    #[test]
    fn job_validation() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_job(&job(dir.path())).is_ok());

        let mut empty = job(dir.path());
        empty.items.clear();
        assert!(matches!(validate_job(&empty), Err(RenderError::InvalidJob(_))));

        let mut odd = job(dir.path());
        odd.settings.width = 1081;
        assert!(validate_job(&odd).is_err());

        let mut instant = job(dir.path());
        instant.settings.per_item_min = 0.0;
        instant.settings.total_min = 0.0;
        assert!(matches!(validate_job(&instant), Err(RenderError::InvalidJob(_))));
        instant.settings.total_min = 30.0;
        assert!(matches!(validate_job(&instant), Err(RenderError::InvalidJob(_))));

        let mut no_audio = job(dir.path());
        no_audio.audio_path = PathBuf::from("/nope/song.mp3");
        assert!(matches!(validate_job(&no_audio), Err(RenderError::Probe { .. })));

        let existing = job(dir.path());
        std::fs::write(&existing.output_path, b"someone else's video").unwrap();
        assert!(matches!(validate_job(&existing), Err(RenderError::InvalidJob(_))));
    }

    #[tokio::test]
    async fn failed_job_cleans_its_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let temp_root = dir.path().join("scratch");
        let cfg = Config { temp_root: Some(temp_root.clone()), ..Config::default() };
        let renderer = Renderer::new(ToolLocator::from_paths("/nope/ffmpeg", "/nope/ffprobe"), cfg);

        let mut req = job(dir.path());
        req.items = vec![JobItem { path: dir.path().join("missing.mp4"), kind: Some(crate::types::MediaKind::Video) }];
        let err = renderer.render(&req, None).await.unwrap_err();
        assert!(matches!(err, RenderError::Probe { .. }));
        assert_eq!(std::fs::read_dir(&temp_root).unwrap().count(), 0);
        assert!(!req.output_path.exists());
    }

    // Shell stand-ins for the media tools. Every ffmpeg call appends its
    // output path to `ffmpeg.log`; `arms` are extra `case` branches matched
    // on that path before the output is written.
    #[cfg(unix)]
    fn stub_tools(dir: &std::path::Path, arms: &str) -> ToolLocator {
        use std::os::unix::fs::PermissionsExt;
        let write_script = |name: &str, body: String| {
            let path = dir.join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };
        let log = dir.join("ffmpeg.log");
        let ffmpeg = write_script(
            "ffmpeg",
            format!(
                "#!/bin/sh\nfor a in \"$@\"; do last=\"$a\"; done\necho \"$last\" >> '{}'\ncase \"$last\" in\n{arms}\nesac\nprintf stub > \"$last\"\n",
                log.display()
            ),
        );
        let ffprobe = write_script(
            "ffprobe",
            concat!(
                "#!/bin/sh\n",
                "echo '{\"format\":{\"duration\":\"3.000\"},\"streams\":[",
                "{\"codec_type\":\"video\",\"width\":1080,\"height\":1920},",
                "{\"codec_type\":\"audio\",\"codec_name\":\"aac\"}]}'\n"
            )
            .to_string(),
        );
        ToolLocator::from_paths(ffmpeg, ffprobe)
    }

    #[cfg(unix)]
    fn stub_renderer(dir: &std::path::Path, arms: &str) -> Renderer {
        let cfg = Config { temp_root: Some(dir.join("scratch")), ..Config::default() };
        Renderer::new(stub_tools(dir, arms), cfg)
    }

    #[cfg(unix)]
    fn photo_job(dir: &std::path::Path, photos: usize) -> JobRequest {
        let items = (0..photos)
            .map(|i| {
                let path = dir.join(format!("photo_{i}.png"));
                image::RgbImage::new(40, 30).save(&path).unwrap();
                JobItem { path, kind: None }
            })
            .collect();
        let audio = dir.join("song.m4a");
        std::fs::write(&audio, b"stub audio").unwrap();
        JobRequest {
            items,
            audio_path: audio,
            settings: RenderSettings { per_item_min: 1.0, total_min: 1.0, ..RenderSettings::default() },
            output_path: dir.join("out").join("final.mp4"),
        }
    }

    #[cfg(unix)]
    fn listing(dir: &std::path::Path) -> Vec<String> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.map(|e| e.unwrap().file_name().to_string_lossy().into_owned()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_jobs_never_share_an_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = stub_renderer(dir.path(), "");
        let req = photo_job(dir.path(), 2);

        let (a, b) = tokio::join!(renderer.render(&req, None), renderer.render(&req, None));
        assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(err, RenderError::InvalidJob(_)), "{err}");

        assert_eq!(listing(&dir.path().join("out")), vec!["final.mp4".to_string()]);
        assert!(listing(&dir.path().join("scratch")).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_job_leaves_no_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = stub_renderer(dir.path(), "*.partial.mp4) sleep 10 ;;");
        let req = photo_job(dir.path(), 1);

        let res = tokio::time::timeout(Duration::from_millis(1500), renderer.render(&req, None)).await;
        assert!(res.is_err(), "job should still be muxing");

        let log = std::fs::read_to_string(dir.path().join("ffmpeg.log")).unwrap();
        assert!(log.contains(".partial.mp4"), "{log}");
        assert!(listing(&dir.path().join("out")).is_empty());
        assert!(listing(&dir.path().join("scratch")).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_third_clip_removes_the_clips_already_written() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = stub_renderer(dir.path(), "*clip_0002.mp4) echo 'corrupt frame' >&2; exit 1 ;;");
        let req = photo_job(dir.path(), 3);

        let err = renderer.render(&req, None).await.unwrap_err();
        match &err {
            RenderError::ClipEncode { path, reason } => {
                assert_eq!(path, &req.items[2].path);
                assert!(reason.contains("corrupt frame"), "{reason}");
            }
            other => panic!("expected ClipEncode, got {other:?}"),
        }

        let log = std::fs::read_to_string(dir.path().join("ffmpeg.log")).unwrap();
        assert!(log.contains("clip_0000.mp4") && log.contains("clip_0001.mp4"), "{log}");
        assert!(listing(&dir.path().join("scratch")).is_empty());
        assert!(!req.output_path.exists());
    }
}
