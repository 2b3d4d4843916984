use crate::config::Config;
use crate::error::{RenderError, RenderResult, ToolError};
use regex::Regex;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tracing::{debug, warn};
use which::which;

const STDERR_TAIL_LINES: usize = 20;

/// Resolved media binaries. Built once at startup and handed to the pipeline;
/// every ffmpeg/ffprobe invocation in the crate goes through here.
#[derive(Debug, Clone)]
pub struct ToolLocator {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl ToolLocator {
    pub fn locate(cfg: &Config) -> RenderResult<Self> {
        let ffmpeg = resolve_binary("ffmpeg", cfg.ffmpeg_path.as_deref())?;
        let ffprobe = resolve_binary("ffprobe", cfg.ffprobe_path.as_deref())?;
        debug!(ffmpeg = %ffmpeg.display(), ffprobe = %ffprobe.display(), "media tools resolved");
        Ok(Self { ffmpeg, ffprobe })
    }

    pub fn from_paths(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self { ffmpeg: ffmpeg.into(), ffprobe: ffprobe.into() }
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }

    pub fn ffprobe(&self) -> &Path {
        &self.ffprobe
    }

    /// Run ffprobe and return its stdout.
    pub async fn run_ffprobe(&self, args: &[OsString], limit: Duration) -> Result<Vec<u8>, ToolError> {
        let mut cmd = TokioCommand::new(&self.ffprobe);
        cmd.args(args)
           .stdin(Stdio::null())
           .stdout(Stdio::piped())
           .stderr(Stdio::piped())
           .kill_on_drop(true);

        let child = cmd.spawn().map_err(ToolError::Spawn)?;
        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(res) => res.map_err(ToolError::Spawn)?,
            // dropping the future drops the child, kill_on_drop reaps it
            Err(_) => return Err(ToolError::TimedOut(limit)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolError::Failed { status: output.status.to_string(), tail: tail_of(&stderr) });
        }
        Ok(output.stdout)
    }

    /// Run one ffmpeg process to completion. `expected_secs` is the output
    /// length used to turn ffmpeg's progress stream into a 0-100 value fed to
    /// `on_progress`; raw tool output never leaves this function.
    pub async fn run_ffmpeg(
        &self,
        args: &[OsString],
        limit: Duration,
        expected_secs: Option<f64>,
        mut on_progress: impl FnMut(f32),
    ) -> Result<(), ToolError> {
        let mut cmd = TokioCommand::new(&self.ffmpeg);
        cmd.arg("-hide_banner")
           .arg("-nostdin")
           .arg("-y")
           .arg("-progress").arg("pipe:1")
           .arg("-nostats")
           .args(args)
           .stdin(Stdio::null())
           .stdout(Stdio::piped())
           .stderr(Stdio::piped())
           .kill_on_drop(true);

        debug!(args = ?args, "spawning ffmpeg");
        let mut child = cmd.spawn().map_err(ToolError::Spawn)?;

        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(collect_tail(stderr)));
        let stdout = child.stdout.take();

        let run = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let (Some(secs), Some(total)) = (parse_out_time(&line), expected_secs) {
                        if total > 0.0 {
                            on_progress(((secs / total) * 100.0).clamp(0.0, 100.0) as f32);
                        }
                    }
                }
            }
            child.wait().await
        };

        let outcome = tokio::time::timeout(limit, run).await;
        let status = match outcome {
            Ok(res) => res.map_err(ToolError::Spawn)?,
            Err(_) => {
                kill_hard(&mut child).await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return Err(ToolError::TimedOut(limit));
            }
        };

        let tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(ToolError::Failed { status: status.to_string(), tail });
        }
        on_progress(100.0);
        Ok(())
    }

    /// Locator for callers that only need ffprobe and can live without it
    /// (upload validation). ffmpeg is not required here; if it is missing,
    /// any attempt to run it fails as ToolUnavailable.
    pub fn for_probing(cfg: &Config) -> Option<Self> {
        let ffprobe = match resolve_binary("ffprobe", cfg.ffprobe_path.as_deref()) {
            Ok(path) => path,
            Err(e) => {
                warn!("{e}; duration checks will be skipped");
                return None;
            }
        };
        let ffmpeg = resolve_binary("ffmpeg", cfg.ffmpeg_path.as_deref()).unwrap_or_else(|_| PathBuf::from("ffmpeg"));
        Some(Self { ffmpeg, ffprobe })
    }
}

fn resolve_binary(name: &'static str, explicit: Option<&Path>) -> RenderResult<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(RenderError::ToolUnavailable {
            tool: name,
            reason: format!("configured path '{}' is not a file", path.display()),
        });
    }
    which(name).map_err(|e| RenderError::ToolUnavailable { tool: name, reason: e.to_string() })
}

async fn kill_hard(child: &mut Child) {
    // SIGKILL on unix; encoders do not reliably honor SIGTERM
    if let Err(e) = child.kill().await {
        warn!("failed to kill timed out process: {e}");
    }
}

async fn collect_tail(stream: impl AsyncRead + Unpin) -> String {
    let mut tail = LineTail::new(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tail.push(&line);
    }
    tail.joined()
}

fn tail_of(text: &str) -> String {
    let mut tail = LineTail::new(STDERR_TAIL_LINES);
    for line in text.lines() {
        tail.push(line);
    }
    tail.joined()
}

/// Last `max` non-empty lines of a stream.
struct LineTail {
    max: usize,
    lines: VecDeque<String>,
}

impl LineTail {
    fn new(max: usize) -> Self {
        Self { max, lines: VecDeque::with_capacity(max) }
    }

    fn push(&mut self, line: &str) {
        let line = line.trim_end();
        if line.is_empty() || self.max == 0 {
            return;
        }
        if self.lines.len() == self.max {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn joined(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

// `-progress` emits key=value lines; out_time_ms is (despite the name) in
// microseconds, same as out_time_us.
fn parse_out_time(line: &str) -> Option<f64> {
    static OUT_TIME: OnceLock<Regex> = OnceLock::new();
    let re = OUT_TIME.get_or_init(|| Regex::new(r"^out_time_(?:us|ms)=(\d+)$").expect("static regex"));
    let caps = re.captures(line.trim())?;
    let micros: u64 = caps.get(1)?.as_str().parse().ok()?;
    Some(micros as f64 / 1_000_000.0)
}
