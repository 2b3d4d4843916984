use crate::config::Config;
use crate::error::{FailureKind, RenderError, RenderResult};
use crate::letterbox::letterbox;
use crate::pipeline::Renderer;
use crate::probe::{probe, validate_upload};
use crate::progress::ProgressEvent;
use crate::tools::ToolLocator;
use crate::types::JobRequest;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug)]
pub struct RpcRequest {
    #[serde(default)]                  // a fresh id is assigned when the caller sends none
    pub id: String,                    // Unique identifier to match requests with responses
    pub method: String,                // "render", "probe", "letterbox" or "validateUpload"
    #[serde(default)]                  // If params is missing in JSON, use default (empty JSON object)
    pub params: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RpcResponse<T> {
    pub id: String,     // Same ID as the request
    pub result: T,
}

#[derive(Serialize, Debug)]
pub struct RpcError {
    pub id: String,              // Same ID as the request that failed
    pub error: String,           // Human-readable error message
    pub kind: FailureKind,       // bad upload vs. internal failure
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RpcEvent {
    // Progress for long operations (0.0 to 1.0 completion)
    Progress {
        id: String,
        status: String,   // stage label ("preparing item 2/3", "muxing", ...)
        progress: f32,
    },
    Log {
        id: String,
        message: String,
    },
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl RpcEvent {
    pub fn from_progress(id: &str, ev: &ProgressEvent) -> Self {
        RpcEvent::Progress { id: id.into(), status: ev.stage.clone(), progress: ev.percent / 100.0 }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PathParams {
    path: PathBuf,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct LetterboxParams {
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RenderParams {
    #[serde(flatten)]
    job: JobRequest,
    #[serde(default)]
    config: Option<serde_json::Value>, // partial Config overriding the process config
}

/// Everything a request handler needs. The renderer is absent when the media
/// tools could not be found; methods that do not encode keep working.
pub struct Service {
    pub config: Config,
    pub renderer: Option<Renderer>,
    pub prober: Option<ToolLocator>,
}

impl Service {
    pub fn new(config: Config) -> Self {
        let renderer = match Renderer::from_config(config.clone()) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!("rendering disabled: {e}");
                None
            }
        };
        let prober = ToolLocator::for_probing(&config);
        Self { config, renderer, prober }
    }

    fn renderer(&self) -> RenderResult<&Renderer> {
        self.renderer.as_ref().ok_or_else(|| RenderError::ToolUnavailable {
            tool: "ffmpeg",
            reason: "ffmpeg/ffprobe were not found at startup".into(),
        })
    }

    /// Handle one request. Progress and log lines go through `emit` while the
    /// request runs; the return value becomes the response line.
    pub async fn handle(&self, req: &RpcRequest, mut emit: impl FnMut(RpcEvent)) -> RenderResult<serde_json::Value> {
        match req.method.as_str() {
            "letterbox" => {
                let p: LetterboxParams = parse_params(&req.params)?;
                Ok(to_value(&letterbox(p.src_w, p.src_h, p.dst_w, p.dst_h))?)
            }
            "probe" => {
                let p: PathParams = parse_params(&req.params)?;
                let prober = self.prober.as_ref().ok_or_else(|| RenderError::ToolUnavailable {
                    tool: "ffprobe",
                    reason: "ffprobe was not found at startup".into(),
                })?;
                emit(RpcEvent::Progress { id: req.id.clone(), status: "Probing…".into(), progress: 0.05 });
                let pr = probe(prober, &p.path, self.config.probe_timeout()).await?;
                emit(RpcEvent::Progress { id: req.id.clone(), status: "Probe complete".into(), progress: 1.0 });
                Ok(to_value(&pr)?)
            }
            "validateUpload" => {
                let p: PathParams = parse_params(&req.params)?;
                if self.prober.is_none() {
                    emit(RpcEvent::Log { id: req.id.clone(), message: "ffprobe unavailable, duration check skipped".into() });
                }
                let kind = validate_upload(
                    self.prober.as_ref(),
                    &p.path,
                    self.config.max_upload_video_secs,
                    self.config.probe_timeout(),
                )
                .await?;
                Ok(serde_json::json!({ "kind": kind }))
            }
            "render" => {
                let p: RenderParams = parse_params(&req.params)?;
                let base = self.renderer()?;
                let renderer = match &p.config {
                    Some(overrides) => Renderer::new(base.tools().clone(), base.config().merged_with(overrides)?),
                    None => base.clone(),
                };

                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
                let job = renderer.render(&p.job, Some(tx));
                tokio::pin!(job);
                let result = loop {
                    tokio::select! {
                        Some(ev) = rx.recv() => emit(RpcEvent::from_progress(&req.id, &ev)),
                        res = &mut job => break res,
                    }
                };
                // events sent right before the job finished
                while let Ok(ev) = rx.try_recv() {
                    emit(RpcEvent::from_progress(&req.id, &ev));
                }
                let result = result?;
                emit(RpcEvent::Log {
                    id: req.id.clone(),
                    message: format!("rendered {:.1}s to {}", result.duration, result.output_path.display()),
                });
                Ok(to_value(&result)?)
            }
            other => Err(RenderError::invalid_job(format!("unknown method '{other}'"))),
        }
    }
}

/// Answer JSON-line requests from `input` on `out` until `input` closes.
/// Requests run concurrently; finished ones are reaped as new lines arrive
/// and the rest are awaited before returning.
pub async fn serve<R>(service: Arc<Service>, input: R, out: UnboundedSender<String>) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut jobs = JoinSet::new();
    while let Some(line) = lines.next_line().await? {
        while jobs.try_join_next().is_some() {}
        if line.trim().is_empty() {
            continue;
        }
        let mut req: RpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                let err = RenderError::invalid_job(format!("malformed request: {e}"));
                send(&out, &RpcError { id: String::new(), error: err.to_string(), kind: err.kind() });
                continue;
            }
        };
        if req.id.is_empty() {
            req.id = new_id();
        }

        let service = Arc::clone(&service);
        let out = out.clone();
        jobs.spawn(async move {
            let events = out.clone();
            let emit = move |ev: RpcEvent| send(&events, &ev);
            match service.handle(&req, emit).await {
                Ok(result) => send(&out, &RpcResponse { id: req.id.clone(), result }),
                Err(e) => {
                    tracing::error!(id = %req.id, method = %req.method, "{e}");
                    send(&out, &RpcError { id: req.id.clone(), error: e.to_string(), kind: e.kind() });
                }
            }
        });
    }

    while jobs.join_next().await.is_some() {}
    Ok(())
}

fn send<T: Serialize>(tx: &UnboundedSender<String>, msg: &T) {
    match serde_json::to_string(msg) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => tracing::warn!("dropping unserializable message: {e}"),
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: &serde_json::Value) -> RenderResult<T> {
    serde_json::from_value(params.clone()).map_err(|e| RenderError::invalid_job(format!("bad params: {e}")))
}

fn to_value<T: Serialize>(v: &T) -> RenderResult<serde_json::Value> {
    serde_json::to_value(v).map_err(|e| RenderError::invalid_job(format!("unserializable result: {e}")))
}
