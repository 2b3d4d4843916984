use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

pub type RenderResult<T> = Result<T, RenderError>;

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("probe failed for '{}': {reason}", .path.display())]
    Probe { path: PathBuf, reason: String },

    #[error("clip encode failed for '{}': {reason}", .path.display())]
    ClipEncode { path: PathBuf, reason: String },

    #[error("concatenation failed: {0}")]
    Concatenation(String),

    #[error("mux failed: {0}")]
    Mux(String),

    #[error("{tool} is not available: {reason}")]
    ToolUnavailable { tool: &'static str, reason: String },

    #[error("{stage} exceeded {}s and was killed", .limit.as_secs())]
    Timeout { stage: String, limit: Duration },

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Whether the caller should ask the user to fix their upload or report an
/// internal failure.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    InvalidInput,
    System,
}

impl RenderError {
    pub fn probe(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Probe { path: path.into(), reason: reason.into() }
    }

    pub fn clip_encode(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ClipEncode { path: path.into(), reason: reason.into() }
    }

    pub fn invalid_job(msg: impl Into<String>) -> Self {
        Self::InvalidJob(msg.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Probe { .. } | Self::ClipEncode { .. } | Self::InvalidJob(_) => FailureKind::InvalidInput,
            Self::Concatenation(_)
            | Self::Mux(_)
            | Self::ToolUnavailable { .. }
            | Self::Timeout { .. }
            | Self::Io(_) => FailureKind::System,
        }
    }
}

/// Outcome of one failed subprocess run, before it is attributed to a stage.
#[derive(Debug)]
pub enum ToolError {
    Spawn(std::io::Error),
    TimedOut(Duration),
    Failed { status: String, tail: String },
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to start: {e}"),
            Self::TimedOut(limit) => write!(f, "timed out after {}s", limit.as_secs()),
            Self::Failed { status, tail } if tail.is_empty() => write!(f, "exited with {status}"),
            Self::Failed { status, tail } => write!(f, "exited with {status}:\n{tail}"),
        }
    }
}

impl ToolError {
    /// Attribute the failure to a pipeline stage. Timeouts and a vanished
    /// binary keep their own variants; everything else goes through `wrap`.
    pub fn into_render_error(
        self,
        tool: &'static str,
        stage: impl Into<String>,
        wrap: impl FnOnce(String) -> RenderError,
    ) -> RenderError {
        match self {
            Self::TimedOut(limit) => RenderError::Timeout { stage: stage.into(), limit },
            Self::Spawn(e) if e.kind() == std::io::ErrorKind::NotFound => {
                RenderError::ToolUnavailable { tool, reason: e.to_string() }
            }
            other => wrap(other.to_string()),
        }
    }
}
