//! Slideshow video renderer: turns an ordered list of photos and clips plus a
//! soundtrack into a single 1080x1920 H.264/AAC MP4 by driving ffmpeg.
//!
//! The video track always decides the final length. Audio is trimmed, looped
//! or passed through to match it (see [`audio::plan_audio`]).

pub mod audio;
pub mod config;
pub mod duration;
pub mod error;
pub mod letterbox;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod rpc;
pub mod tools;
pub mod types;
pub mod video;
pub mod workspace;

pub use config::Config;
pub use error::{FailureKind, RenderError, RenderResult};
pub use letterbox::{letterbox, Letterbox};
pub use pipeline::Renderer;
pub use progress::ProgressEvent;
pub use types::{JobItem, JobRequest, JobResult, MediaItem, MediaKind, Overlay, RenderSettings};
