use crate::error::RenderResult;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Scratch directory owned by exactly one render job. Everything the job
/// writes before the final mux lives here, and the whole tree is removed
/// when the workspace is closed or dropped, whichever way the job ends.
pub struct JobWorkspace {
    dir: Option<TempDir>,
}

impl JobWorkspace {
    pub fn create(root: Option<&Path>) -> RenderResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("slidecast-job-");
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        debug!(dir = %dir.path().display(), "job workspace created");
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        self.dir.as_ref().map(TempDir::path).unwrap_or_else(|| Path::new(""))
    }

    pub fn clip_path(&self, index: usize) -> PathBuf {
        self.path().join(format!("clip_{index:04}.mp4"))
    }

    pub fn concat_list_path(&self) -> PathBuf {
        self.path().join("concat.txt")
    }

    pub fn joined_video_path(&self) -> PathBuf {
        self.path().join("joined.mp4")
    }

    /// Remove the directory now and surface any error.
    pub fn close(mut self) -> RenderResult<()> {
        if let Some(dir) = self.dir.take() {
            dir.close()?;
        }
        Ok(())
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(dir = %path.display(), "failed to remove job workspace: {e}");
            }
        }
    }
}
