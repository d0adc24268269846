//! Screenshots written to disk, one file per instance per invocation.
use crate::frame::Screenshot;

use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("save {path}: {source}")]
pub struct ArtifactError {
    path: PathBuf,
    source: image::ImageError,
}

#[derive(Debug, Clone)]
pub struct Artifacts {
    dir: PathBuf,
    pid: u32,
    viewer: Option<String>,
}

impl Artifacts {
    pub fn new<P: Into<PathBuf>>(dir: P, viewer: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            pid: std::process::id(),
            viewer,
        }
    }

    /// `<dir>/vnctest<index>-pid<our pid>.png`, stable across rounds, distinct
    /// between concurrent invocations.
    pub fn path_for(&self, index: usize) -> PathBuf {
        self.dir
            .join(format!("vnctest{:03}-pid{}.png", index, self.pid))
    }

    pub fn persist(&self, index: usize, shot: &Screenshot) -> Result<PathBuf, ArtifactError> {
        let path = self.path_for(index);
        image::save_buffer(
            &path,
            shot.as_raw(),
            shot.width(),
            shot.height(),
            image::ColorType::Rgba8,
        )
        .map_err(|source| ArtifactError {
            path: path.clone(),
            source,
        })?;
        if let Some(viewer) = self.viewer.as_ref() {
            open_viewer(viewer, &path);
        }
        Ok(path)
    }
}

/// Runs `<viewer> <path>` through the shell, failures are only logged.
fn open_viewer(viewer: &str, path: &Path) {
    let status = Command::new("sh")
        .arg("-c")
        .arg(format!("{} \"$0\"", viewer))
        .arg(path)
        .stdin(Stdio::null())
        .status();
    match status {
        Ok(s) if !s.success() => log::debug!("viewer '{}' exited with {}", viewer, s),
        Err(e) => log::debug!("failed to run viewer '{}': {}", viewer, e),
        _ => (),
    }
}
