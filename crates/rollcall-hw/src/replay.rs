//! Frame source backed by a directory of still images.
//!
//! Frames are served in file-name order, converted to grayscale. Useful for
//! running the engine without a camera.

use image::GrayImage;
use rollcall_core::FrameSource;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("cannot read frame directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot decode frame {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
}

pub struct ReplaySource {
    pending: VecDeque<PathBuf>,
    released: bool,
}

impl ReplaySource {
    pub fn from_dir(dir: &Path) -> Result<Self, ReplayError> {
        let io_err = |source| ReplayError::Directory {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            let hidden = path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(true);
            if path.is_file() && !hidden {
                paths.push(path);
            }
        }
        paths.sort();
        tracing::info!(dir = %dir.display(), frames = paths.len(), "replay source opened");
        Ok(Self::from_paths(paths))
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            pending: paths.into(),
            released: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl FrameSource for ReplaySource {
    type Error = ReplayError;

    fn next_frame(&mut self) -> Result<Option<GrayImage>, ReplayError> {
        if self.released {
            return Ok(None);
        }
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        let image = image::open(&path).map_err(|source| ReplayError::Decode {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(frame = %path.display(), "replaying frame");
        Ok(Some(image.to_luma8()))
    }

    fn release(&mut self) {
        self.released = true;
        self.pending.clear();
    }
}
