//! Clip post-processing: edge-frame extraction and multi-file joins.

pub mod ffmpeg;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub use ffmpeg::FfmpegExtractor;

/// JPEG bytes of the first and last decodable frames of a clip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeFrames {
    pub first: Option<Vec<u8>>,
    pub last: Option<Vec<u8>>,
}

impl EdgeFrames {
    pub fn is_empty(&self) -> bool {
        self.first.is_none() && self.last.is_none()
    }
}

#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// Never leaves files behind; fails only when the clip cannot be read at all.
    async fn edge_frames(&self, clip: &Path) -> Result<EdgeFrames>;

    /// Joins `parts` (in order) into `dest` without re-encoding.
    async fn concat(&self, parts: &[PathBuf], dest: &Path) -> Result<()>;
}
