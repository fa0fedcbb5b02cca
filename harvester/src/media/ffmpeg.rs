use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{EdgeFrames, FrameExtractor};
use crate::config::MediaConfig;
use crate::error::{HarvestError, Result};

/// Seconds before the end of the clip where the last-frame search starts.
const TAIL_SEEK_SEC: &str = "-3";

pub struct FfmpegExtractor {
    ffmpeg: PathBuf,
    timeout: Duration,
    slots: Arc<Semaphore>,
}

impl FfmpegExtractor {
    pub fn new(config: &MediaConfig, max_parallel: usize) -> Self {
        Self {
            ffmpeg: PathBuf::from(&config.ffmpeg_path),
            timeout: Duration::from_secs(config.ffmpeg_timeout_sec),
            slots: Arc::new(Semaphore::new(max_parallel)),
        }
    }

    /// Runs ffmpeg and returns its stdout. The child is killed when the
    /// timeout fires.
    async fn run(&self, args: Vec<OsString>) -> Result<Vec<u8>> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| HarvestError::Cancelled)?;

        let child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HarvestError::FrameExtract(format!("failed to start ffmpeg: {}", e)))?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(HarvestError::FrameExtract(format!(
                        "ffmpeg exited with {}: {}",
                        output.status,
                        stderr.trim()
                    )));
                }
                Ok(output.stdout)
            }
            Ok(Err(e)) => Err(HarvestError::FrameExtract(format!("ffmpeg failed: {}", e))),
            Err(_) => {
                warn!(timeout_sec = self.timeout.as_secs(), "ffmpeg timeout, process killed");
                Err(HarvestError::FrameExtract(format!(
                    "ffmpeg timeout ({}s)",
                    self.timeout.as_secs()
                )))
            }
        }
    }

    async fn frame(&self, args: Vec<OsString>, which: &str, clip: &Path) -> Option<Vec<u8>> {
        match self.run(args).await {
            Ok(jpeg) if !jpeg.is_empty() => Some(jpeg),
            Ok(_) => {
                warn!(clip = %clip.display(), which, "ffmpeg produced no frame");
                None
            }
            Err(e) => {
                warn!(clip = %clip.display(), which, "Frame extraction failed: {}", e);
                None
            }
        }
    }
}

fn first_frame_args(clip: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-v".into(), "error".into(), "-i".into()];
    args.push(clip.as_os_str().to_owned());
    args.extend(
        ["-frames:v", "1", "-f", "image2pipe", "-vcodec", "mjpeg", "-"]
            .iter()
            .map(OsString::from),
    );
    args
}

fn last_frame_args(clip: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-v".into(),
        "error".into(),
        "-sseof".into(),
        TAIL_SEEK_SEC.into(),
        "-i".into(),
    ];
    args.push(clip.as_os_str().to_owned());
    args.extend(
        ["-vf", "reverse", "-frames:v", "1", "-f", "image2pipe", "-vcodec", "mjpeg", "-"]
            .iter()
            .map(OsString::from),
    );
    args
}

/// Body of a concat-demuxer list file.
fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|p| format!("file '{}'\n", p.display().to_string().replace('\'', "'\\''")))
        .collect()
}

#[async_trait]
impl FrameExtractor for FfmpegExtractor {
    async fn edge_frames(&self, clip: &Path) -> Result<EdgeFrames> {
        if !tokio::fs::try_exists(clip).await.unwrap_or(false) {
            return Err(HarvestError::FrameExtract(format!("clip not found: {}", clip.display())));
        }
        let (first, last) = tokio::join!(
            self.frame(first_frame_args(clip), "first", clip),
            self.frame(last_frame_args(clip), "last", clip),
        );
        let frames = EdgeFrames { first, last };
        if frames.is_empty() {
            return Err(HarvestError::FrameExtract(format!("no decodable frames in {}", clip.display())));
        }
        debug!(clip = %clip.display(), "Edge frames extracted");
        Ok(frames)
    }

    async fn concat(&self, parts: &[PathBuf], dest: &Path) -> Result<()> {
        if parts.len() == 1 {
            tokio::fs::copy(&parts[0], dest).await?;
            return Ok(());
        }
        let list = dest.with_extension("concat.txt");
        tokio::fs::write(&list, concat_list(parts)).await?;

        let args: Vec<OsString> = vec![
            "-v".into(),
            "error".into(),
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list.as_os_str().to_owned(),
            "-c".into(),
            "copy".into(),
            dest.as_os_str().to_owned(),
        ];
        let result = self.run(args).await.map(|_| ());
        if let Err(e) = tokio::fs::remove_file(&list).await {
            warn!(list = %list.display(), "Failed to remove concat list: {}", e);
        }
        result
    }
}
