//! In-process fakes of the external collaborators.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use harvest_common::{OnlineDevice, RawAlarm, TrackSample, VideoFileInfo};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cms::{CmsApi, CmsSession};
use crate::error::{HarvestError, Result};
use crate::media::{EdgeFrames, FrameExtractor};
use crate::recognition::Recognizer;

#[derive(Debug, Clone)]
pub enum TaskBehavior {
    Ready(String),
    Offline,
    /// Never finishes; only cancellation ends the poll.
    Hang,
}

#[derive(Default)]
pub struct FakeCms {
    pub tracks: Mutex<Vec<TrackSample>>,
    pub alarms: Mutex<Vec<RawAlarm>>,
    pub online: Mutex<Vec<OnlineDevice>>,
    /// Files returned per channel, regardless of window.
    pub files: Mutex<HashMap<u8, Vec<VideoFileInfo>>>,
    /// Minimum window width (seconds) before files are returned.
    pub files_min_width: Mutex<u32>,
    pub tasks: Mutex<HashMap<String, TaskBehavior>>,
    pub track_windows: Mutex<Vec<(NaiveDateTime, NaiveDateTime)>>,
    pub video_queries: Mutex<Vec<(u8, u32, u32)>>,
    pub logins: AtomicUsize,
    pub fail_login: AtomicBool,
}

impl FakeCms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracks(self, tracks: Vec<TrackSample>) -> Self {
        *self.tracks.lock().unwrap() = tracks;
        self
    }

    pub fn add_video(&self, channel: u8, task_url: &str, behavior: TaskBehavior) {
        self.files
            .lock()
            .unwrap()
            .entry(channel)
            .or_default()
            .push(VideoFileInfo {
                down_task_url: Some(task_url.to_string()),
                chn: Some(channel as i64),
                ..Default::default()
            });
        self.tasks.lock().unwrap().insert(task_url.to_string(), behavior);
    }

    pub fn windows(&self) -> Vec<(NaiveDateTime, NaiveDateTime)> {
        self.track_windows.lock().unwrap().clone()
    }
}

#[async_trait]
impl CmsApi for FakeCms {
    async fn login(&self) -> Result<CmsSession> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if self.fail_login.load(Ordering::SeqCst) {
            return Err(HarvestError::CmsAuth("rejected".into()));
        }
        Ok(CmsSession { token: "token".into() })
    }

    async fn online_devices(&self, _session: &CmsSession) -> Result<Vec<OnlineDevice>> {
        Ok(self.online.lock().unwrap().clone())
    }

    async fn tracks(
        &self,
        _session: &CmsSession,
        _dev: &str,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
    ) -> Result<Vec<TrackSample>> {
        self.track_windows.lock().unwrap().push((t0, t1));
        Ok(self
            .tracks
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.timestamp().map_or(false, |t| t >= t0 && t <= t1))
            .cloned()
            .collect())
    }

    async fn alarms(
        &self,
        _session: &CmsSession,
        _dev: &str,
        _t0: NaiveDateTime,
        _t1: NaiveDateTime,
    ) -> Result<Vec<RawAlarm>> {
        Ok(self.alarms.lock().unwrap().clone())
    }

    async fn video_files(
        &self,
        _session: &CmsSession,
        _dev: &str,
        channel: u8,
        _date: NaiveDate,
        sec0: u32,
        sec1: u32,
    ) -> Result<Vec<VideoFileInfo>> {
        self.video_queries.lock().unwrap().push((channel, sec0, sec1));
        if sec1.saturating_sub(sec0) < *self.files_min_width.lock().unwrap() {
            return Ok(vec![]);
        }
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(&channel)
            .cloned()
            .unwrap_or_default())
    }

    async fn download(
        &self,
        _session: &CmsSession,
        dev: &str,
        task_url: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let behavior = self.tasks.lock().unwrap().get(task_url).cloned();
        match behavior {
            Some(TaskBehavior::Ready(dph)) => Ok(dph),
            Some(TaskBehavior::Offline) => Err(HarvestError::DeviceOffline(dev.to_string())),
            Some(TaskBehavior::Hang) => {
                cancel.cancelled().await;
                Err(HarvestError::Cancelled)
            }
            None => Err(HarvestError::CmsApi {
                code: 404,
                message: format!("unknown task {}", task_url),
            }),
        }
    }

    async fn fetch_file(&self, _session: &CmsSession, _dev: &str, dph: &str, dest: &Path) -> Result<u64> {
        let body = format!("clip:{}", dph);
        tokio::fs::write(dest, body.as_bytes()).await?;
        Ok(body.len() as u64)
    }
}

/// Returns fixed JPEG bytes derived from the clip contents.
#[derive(Default)]
pub struct FakeExtractor {
    pub calls: AtomicUsize,
    pub concats: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl FrameExtractor for FakeExtractor {
    async fn edge_frames(&self, clip: &Path) -> Result<EdgeFrames> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(HarvestError::FrameExtract("undecodable".into()));
        }
        let body = tokio::fs::read(clip).await?;
        let mut first = b"first:".to_vec();
        first.extend_from_slice(&body);
        let mut last = b"last:".to_vec();
        last.extend_from_slice(&body);
        Ok(EdgeFrames {
            first: Some(first),
            last: Some(last),
        })
    }

    async fn concat(&self, parts: &[PathBuf], dest: &Path) -> Result<()> {
        self.concats.fetch_add(1, Ordering::SeqCst);
        let mut joined = Vec::new();
        for part in parts {
            joined.extend(tokio::fs::read(part).await?);
        }
        tokio::fs::write(dest, joined).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingRecognizer {
    pub submitted: Mutex<Vec<String>>,
}

impl Recognizer for CountingRecognizer {
    fn submit(&self, interest_name: &str) {
        self.submitted.lock().unwrap().push(interest_name.to_string());
    }
}
