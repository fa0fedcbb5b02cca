//! Contract over the upstream CMS: session, telemetry queries, video tasks.

pub mod client;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use harvest_common::{OnlineDevice, RawAlarm, TrackSample, VideoFileInfo};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use client::CmsClient;

/// `result` of a finished download task.
pub const RESULT_DOWNLOAD_DONE: i64 = 11;
/// `result` returned when the recorder is not reachable.
pub const RESULT_DEVICE_OFFLINE: i64 = 32;
/// Business codes after which the same query is re-issued.
pub const RESULT_RETRY: [i64; 2] = [22, 24];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmsSession {
    pub token: String,
}

#[async_trait]
pub trait CmsApi: Send + Sync {
    async fn login(&self) -> Result<CmsSession>;

    async fn online_devices(&self, session: &CmsSession) -> Result<Vec<OnlineDevice>>;

    /// All pages of track samples for `[t0, t1]`.
    async fn tracks(
        &self,
        session: &CmsSession,
        dev: &str,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
    ) -> Result<Vec<TrackSample>>;

    /// All pages of alarms for `[t0, t1]`.
    async fn alarms(
        &self,
        session: &CmsSession,
        dev: &str,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
    ) -> Result<Vec<RawAlarm>>;

    /// Recordings of one channel overlapping `[sec0, sec1]` of `date`.
    async fn video_files(
        &self,
        session: &CmsSession,
        dev: &str,
        channel: u8,
        date: NaiveDate,
        sec0: u32,
        sec1: u32,
    ) -> Result<Vec<VideoFileInfo>>;

    /// Polls a download task until the server-side path (`dph`) is ready.
    async fn download(
        &self,
        session: &CmsSession,
        dev: &str,
        task_url: &str,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Streams a finished download to `dest`. Returns the byte count.
    async fn fetch_file(&self, session: &CmsSession, dev: &str, dph: &str, dest: &Path) -> Result<u64>;
}
