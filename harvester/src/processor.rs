//! Harvests one interest: video per channel, edge frames, report, completion.

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use harvest_common::utils::{date_label, format_duration, format_local, generate_unique_id, haversine_m, parse_geo};
use harvest_common::{Interest, VideoFileInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cms::{CmsApi, CmsSession};
use crate::config::HarvesterConfig;
use crate::error::{HarvestError, Result};
use crate::media::FrameExtractor;
use crate::recognition::Recognizer;
use crate::retry::{retry_cancellable, Backoff, RetryConfig};
use crate::state_store::StateStore;
use crate::storage::{join, CloudStorage};

/// Last second of a day, upper bound of every video search window.
const LAST_SECOND_OF_DAY: u32 = 86_399;

const BEFORE_PICS: &str = "before_pics";
const AFTER_PICS: &str = "after_pics";
const REPORT_FILE: &str = "report.json";
const REPORTS_LOG: &str = "reports.txt";

/// One pending interest of one recorder, as handed out by the scheduler.
#[derive(Debug, Clone)]
pub struct InterestTask {
    pub reg_id: String,
    /// Channel whose full clip is kept next to the frames.
    pub primary_channel: u8,
    pub interest: Interest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestOutcome {
    /// Dropped at an ignore point.
    Ignored,
    Completed,
}

#[async_trait]
pub trait InterestHandler: Send + Sync {
    async fn handle(
        &self,
        session: &CmsSession,
        task: InterestTask,
        cancel: &CancellationToken,
    ) -> Result<InterestOutcome>;
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Pending,
    Fetching,
    Uploading,
    Reported,
    Done,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "PENDING",
            Stage::Fetching => "FETCHING",
            Stage::Uploading => "UPLOADING",
            Stage::Reported => "REPORTED",
            Stage::Done => "DONE",
        }
    }
}

/// Cloud paths of one interest.
#[derive(Debug, Clone, PartialEq)]
struct FolderLayout {
    day: String,
    interest: String,
    before: String,
    after: String,
    clip: String,
}

impl FolderLayout {
    fn new(root: &str, interest: &Interest) -> Self {
        let day = join(&[root, &interest.car_number, &date_label(&interest.date())]);
        let folder = join(&[&day, &interest.name]);
        Self {
            before: join(&[&folder, BEFORE_PICS]),
            after: join(&[&folder, AFTER_PICS]),
            clip: join(&[&folder, &format!("{}.mp4", interest.name)]),
            interest: folder,
            day,
        }
    }

    fn frame(dir: &str, channel: u8) -> String {
        join(&[dir, &format!("ch{}.jpg", channel)])
    }
}

/// Artifacts not yet present in the cloud.
#[derive(Debug, Clone, Default, PartialEq)]
struct MissingArtifacts {
    clip: bool,
    before: BTreeSet<u8>,
    after: BTreeSet<u8>,
}

impl MissingArtifacts {
    fn channels(&self, primary: u8) -> BTreeSet<u8> {
        let mut channels: BTreeSet<u8> = self.before.union(&self.after).copied().collect();
        if self.clip {
            channels.insert(primary);
        }
        channels
    }
}

/// Local working directory of one interest, removed when dropped.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    async fn create(parent: &Path) -> Result<Self> {
        let path = parent.join(generate_unique_id());
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "Failed to remove scratch dir: {}", e);
            }
        }
    }
}

pub struct InterestProcessor {
    cms: Arc<dyn CmsApi>,
    storage: Arc<dyn CloudStorage>,
    extractor: Arc<dyn FrameExtractor>,
    recognizer: Arc<dyn Recognizer>,
    state: Arc<StateStore>,
    root: String,
    channels: Vec<u8>,
    widen_steps: Vec<u32>,
    temp_dir: PathBuf,
    ignore_points: Vec<(f64, f64)>,
    ignore_tolerance_m: f64,
    recognition: bool,
    storage_retry: RetryConfig,
    clip_retry: RetryConfig,
}

impl InterestProcessor {
    pub fn new(
        cms: Arc<dyn CmsApi>,
        storage: Arc<dyn CloudStorage>,
        extractor: Arc<dyn FrameExtractor>,
        recognizer: Arc<dyn Recognizer>,
        state: Arc<StateStore>,
        config: &HarvesterConfig,
    ) -> Self {
        let delay = Duration::from_millis(config.storage.retry_delay_ms);
        let storage_retry = RetryConfig::linear(config.storage.retry_attempts, delay);
        let clip_retry = RetryConfig::fixed(config.storage.retry_attempts, delay)
            .with_backoff(Backoff::Exponential)
            .with_max_delay(delay * 8)
            .with_jitter(true);

        let widen_steps = if config.cms.window_widen_steps.is_empty() {
            vec![0]
        } else {
            config.cms.window_widen_steps.clone()
        };

        Self {
            cms,
            storage,
            extractor,
            recognizer,
            state,
            root: config.storage.root.clone(),
            channels: config.cms.channels.clone(),
            widen_steps,
            temp_dir: config.media.temp_dir.clone(),
            ignore_points: config.interests.parsed_ignore_points(),
            ignore_tolerance_m: config.interests.ignore_points_tolerance,
            recognition: config.recognition.enable_recognition,
            storage_retry,
            clip_retry,
        }
    }

    fn at_ignore_point(&self, geo: &str) -> bool {
        match parse_geo(geo) {
            Some(position) => self
                .ignore_points
                .iter()
                .any(|point| haversine_m(position, *point) <= self.ignore_tolerance_m),
            None => false,
        }
    }

    async fn ensure_folders(&self, layout: &FolderLayout, cancel: &CancellationToken) -> Result<()> {
        for dir in [&layout.interest, &layout.before, &layout.after] {
            retry_cancellable(&self.storage_retry, "mkdir", cancel, move |_| async move {
                self.storage.ensure_dir(dir).await
            })
            .await?;
        }
        Ok(())
    }

    async fn missing_artifacts(
        &self,
        layout: &FolderLayout,
        interest: &Interest,
        primary: u8,
    ) -> Result<MissingArtifacts> {
        let (folder, before, after) = tokio::try_join!(
            self.storage.list(&layout.interest),
            self.storage.list(&layout.before),
            self.storage.list(&layout.after),
        )?;
        let clip_name = format!("{}.mp4", interest.name);
        let missing_in = |names: &[String]| -> BTreeSet<u8> {
            self.channels
                .iter()
                .copied()
                .filter(|c| !names.iter().any(|n| is_channel_frame(n, *c)))
                .collect()
        };
        let missing = MissingArtifacts {
            clip: !folder.iter().any(|n| *n == clip_name),
            before: missing_in(&before),
            after: missing_in(&after),
        };
        debug!(primary, missing = ?missing, "Cloud listing checked");
        Ok(missing)
    }

    /// Video files for `channel`, widening the window step by step until
    /// the CMS returns something.
    async fn find_files(
        &self,
        session: &CmsSession,
        reg_id: &str,
        interest: &Interest,
        channel: u8,
    ) -> Result<Vec<VideoFileInfo>> {
        for step in &self.widen_steps {
            let (sec0, sec1) = widened_window(interest.beg_sec, interest.end_sec, *step);
            let files = self
                .cms
                .video_files(session, reg_id, channel, interest.date(), sec0, sec1)
                .await?;
            if !files.is_empty() {
                return Ok(files);
            }
            debug!(channel, sec0, sec1, "No video files in window");
        }
        Ok(Vec::new())
    }

    /// Downloads every file of `channel` and joins them into one local clip.
    async fn fetch_channel(
        &self,
        session: &CmsSession,
        reg_id: &str,
        interest: &Interest,
        channel: u8,
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<(u8, PathBuf)>> {
        let files = self.find_files(session, reg_id, interest, channel).await?;
        let mut parts = Vec::new();
        for (k, file) in files.iter().enumerate() {
            let task_url = match file.down_task_url.as_deref().filter(|u| !u.is_empty()) {
                Some(url) => url,
                None => continue,
            };
            if cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }
            let dph = self.cms.download(session, reg_id, task_url, cancel).await?;
            let part = scratch.join(format!("ch{}_part{}.mp4", channel, k));
            let bytes = self.cms.fetch_file(session, reg_id, &dph, &part).await?;
            debug!(channel, part = k, bytes, "Video part downloaded");
            parts.push(part);
        }

        if parts.is_empty() {
            warn!(channel, "No video available for channel");
            return Ok(None);
        }
        let clip = scratch.join(format!("ch{}.mp4", channel));
        self.extractor.concat(&parts, &clip).await?;
        Ok(Some((channel, clip)))
    }

    async fn put_with_retry(&self, path: &str, body: Vec<u8>, cancel: &CancellationToken) -> Result<()> {
        let body = &body;
        retry_cancellable(&self.storage_retry, "upload", cancel, move |_| async move {
            self.storage.put(path, body.clone()).await
        })
        .await
    }

    async fn upload_frames(
        &self,
        layout: &FolderLayout,
        missing: &MissingArtifacts,
        channel: u8,
        clip: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let wants_before = missing.before.contains(&channel);
        let wants_after = missing.after.contains(&channel);
        if !wants_before && !wants_after {
            return Ok(());
        }
        let frames = match self.extractor.edge_frames(clip).await {
            Ok(frames) => frames,
            Err(e) => {
                warn!(channel, "Skipping channel frames: {}", e);
                return Ok(());
            }
        };
        if let (true, Some(first)) = (wants_before, frames.first) {
            self.put_with_retry(&FolderLayout::frame(&layout.before, channel), first, cancel)
                .await?;
        }
        if let (true, Some(last)) = (wants_after, frames.last) {
            self.put_with_retry(&FolderLayout::frame(&layout.after, channel), last, cancel)
                .await?;
        }
        Ok(())
    }

    async fn harvest_media(
        &self,
        session: &CmsSession,
        task: &InterestTask,
        layout: &FolderLayout,
        missing: &MissingArtifacts,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let channels = missing.channels(task.primary_channel);
        if channels.is_empty() {
            debug!("All artifacts already uploaded");
            return Ok(());
        }

        log_stage(Stage::Fetching);
        let scratch = ScratchDir::create(&self.temp_dir).await?;
        let clips: BTreeMap<u8, PathBuf> = try_join_all(channels.iter().map(|channel| {
            self.fetch_channel(session, &task.reg_id, &task.interest, *channel, scratch.path(), cancel)
        }))
        .await?
        .into_iter()
        .flatten()
        .collect();

        log_stage(Stage::Uploading);
        if missing.clip {
            let clip = clips.get(&task.primary_channel).ok_or_else(|| {
                HarvestError::ClipUnavailable(format!(
                    "no video on channel {} for {}",
                    task.primary_channel, task.interest.name
                ))
            })?;
            let clip = clip.as_path();
            retry_cancellable(&self.clip_retry, "upload clip", cancel, move |_| async move {
                self.storage.put_file(&layout.clip, clip).await
            })
            .await?;
            info!(path = %layout.clip, "Clip uploaded");
        }

        let uploads = clips
            .iter()
            .map(|(channel, clip)| self.upload_frames(layout, missing, *channel, clip, cancel));
        for result in join_all(uploads).await {
            result?;
        }
        Ok(())
    }

    async fn write_report(&self, layout: &FolderLayout, interest: &Interest, cancel: &CancellationToken) -> Result<()> {
        let body = serde_json::to_vec_pretty(&interest.report)?;
        self.put_with_retry(&join(&[&layout.interest, REPORT_FILE]), body, cancel)
            .await
    }

    /// Read-modify-write of the per-day log; a name already listed is not
    /// appended again.
    async fn append_report_line(
        &self,
        layout: &FolderLayout,
        interest: &Interest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let path = join(&[&layout.day, REPORTS_LOG]);
        let line = report_line(interest);
        let (path, line) = (&path, &line);
        retry_cancellable(&self.storage_retry, "append report", cancel, move |_| async move {
            let current = self.storage.get(path).await?.unwrap_or_default();
            let mut text = String::from_utf8_lossy(&current).into_owned();
            if text.lines().any(|l| l == line.trim_end()) {
                return Ok(());
            }
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(line);
            self.storage.put(path, text.into_bytes()).await
        })
        .await
    }
}

#[async_trait]
impl InterestHandler for InterestProcessor {
    #[instrument(skip_all, fields(reg_id = %task.reg_id, interest = %task.interest.name))]
    async fn handle(
        &self,
        session: &CmsSession,
        mut task: InterestTask,
        cancel: &CancellationToken,
    ) -> Result<InterestOutcome> {
        let started = Instant::now();
        log_stage(Stage::Pending);

        if self.at_ignore_point(&task.interest.report.geo) {
            info!(geo = %task.interest.report.geo, "Interest at an ignore point, dropped");
            // processed so a rescan of the same window cannot queue it again
            self.state.mark_processed(&task.reg_id, &task.interest.name).await?;
            return Ok(InterestOutcome::Ignored);
        }

        if self.state.is_processed(&task.reg_id, &task.interest.name).await? {
            debug!("Interest already harvested, dropping stale pending entry");
            self.state.remove_pending(&task.reg_id, &task.interest.name).await?;
            return Ok(InterestOutcome::Ignored);
        }

        let layout = FolderLayout::new(&self.root, &task.interest);
        self.ensure_folders(&layout, cancel).await?;
        let cloud_folder = format!("{}/", layout.interest);
        if task.interest.cloud_folder.as_deref() != Some(cloud_folder.as_str()) {
            task.interest.cloud_folder = Some(cloud_folder);
            task.interest.pics_before_folder = Some(format!("{}/", layout.before));
            task.interest.pics_after_folder = Some(format!("{}/", layout.after));
            self.state
                .update_pending(&task.reg_id, task.interest.clone())
                .await?;
        }

        let missing = self
            .missing_artifacts(&layout, &task.interest, task.primary_channel)
            .await?;
        self.harvest_media(session, &task, &layout, &missing, cancel).await?;

        self.write_report(&layout, &task.interest, cancel).await?;
        self.append_report_line(&layout, &task.interest, cancel).await?;
        log_stage(Stage::Reported);

        self.state
            .mark_processed(&task.reg_id, &task.interest.name)
            .await?;
        log_stage(Stage::Done);
        info!(took = %format_duration(started.elapsed()), "Interest harvested");

        if self.recognition {
            self.recognizer.submit(&task.interest.name);
        }
        Ok(InterestOutcome::Completed)
    }
}

fn log_stage(stage: Stage) {
    debug!(stage = stage.as_str(), "Interest stage");
}

/// `ch{c}.jpg` or `ch{c}_*.jpg`.
fn is_channel_frame(name: &str, channel: u8) -> bool {
    let prefix = format!("ch{}", channel);
    match name.strip_prefix(&prefix).and_then(|rest| rest.strip_suffix(".jpg")) {
        Some(rest) => rest.is_empty() || rest.starts_with('_'),
        None => false,
    }
}

fn widened_window(beg_sec: u32, end_sec: u32, step: u32) -> (u32, u32) {
    (
        beg_sec.saturating_sub(step),
        end_sec.saturating_add(step).min(LAST_SECOND_OF_DAY),
    )
}

fn report_line(interest: &Interest) -> String {
    format!(
        "{} {} {}\n",
        format_local(&interest.start_time),
        format_local(&interest.end_time),
        interest.name
    )
}
