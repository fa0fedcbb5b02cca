use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use futures::StreamExt;
use harvest_common::utils::format_local;
use harvest_common::{OnlineDevice, RawAlarm, TrackSample, VideoFileInfo};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{CmsApi, CmsSession, RESULT_DEVICE_OFFLINE, RESULT_DOWNLOAD_DONE, RESULT_RETRY};
use crate::config::CmsConfig;
use crate::error::{HarvestError, Result};
use crate::retry::{retry_async, RetryConfig};

#[derive(Debug, Deserialize, Default)]
struct Pagination {
    #[serde(default, rename = "totalPages")]
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct TrackPage {
    #[serde(default)]
    tracks: Vec<TrackSample>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct AlarmPage {
    #[serde(default)]
    alarms: Vec<RawAlarm>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct OnlineStatus {
    #[serde(default)]
    did: String,
    #[serde(default)]
    vid: Option<String>,
    #[serde(default)]
    online: i64,
}

#[derive(Debug, Deserialize)]
struct OnlineReply {
    #[serde(default)]
    onlines: Vec<OnlineStatus>,
}

#[derive(Debug, Deserialize)]
struct FilesReply {
    #[serde(default)]
    files: Vec<VideoFileInfo>,
}

trait Paged {
    fn total_pages(&self) -> u32;
}

impl Paged for TrackPage {
    fn total_pages(&self) -> u32 {
        self.pagination.as_ref().map_or(1, |p| p.total_pages.max(1))
    }
}

impl Paged for AlarmPage {
    fn total_pages(&self) -> u32 {
        self.pagination.as_ref().map_or(1, |p| p.total_pages.max(1))
    }
}

/// HTTP client for the CMS `StandardApiAction_*` endpoints.
pub struct CmsClient {
    http: reqwest::Client,
    config: CmsConfig,
    base_url: String,
    retry: RetryConfig,
    global: Arc<Semaphore>,
    per_device: DashMap<String, Arc<Semaphore>>,
    per_device_limit: usize,
}

impl CmsClient {
    pub fn new(config: CmsConfig, max_concurrent: usize, max_per_device: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| HarvestError::ConfigError(format!("Failed to create CMS client: {}", e)))?;

        let retry = RetryConfig::fixed(
            config.retry_attempts,
            Duration::from_millis(config.retry_delay_ms),
        );

        Ok(Self {
            http,
            base_url: config.base_url(),
            config,
            retry,
            global: Arc::new(Semaphore::new(max_concurrent)),
            per_device: DashMap::new(),
            per_device_limit: max_per_device,
        })
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.config.read_timeout_sec)
    }

    fn video_timeout(&self) -> Duration {
        Duration::from_secs(self.config.video_read_timeout_sec)
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/StandardApiAction_{}.action", self.base_url, action)
    }

    fn device_semaphore(&self, dev: &str) -> Arc<Semaphore> {
        self.per_device
            .entry(dev.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_device_limit)))
            .clone()
    }

    /// Device permit first so a busy recorder never parks a global slot.
    async fn permits(&self, dev: Option<&str>) -> Result<(Option<OwnedSemaphorePermit>, OwnedSemaphorePermit)> {
        let device = match dev {
            Some(dev) => Some(
                self.device_semaphore(dev)
                    .acquire_owned()
                    .await
                    .map_err(|_| HarvestError::Cancelled)?,
            ),
            None => None,
        };
        let global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HarvestError::Cancelled)?;
        Ok((device, global))
    }

    /// One GET returning the raw JSON body; `result` is not inspected.
    async fn request(
        &self,
        dev: Option<&str>,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<Value> {
        let _permits = self.permits(dev).await?;
        let response = self
            .http
            .get(url)
            .query(query)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(HarvestError::CmsAuth(format!("HTTP {}", status)));
        }
        if status.is_server_error() {
            return Err(HarvestError::CmsTransient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(HarvestError::CmsApi {
                code: status.as_u16() as i64,
                message: format!("HTTP {}", status),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| HarvestError::CmsTransient(format!("invalid JSON: {}", e)))
    }

    /// GET with the business-code check, retried on transient codes.
    async fn call(
        &self,
        dev: Option<&str>,
        action: &str,
        query: Vec<(&str, String)>,
        timeout: Duration,
    ) -> Result<Value> {
        let url = self.action_url(action);
        let (url, query) = (&url, &query);
        retry_async(&self.retry, action, move |_| async move {
            let value = self.request(dev, url, query, timeout).await?;
            check_result(&value, dev.unwrap_or("-"))?;
            Ok(value)
        })
        .await
    }

    async fn paged<P>(
        &self,
        session: &CmsSession,
        dev: &str,
        action: &str,
        mut query: Vec<(&str, String)>,
    ) -> Result<Vec<P>>
    where
        P: DeserializeOwned + Paged,
    {
        query.push(("jsession", session.token.clone()));
        query.push(("pageRecords", self.config.page_records.to_string()));

        let mut pages = Vec::new();
        let mut current = 1u32;
        loop {
            let mut page_query = query.clone();
            page_query.push(("currentPage", current.to_string()));
            let value = self
                .call(Some(dev), action, page_query, self.read_timeout())
                .await?;
            let page: P = serde_json::from_value(value)?;
            let total = page.total_pages();
            pages.push(page);
            if current >= total {
                break;
            }
            current += 1;
        }
        Ok(pages)
    }

    fn resolve(&self, url: &str) -> String {
        resolve_url(&self.base_url, url)
    }
}

#[async_trait]
impl CmsApi for CmsClient {
    #[instrument(skip(self))]
    async fn login(&self) -> Result<CmsSession> {
        let creds = &self.config.credentials;
        if !creds.is_set() {
            return Err(HarvestError::CmsAuth("CMS_LOGIN is not set".to_string()));
        }
        let url = self.action_url("login");
        let query = vec![
            ("account", creds.login.clone()),
            ("password", creds.password.clone()),
        ];
        let (url, query) = (&url, &query);
        let timeout = self.read_timeout();
        let value = retry_async(&self.retry, "login", move |_| async move {
            self.request(None, url, query, timeout).await
        })
        .await?;

        let token = session_token(&value)?;
        info!("Logged into CMS at {}", self.base_url);
        Ok(CmsSession { token })
    }

    async fn online_devices(&self, session: &CmsSession) -> Result<Vec<OnlineDevice>> {
        let value = self
            .call(
                None,
                "getDeviceOlStatus",
                vec![("jsession", session.token.clone())],
                self.read_timeout(),
            )
            .await?;
        let reply: OnlineReply = serde_json::from_value(value)?;
        Ok(online_only(reply))
    }

    #[instrument(skip(self, session), fields(t0 = %t0, t1 = %t1))]
    async fn tracks(
        &self,
        session: &CmsSession,
        dev: &str,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
    ) -> Result<Vec<TrackSample>> {
        let query = vec![
            ("devIdno", dev.to_string()),
            ("begintime", format_local(&t0)),
            ("endtime", format_local(&t1)),
            ("distance", "0".to_string()),
            ("parkTime", "0".to_string()),
            ("toMap", "2".to_string()),
        ];
        let pages: Vec<TrackPage> = self.paged(session, dev, "queryTrackDetail", query).await?;
        let tracks: Vec<TrackSample> = pages.into_iter().flat_map(|p| p.tracks).collect();
        debug!(samples = tracks.len(), "Tracks fetched");
        Ok(tracks)
    }

    #[instrument(skip(self, session), fields(t0 = %t0, t1 = %t1))]
    async fn alarms(
        &self,
        session: &CmsSession,
        dev: &str,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
    ) -> Result<Vec<RawAlarm>> {
        let query = vec![
            ("devIdno", dev.to_string()),
            ("begintime", format_local(&t0)),
            ("endtime", format_local(&t1)),
            ("armType", "19,20,21,22".to_string()),
            ("toMap", "2".to_string()),
        ];
        let pages: Vec<AlarmPage> = self.paged(session, dev, "queryAlarmDetail", query).await?;
        let alarms: Vec<RawAlarm> = pages.into_iter().flat_map(|p| p.alarms).collect();
        debug!(alarms = alarms.len(), "Alarms fetched");
        Ok(alarms)
    }

    async fn video_files(
        &self,
        session: &CmsSession,
        dev: &str,
        channel: u8,
        date: NaiveDate,
        sec0: u32,
        sec1: u32,
    ) -> Result<Vec<VideoFileInfo>> {
        let query = vec![
            ("DevIDNO", dev.to_string()),
            ("LOC", "1".to_string()),
            ("CHN", channel.to_string()),
            ("YEAR", date.year().to_string()),
            ("MON", date.month().to_string()),
            ("DAY", date.day().to_string()),
            ("RECTYPE", "-1".to_string()),
            ("FILEATTR", "2".to_string()),
            ("BEG", sec0.to_string()),
            ("END", sec1.to_string()),
            ("ARM1", "0".to_string()),
            ("ARM2", "0".to_string()),
            ("RES", "0".to_string()),
            ("STREAM", "-1".to_string()),
            ("STORE", "0".to_string()),
            ("jsession", session.token.clone()),
        ];
        let value = self
            .call(Some(dev), "getVideoFileInfo", query, self.video_timeout())
            .await?;
        let reply: FilesReply = serde_json::from_value(value)?;
        Ok(reply
            .files
            .into_iter()
            .filter(|f| f.down_task_url.as_deref().map_or(false, |u| !u.is_empty()))
            .collect())
    }

    #[instrument(skip(self, session, task_url, cancel))]
    async fn download(
        &self,
        session: &CmsSession,
        dev: &str,
        task_url: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let url = self.resolve(task_url);
        let query = vec![("jsession", session.token.clone())];
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let heartbeat = Duration::from_secs(self.config.heartbeat_interval_sec);
        let started = Instant::now();
        let mut last_beat = started;

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => return Err(HarvestError::Cancelled),
                polled = self.request(Some(dev), &url, &query, self.video_timeout()) => polled,
            };

            match polled {
                Ok(value) => match task_state(&value) {
                    TaskState::Done(dph) => {
                        debug!(elapsed_sec = started.elapsed().as_secs(), "Download task finished");
                        return Ok(dph);
                    }
                    TaskState::Offline => return Err(HarvestError::DeviceOffline(dev.to_string())),
                    TaskState::Running(code) => debug!(result = code, "Download task still running"),
                },
                Err(e) if e.is_retryable() => warn!("Download poll failed, will retry: {}", e),
                Err(e) => return Err(e),
            }

            if last_beat.elapsed() >= heartbeat {
                info!(
                    elapsed_sec = started.elapsed().as_secs(),
                    "Waiting for recorder to upload video"
                );
                last_beat = Instant::now();
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(HarvestError::Cancelled),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn fetch_file(&self, session: &CmsSession, dev: &str, dph: &str, dest: &Path) -> Result<u64> {
        let url = format!("{}{}", self.base_url, self.config.download_file_path);
        let query = [
            ("DownType", "3".to_string()),
            ("DevIDNO", dev.to_string()),
            ("FPATH", dph.to_string()),
            ("jsession", session.token.clone()),
        ];

        let _permits = self.permits(Some(dev)).await?;
        let response = self
            .http
            .get(&url)
            .query(&query)
            .timeout(self.video_timeout())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HarvestError::CmsTransient(format!(
                "file download HTTP {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(bytes = written, path = %dest.display(), "Clip downloaded");
        Ok(written)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum TaskState {
    Done(String),
    Offline,
    Running(i64),
}

fn result_code(value: &Value) -> i64 {
    value.get("result").and_then(Value::as_i64).unwrap_or(0)
}

fn task_state(value: &Value) -> TaskState {
    let code = result_code(value);
    let dph = value
        .get("dph")
        .or_else(|| value.pointer("/data/dph"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    match (code, dph) {
        (RESULT_DOWNLOAD_DONE, Some(dph)) => TaskState::Done(dph.to_string()),
        (RESULT_DEVICE_OFFLINE, _) => TaskState::Offline,
        (code, _) => TaskState::Running(code),
    }
}

/// Maps the CMS `result` field onto the error taxonomy.
fn check_result(value: &Value, dev: &str) -> Result<()> {
    let code = result_code(value);
    if code == 0 {
        return Ok(());
    }
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if RESULT_RETRY.contains(&code) {
        return Err(HarvestError::CmsTransient(format!("result {}", code)));
    }
    if code == RESULT_DEVICE_OFFLINE {
        return Err(HarvestError::DeviceOffline(dev.to_string()));
    }
    Err(HarvestError::CmsApi { code, message })
}

fn session_token(value: &Value) -> Result<String> {
    let code = result_code(value);
    if code != 0 {
        return Err(HarvestError::CmsAuth(format!("login result {}", code)));
    }
    value
        .get("jsession")
        .or_else(|| value.get("JSESSIONID"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| HarvestError::CmsAuth("login reply without session".to_string()))
}

fn online_only(reply: OnlineReply) -> Vec<OnlineDevice> {
    reply
        .onlines
        .into_iter()
        .filter(|d| d.online == 1 && !d.did.is_empty())
        .map(|d| OnlineDevice { did: d.did, vid: d.vid })
        .collect()
}

fn resolve_url(base: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else if url.starts_with('/') {
        format!("{}{}", base, url)
    } else {
        format!("{}/{}", base, url)
    }
}
