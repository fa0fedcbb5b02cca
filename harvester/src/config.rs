use harvest_common::utils::{parse_geo, validate_url};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::error::{HarvestError, Result};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HarvesterConfig {
    pub process: ProcessConfig,
    pub interests: InterestsConfig,
    pub cms: CmsConfig,
    pub storage: StorageConfig,
    pub recognition: RecognitionConfig,
    pub state: StateConfig,
    pub media: MediaConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProcessConfig {
    pub max_devices_concurrent: usize,
    pub max_global_interests: usize,
    pub max_interests_per_device: usize,
    pub max_interests_per_batch: usize,
    pub max_cms_concurrent: usize,
    pub max_cms_per_device: usize,
    pub max_frame_extract: usize,
    pub tick_interval_sec: u64,
    /// Refill is skipped while the watermark is younger than this.
    pub refill_min_interval_sec: i64,
    /// How many times a window is shifted one minute back on LoadingInProgress.
    pub loading_retry_limit: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct InterestsConfig {
    /// Speeds are km/h × 10, as reported in track samples.
    pub min_stop_speed: i64,
    pub min_move_speed: i64,
    pub min_stop_duration_sec: i64,
    pub min_move_duration_sec: i64,
    pub min_speed_for_switch_detect: i64,
    pub max_lookback_seconds: i64,
    pub max_wait_time_minutes: i64,
    pub photo_after_shift_sec: i64,
    pub gap_threshold_sec: i64,
    pub after_fallback_sec: i64,
    pub sec_before: i64,
    pub sec_after: i64,
    /// Meters.
    pub ignore_points_tolerance: f64,
    /// "lat,lon" pairs where events are never harvested (depots, washes).
    pub ignore_points: Vec<String>,
    /// Alarm start speed (km/h) at or below which the vehicle counts as stopped.
    pub min_stop_kmh: f64,
    pub merge_gap_sec: i64,
    pub allowed_alarm_types: Vec<i32>,
    /// When set, alarm-gap interests end at `alarm_end + sec_after`
    /// instead of `alarm_start + sec_after`.
    pub alarm_gap_end_from_alarm_end: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CmsConfig {
    pub schema: String,
    pub ip: String,
    pub port: u16,
    pub connect_timeout_sec: u64,
    pub read_timeout_sec: u64,
    pub video_read_timeout_sec: u64,
    pub page_records: u32,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_sec: u64,
    /// Successive widenings (seconds) of the video search window.
    pub window_widen_steps: Vec<u32>,
    pub channels: Vec<u8>,
    pub download_file_path: String,
    /// Offset of the recorders' local clock; host local zone when absent.
    pub utc_offset_minutes: Option<i32>,
    #[serde(skip)]
    pub credentials: Credentials,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub url: String,
    pub root: String,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_sec: u64,
    #[serde(skip)]
    pub credentials: Credentials,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RecognitionConfig {
    pub enable_recognition: bool,
    pub url: String,
    pub timeout_sec: u64,
    #[serde(skip)]
    pub credentials: Credentials,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StateConfig {
    pub path: PathBuf,
    pub default_lookback_days: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg_path: String,
    pub temp_dir: PathBuf,
    pub ffmpeg_timeout_sec: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn from_env(login_var: &str, password_var: &str) -> Self {
        Self {
            login: std::env::var(login_var).unwrap_or_default(),
            password: std::env::var(password_var).unwrap_or_default(),
        }
    }

    pub fn is_set(&self) -> bool {
        !self.login.is_empty()
    }
}

impl HarvesterConfig {
    /// Secrets never live in the config file.
    pub fn apply_env_secrets(&mut self) {
        self.cms.credentials = Credentials::from_env("CMS_LOGIN", "CMS_PASSWORD");
        self.storage.credentials = Credentials::from_env("WEBDAV_LOGIN", "WEBDAV_PASSWORD");
        self.recognition.credentials = Credentials::from_env("QT_RM_LOGIN", "QT_RM_PASSWORD");
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.process;
        let limits = [
            ("process.max_devices_concurrent", p.max_devices_concurrent),
            ("process.max_global_interests", p.max_global_interests),
            ("process.max_interests_per_device", p.max_interests_per_device),
            ("process.max_interests_per_batch", p.max_interests_per_batch),
            ("process.max_cms_concurrent", p.max_cms_concurrent),
            ("process.max_cms_per_device", p.max_cms_per_device),
            ("process.max_frame_extract", p.max_frame_extract),
        ];
        for (key, value) in limits {
            if value == 0 {
                return Err(HarvestError::ConfigError(format!("{} must be positive", key)));
            }
        }

        validate_url(&self.cms.base_url()).map_err(HarvestError::ConfigError)?;
        validate_url(&self.storage.url).map_err(HarvestError::ConfigError)?;
        if self.recognition.enable_recognition {
            validate_url(&self.recognition.url).map_err(HarvestError::ConfigError)?;
        }

        if self.cms.channels.is_empty() {
            return Err(HarvestError::ConfigError("cms.channels must not be empty".to_string()));
        }
        if self.cms.window_widen_steps.is_empty() {
            return Err(HarvestError::ConfigError(
                "cms.window_widen_steps must not be empty".to_string(),
            ));
        }
        for point in &self.interests.ignore_points {
            if parse_geo(point).is_none() {
                return Err(HarvestError::ConfigError(format!("invalid ignore point: {}", point)));
            }
        }
        Ok(())
    }
}

impl CmsConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.schema, self.ip, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }
}

impl InterestsConfig {
    pub fn parsed_ignore_points(&self) -> Vec<(f64, f64)> {
        self.ignore_points.iter().filter_map(|p| parse_geo(p)).collect()
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_devices_concurrent: 8,
            max_global_interests: 16,
            max_interests_per_device: 2,
            max_interests_per_batch: 8,
            max_cms_concurrent: 8,
            max_cms_per_device: 2,
            max_frame_extract: 4,
            tick_interval_sec: 3,
            refill_min_interval_sec: 600,
            loading_retry_limit: 8,
        }
    }
}

impl Default for InterestsConfig {
    fn default() -> Self {
        Self {
            min_stop_speed: 5,
            min_move_speed: 30,
            min_stop_duration_sec: 10,
            min_move_duration_sec: 10,
            min_speed_for_switch_detect: 30,
            max_lookback_seconds: 600,
            max_wait_time_minutes: 10,
            photo_after_shift_sec: 5,
            gap_threshold_sec: 10,
            after_fallback_sec: 30,
            sec_before: 30,
            sec_after: 30,
            ignore_points_tolerance: 100.0,
            ignore_points: vec![],
            min_stop_kmh: 0.5,
            merge_gap_sec: 15,
            allowed_alarm_types: vec![19, 20, 21, 22],
            alarm_gap_end_from_alarm_end: false,
        }
    }
}

impl Default for CmsConfig {
    fn default() -> Self {
        Self {
            schema: "http".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 8080,
            connect_timeout_sec: 5,
            read_timeout_sec: 25,
            video_read_timeout_sec: 60,
            page_records: 1000,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            poll_interval_ms: 1000,
            heartbeat_interval_sec: 60,
            window_widen_steps: vec![0, 30, 60, 90],
            channels: vec![0, 1, 2, 3],
            download_file_path: "/3/5".to_string(),
            utc_offset_minutes: None,
            credentials: Credentials::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8081/remote.php/webdav".to_string(),
            root: "DVR".to_string(),
            retry_attempts: 3,
            retry_delay_ms: 1000,
            timeout_sec: 120,
            credentials: Credentials::default(),
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            enable_recognition: false,
            url: "http://127.0.0.1:8090".to_string(),
            timeout_sec: 30,
            credentials: Credentials::default(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("states.json"),
            default_lookback_days: 7,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            temp_dir: std::env::temp_dir().join("dvr-harvester"),
            ffmpeg_timeout_sec: 120,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
