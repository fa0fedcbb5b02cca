//! Decides when a recorder's telemetry is rescanned and turns new
//! telemetry into pending interests.

use chrono::{Duration, FixedOffset, NaiveDateTime};
use harvest_common::utils::{end_of_day, start_of_next_day};
use harvest_common::{Interest, Recorder};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::cms::{CmsApi, CmsSession};
use crate::config::{InterestsConfig, ProcessConfig};
use crate::error::{HarvestError, Result};
use crate::pipeline::{canonicalize, merge_overlapping, normalize, Detection, InterestDetector, NormalizeOptions};
use crate::state_store::StateStore;

/// How far before a deferred activation the watermark is held.
const DEFERRED_REWIND_SEC: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefillOutcome {
    /// Another refill of this recorder is running.
    InFlight,
    Ignored,
    /// Watermark is younger than the refill interval.
    TooSoon,
    Done { added: usize, watermark: NaiveDateTime },
}

pub struct RefillController {
    cms: Arc<dyn CmsApi>,
    state: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    interests: InterestsConfig,
    min_interval: Duration,
    loading_retry_limit: u32,
    offset: FixedOffset,
    in_flight: Mutex<HashSet<String>>,
}

/// Removes the recorder from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    reg_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.reg_id);
    }
}

impl RefillController {
    pub fn new(
        cms: Arc<dyn CmsApi>,
        state: Arc<StateStore>,
        clock: Arc<dyn Clock>,
        interests: InterestsConfig,
        process: &ProcessConfig,
        offset: FixedOffset,
    ) -> Self {
        Self {
            cms,
            state,
            clock,
            interests,
            min_interval: Duration::seconds(process.refill_min_interval_sec),
            loading_retry_limit: process.loading_retry_limit,
            offset,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn begin(&self, reg_id: &str) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(reg_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            reg_id: reg_id.to_string(),
        })
    }

    /// Scans from the watermark up to now, day by day, queueing every
    /// detected interest and advancing the watermark after each window.
    #[instrument(skip(self, session))]
    pub async fn refill(&self, session: &CmsSession, reg_id: &str) -> Result<RefillOutcome> {
        let _guard = match self.begin(reg_id) {
            Some(guard) => guard,
            None => return Ok(RefillOutcome::InFlight),
        };

        let recorder = self.state.get_recorder(reg_id).await?;
        if recorder.ignore {
            return Ok(RefillOutcome::Ignored);
        }

        let now = self.clock.now();
        if now - recorder.last_upload_time < self.min_interval {
            debug!(watermark = %recorder.last_upload_time, "Refill not due yet");
            return Ok(RefillOutcome::TooSoon);
        }

        let mut cursor = recorder.last_upload_time;
        let mut added = 0;
        let mut watermark = cursor;

        while cursor.date() < now.date() {
            let window_end = end_of_day(cursor.date());
            let detection = self
                .scan_window(session, reg_id, &recorder, cursor, window_end, now)
                .await?;
            added += self.enqueue(reg_id, cursor, detection.interests).await?;
            watermark = self
                .state
                .set_last_upload_time(reg_id, hold_back(window_end, detection.deferred))
                .await?;
            if detection.deferred.is_some() {
                return Ok(RefillOutcome::Done { added, watermark });
            }
            cursor = start_of_next_day(&cursor);
        }

        if cursor < now {
            let detection = self
                .scan_window(session, reg_id, &recorder, cursor, now, now)
                .await?;
            added += self.enqueue(reg_id, cursor, detection.interests).await?;
            watermark = self
                .state
                .set_last_upload_time(reg_id, hold_back(now, detection.deferred))
                .await?;
        }

        if added > 0 {
            info!(added, watermark = %watermark, "New interests queued");
        }
        Ok(RefillOutcome::Done { added, watermark })
    }

    /// Runs detection over `[t0, t1]`; while the detector reports a stop
    /// run cut by the window start, the start is moved one minute back.
    async fn scan_window(
        &self,
        session: &CmsSession,
        reg_id: &str,
        recorder: &Recorder,
        t0: NaiveDateTime,
        t1: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<Detection> {
        let plate = recorder.plate_or(reg_id);
        let detector = InterestDetector::new(
            &self.interests,
            plate,
            recorder.euro_container_alarm,
            recorder.kgo_container_alarm,
            now,
        );
        let options = NormalizeOptions::from_config(&self.interests, self.offset);

        for attempt in 0..=self.loading_retry_limit {
            let start = t0 - Duration::minutes(attempt as i64);
            let (samples, raw_alarms) = tokio::try_join!(
                self.cms.tracks(session, reg_id, start, t1),
                self.cms.alarms(session, reg_id, start, t1),
            )?;
            let tracks = canonicalize(&samples);
            let alarms = normalize(&raw_alarms, recorder, &options);

            match detector.detect(&tracks, Some(&alarms)) {
                Ok(detection) => return Ok(detection),
                Err(HarvestError::LoadingInProgress) => {
                    debug!(attempt, window_start = %start, "Stop run reaches window start, widening");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            window_start = %t0,
            window_end = %t1,
            retries = self.loading_retry_limit,
            "Window still cut by a stop run, skipping"
        );
        Ok(Detection::default())
    }

    /// Queues the window's interests; ones overlapping a pending entry are
    /// fused into it by the state store.
    async fn enqueue(&self, reg_id: &str, t0: NaiveDateTime, interests: Vec<Interest>) -> Result<usize> {
        // widened windows may rediscover interests that ended before the cursor
        let fresh: Vec<Interest> = interests.into_iter().filter(|i| i.end_time >= t0).collect();
        if fresh.is_empty() {
            return Ok(0);
        }
        let merged = merge_overlapping(fresh);
        self.state.append_pending(reg_id, merged).await
    }
}

fn hold_back(window_end: NaiveDateTime, deferred: Option<NaiveDateTime>) -> NaiveDateTime {
    match deferred {
        Some(activation) => window_end.min(activation - Duration::seconds(DEFERRED_REWIND_SEC)),
        None => window_end,
    }
}
