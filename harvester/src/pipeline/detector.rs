//! Interest detection from canonical tracks and normalized alarms.
//!
//! Two sources feed the output:
//! - limit-switch activations visible in the track IO bitfield;
//! - stationary alarms that fall inside gaps of the track stream.

use chrono::{DateTime, Duration, NaiveDateTime};
use harvest_common::utils::{clamp_to_day, naive_seconds};
use harvest_common::{CargoType, Interest, InterestReport, SwitchEvent, TrackSample};
use std::collections::HashSet;
use tracing::{debug, trace};

use super::alarms::{NormalizedAlarm, NormalizedAlarms};
use crate::config::InterestsConfig;
use crate::error::{HarvestError, Result};

pub const ALARM_GAP_SOURCE: &str = "alarm-gap";

/// Seconds added to the last switch when the vehicle never leaves.
const MAX_WAIT_AFTER_FALLBACK_SEC: i64 = 60;

/// IO index (1..=4) → bit of the track `s1` field.
pub fn io_bit(io_index: u8) -> Option<u32> {
    match io_index {
        1 => Some(20),
        2 => Some(21),
        3 => Some(22),
        4 => Some(23),
        _ => None,
    }
}

fn io_mask(io_index: Option<u8>) -> u32 {
    io_index.and_then(io_bit).map(|bit| 1u32 << bit).unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub at: NaiveDateTime,
    pub ts: i64,
    pub speed: i64,
    pub io: u32,
    pub geo: String,
}

/// Drops samples with unparseable time, sorts by time, keeps the first
/// sample of every second.
pub fn canonicalize(samples: &[TrackSample]) -> Vec<Track> {
    let mut tracks: Vec<Track> = samples
        .iter()
        .filter_map(|s| {
            let at = s.timestamp()?;
            Some(Track {
                at,
                ts: naive_seconds(&at),
                speed: s.sp,
                io: s.io_bits(),
                geo: s.ps.clone(),
            })
        })
        .collect();
    tracks.sort_by_key(|t| t.ts);
    tracks.dedup_by_key(|t| t.ts);
    tracks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSearch {
    Found(NaiveDateTime),
    NotFound,
    LoadingInProgress,
}

#[derive(Debug, Default)]
pub struct Detection {
    pub interests: Vec<Interest>,
    /// Earliest activation skipped because the vehicle has not left yet.
    pub deferred: Option<NaiveDateTime>,
}

pub struct InterestDetector<'a> {
    config: &'a InterestsConfig,
    plate: &'a str,
    euro_mask: u32,
    kgo_mask: u32,
    now: NaiveDateTime,
}

impl<'a> InterestDetector<'a> {
    pub fn new(
        config: &'a InterestsConfig,
        plate: &'a str,
        euro_container_alarm: u8,
        kgo_container_alarm: Option<u8>,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            config,
            plate,
            euro_mask: io_mask(Some(euro_container_alarm)),
            kgo_mask: io_mask(kgo_container_alarm),
            now,
        }
    }

    /// Fails with `LoadingInProgress` when a switch activation sits in a
    /// stop run that began before the first sample.
    pub fn detect(&self, tracks: &[Track], alarms: Option<&NormalizedAlarms>) -> Result<Detection> {
        let mut detection = Detection::default();
        if tracks.len() < 2 {
            return Ok(detection);
        }

        self.detect_switch_activations(tracks, &mut detection)?;
        if let Some(alarms) = alarms.filter(|a| !a.is_empty()) {
            self.detect_alarm_gaps(tracks, alarms, &mut detection);
        }

        detection.interests.sort_by_key(|i| (i.start_time, i.end_time));
        debug!(
            plate = %self.plate,
            samples = tracks.len(),
            interests = detection.interests.len(),
            deferred = ?detection.deferred,
            "Detection finished"
        );
        Ok(detection)
    }

    fn detect_switch_activations(&self, tracks: &[Track], detection: &mut Detection) -> Result<()> {
        let mask = self.euro_mask | self.kgo_mask;
        let cfg = self.config;
        let mut i = 0;

        while i < tracks.len() {
            let track = &tracks[i];
            if track.io & mask == 0 || track.speed > cfg.min_speed_for_switch_detect {
                i += 1;
                continue;
            }

            let activation = i;
            let mut last_switch = i;
            let mut kgo = track.io & self.kgo_mask != 0;
            let mut moving_since: Option<usize> = None;
            let mut j = i + 1;
            while j < tracks.len() {
                let sample = &tracks[j];
                if sample.io & mask != 0 {
                    last_switch = j;
                    kgo |= sample.io & self.kgo_mask != 0;
                    moving_since = None;
                } else if sample.speed >= cfg.min_move_speed {
                    let since = *moving_since.get_or_insert(j);
                    if sample.ts - tracks[since].ts >= cfg.min_move_duration_sec {
                        break;
                    }
                } else {
                    moving_since = None;
                }
                j += 1;
            }
            i = j + 1;

            let activation_at = tracks[activation].at;
            let last_switch_at = tracks[last_switch].at;
            trace!(activation = %activation_at, last_switch = %last_switch_at, "Switch activation");

            let before = match find_first_stable_stop(tracks, activation, tracks[activation].ts, cfg) {
                StopSearch::Found(t) => t,
                StopSearch::NotFound => activation_at - Duration::seconds(cfg.sec_before),
                StopSearch::LoadingInProgress => return Err(HarvestError::LoadingInProgress),
            };

            let after = match find_stop_after_lifting(tracks, last_switch + 1, cfg) {
                Some(departure) => departure - Duration::seconds(cfg.photo_after_shift_sec),
                None => {
                    let waited = self.now - last_switch_at;
                    if waited > Duration::minutes(cfg.max_wait_time_minutes) {
                        last_switch_at + Duration::seconds(MAX_WAIT_AFTER_FALLBACK_SEC)
                    } else {
                        debug!(plate = %self.plate, activation = %activation_at, "Vehicle has not left yet, deferring");
                        detection.deferred = Some(
                            detection
                                .deferred
                                .map_or(activation_at, |d| d.min(activation_at)),
                        );
                        continue;
                    }
                }
            };

            let switch_events = rising_edges(&tracks[activation..=last_switch], mask);
            let cargo_type = if kgo { CargoType::Kgo } else { CargoType::Container };
            let end = last_switch_at + Duration::seconds(cfg.sec_after);

            detection.interests.push(self.build(
                activation_at,
                before,
                end,
                after,
                cargo_type,
                &tracks[activation].geo,
                switch_events,
            ));
        }
        Ok(())
    }

    fn detect_alarm_gaps(&self, tracks: &[Track], alarms: &NormalizedAlarms, detection: &mut Detection) {
        let cfg = self.config;
        let mut seen: HashSet<i64> = HashSet::new();

        for (idx, pair) in tracks.windows(2).enumerate() {
            let (left, right) = (&pair[0], &pair[1]);
            if right.ts - left.ts <= cfg.gap_threshold_sec {
                continue;
            }

            for alarm in alarms.in_window(left.ts, right.ts) {
                if !alarm.start_stopped || !seen.insert(alarm.start_ts) {
                    continue;
                }
                let cargo_type = match alarm.cargo.cargo_type() {
                    Some(cargo) => cargo,
                    None => continue,
                };
                detection
                    .interests
                    .push(self.alarm_gap_interest(tracks, idx, alarm, cargo_type, &left.geo));
            }
        }
    }

    fn alarm_gap_interest(
        &self,
        tracks: &[Track],
        gap_start: usize,
        alarm: &NormalizedAlarm,
        cargo_type: CargoType,
        geo: &str,
    ) -> Interest {
        let cfg = self.config;
        // last sample at or before the alarm start
        let anchor = tracks
            .partition_point(|t| t.ts <= alarm.start_ts)
            .checked_sub(1)
            .unwrap_or(gap_start);

        let before = match find_first_stable_stop(tracks, anchor, alarm.start_ts, cfg) {
            StopSearch::Found(t) => t,
            StopSearch::NotFound | StopSearch::LoadingInProgress => {
                alarm.start_dt - Duration::seconds(cfg.sec_before)
            }
        };

        let resume = tracks.partition_point(|t| t.ts <= alarm.end_ts);
        let after = match find_stop_after_lifting(tracks, resume, cfg) {
            Some(departure) => departure - Duration::seconds(cfg.photo_after_shift_sec),
            None => alarm.end_dt + Duration::seconds(cfg.after_fallback_sec),
        };

        let end = if cfg.alarm_gap_end_from_alarm_end {
            alarm.end_dt + Duration::seconds(cfg.sec_after)
        } else {
            alarm.start_dt + Duration::seconds(cfg.sec_after)
        };

        let switch_events = alarm
            .switch_events
            .iter()
            .cloned()
            .map(|e| e.with_source(ALARM_GAP_SOURCE))
            .collect();

        self.build(alarm.start_dt, before, end, after, cargo_type, geo, switch_events)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        activation: NaiveDateTime,
        before: NaiveDateTime,
        end: NaiveDateTime,
        after: NaiveDateTime,
        cargo_type: CargoType,
        geo: &str,
        switch_events: Vec<SwitchEvent>,
    ) -> Interest {
        let day = activation.date();
        let start = clamp_to_day(before, day);
        let after = clamp_to_day(after, day).max(start);
        // the clip must contain the after photo
        let end = clamp_to_day(end, day).max(after);
        let report = InterestReport {
            cargo_type,
            geo: geo.to_string(),
            switches_amount: switch_events.len(),
            switch_events,
        };
        Interest::new(
            self.plate,
            start,
            end,
            start,
            after,
            report,
        )
    }
}

/// One event per IO bit that turns on within `run`.
fn rising_edges(run: &[Track], mask: u32) -> Vec<SwitchEvent> {
    let mut events = Vec::new();
    let mut previous = 0u32;
    for sample in run {
        let rose = sample.io & mask & !previous;
        for io_index in 1..=4u8 {
            if let Some(bit) = io_bit(io_index) {
                if rose & (1 << bit) != 0 {
                    events.push(SwitchEvent::new(sample.at, io_index));
                }
            }
        }
        previous = sample.io & mask;
    }
    events
}

/// Walks back from `from` (inclusive) looking for the stop run that
/// precedes the reference instant `t_ref`.
///
/// The walk inside a run stops once it is `sec_before` away from `t_ref`;
/// the result is never earlier than `t_ref - sec_before`.
pub fn find_first_stable_stop(
    tracks: &[Track],
    from: usize,
    t_ref: i64,
    cfg: &InterestsConfig,
) -> StopSearch {
    if tracks.is_empty() {
        return StopSearch::NotFound;
    }
    let cap = DateTime::from_timestamp(t_ref - cfg.sec_before, 0).map(|d| d.naive_utc());
    let within_lookback = |k: usize| t_ref - tracks[k].ts <= cfg.max_lookback_seconds;

    let mut k = from.min(tracks.len() - 1) as isize;
    loop {
        // skip moving samples
        while k >= 0 && tracks[k as usize].speed > cfg.min_stop_speed {
            if !within_lookback(k as usize) {
                return StopSearch::NotFound;
            }
            k -= 1;
        }
        if k < 0 || !within_lookback(k as usize) {
            return StopSearch::NotFound;
        }

        let run_last = k as usize;
        let mut earliest = run_last;
        loop {
            if t_ref - tracks[earliest].ts >= cfg.sec_before {
                let at = cap.map_or(tracks[earliest].at, |cap| cap.max(tracks[earliest].at));
                return StopSearch::Found(at);
            }
            if earliest == 0 {
                if t_ref - tracks[0].ts < cfg.max_lookback_seconds {
                    return StopSearch::LoadingInProgress;
                }
                break;
            }
            let prev = earliest - 1;
            if tracks[prev].speed > cfg.min_stop_speed || !within_lookback(prev) {
                break;
            }
            earliest = prev;
        }

        if tracks[run_last].ts - tracks[earliest].ts >= cfg.min_stop_duration_sec {
            return StopSearch::Found(tracks[earliest].at);
        }
        k = earliest as isize - 1;
    }
}

/// Forward scan from `from`: a stop run of `min_stop_duration_sec`, then a
/// moving run of `min_move_duration_sec`. Returns the departure instant.
pub fn find_stop_after_lifting(tracks: &[Track], from: usize, cfg: &InterestsConfig) -> Option<NaiveDateTime> {
    let mut stop_since: Option<usize> = None;
    let mut stopped = false;
    let mut moving_since: Option<usize> = None;

    for k in from..tracks.len() {
        let sample = &tracks[k];
        if sample.speed <= cfg.min_stop_speed {
            moving_since = None;
            let since = *stop_since.get_or_insert(k);
            if sample.ts - tracks[since].ts >= cfg.min_stop_duration_sec {
                stopped = true;
            }
        } else if sample.speed >= cfg.min_move_speed {
            if !stopped {
                stop_since = None;
                continue;
            }
            let since = *moving_since.get_or_insert(k);
            if sample.ts - tracks[since].ts >= cfg.min_move_duration_sec {
                return Some(tracks[since].at);
            }
        } else {
            moving_since = None;
            if !stopped {
                stop_since = None;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::alarms::{normalize, NormalizeOptions};
    use chrono::{FixedOffset, NaiveDate};
    use harvest_common::utils::format_local;
    use harvest_common::{RawAlarm, Recorder};

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 10, 15)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn sample(t: NaiveDateTime, sp: i64, io: u32) -> TrackSample {
        TrackSample {
            gt: format_local(&t),
            sp,
            s1: io as i64,
            ps: "55.7558,37.6173".into(),
            vid: Some("A".into()),
        }
    }

    /// One sample per second over `[from, to]`.
    fn series(from: NaiveDateTime, to: NaiveDateTime, f: impl Fn(NaiveDateTime) -> (i64, u32)) -> Vec<Track> {
        let mut samples = vec![];
        let mut t = from;
        while t <= to {
            let (sp, io) = f(t);
            samples.push(sample(t, sp, io));
            t += Duration::seconds(1);
        }
        canonicalize(&samples)
    }

    const BIT_IO4: u32 = 1 << 23;
    const BIT_IO3: u32 = 1 << 22;

    fn detector<'a>(cfg: &'a InterestsConfig, now: NaiveDateTime) -> InterestDetector<'a> {
        InterestDetector::new(cfg, "A", 4, Some(3), now)
    }

    #[test]
    fn switch_triggered_loading() {
        let tracks = series(at(8, 0, 0), at(8, 5, 0), |t| {
            let io = if t >= at(8, 2, 30) && t <= at(8, 3, 30) { BIT_IO4 } else { 0 };
            let sp = if t >= at(8, 3, 45) { 50 } else { 0 };
            (sp, io)
        });
        let cfg = InterestsConfig::default();
        let detection = detector(&cfg, at(12, 0, 0)).detect(&tracks, None).unwrap();

        assert_eq!(detection.interests.len(), 1);
        let interest = &detection.interests[0];
        assert_eq!(interest.name, "A_2025.10.15 08.02.00-08.04.00");
        assert_eq!(interest.photo_before_timestamp, at(8, 2, 0));
        assert_eq!(interest.photo_after_timestamp, at(8, 3, 40));
        assert_eq!(interest.report.cargo_type, CargoType::Container);
        assert_eq!(interest.report.switches_amount, 1);
        assert_eq!(interest.report.switch_events[0], SwitchEvent::new(at(8, 2, 30), 4));
        assert_eq!(interest.report.geo, "55.7558,37.6173");
        assert!(interest.beg_sec <= interest.end_sec);
    }

    #[test]
    fn kgo_bit_wins_cargo_type() {
        let tracks = series(at(8, 0, 0), at(8, 5, 0), |t| {
            let mut io = 0;
            if t >= at(8, 2, 30) && t <= at(8, 3, 0) {
                io |= BIT_IO4;
            }
            if t >= at(8, 2, 50) && t <= at(8, 3, 10) {
                io |= BIT_IO3;
            }
            let sp = if t >= at(8, 3, 45) { 50 } else { 0 };
            (sp, io)
        });
        let cfg = InterestsConfig::default();
        let detection = detector(&cfg, at(12, 0, 0)).detect(&tracks, None).unwrap();

        assert_eq!(detection.interests.len(), 1);
        let report = &detection.interests[0].report;
        assert_eq!(report.cargo_type, CargoType::Kgo);
        assert_eq!(report.switches_amount, 2);
        assert_eq!(detection.interests[0].end_time, at(8, 3, 40));
    }

    #[test]
    fn stop_run_at_window_start_needs_more_history() {
        let shape = |t: NaiveDateTime| {
            let io = if t >= at(12, 0, 20) && t <= at(12, 0, 40) { BIT_IO4 } else { 0 };
            let sp = if t >= at(12, 1, 0) { 50 } else { 0 };
            (sp, io)
        };
        let cfg = InterestsConfig::default();

        let short = series(at(12, 0, 0), at(12, 3, 0), shape);
        let err = detector(&cfg, at(13, 0, 0)).detect(&short, None).unwrap_err();
        assert!(matches!(err, HarvestError::LoadingInProgress));

        let widened = series(at(11, 59, 0), at(12, 3, 0), shape);
        let detection = detector(&cfg, at(13, 0, 0)).detect(&widened, None).unwrap();
        assert_eq!(detection.interests.len(), 1);
        let interest = &detection.interests[0];
        assert_eq!(interest.start_time, at(11, 59, 50));
        assert_eq!(interest.end_time, at(12, 1, 10));
        assert_eq!(interest.photo_after_timestamp, at(12, 0, 55));
    }

    #[test]
    fn alarm_fills_track_gap() {
        let tracks = canonicalize(&[sample(at(10, 0, 0), 0, 0), sample(at(10, 5, 0), 0, 0)]);
        let offset = FixedOffset::east_opt(0).unwrap();
        let alarm = RawAlarm {
            did: "dev1".into(),
            atp: 22,
            atp_str: Some("IO_4报警".into()),
            stm: Some(naive_seconds(&at(10, 1, 0)) * 1000),
            etm: Some(naive_seconds(&at(10, 2, 0)) * 1000),
            ssp: Some(0),
            ..Default::default()
        };
        let cfg = InterestsConfig::default();
        let recorder = Recorder::new(Some("A".into()), at(0, 0, 0));
        let alarms = normalize(&[alarm], &recorder, &NormalizeOptions::from_config(&cfg, offset));

        let detection = detector(&cfg, at(12, 0, 0)).detect(&tracks, Some(&alarms)).unwrap();
        assert_eq!(detection.interests.len(), 1);
        let interest = &detection.interests[0];
        assert_eq!(interest.report.cargo_type, CargoType::Container);
        assert_eq!(interest.report.switch_events[0].source.as_deref(), Some(ALARM_GAP_SOURCE));
        assert_eq!(interest.start_time, at(10, 0, 30));
        assert_eq!(interest.photo_after_timestamp, at(10, 2, 30));
        // alarm start + 30 s would end before the after photo
        assert_eq!(interest.end_time, at(10, 2, 30));

        let mut short_fallback = cfg.clone();
        short_fallback.after_fallback_sec = 10;
        let detection = detector(&short_fallback, at(12, 0, 0)).detect(&tracks, Some(&alarms)).unwrap();
        assert_eq!(detection.interests[0].photo_after_timestamp, at(10, 2, 10));
        assert_eq!(detection.interests[0].end_time, at(10, 2, 10));

        short_fallback.alarm_gap_end_from_alarm_end = true;
        let detection = detector(&short_fallback, at(12, 0, 0)).detect(&tracks, Some(&alarms)).unwrap();
        assert_eq!(detection.interests[0].end_time, at(10, 2, 30));
    }

    #[test]
    fn late_departure_extends_the_interest_to_the_after_photo() {
        let tracks = series(at(8, 0, 0), at(8, 12, 0), |t| {
            let io = if t >= at(8, 2, 30) && t <= at(8, 3, 30) { BIT_IO4 } else { 0 };
            let sp = if t >= at(8, 10, 0) { 50 } else { 0 };
            (sp, io)
        });
        let cfg = InterestsConfig::default();
        let detection = detector(&cfg, at(12, 0, 0)).detect(&tracks, None).unwrap();

        assert_eq!(detection.interests.len(), 1);
        let interest = &detection.interests[0];
        assert_eq!(interest.start_time, at(8, 2, 0));
        assert_eq!(interest.photo_after_timestamp, at(8, 9, 55));
        assert_eq!(interest.end_time, at(8, 9, 55));
        assert!(interest.photo_after_timestamp <= interest.end_time);
        assert_eq!(interest.name, "A_2025.10.15 08.02.00-08.09.55");
    }

    #[test]
    fn moving_or_unknown_alarms_in_gap_are_ignored() {
        let tracks = canonicalize(&[sample(at(10, 0, 0), 0, 0), sample(at(10, 5, 0), 0, 0)]);
        let offset = FixedOffset::east_opt(0).unwrap();
        let cfg = InterestsConfig::default();
        let recorder = Recorder::new(Some("A".into()), at(0, 0, 0));
        let raw = |label: &str, ssp: i64| RawAlarm {
            did: "dev1".into(),
            atp: 21,
            atp_str: Some(label.into()),
            stm: Some(naive_seconds(&at(10, 1, 0)) * 1000),
            ssp: Some(ssp),
            ..Default::default()
        };
        // IO_1 is not mapped to any cargo; IO_4 at speed is not stationary
        let alarms = normalize(
            &[raw("IO_1报警", 0), raw("IO_4报警", 400)],
            &recorder,
            &NormalizeOptions::from_config(&cfg, offset),
        );
        let detection = detector(&cfg, at(12, 0, 0)).detect(&tracks, Some(&alarms)).unwrap();
        assert!(detection.interests.is_empty());
    }

    #[test]
    fn empty_and_single_sample_tracks_yield_nothing() {
        let cfg = InterestsConfig::default();
        let d = detector(&cfg, at(12, 0, 0));
        assert!(d.detect(&[], None).unwrap().interests.is_empty());

        let single = canonicalize(&[sample(at(8, 0, 0), 0, BIT_IO4)]);
        assert!(d.detect(&single, None).unwrap().interests.is_empty());
    }

    #[test]
    fn vehicle_still_parked_is_deferred_then_falls_back() {
        let tracks = series(at(8, 0, 0), at(8, 5, 0), |t| {
            let io = if t >= at(8, 2, 30) && t <= at(8, 3, 30) { BIT_IO4 } else { 0 };
            (0, io)
        });
        let cfg = InterestsConfig::default();

        let detection = detector(&cfg, at(8, 5, 0)).detect(&tracks, None).unwrap();
        assert!(detection.interests.is_empty());
        assert_eq!(detection.deferred, Some(at(8, 2, 30)));

        let detection = detector(&cfg, at(8, 20, 0)).detect(&tracks, None).unwrap();
        assert_eq!(detection.interests.len(), 1);
        assert_eq!(detection.interests[0].photo_after_timestamp, at(8, 4, 30));
        assert!(detection.deferred.is_none());
    }

    #[test]
    fn canonicalize_sorts_and_drops_bad_samples() {
        let mut bad = sample(at(8, 0, 5), 0, 0);
        bad.gt = "yesterday".into();
        let tracks = canonicalize(&[
            sample(at(8, 0, 2), 10, 0),
            bad,
            sample(at(8, 0, 1), 0, 0),
            sample(at(8, 0, 2), 99, 0),
        ]);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].at, at(8, 0, 1));
        assert_eq!(tracks[1].speed, 10);
    }

    #[test]
    fn interest_bounds_stay_inside_the_day() {
        let day_start = at(0, 0, 0);
        let tracks = series(day_start - Duration::seconds(120), day_start + Duration::seconds(120), |t| {
            let io = if t >= day_start && t <= day_start + Duration::seconds(10) { BIT_IO4 } else { 0 };
            let sp = if t >= day_start + Duration::seconds(40) { 50 } else { 0 };
            (sp, io)
        });
        let cfg = InterestsConfig::default();
        let detection = detector(&cfg, at(12, 0, 0)).detect(&tracks, None).unwrap();
        assert_eq!(detection.interests.len(), 1);
        let interest = &detection.interests[0];
        assert_eq!(interest.start_time, day_start);
        assert_eq!(interest.start_time.date(), interest.end_time.date());
    }
}
