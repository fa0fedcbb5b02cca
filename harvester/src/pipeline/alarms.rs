//! Raw CMS alarms → canonical, time-sorted, cluster-merged stream.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime};
use harvest_common::utils::{naive_seconds, parse_local};
use harvest_common::{merge_switch_events, CargoType, RawAlarm, Recorder, SwitchEvent};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::config::InterestsConfig;

const DEFAULT_ALARM_DURATION_SEC: i64 = 30;

/// Cargo classification of an alarm. Ordered by merge priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlarmCargo {
    Unknown,
    Euro,
    Kgo,
}

impl AlarmCargo {
    pub fn cargo_type(self) -> Option<CargoType> {
        match self {
            AlarmCargo::Euro => Some(CargoType::Container),
            AlarmCargo::Kgo => Some(CargoType::Kgo),
            AlarmCargo::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAlarm {
    pub dev_idno: String,
    pub plate: Option<String>,
    pub atp: i32,
    pub io_index: u8,
    pub cargo: AlarmCargo,
    pub start_dt: NaiveDateTime,
    pub end_dt: NaiveDateTime,
    pub start_ts: i64,
    pub end_ts: i64,
    pub ssp_kmh: f64,
    pub esp_kmh: f64,
    pub start_stopped: bool,
    pub switch_events: Vec<SwitchEvent>,
    pub io_indices: BTreeSet<u8>,
}

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub allowed_types: Vec<i32>,
    pub min_stop_kmh: f64,
    pub merge_gap_sec: i64,
    /// Offset of the recorders' clock, applied to `stm`/`etm`.
    pub offset: FixedOffset,
}

impl NormalizeOptions {
    pub fn from_config(config: &InterestsConfig, offset: FixedOffset) -> Self {
        Self {
            allowed_types: config.allowed_alarm_types.clone(),
            min_stop_kmh: config.min_stop_kmh,
            merge_gap_sec: config.merge_gap_sec,
            offset,
        }
    }
}

/// Normalized alarms plus their sorted start seconds for window lookups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedAlarms {
    pub alarms: Vec<NormalizedAlarm>,
    pub starts: Vec<i64>,
    max_span: i64,
}

impl NormalizedAlarms {
    pub fn new(alarms: Vec<NormalizedAlarm>) -> Self {
        let starts = alarms.iter().map(|a| a.start_ts).collect();
        let max_span = alarms
            .iter()
            .map(|a| a.end_ts - a.start_ts)
            .max()
            .unwrap_or(0)
            .max(0);
        Self {
            alarms,
            starts,
            max_span,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    /// Alarms whose `[start_ts, end_ts]` intersects `[t0, t1]`.
    pub fn in_window(&self, t0: i64, t1: i64) -> impl Iterator<Item = &NormalizedAlarm> {
        let lo = self.starts.partition_point(|&s| s < t0 - self.max_span);
        let hi = self.starts.partition_point(|&s| s <= t1).max(lo);
        self.alarms[lo..hi].iter().filter(move |a| a.end_ts >= t0)
    }
}

pub fn normalize(raw: &[RawAlarm], recorder: &Recorder, opts: &NormalizeOptions) -> NormalizedAlarms {
    let mut alarms: Vec<NormalizedAlarm> = raw
        .iter()
        .filter(|a| opts.allowed_types.contains(&a.atp))
        .filter_map(|a| normalize_one(a, recorder, opts))
        .collect();

    sort_alarms(&mut alarms);
    let merged = merge_clusters(alarms, opts.merge_gap_sec);
    debug!(raw = raw.len(), normalized = merged.len(), "Alarms normalized");
    NormalizedAlarms::new(merged)
}

fn normalize_one(raw: &RawAlarm, recorder: &Recorder, opts: &NormalizeOptions) -> Option<NormalizedAlarm> {
    let start_dt = match alarm_time(raw.stm, raw.b_time_str.as_deref(), opts.offset) {
        Some(t) => t,
        None => {
            warn!(did = %raw.did, atp = raw.atp, "Alarm without usable start time dropped");
            return None;
        }
    };
    let end_dt = alarm_time(raw.etm, raw.e_time_str.as_deref(), opts.offset)
        .filter(|end| *end >= start_dt)
        .unwrap_or(start_dt + Duration::seconds(DEFAULT_ALARM_DURATION_SEC));

    let io_index = match raw
        .atp_str
        .as_deref()
        .and_then(io_index_from_label)
        .or_else(|| io_index_from_type(raw.atp))
    {
        Some(io) => io,
        None => {
            warn!(did = %raw.did, atp = raw.atp, "Alarm with unknown IO index dropped");
            return None;
        }
    };

    let cargo = if io_index == recorder.euro_container_alarm {
        AlarmCargo::Euro
    } else if recorder.kgo_container_alarm == Some(io_index) {
        AlarmCargo::Kgo
    } else {
        AlarmCargo::Unknown
    };

    let ssp_kmh = raw.ssp.unwrap_or(0) as f64 / 10.0;
    let esp_kmh = raw.esp.unwrap_or(0) as f64 / 10.0;

    Some(NormalizedAlarm {
        dev_idno: raw.did.clone(),
        plate: raw.vid.clone(),
        atp: raw.atp,
        io_index,
        cargo,
        start_dt,
        end_dt,
        start_ts: naive_seconds(&start_dt),
        end_ts: naive_seconds(&end_dt),
        ssp_kmh,
        esp_kmh,
        start_stopped: ssp_kmh <= opts.min_stop_kmh,
        switch_events: vec![SwitchEvent::new(start_dt, io_index)],
        io_indices: BTreeSet::from([io_index]),
    })
}

/// `stm`/`etm` are UTC milliseconds; the `*TimeStr` twins are already local.
fn alarm_time(millis: Option<i64>, text: Option<&str>, offset: FixedOffset) -> Option<NaiveDateTime> {
    millis
        .filter(|ms| *ms > 0)
        .and_then(|ms| DateTime::from_timestamp(ms.div_euclid(1000), 0))
        .map(|utc| utc.with_timezone(&offset).naive_local())
        .or_else(|| text.and_then(parse_local))
}

/// `"IO_4报警"` → 4.
pub fn io_index_from_label(label: &str) -> Option<u8> {
    let rest = label.trim().strip_prefix("IO_")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<u8>().ok().filter(|io| (1..=4).contains(io))
}

pub fn io_index_from_type(atp: i32) -> Option<u8> {
    match atp {
        19 => Some(1),
        20 => Some(2),
        21 => Some(3),
        22 => Some(4),
        _ => None,
    }
}

fn sort_alarms(alarms: &mut [NormalizedAlarm]) {
    alarms.sort_by(|a, b| {
        a.start_ts
            .cmp(&b.start_ts)
            .then(a.end_ts.cmp(&b.end_ts))
            .then(a.io_index.cmp(&b.io_index))
    });
}

/// Greedy stationary-cluster merge over alarms sorted by start.
pub fn merge_clusters(alarms: Vec<NormalizedAlarm>, merge_gap_sec: i64) -> Vec<NormalizedAlarm> {
    let mut merged: Vec<NormalizedAlarm> = Vec::with_capacity(alarms.len());

    for next in alarms {
        if let Some(cur) = merged.last_mut() {
            if cur.dev_idno == next.dev_idno
                && next.start_stopped
                && next.start_ts - cur.end_ts <= merge_gap_sec
            {
                if next.end_ts > cur.end_ts {
                    cur.end_ts = next.end_ts;
                    cur.end_dt = next.end_dt;
                    cur.esp_kmh = next.esp_kmh;
                }
                cur.io_indices.extend(next.io_indices.iter().copied());
                cur.cargo = cur.cargo.max(next.cargo);
                merge_switch_events(&mut cur.switch_events, &next.switch_events);
                continue;
            }
        }
        merged.push(next);
    }

    merged
}
