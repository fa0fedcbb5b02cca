use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::utils::{self, local_datetime};

/// Capacity of the per-recorder ring of completed interest names.
pub const PROCESSED_RING_CAPACITY: usize = 1000;

/// Cargo kind carried by an interest report.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CargoType {
    #[serde(rename = "Контейнер")]
    Container,
    #[serde(rename = "КГО")]
    Kgo,
}

impl CargoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CargoType::Container => "Контейнер",
            CargoType::Kgo => "КГО",
        }
    }

    /// KGO wins over a plain container when two events are fused.
    pub fn strongest(self, other: CargoType) -> CargoType {
        if self == CargoType::Kgo || other == CargoType::Kgo {
            CargoType::Kgo
        } else {
            CargoType::Container
        }
    }
}

/// A single limit-switch activation attached to an interest report.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct SwitchEvent {
    #[serde(with = "local_datetime")]
    pub datetime: NaiveDateTime,
    /// IO index (1..=4) of the switch that fired.
    pub switch: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl SwitchEvent {
    pub fn new(datetime: NaiveDateTime, switch: u8) -> Self {
        Self {
            datetime,
            switch,
            source: None,
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }
}

/// Appends `incoming` events to `events`, skipping duplicates by
/// `(datetime, switch, source)`. Result stays sorted by datetime.
pub fn merge_switch_events(events: &mut Vec<SwitchEvent>, incoming: &[SwitchEvent]) {
    for event in incoming {
        if !events.contains(event) {
            events.push(event.clone());
        }
    }
    events.sort_by(|a, b| {
        a.datetime
            .cmp(&b.datetime)
            .then(a.switch.cmp(&b.switch))
            .then(a.source.cmp(&b.source))
    });
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InterestReport {
    pub cargo_type: CargoType,
    /// "lat,lon" as reported by the recorder.
    pub geo: String,
    pub switches_amount: usize,
    pub switch_events: Vec<SwitchEvent>,
}

/// A detected loading/unloading event awaiting (or done with) harvesting.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Interest {
    pub name: String,
    #[serde(with = "local_datetime")]
    pub start_time: NaiveDateTime,
    #[serde(with = "local_datetime")]
    pub end_time: NaiveDateTime,
    pub beg_sec: u32,
    pub end_sec: u32,
    #[serde(with = "local_datetime")]
    pub photo_before_timestamp: NaiveDateTime,
    #[serde(with = "local_datetime")]
    pub photo_after_timestamp: NaiveDateTime,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub car_number: String,
    pub report: InterestReport,
    #[serde(default)]
    pub cloud_folder: Option<String>,
    #[serde(default)]
    pub pics_before_folder: Option<String>,
    #[serde(default)]
    pub pics_after_folder: Option<String>,
}

impl Interest {
    pub fn new(
        plate: &str,
        start_time: NaiveDateTime,
        end_time: NaiveDateTime,
        photo_before_timestamp: NaiveDateTime,
        photo_after_timestamp: NaiveDateTime,
        report: InterestReport,
    ) -> Self {
        let mut interest = Self {
            name: String::new(),
            start_time,
            end_time,
            beg_sec: 0,
            end_sec: 0,
            photo_before_timestamp,
            photo_after_timestamp,
            year: 0,
            month: 0,
            day: 0,
            car_number: plate.to_string(),
            report,
            cloud_folder: None,
            pics_before_folder: None,
            pics_after_folder: None,
        };
        interest.set_bounds(start_time, end_time);
        interest
    }

    /// Rewrites start/end and every field derived from them, name included.
    pub fn set_bounds(&mut self, start_time: NaiveDateTime, end_time: NaiveDateTime) {
        self.start_time = start_time;
        self.end_time = end_time;
        self.beg_sec = utils::seconds_of_day(&start_time);
        self.end_sec = utils::seconds_of_day(&end_time);
        self.year = start_time.year();
        self.month = start_time.month();
        self.day = start_time.day();
        self.name = utils::interest_name(&self.car_number, &start_time, &end_time);
    }

    pub fn date(&self) -> NaiveDate {
        self.start_time.date()
    }
}

/// Per-recorder configuration and harvesting bookkeeping.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Validate)]
pub struct Recorder {
    #[serde(default)]
    pub ignore: bool,
    #[serde(default)]
    pub plate: Option<String>,
    #[serde(default)]
    pub chanel_id: u8,
    #[serde(with = "local_datetime")]
    pub last_upload_time: NaiveDateTime,
    #[serde(default = "default_euro_alarm")]
    #[validate(range(min = 1, max = 4))]
    pub euro_container_alarm: u8,
    #[serde(default)]
    #[validate(range(min = 1, max = 4))]
    pub kgo_container_alarm: Option<u8>,
    #[serde(default)]
    pub pending_interests: Vec<Interest>,
    #[serde(default)]
    pub processed_interests: Vec<String>,
}

fn default_euro_alarm() -> u8 {
    4
}

impl Recorder {
    pub fn new(plate: Option<String>, last_upload_time: NaiveDateTime) -> Self {
        Self {
            ignore: false,
            plate,
            chanel_id: 0,
            last_upload_time,
            euro_container_alarm: default_euro_alarm(),
            kgo_container_alarm: None,
            pending_interests: Vec::new(),
            processed_interests: Vec::new(),
        }
    }

    /// Plate used in names and cloud paths; falls back to the recorder id.
    pub fn plate_or<'a>(&'a self, reg_id: &'a str) -> &'a str {
        self.plate.as_deref().filter(|p| !p.is_empty()).unwrap_or(reg_id)
    }

    pub fn is_processed(&self, name: &str) -> bool {
        self.processed_interests.iter().any(|n| n == name)
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending_interests.iter().any(|i| i.name == name)
    }

    /// Adds a completed name to the ring, dropping the oldest beyond capacity.
    pub fn push_processed(&mut self, name: &str) {
        if self.is_processed(name) {
            return;
        }
        self.processed_interests.push(name.to_string());
        let overflow = self
            .processed_interests
            .len()
            .saturating_sub(PROCESSED_RING_CAPACITY);
        if overflow > 0 {
            self.processed_interests.drain(..overflow);
        }
    }
}

/// Raw track sample as returned by the CMS `queryTrackDetail` endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TrackSample {
    /// Local timestamp string, "YYYY-MM-DD HH:MM:SS".
    #[serde(default)]
    pub gt: String,
    /// Speed, km/h × 10.
    #[serde(default)]
    pub sp: i64,
    /// IO status bitfield.
    #[serde(default)]
    pub s1: i64,
    #[serde(default)]
    pub ps: String,
    #[serde(default)]
    pub vid: Option<String>,
}

impl TrackSample {
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        utils::parse_local(&self.gt)
    }

    pub fn io_bits(&self) -> u32 {
        self.s1 as u32
    }
}

/// Raw alarm record as returned by the CMS `queryAlarmDetail` endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RawAlarm {
    #[serde(default)]
    pub did: String,
    #[serde(default)]
    pub vid: Option<String>,
    #[serde(default)]
    pub atp: i32,
    #[serde(default, rename = "atpStr")]
    pub atp_str: Option<String>,
    /// Start, milliseconds since epoch (UTC).
    #[serde(default)]
    pub stm: Option<i64>,
    #[serde(default, rename = "bTimeStr")]
    pub b_time_str: Option<String>,
    #[serde(default)]
    pub etm: Option<i64>,
    #[serde(default, rename = "eTimeStr")]
    pub e_time_str: Option<String>,
    /// Speed at start, km/h × 10.
    #[serde(default)]
    pub ssp: Option<i64>,
    #[serde(default)]
    pub esp: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OnlineDevice {
    pub did: String,
    #[serde(default)]
    pub vid: Option<String>,
}

/// Candidate recording returned by `getVideoFileInfo`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct VideoFileInfo {
    #[serde(rename = "DownTaskUrl", default)]
    pub down_task_url: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub chn: Option<i64>,
    #[serde(default)]
    pub beg: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    #[serde(default)]
    pub len: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 10, 15)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn report() -> InterestReport {
        InterestReport {
            cargo_type: CargoType::Container,
            geo: "55.75,37.61".to_string(),
            switches_amount: 1,
            switch_events: vec![SwitchEvent::new(at(8, 2, 30), 4)],
        }
    }

    #[test]
    fn interest_derives_name_and_seconds() {
        let interest = Interest::new("A", at(8, 2, 0), at(8, 4, 0), at(8, 2, 0), at(8, 3, 40), report());
        assert_eq!(interest.name, "A_2025.10.15 08.02.00-08.04.00");
        assert_eq!(interest.beg_sec, 8 * 3600 + 120);
        assert_eq!(interest.end_sec, 8 * 3600 + 240);
        assert_eq!((interest.year, interest.month, interest.day), (2025, 10, 15));
    }

    #[test]
    fn interest_json_uses_local_format() {
        let interest = Interest::new("A", at(8, 2, 0), at(8, 4, 0), at(8, 2, 0), at(8, 3, 40), report());
        let json = serde_json::to_value(&interest).unwrap();
        assert_eq!(json["start_time"], "2025-10-15 08:02:00");
        assert_eq!(json["report"]["cargo_type"], "Контейнер");

        let back: Interest = serde_json::from_value(json).unwrap();
        assert_eq!(back, interest);
    }

    #[test]
    fn processed_ring_drops_oldest() {
        let mut recorder = Recorder::new(Some("A".into()), at(0, 0, 0));
        for i in 0..(PROCESSED_RING_CAPACITY + 5) {
            recorder.push_processed(&format!("n{i}"));
        }
        assert_eq!(recorder.processed_interests.len(), PROCESSED_RING_CAPACITY);
        assert!(!recorder.is_processed("n0"));
        assert!(recorder.is_processed(&format!("n{}", PROCESSED_RING_CAPACITY + 4)));
    }

    #[test]
    fn recorder_rejects_out_of_range_io() {
        let mut recorder = Recorder::new(None, at(0, 0, 0));
        assert!(recorder.validate().is_ok());
        recorder.euro_container_alarm = 7;
        assert!(recorder.validate().is_err());
    }

    #[test]
    fn switch_event_merge_dedups() {
        let mut events = vec![SwitchEvent::new(at(8, 0, 0), 4)];
        merge_switch_events(
            &mut events,
            &[
                SwitchEvent::new(at(8, 0, 0), 4),
                SwitchEvent::new(at(7, 59, 0), 3),
            ],
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].switch, 3);
    }
}
