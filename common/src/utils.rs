use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

/// Wire and state-file format of every local naive timestamp.
pub const LOCAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub fn parse_local(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), LOCAL_FORMAT).ok()
}

pub fn format_local(value: &NaiveDateTime) -> String {
    value.format(LOCAL_FORMAT).to_string()
}

pub fn seconds_of_day(value: &NaiveDateTime) -> u32 {
    value.time().num_seconds_from_midnight()
}

/// Local naive clock as plain seconds, used for every ordering comparison.
pub fn naive_seconds(value: &NaiveDateTime) -> i64 {
    value.and_utc().timestamp()
}

pub fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// 23:59:59 of the given day.
pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    start_of_day(date) + Duration::seconds(86_399)
}

pub fn start_of_next_day(value: &NaiveDateTime) -> NaiveDateTime {
    start_of_day(value.date()) + Duration::days(1)
}

/// Clamps `value` into `[00:00:00, 23:59:59]` of `date`.
pub fn clamp_to_day(value: NaiveDateTime, date: NaiveDate) -> NaiveDateTime {
    value.clamp(start_of_day(date), end_of_day(date))
}

/// `{plate}_{YYYY.MM.DD HH.MM.SS-HH.MM.SS}`, both bounds truncated to seconds.
pub fn interest_name(plate: &str, start: &NaiveDateTime, end: &NaiveDateTime) -> String {
    format!(
        "{}_{}-{}",
        plate,
        start.format("%Y.%m.%d %H.%M.%S"),
        end.format("%H.%M.%S")
    )
}

/// Folder-style date label, `YYYY.MM.DD`.
pub fn date_label(date: &NaiveDate) -> String {
    date.format("%Y.%m.%d").to_string()
}

/// Parses a "lat,lon" pair.
pub fn parse_geo(value: &str) -> Option<(f64, f64)> {
    let (lat, lon) = value.split_once(',')?;
    let lat = lat.trim().parse::<f64>().ok()?;
    let lon = lon.trim().parse::<f64>().ok()?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some((lat, lon))
}

/// Great-circle distance in meters.
pub fn haversine_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs > 60 {
        let mins = secs / 60;
        let secs = secs % 60;
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

pub fn validate_url(url: &str) -> Result<(), String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(format!("URL must start with http:// or https://: {}", url))
    }
}

pub fn generate_unique_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Serde adapter for `NaiveDateTime` in [`LOCAL_FORMAT`].
pub mod local_datetime {
    use super::LOCAL_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(LOCAL_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(raw.trim(), LOCAL_FORMAT).map_err(de::Error::custom)
    }
}
