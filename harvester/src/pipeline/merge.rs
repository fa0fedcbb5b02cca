use harvest_common::merge_switch_events;
use harvest_common::utils::naive_seconds;
use harvest_common::Interest;

/// Intervals closer than this are treated as touching.
const TOUCH_TOLERANCE_SEC: i64 = 1;

/// Fuses interests of the same vehicle and day whose intervals overlap or
/// touch. The result is sorted by start and has no touching neighbours.
pub fn merge_overlapping(mut interests: Vec<Interest>) -> Vec<Interest> {
    interests.sort_by(|a, b| {
        a.car_number
            .cmp(&b.car_number)
            .then(a.start_time.cmp(&b.start_time))
            .then(a.end_time.cmp(&b.end_time))
    });

    let mut merged: Vec<Interest> = Vec::with_capacity(interests.len());
    for next in interests {
        match merged.last_mut() {
            Some(cur) if touches(cur, &next) => absorb(cur, next),
            _ => merged.push(next),
        }
    }
    merged
}

/// True when the two interests would be fused by [`merge_overlapping`].
pub fn overlapping(a: &Interest, b: &Interest) -> bool {
    if a.start_time <= b.start_time {
        touches(a, b)
    } else {
        touches(b, a)
    }
}

fn touches(cur: &Interest, next: &Interest) -> bool {
    cur.car_number == next.car_number
        && cur.date() == next.date()
        && naive_seconds(&next.start_time) <= naive_seconds(&cur.end_time) + TOUCH_TOLERANCE_SEC
}

fn absorb(cur: &mut Interest, next: Interest) {
    let start = cur.start_time.min(next.start_time);
    let end = cur.end_time.max(next.end_time);
    if start != cur.start_time || end != cur.end_time {
        cur.set_bounds(start, end);
    }

    cur.photo_before_timestamp = cur.photo_before_timestamp.min(next.photo_before_timestamp);
    cur.photo_after_timestamp = cur.photo_after_timestamp.max(next.photo_after_timestamp);

    let report = &mut cur.report;
    report.cargo_type = report.cargo_type.strongest(next.report.cargo_type);
    merge_switch_events(&mut report.switch_events, &next.report.switch_events);
    report.switches_amount = report.switch_events.len();

    if cur.cloud_folder.is_none() {
        cur.cloud_folder = next.cloud_folder;
        cur.pics_before_folder = next.pics_before_folder;
        cur.pics_after_folder = next.pics_after_folder;
    }
}
