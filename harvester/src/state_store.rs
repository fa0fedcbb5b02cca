//! Persistent per-recorder state (`states.json`).
//!
//! The whole document is read and rewritten on every operation. Writes go
//! to a sibling temp file which is fsynced and renamed over the original;
//! every access holds an exclusive OS lock on the `.lock` sidecar.

use chrono::{Duration, NaiveDateTime};
use fs2::FileExt;
use harvest_common::{Interest, Recorder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::clock::Clock;
use crate::error::{HarvestError, Result};
use crate::pipeline::{merge_overlapping, overlapping};

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct StateDocument {
    #[serde(default)]
    pub regs: BTreeMap<String, Recorder>,
}

pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    default_lookback: Duration,
    clock: Arc<dyn Clock>,
    // serializes tasks of this process; the file lock covers other processes
    local: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, default_lookback_days: i64, clock: Arc<dyn Clock>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            default_lookback: Duration::days(default_lookback_days),
            clock,
            local: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `apply` against the locked document and persists it when
    /// `apply` reports a change.
    async fn transact<T, F>(&self, apply: F) -> Result<T>
    where
        F: FnOnce(&mut StateDocument) -> Result<(T, bool)> + Send + 'static,
        T: Send + 'static,
    {
        let _local = self.local.lock().await;
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();

        tokio::task::spawn_blocking(move || {
            let lock = acquire_lock(&lock_path)?;
            let outcome = (|| {
                let mut doc = load_document(&path)?;
                let (value, dirty) = apply(&mut doc)?;
                if dirty {
                    save_document(&path, &doc)?;
                }
                Ok(value)
            })();
            if let Err(e) = lock.unlock() {
                warn!(path = %lock_path.display(), "Failed to release state lock: {}", e);
            }
            outcome
        })
        .await
        .map_err(|e| HarvestError::StateIo(format!("state task failed: {}", e)))?
    }

    /// Returns a copy of the recorder, creating it with defaults when missing.
    pub async fn get_recorder(&self, reg_id: &str) -> Result<Recorder> {
        let reg_id = reg_id.to_string();
        let default_watermark = self.clock.now() - self.default_lookback;
        self.transact(move |doc| {
            if let Some(recorder) = doc.regs.get(&reg_id) {
                return Ok((recorder.clone(), false));
            }
            info!(reg_id = %reg_id, "Registering new recorder");
            let recorder = Recorder::new(None, default_watermark);
            doc.regs.insert(reg_id, recorder.clone());
            Ok((recorder, true))
        })
        .await
    }

    /// Creates the recorder if missing; fills in the plate when it was unknown.
    pub async fn create_recorder(&self, reg_id: &str, plate: Option<&str>) -> Result<Recorder> {
        let reg_id = reg_id.to_string();
        let plate = plate.filter(|p| !p.is_empty()).map(str::to_string);
        let default_watermark = self.clock.now() - self.default_lookback;
        self.transact(move |doc| {
            match doc.regs.get_mut(&reg_id) {
                Some(recorder) => {
                    if recorder.plate.is_none() && plate.is_some() {
                        recorder.plate = plate;
                        return Ok((recorder.clone(), true));
                    }
                    Ok((recorder.clone(), false))
                }
                None => {
                    info!(reg_id = %reg_id, plate = ?plate, "Registering new recorder");
                    let recorder = Recorder::new(plate, default_watermark);
                    doc.regs.insert(reg_id, recorder.clone());
                    Ok((recorder, true))
                }
            }
        })
        .await
    }

    pub async fn recorders(&self) -> Result<BTreeMap<String, Recorder>> {
        self.transact(|doc| Ok((doc.regs.clone(), false))).await
    }

    /// Advances the watermark and returns the stored value. A `ts` not
    /// later than the stored watermark changes nothing.
    pub async fn set_last_upload_time(&self, reg_id: &str, ts: NaiveDateTime) -> Result<NaiveDateTime> {
        let reg_id = reg_id.to_string();
        self.transact(move |doc| {
            let recorder = recorder_mut(doc, &reg_id)?;
            if ts <= recorder.last_upload_time {
                return Ok((recorder.last_upload_time, false));
            }
            debug!(reg_id = %reg_id, from = %recorder.last_upload_time, to = %ts, "Watermark advanced");
            recorder.last_upload_time = ts;
            Ok((ts, true))
        })
        .await
    }

    /// Union by name: interests already pending or already processed are
    /// skipped. A new interest overlapping a pending one is fused into it
    /// in place; the rest are appended in order. Returns how many entries
    /// were appended.
    pub async fn append_pending(&self, reg_id: &str, interests: Vec<Interest>) -> Result<usize> {
        if interests.is_empty() {
            return Ok(0);
        }
        let reg_id = reg_id.to_string();
        self.transact(move |doc| {
            let recorder = recorder_mut(doc, &reg_id)?;
            let mut added = 0;
            let mut dirty = false;
            for interest in interests {
                if recorder.is_pending(&interest.name) || recorder.is_processed(&interest.name) {
                    continue;
                }
                let slot = recorder
                    .pending_interests
                    .iter()
                    .position(|p| overlapping(p, &interest));
                match slot {
                    Some(slot) => {
                        let existing = recorder.pending_interests[slot].clone();
                        if let [merged] = merge_overlapping(vec![existing, interest]).as_slice() {
                            debug!(reg_id = %reg_id, into = %merged.name, "Interest fused with pending entry");
                            recorder.pending_interests[slot] = merged.clone();
                            dirty = true;
                        }
                    }
                    None => {
                        recorder.pending_interests.push(interest);
                        added += 1;
                        dirty = true;
                    }
                }
            }
            Ok((added, dirty))
        })
        .await
    }

    /// Replaces the pending entry with the same name (folder assignment etc).
    pub async fn update_pending(&self, reg_id: &str, interest: Interest) -> Result<bool> {
        let reg_id = reg_id.to_string();
        self.transact(move |doc| {
            let recorder = recorder_mut(doc, &reg_id)?;
            match recorder
                .pending_interests
                .iter_mut()
                .find(|i| i.name == interest.name)
            {
                Some(slot) if *slot != interest => {
                    *slot = interest;
                    Ok((true, true))
                }
                Some(_) => Ok((true, false)),
                None => Ok((false, false)),
            }
        })
        .await
    }

    pub async fn remove_pending(&self, reg_id: &str, name: &str) -> Result<bool> {
        let reg_id = reg_id.to_string();
        let name = name.to_string();
        self.transact(move |doc| {
            let recorder = recorder_mut(doc, &reg_id)?;
            let before = recorder.pending_interests.len();
            recorder.pending_interests.retain(|i| i.name != name);
            let removed = recorder.pending_interests.len() != before;
            Ok((removed, removed))
        })
        .await
    }

    pub async fn is_processed(&self, reg_id: &str, name: &str) -> Result<bool> {
        let reg_id = reg_id.to_string();
        let name = name.to_string();
        self.transact(move |doc| {
            let processed = doc
                .regs
                .get(&reg_id)
                .map(|r| r.is_processed(&name))
                .unwrap_or(false);
            Ok((processed, false))
        })
        .await
    }

    /// Marks the interest processed and drops it from pending in one write,
    /// so a crash can never leave it in neither or both places.
    pub async fn mark_processed(&self, reg_id: &str, name: &str) -> Result<()> {
        let reg_id = reg_id.to_string();
        let name = name.to_string();
        self.transact(move |doc| {
            let recorder = recorder_mut(doc, &reg_id)?;
            recorder.push_processed(&name);
            recorder.pending_interests.retain(|i| i.name != name);
            Ok(((), true))
        })
        .await
    }
}

fn recorder_mut<'a>(doc: &'a mut StateDocument, reg_id: &str) -> Result<&'a mut Recorder> {
    doc.regs
        .get_mut(reg_id)
        .ok_or_else(|| HarvestError::UnknownRecorder(reg_id.to_string()))
}

fn acquire_lock(lock_path: &Path) -> Result<File> {
    if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(state_io)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(lock_path)
        .map_err(state_io)?;
    file.lock_exclusive().map_err(state_io)?;
    Ok(file)
}

fn load_document(path: &Path) -> Result<StateDocument> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StateDocument::default()),
        Err(e) => return Err(state_io(e)),
    };
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(StateDocument::default());
    }
    let doc: StateDocument = serde_json::from_slice(&raw)
        .map_err(|e| HarvestError::StateIo(format!("{}: {}", path.display(), e)))?;
    for (reg_id, recorder) in &doc.regs {
        recorder
            .validate()
            .map_err(|e| HarvestError::StateIo(format!("recorder {}: {}", reg_id, e)))?;
    }
    Ok(doc)
}

fn save_document(path: &Path, doc: &StateDocument) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let body = serde_json::to_vec_pretty(doc)
        .map_err(|e| HarvestError::StateIo(format!("encode state: {}", e)))?;
    {
        let mut file = File::create(&tmp_path).map_err(state_io)?;
        file.write_all(&body).map_err(state_io)?;
        file.sync_all().map_err(state_io)?;
    }
    fs::rename(&tmp_path, path).map_err(state_io)?;
    Ok(())
}

fn state_io(error: std::io::Error) -> HarvestError {
    HarvestError::StateIo(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::NaiveDate;
    use harvest_common::{CargoType, InterestReport};

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 10, 15)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn interest(start: NaiveDateTime, end: NaiveDateTime) -> Interest {
        Interest::new(
            "A",
            start,
            end,
            start,
            end,
            InterestReport {
                cargo_type: CargoType::Container,
                geo: "55.0,37.0".into(),
                switches_amount: 0,
                switch_events: vec![],
            },
        )
    }

    fn store(dir: &tempfile::TempDir) -> StateStore {
        let clock = Arc::new(FixedClock::new(at(12, 0, 0)));
        StateStore::new(dir.path().join("states.json"), 7, clock)
    }

    #[tokio::test]
    async fn missing_recorder_is_created_with_week_old_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let recorder = store.get_recorder("dev1").await.unwrap();
        assert_eq!(recorder.last_upload_time, at(12, 0, 0) - Duration::days(7));
        assert!(recorder.pending_interests.is_empty());

        let raw = std::fs::read_to_string(dir.path().join("states.json")).unwrap();
        assert!(raw.contains("\"dev1\""));
        assert!(dir.path().join("states.json.lock").exists());
        assert!(!dir.path().join("states.json.tmp").exists());
    }

    #[tokio::test]
    async fn create_recorder_fills_missing_plate_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        store.get_recorder("dev1").await.unwrap();
        let recorder = store.create_recorder("dev1", Some("A123")).await.unwrap();
        assert_eq!(recorder.plate.as_deref(), Some("A123"));
        let recorder = store.create_recorder("dev1", Some("B456")).await.unwrap();
        assert_eq!(recorder.plate.as_deref(), Some("A123"));
    }

    #[tokio::test]
    async fn watermark_never_moves_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.get_recorder("dev1").await.unwrap();

        let mut observed = vec![];
        for ts in [at(10, 0, 0), at(9, 0, 0), at(11, 0, 0), at(11, 0, 0), at(8, 0, 0)] {
            store.set_last_upload_time("dev1", ts).await.unwrap();
            observed.push(store.get_recorder("dev1").await.unwrap().last_upload_time);
        }
        assert!(observed.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*observed.last().unwrap(), at(11, 0, 0));

        // a refused rewind reports the watermark that stays in effect
        assert_eq!(store.set_last_upload_time("dev1", at(9, 30, 0)).await.unwrap(), at(11, 0, 0));
    }

    #[tokio::test]
    async fn overlapping_interest_is_fused_into_pending_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.get_recorder("dev1").await.unwrap();

        let early = interest(at(8, 0, 0), at(8, 5, 0));
        let other = interest(at(9, 0, 0), at(9, 5, 0));
        store.append_pending("dev1", vec![early, other.clone()]).await.unwrap();

        // same activity seen again with slightly shifted bounds
        let shifted = interest(at(8, 1, 0), at(8, 6, 0));
        assert_eq!(store.append_pending("dev1", vec![shifted]).await.unwrap(), 0);

        let pending = store.get_recorder("dev1").await.unwrap().pending_interests;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].start_time, at(8, 0, 0));
        assert_eq!(pending[0].end_time, at(8, 6, 0));
        assert_eq!(pending[0].name, "A_2025.10.15 08.00.00-08.06.00");
        assert_eq!(pending[1].name, other.name);
    }

    #[tokio::test]
    async fn append_pending_dedups_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.get_recorder("dev1").await.unwrap();

        let a = interest(at(8, 0, 0), at(8, 5, 0));
        let b = interest(at(9, 0, 0), at(9, 5, 0));
        let c = interest(at(10, 0, 0), at(10, 5, 0));

        assert_eq!(store.append_pending("dev1", vec![a.clone(), b.clone()]).await.unwrap(), 2);
        assert_eq!(store.append_pending("dev1", vec![b.clone(), a.clone(), c.clone()]).await.unwrap(), 1);
        assert_eq!(store.append_pending("dev1", vec![c.clone(), c.clone()]).await.unwrap(), 0);

        let names: Vec<_> = store
            .get_recorder("dev1")
            .await
            .unwrap()
            .pending_interests
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec![a.name, b.name, c.name]);
    }

    #[tokio::test]
    async fn mark_processed_also_removes_from_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.get_recorder("dev1").await.unwrap();

        let a = interest(at(8, 0, 0), at(8, 5, 0));
        store.append_pending("dev1", vec![a.clone()]).await.unwrap();
        store.mark_processed("dev1", &a.name).await.unwrap();

        assert!(store.is_processed("dev1", &a.name).await.unwrap());
        let recorder = store.get_recorder("dev1").await.unwrap();
        assert!(recorder.pending_interests.is_empty());

        // a completed interest is not queued again
        assert_eq!(store.append_pending("dev1", vec![a]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_and_remove_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.get_recorder("dev1").await.unwrap();

        let mut a = interest(at(8, 0, 0), at(8, 5, 0));
        store.append_pending("dev1", vec![a.clone()]).await.unwrap();
        a.cloud_folder = Some("DVR/A/2025.10.15/x".into());
        assert!(store.update_pending("dev1", a.clone()).await.unwrap());
        let stored = store.get_recorder("dev1").await.unwrap().pending_interests;
        assert_eq!(stored[0].cloud_folder, a.cloud_folder);

        assert!(store.remove_pending("dev1", &a.name).await.unwrap());
        assert!(!store.remove_pending("dev1", &a.name).await.unwrap());
    }

    #[tokio::test]
    async fn readers_get_copies() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let mut copy = store.get_recorder("dev1").await.unwrap();
        copy.ignore = true;
        assert!(!store.get_recorder("dev1").await.unwrap().ignore);
    }

    #[tokio::test]
    async fn corrupt_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("states.json"), b"{ not json").unwrap();
        let store = store(&dir);
        let err = store.get_recorder("dev1").await.unwrap_err();
        assert!(matches!(err, HarvestError::StateIo(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn operations_on_unknown_recorder_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let err = store.set_last_upload_time("ghost", at(1, 0, 0)).await.unwrap_err();
        assert!(matches!(err, HarvestError::UnknownRecorder(_)));
        assert!(!err.is_fatal());
        assert!(!store.is_processed("ghost", "x").await.unwrap());
    }
}
