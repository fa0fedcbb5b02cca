use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{join, CloudStorage};
use crate::error::{HarvestError, Result};

/// In-process storage double. Counts mutating calls.
#[derive(Default)]
pub struct MemoryStorage {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    dirs: Mutex<BTreeSet<String>>,
    pub writes: AtomicUsize,
    /// Number of upcoming `put`/`put_file` calls that fail.
    pub fail_puts: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(&join(&[path])).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    pub fn seed(&self, path: &str, body: &[u8]) {
        self.files.lock().unwrap().insert(join(&[path]), body.to_vec());
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CloudStorage for MemoryStorage {
    async fn ensure_dir(&self, path: &str) -> Result<()> {
        let path = join(&[path]);
        let mut dirs = self.dirs.lock().unwrap();
        let mut prefix = String::new();
        for segment in path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            if dirs.insert(prefix.clone()) {
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let dir = format!("{}/", join(&[dir]));
        let mut names: BTreeSet<String> = BTreeSet::new();
        let files = self.files.lock().unwrap();
        let dirs = self.dirs.lock().unwrap();
        for key in files.keys().chain(dirs.iter()) {
            if let Some(rest) = key.strip_prefix(&dir) {
                if let Some(name) = rest.split('/').next().filter(|n| !n.is_empty()) {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = join(&[path]);
        Ok(self.files.lock().unwrap().contains_key(&path) || self.dirs.lock().unwrap().contains(&path))
    }

    async fn put(&self, path: &str, body: Vec<u8>) -> Result<()> {
        if self.take_failure() {
            return Err(HarvestError::Storage(format!("PUT {} failed", path)));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.files.lock().unwrap().insert(join(&[path]), body);
        Ok(())
    }

    async fn put_file(&self, path: &str, local: &Path) -> Result<()> {
        let body = tokio::fs::read(local).await?;
        self.put(path, body).await
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.file(path))
    }
}
