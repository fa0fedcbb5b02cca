//! Remote object storage used for clips, frames and reports.
//!
//! Paths are POSIX-style and relative to the storage root URL.

#[cfg(test)]
pub mod memory;
pub mod webdav;

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;

pub use webdav::WebDavStorage;

#[async_trait]
pub trait CloudStorage: Send + Sync {
    /// Creates `path` and every missing parent.
    async fn ensure_dir(&self, path: &str) -> Result<()>;

    /// Entry names directly under `dir`; empty when `dir` does not exist.
    async fn list(&self, dir: &str) -> Result<Vec<String>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn put(&self, path: &str, body: Vec<u8>) -> Result<()>;

    async fn put_file(&self, path: &str, local: &Path) -> Result<()>;

    /// `None` when the object does not exist.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;
}

/// Joins path segments with single slashes.
pub fn join(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_normalizes_slashes() {
        assert_eq!(join(&["DVR/", "/A", "2025.10.15", "x/"]), "DVR/A/2025.10.15/x");
        assert_eq!(join(&["", "a"]), "a");
    }
}
