use async_trait::async_trait;
use dashmap::DashSet;
use reqwest::{Method, StatusCode, Url};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{join, CloudStorage};
use crate::config::StorageConfig;
use crate::error::{HarvestError, Result};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?><d:propfind xmlns:d="DAV:"><d:prop><d:resourcetype/></d:prop></d:propfind>"#;

/// WebDAV storage (MKCOL / PROPFIND / PUT / GET) with basic auth.
pub struct WebDavStorage {
    http: reqwest::Client,
    base: Url,
    login: Option<(String, String)>,
    timeout: Duration,
    known_dirs: DashSet<String>,
}

impl WebDavStorage {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| HarvestError::ConfigError(format!("Failed to create storage client: {}", e)))?;
        let base = Url::parse(&config.url)
            .map_err(|e| HarvestError::ConfigError(format!("storage.url: {}", e)))?;
        if base.cannot_be_a_base() {
            return Err(HarvestError::ConfigError(format!("storage.url is not a base URL: {}", config.url)));
        }
        let login = config
            .credentials
            .is_set()
            .then(|| (config.credentials.login.clone(), config.credentials.password.clone()));

        Ok(Self {
            http,
            base,
            login,
            timeout: Duration::from_secs(config.timeout_sec),
            known_dirs: DashSet::new(),
        })
    }

    fn url(&self, path: &str, dir: bool) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| HarvestError::Storage("storage URL cannot take a path".to_string()))?;
            segments.pop_if_empty();
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
            if dir {
                segments.push("");
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url).timeout(self.timeout);
        match &self.login {
            Some((user, password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }

    async fn propfind(&self, path: &str, depth: &str, dir: bool) -> Result<Option<String>> {
        let method = Method::from_bytes(b"PROPFIND")
            .map_err(|e| HarvestError::Storage(e.to_string()))?;
        let response = self
            .request(method, self.url(path, dir)?)
            .header("Depth", depth)
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(storage_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.text().await.map_err(storage_error)?)),
            status => Err(HarvestError::Storage(format!("PROPFIND {}: HTTP {}", path, status))),
        }
    }

    async fn mkcol(&self, path: &str) -> Result<()> {
        let method = Method::from_bytes(b"MKCOL").map_err(|e| HarvestError::Storage(e.to_string()))?;
        let response = self
            .request(method, self.url(path, true)?)
            .send()
            .await
            .map_err(storage_error)?;

        match response.status() {
            // 405: collection already exists
            status if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            status => Err(HarvestError::Storage(format!("MKCOL {}: HTTP {}", path, status))),
        }
    }
}

#[async_trait]
impl CloudStorage for WebDavStorage {
    #[instrument(skip(self))]
    async fn ensure_dir(&self, path: &str) -> Result<()> {
        let path = join(&[path]);
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            if self.known_dirs.contains(&prefix) {
                continue;
            }
            self.mkcol(&prefix).await?;
            self.known_dirs.insert(prefix.clone());
        }
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let dir = join(&[dir]);
        let body = match self.propfind(&dir, "1", true).await? {
            Some(body) => body,
            None => return Ok(Vec::new()),
        };
        entry_names(&body, &dir)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.propfind(path, "0", false).await?.is_some())
    }

    async fn put(&self, path: &str, body: Vec<u8>) -> Result<()> {
        let size = body.len();
        let response = self
            .request(Method::PUT, self.url(path, false)?)
            .body(body)
            .send()
            .await
            .map_err(storage_error)?;
        if !response.status().is_success() {
            return Err(HarvestError::Storage(format!("PUT {}: HTTP {}", path, response.status())));
        }
        debug!(path, bytes = size, "Uploaded");
        Ok(())
    }

    async fn put_file(&self, path: &str, local: &Path) -> Result<()> {
        let body = tokio::fs::read(local).await?;
        self.put(path, body).await
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .request(Method::GET, self.url(path, false)?)
            .send()
            .await
            .map_err(storage_error)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                Ok(Some(response.bytes().await.map_err(storage_error)?.to_vec()))
            }
            status => Err(HarvestError::Storage(format!("GET {}: HTTP {}", path, status))),
        }
    }
}

fn storage_error(error: reqwest::Error) -> HarvestError {
    HarvestError::Storage(error.to_string())
}

/// Names of the entries in a Depth-1 multistatus body, the listed
/// directory itself excluded.
fn entry_names(body: &str, dir: &str) -> Result<Vec<String>> {
    let dir = dir.trim_matches('/');
    let own_suffix = format!("/{}", dir);
    let mut names = Vec::new();
    for href in hrefs(body) {
        let decoded = urlencoding::decode(&href)
            .map_err(|e| HarvestError::Storage(format!("undecodable href {}: {}", href, e)))?;
        let trimmed = decoded.trim_end_matches('/');
        if trimmed == dir || trimmed.ends_with(&own_suffix) {
            continue;
        }
        if let Some(name) = trimmed.rsplit('/').next().filter(|n| !n.is_empty()) {
            names.push(name.to_string());
        }
    }
    names.sort();
    names.dedup();
    Ok(names)
}

/// Text of every `<*:href>` element, namespace prefix ignored.
fn hrefs(body: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = body;
    while let Some(open) = rest.find('<') {
        rest = &rest[open + 1..];
        let close = match rest.find('>') {
            Some(close) => close,
            None => break,
        };
        let tag = &rest[..close];
        rest = &rest[close + 1..];
        let local = tag.rsplit(':').next().unwrap_or(tag);
        if !local.eq_ignore_ascii_case("href") || tag.starts_with('/') {
            continue;
        }
        if let Some(end) = rest.find("</") {
            out.push(rest[..end].trim().to_string());
            rest = &rest[end..];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, StorageConfig};

    const MULTISTATUS: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response><d:href>/remote.php/webdav/DVR/A/2025.10.15/</d:href></d:response>
  <d:response><d:href>/remote.php/webdav/DVR/A/2025.10.15/reports.txt</d:href></d:response>
  <d:response><d:href>/remote.php/webdav/DVR/A/2025.10.15/A_2025.10.15%2008.02.00-08.04.00/</d:href></d:response>
</d:multistatus>"#;

    #[test]
    fn listing_excludes_the_directory_itself() {
        let names = entry_names(MULTISTATUS, "DVR/A/2025.10.15").unwrap();
        assert_eq!(names, vec!["A_2025.10.15 08.02.00-08.04.00", "reports.txt"]);
    }

    #[test]
    fn href_extraction_ignores_namespace_case() {
        let body = "<D:multistatus><D:response><D:href>/x/a.jpg</D:href></D:response><d:href>/x/b.jpg</d:href></D:multistatus>";
        assert_eq!(hrefs(body), vec!["/x/a.jpg", "/x/b.jpg"]);
    }

    #[test]
    fn entry_names_decode_utf8_plates() {
        let body = "<d:multistatus><d:href>/dav/DVR/</d:href><d:href>/dav/DVR/%D0%90123%20x/</d:href></d:multistatus>";
        assert_eq!(entry_names(body, "DVR").unwrap(), vec!["А123 x"]);
    }

    #[test]
    fn undecodable_href_is_a_storage_error() {
        let body = "<d:multistatus><d:href>/dav/DVR/%FF%FE.jpg</d:href></d:multistatus>";
        let err = entry_names(body, "DVR").unwrap_err();
        assert!(matches!(err, HarvestError::Storage(_)));
    }

    #[test]
    fn urls_encode_segments() {
        let storage = WebDavStorage::new(&StorageConfig {
            url: "http://dav.local/remote.php/webdav/".into(),
            credentials: Credentials::default(),
            ..StorageConfig::default()
        })
        .unwrap();
        let url = storage.url("DVR/А1/A_2025.10.15 08.02.00-08.04.00", true).unwrap();
        assert!(url.as_str().starts_with("http://dav.local/remote.php/webdav/DVR/"));
        assert!(url.as_str().contains("08.02.00-08.04.00/"));
        assert!(!url.as_str().contains(' '));
    }
}
