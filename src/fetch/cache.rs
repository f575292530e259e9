//! On-disk response cache: one JSON file per URL, named by the SHA-256 of the URL.
//!
//! Entries are written to a temp file in the cache directory and renamed into
//! place, so a crash never leaves a half-written entry behind.

use super::{FetchError, Page};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Entries older than this are refetched.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(4 * 3600);

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    url: String,
    final_url: String,
    status: u16,
    content_type: Option<String>,
    /// Base64 of the raw body.
    body: String,
    fetched_at: DateTime<Utc>,
}

/// What [ResponseCache::flush] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
    max_age: Duration,
}

impl ResponseCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, max_age: Duration) -> Result<Self, FetchError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| FetchError::Cache {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self { dir, max_age })
    }

    /// `$XDG_CACHE_HOME/storyleech`, or `./.storyleech-cache` when there is no cache dir.
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .map(|d| d.join("storyleech"))
            .unwrap_or_else(|| PathBuf::from(".storyleech-cache"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }

    /// A fresh entry for `url` as of `now`, or None if missing or stale.
    pub fn lookup(&self, url: &str, now: DateTime<Utc>) -> Result<Option<Page>, FetchError> {
        let path = self.path_for(url);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FetchError::Cache { path, source: e }),
        };
        let entry: CacheEntry =
            serde_json::from_slice(&raw).map_err(|e| FetchError::CacheCorrupt {
                url: url.to_string(),
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if entry.url != url {
            return Err(FetchError::CacheCorrupt {
                url: url.to_string(),
                path,
                reason: format!("entry is for {}", entry.url),
            });
        }
        // Future timestamps (clock skew) count as brand new.
        let age = (now - entry.fetched_at).to_std().unwrap_or(Duration::ZERO);
        if age >= self.max_age {
            return Ok(None);
        }
        let body = BASE64
            .decode(entry.body.as_bytes())
            .map_err(|e| FetchError::CacheCorrupt {
                url: url.to_string(),
                path,
                reason: e.to_string(),
            })?;
        Ok(Some(Page {
            url: entry.final_url,
            status: entry.status,
            content_type: entry.content_type,
            retry_after: None,
            body,
            from_cache: true,
        }))
    }

    pub fn store(&self, url: &str, page: &Page) -> Result<(), FetchError> {
        self.store_at(url, page, Utc::now())
    }

    /// Store `page` as if fetched at `fetched_at`.
    pub fn store_at(
        &self,
        url: &str,
        page: &Page,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), FetchError> {
        let entry = CacheEntry {
            url: url.to_string(),
            final_url: page.url.clone(),
            status: page.status,
            content_type: page.content_type.clone(),
            body: BASE64.encode(&page.body),
            fetched_at,
        };
        let path = self.path_for(url);
        let json = serde_json::to_vec(&entry).map_err(|e| FetchError::CacheCorrupt {
            url: url.to_string(),
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let io_err = |e: std::io::Error| FetchError::Cache {
            path: path.clone(),
            source: e,
        };
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        temp.write_all(&json).map_err(io_err)?;
        temp.flush().map_err(io_err)?;
        temp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// Remove the entry for `url`. Returns whether one existed.
    pub fn remove(&self, url: &str) -> Result<bool, FetchError> {
        let path = self.path_for(url);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FetchError::Cache { path, source: e }),
        }
    }

    /// Delete every entry and the directory itself, then recreate it empty.
    pub fn flush(&self) -> Result<FlushReport, FetchError> {
        let io_err = |e: std::io::Error| FetchError::Cache {
            path: self.dir.clone(),
            source: e,
        };
        let mut report = FlushReport::default();
        let listing = match std::fs::read_dir(&self.dir) {
            Ok(listing) => Some(listing),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_err(e)),
        };
        for entry in listing.into_iter().flatten() {
            let entry = entry.map_err(io_err)?;
            let meta = entry.metadata().map_err(io_err)?;
            if meta.is_file() && entry.path().extension().is_some_and(|ext| ext == "json") {
                report.entries += 1;
                report.bytes += meta.len();
            }
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        Ok(report)
    }
}
