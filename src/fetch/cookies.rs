//! Cookie jar shared with the HTTP client and saved as a JSON file between runs.
//!
//! Login sessions survive between runs through this file. A missing or
//! unreadable file just means starting logged out.

use super::FetchError;
use cookie_store::CookieStore;
use reqwest_cookie_store::CookieStoreMutex;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, MutexGuard};
use tracing::debug;
use url::Url;

/// Cookie store for the HTTP client, optionally backed by a file.
pub struct CookieJar {
    path: Option<PathBuf>,
    store: Arc<CookieStoreMutex>,
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::with_store(None, CookieStore::default())
    }
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieJar")
            .field("path", &self.path)
            .field("cookies", &self.len())
            .finish()
    }
}

impl CookieJar {
    fn with_store(path: Option<PathBuf>, store: CookieStore) -> Self {
        Self {
            path,
            store: Arc::new(CookieStoreMutex::new(store)),
        }
    }

    /// Load cookies from `path`. A missing or malformed file yields an empty jar bound to `path`.
    /// Expired cookies in the file are dropped.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let store = match std::fs::File::open(&path) {
            Ok(file) => match cookie_store::serde::json::load(BufReader::new(file)) {
                Ok(store) => store,
                Err(e) => {
                    debug!(path = %path.display(), "cookie file is malformed; starting empty: {}", e);
                    CookieStore::default()
                }
            },
            Err(e) => {
                debug!(path = %path.display(), "no cookies loaded: {}", e);
                CookieStore::default()
            }
        };
        Self::with_store(Some(path), store)
    }

    /// Handle for `reqwest::blocking::ClientBuilder::cookie_provider`.
    pub fn provider(&self) -> Arc<CookieStoreMutex> {
        Arc::clone(&self.store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Live cookies held.
    pub fn len(&self) -> usize {
        self.lock().iter_unexpired().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value of the cookie named `name` that would be sent to `url`.
    pub fn get(&self, url: &Url, name: &str) -> Option<String> {
        self.lock()
            .get_request_values(url)
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.to_string())
    }

    /// Write the jar to its file atomically. Session cookies are kept so a login
    /// outlives the process. No-op for in-memory jars.
    pub fn save(&self) -> Result<(), FetchError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |e: std::io::Error| FetchError::Cookies {
            path: path.clone(),
            source: e,
        };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;
        let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        {
            let store = self.lock();
            cookie_store::serde::json::save_incl_expired_and_nonpersistent(&store, &mut temp)
                .map_err(|e| io_err(std::io::Error::other(e)))?;
        }
        temp.flush().map_err(io_err)?;
        temp.persist(path).map_err(|e| io_err(e.error))?;
        debug!(path = %path.display(), "saved cookies");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, CookieStore> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
