//! One run's fetch session: retries, cache policy, and the archived-snapshot fallback.
//!
//! Once any page comes back as a challenge page the session is marked blocked,
//! and every later fetch in the run goes straight to the snapshot service.

use super::{FetchError, Fetcher, Page, RetryPolicy};
use std::collections::HashSet;
use tracing::{info, warn};
use url::Url;

/// archive.org availability API.
pub const WAYBACK_AVAILABILITY: &str = "https://archive.org/wayback/available";

/// Where to look up archived copies of blocked pages.
#[derive(Debug, Clone)]
pub struct SnapshotFallback {
    endpoint: String,
}

impl SnapshotFallback {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn wayback() -> Self {
        Self::new(WAYBACK_AVAILABILITY)
    }

    fn lookup_url(&self, url: &str) -> Result<String, FetchError> {
        Url::parse_with_params(&self.endpoint, &[("url", url)])
            .map(|u| u.to_string())
            .map_err(|e| FetchError::Blocked {
                url: url.to_string(),
                reason: format!("bad snapshot endpoint {}: {}", self.endpoint, e),
            })
    }
}

/// Closest archived snapshot URL from an availability API response.
fn closest_snapshot(body: &[u8]) -> Option<String> {
    let v: serde_json::Value = serde_json::from_slice(body).ok()?;
    let closest = v.get("archived_snapshots")?.get("closest")?;
    if closest.get("available").and_then(|a| a.as_bool()) == Some(false) {
        return None;
    }
    closest.get("url")?.as_str().map(String::from)
}

#[derive(Debug)]
pub struct Session {
    fetcher: Fetcher,
    retry: RetryPolicy,
    snapshots: Option<SnapshotFallback>,
    use_cache: bool,
    blocked: bool,
    fallback_tried: HashSet<String>,
}

impl Session {
    /// Session with the default archive.org fallback and caching on.
    pub fn new(fetcher: Fetcher, retry: RetryPolicy) -> Self {
        Self {
            fetcher,
            retry,
            snapshots: Some(SnapshotFallback::wayback()),
            use_cache: true,
            blocked: false,
            fallback_tried: HashSet::new(),
        }
    }

    pub fn with_snapshots(mut self, snapshots: Option<SnapshotFallback>) -> Self {
        self.snapshots = snapshots;
        self
    }

    /// When false, every GET goes to the network (responses are still cached).
    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// GET with retries. Blocked pages fall back to an archived snapshot when configured.
    pub fn get(&mut self, url: &str) -> Result<Page, FetchError> {
        if self.blocked {
            return self.via_snapshot(url);
        }
        let use_cache = self.use_cache;
        let fetcher = &mut self.fetcher;
        match self.retry.run(url, || fetcher.fetch(url, use_cache)) {
            Err(FetchError::Blocked { reason, .. }) if self.snapshots.is_some() => {
                warn!(
                    "Blocked at {} ({}); using archived snapshots for the rest of this run",
                    url, reason
                );
                self.blocked = true;
                self.via_snapshot(url)
            }
            other => other,
        }
    }

    /// POST a login or similar form. Not retried, not cached.
    pub fn post_form(&mut self, url: &str, form: &[(&str, &str)]) -> Result<Page, FetchError> {
        self.fetcher.post_form(url, form)
    }

    pub fn save_cookies(&self) -> Result<(), FetchError> {
        self.fetcher.cookies().save()
    }

    fn via_snapshot(&mut self, url: &str) -> Result<Page, FetchError> {
        let blocked = |reason: String| FetchError::Blocked {
            url: url.to_string(),
            reason,
        };
        let Some(snapshots) = self.snapshots.clone() else {
            return Err(blocked("no snapshot service configured".to_string()));
        };
        if !self.fallback_tried.insert(url.to_string()) {
            return Err(blocked("snapshot fallback already attempted".to_string()));
        }
        let lookup = snapshots.lookup_url(url)?;
        let use_cache = self.use_cache;
        let fetcher = &mut self.fetcher;

        let found = match self.retry.run(&lookup, || fetcher.fetch(&lookup, use_cache)) {
            Ok(page) => closest_snapshot(&page.body),
            Err(e) if e.is_cache_error() => return Err(e),
            Err(e) => {
                warn!("Snapshot lookup for {} failed: {}", url, e);
                None
            }
        };
        let result = match found {
            Some(snapshot) => {
                info!("Fetching archived snapshot {}", snapshot);
                self.retry
                    .run(&snapshot, || fetcher.fetch(&snapshot, use_cache))
                    .map_err(|e| {
                        if e.is_cache_error() {
                            e
                        } else {
                            blocked(format!("archived snapshot failed: {}", e))
                        }
                    })
            }
            None => Err(blocked("no archived snapshot available".to_string())),
        };
        if result.is_err() {
            if let Some(cache) = self.fetcher.cache() {
                if let Err(e) = cache.remove(&lookup) {
                    warn!("Could not drop cached snapshot lookup: {}", e);
                }
            }
        }
        result
    }
}
