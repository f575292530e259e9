//! HTTP fetching: a polite blocking client over a disk cache and a persistent cookie jar.
//!
//! [Fetcher] does single requests. [Session] layers retries and the
//! snapshot fallback for blocked sites on top of it.

mod cache;
mod cookies;
mod retry;
mod session;

pub use cache::{FlushReport, ResponseCache, DEFAULT_MAX_AGE};
pub use cookies::CookieJar;
pub use retry::{challenge_marker, RetryPolicy};
pub use session::{Session, SnapshotFallback, WAYBACK_AVAILABILITY};

use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; storyleech/0.1; +https://github.com/storyleech)";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DELAY_SECS: u64 = 1;
const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to create HTTP client: {source}")]
    Client { source: reqwest::Error },

    #[error("Network error: could not reach {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} when fetching: {url}")]
    Status { status: u16, url: String },

    #[error("Gave up on {url} after {attempts} attempt(s)")]
    Exhausted {
        url: String,
        attempts: u32,
        last_status: Option<u16>,
    },

    #[error("Access blocked at {url}: {reason}")]
    Blocked { url: String, reason: String },

    #[error("Cache error at {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt cache entry for {url} ({path}): {reason}")]
    CacheCorrupt {
        url: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Cannot save cookies to {path}: {source}")]
    Cookies {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Timeouts and connection failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { source, .. } => source.is_timeout() || source.is_connect(),
            _ => false,
        }
    }

    /// Cache failures always reach the caller, never a fallback path.
    pub fn is_cache_error(&self) -> bool {
        matches!(self, FetchError::Cache { .. } | FetchError::CacheCorrupt { .. })
    }
}

/// One fetched response, live or from the cache.
#[derive(Debug, Clone)]
pub struct Page {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    /// Raw `Retry-After` header, if any.
    pub retry_after: Option<String>,
    pub body: Vec<u8>,
    pub from_cache: bool,
}

impl Page {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Blocking HTTP client that enforces a delay between live requests.
pub struct Fetcher {
    inner: reqwest::blocking::Client,
    cache: Option<ResponseCache>,
    cookies: CookieJar,
    delay: Duration,
    last_request: Option<Instant>,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("cache", &self.cache)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    pub fn builder() -> FetcherBuilder {
        FetcherBuilder::default()
    }

    /// GET `url`. A fresh cache entry is served when `use_cache` is set; live 2xx
    /// responses are always written back to the cache. An unreadable or corrupt
    /// entry is an error; `storyleech flush` clears it.
    pub fn fetch(&mut self, url: &str, use_cache: bool) -> Result<Page, FetchError> {
        if use_cache {
            if let Some(cache) = &self.cache {
                if let Some(page) = cache.lookup(url, chrono::Utc::now())? {
                    debug!(url, "cache hit");
                    return Ok(page);
                }
            }
        }

        let page = self.fetch_live(url)?;
        if page.is_success() {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.store(url, &page) {
                    warn!("Could not cache {}: {}", url, e);
                }
            }
        }
        Ok(page)
    }

    /// POST a form. Never cached.
    pub fn post_form(&mut self, url: &str, form: &[(&str, &str)]) -> Result<Page, FetchError> {
        self.wait_delay();
        let result = self.inner.post(url).form(form).send();
        self.last_request = Some(Instant::now());
        let response = result.map_err(|e| FetchError::Network {
            url: url.to_string(),
            source: e,
        })?;
        read_page(response, url)
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    fn fetch_live(&mut self, url: &str) -> Result<Page, FetchError> {
        self.wait_delay();
        debug!(url, "GET");
        let result = self.inner.get(url).send();
        self.last_request = Some(Instant::now());
        let response = result.map_err(|e| FetchError::Network {
            url: url.to_string(),
            source: e,
        })?;
        read_page(response, url)
    }

    fn wait_delay(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                std::thread::sleep(self.delay - elapsed);
            }
        }
    }
}

fn read_page(response: reqwest::blocking::Response, url: &str) -> Result<Page, FetchError> {
    let status = response.status().as_u16();
    let final_url = response.url().to_string();
    let header = |name: reqwest::header::HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    let content_type = header(reqwest::header::CONTENT_TYPE);
    let retry_after = header(reqwest::header::RETRY_AFTER);
    let body = response.bytes().map_err(|e| FetchError::Network {
        url: url.to_string(),
        source: e,
    })?;
    Ok(Page {
        url: final_url,
        status,
        content_type,
        retry_after,
        body: body.to_vec(),
        from_cache: false,
    })
}

/// Builder for [Fetcher].
#[derive(Debug)]
pub struct FetcherBuilder {
    user_agent: Option<String>,
    delay: Duration,
    timeout_secs: u64,
    cache: Option<ResponseCache>,
    cookies: Option<CookieJar>,
}

impl Default for FetcherBuilder {
    fn default() -> Self {
        Self {
            user_agent: None,
            delay: Duration::from_secs(DEFAULT_DELAY_SECS),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            cache: None,
            cookies: None,
        }
    }
}

impl FetcherBuilder {
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Delay between live requests. Default 1 second.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Request timeout in seconds. Default 30.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Cookie jar to send and collect cookies with. Default is an empty in-memory jar.
    pub fn cookies(mut self, jar: CookieJar) -> Self {
        self.cookies = Some(jar);
        self
    }

    pub fn build(self) -> Result<Fetcher, FetchError> {
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let cookies = self.cookies.unwrap_or_default();
        let inner = reqwest::blocking::Client::builder()
            .cookie_provider(cookies.provider())
            .user_agent(user_agent)
            .timeout(Duration::from_secs(self.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| FetchError::Client { source: e })?;
        Ok(Fetcher {
            inner,
            cache: self.cache,
            cookies,
            delay: self.delay,
            last_request: None,
        })
    }
}
