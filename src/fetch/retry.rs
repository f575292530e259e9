//! Retry policy for transient failures, with `Retry-After` support and challenge-page detection.

use super::{FetchError, Page};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;

/// Body markers of anti-automation challenge pages.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "cf_chl_opt",
    "challenge-platform",
    "<title>Just a moment...</title>",
    "Attention Required! | Cloudflare",
];

/// The challenge marker found in a failed response, if any.
pub fn challenge_marker(page: &Page) -> Option<&'static str> {
    if page.is_success() {
        return None;
    }
    let body = String::from_utf8_lossy(&page.body);
    CHALLENGE_MARKERS.iter().copied().find(|m| body.contains(m))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Wait used when the server gives no `Retry-After`.
    pub default_delay: Duration,
    /// Upper bound on any single wait.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            default_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// 5xx and 429 are retried; other failures are final.
    pub fn is_transient_status(status: u16) -> bool {
        status == 429 || (500..600).contains(&status)
    }

    /// Wait before retrying after `page` (or after a transport error when None).
    pub fn delay_for(&self, page: Option<&Page>, now: DateTime<Utc>) -> Duration {
        page.and_then(|p| p.retry_after.as_deref())
            .and_then(|v| parse_retry_after(v, now))
            .unwrap_or(self.default_delay)
            .min(self.max_delay)
    }

    /// Call `attempt` until it succeeds, fails for good, or the retry budget runs out.
    pub fn run<F>(&self, url: &str, mut attempt: F) -> Result<Page, FetchError>
    where
        F: FnMut() -> Result<Page, FetchError>,
    {
        let max_attempts = self.retries.saturating_add(1);
        let mut last_status = None;
        for n in 1..=max_attempts {
            let delay = match attempt() {
                Ok(page) if page.is_success() => return Ok(page),
                Ok(page) => {
                    if let Some(marker) = challenge_marker(&page) {
                        return Err(FetchError::Blocked {
                            url: url.to_string(),
                            reason: format!("HTTP {} challenge page ({})", page.status, marker),
                        });
                    }
                    if !Self::is_transient_status(page.status) {
                        return Err(FetchError::Status {
                            status: page.status,
                            url: url.to_string(),
                        });
                    }
                    last_status = Some(page.status);
                    warn!("Load failed: HTTP {} at {}", page.status, url);
                    self.delay_for(Some(&page), Utc::now())
                }
                Err(e) if e.is_transient() => {
                    last_status = None;
                    warn!("Load failed: {}", e);
                    self.delay_for(None, Utc::now())
                }
                Err(e) => return Err(e),
            };
            if n < max_attempts {
                warn!(
                    "Waiting {}s to retry ({}/{})",
                    delay.as_secs(),
                    n,
                    self.retries
                );
                std::thread::sleep(delay);
            }
        }
        Err(FetchError::Exhausted {
            url: url.to_string(),
            attempts: max_attempts,
            last_status,
        })
    }
}

/// `Retry-After` as delta-seconds or an HTTP date relative to `now`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        (at.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::Cell;

    fn page(status: u16, body: &str, retry_after: Option<&str>) -> Page {
        Page {
            url: "https://example.com/".to_string(),
            status,
            content_type: None,
            retry_after: retry_after.map(String::from),
            body: body.as_bytes().to_vec(),
            from_cache: false,
        }
    }

    fn quick(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            default_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn retry_after_seconds_and_date() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().unwrap_or_default();
        assert_eq!(parse_retry_after("7", now), Some(Duration::from_secs(7)));
        assert_eq!(
            parse_retry_after("Fri, 01 Mar 2024 12:00:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Fri, 01 Mar 2024 11:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn delay_prefers_header_and_clamps() {
        let policy = RetryPolicy {
            retries: 3,
            default_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        };
        let now = Utc::now();
        assert_eq!(policy.delay_for(None, now), Duration::from_secs(10));
        let p = page(429, "", Some("3"));
        assert_eq!(policy.delay_for(Some(&p), now), Duration::from_secs(3));
        let p = page(503, "", Some("3600"));
        assert_eq!(policy.delay_for(Some(&p), now), Duration::from_secs(60));
    }

    #[test]
    fn recovers_after_transient_failures() {
        let calls = Cell::new(0);
        let result = quick(3).run("https://example.com/", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Ok(page(503, "busy", None))
            } else {
                Ok(page(200, "ok", None))
            }
        });
        assert!(matches!(result, Ok(ref p) if p.text() == "ok"));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exhaustion_reports_attempts() {
        let calls = Cell::new(0);
        let result = quick(2).run("https://example.com/", || {
            calls.set(calls.get() + 1);
            Ok(page(429, "slow down", None))
        });
        assert_eq!(calls.get(), 3);
        match result {
            Err(FetchError::Exhausted {
                attempts,
                last_status,
                ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_status, Some(429));
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    #[test]
    fn client_errors_are_final() {
        let calls = Cell::new(0);
        let result = quick(3).run("https://example.com/", || {
            calls.set(calls.get() + 1);
            Ok(page(404, "missing", None))
        });
        assert_eq!(calls.get(), 1);
        assert!(matches!(result, Err(FetchError::Status { status: 404, .. })));
    }

    #[test]
    fn challenge_pages_are_blocked_not_retried() {
        let calls = Cell::new(0);
        let body = "<html><head><title>Just a moment...</title></head></html>";
        let result = quick(3).run("https://example.com/", || {
            calls.set(calls.get() + 1);
            Ok(page(503, body, None))
        });
        assert_eq!(calls.get(), 1);
        assert!(matches!(result, Err(FetchError::Blocked { .. })));
    }

    #[test]
    fn successful_pages_never_count_as_challenges() {
        let p = page(200, "challenge-platform mentioned in prose", None);
        assert_eq!(challenge_marker(&p), None);
    }
}
