mod support;

use std::time::Duration;

use chrono::Utc;
use storyleech::fetch::ResponseCache;
use storyleech::{FetchError, Page};
use support::{quick_fetcher, Reply, StubServer};

const DAY: Duration = Duration::from_secs(86_400);

fn page(url: &str, body: &str) -> Page {
    Page {
        url: url.to_string(),
        status: 200,
        content_type: Some("text/html".to_string()),
        retry_after: None,
        body: body.as_bytes().to_vec(),
        from_cache: false,
    }
}

#[test]
fn fresh_entry_is_served_without_a_request() -> anyhow::Result<()> {
    let server = StubServer::spawn(vec![("/story", vec![Reply::html("live copy")])])?;
    let dir = tempfile::tempdir()?;
    let cache = ResponseCache::open(dir.path(), DAY)?;
    let url = server.url("/story");
    cache.store_at(&url, &page(&url, "cached copy"), Utc::now() - chrono::Duration::seconds(1))?;

    let mut fetcher = quick_fetcher(Some(cache))?;
    let got = fetcher.fetch(&url, true)?;
    assert!(got.from_cache);
    assert_eq!(got.text(), "cached copy");
    assert_eq!(server.hits("/story"), 0);
    Ok(())
}

#[test]
fn stale_entry_is_refetched_and_overwritten() -> anyhow::Result<()> {
    let server = StubServer::spawn(vec![("/story", vec![Reply::html("live copy")])])?;
    let dir = tempfile::tempdir()?;
    let cache = ResponseCache::open(dir.path(), DAY)?;
    let url = server.url("/story");
    cache.store_at(&url, &page(&url, "old copy"), Utc::now() - chrono::Duration::days(2))?;

    let mut fetcher = quick_fetcher(Some(cache.clone()))?;
    let got = fetcher.fetch(&url, true)?;
    assert!(!got.from_cache);
    assert_eq!(got.text(), "live copy");
    assert_eq!(server.hits("/story"), 1);

    let stored = cache.lookup(&url, Utc::now())?;
    assert_eq!(stored.map(|p| p.text()).as_deref(), Some("live copy"));
    Ok(())
}

#[test]
fn bypass_still_writes_through() -> anyhow::Result<()> {
    let server = StubServer::spawn(vec![("/story", vec![Reply::html("live copy")])])?;
    let dir = tempfile::tempdir()?;
    let cache = ResponseCache::open(dir.path(), DAY)?;
    let url = server.url("/story");
    cache.store_at(&url, &page(&url, "cached copy"), Utc::now())?;

    let mut fetcher = quick_fetcher(Some(cache.clone()))?;
    assert_eq!(fetcher.fetch(&url, false)?.text(), "live copy");
    assert_eq!(server.hits("/story"), 1);
    assert_eq!(
        cache.lookup(&url, Utc::now())?.map(|p| p.text()).as_deref(),
        Some("live copy")
    );
    Ok(())
}

#[test]
fn error_responses_are_not_cached() -> anyhow::Result<()> {
    let server = StubServer::spawn(vec![])?;
    let dir = tempfile::tempdir()?;
    let cache = ResponseCache::open(dir.path(), DAY)?;
    let url = server.url("/gone");

    let mut fetcher = quick_fetcher(Some(cache.clone()))?;
    let got = fetcher.fetch(&url, true)?;
    assert_eq!(got.status, 404);
    assert!(cache.lookup(&url, Utc::now())?.is_none());

    fetcher.fetch(&url, true)?;
    assert_eq!(server.hits("/gone"), 2);
    Ok(())
}

#[test]
fn corrupt_entry_is_an_error_naming_the_url() -> anyhow::Result<()> {
    let server = StubServer::spawn(vec![("/story", vec![Reply::html("live copy")])])?;
    let dir = tempfile::tempdir()?;
    let cache = ResponseCache::open(dir.path(), DAY)?;
    let url = server.url("/story");
    std::fs::write(cache.path_for(&url), "{garbage")?;

    let mut fetcher = quick_fetcher(Some(cache.clone()))?;
    match fetcher.fetch(&url, true) {
        Err(FetchError::CacheCorrupt { url: bad, .. }) => assert_eq!(bad, url),
        other => anyhow::bail!("expected a corrupt cache error, got {:?}", other),
    }
    assert_eq!(server.hits("/story"), 0);

    // A bypassing fetch never reads the entry and replaces it.
    assert_eq!(fetcher.fetch(&url, false)?.text(), "live copy");
    assert_eq!(
        cache.lookup(&url, Utc::now())?.map(|p| p.text()).as_deref(),
        Some("live copy")
    );
    Ok(())
}
