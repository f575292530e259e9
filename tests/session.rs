mod support;

use std::time::Duration;

use storyleech::fetch::{CookieJar, SnapshotFallback};
use storyleech::{FetchError, Fetcher, RetryPolicy, Session};
use support::{quick_fetcher, Reply, StubServer};

const CHALLENGE: &str =
    "<html><head><title>Just a moment...</title></head><body>checking</body></html>";

fn policy(retries: u32) -> RetryPolicy {
    RetryPolicy {
        retries,
        default_delay: Duration::ZERO,
        max_delay: Duration::from_secs(1),
    }
}

fn session(retries: u32) -> anyhow::Result<Session> {
    Ok(Session::new(quick_fetcher(None)?, policy(retries)).with_snapshots(None))
}

#[test]
fn transient_failure_is_retried() -> anyhow::Result<()> {
    let server = StubServer::spawn(vec![(
        "/flaky",
        vec![
            Reply::status(503, "busy").with_header("Retry-After", "0"),
            Reply::html("ok"),
        ],
    )])?;
    let mut session = session(3)?;
    let page = session.get(&server.url("/flaky"))?;
    assert_eq!(page.text(), "ok");
    assert_eq!(server.hits("/flaky"), 2);
    Ok(())
}

#[test]
fn retries_are_bounded() -> anyhow::Result<()> {
    let server = StubServer::spawn(vec![("/down", vec![Reply::status(500, "oops")])])?;
    let mut session = session(2)?;
    let err = session.get(&server.url("/down")).err();
    assert!(matches!(
        err,
        Some(FetchError::Exhausted {
            attempts: 3,
            last_status: Some(500),
            ..
        })
    ));
    assert_eq!(server.hits("/down"), 3);
    Ok(())
}

#[test]
fn permanent_status_fails_at_once() -> anyhow::Result<()> {
    let server = StubServer::spawn(vec![])?;
    let mut session = session(3)?;
    let err = session.get(&server.url("/missing")).err();
    assert!(matches!(err, Some(FetchError::Status { status: 404, .. })));
    assert_eq!(server.hits("/missing"), 1);
    Ok(())
}

#[test]
fn blocked_site_switches_to_snapshots_for_the_rest_of_the_run() -> anyhow::Result<()> {
    let server = StubServer::spawn(vec![
        ("/chapter/1", vec![Reply::status(403, CHALLENGE)]),
        ("/chapter/2", vec![Reply::html("live chapter two")]),
        (
            "/wayback/available",
            vec![Reply::html(
                r#"{"archived_snapshots":{"closest":{"available":true,"url":"{base}/snapshot"}}}"#,
            )],
        ),
        ("/snapshot", vec![Reply::html("archived copy")]),
    ])?;
    let mut session = Session::new(quick_fetcher(None)?, policy(1)).with_snapshots(Some(
        SnapshotFallback::new(server.url("/wayback/available")),
    ));

    assert_eq!(session.get(&server.url("/chapter/1"))?.text(), "archived copy");
    assert!(session.is_blocked());
    assert_eq!(server.hits("/chapter/1"), 1);

    assert_eq!(session.get(&server.url("/chapter/2"))?.text(), "archived copy");
    assert_eq!(server.hits("/chapter/2"), 0);
    assert_eq!(server.hits("/wayback/available"), 2);
    Ok(())
}

#[test]
fn blocked_without_snapshot_is_an_error() -> anyhow::Result<()> {
    let server = StubServer::spawn(vec![
        ("/chapter/1", vec![Reply::status(403, CHALLENGE)]),
        ("/wayback/available", vec![Reply::html(r#"{"archived_snapshots":{}}"#)]),
    ])?;

    let mut bare = session(1)?;
    let err = bare.get(&server.url("/chapter/1")).err();
    assert!(matches!(err, Some(FetchError::Blocked { .. })));
    assert!(!bare.is_blocked());

    let mut with_lookup = Session::new(quick_fetcher(None)?, policy(1)).with_snapshots(Some(
        SnapshotFallback::new(server.url("/wayback/available")),
    ));
    let err = with_lookup.get(&server.url("/chapter/1")).err();
    assert!(matches!(err, Some(FetchError::Blocked { .. })));
    Ok(())
}

#[test]
fn snapshot_lookup_happens_once_per_url() -> anyhow::Result<()> {
    let server = StubServer::spawn(vec![
        ("/chapter/1", vec![Reply::status(403, CHALLENGE)]),
        ("/wayback/available", vec![Reply::html(r#"{"archived_snapshots":{}}"#)]),
    ])?;
    let mut session = Session::new(quick_fetcher(None)?, policy(1)).with_snapshots(Some(
        SnapshotFallback::new(server.url("/wayback/available")),
    ));
    let url = server.url("/chapter/1");

    let first = session.get(&url).err();
    assert!(matches!(first, Some(FetchError::Blocked { .. })));
    assert_eq!(server.hits("/wayback/available"), 1);

    let second = session.get(&url).err();
    assert!(matches!(second, Some(FetchError::Blocked { .. })));
    assert_eq!(server.hits("/wayback/available"), 1);
    assert_eq!(server.hits("/chapter/1"), 1);
    Ok(())
}

#[test]
fn login_cookies_persist_between_runs() -> anyhow::Result<()> {
    let server = StubServer::spawn(vec![
        (
            "/login",
            vec![Reply::html("welcome").with_header("Set-Cookie", "sid=abc123; Path=/; Max-Age=3600")],
        ),
        ("/whoami", vec![Reply::html("cookie: {cookie}")]),
    ])?;
    let dir = tempfile::tempdir()?;
    let cookie_file = dir.path().join("cookies.json");

    let fetcher = Fetcher::builder()
        .delay(Duration::ZERO)
        .cookies(CookieJar::load(&cookie_file))
        .build()?;
    let mut first = Session::new(fetcher, policy(0)).with_snapshots(None);
    first.post_form(&server.url("/login"), &[("Email", "reader"), ("Password", "pw")])?;
    first.save_cookies()?;
    assert!(std::fs::read_to_string(&cookie_file)?.contains("abc123"));

    let fetcher = Fetcher::builder()
        .delay(Duration::ZERO)
        .cookies(CookieJar::load(&cookie_file))
        .build()?;
    let mut second = Session::new(fetcher, policy(0)).with_snapshots(None);
    assert_eq!(second.get(&server.url("/whoami"))?.text(), "cookie: sid=abc123");
    Ok(())
}
