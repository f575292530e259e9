#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Context as _;

/// One canned response. `{base}` in the body becomes the server's base URL and
/// `{cookie}` the request's Cookie header.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl Reply {
    pub fn html(body: impl Into<String>) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: vec![("Content-Type".to_string(), "text/html; charset=utf-8".to_string())],
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

type Hits = Arc<Mutex<HashMap<String, usize>>>;

/// Local HTTP server with fixed routes. Each route's replies are served in
/// order and the last one repeats; unknown paths get 404.
pub struct StubServer {
    pub base_url: String,
    hits: Hits,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StubServer {
    pub fn spawn(routes: Vec<(&str, Vec<Reply>)>) -> anyhow::Result<Self> {
        let server = tiny_http::Server::http("127.0.0.1:0")
            .map_err(|e| anyhow::anyhow!("start stub server: {e}"))?;
        let base_url = format!("http://{}", server.server_addr());
        let routes: HashMap<String, Vec<Reply>> = routes
            .into_iter()
            .map(|(path, replies)| (path.to_string(), replies))
            .collect();
        let hits: Hits = Arc::default();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let base = base_url.clone();
        let counter = Arc::clone(&hits);
        let handle = thread::spawn(move || loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            let request = match server.recv_timeout(Duration::from_millis(50)) {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(_) => break,
            };
            let path = request.url().split('?').next().unwrap_or("").to_string();
            let cookie = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("Cookie"))
                .map(|h| h.value.as_str().to_string())
                .unwrap_or_default();
            let served = {
                let mut hits = counter.lock().unwrap_or_else(|p| p.into_inner());
                let n = hits.entry(path.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let reply = routes.get(&path).and_then(|replies| {
                let idx = (served - 1).min(replies.len().saturating_sub(1));
                replies.get(idx).cloned()
            });
            let response = match reply {
                Some(reply) => {
                    let body = reply.body.replace("{base}", &base).replace("{cookie}", &cookie);
                    let mut response =
                        tiny_http::Response::from_data(body.into_bytes()).with_status_code(reply.status);
                    for (name, value) in &reply.headers {
                        if let Ok(header) =
                            tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes())
                        {
                            response = response.with_header(header);
                        }
                    }
                    response
                }
                None => tiny_http::Response::from_data(b"not found".to_vec()).with_status_code(404),
            };
            let _ = request.respond(response);
        });

        Ok(Self {
            base_url,
            hits,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Requests seen for `path`, query ignored.
    pub fn hits(&self, path: &str) -> usize {
        let hits = self.hits.lock().unwrap_or_else(|p| p.into_inner());
        hits.get(path).copied().unwrap_or(0)
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Fetcher with no politeness delay, optionally over a cache.
pub fn quick_fetcher(cache: Option<storyleech::fetch::ResponseCache>) -> anyhow::Result<storyleech::Fetcher> {
    let mut builder = storyleech::Fetcher::builder().delay(Duration::ZERO);
    if let Some(cache) = cache {
        builder = builder.cache(cache);
    }
    builder.build().context("build fetcher")
}
