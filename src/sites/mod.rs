//! Site extractors and the contract they run under.
//!
//! A [Site] recognizes its URLs, declares its options, optionally logs in, and
//! turns a URL into a [Story]. Extractors do their I/O through a
//! [SiteContext], which owns the fetch session, resolved options, footnotes and
//! run state for one download.

mod error;

pub mod arbitrary;
pub mod clean;
pub mod royalroad;

pub use error::SiteError;

use crate::cover;
use crate::fetch::Session;
use crate::footnote::FootnoteRegistry;
use crate::markup::{self, escape_text, Action};
use crate::model::{Image, Story};
use crate::options::{dedup_defs, ResolvedOptions, SiteOption};
use clean::Cleaner;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use url::Url;

/// Default cap for one embedded chapter image.
pub const DEFAULT_IMAGE_MAX_BYTES: usize = 5 * 1024 * 1024;

/// Parse a CSS selector or return a typed error (avoids panics from Selector::parse).
pub fn parse_selector(sel: &str) -> Result<Selector, SiteError> {
    Selector::parse(sel).map_err(|e| SiteError::Selector {
        selector: sel.to_string(),
        reason: e.to_string(),
    })
}

/// Resolve `href` against `base`. None when the result is not a valid URL.
pub fn join_url(base: &Url, href: &str) -> Option<String> {
    base.join(href.trim()).ok().map(|u| u.to_string())
}

/// Strip a known site suffix from a page title (e.g. " | Royal Road"), keeping separators inside the title.
pub fn strip_title_site_suffix(s: &str, suffixes: &[&str]) -> String {
    let mut t = s.trim();
    for suffix in suffixes {
        if let Some(stripped) = t.strip_suffix(suffix) {
            t = stripped.trim();
            break;
        }
    }
    t.to_string()
}

fn strip_fragment(url: &str) -> String {
    match url.split_once('#') {
        Some((head, _)) => head.to_string(),
        None => url.to_string(),
    }
}

/// Login details for one site, from the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Options every site understands.
pub fn base_option_defs() -> Vec<SiteOption> {
    vec![
        SiteOption::choice(
            "spoilers",
            "spoilers",
            &["footnote", "inline", "skip"],
            "footnote",
            "How to render spoiler blocks: move to footnotes, keep inline, or replace with a marker.",
        ),
        SiteOption::boolean(
            "strip_colors",
            "strip-colors",
            true,
            "Remove inline styles such as text colors from chapter markup.",
        )
        .negated("no-strip-colors"),
        SiteOption::boolean(
            "fetch_images",
            "include-images",
            true,
            "Download images referenced by chapters into the book.",
        )
        .negated("no-include-images"),
    ]
}

/// What an extractor is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    FetchingIndex,
    FetchingChapter { number: usize, total: Option<usize> },
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoilerMode {
    Footnote,
    Inline,
    Skip,
}

/// A site extractor.
pub trait Site {
    /// Stable name used for config tables and logs.
    fn key(&self) -> &'static str;

    /// Canonical URL when this site handles `url`. Must not do I/O.
    fn matches(&self, url: &str) -> Option<String>;

    fn option_defs(&self) -> Vec<SiteOption> {
        base_option_defs()
    }

    /// Authenticate the session. Sites without logins accept and ignore credentials.
    fn login(&self, _ctx: &mut SiteContext<'_>, _creds: &Credentials) -> Result<(), SiteError> {
        Ok(())
    }

    /// Build the story tree for a URL previously accepted by [Site::matches].
    fn extract(&self, ctx: &mut SiteContext<'_>, url: &str) -> Result<Story, SiteError>;
}

/// Explicit list of known sites, checked in registration order.
#[derive(Default)]
pub struct Registry {
    sites: Vec<Box<dyn Site>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in extractor.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(arbitrary::Arbitrary));
        registry.register(Box::new(royalroad::RoyalRoad));
        registry
    }

    pub fn register(&mut self, site: Box<dyn Site>) {
        self.sites.push(site);
    }

    /// First site that accepts `url`, with its canonical form of the URL.
    pub fn resolve(&self, url: &str) -> Result<(&dyn Site, String), SiteError> {
        for site in &self.sites {
            if let Some(canonical) = site.matches(url) {
                info!("Handler: {} ({})", site.key(), canonical);
                return Ok((site.as_ref(), canonical));
            }
        }
        Err(SiteError::NoHandler {
            url: url.to_string(),
        })
    }

    pub fn sites(&self) -> impl Iterator<Item = &dyn Site> {
        self.sites.iter().map(|s| s.as_ref())
    }

    /// Options of every site, each name once.
    pub fn all_option_defs(&self) -> Vec<SiteOption> {
        dedup_defs(self.sites.iter().flat_map(|s| s.option_defs()))
    }
}

/// A parsed page plus the base URL its relative links resolve against.
pub struct Document {
    /// Final URL of the page.
    pub url: String,
    /// `<base href>` if present, else the page URL.
    pub base: Url,
    pub html: Html,
}

impl Document {
    pub fn parse(page_url: &str, body: &str) -> Result<Self, SiteError> {
        let page = Url::parse(page_url).map_err(|e| SiteError::InvalidUrl {
            input: page_url.to_string(),
            reason: e.to_string(),
        })?;
        let html = Html::parse_document(body);
        let base_sel = parse_selector("base[href]")?;
        let base = html
            .select(&base_sel)
            .next()
            .and_then(|b| b.value().attr("href"))
            .and_then(|href| page.join(href).ok())
            .unwrap_or_else(|| page.clone());
        Ok(Self {
            url: page.to_string(),
            base,
            html,
        })
    }

    pub fn select_first(&self, sel: &Selector) -> Option<ElementRef<'_>> {
        self.html.select(sel).next()
    }

    pub fn select_all(&self, sel: &Selector) -> Vec<ElementRef<'_>> {
        self.html.select(sel).collect()
    }

    /// Resolve `href` against the document base.
    pub fn join(&self, href: &str) -> Option<String> {
        join_url(&self.base, href)
    }

    /// `content` of `<meta property=...>` or `<meta name=...>`.
    pub fn meta(&self, key: &str) -> Option<String> {
        self.html
            .select(&parse_selector("meta").ok()?)
            .find(|m| {
                m.value().attr("property") == Some(key) || m.value().attr("name") == Some(key)
            })
            .and_then(|m| m.value().attr("content"))
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
    }
}

/// Per-run state handed to extractors.
pub struct SiteContext<'a> {
    session: &'a mut Session,
    options: ResolvedOptions,
    footnotes: FootnoteRegistry,
    state: RunState,
    chapter_number: usize,
    logged_in_as: Option<String>,
    image_max_bytes: usize,
    progress: Option<&'a dyn Fn(RunState)>,
}

impl<'a> SiteContext<'a> {
    pub fn new(session: &'a mut Session, options: ResolvedOptions) -> Self {
        Self {
            session,
            options,
            footnotes: FootnoteRegistry::new(),
            state: RunState::Idle,
            chapter_number: 0,
            logged_in_as: None,
            image_max_bytes: DEFAULT_IMAGE_MAX_BYTES,
            progress: None,
        }
    }

    /// Called on every state change.
    pub fn with_progress(mut self, progress: &'a dyn Fn(RunState)) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_image_limit(mut self, max_bytes: usize) -> Self {
        self.image_max_bytes = max_bytes;
        self
    }

    pub fn options(&self) -> &ResolvedOptions {
        &self.options
    }

    pub fn session(&mut self) -> &mut Session {
        &mut *self.session
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn footnotes(&self) -> &FootnoteRegistry {
        &self.footnotes
    }

    pub fn logged_in_as(&self) -> Option<&str> {
        self.logged_in_as.as_deref()
    }

    fn set_state(&mut self, state: RunState) {
        self.state = state;
        if let Some(progress) = self.progress {
            progress(state);
        }
    }

    pub fn begin_index(&mut self) {
        self.set_state(RunState::FetchingIndex);
    }

    /// Start the next chapter in reading order. Returns its 1-based number.
    pub fn begin_chapter(&mut self, total: Option<usize>) -> usize {
        self.chapter_number += 1;
        let number = self.chapter_number;
        self.set_state(RunState::FetchingChapter { number, total });
        number
    }

    /// Number of the chapter being extracted, 0 before the first.
    pub fn chapter_number(&self) -> usize {
        self.chapter_number
    }

    /// Move `body` to the footnotes page and return the link that replaces it.
    pub fn footnote(&mut self, body: &str, label: Option<&str>) -> String {
        self.footnotes
            .register(body, self.chapter_number.max(1), label)
    }

    pub fn spoiler_mode(&self) -> SpoilerMode {
        match self.options.str("spoilers") {
            Some("inline") => SpoilerMode::Inline,
            Some("skip") => SpoilerMode::Skip,
            _ => SpoilerMode::Footnote,
        }
    }

    /// Render one spoiler block according to the `spoilers` option.
    pub fn render_spoiler(&mut self, body: &str, title: Option<&str>) -> String {
        let title = title.map(str::trim).filter(|t| !t.is_empty());
        let inner = match self.spoiler_mode() {
            SpoilerMode::Skip => match title {
                Some(t) => format!("[SPOILER: {}]", escape_text(t)),
                None => "[SPOILER]".to_string(),
            },
            SpoilerMode::Inline => match title {
                Some(t) => format!("{}: {}", escape_text(t), body),
                None => body.to_string(),
            },
            SpoilerMode::Footnote => self.footnote(body, title),
        };
        markup::element("div", &[("class", "spoiler")], &inner)
    }

    /// Cleaner for markup from a page with base `base`, honoring `strip_colors`.
    pub fn cleaner(&self, base: &Url) -> Cleaner {
        Cleaner::new(base.clone()).strip_colors(self.options.bool_or("strip_colors", true))
    }

    /// GET `url` through the session and parse it.
    pub fn fetch_html(&mut self, url: &str) -> Result<Document, SiteError> {
        let page = self.session.get(url)?;
        Document::parse(&page.url, &page.text())
    }

    /// Visit `start`, then keep following the first `next` link until there is none
    /// or it leads back to a page already visited. Returns the number of pages visited.
    pub fn follow_next<F>(
        &mut self,
        start: &str,
        next: &Selector,
        mut visit: F,
    ) -> Result<usize, SiteError>
    where
        F: FnMut(&mut Self, &Document) -> Result<(), SiteError>,
    {
        let mut visited = HashSet::new();
        let mut current = Some(start.to_string());
        let mut pages = 0;
        while let Some(url) = current.take() {
            if !visited.insert(strip_fragment(&url)) {
                info!("Next link leads back to {}; stopping", url);
                break;
            }
            let doc = self.fetch_html(&url)?;
            let landed = strip_fragment(&doc.url);
            if landed != strip_fragment(&url) && !visited.insert(landed) {
                info!("{} redirected to an already visited page; stopping", url);
                break;
            }
            visit(self, &doc)?;
            pages += 1;
            current = doc
                .select_first(next)
                .and_then(|a| a.value().attr("href"))
                .and_then(|href| doc.join(href));
        }
        Ok(pages)
    }

    /// Download the images referenced by `html` and point them at archive paths.
    ///
    /// A no-op when `fetch_images` is off. Only absolute http(s) sources are fetched.
    pub fn embed_images(&mut self, html: &str) -> (String, Vec<Image>) {
        if !self.options.bool_or("fetch_images", true) {
            return (html.to_string(), Vec::new());
        }
        let mut images: Vec<Image> = Vec::new();
        let mut by_src: HashMap<String, String> = HashMap::new();
        let session = &mut *self.session;
        let max_bytes = self.image_max_bytes;
        let out = markup::rewrite(html, |el| {
            if el.value().name() != "img" {
                return Action::Keep;
            }
            let Some(src) = el.value().attr("src") else {
                return Action::Keep;
            };
            if !(src.starts_with("http://") || src.starts_with("https://")) {
                return Action::Keep;
            }
            let path = match by_src.get(src) {
                Some(path) => path.clone(),
                None => {
                    let fetched = cover::fetch_image(session, src, max_bytes);
                    let digest = hex::encode(Sha256::digest(src.as_bytes()));
                    let path = format!("images/{}.{}", &digest[..16], fetched.extension);
                    debug!(src, path = %path, "embedding image");
                    images.push(Image {
                        path: path.clone(),
                        contents: fetched.bytes,
                        media_type: fetched.media_type.to_string(),
                    });
                    by_src.insert(src.to_string(), path.clone());
                    path
                }
            };
            let attrs = el
                .value()
                .attrs()
                .filter(|(k, _)| *k != "srcset")
                .map(|(k, v)| {
                    let v = if k == "src" { path.as_str() } else { v };
                    (k.to_string(), v.to_string())
                })
                .collect();
            Action::KeepWith(attrs)
        });
        (out, images)
    }

    pub(crate) fn mark_logged_in(&mut self, username: &str) {
        self.logged_in_as = Some(username.to_string());
    }
}

/// Run one extraction: log in if needed, extract, attach footnotes, and checkpoint cookies.
pub fn open_story(
    site: &dyn Site,
    ctx: &mut SiteContext<'_>,
    url: &str,
    creds: Option<&Credentials>,
) -> Result<Story, SiteError> {
    ctx.set_state(RunState::Idle);
    if let Some(creds) = creds {
        if ctx.logged_in_as() != Some(creds.username.as_str()) {
            if let Err(e) = site.login(ctx, creds) {
                ctx.set_state(RunState::Failed);
                return Err(e);
            }
            ctx.mark_logged_in(&creds.username);
            save_cookies(ctx);
        }
    }

    let result = site.extract(ctx, url);
    save_cookies(ctx);
    let mut story = match result {
        Ok(story) => story,
        Err(e) => {
            ctx.set_state(RunState::Failed);
            return Err(e);
        }
    };
    if !ctx.footnotes.is_empty() {
        story.footnotes.extend(ctx.footnotes.take());
    }
    if story.is_empty() {
        ctx.set_state(RunState::Failed);
        return Err(SiteError::EmptyStory {
            url: url.to_string(),
        });
    }
    ctx.set_state(RunState::Done);
    Ok(story)
}

fn save_cookies(ctx: &mut SiteContext<'_>) {
    if let Err(e) = ctx.session.save_cookies() {
        warn!("{}", e);
    }
}
