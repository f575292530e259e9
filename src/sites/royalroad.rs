//! Royal Road adapter. Fetches the fiction page (metadata + TOC) then each chapter.
//!
//! Cloudflare challenges are not solved here; the session falls back to archived
//! snapshots when it sees one.

use super::{
    base_option_defs, parse_selector, strip_title_site_suffix, Credentials, Document, Site,
    SiteContext, SiteError,
};
use crate::markup::{self, escape_text, inner_xhtml, outer_xhtml, text_of, Action};
use crate::model::{Chapter, Story};
use crate::options::SiteOption;
use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::ElementRef;
use serde::Deserialize;
use std::sync::LazyLock;
use tracing::{info, warn};

const TITLE_SUFFIXES: &[&str] = &[" _ Royal Road", " - Royal Road", " | Royal Road"];
const LOGIN_URL: &str = "https://www.royalroad.com/account/login";

pub struct RoyalRoad;

/// Shape of one entry in window.chapters (relative url, order 0-based, isUnlocked).
#[derive(Debug, Deserialize)]
struct WindowChapter {
    title: String,
    url: String,
    #[serde(default)]
    order: u32,
    #[serde(rename = "isUnlocked", default = "default_true")]
    is_unlocked: bool,
}

fn default_true() -> bool {
    true
}

/// One chapter link from the fiction page.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TocEntry {
    title: String,
    url: String,
    unlocked: bool,
}

/// Fiction page metadata.
#[derive(Debug, Clone, Default, PartialEq)]
struct FictionMeta {
    title: String,
    author: String,
    url: Option<String>,
    cover_url: Option<String>,
    summary: Option<String>,
    tags: Vec<String>,
}

fn first_text(doc: &Document, sel: &str) -> Result<Option<String>, SiteError> {
    Ok(doc
        .select_first(&parse_selector(sel)?)
        .map(text_of)
        .filter(|s| !s.is_empty()))
}

/// Metadata from the fiction page: JSON-LD Book where present, DOM for the rest.
fn parse_metadata(doc: &Document) -> Result<FictionMeta, SiteError> {
    let ld_sel = parse_selector(r#"script[type="application/ld+json"]"#)?;
    let book = doc
        .select_all(&ld_sel)
        .into_iter()
        .filter_map(|s| serde_json::from_str::<serde_json::Value>(&s.text().collect::<String>()).ok())
        .find(|v| v.get("@type").and_then(|t| t.as_str()) == Some("Book"));
    let ld = |key: &str| {
        book.as_ref()
            .and_then(|b| b.get(key))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let ld_author = book
        .as_ref()
        .and_then(|b| b.get("author"))
        .and_then(|a| a.get("name"))
        .and_then(|n| n.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let title = ld("name")
        .map(Ok)
        .or_else(|| first_text(doc, "h1").transpose())
        .transpose()?;
    let author = ld_author
        .or_else(|| doc.meta("books:author"))
        .map(Ok)
        .or_else(|| first_text(doc, "h4 a.font-white").transpose())
        .transpose()?;
    let (title, author) = match (title, author) {
        (Some(t), Some(a)) => (t, a),
        _ => {
            return Err(SiteError::Structure {
                url: doc.url.clone(),
                message: "missing title or author (selector or structure may have changed)"
                    .to_string(),
            })
        }
    };

    let cover_url = doc
        .select_first(&parse_selector("img.thumbnail")?)
        .and_then(|img| img.value().attr("src"))
        .and_then(|src| doc.join(src))
        .or_else(|| ld("image"))
        .or_else(|| doc.meta("og:image"));
    let summary = doc
        .select_first(&parse_selector("div.description")?)
        .map(inner_xhtml)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| ld("description").map(|d| format!("<p>{}</p>", escape_text(&d))));
    let tag_sel = parse_selector("span.tags a.fiction-tag")?;
    let tags = doc
        .select_all(&tag_sel)
        .into_iter()
        .map(text_of)
        .filter(|t| !t.is_empty())
        .collect();

    Ok(FictionMeta {
        title,
        author,
        url: doc.meta("og:url"),
        cover_url,
        summary,
        tags,
    })
}

/// Chapter list from window.chapters, falling back to the `#chapters` table.
fn parse_toc(doc: &Document, html: &str) -> Result<Vec<TocEntry>, SiteError> {
    if let Some(entries) = parse_window_chapters(doc, html) {
        return Ok(entries);
    }
    let row_sel = parse_selector("#chapters tbody tr[data-url]")?;
    let link_sel = parse_selector("a[href]")?;
    Ok(doc
        .select_all(&row_sel)
        .into_iter()
        .filter_map(|row| {
            let url = doc.join(row.value().attr("data-url")?)?;
            let title = row.select(&link_sel).next().map(text_of).unwrap_or_default();
            Some(TocEntry {
                title,
                url,
                unlocked: true,
            })
        })
        .collect())
}

fn parse_window_chapters(doc: &Document, html: &str) -> Option<Vec<TocEntry>> {
    let needle = "window.chapters = ";
    let after_assign = html.find(needle)? + needle.len();
    let array = extract_json_array_with_strings(&html[after_assign..])?;
    let mut chapters: Vec<WindowChapter> = match serde_json::from_str(array) {
        Ok(c) => c,
        Err(e) => {
            warn!("Unreadable window.chapters ({}); using the chapter table", e);
            return None;
        }
    };
    chapters.sort_by_key(|c| c.order);
    Some(
        chapters
            .into_iter()
            .filter_map(|c| {
                Some(TocEntry {
                    url: doc.join(&c.url)?,
                    title: c.title.trim().to_string(),
                    unlocked: c.is_unlocked,
                })
            })
            .collect(),
    )
}

/// Find the matching closing bracket for the first '[' in s, skipping content inside JSON strings.
fn extract_json_array_with_strings(s: &str) -> Option<&str> {
    let start = s.find('[')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (byte_offset, c) in s[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + byte_offset + 1]);
                }
            }
            '"' => in_string = true,
            _ => {}
        }
    }
    None
}

static FICTION_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://(?:www\.)?royalroadl?\.com/fiction/\d+)(?:[/?#].*)?$")
        .expect("fiction url pattern")
});

static HIDDEN_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.([\w-]+)\s*\{[^}]*display:\s*none\s*;?[^}]*\}").expect("hidden class pattern")
});

/// Classes hidden by the page's own `<style>` blocks. Royal Road hides anti-piracy notices this way.
fn hidden_classes(doc: &Document) -> Result<Vec<String>, SiteError> {
    let style_sel = parse_selector("style")?;
    Ok(doc
        .select_all(&style_sel)
        .into_iter()
        .flat_map(|s| {
            let css = s.text().collect::<String>();
            HIDDEN_RULE
                .captures_iter(&css)
                .map(|c| c[1].to_string())
                .collect::<Vec<_>>()
        })
        .collect())
}

/// Chapter date from the author's profile box.
fn chapter_date(doc: &Document) -> Result<Option<DateTime<Utc>>, SiteError> {
    Ok(doc
        .select_first(&parse_selector(".profile-info time[unixtime]")?)
        .and_then(|t| t.value().attr("unixtime"))
        .and_then(|ts| ts.trim().parse::<i64>().ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0)))
}

/// Chapter title from the page, used when the TOC entry has none.
fn page_title(doc: &Document) -> Result<Option<String>, SiteError> {
    if let Some(t) = first_text(doc, "h1.font-white.break-word")? {
        return Ok(Some(t));
    }
    Ok(doc
        .meta("og:title")
        .map(|t| strip_title_site_suffix(&t, TITLE_SUFFIXES))
        .filter(|t| !t.is_empty()))
}

/// Is the first `div` under the content's parent an author note? Then a lone note goes first.
fn note_precedes(content: ElementRef<'_>) -> bool {
    content
        .parent()
        .and_then(ElementRef::wrap)
        .and_then(|parent| {
            parent
                .children()
                .filter_map(ElementRef::wrap)
                .find(|c| c.value().name() == "div")
        })
        .map(|first| first.value().classes().any(|c| c == "author-note-portlet"))
        .unwrap_or(false)
}

fn offset_limit(ctx: &SiteContext<'_>) -> (usize, Option<usize>) {
    let get = |key: &str| {
        ctx.options()
            .int(key)
            .filter(|n| *n > 0)
            .and_then(|n| usize::try_from(n).ok())
    };
    (get("offset").unwrap_or(0), get("limit"))
}

impl RoyalRoad {
    fn chapter(
        &self,
        ctx: &mut SiteContext<'_>,
        url: &str,
        toc_title: &str,
    ) -> Result<Chapter, SiteError> {
        info!("Extracting chapter @ {}", url);
        let doc = ctx.fetch_html(url)?;
        let content_sel = parse_selector("div.chapter-content")?;
        let content = doc
            .select_first(&content_sel)
            .ok_or_else(|| SiteError::Structure {
                url: doc.url.clone(),
                message: "no div.chapter-content".to_string(),
            })?;

        let mut cleaner = ctx.cleaner(&doc.base);
        for class in hidden_classes(&doc)? {
            cleaner = cleaner.drop_class(class);
        }
        let cleaned = cleaner.clean(&inner_xhtml(content));
        let body = markup::rewrite(&cleaned, |el| {
            if el.value().classes().any(|c| c == "spoiler-new") {
                let caption = el.value().attr("data-caption");
                Action::Replace(ctx.render_spoiler(&inner_xhtml(el), caption))
            } else {
                Action::Keep
            }
        });
        let body = format!("<div class=\"chapter-content\">{}</div>", body);

        let note_sel = parse_selector("div.author-note-portlet")?;
        let notes: Vec<String> = doc
            .select_all(&note_sel)
            .into_iter()
            .map(|n| cleaner.clean(&outer_xhtml(n)))
            .collect();
        let contents = match notes.as_slice() {
            [] => body,
            [note] if note_precedes(content) => format!("{}<hr/>{}", note, body),
            [note] => format!("{}<hr/>{}", body, note),
            [first, second, ..] => format!("{}<hr/>{}<hr/>{}", first, body, second),
        };

        let title = Some(toc_title.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(Ok)
            .or_else(|| page_title(&doc).transpose())
            .transpose()?
            .unwrap_or_else(|| format!("Chapter {}", ctx.chapter_number()));
        let (contents, images) = ctx.embed_images(&contents);
        let mut chapter = Chapter::new(title, contents).with_date(chapter_date(&doc)?);
        chapter.images = images;
        Ok(chapter)
    }
}

impl Site for RoyalRoad {
    fn key(&self) -> &'static str {
        "RoyalRoad"
    }

    /// e.g. https://www.royalroad.com/fiction/6752/lament-of-the-fallen
    fn matches(&self, url: &str) -> Option<String> {
        FICTION_URL
            .captures(url.trim())
            .map(|c| format!("{}/", &c[1]))
    }

    fn option_defs(&self) -> Vec<SiteOption> {
        let mut defs = base_option_defs();
        defs.push(SiteOption::int(
            "offset",
            "offset",
            "The chapter index to start at in the chapter list.",
        ));
        defs.push(SiteOption::int(
            "limit",
            "limit",
            "The chapter index to stop before in the chapter list.",
        ));
        defs
    }

    fn login(&self, ctx: &mut SiteContext<'_>, creds: &Credentials) -> Result<(), SiteError> {
        info!("Logging in to Royal Road as {}", creds.username);
        let page = ctx.session().post_form(
            LOGIN_URL,
            &[
                ("Email", creds.username.as_str()),
                ("Password", creds.password.as_str()),
            ],
        )?;
        let rejected = !page.is_success() || page.text().contains("alert-danger");
        if rejected {
            return Err(SiteError::Login {
                site: self.key().to_string(),
                reason: format!("HTTP {} from {}", page.status, page.url),
            });
        }
        Ok(())
    }

    fn extract(&self, ctx: &mut SiteContext<'_>, url: &str) -> Result<Story, SiteError> {
        let fiction_url = self.matches(url).ok_or_else(|| SiteError::InvalidUrl {
            input: url.to_string(),
            reason: "not a Royal Road fiction URL".to_string(),
        })?;
        ctx.begin_index();
        let page = ctx.session().get(&fiction_url)?;
        let html = page.text();
        let doc = Document::parse(&page.url, &html)?;

        let meta = parse_metadata(&doc)?;
        let mut story = Story::new(meta.title, meta.author, meta.url.unwrap_or(fiction_url));
        story.cover_url = meta.cover_url;
        story.summary = meta.summary;
        story.tags = meta.tags;

        let toc = parse_toc(&doc, &html)?;
        let (offset, limit) = offset_limit(ctx);
        let selected: Vec<TocEntry> = toc
            .into_iter()
            .enumerate()
            .filter(|(i, _)| *i >= offset && limit.map_or(true, |l| *i < l))
            .map(|(_, entry)| entry)
            .filter(|entry| {
                if !entry.unlocked {
                    warn!("Skipping locked chapter {:?}", entry.title);
                }
                entry.unlocked
            })
            .collect();

        let total = selected.len();
        for entry in selected {
            ctx.begin_chapter(Some(total));
            let chapter = self.chapter(ctx, &entry.url, &entry.title)?;
            story.add_chapter(chapter);
        }
        Ok(story)
    }
}
