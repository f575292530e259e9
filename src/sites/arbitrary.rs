//! Selector-driven extractor for one-off sites, described by a JSON file.
//!
//! ```json
//! {
//!     "url": "https://example.wordpress.com/table-of-contents/",
//!     "title": "A Story",
//!     "author": "someone",
//!     "chapter_selector": "#main .entry-content > ul > li > a",
//!     "content_selector": "#main .entry-content",
//!     "filter_selector": ".sharedaddy, .wpcnt"
//! }
//! ```
//!
//! With `chapter_selector` the page at `url` is a table of contents. Without it,
//! `url` is the first chapter and `next_selector` (if any) leads to the next one.

use super::{parse_selector, Document, Site, SiteContext, SiteError};
use crate::markup::{self, text_of};
use crate::model::{Chapter, Story};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SiteDefinition {
    pub url: String,
    pub title: String,
    pub author: String,
    pub content_selector: String,
    /// Element inside the content whose text is the chapter title. Falls back to the link text.
    #[serde(default)]
    pub content_title_selector: Option<String>,
    /// Element inside the content that holds the chapter text.
    #[serde(default)]
    pub content_text_selector: Option<String>,
    /// Chapter links on the `url` page.
    #[serde(default)]
    pub chapter_selector: Option<String>,
    /// Link to the next content page, used without `chapter_selector`.
    #[serde(default)]
    pub next_selector: Option<String>,
    /// Elements removed from the content.
    #[serde(default)]
    pub filter_selector: Option<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
}

impl SiteDefinition {
    pub fn load(path: &Path) -> Result<Self, SiteError> {
        let definition_err = |reason: String| SiteError::Definition {
            path: path.to_path_buf(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| definition_err(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| definition_err(e.to_string()))
    }
}

pub struct Arbitrary;

impl Site for Arbitrary {
    fn key(&self) -> &'static str {
        "Arbitrary"
    }

    fn matches(&self, url: &str) -> Option<String> {
        url.trim().ends_with(".json").then(|| url.trim().to_string())
    }

    fn extract(&self, ctx: &mut SiteContext<'_>, url: &str) -> Result<Story, SiteError> {
        let path = PathBuf::from(url);
        let definition = SiteDefinition::load(&path)?;
        let content_sel = parse_selector(&definition.content_selector)?;
        let title_sel = definition
            .content_title_selector
            .as_deref()
            .map(parse_selector)
            .transpose()?;
        let text_sel = definition
            .content_text_selector
            .as_deref()
            .map(parse_selector)
            .transpose()?;
        let chapter = ChapterRules {
            definition: &definition,
            content: content_sel,
            title: title_sel,
            text: text_sel,
        };

        let mut story = Story::new(&definition.title, &definition.author, &definition.url);
        story.cover_url = definition.cover_url.clone().filter(|c| !c.is_empty());

        if let Some(chapter_selector) = &definition.chapter_selector {
            let link_sel = parse_selector(chapter_selector)?;
            ctx.begin_index();
            let index = ctx.fetch_html(&definition.url)?;
            let links: Vec<(String, String)> = index
                .select_all(&link_sel)
                .into_iter()
                .filter_map(|a| {
                    let href = a.value().attr("href")?;
                    Some((index.join(href)?, text_of(a)))
                })
                .collect();
            if links.is_empty() {
                warn!("No chapter links match {:?} at {}", chapter_selector, definition.url);
            }
            let total = links.len();
            for (chapter_url, link_text) in links {
                info!("Extracting chapter @ {}", chapter_url);
                let doc = ctx.fetch_html(&chapter_url)?;
                for c in chapter.extract(ctx, &doc, Some(&link_text), Some(total))? {
                    story.add_chapter(c);
                }
            }
        } else {
            let next_sel = definition
                .next_selector
                .as_deref()
                .map(parse_selector)
                .transpose()?;
            match next_sel {
                Some(next) => {
                    ctx.follow_next(&definition.url, &next, |ctx, doc| {
                        info!("Extracting chapter @ {}", doc.url);
                        for c in chapter.extract(ctx, doc, None, None)? {
                            story.add_chapter(c);
                        }
                        Ok(())
                    })?;
                }
                None => {
                    let doc = ctx.fetch_html(&definition.url)?;
                    for c in chapter.extract(ctx, &doc, None, None)? {
                        story.add_chapter(c);
                    }
                }
            }
        }
        Ok(story)
    }
}

struct ChapterRules<'d> {
    definition: &'d SiteDefinition,
    content: scraper::Selector,
    title: Option<scraper::Selector>,
    text: Option<scraper::Selector>,
}

impl ChapterRules<'_> {
    /// Every content match on the page becomes a chapter, numbered as it is emitted.
    fn extract(
        &self,
        ctx: &mut SiteContext<'_>,
        doc: &Document,
        link_text: Option<&str>,
        total: Option<usize>,
    ) -> Result<Vec<Chapter>, SiteError> {
        let mut cleaner = ctx.cleaner(&doc.base);
        if let Some(filter) = &self.definition.filter_selector {
            cleaner = cleaner.drop_selector(filter)?;
        }
        let date = doc
            .meta("article:published_time")
            .and_then(|d| DateTime::parse_from_rfc3339(&d).ok())
            .map(|d| d.with_timezone(&Utc));

        let mut chapters = Vec::new();
        for content in doc.select_all(&self.content) {
            let body = match &self.text {
                Some(sel) => match content.select(sel).next() {
                    Some(text) => markup::inner_xhtml(text),
                    None => {
                        warn!("No text matching content_text_selector in {}", doc.url);
                        continue;
                    }
                },
                None => markup::inner_xhtml(content),
            };
            ctx.begin_chapter(total);
            let title = self
                .title
                .as_ref()
                .and_then(|sel| content.select(sel).next())
                .map(text_of)
                .filter(|t| !t.is_empty())
                .or_else(|| link_text.map(str::to_string).filter(|t| !t.is_empty()))
                .or_else(|| doc.meta("og:title"))
                .unwrap_or_else(|| format!("Chapter {}", ctx.chapter_number()));
            let (body, images) = ctx.embed_images(&cleaner.clean(&body));
            let mut chapter = Chapter::new(title, format!("<div>{}</div>", body)).with_date(date);
            chapter.images = images;
            chapters.push(chapter);
        }
        if chapters.is_empty() {
            warn!("Nothing matches {:?} at {}", self.definition.content_selector, doc.url);
        }
        Ok(chapters)
    }
}
