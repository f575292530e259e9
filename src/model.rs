//! Content model for harvested fiction.
//!
//! A [Story] is an ordered tree: entries are chapters or nested sections.
//! Extractors build it; the EPUB builder consumes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One story, or a titled section nested inside one. Both share the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub title: String,
    pub author: String,
    pub url: String,
    #[serde(rename = "coverUrl", default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub contents: Vec<Entry>,
    /// Rendered footnote fragments in registration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub footnotes: Vec<String>,
}

/// A nested section is a story without its own archive.
pub type Section = Story;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entry {
    Chapter(Chapter),
    Section(Section),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    /// Sanitized markup fragment.
    pub contents: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
}

/// An image embedded by a chapter. `path` is relative to the chapter's directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub path: String,
    #[serde(skip)]
    pub contents: Vec<u8>,
    pub media_type: String,
}

/// A chapter as it appears in reading order, with its section title folded into the display title.
#[derive(Debug, Clone, Copy)]
pub struct FlatChapter<'a> {
    pub chapter: &'a Chapter,
    /// Title of the innermost enclosing section, if any.
    pub section_title: Option<&'a str>,
}

impl FlatChapter<'_> {
    pub fn display_title(&self) -> String {
        match self.section_title {
            Some(section) => format!("{}: {}", section, self.chapter.title),
            None => self.chapter.title.clone(),
        }
    }
}

impl Story {
    pub fn new(
        title: impl Into<String>,
        author: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            url: url.into(),
            cover_url: None,
            tags: Vec::new(),
            summary: None,
            contents: Vec::new(),
            footnotes: Vec::new(),
        }
    }

    /// Stable id derived from the URL, so reruns produce the same archive paths.
    pub fn id(&self) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, self.url.as_bytes()).to_string()
    }

    pub fn add_chapter(&mut self, chapter: Chapter) {
        self.contents.push(Entry::Chapter(chapter));
    }

    pub fn add_section(&mut self, section: Section) {
        self.contents.push(Entry::Section(section));
    }

    /// Every chapter in pre-order: a section's chapters appear at the section's position.
    pub fn chapters(&self) -> Vec<FlatChapter<'_>> {
        let mut out = Vec::new();
        self.collect_chapters(None, &mut out);
        out
    }

    fn collect_chapters<'a>(&'a self, section_title: Option<&'a str>, out: &mut Vec<FlatChapter<'a>>) {
        for entry in &self.contents {
            match entry {
                Entry::Chapter(chapter) => out.push(FlatChapter {
                    chapter,
                    section_title,
                }),
                Entry::Section(section) => section.collect_chapters(Some(&section.title), out),
            }
        }
    }

    /// Number of chapters across all nesting levels.
    pub fn len(&self) -> usize {
        self.contents
            .iter()
            .map(|entry| match entry {
                Entry::Chapter(_) => 1,
                Entry::Section(section) => section.len(),
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chapter dates across all nesting levels, in reading order.
    pub fn dates(&self) -> Vec<DateTime<Utc>> {
        self.chapters()
            .iter()
            .filter_map(|flat| flat.chapter.date)
            .collect()
    }

    pub fn started(&self) -> Option<DateTime<Utc>> {
        self.dates().into_iter().min()
    }

    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.dates().into_iter().max()
    }
}

impl Chapter {
    pub fn new(title: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            contents: contents.into(),
            date: None,
            images: Vec::new(),
        }
    }

    pub fn with_date(mut self, date: Option<DateTime<Utc>>) -> Self {
        self.date = date;
        self
    }
}
