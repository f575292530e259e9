//! Footnote registry. Extractors move asides (spoilers, notes) out of the chapter
//! body into a rear-notes page and leave a numbered link behind.
//!
//! Links assume the chapter and the footnotes page live in the same archive
//! directory: `chapter{n}.html` and `footnotes.html`.

use crate::markup::{element, escape_text};

/// Append-only list of rendered footnotes. Ids are 1-based and dense.
#[derive(Debug, Default, Clone)]
pub struct FootnoteRegistry {
    notes: Vec<String>,
}

impl FootnoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `body` as the next footnote of chapter `chapter_number` (1-based, reading order).
    ///
    /// Returns the forward link to put where the body used to be. `label` defaults to the id.
    pub fn register(&mut self, body: &str, chapter_number: usize, label: Option<&str>) -> String {
        let idx = self.notes.len() + 1;
        let backlink = element(
            "a",
            &[("href", &format!("chapter{}.html#noteback{}", chapter_number, idx))],
            "^",
        );
        let note = element(
            "div",
            &[("id", &format!("footnote{}", idx)), ("epub:type", "rearnote")],
            &format!("{}{}", backlink, body),
        );
        self.notes.push(note);

        let text = match label {
            Some(l) if !l.trim().is_empty() => escape_text(l.trim()),
            _ => idx.to_string(),
        };
        element(
            "a",
            &[
                ("id", &format!("noteback{}", idx)),
                ("href", &format!("footnotes.html#footnote{}", idx)),
                ("epub:type", "noteref"),
            ],
            &text,
        )
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// Hand the notes to the story and start over.
    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notes)
    }
}
