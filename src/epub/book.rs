//! Story → archive entries: cover, front matter, chapters, footnotes, stylesheet, images.
//!
//! Every chapter of a story lands in one directory named by the story id, numbered
//! in reading order, so footnote links between `chapterN.html` and
//! `footnotes.html` resolve without path juggling.

use super::{EpubFile, EpubMeta, FileRole};
use crate::cover::CoverImage;
use crate::markup::{escape_attr, escape_text, to_xhtml};
use crate::model::Story;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

const BASE_CSS: &str = include_str!("base.css");

fn html_page(title: &str, text: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head>
    <title>{title}</title>
    <link rel="stylesheet" type="text/css" href="../Styles/base.css" />
</head>
<body>
<h1>{title}</h1>
{text}
</body>
</html>
"#,
        title = escape_text(title),
        text = text
    )
}

fn cover_page(image_path: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
    <title>Cover</title>
    <link rel="stylesheet" type="text/css" href="Styles/base.css" />
</head>
<body>
<div class="cover">
<svg version="1.1" xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink"
    width="100%" height="100%" viewBox="0 0 600 800" preserveAspectRatio="xMidYMid meet">
<image width="600" height="800" xlink:href="{}" />
</svg>
</div>
</body>
</html>
"#,
        escape_attr(image_path)
    )
}

fn day(date: Option<DateTime<Utc>>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn front_matter(story: &Story, now: DateTime<Utc>) -> String {
    let mut extra = String::new();
    if let Some(summary) = &story.summary {
        extra.push_str(&format!(
            "    <div class=\"summary\">\n{}\n    </div>\n",
            to_xhtml(summary)
        ));
    }
    if !story.tags.is_empty() {
        let tags: Vec<String> = story.tags.iter().map(|t| escape_text(t)).collect();
        extra.push_str(&format!("    <p class=\"tags\">{}</p>\n", tags.join(", ")));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
    <title>Front Matter</title>
    <link rel="stylesheet" type="text/css" href="Styles/base.css" />
</head>
<body>
<div class="cover title">
    <h1>{title}<br />By {author}</h1>
    <dl>
        <dt>Source</dt>
        <dd>{source}</dd>
        <dt>Started</dt>
        <dd>{started}</dd>
        <dt>Updated</dt>
        <dd>{updated}</dd>
        <dt>Downloaded on</dt>
        <dd>{now}</dd>
    </dl>
{extra}</div>
</body>
</html>
"#,
        title = escape_text(&story.title),
        author = escape_text(&story.author),
        source = escape_text(&story.url),
        started = day(story.started()),
        updated = day(story.updated()),
        now = now.format("%Y-%m-%d"),
        extra = extra
    )
}

/// Book metadata for a story.
pub fn epub_meta(story: &Story) -> EpubMeta {
    EpubMeta {
        title: story.title.clone(),
        author: story.author.clone(),
        unique_id: story.url.clone(),
        started: story.started(),
        updated: story.updated(),
        ..EpubMeta::default()
    }
}

/// Archive entries for `story`, in reading order.
pub fn build_files(story: &Story, cover: CoverImage, now: DateTime<Utc>) -> Vec<EpubFile> {
    let id = story.id();
    let cover_path = format!("images/cover.{}", cover.extension);
    let mut files = vec![
        EpubFile::page("cover", "cover.html", Some("Cover".to_string()), cover_page(&cover_path))
            .with_role(FileRole::CoverPage),
        EpubFile::resource("cover_image", cover_path, cover.media_type, cover.bytes)
            .with_role(FileRole::CoverImage),
        EpubFile::page(
            "frontmatter",
            "frontmatter.html",
            Some("Front Matter".to_string()),
            front_matter(story, now),
        ),
    ];

    let mut images = Vec::new();
    let mut image_paths = HashSet::new();
    for (i, flat) in story.chapters().into_iter().enumerate() {
        let title = flat.display_title();
        let html = html_page(&title, &to_xhtml(&flat.chapter.contents));
        files.push(EpubFile::page(
            format!("chapter{}", i + 1),
            format!("{}/chapter{}.html", id, i + 1),
            Some(title),
            html,
        ));
        for image in &flat.chapter.images {
            let path = format!("{}/{}", id, image.path);
            if image_paths.insert(path.clone()) {
                images.push(EpubFile::resource(
                    format!("image{}", image_paths.len()),
                    path,
                    image.media_type.clone(),
                    image.contents.clone(),
                ));
            }
        }
    }

    if !story.footnotes.is_empty() {
        let notes: Vec<String> = story.footnotes.iter().map(|n| to_xhtml(n)).collect();
        files.push(EpubFile::page(
            "footnotes",
            format!("{}/footnotes.html", id),
            Some("Footnotes".to_string()),
            html_page("Footnotes", &notes.join("\n\n")),
        ));
    }

    files.push(EpubFile::resource(
        "base_css",
        "Styles/base.css",
        "text/css",
        BASE_CSS.as_bytes().to_vec(),
    ));
    files.extend(images);
    files
}
