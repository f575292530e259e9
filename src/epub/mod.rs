//! EPUB writer. Packs a list of [EpubFile]s into an archive (mimetype, container, NCX/nav, OPF, entries).
//!
//! When an archive already exists at the destination, entries it holds that are
//! not rewritten this run are carried across, so repeated downloads accumulate
//! rather than lose files.

pub mod book;

pub use book::{build_files, epub_meta};

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const CONTAINER_XML: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n  <rootfiles>\n    <rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/>\n  </rootfiles>\n</container>";

const MIMETYPE: &[u8] = b"application/epub+zip";
const OEBPS_PREFIX: &str = "OEBPS/";
const XHTML: &str = "application/xhtml+xml";
const GENERATOR: &str = "storyleech";

/// Archive entries this writer always produces itself; never copied from a prior archive.
const RESERVED: &[&str] = &[
    "mimetype",
    "META-INF/container.xml",
    "OEBPS/content.opf",
    "OEBPS/toc.ncx",
    "OEBPS/nav.xhtml",
];

/// EPUB format version.
///
/// Default is EPUB 2 (OPF 2.0, toc.ncx). EPUB 3 adds nav.xhtml and keeps toc.ncx for older readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpubVersion {
    #[default]
    Epub2,
    Epub3,
}

/// Errors from the EPUB writer.
///
/// Maps to CLI exit code 3.
#[derive(Debug, Error)]
pub enum EpubError {
    #[error("Cannot write EPUB: no cover page among the entries.")]
    MissingCover,

    #[error("Cannot write EPUB: nothing to write.")]
    NoEntries,

    #[error("Cannot write EPUB: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create EPUB file: {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write EPUB archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Failed to move finished EPUB into place at {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<std::io::Error> for EpubError {
    fn from(e: std::io::Error) -> Self {
        EpubError::Zip(zip::result::ZipError::Io(e))
    }
}

/// What an entry is for. Decides spine placement and cover metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Content,
    CoverPage,
    CoverImage,
}

/// One file to place under `OEBPS/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpubFile {
    pub id: String,
    /// Path relative to `OEBPS/`.
    pub path: String,
    pub contents: Vec<u8>,
    /// Navigation label. Untitled pages are in the spine but not the table of contents.
    pub title: Option<String>,
    pub media_type: String,
    pub role: FileRole,
}

impl EpubFile {
    /// An XHTML page.
    pub fn page(
        id: impl Into<String>,
        path: impl Into<String>,
        title: Option<String>,
        html: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            contents: html.into().into_bytes(),
            title,
            media_type: XHTML.to_string(),
            role: FileRole::Content,
        }
    }

    /// A non-page resource (stylesheet, image).
    pub fn resource(
        id: impl Into<String>,
        path: impl Into<String>,
        media_type: impl Into<String>,
        contents: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            contents,
            title: None,
            media_type: media_type.into(),
            role: FileRole::Content,
        }
    }

    pub fn with_role(mut self, role: FileRole) -> Self {
        self.role = role;
        self
    }

    fn is_page(&self) -> bool {
        self.media_type == XHTML && self.role != FileRole::CoverImage
    }
}

/// Book-level metadata for the OPF and NCX.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpubMeta {
    pub title: String,
    pub author: String,
    /// Usually the story URL. Blank gets a random id.
    pub unique_id: String,
    pub language: String,
    pub started: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

impl Default for EpubMeta {
    fn default() -> Self {
        Self {
            title: "Untitled".to_string(),
            author: "Unknown".to_string(),
            unique_id: String::new(),
            language: "en".to_string(),
            started: None,
            updated: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    pub output_dir: PathBuf,
    pub version: EpubVersion,
    /// Carry entries across from an archive already at the destination.
    pub merge: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            version: EpubVersion::default(),
            merge: true,
        }
    }
}

/// Allow-list `-_.() ` and ASCII alphanumerics; spaces become underscores.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || "-_.() ".contains(*c))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect()
}

/// Media type for an entry carried over from a prior archive.
fn media_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "html" | "xhtml" | "htm" => XHTML,
        "css" => "text/css",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ncx" => "application/x-dtbncx+xml",
        "ttf" | "otf" => "application/vnd.ms-opentype",
        _ => "application/octet-stream",
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn open_prior(dest: &Path) -> Option<ZipArchive<File>> {
    let file = File::open(dest).ok()?;
    match ZipArchive::new(file) {
        Ok(archive) => Some(archive),
        Err(e) => {
            warn!(
                "Existing {} is not a readable archive ({}); overwriting without merge",
                dest.display(),
                e
            );
            None
        }
    }
}

/// Write `files` to `<output_dir>/<sanitized filename>` and return the final path.
///
/// The archive is built in a temp file next to the destination and renamed into
/// place, so a failed run never leaves a partial archive at the final name.
pub fn write_epub(
    filename: &str,
    files: &[EpubFile],
    meta: &EpubMeta,
    opts: &WriteOptions,
) -> Result<PathBuf, EpubError> {
    if files.is_empty() {
        return Err(EpubError::NoEntries);
    }
    if !files.iter().any(|f| f.role == FileRole::CoverPage) {
        return Err(EpubError::MissingCover);
    }

    let mut name = sanitize_filename(filename);
    if !name.to_ascii_lowercase().ends_with(".epub") {
        name.push_str(".epub");
    }
    std::fs::create_dir_all(&opts.output_dir).map_err(|e| EpubError::Io {
        path: opts.output_dir.clone(),
        source: e,
    })?;
    let dest = opts.output_dir.join(&name);

    let mut seen = HashSet::new();
    let entries: Vec<&EpubFile> = files
        .iter()
        .filter(|f| {
            let fresh = seen.insert(f.path.as_str());
            if !fresh {
                warn!("Duplicate archive path {}; keeping the first", f.path);
            }
            fresh
        })
        .collect();
    let written: HashSet<String> = entries
        .iter()
        .map(|f| format!("{}{}", OEBPS_PREFIX, f.path))
        .collect();

    let mut prior = if opts.merge { open_prior(&dest) } else { None };
    let leftovers: Vec<String> = prior
        .as_ref()
        .map(|archive| {
            archive
                .file_names()
                .filter(|n| !n.ends_with('/'))
                .filter(|n| !RESERVED.contains(n) && !written.contains(*n))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if !leftovers.is_empty() {
        info!("Keeping {} entries from the existing {}", leftovers.len(), name);
    }

    let unique_id = if meta.unique_id.trim().is_empty() {
        format!("storyleech_book_{}", uuid::Uuid::new_v4())
    } else {
        meta.unique_id.clone()
    };

    let tmp = tempfile::NamedTempFile::new_in(&opts.output_dir).map_err(|e| {
        EpubError::CreateFile {
            path: dest.clone(),
            source: e,
        }
    })?;
    {
        let mut zip = ZipWriter::new(tmp.as_file());
        let options_stored = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o644);
        let options_deflate = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);

        // 1. Mimetype first, uncompressed
        zip.start_file("mimetype", options_stored)?;
        zip.write_all(MIMETYPE)?;

        zip.start_file("META-INF/container.xml", options_deflate)?;
        zip.write_all(CONTAINER_XML)?;

        zip.start_file(format!("{}toc.ncx", OEBPS_PREFIX), options_deflate)?;
        zip.write_all(ncx_document(&entries, meta, &unique_id).as_bytes())?;

        if opts.version == EpubVersion::Epub3 {
            zip.start_file(format!("{}nav.xhtml", OEBPS_PREFIX), options_deflate)?;
            zip.write_all(nav_document(&entries, meta).as_bytes())?;
        }

        let opf = opf_document(&entries, &leftovers, meta, &unique_id, opts.version);
        zip.start_file(format!("{}content.opf", OEBPS_PREFIX), options_deflate)?;
        zip.write_all(opf.as_bytes())?;

        for f in &entries {
            zip.start_file(format!("{}{}", OEBPS_PREFIX, f.path), options_deflate)?;
            zip.write_all(&f.contents)?;
        }

        if let Some(archive) = prior.as_mut() {
            for leftover in &leftovers {
                let Some(index) = archive.index_for_name(leftover) else {
                    continue;
                };
                debug!(entry = %leftover, "carrying over");
                zip.raw_copy_file(archive.by_index_raw(index)?)?;
            }
        }
        zip.finish()?;
    }

    tmp.persist(&dest).map_err(|e| EpubError::Persist {
        path: dest.clone(),
        source: e.error,
    })?;
    info!("Wrote {}", dest.display());
    Ok(dest)
}

fn opf_document(
    entries: &[&EpubFile],
    leftovers: &[String],
    meta: &EpubMeta,
    unique_id: &str,
    version: EpubVersion,
) -> String {
    let epub3 = version == EpubVersion::Epub3;
    let scheme = if !epub3 && unique_id.contains("://") {
        r#" opf:scheme="URI""#
    } else {
        ""
    };
    let role = if epub3 { "" } else { r#" opf:role="aut""# };

    let mut metadata = format!(
        r#"    <dc:identifier id="book_identifier"{scheme}>{id}</dc:identifier>
    <dc:title>{title}</dc:title>
    <dc:language>{lang}</dc:language>
    <dc:creator{role}>{author}</dc:creator>
    <meta name="generator" content="{generator}"/>
"#,
        scheme = scheme,
        id = xml_escape(unique_id),
        title = xml_escape(&meta.title),
        lang = xml_escape(&meta.language),
        role = role,
        author = xml_escape(&meta.author),
        generator = GENERATOR,
    );
    if let Some(started) = meta.started {
        if epub3 {
            metadata.push_str(&format!(
                "    <dc:date>{}</dc:date>\n",
                started.format("%Y-%m-%d")
            ));
        } else {
            metadata.push_str(&format!(
                "    <dc:date opf:event=\"creation\">{}</dc:date>\n",
                started.format("%Y-%m-%d")
            ));
        }
    }
    if let Some(updated) = meta.updated {
        if epub3 {
            metadata.push_str(&format!(
                "    <meta property=\"dcterms:modified\">{}</meta>\n",
                updated.format("%Y-%m-%dT%H:%M:%SZ")
            ));
        } else {
            metadata.push_str(&format!(
                "    <dc:date opf:event=\"modification\">{}</dc:date>\n",
                updated.format("%Y-%m-%d")
            ));
        }
    }
    if let Some(cover) = entries.iter().find(|f| f.role == FileRole::CoverImage) {
        metadata.push_str(&format!(
            "    <meta name=\"cover\" content=\"{}\"/>\n",
            xml_escape(&cover.id)
        ));
    }

    let mut manifest = String::from(
        "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\"/>\n",
    );
    if epub3 {
        manifest.push_str(
            "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\"/>\n",
        );
    }
    for f in entries {
        let props = if epub3 && f.role == FileRole::CoverImage {
            r#" properties="cover-image""#
        } else {
            ""
        };
        manifest.push_str(&format!(
            "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"{}/>\n",
            xml_escape(&f.id),
            xml_escape(&f.path),
            xml_escape(&f.media_type),
            props
        ));
    }
    for (i, leftover) in leftovers.iter().enumerate() {
        if let Some(href) = leftover.strip_prefix(OEBPS_PREFIX) {
            manifest.push_str(&format!(
                "    <item id=\"kept_{}\" href=\"{}\" media-type=\"{}\"/>\n",
                i + 1,
                xml_escape(href),
                media_type_for(href)
            ));
        }
    }

    let mut spine = String::new();
    let mut guide = String::new();
    for f in entries.iter().filter(|f| f.is_page()) {
        if f.role == FileRole::CoverPage {
            spine.push_str(&format!(
                "    <itemref idref=\"{}\" linear=\"no\"/>\n",
                xml_escape(&f.id)
            ));
            guide.push_str(&format!(
                "    <reference type=\"cover\" title=\"Cover\" href=\"{}\"/>\n",
                xml_escape(&f.path)
            ));
        } else {
            spine.push_str(&format!("    <itemref idref=\"{}\"/>\n", xml_escape(&f.id)));
        }
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="book_identifier" version="{version}">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
{metadata}  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine toc="ncx">
{spine}  </spine>
  <guide>
{guide}  </guide>
</package>
"#,
        version = if epub3 { "3.0" } else { "2.0" },
        metadata = metadata,
        manifest = manifest,
        spine = spine,
        guide = guide
    )
}

fn ncx_document(entries: &[&EpubFile], meta: &EpubMeta, unique_id: &str) -> String {
    let mut nav_points = String::new();
    let titled = entries.iter().filter(|f| f.is_page()).filter_map(|f| {
        f.title.as_deref().map(|t| (f, t))
    });
    for (i, (f, title)) in titled.enumerate() {
        nav_points.push_str(&format!(
            r#"    <navPoint id="navpoint-{n}" playOrder="{n}" class="h1">
      <navLabel><text>{label}</text></navLabel>
      <content src="{src}"/>
    </navPoint>
"#,
            n = i + 1,
            label = xml_escape(title),
            src = xml_escape(&f.path)
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1" xml:lang="{lang}">
  <head>
    <meta name="dtb:uid" content="{uid}"/>
  </head>
  <docTitle>
    <text>{title}</text>
  </docTitle>
  <docAuthor>
    <text>{author}</text>
  </docAuthor>
  <navMap>
{nav_points}  </navMap>
</ncx>
"#,
        lang = xml_escape(&meta.language),
        uid = xml_escape(unique_id),
        title = xml_escape(&meta.title),
        author = xml_escape(&meta.author),
        nav_points = nav_points
    )
}

fn nav_document(entries: &[&EpubFile], meta: &EpubMeta) -> String {
    let mut nav_links = String::new();
    for f in entries.iter().filter(|f| f.is_page()) {
        if let Some(title) = &f.title {
            nav_links.push_str(&format!(
                "      <li><a href=\"{}\">{}</a></li>\n",
                xml_escape(&f.path),
                xml_escape(title)
            ));
        }
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops" xml:lang="{lang}">
<head>
  <meta charset="UTF-8"/>
  <title>{title}</title>
</head>
<body>
  <nav epub:type="toc">
    <h1>Contents</h1>
    <ol>
{nav_links}    </ol>
  </nav>
</body>
</html>
"#,
        lang = xml_escape(&meta.language),
        title = xml_escape(&meta.title),
        nav_links = nav_links
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn cover_page() -> EpubFile {
        EpubFile::page("cover", "cover.html", Some("Cover".to_string()), "<html/>")
            .with_role(FileRole::CoverPage)
    }

    fn minimal_files() -> Vec<EpubFile> {
        vec![
            cover_page(),
            EpubFile::resource("cover_image", "images/cover.svg", "image/svg+xml", b"<svg/>".to_vec())
                .with_role(FileRole::CoverImage),
            EpubFile::page("ch1", "s/chapter1.html", Some("Chapter 1".to_string()), "<p>one</p>"),
            EpubFile::resource("css", "Styles/base.css", "text/css", b"body{}".to_vec()),
        ]
    }

    fn meta() -> EpubMeta {
        EpubMeta {
            title: "Test Book".to_string(),
            author: "Test Author".to_string(),
            unique_id: "https://example.com/story/1".to_string(),
            ..EpubMeta::default()
        }
    }

    fn read_entry(path: &Path, name: &str) -> Result<String, EpubError> {
        let mut archive = ZipArchive::new(File::open(path)?)?;
        let mut entry = archive.by_name(name)?;
        let mut s = String::new();
        entry.read_to_string(&mut s)?;
        Ok(s)
    }

    #[test]
    fn sanitize_filename_allow_list() {
        assert_eq!(sanitize_filename("A Practical Guide: Book 1?"), "A_Practical_Guide_Book_1");
        assert_eq!(sanitize_filename("x/../(y).epub"), "x..(y).epub");
    }

    #[test]
    fn missing_cover_and_empty_input_are_rejected() -> Result<(), EpubError> {
        let dir = tempfile::tempdir()?;
        let opts = WriteOptions {
            output_dir: dir.path().to_path_buf(),
            ..WriteOptions::default()
        };
        assert!(matches!(
            write_epub("x", &[], &meta(), &opts),
            Err(EpubError::NoEntries)
        ));
        let no_cover = vec![EpubFile::page("a", "a.html", None, "<p/>")];
        assert!(matches!(
            write_epub("x", &no_cover, &meta(), &opts),
            Err(EpubError::MissingCover)
        ));
        assert!(!dir.path().join("x.epub").exists());
        Ok(())
    }

    #[test]
    fn epub2_layout_and_opf() -> Result<(), EpubError> {
        let dir = tempfile::tempdir()?;
        let opts = WriteOptions {
            output_dir: dir.path().to_path_buf(),
            ..WriteOptions::default()
        };
        let path = write_epub("Test Book", &minimal_files(), &meta(), &opts)?;
        assert_eq!(path, dir.path().join("Test_Book.epub"));

        let mut archive = ZipArchive::new(File::open(&path)?)?;
        {
            let first = archive.by_index(0)?;
            assert_eq!(first.name(), "mimetype");
            assert_eq!(first.compression(), zip::CompressionMethod::Stored);
        }
        let names: Vec<String> = archive.file_names().map(String::from).collect();
        assert!(names.contains(&"META-INF/container.xml".to_string()));
        assert!(names.contains(&"OEBPS/toc.ncx".to_string()));
        assert!(!names.contains(&"OEBPS/nav.xhtml".to_string()));
        assert!(names.contains(&"OEBPS/s/chapter1.html".to_string()));

        let mimetype = read_entry(&path, "mimetype")?;
        assert_eq!(mimetype, "application/epub+zip");
        let opf = read_entry(&path, "OEBPS/content.opf")?;
        assert!(opf.contains(r#"version="2.0""#));
        assert!(opf.contains(r#"opf:scheme="URI""#));
        assert!(opf.contains(r#"opf:role="aut""#));
        assert!(opf.contains(r#"<meta name="generator" content="storyleech"/>"#));
        assert!(opf.contains(r#"<meta name="cover" content="cover_image"/>"#));
        assert!(opf.contains(r#"<itemref idref="cover" linear="no"/>"#));
        assert!(opf.contains(r#"<reference type="cover" title="Cover" href="cover.html"/>"#));
        assert!(!opf.contains(r#"<itemref idref="css""#));

        let ncx = read_entry(&path, "OEBPS/toc.ncx")?;
        assert!(ncx.contains("<docAuthor>"));
        assert!(ncx.contains(r#"<content src="s/chapter1.html"/>"#));
        Ok(())
    }

    #[test]
    fn epub3_adds_nav() -> Result<(), EpubError> {
        let dir = tempfile::tempdir()?;
        let opts = WriteOptions {
            output_dir: dir.path().to_path_buf(),
            version: EpubVersion::Epub3,
            merge: true,
        };
        let path = write_epub("book", &minimal_files(), &meta(), &opts)?;
        let nav = read_entry(&path, "OEBPS/nav.xhtml")?;
        assert!(nav.contains(r#"<a href="s/chapter1.html">Chapter 1</a>"#));
        let opf = read_entry(&path, "OEBPS/content.opf")?;
        assert!(opf.contains(r#"version="3.0""#));
        assert!(opf.contains(r#"properties="nav""#));
        assert!(!opf.contains("opf:scheme"));
        Ok(())
    }

    #[test]
    fn duplicate_paths_are_written_once() -> Result<(), EpubError> {
        let dir = tempfile::tempdir()?;
        let opts = WriteOptions {
            output_dir: dir.path().to_path_buf(),
            ..WriteOptions::default()
        };
        let mut files = minimal_files();
        files.push(EpubFile::page("ch1b", "s/chapter1.html", None, "<p>again</p>"));
        let path = write_epub("dup", &files, &meta(), &opts)?;
        let archive = ZipArchive::new(File::open(&path)?)?;
        let count = archive
            .file_names()
            .filter(|n| *n == "OEBPS/s/chapter1.html")
            .count();
        assert_eq!(count, 1);
        assert_eq!(read_entry(&path, "OEBPS/s/chapter1.html")?, "<p>one</p>");
        Ok(())
    }

    #[test]
    fn blank_identifier_is_synthesized() -> Result<(), EpubError> {
        let dir = tempfile::tempdir()?;
        let opts = WriteOptions {
            output_dir: dir.path().to_path_buf(),
            ..WriteOptions::default()
        };
        let m = EpubMeta {
            unique_id: String::new(),
            ..meta()
        };
        let path = write_epub("anon", &minimal_files(), &m, &opts)?;
        let opf = read_entry(&path, "OEBPS/content.opf")?;
        assert!(opf.contains(">storyleech_book_"));
        Ok(())
    }

    #[test]
    fn media_types_by_extension() {
        assert_eq!(media_type_for("a/chapter1.html"), XHTML);
        assert_eq!(media_type_for("images/x.JPG"), "image/jpeg");
        assert_eq!(media_type_for("blob"), "application/octet-stream");
    }
}
