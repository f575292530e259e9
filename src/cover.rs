//! Cover and image helpers: fetch with content sniffing, or draw a simple SVG cover.
//!
//! No transcoding happens here. Whatever bytes the server sent go into the book
//! when they look like an image; anything else is replaced by a generated SVG.

use crate::fetch::Session;
use crate::markup::escape_text;
use crate::model::Story;
use serde::Deserialize;
use tracing::{info, warn};

const COVER_MAX_BYTES: usize = 10 * 1024 * 1024;
const PLACEHOLDER_MESSAGE: &str = "There was a problem downloading this image.";

/// Appearance of generated covers, and an optional cover URL that beats the story's.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoverOptions {
    pub fontname: String,
    pub fontsize: u32,
    pub width: u32,
    pub height: u32,
    pub wrapat: usize,
    pub bgcolor: [u8; 3],
    pub textcolor: [u8; 3],
    pub cover_url: Option<String>,
}

impl Default for CoverOptions {
    fn default() -> Self {
        Self {
            fontname: "Helvetica".to_string(),
            fontsize: 40,
            width: 600,
            height: 800,
            wrapat: 30,
            bgcolor: [120, 20, 20],
            textcolor: [255, 255, 255],
            cover_url: None,
        }
    }
}

/// Image bytes ready for the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverImage {
    pub bytes: Vec<u8>,
    pub extension: &'static str,
    pub media_type: &'static str,
}

/// File extension and media type from magic bytes.
pub fn sniff_image(bytes: &[u8]) -> Option<(&'static str, &'static str)> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some(("png", "image/png"));
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(("jpg", "image/jpeg"));
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some(("gif", "image/gif"));
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(("webp", "image/webp"));
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_ascii_lowercase();
    let head = head.trim_start_matches('\u{feff}').trim_start();
    if head.starts_with("<svg") || (head.starts_with("<?xml") && head.contains("<svg")) {
        return Some(("svg", "image/svg+xml"));
    }
    None
}

/// Greedy word wrap. Words longer than `width` are split.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut line = String::new();
    for word in text.split_whitespace() {
        let chars: Vec<char> = word.chars().collect();
        for piece in chars.chunks(width) {
            let piece: String = piece.iter().collect();
            let needed = if line.is_empty() {
                piece.chars().count()
            } else {
                line.chars().count() + 1 + piece.chars().count()
            };
            if needed > width && !line.is_empty() {
                lines.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(&piece);
        }
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

fn rgb(c: [u8; 3]) -> String {
    format!("#{:02x}{:02x}{:02x}", c[0], c[1], c[2])
}

fn text_block(out: &mut String, lines: &[String], x: u32, top: u32, size: u32, opts: &CoverOptions) -> u32 {
    let line_height = size.saturating_mul(6) / 5;
    for (i, line) in lines.iter().enumerate() {
        let row = u32::try_from(i).unwrap_or(u32::MAX);
        let y = top
            .saturating_add(size)
            .saturating_add(line_height.saturating_mul(row));
        out.push_str(&format!(
            "  <text x=\"{}\" y=\"{}\" font-family=\"{}\" font-size=\"{}\" fill=\"{}\" stroke=\"#000000\" stroke-width=\"2\" paint-order=\"stroke\" text-anchor=\"middle\">{}</text>\n",
            x,
            y,
            escape_text(&opts.fontname),
            size,
            rgb(opts.textcolor),
            escape_text(line)
        ));
    }
    line_height.saturating_mul(u32::try_from(lines.len()).unwrap_or(u32::MAX))
}

/// Deterministic SVG cover: wrapped title near the top, author below it.
pub fn generate_cover(title: &str, author: &str, opts: &CoverOptions) -> CoverImage {
    let x = opts.width / 2;
    let mut svg = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\">\n  <rect width=\"100%\" height=\"100%\" fill=\"{bg}\"/>\n",
        w = opts.width,
        h = opts.height,
        bg = rgb(opts.bgcolor)
    );
    let title_height = text_block(&mut svg, &wrap(title, opts.wrapat), x, 100, opts.fontsize, opts);
    text_block(
        &mut svg,
        &wrap(author, opts.wrapat),
        x,
        title_height.saturating_add(170),
        opts.fontsize.saturating_sub(2).max(1),
        opts,
    );
    svg.push_str("</svg>\n");
    CoverImage {
        bytes: svg.into_bytes(),
        extension: "svg",
        media_type: "image/svg+xml",
    }
}

/// Stand-in for an image that could not be fetched.
pub fn placeholder_image() -> CoverImage {
    let opts = CoverOptions {
        height: 300,
        bgcolor: [0, 0, 0],
        ..CoverOptions::default()
    };
    generate_cover(PLACEHOLDER_MESSAGE, "", &opts)
}

fn try_fetch(session: &mut Session, url: &str, max_bytes: usize) -> Result<CoverImage, String> {
    let page = session.get(url).map_err(|e| e.to_string())?;
    if page.body.len() > max_bytes {
        return Err(format!("{} bytes exceeds the {} byte limit", page.body.len(), max_bytes));
    }
    let (extension, media_type) =
        sniff_image(&page.body).ok_or_else(|| "response is not a recognized image".to_string())?;
    Ok(CoverImage {
        bytes: page.body,
        extension,
        media_type,
    })
}

/// Fetch an image through the session. Any failure yields [placeholder_image].
pub fn fetch_image(session: &mut Session, url: &str, max_bytes: usize) -> CoverImage {
    match try_fetch(session, url, max_bytes) {
        Ok(image) => image,
        Err(reason) => {
            warn!("Image {} unavailable ({}); using a placeholder", url, reason);
            placeholder_image()
        }
    }
}

/// The story's cover: the configured or story cover URL when it fetches cleanly, else a generated one.
pub fn make_cover(session: &mut Session, story: &Story, opts: &CoverOptions) -> CoverImage {
    let url = opts.cover_url.as_deref().or(story.cover_url.as_deref());
    if let Some(url) = url {
        info!("Downloading cover from {}", url);
        match try_fetch(session, url, COVER_MAX_BYTES) {
            Ok(image) => return image,
            Err(reason) => info!("Encountered an error downloading cover: {}", reason),
        }
    }
    generate_cover(&story.title, &story.author, opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_common_formats() {
        assert_eq!(sniff_image(b"\x89PNG\r\n\x1a\n...."), Some(("png", "image/png")));
        assert_eq!(sniff_image(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(("jpg", "image/jpeg")));
        assert_eq!(sniff_image(b"GIF89a...."), Some(("gif", "image/gif")));
        assert_eq!(sniff_image(b"RIFF\0\0\0\0WEBPVP8 "), Some(("webp", "image/webp")));
        assert_eq!(
            sniff_image(b"<?xml version=\"1.0\"?><svg xmlns=\"http://www.w3.org/2000/svg\"/>"),
            Some(("svg", "image/svg+xml"))
        );
        assert_eq!(sniff_image(b"<html><body>404</body></html>"), None);
        assert_eq!(sniff_image(b""), None);
    }

    #[test]
    fn wrapping_is_greedy_and_splits_long_words() {
        assert_eq!(
            wrap("Test of a Title which is quite long and will require multiple lines", 30),
            vec![
                "Test of a Title which is quite",
                "long and will require multiple",
                "lines"
            ]
        );
        assert_eq!(wrap("abcdefgh", 3), vec!["abc", "def", "gh"]);
        assert!(wrap("   ", 10).is_empty());
    }

    #[test]
    fn generated_cover_is_deterministic_svg() {
        let opts = CoverOptions::default();
        let a = generate_cover("A <Title>", "Some Dude", &opts);
        let b = generate_cover("A <Title>", "Some Dude", &opts);
        assert_eq!(a, b);
        assert_eq!(a.media_type, "image/svg+xml");
        let svg = String::from_utf8_lossy(&a.bytes);
        assert!(svg.contains("A &lt;Title&gt;"));
        assert!(svg.contains("fill=\"#781414\""));
        assert!(svg.contains("width=\"600\" height=\"800\""));
        assert_eq!(sniff_image(&a.bytes), Some(("svg", "image/svg+xml")));
    }

    #[test]
    fn cover_options_from_partial_toml() -> Result<(), toml::de::Error> {
        let opts: CoverOptions = toml::from_str("fontsize = 32\nbgcolor = [0, 0, 0]")?;
        assert_eq!(opts.fontsize, 32);
        assert_eq!(opts.bgcolor, [0, 0, 0]);
        assert_eq!(opts.width, 600);
        assert_eq!(opts.wrapat, 30);
        Ok(())
    }

    #[test]
    fn huge_font_size_saturates() {
        let opts = CoverOptions {
            fontsize: u32::MAX,
            wrapat: 1,
            ..CoverOptions::default()
        };
        let cover = generate_cover("many short words", "an author", &opts);
        let svg = String::from_utf8_lossy(&cover.bytes);
        assert!(svg.contains(&format!("y=\"{}\"", u32::MAX)));
        assert!(svg.ends_with("</svg>\n"));
    }

    #[test]
    fn placeholder_is_a_valid_image() {
        let p = placeholder_image();
        assert_eq!(sniff_image(&p.bytes), Some(("svg", "image/svg+xml")));
        assert!(String::from_utf8_lossy(&p.bytes).contains("height=\"300\""));
    }
}
