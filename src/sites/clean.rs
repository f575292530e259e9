//! Chapter markup cleanup shared by all extractors.

use super::{join_url, parse_selector, SiteError};
use crate::markup::{self, escape_text, text_of, Action};
use scraper::{ElementRef, Selector};
use std::collections::HashSet;
use url::Url;

const EMAIL_PROTECTION: &str = "/cdn-cgi/l/email-protection#";

/// Decode a Cloudflare-obfuscated address: hex bytes, the first one XORs the rest.
pub fn decode_cfemail(encoded: &str) -> Option<String> {
    let bytes = hex::decode(encoded.trim()).ok()?;
    let (key, rest) = bytes.split_first()?;
    String::from_utf8(rest.iter().map(|b| b ^ key).collect()).ok()
}

/// Rewrites a chapter fragment: drops unwanted elements, resolves links
/// against the page, and undoes common obfuscation.
#[derive(Debug, Clone)]
pub struct Cleaner {
    base: Url,
    strip_colors: bool,
    drop: Vec<Selector>,
    drop_classes: HashSet<String>,
}

impl Cleaner {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            strip_colors: true,
            drop: Vec::new(),
            drop_classes: HashSet::new(),
        }
    }

    /// Remove inline `style` attributes and transparent filler text.
    pub fn strip_colors(mut self, strip: bool) -> Self {
        self.strip_colors = strip;
        self
    }

    /// Remove every element matching `selector`.
    pub fn drop_selector(mut self, selector: &str) -> Result<Self, SiteError> {
        self.drop.push(parse_selector(selector)?);
        Ok(self)
    }

    /// Remove every element carrying `class`.
    pub fn drop_class(mut self, class: impl Into<String>) -> Self {
        self.drop_classes.insert(class.into());
        self
    }

    pub fn clean(&self, html: &str) -> String {
        markup::rewrite(html, |el| self.visit(el))
    }

    fn visit(&self, el: ElementRef<'_>) -> Action {
        let name = el.value().name();
        if matches!(name, "script" | "style" | "noscript") {
            return Action::Drop;
        }
        if self.drop.iter().any(|s| s.matches(&el))
            || el.value().classes().any(|c| self.drop_classes.contains(c))
        {
            return Action::Drop;
        }
        if let Some(encoded) = el.value().attr("data-cfemail") {
            return match decode_cfemail(encoded) {
                Some(address) => Action::Replace(escape_text(&address)),
                None => Action::Keep,
            };
        }
        let style = el.value().attr("style").unwrap_or("");
        if self.strip_colors && is_transparent(style) && text_of(el) == "TAB" {
            return Action::Drop;
        }

        let attrs = el
            .value()
            .attrs()
            .filter(|(k, _)| !k.starts_with("on"))
            .filter(|(k, _)| !(self.strip_colors && *k == "style"))
            .map(|(k, v)| {
                let v = match (name, k) {
                    ("a", "href") => self.link(v),
                    ("img", "src") => join_url(&self.base, v).unwrap_or_else(|| v.to_string()),
                    _ => v.to_string(),
                };
                (k.to_string(), v)
            })
            .collect();
        Action::KeepWith(attrs)
    }

    fn link(&self, href: &str) -> String {
        let href = href.trim();
        if let Some(pos) = href.find(EMAIL_PROTECTION) {
            if let Some(address) = decode_cfemail(&href[pos + EMAIL_PROTECTION.len()..]) {
                return format!("mailto:{}", address);
            }
        }
        if href.starts_with('#') || href.starts_with("mailto:") || href.starts_with("javascript:")
        {
            return href.to_string();
        }
        join_url(&self.base, href).unwrap_or_else(|| href.to_string())
    }
}

fn is_transparent(style: &str) -> bool {
    let compact: String = style
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    compact.contains("color:transparent")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/fiction/1/chapter/2").expect("valid url")
    }

    #[test]
    fn cfemail_decoding() {
        // key 0x42, "a@b" XOR 0x42
        let encoded = format!("42{:02x}{:02x}{:02x}", b'a' ^ 0x42, b'@' ^ 0x42, b'b' ^ 0x42);
        assert_eq!(decode_cfemail(&encoded).as_deref(), Some("a@b"));
        assert_eq!(decode_cfemail("zz"), None);
        assert_eq!(decode_cfemail(""), None);
    }

    #[test]
    fn links_and_images_are_absolutized() {
        let out = Cleaner::new(base()).clean(
            r#"<p><a href="../3">up</a><a href="3">next</a><img src="/i/a.png"></p>"#,
        );
        assert!(out.contains(r#"href="https://example.com/fiction/1/3""#));
        assert!(out.contains(r#"href="https://example.com/fiction/1/chapter/3""#));
        assert!(out.contains(r#"src="https://example.com/i/a.png""#));
        assert!(out.contains("/>"));
    }

    #[test]
    fn anchors_and_mailto_are_untouched() {
        let out = Cleaner::new(base()).clean(r##"<a href="#top">up</a><a href="mailto:x@y">m</a>"##);
        assert!(out.contains(r##"href="#top""##));
        assert!(out.contains(r#"href="mailto:x@y""#));
    }

    #[test]
    fn obfuscated_email_is_restored() {
        let hex = format!("10{:02x}{:02x}", b'h' ^ 0x10, b'i' ^ 0x10);
        let html = format!(
            r#"<p><span class="__cf_email__" data-cfemail="{hex}">[email protected]</span> <a href="/cdn-cgi/l/email-protection#{hex}">mail</a></p>"#
        );
        let out = Cleaner::new(base()).clean(&html);
        assert!(out.contains("<p>hi "), "{}", out);
        assert!(out.contains(r#"href="mailto:hi""#), "{}", out);
    }

    #[test]
    fn strip_colors_removes_styles_and_filler() {
        let html = r#"<p style="color: red">red</p><span style="color:transparent">TAB</span>"#;
        let out = Cleaner::new(base()).clean(html);
        assert_eq!(out, "<p>red</p>");

        let kept = Cleaner::new(base()).strip_colors(false).clean(html);
        assert!(kept.contains(r#"style="color: red""#));
        assert!(kept.contains("TAB"));
    }

    #[test]
    fn drop_rules_and_scripts() -> Result<(), SiteError> {
        let cleaner = Cleaner::new(base())
            .drop_selector(".ad")?
            .drop_class("stolen");
        let out = cleaner.clean(
            r#"<p>a</p><div class="ad">buy</div><p class="x stolen">taken</p><script>x()</script><p>b</p>"#,
        );
        assert_eq!(out, "<p>a</p><p>b</p>");
        assert!(Cleaner::new(base()).drop_selector("p[[").is_err());
        Ok(())
    }
}
