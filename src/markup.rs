//! Markup helpers: tree rewriting with XHTML serialization, plus small tag builders.
//!
//! Chapter fragments pass through [rewrite] so the archive always receives
//! well-formed XHTML regardless of the source page's markup.

use ego_tree::NodeRef;
use scraper::node::Node;
use scraper::{ElementRef, Html};

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// What to do with one element during [rewrite].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Emit the element unchanged and recurse into it.
    Keep,
    /// Emit the element with these attributes instead of its own, then recurse.
    KeepWith(Vec<(String, String)>),
    /// Remove the element and its subtree.
    Drop,
    /// Emit the children without the element itself.
    Unwrap,
    /// Emit this markup in place of the element.
    Replace(String),
}

/// Parse `html` as a fragment, ask `visit` about every element, and serialize the result as XHTML.
pub fn rewrite<F>(html: &str, mut visit: F) -> String
where
    F: FnMut(ElementRef<'_>) -> Action,
{
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len());
    for child in fragment.root_element().children() {
        write_node(child, &mut visit, &mut out);
    }
    out
}

/// Re-serialize a fragment as well-formed XHTML without changing its structure.
pub fn to_xhtml(html: &str) -> String {
    rewrite(html, |_| Action::Keep)
}

/// Serialize an element's children as XHTML.
pub fn inner_xhtml(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    let mut keep = |_: ElementRef<'_>| Action::Keep;
    for child in element.children() {
        write_node(child, &mut keep, &mut out);
    }
    out
}

/// Serialize an element and its subtree as XHTML.
pub fn outer_xhtml(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    let mut keep = |_: ElementRef<'_>| Action::Keep;
    write_node(*element, &mut keep, &mut out);
    out
}

fn write_node<F>(node: NodeRef<'_, Node>, visit: &mut F, out: &mut String)
where
    F: FnMut(ElementRef<'_>) -> Action,
{
    match node.value() {
        Node::Text(text) => out.push_str(&escape_text(text)),
        Node::Element(_) => {
            if let Some(element) = ElementRef::wrap(node) {
                write_element(element, visit, out);
            }
        }
        Node::Comment(_) | Node::Doctype(_) | Node::ProcessingInstruction(_) => {}
        _ => {
            for child in node.children() {
                write_node(child, visit, out);
            }
        }
    }
}

fn write_element<F>(element: ElementRef<'_>, visit: &mut F, out: &mut String)
where
    F: FnMut(ElementRef<'_>) -> Action,
{
    let name = element.value().name();
    let attrs: Vec<(String, String)> = match visit(element) {
        Action::Drop => return,
        Action::Replace(markup) => {
            out.push_str(&markup);
            return;
        }
        Action::Unwrap => {
            for child in element.children() {
                write_node(child, visit, out);
            }
            return;
        }
        Action::Keep => element
            .value()
            .attrs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        Action::KeepWith(attrs) => attrs,
    };

    out.push('<');
    out.push_str(name);
    for (key, value) in &attrs {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }
    if VOID_ELEMENTS.contains(&name) {
        out.push_str("/>");
        return;
    }
    out.push('>');
    // Script bodies are raw text in HTML; they have no place in a chapter.
    if name != "script" {
        for child in element.children() {
            write_node(child, visit, out);
        }
    }
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

pub fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Build `<tag attr="...">inner</tag>`. `inner` is inserted as markup, attribute values are escaped.
pub fn element(tag: &str, attrs: &[(&str, &str)], inner: &str) -> String {
    let mut out = format!("<{}", tag);
    for (key, value) in attrs {
        out.push_str(&format!(" {}=\"{}\"", key, escape_attr(value)));
    }
    out.push('>');
    out.push_str(inner);
    out.push_str(&format!("</{}>", tag));
    out
}

/// Collapsed, trimmed text content of an element.
pub fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
