//! HTML text extraction.
//!
//! Turns a fetched page into the three things the crawler needs: a title,
//! the readable body text, and the outgoing links. Body text keeps only
//! lines with enough words to be prose, which drops most navigation,
//! button labels, and footer crumbs.

use scraper::{ElementRef, Html, Node, Selector};
use url::Url;

/// Elements whose text never counts as page content.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "svg"];

/// What [`extract_page`] pulls out of an HTML document.
#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    pub title: Option<String>,
    pub text: String,
    pub links: Vec<String>,
}

/// Extract title, prose text, and absolute links from an HTML page.
pub fn extract_page(html: &str, page_url: &Url, min_line_words: usize) -> ExtractedPage {
    let doc = Html::parse_document(html);

    ExtractedPage {
        title: extract_title(&doc),
        text: extract_text(&doc, min_line_words),
        links: extract_links(&doc, page_url),
    }
}

fn extract_title(doc: &Html) -> Option<String> {
    for sel in ["title", "h1"] {
        let selector = Selector::parse(sel).ok()?;
        if let Some(el) = doc.select(&selector).next() {
            let text = collapse_whitespace(&el.text().collect::<String>());
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn extract_text(doc: &Html, min_line_words: usize) -> String {
    let root = Selector::parse("body")
        .ok()
        .and_then(|sel| doc.select(&sel).next())
        .unwrap_or_else(|| doc.root_element());

    let mut raw = String::new();
    collect_text(root, &mut raw);

    raw.lines()
        .map(str::trim)
        .filter(|line| line.split_whitespace().count() >= min_line_words)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Depth-first text walk, newline-separating block content.
fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                let name = el.name();
                if SKIPPED_ELEMENTS.contains(&name) {
                    continue;
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    let block = is_block(name);
                    if block {
                        out.push('\n');
                    }
                    collect_text(child_el, out);
                    if block {
                        out.push('\n');
                    }
                }
            }
            _ => {}
        }
    }
}

fn is_block(name: &str) -> bool {
    matches!(
        name,
        "p" | "div"
            | "section"
            | "article"
            | "main"
            | "header"
            | "footer"
            | "nav"
            | "aside"
            | "li"
            | "ul"
            | "ol"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "br"
            | "tr"
            | "td"
            | "th"
            | "table"
            | "pre"
            | "blockquote"
            | "dt"
            | "dd"
            | "figcaption"
    )
}

/// Every `a[href]` resolved against `base`, fragment removed, http(s) only.
pub fn extract_links(doc: &Html, base: &Url) -> Vec<String> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut links = Vec::new();
    for el in doc.select(&selector) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("javascript:")
            || href.starts_with("data:")
        {
            continue;
        }

        if let Ok(mut resolved) = base.join(href) {
            if resolved.scheme() != "http" && resolved.scheme() != "https" {
                continue;
            }
            resolved.set_fragment(None);
            links.push(resolved.to_string());
        }
    }

    links
}

/// Title derived from the host when a page has none.
///
/// `https://www.example.com/docs` → `Example`.
pub fn fallback_title(url: &Url) -> String {
    let Some(host) = url.host_str() else {
        return "Untitled".to_string();
    };
    let host = host.strip_prefix("www.").unwrap_or(host);
    let label = host.split('.').next().unwrap_or(host);

    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Untitled".to_string(),
    }
}

/// Normalize text for a training corpus: collapse whitespace, blank out
/// unusual characters, lowercase.
pub fn clean_text(text: &str) -> String {
    let replaced: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || ".,!?;:()-'\"".contains(c) {
                c
            } else {
                ' '
            }
        })
        .collect();
    collapse_whitespace(&replaced).to_lowercase()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
