//! Link and title extraction for HTML pages
//!
//! Used by page handlers that follow links. Only `<a href>` targets and the
//! canonical link are collected; assets, downloads and non-HTTP schemes are
//! skipped.

use scraper::{Html, Selector};
use url::Url;

/// What a handler usually needs from a fetched page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    /// Trimmed `<title>` text, if any
    pub title: Option<String>,

    /// Absolute http(s) links, in document order, without duplicates
    pub links: Vec<String>,
}

/// Parses `html` and resolves its links against `base_url`
///
/// # Arguments
///
/// * `html` - The page body
/// * `base_url` - URL the page was fetched from, used for relative links
///
/// # Returns
///
/// The page title and its deduplicated absolute links, fragments removed
///
/// ```
/// use sumi_flow::crawler::parse_html;
/// use url::Url;
///
/// let html = r#"<html><head><title>Test</title></head><body><a href="/page">Link</a></body></html>"#;
/// let base_url = Url::parse("https://example.com/").unwrap();
/// let parsed = parse_html(html, &base_url);
/// assert_eq!(parsed.title.as_deref(), Some("Test"));
/// assert_eq!(parsed.links, vec!["https://example.com/page".to_string()]);
/// ```
pub fn parse_html(html: &str, base_url: &Url) -> ParsedPage {
    let document = Html::parse_document(html);

    ParsedPage {
        title: extract_title(&document),
        links: extract_links(&document, base_url),
    }
}

fn extract_title(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;

    document
        .select(&selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn extract_links(document: &Html, base_url: &Url) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    let mut push = |href: &str| {
        if let Some(url) = resolve_link(href, base_url) {
            if !links.contains(&url) {
                links.push(url);
            }
        }
    };

    if let Ok(selector) = Selector::parse("a[href]") {
        for element in document.select(&selector) {
            if element.value().attr("download").is_some() {
                continue;
            }
            if let Some(href) = element.value().attr("href") {
                push(href);
            }
        }
    }

    if let Ok(selector) = Selector::parse("link[rel='canonical'][href]") {
        for element in document.select(&selector) {
            if let Some(href) = element.value().attr("href") {
                push(href);
            }
        }
    }

    links
}

/// Absolute form of `href`, or None when it should not be followed
fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    const SKIPPED: [&str; 4] = ["javascript:", "mailto:", "tel:", "data:"];
    let lower = href.to_ascii_lowercase();
    if SKIPPED.iter().any(|scheme| lower.starts_with(scheme)) {
        return None;
    }

    let mut absolute = base_url.join(href).ok()?;
    if absolute.scheme() != "http" && absolute.scheme() != "https" {
        return None;
    }
    absolute.set_fragment(None);
    Some(absolute.to_string())
}
