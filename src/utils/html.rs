use scraper::{ElementRef, Html, Selector};
use tracing::warn;
use url::Url;

/// Compile a CSS selector, logging instead of failing on a bad one
pub fn selector(css: &str) -> Option<Selector> {
    match Selector::parse(css) {
        Ok(selector) => Some(selector),
        Err(e) => {
            warn!("Invalid selector '{}': {}", css, e);
            None
        }
    }
}

/// Every element matching `css`, in document order
pub fn select_all<'a>(document: &'a Html, css: &str) -> Vec<ElementRef<'a>> {
    match selector(css) {
        Some(selector) => document.select(&selector).collect(),
        None => Vec::new(),
    }
}

pub fn count(document: &Html, css: &str) -> usize {
    match selector(css) {
        Some(selector) => document.select(&selector).count(),
        None => 0,
    }
}

/// Text of an element with runs of whitespace collapsed
pub fn text_of(element: &ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapsed text of the first element matching `css`
pub fn first_text(document: &Html, css: &str) -> Option<String> {
    let selector = selector(css)?;
    document.select(&selector).next().map(|element| text_of(&element))
}

/// `content` of the first `<meta>` whose `attr` equals `value` (case-insensitive)
pub fn meta_content(document: &Html, attr: &str, value: &str) -> Option<String> {
    select_all(document, "meta")
        .into_iter()
        .find(|meta| {
            meta.value()
                .attr(attr)
                .map_or(false, |found| found.eq_ignore_ascii_case(value))
        })
        .and_then(|meta| meta.value().attr("content"))
        .map(|content| content.trim().to_string())
}

/// Resolve an `href`/`src` against the page URL.
///
/// Only http(s) targets survive; fragments are dropped so that anchors on
/// the same page collapse to one URL.
pub fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lowered = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lowered.starts_with(scheme))
    {
        return None;
    }

    let mut resolved = base.join(href).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);

    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><head>
            <title>  Hello
                World </title>
            <meta name="Description" content=" A page ">
        </head><body>
            <a href="/a">A</a><a href="b#frag">B</a>
        </body></html>
    "#;

    #[test]
    fn test_text_helpers() {
        let document = Html::parse_document(PAGE);
        assert_eq!(first_text(&document, "title").as_deref(), Some("Hello World"));
        assert_eq!(meta_content(&document, "name", "description").as_deref(), Some("A page"));
        assert_eq!(count(&document, "a"), 2);
        assert_eq!(count(&document, "a[[["), 0);
    }

    #[test]
    fn test_resolve_link() {
        let base = Url::parse("https://example.com/dir/page").unwrap();

        assert_eq!(
            resolve_link(&base, "/a").map(String::from),
            Some("https://example.com/a".to_string())
        );
        assert_eq!(
            resolve_link(&base, "b#frag").map(String::from),
            Some("https://example.com/dir/b".to_string())
        );
        assert_eq!(resolve_link(&base, "#top"), None);
        assert_eq!(resolve_link(&base, "mailto:x@example.com"), None);
        assert_eq!(resolve_link(&base, "JavaScript:void(0)"), None);
        assert_eq!(resolve_link(&base, "ftp://example.com/file"), None);
    }
}
