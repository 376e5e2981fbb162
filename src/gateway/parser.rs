use scraper::Html;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use url::Url;

use crate::utils::html::{count, first_text, meta_content, resolve_link, select_all};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementCounts {
    pub paragraphs: usize,
    pub images: usize,
    pub links: usize,
    pub lists: usize,
    pub tables: usize,
    pub forms: usize,
}

/// Structural data extracted from every fetched page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapingData {
    pub title: String,
    pub meta_description: Option<String>,
    /// Absolute http(s) links, deduplicated in document order
    pub links: Vec<String>,
    /// Distinct links found, before capping
    pub links_count: usize,
    pub headers: BTreeMap<String, usize>,
    pub images_count: usize,
    pub element_counts: ElementCounts,
}

/// Parse the basic structure of `html` fetched from `page_url`
pub fn parse(html: &str, page_url: &Url, max_links: usize) -> ScrapingData {
    let document = Html::parse_document(html);

    let title = first_text(&document, "title").unwrap_or_default();
    let meta_description = meta_content(&document, "name", "description");

    let mut seen = HashSet::new();
    let links: Vec<String> = select_all(&document, "a[href]")
        .iter()
        .filter_map(|anchor| anchor.value().attr("href"))
        .filter_map(|href| resolve_link(page_url, href))
        .map(|link| link.to_string())
        .filter(|link| seen.insert(link.clone()))
        .collect();
    let links_count = links.len();

    let headers = (1..=6)
        .map(|level| {
            let tag = format!("h{}", level);
            let found = count(&document, &tag);
            (tag, found)
        })
        .collect();

    let images_count = count(&document, "img");

    let element_counts = ElementCounts {
        paragraphs: count(&document, "p"),
        images: images_count,
        links: count(&document, "a"),
        lists: count(&document, "ul, ol"),
        tables: count(&document, "table"),
        forms: count(&document, "form"),
    };

    ScrapingData {
        title,
        meta_description,
        links: links.into_iter().take(max_links).collect(),
        links_count,
        headers,
        images_count,
        element_counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head>
        <title>  Example
            Domain </title>
        <meta name="Description" content="An example page">
    </head><body>
        <h1>Main</h1><h2>One</h2><h2>Two</h2>
        <p>First</p><p>Second</p>
        <a href="/about">About</a>
        <a href="/about#team">Team</a>
        <a href="https://other.org/x">Other</a>
        <a href="mailto:hi@example.com">Mail</a>
        <a href="javascript:void(0)">Nothing</a>
        <ul><li>a</li></ul><ol><li>b</li></ol>
        <img src="a.png"><img src="b.png">
        <table></table><form></form>
    </body></html>"#;

    #[test]
    fn test_parse_structure() {
        let base = Url::parse("https://example.com/index.html").unwrap();
        let data = parse(PAGE, &base, 50);

        assert_eq!(data.title, "Example Domain");
        assert_eq!(data.meta_description.as_deref(), Some("An example page"));
        assert_eq!(data.links, vec!["https://example.com/about", "https://other.org/x"]);
        assert_eq!(data.links_count, 2);
        assert_eq!(data.headers["h1"], 1);
        assert_eq!(data.headers["h2"], 2);
        assert_eq!(data.headers["h6"], 0);
        assert_eq!(data.images_count, 2);
        assert_eq!(
            data.element_counts,
            ElementCounts {
                paragraphs: 2,
                images: 2,
                links: 5,
                lists: 2,
                tables: 1,
                forms: 1,
            }
        );
    }

    #[test]
    fn test_links_are_capped() {
        let base = Url::parse("https://example.com/").unwrap();
        let data = parse(PAGE, &base, 1);
        assert_eq!(data.links.len(), 1);
        assert_eq!(data.links_count, 2);
    }

    #[test]
    fn test_empty_page() {
        let base = Url::parse("https://example.com/").unwrap();
        let data = parse("", &base, 50);
        assert_eq!(data.title, "");
        assert!(data.links.is_empty());
        assert_eq!(data.headers.len(), 6);
    }
}
