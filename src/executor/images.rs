use scraper::Html;
use serde::Serialize;
use std::collections::HashSet;
use url::Url;

use crate::utils::html::{resolve_link, select_all};

#[derive(Debug, Clone, Serialize)]
pub struct ImageEntry {
    pub url: String,
    pub alt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub loading: Option<String>,
    /// Lowercase file extension taken from the path, when there is one
    pub format: Option<String>,
}

/// `<img>` inventory of a page
#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub total_found: usize,
    pub total_listed: usize,
    pub images: Vec<ImageEntry>,
    pub missing_alt: usize,
    pub lazy_loaded: usize,
}

fn dimension(value: Option<&str>) -> Option<u32> {
    value?.trim().trim_end_matches("px").parse().ok()
}

fn format_of(url: &Url) -> Option<String> {
    let file = url.path_segments()?.last()?;
    let (_, extension) = file.rsplit_once('.')?;
    if extension.is_empty() || extension.len() > 5 {
        return None;
    }
    Some(extension.to_ascii_lowercase())
}

/// List the distinct images of `html` as absolute URLs, keeping at most
/// `max_images` entries
pub fn inventory(html: &str, page_url: &str, max_images: usize) -> ImageReport {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();

    let mut seen = HashSet::new();
    let mut images = Vec::new();
    let mut missing_alt = 0;
    let mut lazy_loaded = 0;

    let tags = select_all(&document, "img");
    for img in &tags {
        let element = img.value();

        let source = element
            .attr("src")
            .or_else(|| element.attr("data-src"))
            .unwrap_or("");
        let resolved = match &base {
            Some(base) => resolve_link(base, source),
            None => Url::parse(source).ok(),
        };
        let Some(resolved) = resolved else {
            continue;
        };

        if !seen.insert(resolved.to_string()) {
            continue;
        }

        let alt = element
            .attr("alt")
            .map(str::trim)
            .filter(|alt| !alt.is_empty())
            .map(str::to_string);
        if alt.is_none() {
            missing_alt += 1;
        }

        let loading = element.attr("loading").map(str::to_ascii_lowercase);
        if loading.as_deref() == Some("lazy") {
            lazy_loaded += 1;
        }

        images.push(ImageEntry {
            format: format_of(&resolved),
            url: resolved.to_string(),
            alt,
            width: dimension(element.attr("width")),
            height: dimension(element.attr("height")),
            loading,
        });
    }

    let total_found = images.len();
    images.truncate(max_images);

    ImageReport {
        total_found,
        total_listed: images.len(),
        images,
        missing_alt,
        lazy_loaded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_resolves_and_dedupes() {
        let html = r#"<body>
            <img src="/img/logo.PNG" alt="Logo" width="120" height="40px">
            <img src="https://cdn.example.com/hero.jpg" loading="lazy">
            <img src="/img/logo.PNG" alt="Logo again">
            <img data-src="photos/cat.webp" alt="">
            <img src="data:image/gif;base64,R0lGOD">
        </body>"#;

        let report = inventory(html, "https://example.com/blog/", 10);

        assert_eq!(report.total_found, 3);
        assert_eq!(report.images[0].url, "https://example.com/img/logo.PNG");
        assert_eq!(report.images[0].format.as_deref(), Some("png"));
        assert_eq!(report.images[0].width, Some(120));
        assert_eq!(report.images[0].height, Some(40));
        assert_eq!(report.images[2].url, "https://example.com/blog/photos/cat.webp");
        assert_eq!(report.missing_alt, 2);
        assert_eq!(report.lazy_loaded, 1);
    }

    #[test]
    fn test_inventory_is_capped() {
        let html: String = (0..30).map(|i| format!("<img src=\"/{}.gif\">", i)).collect();
        let report = inventory(&html, "https://example.com/", 20);

        assert_eq!(report.total_found, 30);
        assert_eq!(report.total_listed, 20);
        assert_eq!(report.images.len(), 20);
    }
}
