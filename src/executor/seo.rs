use scraper::Html;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

use crate::utils::html::{count, meta_content, select_all, text_of};

#[derive(Debug, Clone, Serialize)]
pub struct TextCheck {
    pub exists: bool,
    pub text: String,
    pub length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeadingCheck {
    pub h1_count: usize,
    /// First three H1 texts, truncated
    pub h1_texts: Vec<String>,
    pub hierarchy: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AltCheck {
    pub total_images: usize,
    pub images_without_alt: usize,
    pub alt_coverage_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkCheck {
    pub total_links: usize,
    pub internal_links: usize,
    pub external_links: usize,
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenGraphCheck {
    pub exists: bool,
    pub tags: BTreeMap<String, String>,
    pub missing_required: Vec<String>,
    pub completeness_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StructuredDataCheck {
    pub has_json_ld: bool,
    pub json_ld_count: usize,
    pub types: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanonicalCheck {
    pub exists: bool,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total_issues: usize,
    pub total_warnings: usize,
    pub total_good_practices: usize,
}

/// On-page SEO audit with a 0-100 score
#[derive(Debug, Clone, Serialize)]
pub struct SeoReport {
    pub score: u32,
    pub grade: String,
    pub title: TextCheck,
    pub meta_description: TextCheck,
    pub headers: HeadingCheck,
    pub images: AltCheck,
    pub links: LinkCheck,
    pub open_graph: OpenGraphCheck,
    pub structured_data: StructuredDataCheck,
    pub canonical: CanonicalCheck,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub good_practices: Vec<String>,
    pub summary: Summary,
}

const REQUIRED_OG_TAGS: [&str; 4] = ["title", "description", "image", "url"];

/// Running score plus the findings that moved it
struct Audit {
    score: i32,
    issues: Vec<String>,
    warnings: Vec<String>,
    good_practices: Vec<String>,
}

impl Audit {
    fn new() -> Self {
        Self {
            score: 100,
            issues: Vec::new(),
            warnings: Vec::new(),
            good_practices: Vec::new(),
        }
    }

    fn issue(&mut self, penalty: i32, message: String) {
        self.score -= penalty;
        self.issues.push(message);
    }

    fn warning(&mut self, penalty: i32, message: String) {
        self.score -= penalty;
        self.warnings.push(message);
    }

    fn good(&mut self, message: String) {
        self.good_practices.push(message);
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn grade(score: u32) -> &'static str {
    match score {
        90..=u32::MAX => "A",
        75..=89 => "B",
        60..=74 => "C",
        45..=59 => "D",
        _ => "F",
    }
}

/// Audit `html` as served from `url`
pub fn analyze(html: &str, url: &str) -> SeoReport {
    let document = Html::parse_document(html);
    let mut audit = Audit::new();

    let title = check_title(&document, &mut audit);
    let meta_description = check_description(&document, &mut audit);
    let headers = check_headings(&document, &mut audit);
    let images = check_alt_text(&document, &mut audit);
    let links = check_links(&document, url, &mut audit);
    let open_graph = check_open_graph(&document, &mut audit);
    let structured_data = check_structured_data(&document, &mut audit);
    let canonical = check_canonical(&document, &mut audit);

    let score = audit.score.max(0) as u32;
    let summary = Summary {
        total_issues: audit.issues.len(),
        total_warnings: audit.warnings.len(),
        total_good_practices: audit.good_practices.len(),
    };

    SeoReport {
        score,
        grade: grade(score).to_string(),
        title,
        meta_description,
        headers,
        images,
        links,
        open_graph,
        structured_data,
        canonical,
        issues: audit.issues,
        warnings: audit.warnings,
        good_practices: audit.good_practices,
        summary,
    }
}

fn check_title(document: &Html, audit: &mut Audit) -> TextCheck {
    let Some(title) = select_all(document, "title").into_iter().next() else {
        audit.issue(20, "Missing <title> tag".to_string());
        return TextCheck {
            exists: false,
            text: String::new(),
            length: 0,
        };
    };

    let text = text_of(&title);
    let length = text.chars().count();

    match length {
        0 => audit.issue(20, "<title> is empty".to_string()),
        1..=29 => audit.warning(10, format!("Title too short ({} chars), aim for 50-60", length)),
        30..=60 => audit.good(format!("Title length is good ({} chars)", length)),
        _ => audit.warning(5, format!("Title too long ({} chars), aim for 50-60", length)),
    }

    TextCheck {
        exists: true,
        text,
        length,
    }
}

fn check_description(document: &Html, audit: &mut Audit) -> TextCheck {
    let description = meta_content(document, "name", "description").filter(|d| !d.is_empty());

    let Some(text) = description else {
        audit.issue(15, "Missing meta description".to_string());
        return TextCheck {
            exists: false,
            text: String::new(),
            length: 0,
        };
    };

    let length = text.chars().count();
    match length {
        0..=119 => audit.warning(
            5,
            format!("Meta description short ({} chars), aim for 150-160", length),
        ),
        120..=160 => audit.good(format!("Meta description length is good ({} chars)", length)),
        _ => audit.warning(
            3,
            format!("Meta description long ({} chars), it will be truncated", length),
        ),
    }

    TextCheck {
        exists: true,
        text,
        length,
    }
}

fn check_headings(document: &Html, audit: &mut Audit) -> HeadingCheck {
    let h1s = select_all(document, "h1");
    let hierarchy: BTreeMap<String, usize> = (1..=6)
        .map(|level| (format!("h{}", level), count(document, &format!("h{}", level))))
        .collect();

    match h1s.len() {
        0 => audit.issue(15, "No <h1> tag".to_string()),
        1 => audit.good("Single <h1> defined".to_string()),
        n => audit.warning(10, format!("Multiple <h1> tags ({}), use one", n)),
    }

    let deeper = (3..=6).any(|level| hierarchy[&format!("h{}", level)] > 0);
    if hierarchy["h2"] == 0 && deeper {
        audit.warning(0, "Heading hierarchy skips <h2>".to_string());
    }

    HeadingCheck {
        h1_count: h1s.len(),
        h1_texts: h1s
            .iter()
            .take(3)
            .map(|h1| text_of(h1).chars().take(100).collect())
            .collect(),
        hierarchy,
    }
}

fn check_alt_text(document: &Html, audit: &mut Audit) -> AltCheck {
    let images = select_all(document, "img");
    let missing = images
        .iter()
        .filter(|img| img.value().attr("alt").map_or(true, |alt| alt.trim().is_empty()))
        .count();
    let total = images.len();

    if missing > 0 {
        let penalty = (missing as i32 * 2).min(20);
        if missing <= 3 {
            audit.warning(penalty, format!("{} image(s) without alt text", missing));
        } else {
            audit.issue(penalty, format!("{} images without alt text", missing));
        }
    } else if total > 0 {
        audit.good(format!("All {} images have alt text", total));
    }

    AltCheck {
        total_images: total,
        images_without_alt: missing,
        alt_coverage_percent: if total > 0 {
            round2((total - missing) as f64 / total as f64 * 100.0)
        } else {
            100.0
        },
    }
}

fn check_links(document: &Html, url: &str, audit: &mut Audit) -> LinkCheck {
    let base_host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));

    let anchors = select_all(document, "a[href]");
    let mut internal = 0;
    let mut external = 0;

    for anchor in &anchors {
        let href = anchor.value().attr("href").unwrap_or("").trim();
        let lowered = href.to_ascii_lowercase();
        if href.starts_with('#')
            || ["javascript:", "mailto:", "tel:"]
                .iter()
                .any(|scheme| lowered.starts_with(scheme))
        {
            continue;
        }

        if lowered.starts_with("http") {
            let host = Url::parse(href).ok().and_then(|u| u.host_str().map(str::to_string));
            if host.is_some() && host == base_host {
                internal += 1;
            } else {
                external += 1;
            }
        } else {
            internal += 1;
        }
    }

    let total = anchors.len();
    if total == 0 {
        audit.warning(0, "No links found on the page".to_string());
    } else if internal == 0 {
        audit.warning(0, "No internal links".to_string());
    } else {
        audit.good(format!("Links: {} internal, {} external", internal, external));
    }

    LinkCheck {
        total_links: total,
        internal_links: internal,
        external_links: external,
        ratio: if total > 0 {
            round2(internal as f64 / total as f64)
        } else {
            0.0
        },
    }
}

fn check_open_graph(document: &Html, audit: &mut Audit) -> OpenGraphCheck {
    let tags: BTreeMap<String, String> = select_all(document, "meta[property]")
        .into_iter()
        .filter_map(|meta| {
            let property = meta.value().attr("property")?;
            let key = property.strip_prefix("og:")?;
            Some((
                key.to_string(),
                meta.value().attr("content").unwrap_or("").to_string(),
            ))
        })
        .collect();

    let missing: Vec<String> = REQUIRED_OG_TAGS
        .iter()
        .filter(|tag| !tags.contains_key(**tag))
        .map(|tag| tag.to_string())
        .collect();

    if tags.is_empty() {
        audit.warning(0, "No Open Graph tags".to_string());
    } else if !missing.is_empty() {
        audit.warning(0, format!("Missing Open Graph tags: {}", missing.join(", ")));
    } else {
        audit.good("Open Graph tags complete".to_string());
    }

    let present = REQUIRED_OG_TAGS.len() - missing.len();
    OpenGraphCheck {
        exists: !tags.is_empty(),
        completeness_percent: round2(present as f64 / REQUIRED_OG_TAGS.len() as f64 * 100.0),
        tags,
        missing_required: missing,
    }
}

fn check_structured_data(document: &Html, audit: &mut Audit) -> StructuredDataCheck {
    let scripts = select_all(document, r#"script[type="application/ld+json"]"#);

    let mut types = Vec::new();
    for script in &scripts {
        let body: String = script.text().collect();
        // Unparseable blocks still count as present
        let Ok(data) = serde_json::from_str::<Value>(&body) else {
            continue;
        };

        let items = match data {
            Value::Array(items) => items,
            other => vec![other],
        };
        for item in items {
            if let Some(kind) = item.get("@type").and_then(Value::as_str) {
                types.push(kind.to_string());
            }
        }
    }

    if scripts.is_empty() {
        audit.warning(0, "No structured data (JSON-LD)".to_string());
    } else {
        audit.good(format!("Structured data present ({} blocks)", scripts.len()));
    }

    StructuredDataCheck {
        has_json_ld: !scripts.is_empty(),
        json_ld_count: scripts.len(),
        types,
    }
}

fn check_canonical(document: &Html, audit: &mut Audit) -> CanonicalCheck {
    let canonical = select_all(document, "link[rel]").into_iter().find(|link| {
        link.value()
            .attr("rel")
            .map_or(false, |rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("canonical")))
    });

    match &canonical {
        Some(_) => audit.good("Canonical link present".to_string()),
        None => audit.warning(0, "Missing canonical link".to_string()),
    }

    CanonicalCheck {
        exists: canonical.is_some(),
        url: canonical.and_then(|link| link.value().attr("href").map(str::to_string)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_PAGE: &str = r#"<html><head>
        <title>A descriptive page title that is long enough</title>
        <meta name="description" content="This description is written to land squarely inside the recommended window for search snippets, neither too short nor too long.">
        <meta property="og:title" content="t"><meta property="og:description" content="d">
        <meta property="og:image" content="i"><meta property="og:url" content="u">
        <link rel="canonical" href="https://example.com/">
        <script type="application/ld+json">{"@type": "Organization"}</script>
    </head><body>
        <h1>Main</h1><h2>Sub</h2>
        <img src="a.png" alt="A">
        <a href="/about">About</a><a href="https://example.com/x">X</a><a href="https://other.org/">O</a>
    </body></html>"#;

    #[test]
    fn test_well_formed_page_scores_high() {
        let report = analyze(GOOD_PAGE, "https://example.com/");

        assert_eq!(report.score, 100);
        assert_eq!(report.grade, "A");
        assert!(report.issues.is_empty());
        assert_eq!(report.links.internal_links, 2);
        assert_eq!(report.links.external_links, 1);
        assert_eq!(report.structured_data.types, vec!["Organization".to_string()]);
        assert_eq!(report.canonical.url.as_deref(), Some("https://example.com/"));
        assert_eq!(report.open_graph.completeness_percent, 100.0);
    }

    #[test]
    fn test_empty_page_collects_issues() {
        let report = analyze("<html><body><h3>Deep</h3><img src=x></body></html>", "https://example.com/");

        // -20 title, -15 description, -15 h1, -2 alt
        assert_eq!(report.score, 48);
        assert_eq!(report.grade, "D");
        assert_eq!(report.issues.len(), 3);
        assert!(report.warnings.iter().any(|w| w.contains("<h2>")));
        assert_eq!(report.images.alt_coverage_percent, 0.0);
        assert_eq!(report.summary.total_issues, 3);
    }

    #[test]
    fn test_grades() {
        assert_eq!(grade(95), "A");
        assert_eq!(grade(75), "B");
        assert_eq!(grade(60), "C");
        assert_eq!(grade(45), "D");
        assert_eq!(grade(0), "F");
    }
}
