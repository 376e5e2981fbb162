use regex::Regex;
use scraper::Html;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;
use tracing::warn;

use crate::utils::html::meta_content;

/// Technologies found on a page, grouped by category
#[derive(Debug, Clone, Default, Serialize)]
pub struct TechnologyReport {
    pub frameworks: Vec<String>,
    pub cms: Vec<String>,
    pub libraries: Vec<String>,
    pub analytics: Vec<String>,
    pub servers: Vec<String>,
    /// generator / application-name / theme meta tags
    pub meta: BTreeMap<String, String>,
    pub summary: TechnologySummary,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TechnologySummary {
    pub total_technologies: usize,
    pub categories: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Frameworks,
    Cms,
    Libraries,
    Analytics,
}

/// Markup signatures, matched case-insensitively against the raw HTML
const SIGNATURES: &[(Category, &str, &[&str])] = &[
    (Category::Frameworks, "React", &[r"react(\.min)?\.js", r"react-dom", r"data-reactroot", r"__react"]),
    (Category::Frameworks, "Vue.js", &[r"vue(\.min)?\.js", r"data-v-[0-9a-f]", r"__vue"]),
    (Category::Frameworks, "Angular", &[r"angular(\.min)?\.js", r"ng-app", r"ng-controller", r"ng-version"]),
    (Category::Frameworks, "Next.js", &[r"/_next/", r"__next_data__"]),
    (Category::Frameworks, "Nuxt.js", &[r"/_nuxt/", r"__nuxt__"]),
    (Category::Frameworks, "Svelte", &[r"svelte(\.min)?\.js", r#"class="[^"]*svelte-"#]),
    (Category::Frameworks, "Ember.js", &[r"ember(\.min)?\.js", r"ember-application"]),
    (Category::Cms, "WordPress", &[r"wp-content/", r"wp-includes/", r"/wp-json/"]),
    (Category::Cms, "Drupal", &[r"drupal\.settings", r"/sites/default/files"]),
    (Category::Cms, "Joomla", &[r"/components/com_", r"option=com_"]),
    (Category::Cms, "Shopify", &[r"cdn\.shopify\.com", r"myshopify\.com"]),
    (Category::Cms, "Wix", &[r"static\.wixstatic\.com", r"parastorage\.com"]),
    (Category::Cms, "Squarespace", &[r"static1\.squarespace\.com"]),
    (Category::Cms, "Magento", &[r"mage/cookies", r"/static/frontend/magento"]),
    (Category::Libraries, "jQuery", &[r"jquery(-[0-9.]+)?(\.min)?\.js"]),
    (Category::Libraries, "Bootstrap", &[r"bootstrap(\.min)?\.(js|css)"]),
    (Category::Libraries, "Tailwind CSS", &[r"tailwindcss", r"tailwind(\.min)?\.css"]),
    (Category::Libraries, "Font Awesome", &[r"font-?awesome"]),
    (Category::Libraries, "Lodash", &[r"lodash(\.min)?\.js"]),
    (Category::Libraries, "Moment.js", &[r"moment(\.min)?\.js"]),
    (Category::Libraries, "Chart.js", &[r"chart(\.min)?\.js"]),
    (Category::Libraries, "Three.js", &[r"three(\.min)?\.js"]),
    (Category::Analytics, "Google Analytics", &[r"google-analytics\.com", r"gtag/js", r"gtag\("]),
    (Category::Analytics, "Google Tag Manager", &[r"googletagmanager\.com/gtm\.js", r"gtm\.start"]),
    (Category::Analytics, "Facebook Pixel", &[r"connect\.facebook\.net", r"fbq\("]),
    (Category::Analytics, "Hotjar", &[r"static\.hotjar\.com", r"_hjsettings"]),
    (Category::Analytics, "Mixpanel", &[r"cdn\.mxpnl\.com", r"mixpanel\.init"]),
    (Category::Analytics, "Segment", &[r"cdn\.segment\.com", r"analytics\.load\("]),
];

/// `server` header fragments
const SERVERS: &[(&str, &str)] = &[
    ("nginx", "Nginx"),
    ("apache", "Apache"),
    ("cloudflare", "Cloudflare"),
    ("microsoft-iis", "Microsoft IIS"),
    ("litespeed", "LiteSpeed"),
    ("caddy", "Caddy"),
];

/// `x-powered-by` header fragments
const BACKENDS: &[(&str, &str)] = &[
    ("php", "PHP"),
    ("asp.net", "ASP.NET"),
    ("express", "Express.js"),
    ("next.js", "Next.js"),
];

struct Signature {
    category: Category,
    name: &'static str,
    patterns: Vec<Regex>,
}

fn signatures() -> &'static [Signature] {
    static COMPILED: OnceLock<Vec<Signature>> = OnceLock::new();

    COMPILED.get_or_init(|| {
        SIGNATURES
            .iter()
            .map(|(category, name, patterns)| Signature {
                category: *category,
                name: *name,
                patterns: patterns
                    .iter()
                    .filter_map(|pattern| match Regex::new(&format!("(?i){}", pattern)) {
                        Ok(regex) => Some(regex),
                        Err(e) => {
                            warn!("Invalid signature '{}' for {}: {}", pattern, name, e);
                            None
                        }
                    })
                    .collect(),
            })
            .collect()
    })
}

/// Detect technologies from page markup and response headers
pub fn detect(html: &str, headers: &HashMap<String, String>) -> TechnologyReport {
    let mut found: BTreeMap<&'static str, BTreeSet<String>> = BTreeMap::new();

    for signature in signatures() {
        if signature.patterns.iter().any(|pattern| pattern.is_match(html)) {
            let bucket = match signature.category {
                Category::Frameworks => "frameworks",
                Category::Cms => "cms",
                Category::Libraries => "libraries",
                Category::Analytics => "analytics",
            };
            found.entry(bucket).or_default().insert(signature.name.to_string());
        }
    }

    let header = |name: &str| headers.get(name).map(|v| v.to_ascii_lowercase()).unwrap_or_default();
    let server = header("server");
    let powered_by = header("x-powered-by");

    let servers = found.entry("servers").or_default();
    for (fragment, name) in SERVERS {
        if server.contains(fragment) {
            servers.insert(name.to_string());
        }
    }
    for (fragment, name) in BACKENDS {
        if powered_by.contains(fragment) {
            servers.insert(name.to_string());
        }
    }

    let document = Html::parse_document(html);
    let meta: BTreeMap<String, String> = [
        ("generator", "generator"),
        ("application-name", "application_name"),
        ("theme", "theme"),
    ]
    .iter()
    .filter_map(|(name, key)| {
        meta_content(&document, "name", name)
            .filter(|content| !content.is_empty())
            .map(|content| (key.to_string(), content))
    })
    .collect();

    let mut take = |bucket: &str| -> Vec<String> {
        found.remove(bucket).map(|set| set.into_iter().collect()).unwrap_or_default()
    };

    let mut report = TechnologyReport {
        frameworks: take("frameworks"),
        cms: take("cms"),
        libraries: take("libraries"),
        analytics: take("analytics"),
        servers: take("servers"),
        meta,
        summary: TechnologySummary::default(),
    };

    let categories: BTreeMap<String, usize> = [
        ("frameworks", report.frameworks.len()),
        ("cms", report.cms.len()),
        ("libraries", report.libraries.len()),
        ("analytics", report.analytics.len()),
        ("servers", report.servers.len()),
    ]
    .into_iter()
    .map(|(name, n)| (name.to_string(), n))
    .collect();

    report.summary = TechnologySummary {
        total_technologies: categories.values().sum(),
        categories,
    };

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_markup_and_headers() {
        let html = r#"<html><head>
            <meta name="generator" content="WordPress 6.4">
            <link rel="stylesheet" href="/wp-content/themes/x/bootstrap.min.css">
            <script src="https://code.jquery.com/jquery-3.7.1.min.js"></script>
            <script async src="https://www.googletagmanager.com/gtag/js?id=G-1"></script>
        </head><body><div id="__next"></div><script id="__NEXT_DATA__">{}</script></body></html>"#;

        let headers = HashMap::from([
            ("server".to_string(), "nginx/1.25".to_string()),
            ("x-powered-by".to_string(), "PHP/8.2".to_string()),
        ]);

        let report = detect(html, &headers);

        assert_eq!(report.cms, vec!["WordPress".to_string()]);
        assert_eq!(report.frameworks, vec!["Next.js".to_string()]);
        assert_eq!(report.libraries, vec!["Bootstrap".to_string(), "jQuery".to_string()]);
        assert_eq!(report.analytics, vec!["Google Analytics".to_string()]);
        assert_eq!(report.servers, vec!["Nginx".to_string(), "PHP".to_string()]);
        assert_eq!(report.meta.get("generator").map(String::as_str), Some("WordPress 6.4"));
        assert_eq!(report.summary.total_technologies, 7);
    }

    #[test]
    fn test_plain_page_detects_nothing() {
        let report = detect("<html><body><p>hi</p></body></html>", &HashMap::new());
        assert_eq!(report.summary.total_technologies, 0);
        assert!(report.meta.is_empty());
    }
}
