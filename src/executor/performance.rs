use scraper::{ElementRef, Html};
use serde::Serialize;
use std::collections::HashMap;

use crate::utils::html::{count, select_all};

#[derive(Debug, Clone, Serialize)]
pub struct ResourceCounts {
    pub scripts_external: usize,
    pub scripts_inline: usize,
    pub stylesheets_external: usize,
    pub styles_inline: usize,
    pub images: usize,
    pub iframes: usize,
    /// External resources the browser has to request
    pub total_requests: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageWeight {
    pub html_bytes: usize,
    pub html_kb: f64,
    pub inline_script_bytes: usize,
    pub inline_style_bytes: usize,
    pub dom_elements: usize,
}

/// Static performance profile of the fetched document
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub weight: PageWeight,
    pub resources: ResourceCounts,
    pub render_blocking_scripts: usize,
    pub compressed: bool,
    pub cache_control: Option<String>,
    pub recommendations: Vec<String>,
}

fn kb(bytes: usize) -> f64 {
    (bytes as f64 / 1024.0 * 100.0).round() / 100.0
}

/// Profile `html` using the response `headers` (lowercase names)
pub fn measure(html: &str, headers: &HashMap<String, String>) -> PerformanceReport {
    let document = Html::parse_document(html);

    let scripts = select_all(&document, "script");
    let (external_scripts, inline_scripts): (Vec<&ElementRef<'_>>, Vec<&ElementRef<'_>>) =
        scripts.iter().partition(|script| script.value().attr("src").is_some());

    // Scripts in <head> without async/defer hold up first render
    let render_blocking_scripts = select_all(&document, "head script[src]")
        .iter()
        .filter(|script| {
            let element = script.value();
            element.attr("async").is_none()
                && element.attr("defer").is_none()
                && element.attr("type") != Some("module")
        })
        .count();

    let inline_script_bytes = inline_scripts
        .iter()
        .map(|script: &&ElementRef<'_>| script.text().map(str::len).sum::<usize>())
        .sum();

    let inline_styles = select_all(&document, "style");
    let inline_style_bytes = inline_styles
        .iter()
        .map(|style| style.text().map(str::len).sum::<usize>())
        .sum();

    let stylesheets_external = select_all(&document, "link[rel][href]")
        .iter()
        .filter(|link| {
            link.value()
                .attr("rel")
                .map_or(false, |rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("stylesheet")))
        })
        .count();

    let images = count(&document, "img");
    let iframes = count(&document, "iframe");

    let resources = ResourceCounts {
        scripts_external: external_scripts.len(),
        scripts_inline: inline_scripts.len(),
        stylesheets_external,
        styles_inline: inline_styles.len(),
        images,
        iframes,
        total_requests: external_scripts.len() + stylesheets_external + images + iframes,
    };

    let weight = PageWeight {
        html_bytes: html.len(),
        html_kb: kb(html.len()),
        inline_script_bytes,
        inline_style_bytes,
        dom_elements: count(&document, "*"),
    };

    let compressed = headers
        .get("content-encoding")
        .map_or(false, |encoding| {
            let encoding = encoding.to_ascii_lowercase();
            ["gzip", "br", "deflate", "zstd"].iter().any(|e| encoding.contains(e))
        });
    let cache_control = headers.get("cache-control").cloned();

    let mut recommendations = Vec::new();
    if weight.html_bytes > 500 * 1024 {
        recommendations.push(format!("HTML is large ({} KB); trim markup or paginate", weight.html_kb));
    }
    if weight.dom_elements > 1500 {
        recommendations.push(format!("DOM has {} elements; aim for fewer than 1500", weight.dom_elements));
    }
    if render_blocking_scripts > 0 {
        recommendations.push(format!(
            "{} render-blocking script(s) in <head>; add async or defer",
            render_blocking_scripts
        ));
    }
    if resources.scripts_external > 15 {
        recommendations.push(format!(
            "{} external scripts; bundle them",
            resources.scripts_external
        ));
    }
    if inline_script_bytes + inline_style_bytes > 50 * 1024 {
        recommendations.push("Large inline scripts/styles; move them to cacheable files".to_string());
    }
    if !compressed {
        recommendations.push("Response is not compressed; enable gzip or brotli".to_string());
    }
    if cache_control.is_none() {
        recommendations.push("No Cache-Control header".to_string());
    }

    PerformanceReport {
        weight,
        resources,
        render_blocking_scripts,
        compressed,
        cache_control,
        recommendations,
    }
}
