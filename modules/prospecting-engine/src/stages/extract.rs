//! Stage 4: data extraction.
//!
//! Page discovery (sitemap → robots → homepage links), dual-viewport
//! homepage renders, DOM/text heuristics with per-field confidence, and a
//! Vision-LLM fallback that only fills slots the heuristics were unsure
//! about. Extraction never invents contact data: a field nobody produced
//! stays null.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use spider_transformations::transformation::content::{
    transform_content_input, ReturnFormat, TransformConfig, TransformInput,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use browserless_client::Viewport;
use prospecting_common::{Prospect, RunOptions, WebsiteStatus};

use crate::prompts::{PromptRegistry, PROMPT_WEBSITE_EXTRACTION};
use crate::providers::ProviderGateway;
use crate::stages::schema_of;

/// Max pages fetched per site, homepage included.
pub const MAX_PAGES: usize = 5;

/// Below this overall confidence the vision fallback kicks in.
pub const VISION_THRESHOLD: f64 = 0.5;

const VISION_CONFIDENCE: f64 = 0.7;

// --- Page classification ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    Homepage,
    About,
    Services,
    Pricing,
    Contact,
    Other,
}

const ASSET_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".ico", ".css", ".js", ".pdf", ".zip",
    ".mp4", ".mp3", ".woff", ".woff2", ".xml",
];

/// Classify a page by URL pattern.
pub fn classify_page(url: &str) -> PageKind {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_else(|_| url.to_lowercase());

    if path.is_empty() || path == "/" {
        return PageKind::Homepage;
    }
    if path.contains("about") || path.contains("team") || path.contains("our-story") {
        return PageKind::About;
    }
    if path.contains("service") || path.contains("what-we-do") || path.contains("menu") {
        return PageKind::Services;
    }
    if path.contains("pricing") || path.contains("rates") || path.contains("plans") {
        return PageKind::Pricing;
    }
    if path.contains("contact") || path.contains("get-in-touch") || path.contains("location") {
        return PageKind::Contact;
    }
    PageKind::Other
}

fn is_html_page(url: &str) -> bool {
    let lower = url.to_lowercase();
    !ASSET_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Discover up to `max_pages` same-host pages worth reading, preferring
/// sitemap entries, then the sitemap referenced by robots.txt, then links
/// found on the homepage.
pub async fn discover_pages(
    http: &reqwest::Client,
    website: &str,
    homepage_links: &[String],
    max_pages: usize,
) -> Vec<(String, PageKind)> {
    let Ok(base) = url::Url::parse(website) else {
        return Vec::new();
    };
    let host = base.host_str().unwrap_or_default().to_string();

    let mut urls = fetch_sitemap_urls(http, &base).await;
    if urls.is_empty() {
        urls = fetch_robots_sitemap_urls(http, &base).await;
    }
    if urls.is_empty() {
        urls = homepage_links.to_vec();
    }

    let mut seen = std::collections::HashSet::new();
    let mut pages: Vec<(String, PageKind)> = urls
        .into_iter()
        .filter(|u| is_html_page(u))
        .filter(|u| {
            url::Url::parse(u)
                .ok()
                .and_then(|p| p.host_str().map(|h| h.trim_start_matches("www.") == host.trim_start_matches("www.")))
                .unwrap_or(false)
        })
        .filter(|u| seen.insert(u.trim_end_matches('/').to_string()))
        .map(|u| {
            let kind = classify_page(&u);
            (u, kind)
        })
        .collect();

    // Informative pages first, then whatever else the site offers.
    pages.sort_by_key(|(_, kind)| match kind {
        PageKind::Homepage => 0,
        PageKind::Contact => 1,
        PageKind::About => 2,
        PageKind::Services => 3,
        PageKind::Pricing => 4,
        PageKind::Other => 5,
    });
    pages.truncate(max_pages);
    pages
}

async fn fetch_sitemap_urls(http: &reqwest::Client, base: &url::Url) -> Vec<String> {
    let Ok(sitemap_url) = base.join("/sitemap.xml") else {
        return Vec::new();
    };
    match http.get(sitemap_url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let body = resp.text().await.unwrap_or_default();
            parse_sitemap_locs(&body)
        }
        _ => Vec::new(),
    }
}

async fn fetch_robots_sitemap_urls(http: &reqwest::Client, base: &url::Url) -> Vec<String> {
    let Ok(robots_url) = base.join("/robots.txt") else {
        return Vec::new();
    };
    let Ok(resp) = http.get(robots_url).send().await else {
        return Vec::new();
    };
    if !resp.status().is_success() {
        return Vec::new();
    }
    let body = resp.text().await.unwrap_or_default();
    for line in body.lines() {
        if let Some(sitemap) = line.strip_prefix("Sitemap:").map(str::trim) {
            if let Ok(resp) = http.get(sitemap).send().await {
                if resp.status().is_success() {
                    let xml = resp.text().await.unwrap_or_default();
                    return parse_sitemap_locs(&xml);
                }
            }
        }
    }
    Vec::new()
}

fn parse_sitemap_locs(xml: &str) -> Vec<String> {
    static LOC_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<loc>\s*([^<]+?)\s*</loc>").expect("valid regex"));
    LOC_RE
        .captures_iter(xml)
        .map(|cap| cap[1].to_string())
        .take(50)
        .collect()
}

// --- DOM/text heuristics ---

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid regex")
});
static MAILTO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"mailto:([A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,})"#).expect("valid regex")
});
static TEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"tel:([+0-9().\s-]{7,20})"#).expect("valid regex"));
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+1[\s.-]?)?\(?\d{3}\)?[\s.-]\d{3}[\s.-]\d{4}").expect("valid regex")
});
static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h[23][^>]*>(.*?)</h[23]>").expect("valid regex"));
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));

/// One extracted field with its confidence in [0, 1].
pub type Scored<T> = Option<(T, f64)>;

#[derive(Debug, Clone, Default)]
pub struct FieldExtraction {
    pub email: Scored<String>,
    pub phone: Scored<String>,
    pub description: Scored<String>,
    pub services: Vec<String>,
    pub services_confidence: f64,
    pub social_links: Vec<String>,
}

impl FieldExtraction {
    /// Mean of the four field confidences, missing fields counting as zero.
    pub fn overall_confidence(&self) -> f64 {
        let email = self.email.as_ref().map_or(0.0, |(_, c)| *c);
        let phone = self.phone.as_ref().map_or(0.0, |(_, c)| *c);
        let description = self.description.as_ref().map_or(0.0, |(_, c)| *c);
        let services = if self.services.is_empty() {
            0.0
        } else {
            self.services_confidence
        };
        (email + phone + description + services) / 4.0
    }
}

/// Run the heuristics over rendered homepage HTML.
pub fn extract_from_html(html: &str, meta_description: Option<&str>) -> FieldExtraction {
    let mut fields = FieldExtraction::default();

    // Email: mailto beats a plain text match.
    if let Some(cap) = MAILTO_RE.captures(html) {
        fields.email = Some((cap[1].to_lowercase(), 0.9));
    } else if let Some(m) = EMAIL_RE.find(html) {
        let email = m.as_str().to_lowercase();
        // Plain matches can be asset filenames (logo@2x.png).
        if !ASSET_EXTENSIONS.iter().any(|ext| email.ends_with(ext)) {
            fields.email = Some((email, 0.6));
        }
    }

    // Phone: tel: link beats a text pattern.
    if let Some(cap) = TEL_RE.captures(html) {
        fields.phone = Some((cap[1].trim().to_string(), 0.9));
    } else if let Some(m) = PHONE_RE.find(html) {
        fields.phone = Some((m.as_str().trim().to_string(), 0.5));
    }

    // Description: meta description, else the first substantial paragraph
    // of readable text.
    if let Some(meta) = meta_description.filter(|m| m.len() >= 40) {
        fields.description = Some((meta.to_string(), 0.8));
    } else if let Some(paragraph) = first_paragraph(html) {
        fields.description = Some((paragraph, 0.4));
    }

    // Services: anchor texts pointing at service-like pages.
    fields.services = service_link_texts(html);
    if !fields.services.is_empty() {
        fields.services_confidence = 0.5;
    }

    fields.social_links = browserless_client::extract_outbound_links(html, "https://placeholder.invalid");

    fields
}

/// First readable paragraph of at least 80 characters, via the same
/// content transform the scrapers use.
fn first_paragraph(html: &str) -> Option<String> {
    let config = TransformConfig {
        readability: true,
        main_content: true,
        return_format: ReturnFormat::Markdown,
        filter_images: true,
        filter_svg: true,
        clean_html: true,
    };
    let input = TransformInput {
        url: None,
        content: html.as_bytes(),
        screenshot_bytes: None,
        encoding: None,
        selector_config: None,
        ignore_tags: None,
    };
    let text = transform_content_input(input, &config);
    text.split("\n\n")
        .map(str::trim)
        .find(|p| p.len() >= 80 && !p.starts_with('#'))
        .map(|p| p.chars().take(500).collect())
}

/// Anchor texts whose hrefs classify as service pages.
fn service_link_texts(html: &str) -> Vec<String> {
    static ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?is)<a[^>]+href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#)
            .expect("valid regex")
    });

    let mut seen = std::collections::HashSet::new();
    let mut services = Vec::new();
    for cap in ANCHOR_RE.captures_iter(html) {
        let href = &cap[1];
        if classify_page(href) != PageKind::Services {
            continue;
        }
        let text = TAG_RE.replace_all(&cap[2], "").trim().to_string();
        if text.len() < 3 || text.len() > 60 || text.to_lowercase() == "services" {
            continue;
        }
        if seen.insert(text.to_lowercase()) {
            services.push(text);
            if services.len() >= 10 {
                break;
            }
        }
    }
    services
}

/// Service-page headings, used to backfill services from a crawled page.
pub fn headings(html: &str) -> Vec<String> {
    HEADING_RE
        .captures_iter(html)
        .map(|cap| TAG_RE.replace_all(&cap[1], "").trim().to_string())
        .filter(|h| h.len() >= 3 && h.len() <= 60)
        .take(10)
        .collect()
}

// --- Vision fallback ---

/// What the vision model extracts from the homepage screenshot.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct VisionExtraction {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub social_links: Vec<String>,
}

/// Merge vision output into the heuristic fields. The higher-confidence
/// source wins per field; vision fields carry a fixed confidence.
pub fn merge_vision(fields: &mut FieldExtraction, vision: VisionExtraction) {
    if let Some(email) = vision.email.filter(|e| EMAIL_RE.is_match(e)) {
        if fields.email.as_ref().map_or(0.0, |(_, c)| *c) < VISION_CONFIDENCE {
            fields.email = Some((email.to_lowercase(), VISION_CONFIDENCE));
        }
    }
    if let Some(phone) = vision.phone.filter(|p| p.len() >= 7) {
        if fields.phone.as_ref().map_or(0.0, |(_, c)| *c) < VISION_CONFIDENCE {
            fields.phone = Some((phone, VISION_CONFIDENCE));
        }
    }
    if let Some(description) = vision.description.filter(|d| d.len() >= 40) {
        if fields.description.as_ref().map_or(0.0, |(_, c)| *c) < VISION_CONFIDENCE {
            fields.description = Some((description, VISION_CONFIDENCE));
        }
    }
    if fields.services.is_empty() && !vision.services.is_empty() {
        fields.services = vision.services.into_iter().take(10).collect();
        fields.services_confidence = VISION_CONFIDENCE;
    }
    for link in vision.social_links {
        if !fields.social_links.contains(&link) {
            fields.social_links.push(link);
        }
    }
}

// --- Stage runner ---

/// Links and screenshots the later stages reuse.
#[derive(Debug, Default)]
pub struct ExtractionArtifacts {
    pub outbound_links: Vec<String>,
    pub vision_links: Vec<String>,
    pub rendered: bool,
}

/// Enrich an active-website prospect. Returns the updated prospect, the
/// artifacts for social discovery, and any warnings worth streaming.
pub async fn run(
    gateway: &ProviderGateway,
    http: &reqwest::Client,
    prompts: &PromptRegistry,
    mut prospect: Prospect,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> (Prospect, ExtractionArtifacts, Vec<String>) {
    let mut artifacts = ExtractionArtifacts::default();
    let mut warnings = Vec::new();

    if prospect.website_status != WebsiteStatus::Active || !options.scrape_websites {
        return (prospect, artifacts, warnings);
    }
    let Some(website) = prospect.website.clone() else {
        return (prospect, artifacts, warnings);
    };

    // Homepage at both viewports. The desktop render is the extraction
    // source; the mobile render exists to catch mobile-only contact bars.
    let desktop = match gateway
        .render(&website, Viewport::DESKTOP, options.browser_timeout_ms, cancel)
        .await
    {
        Ok(page) => page,
        Err(e) => {
            warnings.push(format!("homepage render failed: {e}"));
            return (prospect, artifacts, warnings);
        }
    };
    artifacts.rendered = true;
    artifacts.outbound_links = desktop.outbound_links.clone();

    let mobile_html = match gateway
        .render(&website, Viewport::MOBILE, options.browser_timeout_ms, cancel)
        .await
    {
        Ok(page) => Some(page.html),
        Err(e) => {
            warnings.push(format!("mobile render failed: {e}"));
            None
        }
    };

    let mut fields = extract_from_html(&desktop.html, desktop.meta_description.as_deref());

    // Mobile-only contact details fill gaps at the same confidence tier.
    if let Some(mobile_html) = mobile_html {
        let mobile = extract_from_html(&mobile_html, None);
        if fields.email.is_none() {
            fields.email = mobile.email;
        }
        if fields.phone.is_none() {
            fields.phone = mobile.phone;
        }
    }

    // Secondary pages: cheap plain fetches for whatever is still missing.
    let pages = discover_pages(http, &website, &desktop.outbound_links, MAX_PAGES).await;
    for (url, kind) in pages.iter().filter(|(u, _)| u.trim_end_matches('/') != website.trim_end_matches('/')) {
        if fields.email.is_some() && fields.phone.is_some() && !fields.services.is_empty() {
            break;
        }
        let Ok(resp) = http.get(url).send().await else {
            continue;
        };
        if !resp.status().is_success() {
            continue;
        }
        let html = resp.text().await.unwrap_or_default();
        let page_fields = extract_from_html(&html, None);
        if fields.email.is_none() {
            fields.email = page_fields.email;
        }
        if fields.phone.is_none() {
            fields.phone = page_fields.phone;
        }
        if *kind == PageKind::Services && fields.services.is_empty() {
            fields.services = headings(&html);
            if !fields.services.is_empty() {
                fields.services_confidence = 0.55;
            }
        }
        for link in page_fields.social_links {
            if !artifacts.outbound_links.contains(&link) {
                artifacts.outbound_links.push(link);
            }
        }
    }

    // Vision fallback for low-confidence extractions.
    let confidence = fields.overall_confidence();
    if confidence < VISION_THRESHOLD
        && options.use_vision_fallback
        && !gateway.quota_tripped("llm.vision")
    {
        debug!(
            company = prospect.company_name,
            confidence, "Low extraction confidence, invoking vision fallback"
        );
        match vision_fallback(gateway, prompts, &prospect.company_name, &desktop.png, cancel)
            .await
        {
            Ok(vision) => {
                artifacts.vision_links = vision.social_links.clone();
                merge_vision(&mut fields, vision);
            }
            Err(e) => {
                warn!(company = prospect.company_name, error = %e, "Vision fallback failed");
                warnings.push(format!("vision fallback failed: {e}"));
            }
        }
    }

    prospect.contact_email = fields.email.map(|(v, _)| v);
    prospect.contact_phone = prospect
        .contact_phone
        .clone()
        .or(fields.phone.map(|(v, _)| v));
    prospect.description = fields.description.map(|(v, _)| v);
    prospect.services = fields.services;

    for link in fields.social_links {
        if !artifacts.outbound_links.contains(&link) {
            artifacts.outbound_links.push(link);
        }
    }

    (prospect, artifacts, warnings)
}

async fn vision_fallback(
    gateway: &ProviderGateway,
    prompts: &PromptRegistry,
    company_name: &str,
    png: &[u8],
    cancel: &CancellationToken,
) -> Result<VisionExtraction, anyhow::Error> {
    let vars = HashMap::from([("company_name", company_name)]);
    let (prompt, _) = prompts.render(PROMPT_WEBSITE_EXTRACTION, &vars)?;
    let completion = gateway
        .analyze_json(&prompt, &[png.to_vec()], schema_of::<VisionExtraction>(), cancel)
        .await?;
    Ok(serde_json::from_value(completion.value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_classification_by_url_pattern() {
        assert_eq!(classify_page("https://acme.com/"), PageKind::Homepage);
        assert_eq!(classify_page("https://acme.com/about-us"), PageKind::About);
        assert_eq!(classify_page("https://acme.com/services/drains"), PageKind::Services);
        assert_eq!(classify_page("https://acme.com/pricing"), PageKind::Pricing);
        assert_eq!(classify_page("https://acme.com/contact"), PageKind::Contact);
        assert_eq!(classify_page("https://acme.com/blog/post-1"), PageKind::Other);
    }

    #[test]
    fn asset_urls_are_not_pages() {
        assert!(!is_html_page("https://acme.com/logo.png"));
        assert!(!is_html_page("https://acme.com/styles.css"));
        assert!(is_html_page("https://acme.com/about"));
    }

    #[test]
    fn mailto_beats_text_email() {
        let html = r#"<p>info@other.com</p><a href="mailto:Hello@Acme.com">email us</a>"#;
        let fields = extract_from_html(html, None);
        let (email, conf) = fields.email.unwrap();
        assert_eq!(email, "hello@acme.com");
        assert!((conf - 0.9).abs() < 1e-9);
    }

    #[test]
    fn text_email_is_lower_confidence() {
        let html = "<p>Reach us at info@acme.com for a quote.</p>";
        let fields = extract_from_html(html, None);
        let (email, conf) = fields.email.unwrap();
        assert_eq!(email, "info@acme.com");
        assert!((conf - 0.6).abs() < 1e-9);
    }

    #[test]
    fn tel_link_beats_text_phone() {
        let html = r#"<a href="tel:+1 215-555-0100">call</a> or (999) 999-9999"#;
        let fields = extract_from_html(html, None);
        let (phone, conf) = fields.phone.unwrap();
        assert_eq!(phone, "+1 215-555-0100");
        assert!((conf - 0.9).abs() < 1e-9);
    }

    #[test]
    fn meta_description_wins_over_paragraph() {
        let meta = "Acme Plumbing has proudly served the greater Philadelphia region since 1982.";
        let fields = extract_from_html("<p>short</p>", Some(meta));
        let (description, conf) = fields.description.unwrap();
        assert_eq!(description, meta);
        assert!((conf - 0.8).abs() < 1e-9);
    }

    #[test]
    fn no_sources_leaves_contact_null() {
        let fields = extract_from_html("<html><body><h1>Acme</h1></body></html>", None);
        assert!(fields.email.is_none());
        assert!(fields.phone.is_none());
    }

    #[test]
    fn overall_confidence_averages_fields() {
        let mut fields = FieldExtraction::default();
        assert_eq!(fields.overall_confidence(), 0.0);

        fields.email = Some(("a@b.com".into(), 0.9));
        fields.phone = Some(("215-555-0100".into(), 0.5));
        fields.description = Some(("desc".into(), 0.8));
        fields.services = vec!["Drain cleaning".into()];
        fields.services_confidence = 0.5;
        assert!((fields.overall_confidence() - 0.675).abs() < 1e-9);
    }

    #[test]
    fn vision_merge_fills_only_low_confidence_slots() {
        let mut fields = FieldExtraction::default();
        fields.email = Some(("strong@acme.com".into(), 0.9));
        fields.phone = Some(("(215) 555-0100".into(), 0.5));

        merge_vision(
            &mut fields,
            VisionExtraction {
                email: Some("weak@acme.com".into()),
                phone: Some("(215) 555-9999".into()),
                description: Some(
                    "Full-service plumbing for residential and commercial customers.".into(),
                ),
                services: vec!["Water heaters".into()],
                social_links: vec!["https://instagram.com/acme".into()],
            },
        );

        assert_eq!(fields.email.as_ref().unwrap().0, "strong@acme.com");
        assert_eq!(fields.phone.as_ref().unwrap().0, "(215) 555-9999");
        assert!(fields.description.is_some());
        assert_eq!(fields.services, vec!["Water heaters".to_string()]);
        assert!(fields
            .social_links
            .contains(&"https://instagram.com/acme".to_string()));
    }

    #[test]
    fn vision_merge_never_invents_email() {
        let mut fields = FieldExtraction::default();
        merge_vision(&mut fields, VisionExtraction::default());
        assert!(fields.email.is_none());
        assert!(fields.phone.is_none());
    }

    #[test]
    fn sitemap_locs_parsed() {
        let xml = r#"<?xml version="1.0"?><urlset>
            <url><loc>https://acme.com/</loc></url>
            <url><loc> https://acme.com/about </loc></url>
        </urlset>"#;
        assert_eq!(
            parse_sitemap_locs(xml),
            vec!["https://acme.com/".to_string(), "https://acme.com/about".to_string()]
        );
    }

    #[test]
    fn service_anchor_texts_collected() {
        let html = r#"
            <a href="/services/drain-cleaning">Drain Cleaning</a>
            <a href="/services/water-heaters">Water Heaters</a>
            <a href="/about">About Us</a>
            <a href="/services">Services</a>
        "#;
        let fields = extract_from_html(html, None);
        assert_eq!(
            fields.services,
            vec!["Drain Cleaning".to_string(), "Water Heaters".to_string()]
        );
    }
}
