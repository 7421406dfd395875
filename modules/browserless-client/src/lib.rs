pub mod error;

pub use error::{BrowserlessError, Result};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Browser viewport dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const DESKTOP: Viewport = Viewport {
        width: 1920,
        height: 1080,
    };
    pub const MOBILE: Viewport = Viewport {
        width: 375,
        height: 667,
    };
}

/// A fully-rendered page: HTML, screenshot, and cheap derived metadata.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
    pub png: Vec<u8>,
    pub title: Option<String>,
    pub meta_description: Option<String>,
    pub outbound_links: Vec<String>,
}

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let mut endpoint = format!("{}{}", self.base_url, path);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }
        endpoint
    }

    /// Fetch fully-rendered HTML for a URL via the /content endpoint.
    pub async fn content(&self, url: &str, viewport: Viewport, timeout_ms: u64) -> Result<String> {
        let body = serde_json::json!({
            "url": url,
            "viewport": { "width": viewport.width, "height": viewport.height },
            "gotoOptions": { "timeout": timeout_ms, "waitUntil": "networkidle2" },
        });

        let resp = self
            .client
            .post(self.endpoint("/content"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(error::classify_navigation_error(
                status.as_u16(),
                &message,
                url,
            ));
        }

        Ok(resp.text().await?)
    }

    /// Capture a PNG screenshot via the /screenshot endpoint.
    pub async fn screenshot(
        &self,
        url: &str,
        viewport: Viewport,
        timeout_ms: u64,
    ) -> Result<Vec<u8>> {
        let body = serde_json::json!({
            "url": url,
            "viewport": { "width": viewport.width, "height": viewport.height },
            "gotoOptions": { "timeout": timeout_ms, "waitUntil": "networkidle2" },
            "options": { "type": "png", "fullPage": false },
        });

        let resp = self
            .client
            .post(self.endpoint("/screenshot"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(error::classify_navigation_error(
                status.as_u16(),
                &message,
                url,
            ));
        }

        Ok(resp.bytes().await?.to_vec())
    }

    /// Render a page: HTML + screenshot + derived title, meta description,
    /// and absolute outbound links.
    pub async fn render(
        &self,
        url: &str,
        viewport: Viewport,
        timeout_ms: u64,
    ) -> Result<RenderedPage> {
        debug!(url, width = viewport.width, "Rendering page");

        let html = self.content(url, viewport, timeout_ms).await?;
        let png = self.screenshot(url, viewport, timeout_ms).await?;

        let page = RenderedPage {
            url: url.to_string(),
            title: extract_title(&html),
            meta_description: extract_meta_description(&html),
            outbound_links: extract_outbound_links(&html, url),
            html,
            png,
        };

        info!(
            url,
            html_bytes = page.html.len(),
            png_bytes = page.png.len(),
            links = page.outbound_links.len(),
            "Rendered page"
        );
        Ok(page)
    }
}

/// Extract the <title> text from raw HTML.
pub fn extract_title(html: &str) -> Option<String> {
    let re = regex::Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex");
    re.captures(html)
        .map(|cap| cap[1].trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Extract the meta description (name= or og:description) from raw HTML.
pub fn extract_meta_description(html: &str) -> Option<String> {
    let re = regex::Regex::new(
        r#"(?is)<meta[^>]+(?:name\s*=\s*["']description["']|property\s*=\s*["']og:description["'])[^>]*content\s*=\s*["']([^"']+)["']"#,
    )
    .expect("valid regex");
    let re_rev = regex::Regex::new(
        r#"(?is)<meta[^>]+content\s*=\s*["']([^"']+)["'][^>]*(?:name\s*=\s*["']description["']|property\s*=\s*["']og:description["'])"#,
    )
    .expect("valid regex");

    re.captures(html)
        .or_else(|| re_rev.captures(html))
        .map(|cap| cap[1].trim().to_string())
        .filter(|d| !d.is_empty())
}

/// Extract absolute outbound links from raw HTML, resolving relative URLs
/// against `base_url`. Deduplicates and caps at 200 results.
pub fn extract_outbound_links(html: &str, base_url: &str) -> Vec<String> {
    let href_re = regex::Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).expect("valid regex");
    let base = url::Url::parse(base_url).ok();

    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();

    for cap in href_re.captures_iter(html) {
        let raw = &cap[1];
        if raw.starts_with('#') || raw.starts_with("javascript:") || raw.starts_with("mailto:") {
            continue;
        }

        let resolved = if raw.starts_with("http://") || raw.starts_with("https://") {
            raw.to_string()
        } else if let Some(ref b) = base {
            match b.join(raw) {
                Ok(u) => u.to_string(),
                Err(_) => continue,
            }
        } else {
            continue;
        };

        if seen.insert(resolved.clone()) {
            links.push(resolved);
            if links.len() >= 200 {
                break;
            }
        }
    }

    links
}
