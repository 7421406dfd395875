//! Stage 6: social metadata.
//!
//! Renders each discovered profile at the desktop viewport and reads
//! public meta tags only (Open Graph title/description/image, canonical
//! title). No authenticated scraping, ever. A profile that fails to render
//! is recorded as a warning and never fails the prospect.

use std::sync::LazyLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use browserless_client::Viewport;
use prospecting_common::{Prospect, RunOptions, SocialProfileMeta};

use crate::providers::ProviderGateway;

static OG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<meta[^>]+property\s*=\s*["']og:(title|description|image)["'][^>]*content\s*=\s*["']([^"']+)["']"#,
    )
    .expect("valid regex")
});
static OG_REV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<meta[^>]+content\s*=\s*["']([^"']+)["'][^>]*property\s*=\s*["']og:(title|description|image)["']"#,
    )
    .expect("valid regex")
});

/// Pull public profile metadata out of rendered profile HTML.
pub fn parse_profile_meta(html: &str, profile_url: &str) -> SocialProfileMeta {
    let mut meta = SocialProfileMeta {
        username: username_from_url(profile_url),
        ..Default::default()
    };

    for cap in OG_RE.captures_iter(html) {
        apply_og(&mut meta, &cap[1], &cap[2]);
    }
    for cap in OG_REV_RE.captures_iter(html) {
        apply_og(&mut meta, &cap[2], &cap[1]);
    }

    if meta.display_name.is_none() {
        meta.display_name = browserless_client::extract_title(html);
    }

    meta
}

fn apply_og(meta: &mut SocialProfileMeta, property: &str, content: &str) {
    let content = content.trim();
    if content.is_empty() {
        return;
    }
    match property.to_lowercase().as_str() {
        "title" if meta.display_name.is_none() => meta.display_name = Some(content.to_string()),
        "description" if meta.bio.is_none() => meta.bio = Some(content.to_string()),
        "image" if meta.image_url.is_none() => meta.image_url = Some(content.to_string()),
        _ => {}
    }
}

/// Username from the profile URL path: the last non-empty segment, with a
/// leading `@` stripped.
pub fn username_from_url(profile_url: &str) -> Option<String> {
    let parsed = url::Url::parse(profile_url).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()?;
    let username = segment.trim_start_matches('@');
    (!username.is_empty()).then(|| username.to_string())
}

/// Fetch public metadata for every discovered profile. Per-platform
/// failures are returned as warnings.
pub async fn run(
    gateway: &ProviderGateway,
    mut prospect: Prospect,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> (Prospect, Vec<String>) {
    let mut warnings = Vec::new();

    if !options.scrape_social {
        return (prospect, warnings);
    }

    let profiles: Vec<_> = prospect
        .social_profiles
        .iter()
        .map(|(p, u)| (*p, u.clone()))
        .collect();

    for (platform, url) in profiles {
        match gateway
            .render(&url, Viewport::DESKTOP, options.browser_timeout_ms, cancel)
            .await
        {
            Ok(page) => {
                let meta = parse_profile_meta(&page.html, &url);
                debug!(
                    company = prospect.company_name,
                    platform = %platform,
                    "Social metadata captured"
                );
                prospect.social_metadata.insert(platform, meta);
            }
            Err(e) => {
                warnings.push(format!("{platform} metadata fetch failed: {e}"));
            }
        }
    }

    (prospect, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_HTML: &str = r#"
        <html><head>
        <title>Acme Plumbing (@acmeplumbing) | Instagram</title>
        <meta property="og:title" content="Acme Plumbing">
        <meta property="og:description" content="Family plumbing since 1982. Philly proud.">
        <meta property="og:image" content="https://cdn.example/acme.jpg">
        </head><body></body></html>
    "#;

    #[test]
    fn og_tags_populate_meta() {
        let meta = parse_profile_meta(PROFILE_HTML, "https://instagram.com/acmeplumbing");
        assert_eq!(meta.username.as_deref(), Some("acmeplumbing"));
        assert_eq!(meta.display_name.as_deref(), Some("Acme Plumbing"));
        assert_eq!(
            meta.bio.as_deref(),
            Some("Family plumbing since 1982. Philly proud.")
        );
        assert_eq!(meta.image_url.as_deref(), Some("https://cdn.example/acme.jpg"));
    }

    #[test]
    fn falls_back_to_page_title_for_display_name() {
        let html = "<html><head><title>Acme on YouTube</title></head></html>";
        let meta = parse_profile_meta(html, "https://youtube.com/@acme");
        assert_eq!(meta.display_name.as_deref(), Some("Acme on YouTube"));
        assert!(meta.bio.is_none());
    }

    #[test]
    fn username_strips_at_prefix_and_nested_paths() {
        assert_eq!(
            username_from_url("https://youtube.com/@acme").as_deref(),
            Some("acme")
        );
        assert_eq!(
            username_from_url("https://linkedin.com/company/acme-plumbing").as_deref(),
            Some("acme-plumbing")
        );
        assert!(username_from_url("https://instagram.com/").is_none());
    }
}
