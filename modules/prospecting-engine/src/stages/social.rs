//! Stage 5: social discovery.
//!
//! Profile URLs come from three sources in priority order: outbound links
//! from the rendered homepage, links the vision model read off the
//! screenshot, and finally an optional web search for platforms still
//! missing. Everything is normalized against each platform's canonical
//! host set before it is kept.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use prospecting_common::{Prospect, RunOptions, SocialPlatform};

use crate::providers::ProviderGateway;

/// Paths that are platform features rather than profiles.
const NON_PROFILE_SEGMENTS: &[&str] = &[
    "share", "sharer", "sharer.php", "intent", "hashtag", "search", "home", "login", "signup",
    "watch", "shorts", "reel", "reels", "p", "posts", "status",
];

/// Normalize a candidate URL into `(platform, canonical profile URL)`.
/// Returns `None` for URLs that are not a recognized platform profile.
pub fn normalize_profile_url(raw: &str) -> Option<(SocialPlatform, String)> {
    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let parsed = url::Url::parse(&with_scheme).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    let host = host.trim_start_matches("www.");

    let platform = SocialPlatform::ALL.into_iter().find(|p| {
        p.canonical_hosts()
            .iter()
            .any(|canonical| host == *canonical || host.ends_with(&format!(".{canonical}")))
    })?;

    let path = parsed.path().trim_end_matches('/');
    if path.is_empty() || path == "/" {
        return None;
    }
    let first_segment = path.trim_start_matches('/').split('/').next()?;
    if NON_PROFILE_SEGMENTS.contains(&first_segment.to_lowercase().as_str()) {
        return None;
    }

    // Query strings and fragments are tracking noise on profile links.
    let canonical_host = platform.canonical_hosts()[0];
    Some((platform, format!("https://{canonical_host}{path}")))
}

/// First recognized profile per platform, preserving link order.
pub fn discover_from_links(
    links: &[String],
) -> std::collections::BTreeMap<SocialPlatform, String> {
    let mut profiles = std::collections::BTreeMap::new();
    for link in links {
        if let Some((platform, url)) = normalize_profile_url(link) {
            profiles.entry(platform).or_insert(url);
        }
    }
    profiles
}

/// Populate `prospect.social_profiles` from the three sources.
pub async fn run(
    gateway: &ProviderGateway,
    mut prospect: Prospect,
    html_links: &[String],
    vision_links: &[String],
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Prospect {
    if !options.scrape_social {
        return prospect;
    }

    // Source 1: outbound links from the rendered site.
    for (platform, url) in discover_from_links(html_links) {
        prospect.social_profiles.entry(platform).or_insert(url);
    }

    // Source 2: links the vision model saw on the screenshot.
    for (platform, url) in discover_from_links(vision_links) {
        prospect.social_profiles.entry(platform).or_insert(url);
    }

    // Source 3: web search for whatever is still missing.
    let missing: Vec<SocialPlatform> = SocialPlatform::ALL
        .into_iter()
        .filter(|p| !prospect.social_profiles.contains_key(p))
        .collect();

    for platform in missing {
        let query = format!(
            "{} {} {platform}",
            prospect.company_name,
            prospect.city.as_deref().unwrap_or_default()
        );
        let Ok(hits) = gateway.web_search(query.trim(), 5, cancel).await else {
            // The searcher is optional; a failure here never hurts the prospect.
            break;
        };
        for hit in hits {
            if let Some((found, url)) = normalize_profile_url(&hit.url) {
                if found == platform {
                    prospect.social_profiles.insert(platform, url);
                    break;
                }
            }
        }
    }

    debug!(
        company = prospect.company_name,
        profiles = prospect.social_profiles.len(),
        "Social discovery complete"
    );
    prospect
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_scheme_host_and_trailing_slash() {
        let (platform, url) =
            normalize_profile_url("http://www.Instagram.com/AcmePlumbing/").unwrap();
        assert_eq!(platform, SocialPlatform::Instagram);
        assert_eq!(url, "https://instagram.com/AcmePlumbing");
    }

    #[test]
    fn strips_query_strings() {
        let (_, url) =
            normalize_profile_url("https://instagram.com/acme?igshid=abc123").unwrap();
        assert_eq!(url, "https://instagram.com/acme");
    }

    #[test]
    fn x_host_canonicalizes_to_twitter() {
        let (platform, url) = normalize_profile_url("https://x.com/acmeplumbing").unwrap();
        assert_eq!(platform, SocialPlatform::Twitter);
        assert_eq!(url, "https://twitter.com/acmeplumbing");
    }

    #[test]
    fn rejects_unknown_hosts() {
        assert!(normalize_profile_url("https://myspace.com/acme").is_none());
        assert!(normalize_profile_url("https://acme.com/instagram").is_none());
    }

    #[test]
    fn rejects_non_profile_paths() {
        assert!(normalize_profile_url("https://facebook.com/sharer.php?u=x").is_none());
        assert!(normalize_profile_url("https://twitter.com/intent/tweet").is_none());
        assert!(normalize_profile_url("https://youtube.com/watch?v=abc").is_none());
        assert!(normalize_profile_url("https://instagram.com/").is_none());
    }

    #[test]
    fn first_profile_per_platform_wins() {
        let links = vec![
            "https://instagram.com/first".to_string(),
            "https://instagram.com/second".to_string(),
            "https://linkedin.com/company/acme".to_string(),
        ];
        let profiles = discover_from_links(&links);
        assert_eq!(
            profiles[&SocialPlatform::Instagram],
            "https://instagram.com/first"
        );
        assert_eq!(
            profiles[&SocialPlatform::Linkedin],
            "https://linkedin.com/company/acme"
        );
    }
}
