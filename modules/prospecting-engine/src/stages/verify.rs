//! Stage 3: website verification.
//!
//! Plain HTTP fetch (up to 3 redirects) classifying the site as active,
//! down, unreachable, or a parked domain. Parking needs either a known
//! parking host or at least two textual indicators; a single indicator is
//! not enough, so legitimate sites that happen to mention their domain
//! don't trip it.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use prospecting_common::{Prospect, WebsiteStatus};

/// Hosts that serve parked-domain landers.
pub const PARKING_HOSTS: [&str; 14] = [
    "sedoparking.com",
    "sedo.com",
    "parkingcrew.net",
    "bodis.com",
    "dan.com",
    "afternic.com",
    "hugedomains.com",
    "undeveloped.com",
    "domainmarket.com",
    "buydomains.com",
    "parklogic.com",
    "above.com",
    "skenzo.com",
    "smartname.com",
];

static PARKING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)domain (?:name )?(?:is )?for sale",
        r"(?i)buy this domain",
        r"(?i)this domain (?:name )?is available",
        r"(?i)domain parking",
        r"(?i)parked (?:free,? )?(?:courtesy of|by)",
        r"(?i)this (?:web ?)?page is parked",
        r"(?i)coming soon",
        r"(?i)under construction",
        r"(?i)make an offer (?:on|for) this domain",
        r"(?i)inquire about this domain",
        r"(?i)purchase this domain",
        r"(?i)domain broker",
        r"(?i)domain (?:has )?expired",
        r"(?i)renew (?:this|your) domain",
        r"(?i)get this domain",
        r"(?i)related searches",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid parking regex"))
    .collect()
});

/// Number of distinct parking indicators present in the page text.
pub fn parking_indicator_count(text: &str) -> usize {
    PARKING_PATTERNS.iter().filter(|re| re.is_match(text)).count()
}

/// Whether the final host belongs to a known parking provider.
pub fn is_parking_host(host: &str) -> bool {
    let host = host.trim_start_matches("www.").to_lowercase();
    PARKING_HOSTS
        .iter()
        .any(|parked| host == *parked || host.ends_with(&format!(".{parked}")))
}

/// `parking ⇔ (host is a parking provider) ∨ (indicator count ≥ 2)`.
pub fn detect_parking(final_host: &str, page_text: &str) -> bool {
    is_parking_host(final_host) || parking_indicator_count(page_text) >= 2
}

/// Classify the prospect's website. A missing website is `unreachable` and
/// the prospect still proceeds through the rest of the pipeline.
pub async fn run(http: &reqwest::Client, mut prospect: Prospect) -> Prospect {
    let Some(website) = prospect.website.clone() else {
        prospect.website_status = WebsiteStatus::Unreachable;
        return prospect;
    };

    let url = if website.starts_with("http://") || website.starts_with("https://") {
        website
    } else {
        format!("https://{website}")
    };

    match http.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            let final_host = resp
                .url()
                .host_str()
                .map(String::from)
                .unwrap_or_default();

            if status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                prospect.website_status = if detect_parking(&final_host, &body) {
                    debug!(
                        company = prospect.company_name,
                        host = final_host,
                        "Website classified as a parked domain"
                    );
                    WebsiteStatus::Parking
                } else {
                    WebsiteStatus::Active
                };
            } else {
                debug!(
                    company = prospect.company_name,
                    status = status.as_u16(),
                    "Website answered with an error status"
                );
                prospect.website_status = WebsiteStatus::Down;
            }
        }
        Err(e) => {
            warn!(
                company = prospect.company_name,
                url,
                error = %e,
                "Website fetch failed"
            );
            prospect.website_status = WebsiteStatus::Unreachable;
        }
    }

    prospect
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parking_host_matches_with_and_without_subdomain() {
        assert!(is_parking_host("sedoparking.com"));
        assert!(is_parking_host("www.sedoparking.com"));
        assert!(is_parking_host("lander.sedoparking.com"));
        assert!(!is_parking_host("acmeplumbing.com"));
        assert!(!is_parking_host("notsedoparking.com"));
    }

    #[test]
    fn indicator_count_finds_distinct_patterns() {
        let text = "This domain is for sale! Make an offer on this domain today.";
        assert_eq!(parking_indicator_count(text), 2);
    }

    #[test]
    fn single_indicator_is_not_parking() {
        // A legitimate agency that happens to say "coming soon" about a feature.
        let text = "Our new booking tool is coming soon. Call us for plumbing service.";
        assert!(!detect_parking("acmeplumbing.com", text));
    }

    #[test]
    fn two_indicators_are_parking_on_any_host() {
        let text = "domain is for sale — buy this domain now";
        assert!(detect_parking("random-host.com", text));
    }

    #[test]
    fn parking_host_alone_is_parking() {
        assert!(detect_parking("sedoparking.com", "nothing suspicious here"));
    }

    #[test]
    fn clean_site_is_not_parking() {
        let text = "Acme Plumbing has served Philadelphia since 1982. Call today.";
        assert!(!detect_parking("acmeplumbing.com", text));
        assert_eq!(parking_indicator_count(text), 0);
    }

    #[tokio::test]
    async fn missing_website_is_unreachable_and_proceeds() {
        let http = reqwest::Client::new();
        let prospect = Prospect::new("No Site LLC", uuid::Uuid::new_v4());
        let out = run(&http, prospect).await;
        assert_eq!(out.website_status, WebsiteStatus::Unreachable);
    }
}
