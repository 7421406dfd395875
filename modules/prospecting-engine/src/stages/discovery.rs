//! Stage 2: maps discovery.
//!
//! One batch: text search, quality filtering, bounded place-details
//! enrichment, and within-batch place_id dedup. Provider ranking is
//! preserved; neighbours that tie on rating are ordered by review count.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use maps_client::{Candidate, DetailedCandidate};
use prospecting_common::{Brief, ProviderError};

use crate::providers::ProviderGateway;

#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    pub candidates: Vec<DetailedCandidate>,
    /// Raw result count from the provider, pre-filtering.
    pub total_results: u32,
    /// Candidates that survived filtering and dedup.
    pub unique_results: u32,
}

/// Run one discovery batch. `details_budget` bounds how many place-details
/// calls are spent, which the orchestrator derives from the remaining
/// per-run target.
#[allow(clippy::too_many_arguments)]
pub async fn run_batch(
    gateway: &ProviderGateway,
    brief: &Brief,
    query: &str,
    search_location: Option<&str>,
    details_budget: usize,
    seen_place_ids: &mut HashSet<String>,
    cancel: &CancellationToken,
) -> Result<DiscoveryOutcome, ProviderError> {
    let raw = gateway
        .text_search(query, search_location, brief.radius_m, cancel)
        .await?;
    let total_results = raw.len() as u32;

    let mut filtered = filter_candidates(raw, brief, seen_place_ids);
    order_ties_by_review_count(&mut filtered);
    let unique_results = filtered.len() as u32;

    let mut candidates = Vec::new();
    for candidate in filtered.into_iter().take(details_budget) {
        match gateway.place_details(&candidate.place_id, cancel).await {
            Ok(detailed) => candidates.push(detailed),
            Err(ProviderError::QuotaExceeded(p)) => {
                return Err(ProviderError::QuotaExceeded(p));
            }
            Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
            Err(e) => {
                // Details are an enrichment; the shallow candidate still counts.
                warn!(
                    place_id = candidate.place_id,
                    error = %e,
                    "Place details failed, keeping shallow candidate"
                );
                candidates.push(DetailedCandidate {
                    candidate,
                    opening_hours: Vec::new(),
                    recent_review_dates: Vec::new(),
                    photo_refs: Vec::new(),
                });
            }
        }
    }

    info!(
        query,
        total_results,
        unique_results,
        enriched = candidates.len(),
        "Discovery batch complete"
    );

    Ok(DiscoveryOutcome {
        candidates,
        total_results,
        unique_results,
    })
}

/// Quality + identity filtering: within-batch and cross-batch place_id
/// dedup, the brief's rating floor (only when a rating is present), the
/// website-or-phone requirement, and name exclusions.
fn filter_candidates(
    raw: Vec<Candidate>,
    brief: &Brief,
    seen_place_ids: &mut HashSet<String>,
) -> Vec<Candidate> {
    let exclusions: Vec<String> = brief
        .exclusions
        .iter()
        .map(|e| e.to_lowercase())
        .collect();

    raw.into_iter()
        .filter(|c| seen_place_ids.insert(c.place_id.clone()))
        .filter(|c| match c.rating {
            Some(rating) => rating >= brief.min_rating,
            None => true,
        })
        .filter(|c| c.website.is_some() || c.phone.is_some())
        .filter(|c| {
            let name = c.name.to_lowercase();
            !exclusions.iter().any(|e| !e.is_empty() && name.contains(e))
        })
        .collect()
}

/// Preserve provider ranking; when neighbours tie on rating, the one with
/// more reviews goes first.
fn order_ties_by_review_count(candidates: &mut [Candidate]) {
    let mut i = 1;
    while i < candidates.len() {
        let tie = candidates[i - 1].rating == candidates[i].rating;
        if tie
            && candidates[i].review_count.unwrap_or(0)
                > candidates[i - 1].review_count.unwrap_or(0)
        {
            candidates.swap(i - 1, i);
            if i > 1 {
                i -= 1;
                continue;
            }
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(place_id: &str, name: &str, rating: Option<f32>, reviews: Option<u32>) -> Candidate {
        Candidate {
            place_id: place_id.to_string(),
            name: name.to_string(),
            address: None,
            city: None,
            state: None,
            rating,
            review_count: reviews,
            website: Some(format!("https://{place_id}.example")),
            phone: None,
            types: Vec::new(),
        }
    }

    fn brief_with(min_rating: f32, exclusions: &[&str]) -> Brief {
        serde_json::from_value(serde_json::json!({
            "industry": "plumbers",
            "min_rating": min_rating,
            "exclusions": exclusions,
            "count": 10,
        }))
        .unwrap()
    }

    #[test]
    fn rating_floor_excludes_only_rated_candidates_below_it() {
        let mut seen = HashSet::new();
        let raw = vec![
            candidate("a", "High", Some(4.8), None),
            candidate("b", "Low", Some(3.9), None),
            candidate("c", "Unrated", None, None),
        ];
        let kept = filter_candidates(raw, &brief_with(4.0, &[]), &mut seen);
        let names: Vec<_> = kept.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["High", "Unrated"]);
    }

    #[test]
    fn max_rating_floor_excludes_everything_below_five() {
        let mut seen = HashSet::new();
        let raw = vec![
            candidate("a", "Perfect", Some(5.0), None),
            candidate("b", "Great", Some(4.9), None),
        ];
        let kept = filter_candidates(raw, &brief_with(5.0, &[]), &mut seen);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "Perfect");
    }

    #[test]
    fn candidates_without_website_or_phone_are_dropped() {
        let mut seen = HashSet::new();
        let mut bare = candidate("a", "Ghost", Some(4.5), None);
        bare.website = None;
        bare.phone = None;
        let mut phone_only = candidate("b", "Phone Co", Some(4.5), None);
        phone_only.website = None;
        phone_only.phone = Some("555-0100".to_string());

        let kept = filter_candidates(vec![bare, phone_only], &brief_with(0.0, &[]), &mut seen);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "Phone Co");
    }

    #[test]
    fn place_id_dedup_spans_batches() {
        let mut seen = HashSet::new();
        let first = filter_candidates(
            vec![candidate("a", "Acme", Some(4.5), None)],
            &brief_with(0.0, &[]),
            &mut seen,
        );
        assert_eq!(first.len(), 1);

        let second = filter_candidates(
            vec![
                candidate("a", "Acme", Some(4.5), None),
                candidate("b", "Bravo", Some(4.5), None),
            ],
            &brief_with(0.0, &[]),
            &mut seen,
        );
        let names: Vec<_> = second.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Bravo"]);
    }

    #[test]
    fn exclusions_match_name_case_insensitively() {
        let mut seen = HashSet::new();
        let kept = filter_candidates(
            vec![
                candidate("a", "Acme Franchise Plumbing", Some(4.5), None),
                candidate("b", "Local Plumbing", Some(4.5), None),
            ],
            &brief_with(0.0, &["franchise"]),
            &mut seen,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "Local Plumbing");
    }

    #[test]
    fn rating_ties_prefer_more_reviews() {
        let mut candidates = vec![
            candidate("a", "First", Some(4.5), Some(10)),
            candidate("b", "Second", Some(4.5), Some(200)),
            candidate("c", "Third", Some(4.0), Some(999)),
        ];
        order_ties_by_review_count(&mut candidates);
        let names: Vec<_> = candidates.iter().map(|c| c.name.as_str()).collect();
        // The 4.5 tie reorders; the 4.0 stays behind regardless of reviews.
        assert_eq!(names, vec!["Second", "First", "Third"]);
    }

    #[test]
    fn provider_order_preserved_without_ties() {
        let mut candidates = vec![
            candidate("a", "First", Some(4.9), Some(5)),
            candidate("b", "Second", Some(4.1), Some(500)),
        ];
        order_ties_by_review_count(&mut candidates);
        let names: Vec<_> = candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["First", "Second"]);
    }
}
