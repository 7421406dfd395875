//! Stage 7: relevance scoring.
//!
//! Primary path: the relevance prompt through the text model, validated
//! against the component caps (industry 40, location 20, quality 20,
//! online presence 10, completeness 10) and the sum-equals-score rule.
//! Any validation or provider failure falls back to the rule-based scorer,
//! so every prospect leaves this stage scored.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use prospecting_common::{Brief, Prospect, ScoreBreakdown, WebsiteStatus, RELEVANCE_THRESHOLD};

use crate::prompts::{PromptRegistry, PROMPT_RELEVANCE};
use crate::providers::ProviderGateway;
use crate::stages::schema_of;

/// Industries considered related for partial industry credit.
const RELATED_INDUSTRIES: &[(&str, &[&str])] = &[
    ("plumbing", &["hvac", "heating", "drain", "contractor"]),
    ("restaurant", &["cafe", "bistro", "catering", "food", "pizzeria"]),
    ("landscaping", &["lawn", "garden", "tree service", "hardscape"]),
    ("dentist", &["dental", "orthodontist", "oral surgery"]),
    ("gym", &["fitness", "yoga", "crossfit", "pilates"]),
    ("salon", &["barber", "spa", "beauty", "hair"]),
    ("law", &["attorney", "legal", "lawyer"]),
    ("real estate", &["realtor", "property management", "brokerage"]),
];

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RelevanceResponse {
    /// Total score; must equal the sum of the breakdown components.
    pub score: u32,
    pub breakdown: ScoreBreakdown,
    pub reasoning: String,
}

impl RelevanceResponse {
    /// Component caps and the sum rule.
    pub fn is_valid(&self) -> bool {
        self.breakdown.within_caps() && self.breakdown.total() == self.score && self.score <= 100
    }
}

/// Score the prospect against the brief.
pub async fn run(
    gateway: &ProviderGateway,
    prompts: &PromptRegistry,
    brief: &Brief,
    mut prospect: Prospect,
    cancel: &CancellationToken,
) -> (Prospect, Option<String>) {
    let mut warning = None;

    let scored = if prospect.website_status == WebsiteStatus::Parking {
        // A parked lander has no real content worth a model's judgement.
        None
    } else if gateway.quota_tripped("llm.text") {
        warning = Some("text model quota exhausted; scored with rules".to_string());
        None
    } else {
        match llm_score(gateway, prompts, brief, &prospect, cancel).await {
            Ok(response) if response.is_valid() => Some(response),
            Ok(response) => {
                warn!(
                    company = prospect.company_name,
                    score = response.score,
                    "Relevance response failed validation; scoring with rules"
                );
                warning = Some("model breakdown failed validation; scored with rules".to_string());
                None
            }
            Err(e) => {
                warn!(company = prospect.company_name, error = %e, "Relevance scoring unavailable");
                warning = Some(format!("relevance model unavailable: {e}; scored with rules"));
                None
            }
        }
    };

    let (score, breakdown, reasoning) = match scored {
        Some(response) => (response.score, response.breakdown, response.reasoning),
        None => rule_based_score(brief, &prospect),
    };

    prospect.icp_match_score = score;
    prospect.is_relevant = score >= RELEVANCE_THRESHOLD;
    prospect.relevance_reasoning = reasoning;
    prospect.score_breakdown = Some(breakdown);

    debug!(
        company = prospect.company_name,
        score,
        relevant = prospect.is_relevant,
        "Relevance scoring complete"
    );
    (prospect, warning)
}

async fn llm_score(
    gateway: &ProviderGateway,
    prompts: &PromptRegistry,
    brief: &Brief,
    prospect: &Prospect,
    cancel: &CancellationToken,
) -> anyhow::Result<RelevanceResponse> {
    let industry = brief.industry.clone().unwrap_or_default();
    let target = brief.target.clone().unwrap_or_default();
    let location = brief
        .location
        .as_ref()
        .map(|l| l.as_search_string())
        .unwrap_or_default();
    let profile = company_profile(prospect);

    let vars = HashMap::from([
        ("industry", industry.as_str()),
        ("target", target.as_str()),
        ("location", location.as_str()),
        ("company_profile", profile.as_str()),
    ]);
    let (prompt, _) = prompts.render(PROMPT_RELEVANCE, &vars)?;

    let completion = gateway
        .complete_json(
            "You score how well a business matches an ideal customer profile.",
            &prompt,
            schema_of::<RelevanceResponse>(),
            cancel,
        )
        .await?;
    Ok(serde_json::from_value(completion.value)?)
}

/// The enriched facts the model scores against, as compact JSON.
fn company_profile(prospect: &Prospect) -> String {
    serde_json::json!({
        "company_name": prospect.company_name,
        "address": prospect.address,
        "city": prospect.city,
        "state": prospect.state,
        "website": prospect.website,
        "website_status": prospect.website_status,
        "description": prospect.description,
        "services": prospect.services,
        "google_rating": prospect.google_rating,
        "google_review_count": prospect.google_review_count,
        "contact_email": prospect.contact_email.is_some(),
        "contact_phone": prospect.contact_phone.is_some(),
        "social_profiles": prospect.social_profiles.keys().map(|p| p.to_string()).collect::<Vec<_>>(),
    })
    .to_string()
}

/// Deterministic fallback scorer.
pub fn rule_based_score(brief: &Brief, prospect: &Prospect) -> (u32, ScoreBreakdown, String) {
    let breakdown = ScoreBreakdown {
        industry_match: industry_points(brief, prospect),
        location_match: location_points(brief, prospect),
        quality: quality_points(prospect),
        online_presence: presence_points(prospect),
        data_completeness: completeness_points(prospect),
    };
    let score = breakdown.total();
    let reasoning = format!(
        "Rule-based: industry {}/40, location {}/20, quality {}/20, online presence {}/10, completeness {}/10.",
        breakdown.industry_match,
        breakdown.location_match,
        breakdown.quality,
        breakdown.online_presence,
        breakdown.data_completeness,
    );
    (score, breakdown, reasoning)
}

/// Exact substring 40; related via the configured map 25; else 10.
fn industry_points(brief: &Brief, prospect: &Prospect) -> u32 {
    let Some(wanted) = brief
        .industry
        .as_deref()
        .or(brief.target.as_deref())
        .map(str::to_lowercase)
    else {
        return 10;
    };

    let haystack = format!(
        "{} {} {} {}",
        prospect.company_name,
        prospect.industry.as_deref().unwrap_or_default(),
        prospect.description.as_deref().unwrap_or_default(),
        prospect.services.join(" "),
    )
    .to_lowercase();

    // Exact: any word of the wanted industry term appears in the profile.
    if wanted
        .split_whitespace()
        .any(|word| word.len() >= 4 && haystack.contains(word))
    {
        return 40;
    }

    for (key, related) in RELATED_INDUSTRIES {
        if wanted.contains(key) && related.iter().any(|r| haystack.contains(r)) {
            return 25;
        }
    }

    10
}

/// Same city 20; same state 12; same country 6; else 0. The maps search
/// is country-scoped, so an address at all counts as same-country.
fn location_points(brief: &Brief, prospect: &Prospect) -> u32 {
    let Some(location) = brief.location.as_ref() else {
        return 0;
    };

    let same_city = match (location.city(), prospect.city.as_deref()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b.trim()),
        _ => false,
    };
    if same_city {
        return 20;
    }

    let same_state = match (location.state(), prospect.state.as_deref()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b.trim()),
        _ => false,
    };
    if same_state {
        return 12;
    }

    if prospect.address.is_some() {
        return 6;
    }
    0
}

/// `round(min(rating, 5) × 4)`, zero when unrated.
fn quality_points(prospect: &Prospect) -> u32 {
    match prospect.google_rating {
        Some(rating) => (rating.min(5.0) * 4.0).round() as u32,
        None => 0,
    }
}

/// `2×(has website) + 2×min(profile count, 4)`.
fn presence_points(prospect: &Prospect) -> u32 {
    let website = if prospect.website.is_some() { 2 } else { 0 };
    website + 2 * (prospect.social_profiles.len() as u32).min(4)
}

/// Two points per populated contact/identity field, capped at 10.
fn completeness_points(prospect: &Prospect) -> u32 {
    let mut points = 0;
    if prospect.contact_email.is_some() {
        points += 2;
    }
    if prospect.contact_phone.is_some() {
        points += 2;
    }
    if prospect.description.is_some() {
        points += 2;
    }
    if !prospect.services.is_empty() {
        points += 2;
    }
    if prospect.address.is_some() {
        points += 2;
    }
    points.min(10)
}
