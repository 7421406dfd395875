//! Stage 1: query understanding.
//!
//! Turns the ICP brief into a maps search query via the query-optimization
//! prompt, falling back to a `"{industry} in {city}"` template when the
//! model is unavailable or returns nothing usable.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use prospecting_common::Brief;

use crate::prompts::{PromptRegistry, PROMPT_QUERY_OPTIMIZATION};
use crate::providers::ProviderGateway;
use crate::stages::schema_of;

/// What the model returns. When it offers an equally good alternate, the
/// shorter of the two wins.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct QueryPlan {
    /// The single best maps search query for this brief.
    pub search_query: String,
    /// Optional location qualifier to pass alongside the query.
    #[serde(default)]
    pub search_location: Option<String>,
    /// An equally good alternate query, if one exists.
    #[serde(default)]
    pub alternate_query: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UnderstoodQuery {
    pub search_query: String,
    pub search_location: Option<String>,
    pub used_fallback: bool,
    pub warning: Option<String>,
}

pub async fn run(
    gateway: &ProviderGateway,
    prompts: &PromptRegistry,
    brief: &Brief,
    cancel: &CancellationToken,
) -> UnderstoodQuery {
    let industry = industry_term(brief);
    let location = brief
        .location
        .as_ref()
        .map(|l| l.as_search_string())
        .unwrap_or_default();
    let target = brief.target.clone().unwrap_or_default();
    let exclusions = brief.exclusions.join(", ");

    let vars = HashMap::from([
        ("industry", industry.as_str()),
        ("target", target.as_str()),
        ("location", location.as_str()),
        ("exclusions", exclusions.as_str()),
    ]);

    let rendered = match prompts.render(PROMPT_QUERY_OPTIMIZATION, &vars) {
        Ok((text, _)) => text,
        Err(e) => {
            warn!(error = %e, "Query prompt render failed, using template query");
            return fallback(brief, Some(format!("query prompt unavailable: {e}")));
        }
    };

    let completion = gateway
        .complete_json(
            "You craft precise local-business search queries.",
            &rendered,
            schema_of::<QueryPlan>(),
            cancel,
        )
        .await;

    match completion {
        Ok(completion) => match serde_json::from_value::<QueryPlan>(completion.value) {
            Ok(plan) if !plan.search_query.trim().is_empty() => {
                let search_query = pick_shorter(plan.search_query, plan.alternate_query);
                info!(query = search_query, "Query understanding complete");
                UnderstoodQuery {
                    search_query,
                    search_location: plan
                        .search_location
                        .filter(|l| !l.trim().is_empty())
                        .or_else(|| (!location.is_empty()).then(|| location.clone())),
                    used_fallback: false,
                    warning: None,
                }
            }
            Ok(_) => {
                warn!("Model returned an empty search query, using template query");
                fallback(brief, Some("model returned an empty query".to_string()))
            }
            Err(e) => {
                warn!(error = %e, "Unparseable query plan, using template query");
                fallback(brief, Some(format!("unparseable query plan: {e}")))
            }
        },
        Err(e) => {
            warn!(error = %e, "Query optimization unavailable, using template query");
            fallback(brief, Some(format!("query optimization unavailable: {e}")))
        }
    }
}

/// Template query: `"{industry} in {city}"`.
pub fn fallback(brief: &Brief, warning: Option<String>) -> UnderstoodQuery {
    let industry = industry_term(brief);
    let location = brief.location.as_ref();
    let place = location
        .and_then(|l| l.city().map(String::from))
        .or_else(|| location.map(|l| l.as_search_string()))
        .filter(|p| !p.is_empty());

    let search_query = match &place {
        Some(place) => format!("{industry} in {place}"),
        None => industry,
    };

    UnderstoodQuery {
        search_query,
        search_location: location.map(|l| l.as_search_string()),
        used_fallback: true,
        warning,
    }
}

/// The industry term, synthesized from the target description when the
/// brief has no explicit industry.
fn industry_term(brief: &Brief) -> String {
    brief
        .industry
        .clone()
        .filter(|i| !i.trim().is_empty())
        .or_else(|| brief.target.clone())
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Two equally good candidates: the shorter one wins.
fn pick_shorter(primary: String, alternate: Option<String>) -> String {
    match alternate {
        Some(alt) if !alt.trim().is_empty() && alt.len() < primary.len() => alt,
        _ => primary,
    }
}
