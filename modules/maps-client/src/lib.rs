pub mod error;
pub mod types;

pub use error::{MapsError, Result};
pub use types::{Candidate, DetailedCandidate};

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use types::{DetailsResponse, PlaceResult, SearchResponse};

const DEFAULT_BASE_URL: &str = "https://maps.googleapis.com/maps/api/place";

const DETAILS_FIELDS: &str = "place_id,name,formatted_address,rating,user_ratings_total,\
website,formatted_phone_number,international_phone_number,types,opening_hours,reviews,photos";

pub struct MapsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl MapsClient {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to build HTTP client"),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Text search for businesses. Results are normalized and de-duplicated
    /// by place_id within the call; provider ranking order is preserved.
    pub async fn text_search(
        &self,
        query: &str,
        location: Option<&str>,
        radius_m: u32,
    ) -> Result<Vec<Candidate>> {
        debug!(query, radius_m, "Maps text search");

        let full_query = match location {
            Some(loc) if !loc.is_empty() => format!("{query} in {loc}"),
            _ => query.to_string(),
        };

        let radius = radius_m.to_string();
        let resp: SearchResponse = self
            .client
            .get(format!("{}/textsearch/json", self.base_url))
            .query(&[
                ("query", full_query.as_str()),
                ("radius", radius.as_str()),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = MapsError::from_api_status(&resp.status, resp.error_message.as_deref())
        {
            return Err(err);
        }

        let mut seen = HashSet::new();
        let candidates: Vec<Candidate> = resp
            .results
            .into_iter()
            .filter(|r| !r.place_id.is_empty() && seen.insert(r.place_id.clone()))
            .map(normalize_candidate)
            .collect();

        info!(query, count = candidates.len(), "Maps text search complete");
        Ok(candidates)
    }

    /// Fetch details for a single place.
    pub async fn place_details(&self, place_id: &str) -> Result<DetailedCandidate> {
        debug!(place_id, "Maps place details");

        let resp: DetailsResponse = self
            .client
            .get(format!("{}/details/json", self.base_url))
            .query(&[
                ("place_id", place_id),
                ("fields", DETAILS_FIELDS),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = MapsError::from_api_status(&resp.status, resp.error_message.as_deref())
        {
            return Err(err);
        }

        let result = resp.result.ok_or_else(|| MapsError::Api {
            status: "EMPTY".to_string(),
            message: format!("no details for place {place_id}"),
        })?;

        Ok(detail_candidate(result))
    }
}

fn normalize_candidate(r: PlaceResult) -> Candidate {
    let (city, state) = split_address(r.formatted_address.as_deref());
    Candidate {
        place_id: r.place_id,
        name: r.name,
        address: r.formatted_address,
        city,
        state,
        rating: r.rating,
        review_count: r.user_ratings_total,
        website: r.website,
        phone: r
            .formatted_phone_number
            .or(r.international_phone_number),
        types: r.types,
    }
}

fn detail_candidate(r: PlaceResult) -> DetailedCandidate {
    let opening_hours = r
        .opening_hours
        .as_ref()
        .map(|h| h.weekday_text.clone())
        .unwrap_or_default();
    let recent_review_dates: Vec<DateTime<Utc>> = r
        .reviews
        .iter()
        .filter_map(|rev| DateTime::<Utc>::from_timestamp(rev.time, 0))
        .collect();
    let photo_refs: Vec<String> = r
        .photos
        .iter()
        .map(|p| p.photo_reference.clone())
        .filter(|p| !p.is_empty())
        .collect();

    DetailedCandidate {
        candidate: normalize_candidate(r),
        opening_hours,
        recent_review_dates,
        photo_refs,
    }
}

/// Pull (city, state) out of a formatted address like
/// "123 Main St, Philadelphia, PA 19107, USA".
fn split_address(address: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(address) = address else {
        return (None, None);
    };
    let parts: Vec<&str> = address.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return (None, None);
    }
    // Last part is usually the country; the one before holds "STATE ZIP".
    let city = parts.get(parts.len() - 3).map(|s| s.to_string());
    let state = parts
        .get(parts.len() - 2)
        .and_then(|s| s.split_whitespace().next())
        .map(|s| s.to_string());
    (city, state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_us_address() {
        let (city, state) =
            split_address(Some("123 Main St, Philadelphia, PA 19107, USA"));
        assert_eq!(city.as_deref(), Some("Philadelphia"));
        assert_eq!(state.as_deref(), Some("PA"));
    }

    #[test]
    fn short_address_yields_nothing() {
        let (city, state) = split_address(Some("Philadelphia"));
        assert!(city.is_none());
        assert!(state.is_none());
    }

    #[test]
    fn missing_address_yields_nothing() {
        let (city, state) = split_address(None);
        assert!(city.is_none());
        assert!(state.is_none());
    }

    #[test]
    fn normalize_prefers_local_phone_format() {
        let r = PlaceResult {
            place_id: "p1".into(),
            name: "Acme".into(),
            formatted_phone_number: Some("(215) 555-0100".into()),
            international_phone_number: Some("+1 215-555-0100".into()),
            ..Default::default()
        };
        let c = normalize_candidate(r);
        assert_eq!(c.phone.as_deref(), Some("(215) 555-0100"));
    }
}
