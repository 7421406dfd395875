use chrono::{DateTime, Utc};
use serde::Deserialize;

/// A normalized business candidate from a text search.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub place_id: String,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub rating: Option<f32>,
    pub review_count: Option<u32>,
    pub website: Option<String>,
    pub phone: Option<String>,
    pub types: Vec<String>,
}

/// A candidate augmented by a place-details lookup.
#[derive(Debug, Clone)]
pub struct DetailedCandidate {
    pub candidate: Candidate,
    pub opening_hours: Vec<String>,
    pub recent_review_dates: Vec<DateTime<Utc>>,
    pub photo_refs: Vec<String>,
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
pub(crate) struct SearchResponse {
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub results: Vec<PlaceResult>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DetailsResponse {
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
    pub result: Option<PlaceResult>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PlaceResult {
    #[serde(default)]
    pub place_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub formatted_address: Option<String>,
    #[serde(default)]
    pub rating: Option<f32>,
    #[serde(default)]
    pub user_ratings_total: Option<u32>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub formatted_phone_number: Option<String>,
    #[serde(default)]
    pub international_phone_number: Option<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub opening_hours: Option<OpeningHours>,
    #[serde(default)]
    pub reviews: Vec<Review>,
    #[serde(default)]
    pub photos: Vec<Photo>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct OpeningHours {
    #[serde(default)]
    pub weekday_text: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Review {
    /// Unix timestamp of the review.
    #[serde(default)]
    pub time: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Photo {
    #[serde(default)]
    pub photo_reference: String,
}
