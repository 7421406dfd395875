use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

// --- Brief (run input) ---

/// Location part of an ICP brief. Accepts either a freeform string
/// ("Philadelphia, PA") or structured parts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum BriefLocation {
    Freeform(String),
    Parts {
        #[serde(default)]
        city: Option<String>,
        #[serde(default)]
        state: Option<String>,
        #[serde(default)]
        country: Option<String>,
        #[serde(default)]
        zip: Option<String>,
    },
}

impl BriefLocation {
    /// Render the location as a single search string.
    pub fn as_search_string(&self) -> String {
        match self {
            BriefLocation::Freeform(s) => s.clone(),
            BriefLocation::Parts {
                city,
                state,
                country,
                zip,
            } => {
                let mut parts = Vec::new();
                if let Some(c) = city {
                    parts.push(c.as_str());
                }
                if let Some(s) = state {
                    parts.push(s.as_str());
                }
                if let Some(c) = country {
                    parts.push(c.as_str());
                }
                if let Some(z) = zip {
                    parts.push(z.as_str());
                }
                parts.join(", ")
            }
        }
    }

    pub fn city(&self) -> Option<&str> {
        match self {
            BriefLocation::Freeform(s) => s.split(',').next().map(str::trim),
            BriefLocation::Parts { city, .. } => city.as_deref(),
        }
    }

    pub fn state(&self) -> Option<&str> {
        match self {
            BriefLocation::Freeform(s) => s.split(',').nth(1).map(str::trim),
            BriefLocation::Parts { state, .. } => state.as_deref(),
        }
    }
}

fn default_radius_m() -> u32 {
    10_000
}

/// Ideal customer profile brief — the structured intent for a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Brief {
    #[serde(default)]
    pub industry: Option<String>,
    /// Natural-language description of the target customer.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub location: Option<BriefLocation>,
    #[serde(default = "default_radius_m")]
    pub radius_m: u32,
    #[serde(default)]
    pub min_rating: f32,
    /// Desired number of prospects, 1..=60.
    pub count: u32,
    #[serde(default)]
    pub exclusions: Vec<String>,
    #[serde(default)]
    pub additional_criteria: serde_json::Map<String, serde_json::Value>,
}

impl Brief {
    /// Validate run-start preconditions. Failures here are fatal (§7 Input).
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.industry.as_deref().map_or(true, str::is_empty)
            && self.target.as_deref().map_or(true, str::is_empty)
        {
            return Err(EngineError::Input(
                "brief requires at least one of `industry` or `target`".into(),
            ));
        }
        if !(1..=60).contains(&self.count) {
            return Err(EngineError::Input(format!(
                "count must be between 1 and 60, got {}",
                self.count
            )));
        }
        Ok(())
    }
}

// --- Run options ---

fn default_true() -> bool {
    true
}

fn default_browser_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrent() -> u32 {
    5
}

fn default_request_delay_ms() -> u64 {
    1_000
}

/// Per-run feature toggles and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default = "default_true")]
    pub scrape_websites: bool,
    #[serde(default = "default_true")]
    pub use_vision_fallback: bool,
    #[serde(default = "default_true")]
    pub scrape_social: bool,
    #[serde(default = "default_true")]
    pub check_relevance: bool,
    #[serde(default)]
    pub filter_irrelevant: bool,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default = "default_browser_timeout_ms")]
    pub browser_timeout_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            scrape_websites: true,
            use_vision_fallback: true,
            scrape_social: true,
            check_relevance: true,
            filter_irrelevant: false,
            project_id: None,
            browser_timeout_ms: default_browser_timeout_ms(),
            max_concurrent: default_max_concurrent(),
            request_delay_ms: default_request_delay_ms(),
        }
    }
}

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WebsiteStatus {
    Active,
    Down,
    Unreachable,
    Parking,
}

impl std::fmt::Display for WebsiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebsiteStatus::Active => write!(f, "active"),
            WebsiteStatus::Down => write!(f, "down"),
            WebsiteStatus::Unreachable => write!(f, "unreachable"),
            WebsiteStatus::Parking => write!(f, "parking"),
        }
    }
}

impl std::str::FromStr for WebsiteStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "down" => Ok(Self::Down),
            "unreachable" => Ok(Self::Unreachable),
            "parking" => Ok(Self::Parking),
            other => Err(format!("unknown WebsiteStatus: {other}")),
        }
    }
}

/// Prospect lifecycle. `Analyzed` and `Contacted` records belong to the
/// downstream analysis/outreach subsystems and are immutable to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProspectStatus {
    Prospected,
    Analyzed,
    Contacted,
}

impl std::fmt::Display for ProspectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProspectStatus::Prospected => write!(f, "prospected"),
            ProspectStatus::Analyzed => write!(f, "analyzed"),
            ProspectStatus::Contacted => write!(f, "contacted"),
        }
    }
}

impl std::str::FromStr for ProspectStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "prospected" => Ok(Self::Prospected),
            "analyzed" => Ok(Self::Analyzed),
            "contacted" => Ok(Self::Contacted),
            other => Err(format!("unknown ProspectStatus: {other}")),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum SocialPlatform {
    Instagram,
    Facebook,
    Linkedin,
    Twitter,
    Youtube,
    Tiktok,
}

impl SocialPlatform {
    pub const ALL: [SocialPlatform; 6] = [
        SocialPlatform::Instagram,
        SocialPlatform::Facebook,
        SocialPlatform::Linkedin,
        SocialPlatform::Twitter,
        SocialPlatform::Youtube,
        SocialPlatform::Tiktok,
    ];

    /// Canonical hosts for profile URLs on this platform.
    pub fn canonical_hosts(&self) -> &'static [&'static str] {
        match self {
            SocialPlatform::Instagram => &["instagram.com"],
            SocialPlatform::Facebook => &["facebook.com", "fb.com"],
            SocialPlatform::Linkedin => &["linkedin.com"],
            SocialPlatform::Twitter => &["twitter.com", "x.com"],
            SocialPlatform::Youtube => &["youtube.com", "youtu.be"],
            SocialPlatform::Tiktok => &["tiktok.com"],
        }
    }
}

impl std::fmt::Display for SocialPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocialPlatform::Instagram => write!(f, "instagram"),
            SocialPlatform::Facebook => write!(f, "facebook"),
            SocialPlatform::Linkedin => write!(f, "linkedin"),
            SocialPlatform::Twitter => write!(f, "twitter"),
            SocialPlatform::Youtube => write!(f, "youtube"),
            SocialPlatform::Tiktok => write!(f, "tiktok"),
        }
    }
}

impl std::str::FromStr for SocialPlatform {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "instagram" => Ok(Self::Instagram),
            "facebook" => Ok(Self::Facebook),
            "linkedin" => Ok(Self::Linkedin),
            "twitter" | "x" => Ok(Self::Twitter),
            "youtube" => Ok(Self::Youtube),
            "tiktok" => Ok(Self::Tiktok),
            other => Err(format!("unknown SocialPlatform: {other}")),
        }
    }
}

// --- Social metadata ---

/// Public profile metadata scraped from Open Graph / meta tags only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SocialProfileMeta {
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub image_url: Option<String>,
}

// --- Relevance scoring ---

/// Component breakdown of the ICP match score. Caps: industry 40,
/// location 20, quality 20, online presence 10, completeness 10.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ScoreBreakdown {
    pub industry_match: u32,
    pub location_match: u32,
    pub quality: u32,
    pub online_presence: u32,
    pub data_completeness: u32,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u32 {
        self.industry_match
            + self.location_match
            + self.quality
            + self.online_presence
            + self.data_completeness
    }

    /// Whether each component respects its cap.
    pub fn within_caps(&self) -> bool {
        self.industry_match <= 40
            && self.location_match <= 20
            && self.quality <= 20
            && self.online_presence <= 10
            && self.data_completeness <= 10
    }
}

/// Score at or above which a prospect is considered relevant to the brief.
pub const RELEVANCE_THRESHOLD: u32 = 60;

// --- Prospect ---

/// A discovered, enriched business candidate. The central entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prospect {
    // Identity
    pub id: Uuid,
    /// Strong dedup key — globally unique when present.
    pub google_place_id: Option<String>,

    // Business
    pub company_name: String,
    pub industry: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub website: Option<String>,
    pub website_status: WebsiteStatus,

    // Contact
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,

    // Maps data
    pub google_rating: Option<f32>,
    pub google_review_count: Option<u32>,
    pub most_recent_review_date: Option<DateTime<Utc>>,

    // Social
    #[serde(default)]
    pub social_profiles: BTreeMap<SocialPlatform, String>,
    #[serde(default)]
    pub social_metadata: BTreeMap<SocialPlatform, SocialProfileMeta>,

    // Scoring
    pub icp_match_score: u32,
    pub is_relevant: bool,
    pub relevance_reasoning: String,
    pub score_breakdown: Option<ScoreBreakdown>,

    // Provenance
    pub run_id: Uuid,
    pub source: String,
    pub status: ProspectStatus,
    pub icp_brief_snapshot: serde_json::Value,
    pub prompts_snapshot: serde_json::Value,
    pub model_selections_snapshot: serde_json::Value,
    pub discovery_cost_usd: f64,
    pub discovery_time_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Prospect {
    /// A fresh prospect for a maps candidate, before enrichment.
    pub fn new(company_name: &str, run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            google_place_id: None,
            company_name: company_name.to_string(),
            industry: None,
            address: None,
            city: None,
            state: None,
            website: None,
            website_status: WebsiteStatus::Unreachable,
            contact_email: None,
            contact_phone: None,
            contact_name: None,
            description: None,
            services: Vec::new(),
            google_rating: None,
            google_review_count: None,
            most_recent_review_date: None,
            social_profiles: BTreeMap::new(),
            social_metadata: BTreeMap::new(),
            icp_match_score: 0,
            is_relevant: false,
            relevance_reasoning: String::new(),
            score_breakdown: None,
            run_id,
            source: "prospecting-engine".to_string(),
            status: ProspectStatus::Prospected,
            icp_brief_snapshot: serde_json::Value::Null,
            prompts_snapshot: serde_json::Value::Null,
            model_selections_snapshot: serde_json::Value::Null,
            discovery_cost_usd: 0.0,
            discovery_time_ms: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

// --- Project link ---

/// Join row between a project and a globally unique prospect.
/// `(project_id, prospect_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectProspect {
    pub project_id: Uuid,
    pub prospect_id: Uuid,
    pub run_id: Uuid,
    pub icp_brief_snapshot: serde_json::Value,
    pub prompts_snapshot: serde_json::Value,
    pub model_selections_snapshot: serde_json::Value,
    pub relevance_reasoning: String,
    pub discovery_cost_usd: f64,
    pub discovery_time_ms: u64,
    pub status: ProspectStatus,
    pub added_at: DateTime<Utc>,
}

/// Project-level prospecting configuration. Any null field is written
/// exactly once by the first run that has a value for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub icp_brief: Option<serde_json::Value>,
    pub prospecting_prompts: Option<serde_json::Value>,
    pub prospecting_model_selections: Option<serde_json::Value>,
}

// --- Discovery query history ---

/// One executed maps search, recorded for iterative re-runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    pub project_id: Option<Uuid>,
    pub query: String,
    pub search_location: Option<String>,
    pub iteration: u32,
    pub strategy: String,
    pub total_results: u32,
    pub unique_results: u32,
    pub new_prospects_added: u32,
    pub executed_at: DateTime<Utc>,
}

// --- Run summary ---

/// Final counts attached to the `complete` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub prospects_found: u32,
    pub prospects_enriched: u32,
    pub prospects_persisted: u32,
    pub websites_scraped: u32,
    pub emails_found: u32,
    pub phones_found: u32,
    pub social_profiles_found: u32,
    pub average_icp_score: f64,
    pub total_cost_usd: f64,
    pub total_time_ms: u64,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Prospecting Run Complete ===")?;
        writeln!(f, "Prospects found:     {}", self.prospects_found)?;
        writeln!(f, "Prospects enriched:  {}", self.prospects_enriched)?;
        writeln!(f, "Prospects persisted: {}", self.prospects_persisted)?;
        writeln!(f, "Websites scraped:    {}", self.websites_scraped)?;
        writeln!(f, "Emails found:        {}", self.emails_found)?;
        writeln!(f, "Phones found:        {}", self.phones_found)?;
        writeln!(f, "Social profiles:     {}", self.social_profiles_found)?;
        writeln!(f, "Average ICP score:   {:.1}", self.average_icp_score)?;
        writeln!(f, "Total cost:          ${:.4}", self.total_cost_usd)?;
        writeln!(f, "Total time:          {}ms", self.total_time_ms)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brief(industry: Option<&str>, target: Option<&str>, count: u32) -> Brief {
        Brief {
            industry: industry.map(String::from),
            target: target.map(String::from),
            location: None,
            radius_m: default_radius_m(),
            min_rating: 0.0,
            count,
            exclusions: Vec::new(),
            additional_criteria: serde_json::Map::new(),
        }
    }

    #[test]
    fn brief_requires_industry_or_target() {
        assert!(brief(None, None, 5).validate().is_err());
        assert!(brief(Some("plumbers"), None, 5).validate().is_ok());
        assert!(brief(None, Some("local plumbing companies"), 5).validate().is_ok());
    }

    #[test]
    fn brief_empty_strings_count_as_missing() {
        assert!(brief(Some(""), Some(""), 5).validate().is_err());
    }

    #[test]
    fn brief_count_bounds() {
        assert!(brief(Some("x"), None, 0).validate().is_err());
        assert!(brief(Some("x"), None, 61).validate().is_err());
        assert!(brief(Some("x"), None, 1).validate().is_ok());
        assert!(brief(Some("x"), None, 60).validate().is_ok());
    }

    #[test]
    fn brief_location_deserializes_both_shapes() {
        let freeform: Brief =
            serde_json::from_str(r#"{"industry":"cafes","location":"Austin, TX","count":3}"#)
                .unwrap();
        assert_eq!(
            freeform.location.unwrap().as_search_string(),
            "Austin, TX"
        );

        let parts: Brief = serde_json::from_str(
            r#"{"industry":"cafes","location":{"city":"Austin","state":"TX"},"count":3}"#,
        )
        .unwrap();
        let loc = parts.location.unwrap();
        assert_eq!(loc.city(), Some("Austin"));
        assert_eq!(loc.as_search_string(), "Austin, TX");
    }

    #[test]
    fn brief_defaults_applied() {
        let b: Brief = serde_json::from_str(r#"{"industry":"cafes","count":3}"#).unwrap();
        assert_eq!(b.radius_m, 10_000);
        assert_eq!(b.min_rating, 0.0);
        assert!(b.exclusions.is_empty());
    }

    #[test]
    fn run_options_defaults() {
        let opts: RunOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.scrape_websites);
        assert!(opts.use_vision_fallback);
        assert!(!opts.filter_irrelevant);
        assert_eq!(opts.browser_timeout_ms, 30_000);
        assert_eq!(opts.request_delay_ms, 1_000);
    }

    #[test]
    fn breakdown_total_and_caps() {
        let b = ScoreBreakdown {
            industry_match: 40,
            location_match: 20,
            quality: 20,
            online_presence: 10,
            data_completeness: 10,
        };
        assert_eq!(b.total(), 100);
        assert!(b.within_caps());

        let over = ScoreBreakdown {
            industry_match: 41,
            ..Default::default()
        };
        assert!(!over.within_caps());
    }

    #[test]
    fn social_platform_round_trips_as_map_key() {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            SocialPlatform::Instagram,
            "https://instagram.com/acme".to_string(),
        );
        let json = serde_json::to_string(&profiles).unwrap();
        assert!(json.contains("\"instagram\""));
        let back: BTreeMap<SocialPlatform, String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, profiles);
    }

    #[test]
    fn prospect_new_has_stable_defaults() {
        let run_id = Uuid::new_v4();
        let p = Prospect::new("Acme Plumbing", run_id);
        assert_eq!(p.source, "prospecting-engine");
        assert_eq!(p.status, ProspectStatus::Prospected);
        assert_eq!(p.website_status, WebsiteStatus::Unreachable);
        assert_eq!(p.run_id, run_id);
        assert!(!p.is_relevant);
    }
}
