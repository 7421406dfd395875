//! Behavioural contract for the relational store.
//!
//! The engine only ever talks to this trait; the Postgres implementation
//! lives in `prospecting-store`, and tests swap in the in-memory double
//! from [`crate::testing`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use prospecting_common::{DiscoveryQuery, ProjectConfig, Prospect};

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug, Error)]
pub enum RepoError {
    /// `google_place_id` unique index collision on insert.
    #[error("duplicate google_place_id: {0}")]
    DuplicatePlaceId(String),

    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(String),
}

/// The identity facts dedup resolves against.
#[derive(Debug, Clone, Default)]
pub struct CompanyIdentity {
    pub company_name: String,
    pub website: Option<String>,
    pub google_place_id: Option<String>,
}

/// Listing filters. `limit` is clamped to 100 by the API layer.
#[derive(Debug, Clone, Default)]
pub struct ProspectFilters {
    pub status: Option<String>,
    pub city: Option<String>,
    pub industry: Option<String>,
    pub min_rating: Option<f32>,
    pub project_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    pub recently_reviewed_within_months: Option<u32>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProspectPage {
    pub items: Vec<Prospect>,
    pub total_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_industry: BTreeMap<String, u64>,
    pub average_rating: Option<f64>,
    pub with_website: u64,
    pub with_social: u64,
}

/// Per-link provenance carried on a project/prospect association.
#[derive(Debug, Clone)]
pub struct LinkMeta {
    pub run_id: Uuid,
    pub icp_brief_snapshot: serde_json::Value,
    pub prompts_snapshot: serde_json::Value,
    pub model_selections_snapshot: serde_json::Value,
    pub relevance_reasoning: String,
    pub discovery_cost_usd: f64,
    pub discovery_time_ms: u64,
}

#[async_trait]
pub trait ProspectRepo: Send + Sync {
    // --- Prospect lookups ---

    async fn find_by_place_id(&self, place_id: &str) -> RepoResult<Option<Prospect>>;

    /// Lookup by pre-normalized website (see `dedup::normalize_website`).
    async fn find_by_website_norm(&self, website_norm: &str) -> RepoResult<Option<Prospect>>;

    /// Lookup by pre-normalized company name (see `dedup::normalize_company_name`).
    async fn find_by_company_norm(&self, company_norm: &str) -> RepoResult<Option<Prospect>>;

    async fn get_prospect(&self, id: Uuid) -> RepoResult<Option<Prospect>>;

    // --- Prospect writes ---

    /// Insert; fails with `DuplicatePlaceId` when the unique index collides.
    async fn insert_prospect(&self, prospect: &Prospect) -> RepoResult<Uuid>;

    /// Partial update of top-level fields; bumps `updated_at`.
    async fn update_prospect_fields(
        &self,
        id: Uuid,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> RepoResult<()>;

    // --- Project links ---

    /// Idempotent: a `(project_id, prospect_id)` unique violation is
    /// swallowed, leaving the original link untouched.
    async fn link_prospect_to_project(
        &self,
        prospect_id: Uuid,
        project_id: Uuid,
        meta: &LinkMeta,
    ) -> RepoResult<()>;

    async fn exists_in_project(&self, prospect_id: Uuid, project_id: Uuid) -> RepoResult<bool>;

    // --- Listing / stats ---

    async fn list_prospects(&self, filters: &ProspectFilters) -> RepoResult<ProspectPage>;

    async fn aggregate_stats(&self) -> RepoResult<AggregateStats>;

    // --- Project config (first-run lock) ---

    async fn get_project_config(&self, project_id: Uuid) -> RepoResult<ProjectConfig>;

    /// Write-if-absent: only fields currently null on the project row are
    /// written; existing values always win.
    async fn save_project_icp_and_prompts(
        &self,
        project_id: Uuid,
        icp_brief: &serde_json::Value,
        prompts: &serde_json::Value,
    ) -> RepoResult<()>;

    /// Write-if-absent for the model selections column.
    async fn save_prospecting_config(
        &self,
        project_id: Uuid,
        model_selections: &serde_json::Value,
    ) -> RepoResult<()>;

    // --- Discovery query history ---

    async fn save_discovery_query(&self, query: &DiscoveryQuery) -> RepoResult<()>;

    async fn list_previous_queries(
        &self,
        project_id: Uuid,
        limit: u32,
    ) -> RepoResult<Vec<DiscoveryQuery>>;

    async fn query_exists(&self, project_id: Uuid, query: &str) -> RepoResult<bool>;
}
