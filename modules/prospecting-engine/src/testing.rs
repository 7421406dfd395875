//! Deterministic provider stubs and an in-memory repository for tests.
//!
//! Everything here is swap-in via the same seams the real clients use, so
//! scenario tests drive the full orchestrator without touching the
//! network or a database.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use ai_client::Completion;
use browserless_client::{RenderedPage, Viewport};
use maps_client::{Candidate, DetailedCandidate};
use prospecting_common::{DiscoveryQuery, ProjectConfig, Prospect, ProviderError};

use crate::dedup::{normalize_company_name, normalize_website};
use crate::prompts::{PromptFile, PromptRegistry};
use crate::providers::{
    BrowserDriver, MapsProvider, NoopWebSearcher, ProviderSet, SearchHit, TextModel, VisionModel,
    WebSearcher,
};
use crate::repo::{
    AggregateStats, LinkMeta, ProspectFilters, ProspectPage, ProspectRepo, RepoError, RepoResult,
};

// --- Candidate helpers ---

pub fn candidate(place_id: &str, name: &str, website: Option<&str>) -> DetailedCandidate {
    DetailedCandidate {
        candidate: Candidate {
            place_id: place_id.to_string(),
            name: name.to_string(),
            address: Some("1 Main St, Philadelphia, PA 19107, USA".to_string()),
            city: Some("Philadelphia".to_string()),
            state: Some("PA".to_string()),
            rating: Some(4.5),
            review_count: Some(120),
            website: website.map(String::from),
            phone: Some("(215) 555-0100".to_string()),
            types: vec!["restaurant".to_string()],
        },
        opening_hours: Vec::new(),
        recent_review_dates: vec![Utc::now()],
        photo_refs: Vec::new(),
    }
}

// --- Maps stub ---

pub struct StubMaps {
    results: Vec<DetailedCandidate>,
    search_error: Mutex<Option<ProviderError>>,
}

impl StubMaps {
    pub fn new(results: Vec<DetailedCandidate>) -> Self {
        Self {
            results,
            search_error: Mutex::new(None),
        }
    }

    pub fn failing(error: ProviderError) -> Self {
        Self {
            results: Vec::new(),
            search_error: Mutex::new(Some(error)),
        }
    }
}

#[async_trait]
impl MapsProvider for StubMaps {
    async fn text_search(
        &self,
        _query: &str,
        _location: Option<&str>,
        _radius_m: u32,
    ) -> Result<Vec<Candidate>, ProviderError> {
        if let Some(err) = self.search_error.lock().expect("stub lock").clone() {
            return Err(err);
        }
        Ok(self.results.iter().map(|d| d.candidate.clone()).collect())
    }

    async fn place_details(&self, place_id: &str) -> Result<DetailedCandidate, ProviderError> {
        self.results
            .iter()
            .find(|d| d.candidate.place_id == place_id)
            .cloned()
            .ok_or_else(|| ProviderError::Permanent(format!("no stub details for {place_id}")))
    }
}

// --- LLM stubs ---

enum ScriptMode {
    Queue(VecDeque<Result<serde_json::Value, ProviderError>>),
    Always(Result<serde_json::Value, ProviderError>),
}

pub struct StubTextModel {
    script: Mutex<ScriptMode>,
}

impl StubTextModel {
    /// Responses popped in call order.
    pub fn scripted(
        responses: impl IntoIterator<Item = Result<serde_json::Value, ProviderError>>,
    ) -> Self {
        Self {
            script: Mutex::new(ScriptMode::Queue(responses.into_iter().collect())),
        }
    }

    /// Every call gets the same answer.
    pub fn always(response: Result<serde_json::Value, ProviderError>) -> Self {
        Self {
            script: Mutex::new(ScriptMode::Always(response)),
        }
    }
}

fn clone_response(
    r: &Result<serde_json::Value, ProviderError>,
) -> Result<serde_json::Value, ProviderError> {
    match r {
        Ok(v) => Ok(v.clone()),
        Err(e) => Err(e.clone()),
    }
}

#[async_trait]
impl TextModel for StubTextModel {
    async fn complete_json(
        &self,
        _system: &str,
        _user: &str,
        _schema: serde_json::Value,
    ) -> Result<Completion, ProviderError> {
        let response = match &mut *self.script.lock().expect("stub lock") {
            ScriptMode::Queue(queue) => queue
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Permanent("text stub script exhausted".into()))),
            ScriptMode::Always(r) => clone_response(r),
        };
        response.map(|value| Completion {
            value,
            input_tokens: 500,
            output_tokens: 120,
        })
    }

    fn model(&self) -> &str {
        "stub-text-model"
    }
}

pub struct StubVisionModel {
    script: Mutex<ScriptMode>,
}

impl StubVisionModel {
    pub fn always(response: Result<serde_json::Value, ProviderError>) -> Self {
        Self {
            script: Mutex::new(ScriptMode::Always(response)),
        }
    }
}

#[async_trait]
impl VisionModel for StubVisionModel {
    async fn analyze_json(
        &self,
        _prompt: &str,
        _images: &[Vec<u8>],
        _schema: serde_json::Value,
    ) -> Result<Completion, ProviderError> {
        let response = match &mut *self.script.lock().expect("stub lock") {
            ScriptMode::Queue(queue) => queue
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Permanent("vision stub script exhausted".into()))),
            ScriptMode::Always(r) => clone_response(r),
        };
        response.map(|value| Completion {
            value,
            input_tokens: 900,
            output_tokens: 150,
        })
    }

    fn model(&self) -> &str {
        "stub-vision-model"
    }
}

// --- Browser stub ---

#[derive(Default)]
pub struct StubBrowser {
    pages: Mutex<HashMap<String, String>>,
}

impl StubBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `html` for any render of `url` (exact match, trailing slash
    /// insensitive).
    pub fn add_page(&self, url: &str, html: &str) {
        self.pages
            .lock()
            .expect("stub lock")
            .insert(url.trim_end_matches('/').to_string(), html.to_string());
    }
}

#[async_trait]
impl BrowserDriver for StubBrowser {
    async fn render(
        &self,
        url: &str,
        _viewport: Viewport,
        _timeout_ms: u64,
    ) -> Result<RenderedPage, ProviderError> {
        let html = self
            .pages
            .lock()
            .expect("stub lock")
            .get(url.trim_end_matches('/'))
            .cloned()
            .ok_or_else(|| ProviderError::Unreachable(format!("no stub page for {url}")))?;

        Ok(RenderedPage {
            url: url.to_string(),
            title: browserless_client::extract_title(&html),
            meta_description: browserless_client::extract_meta_description(&html),
            outbound_links: browserless_client::extract_outbound_links(&html, url),
            html,
            png: vec![0x89, 0x50, 0x4e, 0x47],
        })
    }
}

// --- Search stub ---

pub struct StubSearcher {
    hits: Vec<SearchHit>,
}

impl StubSearcher {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self { hits }
    }
}

#[async_trait]
impl WebSearcher for StubSearcher {
    async fn search(
        &self,
        _query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, ProviderError> {
        Ok(self.hits.iter().take(max_results).cloned().collect())
    }
}

/// Bundle stubs into a provider set (no-op web searcher).
pub fn stub_providers(
    maps: StubMaps,
    text: StubTextModel,
    vision: StubVisionModel,
    browser: StubBrowser,
) -> ProviderSet {
    ProviderSet {
        maps: Arc::new(maps),
        text: Arc::new(text),
        vision: Arc::new(vision),
        browser: Arc::new(browser),
        search: Arc::new(NoopWebSearcher),
    }
}

/// The three engine prompts, inlined for tests.
pub fn test_prompts() -> PromptRegistry {
    PromptRegistry::from_prompts([
        PromptFile {
            id: "query_optimization".to_string(),
            version: "test".to_string(),
            model_hint: "stub-text-model".to_string(),
            template: "industry={{industry}} target={{target}} location={{location}} exclusions={{exclusions}}".to_string(),
        },
        PromptFile {
            id: "website_extraction".to_string(),
            version: "test".to_string(),
            model_hint: "stub-vision-model".to_string(),
            template: "extract from screenshot of {{company_name}}".to_string(),
        },
        PromptFile {
            id: "relevance".to_string(),
            version: "test".to_string(),
            model_hint: "stub-text-model".to_string(),
            template: "score industry={{industry}} target={{target}} location={{location}} profile={{company_profile}}".to_string(),
        },
    ])
}

// --- In-memory repository ---

#[derive(Default)]
struct RepoState {
    prospects: Vec<Prospect>,
    links: Vec<(Uuid, Uuid)>,
    projects: HashMap<Uuid, ProjectConfig>,
    queries: Vec<DiscoveryQuery>,
    fail_inserts: u32,
}

/// Trait-complete in-memory double for the Postgres repository.
#[derive(Default)]
pub struct InMemoryRepo {
    state: Mutex<RepoState>,
}

impl InMemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, prospect: Prospect) {
        self.state.lock().expect("repo lock").prospects.push(prospect);
    }

    pub fn seed_link(&self, prospect_id: Uuid, project_id: Uuid) {
        self.state
            .lock()
            .expect("repo lock")
            .links
            .push((project_id, prospect_id));
    }

    pub fn seed_project(&self, project_id: Uuid, config: ProjectConfig) {
        self.state
            .lock()
            .expect("repo lock")
            .projects
            .insert(project_id, config);
    }

    /// Make the next `n` inserts fail with a database error.
    pub fn fail_next_inserts(&self, n: u32) {
        self.state.lock().expect("repo lock").fail_inserts = n;
    }

    pub fn prospects(&self) -> Vec<Prospect> {
        self.state.lock().expect("repo lock").prospects.clone()
    }

    pub fn links(&self) -> Vec<(Uuid, Uuid)> {
        self.state.lock().expect("repo lock").links.clone()
    }

    pub fn queries(&self) -> Vec<DiscoveryQuery> {
        self.state.lock().expect("repo lock").queries.clone()
    }

    pub fn project_config(&self, project_id: Uuid) -> ProjectConfig {
        self.state
            .lock()
            .expect("repo lock")
            .projects
            .get(&project_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProspectRepo for InMemoryRepo {
    async fn find_by_place_id(&self, place_id: &str) -> RepoResult<Option<Prospect>> {
        Ok(self
            .state
            .lock()
            .expect("repo lock")
            .prospects
            .iter()
            .find(|p| p.google_place_id.as_deref() == Some(place_id))
            .cloned())
    }

    async fn find_by_website_norm(&self, website_norm: &str) -> RepoResult<Option<Prospect>> {
        Ok(self
            .state
            .lock()
            .expect("repo lock")
            .prospects
            .iter()
            .find(|p| {
                p.website
                    .as_deref()
                    .map(normalize_website)
                    .as_deref()
                    == Some(website_norm)
            })
            .cloned())
    }

    async fn find_by_company_norm(&self, company_norm: &str) -> RepoResult<Option<Prospect>> {
        Ok(self
            .state
            .lock()
            .expect("repo lock")
            .prospects
            .iter()
            .find(|p| normalize_company_name(&p.company_name) == company_norm)
            .cloned())
    }

    async fn get_prospect(&self, id: Uuid) -> RepoResult<Option<Prospect>> {
        Ok(self
            .state
            .lock()
            .expect("repo lock")
            .prospects
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn insert_prospect(&self, prospect: &Prospect) -> RepoResult<Uuid> {
        let mut state = self.state.lock().expect("repo lock");
        if state.fail_inserts > 0 {
            state.fail_inserts -= 1;
            return Err(RepoError::Database("injected insert failure".to_string()));
        }
        if let Some(place_id) = prospect.google_place_id.as_deref() {
            if state
                .prospects
                .iter()
                .any(|p| p.google_place_id.as_deref() == Some(place_id))
            {
                return Err(RepoError::DuplicatePlaceId(place_id.to_string()));
            }
        }
        state.prospects.push(prospect.clone());
        Ok(prospect.id)
    }

    async fn update_prospect_fields(
        &self,
        id: Uuid,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> RepoResult<()> {
        let mut state = self.state.lock().expect("repo lock");
        let Some(prospect) = state.prospects.iter_mut().find(|p| p.id == id) else {
            return Err(RepoError::NotFound);
        };
        let mut value =
            serde_json::to_value(&*prospect).map_err(|e| RepoError::Database(e.to_string()))?;
        if let Some(object) = value.as_object_mut() {
            for (k, v) in fields {
                object.insert(k.clone(), v.clone());
            }
        }
        *prospect =
            serde_json::from_value(value).map_err(|e| RepoError::Database(e.to_string()))?;
        prospect.updated_at = Utc::now();
        Ok(())
    }

    async fn link_prospect_to_project(
        &self,
        prospect_id: Uuid,
        project_id: Uuid,
        _meta: &LinkMeta,
    ) -> RepoResult<()> {
        let mut state = self.state.lock().expect("repo lock");
        let pair = (project_id, prospect_id);
        if !state.links.contains(&pair) {
            state.links.push(pair);
        }
        Ok(())
    }

    async fn exists_in_project(&self, prospect_id: Uuid, project_id: Uuid) -> RepoResult<bool> {
        Ok(self
            .state
            .lock()
            .expect("repo lock")
            .links
            .contains(&(project_id, prospect_id)))
    }

    async fn list_prospects(&self, filters: &ProspectFilters) -> RepoResult<ProspectPage> {
        let state = self.state.lock().expect("repo lock");
        let mut items: Vec<Prospect> = state
            .prospects
            .iter()
            .filter(|p| {
                filters
                    .status
                    .as_deref()
                    .map_or(true, |s| p.status.to_string() == s)
            })
            .filter(|p| {
                filters.city.as_deref().map_or(true, |c| {
                    p.city.as_deref().is_some_and(|pc| pc.eq_ignore_ascii_case(c))
                })
            })
            .filter(|p| {
                filters.industry.as_deref().map_or(true, |i| {
                    p.industry
                        .as_deref()
                        .is_some_and(|pi| pi.eq_ignore_ascii_case(i))
                })
            })
            .filter(|p| {
                filters
                    .min_rating
                    .map_or(true, |m| p.google_rating.is_some_and(|r| r >= m))
            })
            .filter(|p| filters.run_id.map_or(true, |r| p.run_id == r))
            .filter(|p| {
                filters
                    .project_id
                    .map_or(true, |proj| state.links.contains(&(proj, p.id)))
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total_count = items.len() as u64;
        let items = items
            .into_iter()
            .skip(filters.offset as usize)
            .take(filters.limit.max(1) as usize)
            .collect();
        Ok(ProspectPage { items, total_count })
    }

    async fn aggregate_stats(&self) -> RepoResult<AggregateStats> {
        let state = self.state.lock().expect("repo lock");
        let mut stats = AggregateStats {
            total: state.prospects.len() as u64,
            ..Default::default()
        };
        let mut rating_sum = 0.0;
        let mut rated = 0u64;
        for p in &state.prospects {
            *stats.by_status.entry(p.status.to_string()).or_default() += 1;
            if let Some(industry) = &p.industry {
                *stats.by_industry.entry(industry.clone()).or_default() += 1;
            }
            if let Some(rating) = p.google_rating {
                rating_sum += rating as f64;
                rated += 1;
            }
            if p.website.is_some() {
                stats.with_website += 1;
            }
            if !p.social_profiles.is_empty() {
                stats.with_social += 1;
            }
        }
        stats.average_rating = (rated > 0).then(|| rating_sum / rated as f64);
        Ok(stats)
    }

    async fn get_project_config(&self, project_id: Uuid) -> RepoResult<ProjectConfig> {
        Ok(self.project_config(project_id))
    }

    async fn save_project_icp_and_prompts(
        &self,
        project_id: Uuid,
        icp_brief: &serde_json::Value,
        prompts: &serde_json::Value,
    ) -> RepoResult<()> {
        let mut state = self.state.lock().expect("repo lock");
        let config = state.projects.entry(project_id).or_default();
        if config.icp_brief.is_none() {
            config.icp_brief = Some(icp_brief.clone());
        }
        if config.prospecting_prompts.is_none() {
            config.prospecting_prompts = Some(prompts.clone());
        }
        Ok(())
    }

    async fn save_prospecting_config(
        &self,
        project_id: Uuid,
        model_selections: &serde_json::Value,
    ) -> RepoResult<()> {
        let mut state = self.state.lock().expect("repo lock");
        let config = state.projects.entry(project_id).or_default();
        if config.prospecting_model_selections.is_none() {
            config.prospecting_model_selections = Some(model_selections.clone());
        }
        Ok(())
    }

    async fn save_discovery_query(&self, query: &DiscoveryQuery) -> RepoResult<()> {
        self.state
            .lock()
            .expect("repo lock")
            .queries
            .push(query.clone());
        Ok(())
    }

    async fn list_previous_queries(
        &self,
        project_id: Uuid,
        limit: u32,
    ) -> RepoResult<Vec<DiscoveryQuery>> {
        Ok(self
            .state
            .lock()
            .expect("repo lock")
            .queries
            .iter()
            .filter(|q| q.project_id == Some(project_id))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn query_exists(&self, project_id: Uuid, query: &str) -> RepoResult<bool> {
        Ok(self
            .state
            .lock()
            .expect("repo lock")
            .queries
            .iter()
            .any(|q| q.project_id == Some(project_id) && q.query == query))
    }
}
