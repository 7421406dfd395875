//! Provider seams and the instrumented gateway.
//!
//! The engine talks to external providers through these traits; the real
//! clients are adapted here, and tests swap in the stubs from
//! [`crate::testing`]. Every gateway call acquires a rate-limit token
//! first, retries transient failures with exponential backoff plus jitter,
//! records cost after execution, and trips a per-provider breaker for the
//! rest of the run when a quota is exhausted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use ai_client::{AiError, Completion, TextLlm, VisionLlm};
use browserless_client::{BrowserlessClient, BrowserlessError, RenderedPage, Viewport};
use maps_client::{Candidate, DetailedCandidate, MapsClient, MapsError};
use prospecting_common::ProviderError;

use crate::cost::{CostTable, CostTracker};
use crate::limits::{
    RateLimiter, KEY_BROWSER, KEY_LLM_TEXT, KEY_LLM_VISION, KEY_MAPS_DETAILS, KEY_MAPS_SEARCH,
    KEY_SEARCH,
};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(250);

// --- Seam traits ---

#[async_trait]
pub trait MapsProvider: Send + Sync {
    async fn text_search(
        &self,
        query: &str,
        location: Option<&str>,
        radius_m: u32,
    ) -> Result<Vec<Candidate>, ProviderError>;

    async fn place_details(&self, place_id: &str) -> Result<DetailedCandidate, ProviderError>;
}

#[async_trait]
pub trait TextModel: Send + Sync {
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        schema: serde_json::Value,
    ) -> Result<Completion, ProviderError>;

    fn model(&self) -> &str;
}

#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn analyze_json(
        &self,
        prompt: &str,
        images: &[Vec<u8>],
        schema: serde_json::Value,
    ) -> Result<Completion, ProviderError>;

    fn model(&self) -> &str;
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn render(
        &self,
        url: &str,
        viewport: Viewport,
        timeout_ms: u64,
    ) -> Result<RenderedPage, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[async_trait]
pub trait WebSearcher: Send + Sync {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, ProviderError>;
}

/// No-op searcher for when no search API key is configured.
pub struct NoopWebSearcher;

#[async_trait]
impl WebSearcher for NoopWebSearcher {
    async fn search(
        &self,
        _query: &str,
        _max_results: usize,
    ) -> Result<Vec<SearchHit>, ProviderError> {
        Ok(Vec::new())
    }
}

// --- Error mapping for the real clients ---

fn map_maps(err: MapsError) -> ProviderError {
    match err {
        MapsError::Network(m) => ProviderError::Transient(m),
        MapsError::Timeout(m) => ProviderError::Timeout(m),
        MapsError::Api { status, message } => {
            ProviderError::Transient(format!("maps status {status}: {message}"))
        }
        MapsError::Quota => ProviderError::QuotaExceeded("maps".to_string()),
        MapsError::Denied(m) => ProviderError::Permanent(format!("maps denied: {m}")),
    }
}

fn map_ai(provider: &str, err: AiError) -> ProviderError {
    match err {
        AiError::Network(m) => ProviderError::Transient(m),
        AiError::Timeout(m) => ProviderError::Timeout(m),
        AiError::Api { status, message } => ProviderError::from_status(status, provider, &message),
        AiError::SchemaMismatch(m) => {
            ProviderError::Permanent(format!("{provider} schema mismatch: {m}"))
        }
        AiError::Empty => ProviderError::Permanent(format!("{provider} returned no content")),
    }
}

fn map_browser(err: BrowserlessError) -> ProviderError {
    match err {
        BrowserlessError::Network(m) => ProviderError::Transient(m),
        BrowserlessError::Api { status, message } => {
            ProviderError::from_status(status, "browser", &message)
        }
        BrowserlessError::Unreachable(m) => ProviderError::Unreachable(m),
        BrowserlessError::Timeout(m) => ProviderError::Timeout(m),
        BrowserlessError::Blocked { status, url } => ProviderError::Blocked { status, url },
    }
}

// --- Adapter impls for the real clients ---

#[async_trait]
impl MapsProvider for MapsClient {
    async fn text_search(
        &self,
        query: &str,
        location: Option<&str>,
        radius_m: u32,
    ) -> Result<Vec<Candidate>, ProviderError> {
        MapsClient::text_search(self, query, location, radius_m)
            .await
            .map_err(map_maps)
    }

    async fn place_details(&self, place_id: &str) -> Result<DetailedCandidate, ProviderError> {
        MapsClient::place_details(self, place_id)
            .await
            .map_err(map_maps)
    }
}

#[async_trait]
impl TextModel for TextLlm {
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        schema: serde_json::Value,
    ) -> Result<Completion, ProviderError> {
        TextLlm::complete_json(self, system, user, schema)
            .await
            .map_err(|e| map_ai("llm.text", e))
    }

    fn model(&self) -> &str {
        TextLlm::model(self)
    }
}

#[async_trait]
impl VisionModel for VisionLlm {
    async fn analyze_json(
        &self,
        prompt: &str,
        images: &[Vec<u8>],
        schema: serde_json::Value,
    ) -> Result<Completion, ProviderError> {
        VisionLlm::analyze_json(self, prompt, images, schema)
            .await
            .map_err(|e| map_ai("llm.vision", e))
    }

    fn model(&self) -> &str {
        VisionLlm::model(self)
    }
}

#[async_trait]
impl BrowserDriver for BrowserlessClient {
    async fn render(
        &self,
        url: &str,
        viewport: Viewport,
        timeout_ms: u64,
    ) -> Result<RenderedPage, ProviderError> {
        BrowserlessClient::render(self, url, viewport, timeout_ms)
            .await
            .map_err(map_browser)
    }
}

// --- Call audit (debug flag) ---

/// Audit entries proving the acquire-before-call / record-after-call
/// ordering for every external call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    Acquired { key: String },
    Recorded { provider: String, operation: String },
}

// --- Provider bundle + gateway ---

/// The injected provider set. Process-wide instances, Arc-shared across
/// concurrent runs.
#[derive(Clone)]
pub struct ProviderSet {
    pub maps: Arc<dyn MapsProvider>,
    pub text: Arc<dyn TextModel>,
    pub vision: Arc<dyn VisionModel>,
    pub browser: Arc<dyn BrowserDriver>,
    pub search: Arc<dyn WebSearcher>,
}

/// Per-run instrumented facade over the provider set.
pub struct ProviderGateway {
    providers: ProviderSet,
    limiter: Arc<RateLimiter>,
    costs: Arc<CostTracker>,
    cost_table: CostTable,
    quota_tripped: Mutex<HashSet<String>>,
    permanent_streak: AtomicU32,
    audit: Option<Mutex<Vec<AuditEvent>>>,
}

impl ProviderGateway {
    pub fn new(
        providers: ProviderSet,
        limiter: Arc<RateLimiter>,
        costs: Arc<CostTracker>,
        cost_table: CostTable,
    ) -> Self {
        Self {
            providers,
            limiter,
            costs,
            cost_table,
            quota_tripped: Mutex::new(HashSet::new()),
            permanent_streak: AtomicU32::new(0),
            audit: None,
        }
    }

    /// Enable the call-audit log.
    pub fn with_audit(mut self) -> Self {
        self.audit = Some(Mutex::new(Vec::new()));
        self
    }

    pub fn audit_log(&self) -> Vec<AuditEvent> {
        self.audit
            .as_ref()
            .map(|a| a.lock().expect("audit lock").clone())
            .unwrap_or_default()
    }

    pub fn text_model_name(&self) -> String {
        self.providers.text.model().to_string()
    }

    pub fn vision_model_name(&self) -> String {
        self.providers.vision.model().to_string()
    }

    /// Contiguous permanent failures across all providers; resets on any
    /// successful call. The orchestrator aborts the run past its ceiling.
    pub fn permanent_streak(&self) -> u32 {
        self.permanent_streak.load(Ordering::Relaxed)
    }

    /// Whether the quota breaker has tripped for a provider this run.
    pub fn quota_tripped(&self, provider: &str) -> bool {
        self.quota_tripped
            .lock()
            .expect("quota lock")
            .contains(provider)
    }

    fn audit_push(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.lock().expect("audit lock").push(event);
        }
    }

    /// The shared call path: quota check, token acquire, bounded retry on
    /// transient errors, cost record after every executed call.
    async fn execute<'a, T>(
        &'a self,
        provider: &str,
        key: &str,
        operation: &str,
        cancel: &CancellationToken,
        cost_of: impl Fn(&T) -> (f64, u64),
        mut call: impl FnMut() -> BoxFuture<'a, Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        if self.quota_tripped(provider) {
            return Err(ProviderError::QuotaExceeded(provider.to_string()));
        }

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            self.limiter.acquire(key, cancel).await?;
            self.audit_push(AuditEvent::Acquired {
                key: key.to_string(),
            });

            let result = call().await;

            match result {
                Ok(value) => {
                    let (usd, units) = cost_of(&value);
                    self.costs.record(provider, operation, usd, units);
                    self.audit_push(AuditEvent::Recorded {
                        provider: provider.to_string(),
                        operation: operation.to_string(),
                    });
                    self.permanent_streak.store(0, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(err) => {
                    // The attempt still hit the provider; keep the call
                    // count honest even though nothing billable returned.
                    self.costs.record(provider, operation, 0.0, 0);
                    self.audit_push(AuditEvent::Recorded {
                        provider: provider.to_string(),
                        operation: operation.to_string(),
                    });

                    if let ProviderError::QuotaExceeded(_) = err {
                        warn!(provider, "Quota exceeded, stopping provider for this run");
                        self.quota_tripped
                            .lock()
                            .expect("quota lock")
                            .insert(provider.to_string());
                        return Err(err);
                    }

                    attempt += 1;
                    if err.is_transient() && attempt < MAX_ATTEMPTS {
                        let backoff = RETRY_BASE * 2u32.pow(attempt);
                        let jitter =
                            Duration::from_millis(rand::rng().random_range(0..250));
                        warn!(
                            provider,
                            operation,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err,
                            "Transient provider error, retrying after backoff"
                        );
                        tokio::time::sleep(backoff + jitter).await;
                        continue;
                    }

                    // Exhausted transient retries surface as permanent.
                    if err.is_transient() {
                        self.permanent_streak.fetch_add(1, Ordering::Relaxed);
                        return Err(ProviderError::Permanent(format!(
                            "{provider} {operation} failed after {MAX_ATTEMPTS} attempts: {err}"
                        )));
                    }
                    if matches!(err, ProviderError::Permanent(_)) {
                        self.permanent_streak.fetch_add(1, Ordering::Relaxed);
                    }
                    return Err(err);
                }
            }
        }
    }

    // --- Instrumented operations ---

    pub async fn text_search(
        &self,
        query: &str,
        location: Option<&str>,
        radius_m: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candidate>, ProviderError> {
        let rate = self.cost_table.rate("maps.textsearch");
        let maps = self.providers.maps.clone();
        let query = query.to_string();
        let location = location.map(String::from);
        self.execute(
            "maps",
            KEY_MAPS_SEARCH,
            "textsearch",
            cancel,
            move |_| (rate, 1),
            move || {
                let maps = maps.clone();
                let query = query.clone();
                let location = location.clone();
                Box::pin(async move {
                    maps.text_search(&query, location.as_deref(), radius_m).await
                })
            },
        )
        .await
    }

    pub async fn place_details(
        &self,
        place_id: &str,
        cancel: &CancellationToken,
    ) -> Result<DetailedCandidate, ProviderError> {
        let rate = self.cost_table.rate("maps.details");
        let maps = self.providers.maps.clone();
        let place_id = place_id.to_string();
        self.execute(
            "maps",
            KEY_MAPS_DETAILS,
            "details",
            cancel,
            move |_| (rate, 1),
            move || {
                let maps = maps.clone();
                let place_id = place_id.clone();
                Box::pin(async move { maps.place_details(&place_id).await })
            },
        )
        .await
    }

    pub async fn complete_json(
        &self,
        system: &str,
        user: &str,
        schema: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<Completion, ProviderError> {
        let per_1k = self.cost_table.rate("llm.text_per_1k");
        let text = self.providers.text.clone();
        let system = system.to_string();
        let user = user.to_string();
        self.execute(
            "llm.text",
            KEY_LLM_TEXT,
            "complete",
            cancel,
            move |c: &Completion| {
                let tokens = (c.input_tokens + c.output_tokens) as u64;
                (tokens as f64 / 1000.0 * per_1k, tokens)
            },
            move || {
                let text = text.clone();
                let system = system.clone();
                let user = user.clone();
                let schema = schema.clone();
                Box::pin(async move { text.complete_json(&system, &user, schema).await })
            },
        )
        .await
    }

    pub async fn analyze_json(
        &self,
        prompt: &str,
        images: &[Vec<u8>],
        schema: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<Completion, ProviderError> {
        let per_1k = self.cost_table.rate("llm.vision_per_1k");
        let vision = self.providers.vision.clone();
        let prompt = prompt.to_string();
        let images = images.to_vec();
        self.execute(
            "llm.vision",
            KEY_LLM_VISION,
            "analyze",
            cancel,
            move |c: &Completion| {
                let tokens = (c.input_tokens + c.output_tokens) as u64;
                (tokens as f64 / 1000.0 * per_1k, tokens)
            },
            move || {
                let vision = vision.clone();
                let prompt = prompt.clone();
                let images = images.clone();
                let schema = schema.clone();
                Box::pin(async move { vision.analyze_json(&prompt, &images, schema).await })
            },
        )
        .await
    }

    pub async fn render(
        &self,
        url: &str,
        viewport: Viewport,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<RenderedPage, ProviderError> {
        let rate = self.cost_table.rate("browser.render");
        let browser = self.providers.browser.clone();
        let url = url.to_string();
        self.execute(
            "browser",
            KEY_BROWSER,
            "render",
            cancel,
            move |_| (rate, 1),
            move || {
                let browser = browser.clone();
                let url = url.clone();
                Box::pin(async move { browser.render(&url, viewport, timeout_ms).await })
            },
        )
        .await
    }

    pub async fn web_search(
        &self,
        query: &str,
        max_results: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>, ProviderError> {
        let rate = self.cost_table.rate("search.query");
        let search = self.providers.search.clone();
        let query = query.to_string();
        self.execute(
            "search",
            KEY_SEARCH,
            "query",
            cancel,
            move |_| (rate, 1),
            move || {
                let search = search.clone();
                let query = query.clone();
                Box::pin(async move { search.search(&query, max_results).await })
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::{CostTable, CostTracker};
    use crate::limits::RateLimiter;
    use crate::testing::{candidate, stub_providers, StubBrowser, StubMaps, StubTextModel, StubVisionModel};

    fn gateway_with(maps: StubMaps) -> (ProviderGateway, Arc<CostTracker>) {
        let costs = Arc::new(CostTracker::new());
        let gateway = ProviderGateway::new(
            stub_providers(
                maps,
                StubTextModel::always(Ok(serde_json::json!({}))),
                StubVisionModel::always(Ok(serde_json::json!({}))),
                StubBrowser::new(),
            ),
            Arc::new(RateLimiter::standard(1000.0, 1000.0, 1000.0, 1000.0)),
            costs.clone(),
            CostTable::default(),
        )
        .with_audit();
        (gateway, costs)
    }

    #[tokio::test]
    async fn acquire_precedes_record_for_every_call() {
        let (gateway, costs) = gateway_with(StubMaps::new(vec![candidate("p1", "Acme", None)]));
        let cancel = CancellationToken::new();

        gateway.text_search("plumbers", None, 10_000, &cancel).await.unwrap();

        let audit = gateway.audit_log();
        assert_eq!(
            audit,
            vec![
                AuditEvent::Acquired { key: KEY_MAPS_SEARCH.to_string() },
                AuditEvent::Recorded {
                    provider: "maps".to_string(),
                    operation: "textsearch".to_string()
                },
            ]
        );
        assert_eq!(costs.snapshot().by_provider["maps"].calls, 1);
        assert!(costs.snapshot().total_usd > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_then_surface_as_permanent() {
        let (gateway, costs) =
            gateway_with(StubMaps::failing(ProviderError::Transient("upstream 503".into())));
        let cancel = CancellationToken::new();

        let err = gateway
            .text_search("plumbers", None, 10_000, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
        assert_eq!(gateway.permanent_streak(), 1);

        // Three attempts, each admitted and each recorded.
        let acquired = gateway
            .audit_log()
            .iter()
            .filter(|e| matches!(e, AuditEvent::Acquired { .. }))
            .count();
        assert_eq!(acquired, 3);
        assert_eq!(costs.snapshot().by_provider["maps"].calls, 3);
    }

    #[tokio::test]
    async fn quota_trips_the_breaker_for_the_rest_of_the_run() {
        let (gateway, _) =
            gateway_with(StubMaps::failing(ProviderError::QuotaExceeded("maps".into())));
        let cancel = CancellationToken::new();

        let first = gateway.text_search("plumbers", None, 10_000, &cancel).await;
        assert!(matches!(first, Err(ProviderError::QuotaExceeded(_))));
        assert!(gateway.quota_tripped("maps"));

        let audit_len = gateway.audit_log().len();
        let second = gateway.place_details("p1", &cancel).await;
        assert!(matches!(second, Err(ProviderError::QuotaExceeded(_))));
        // Tripped breaker short-circuits before the limiter.
        assert_eq!(gateway.audit_log().len(), audit_len);
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let (gateway, costs) =
            gateway_with(StubMaps::failing(ProviderError::Permanent("denied".into())));
        let cancel = CancellationToken::new();

        let err = gateway
            .text_search("plumbers", None, 10_000, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
        assert_eq!(costs.snapshot().by_provider["maps"].calls, 1);
    }

    #[tokio::test]
    async fn success_resets_the_permanent_streak() {
        let (gateway, _) = gateway_with(StubMaps::new(vec![candidate("p1", "Acme", None)]));
        let cancel = CancellationToken::new();

        // A text-model failure would bump the streak; a later maps success
        // clears it.
        gateway.permanent_streak.store(2, Ordering::Relaxed);
        gateway.text_search("plumbers", None, 10_000, &cancel).await.unwrap();
        assert_eq!(gateway.permanent_streak(), 0);
    }
}
