//! The orchestrator: drives one run end to end.
//!
//! One prospect at a time flows through stages 3–7 — the browser is
//! memory-expensive and shared, provider quotas are the real bottleneck,
//! and sequential flow keeps progress events intelligible. Per-prospect
//! failures never abort the run; only an invalid brief, cancellation, or a
//! contiguous streak of permanent provider failures does.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use maps_client::DetailedCandidate;
use prospecting_common::{
    Brief, EngineError, ProgressEvent, Prospect, RunOptions, RunSummary,
};

use crate::backup::BackupStore;
use crate::cost::{CostTable, CostTracker};
use crate::dedup::{DedupDecision, DedupService};
use crate::limits::RateLimiter;
use crate::progress::ProgressSender;
use crate::prompts::PromptRegistry;
use crate::providers::{ProviderGateway, ProviderSet};
use crate::repo::{CompanyIdentity, LinkMeta, ProspectRepo};
use crate::stages::{discovery, extract, query, relevance, social, social_meta, verify};

/// Hard ceiling per prospect; past it the prospect is dropped and the run
/// advances.
const PROSPECT_BUDGET: Duration = Duration::from_secs(180);

/// Process-wide dependencies, injected once at startup.
pub struct EngineDeps {
    pub providers: ProviderSet,
    pub repo: Arc<dyn ProspectRepo>,
    pub backup: Arc<BackupStore>,
    pub prompts: Arc<PromptRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub costs: Arc<CostTracker>,
    pub cost_table: CostTable,
    /// Keep a call-audit log on the gateway (debug flag).
    pub debug_audit: bool,
}

pub struct ProspectingEngine {
    deps: EngineDeps,
    http: reqwest::Client,
}

struct RunShared<'a> {
    gateway: &'a ProviderGateway,
    brief: &'a Brief,
    options: &'a RunOptions,
    run_id: Uuid,
    /// The prompt set actually used this run: the project's locked set
    /// when one exists, the process registry otherwise.
    prompts: Arc<PromptRegistry>,
    icp_snapshot: serde_json::Value,
    prompts_snapshot: serde_json::Value,
    model_snapshot: serde_json::Value,
    events: &'a ProgressSender,
    cancel: &'a CancellationToken,
}

struct ProcessOutcome {
    prospect: Prospect,
    persisted: bool,
    rendered: bool,
    filtered: bool,
}

impl ProspectingEngine {
    pub fn new(deps: EngineDeps) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(3))
            .timeout(Duration::from_secs(15))
            .user_agent("prospecting-engine/0.1")
            .build()
            .expect("Failed to build HTTP client");
        Self { deps, http }
    }

    /// Execute one run, streaming events to `events`. The terminal
    /// `complete` (or `error`) frame is always emitted before returning.
    pub async fn run(
        &self,
        brief: Brief,
        options: RunOptions,
        events: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        brief.validate()?;

        let run_id = Uuid::new_v4();
        let started = std::time::Instant::now();
        let mut gateway = ProviderGateway::new(
            self.deps.providers.clone(),
            self.deps.limiter.clone(),
            self.deps.costs.clone(),
            self.deps.cost_table.clone(),
        );
        if self.deps.debug_audit {
            gateway = gateway.with_audit();
        }

        info!(%run_id, count = brief.count, "Prospecting run starting");

        // Effective config: the project's stored brief fills request gaps,
        // and null project config fields are written exactly once.
        let (brief, prompts, icp_snapshot, prompts_snapshot, model_snapshot) = self
            .resolve_effective_config(brief, &options, &gateway)
            .await;

        events.emit(ProgressEvent::started(run_id, brief.clone()));

        let shared = RunShared {
            gateway: &gateway,
            brief: &brief,
            options: &options,
            run_id,
            prompts,
            icp_snapshot,
            prompts_snapshot,
            model_snapshot,
            events: &events,
            cancel: &cancel,
        };

        let result = self.run_inner(&shared, started).await;

        match result {
            Ok(summary) => {
                events.emit(ProgressEvent::complete(run_id, summary.clone()));
                events.close();
                info!(%run_id, "{summary}");
                Ok(summary)
            }
            Err(e) => {
                error!(%run_id, error = %e, "Run aborted");
                events.emit(ProgressEvent::error(run_id, &e.to_string()));
                events.close();
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        shared: &RunShared<'_>,
        started: std::time::Instant,
    ) -> Result<RunSummary, EngineError> {
        let RunShared {
            gateway,
            brief,
            options,
            run_id,
            events,
            cancel,
            ..
        } = shared;
        let run_id = *run_id;

        let dedup = DedupService::new(self.deps.repo.clone());

        // Stage 1: query understanding.
        events.emit(ProgressEvent::progress(
            run_id,
            1,
            None,
            "Optimizing search query",
        ));
        let understood = query::run(gateway, &shared.prompts, brief, cancel).await;
        if let Some(warning) = &understood.warning {
            events.emit(ProgressEvent::warning(run_id, 1, None, warning));
        }
        events.emit(ProgressEvent::progress(
            run_id,
            1,
            None,
            &format!("Search query: {}", understood.search_query),
        ));

        let mut summary = RunSummary {
            run_id,
            ..Default::default()
        };
        let mut goal_count: u32 = 0;
        let mut score_sum: u64 = 0;
        let streak_ceiling = brief.count.div_ceil(2).max(1);

        let mut buffer: VecDeque<DetailedCandidate> = VecDeque::new();
        let mut seen_place_ids: HashSet<String> = HashSet::new();
        let mut discovery_exhausted = false;
        let mut batch_new_prospects: u32 = 0;
        let mut pending_query: Option<prospecting_common::DiscoveryQuery> = None;

        let iteration_base = match options.project_id {
            Some(project_id) => self
                .deps
                .repo
                .list_previous_queries(project_id, 100)
                .await
                .map(|q| q.len() as u32)
                .unwrap_or(0),
            None => 0,
        };

        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if goal_count >= brief.count {
                break;
            }

            if buffer.is_empty() {
                if discovery_exhausted {
                    break;
                }

                // Stage 2: one discovery batch.
                events.emit(ProgressEvent::progress(
                    run_id,
                    2,
                    None,
                    "Searching for businesses",
                ));
                let remaining = (brief.count - goal_count) as usize;
                match discovery::run_batch(
                    gateway,
                    brief,
                    &understood.search_query,
                    understood.search_location.as_deref(),
                    remaining,
                    &mut seen_place_ids,
                    cancel,
                )
                .await
                {
                    Ok(outcome) => {
                        pending_query = Some(prospecting_common::DiscoveryQuery {
                            project_id: options.project_id,
                            query: understood.search_query.clone(),
                            search_location: understood.search_location.clone(),
                            iteration: iteration_base + 1,
                            strategy: "maps.textsearch".to_string(),
                            total_results: outcome.total_results,
                            unique_results: outcome.unique_results,
                            new_prospects_added: 0,
                            executed_at: Utc::now(),
                        });
                        batch_new_prospects = 0;
                        buffer.extend(outcome.candidates);
                        // Identical searches are not repeated within a run.
                        discovery_exhausted = true;
                        if buffer.is_empty() {
                            events.emit(ProgressEvent::progress(
                                run_id,
                                2,
                                None,
                                "No candidates survived filtering",
                            ));
                        }
                    }
                    Err(e) => {
                        events.emit(ProgressEvent::warning(
                            run_id,
                            2,
                            None,
                            &format!("discovery failed: {e}"),
                        ));
                        discovery_exhausted = true;
                        if gateway.permanent_streak() > streak_ceiling {
                            return Err(EngineError::ProviderStreak {
                                streak: gateway.permanent_streak(),
                                last: e.to_string(),
                            });
                        }
                    }
                }
                continue;
            }

            let Some(candidate) = buffer.pop_front() else {
                continue;
            };
            let company = candidate.candidate.name.clone();

            // Dedup before any enrichment spend.
            let identity = CompanyIdentity {
                company_name: company.clone(),
                website: candidate.candidate.website.clone(),
                google_place_id: Some(candidate.candidate.place_id.clone()),
            };
            match dedup.check(&identity, options.project_id).await {
                Err(e) => {
                    events.emit(ProgressEvent::warning(
                        run_id,
                        2,
                        Some(&company),
                        &format!("dedup check failed: {e}"),
                    ));
                    continue;
                }
                Ok(DedupDecision::SkipContacted) => {
                    events.emit(ProgressEvent::skipped(run_id, &company, "already contacted"));
                    goal_count += 1;
                    continue;
                }
                Ok(DedupDecision::UseExistingLead(lead_id)) => {
                    events.emit(ProgressEvent::reused(run_id, &company, lead_id));
                    goal_count += 1;
                    continue;
                }
                Ok(DedupDecision::UseExistingProspect(existing)) => {
                    events.emit(ProgressEvent::reused(run_id, &company, existing.id));
                    goal_count += 1;
                    continue;
                }
                Ok(DedupDecision::LinkOnly(existing)) => {
                    if let Some(project_id) = options.project_id {
                        let meta = self.link_meta(shared, &existing);
                        match self
                            .deps
                            .repo
                            .link_prospect_to_project(existing.id, project_id, &meta)
                            .await
                        {
                            Ok(()) => {
                                events.emit(ProgressEvent::linked(
                                    run_id,
                                    &company,
                                    existing.id,
                                    project_id,
                                ));
                                goal_count += 1;
                            }
                            Err(e) => {
                                events.emit(ProgressEvent::warning(
                                    run_id,
                                    2,
                                    Some(&company),
                                    &format!("project link failed: {e}"),
                                ));
                            }
                        }
                    }
                    continue;
                }
                Ok(DedupDecision::NewWork) => {}
            }

            // Stages 3–7 under the per-prospect budget.
            let outcome =
                match tokio::time::timeout(PROSPECT_BUDGET, self.process_prospect(shared, candidate))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(company, "Per-prospect budget exceeded, dropping");
                        events.emit(ProgressEvent::warning(
                            run_id,
                            7,
                            Some(&company),
                            "prospect budget exceeded, dropped",
                        ));
                        continue;
                    }
                };

            summary.prospects_enriched += 1;
            if outcome.rendered {
                summary.websites_scraped += 1;
            }
            if outcome.prospect.contact_email.is_some() {
                summary.emails_found += 1;
            }
            if outcome.prospect.contact_phone.is_some() {
                summary.phones_found += 1;
            }
            summary.social_profiles_found += outcome.prospect.social_profiles.len() as u32;
            score_sum += outcome.prospect.icp_match_score as u64;

            if outcome.filtered {
                events.emit(ProgressEvent::warning(
                    run_id,
                    7,
                    Some(&company),
                    "below relevance threshold, filtered",
                ));
                continue;
            }

            if outcome.persisted {
                summary.prospects_persisted += 1;
                batch_new_prospects += 1;
            }
            goal_count += 1;
            events.emit(ProgressEvent::company_complete(run_id, outcome.prospect));

            if gateway.permanent_streak() > streak_ceiling {
                return Err(EngineError::ProviderStreak {
                    streak: gateway.permanent_streak(),
                    last: "contiguous permanent provider failures".to_string(),
                });
            }

            // Pace provider traffic between prospects.
            if options.request_delay_ms > 0 && goal_count < brief.count {
                tokio::time::sleep(Duration::from_millis(options.request_delay_ms)).await;
            }
        }

        // Flush the discovery-query history record with real counts.
        if let Some(mut record) = pending_query.take() {
            record.new_prospects_added = batch_new_prospects;
            if let Err(e) = self.deps.repo.save_discovery_query(&record).await {
                warn!(error = %e, "Failed to record discovery query");
            }
        }

        summary.prospects_found = goal_count;
        summary.average_icp_score = if summary.prospects_enriched > 0 {
            score_sum as f64 / summary.prospects_enriched as f64
        } else {
            0.0
        };
        summary.total_cost_usd = self.deps.costs.finish_run().total_usd;
        summary.total_time_ms = started.elapsed().as_millis() as u64;

        if cancelled {
            info!(%run_id, "Run cancelled, emitting partial results");
        }
        Ok(summary)
    }

    /// Stages 3–7 for one new candidate, then backup-first persistence.
    async fn process_prospect(
        &self,
        shared: &RunShared<'_>,
        candidate: DetailedCandidate,
    ) -> ProcessOutcome {
        let RunShared {
            gateway,
            brief,
            options,
            run_id,
            events,
            cancel,
            ..
        } = shared;
        let run_id = *run_id;
        let prospect_started = std::time::Instant::now();
        let cost_before = self.deps.costs.run_snapshot().total_usd;

        let mut prospect = self.prospect_from_candidate(shared, candidate);
        let company = prospect.company_name.clone();

        // Stage 3: website verification.
        events.emit(ProgressEvent::progress(run_id, 3, Some(&company), "Verifying website"));
        prospect = verify::run(&self.http, prospect).await;
        events.emit(ProgressEvent::progress(
            run_id,
            3,
            Some(&company),
            &format!("Website status: {}", prospect.website_status),
        ));

        // Stage 4: data extraction.
        events.emit(ProgressEvent::progress(run_id, 4, Some(&company), "Extracting website data"));
        let (updated, artifacts, warnings) = extract::run(
            gateway,
            &self.http,
            &shared.prompts,
            prospect,
            options,
            cancel,
        )
        .await;
        prospect = updated;
        for warning in warnings {
            events.emit(ProgressEvent::warning(run_id, 4, Some(&company), &warning));
        }
        events.emit(ProgressEvent::progress(run_id, 4, Some(&company), "Extraction complete"));

        // Stage 5: social discovery.
        events.emit(ProgressEvent::progress(run_id, 5, Some(&company), "Discovering social profiles"));
        prospect = social::run(
            gateway,
            prospect,
            &artifacts.outbound_links,
            &artifacts.vision_links,
            options,
            cancel,
        )
        .await;
        events.emit(ProgressEvent::progress(
            run_id,
            5,
            Some(&company),
            &format!("Found {} social profiles", prospect.social_profiles.len()),
        ));

        // Stage 6: social metadata.
        events.emit(ProgressEvent::progress(run_id, 6, Some(&company), "Fetching social metadata"));
        let (updated, warnings) = social_meta::run(gateway, prospect, options, cancel).await;
        prospect = updated;
        for warning in warnings {
            events.emit(ProgressEvent::warning(run_id, 6, Some(&company), &warning));
        }
        events.emit(ProgressEvent::progress(run_id, 6, Some(&company), "Social metadata complete"));

        // Stage 7: relevance scoring.
        if options.check_relevance {
            events.emit(ProgressEvent::progress(run_id, 7, Some(&company), "Scoring relevance"));
            let (updated, warning) =
                relevance::run(gateway, &shared.prompts, brief, prospect, cancel).await;
            prospect = updated;
            if let Some(warning) = warning {
                events.emit(ProgressEvent::warning(run_id, 7, Some(&company), &warning));
            }
            events.emit(ProgressEvent::progress(
                run_id,
                7,
                Some(&company),
                &format!("ICP score: {}", prospect.icp_match_score),
            ));
        }

        prospect.discovery_time_ms = prospect_started.elapsed().as_millis() as u64;
        prospect.discovery_cost_usd =
            (self.deps.costs.run_snapshot().total_usd - cost_before).max(0.0);
        prospect.updated_at = Utc::now();

        let filtered = options.filter_irrelevant && options.check_relevance && !prospect.is_relevant;
        if filtered {
            return ProcessOutcome {
                prospect,
                persisted: false,
                rendered: artifacts.rendered,
                filtered: true,
            };
        }

        let persisted = self.persist(shared, &mut prospect).await;

        ProcessOutcome {
            prospect,
            persisted,
            rendered: artifacts.rendered,
            filtered: false,
        }
    }

    /// Local backup before the DB write; a failed insert leaves the
    /// prospect durable on disk and the run continues.
    async fn persist(&self, shared: &RunShared<'_>, prospect: &mut Prospect) -> bool {
        let run_id = shared.run_id;
        let company = prospect.company_name.clone();

        let payload = match serde_json::to_value(&*prospect) {
            Ok(payload) => payload,
            Err(e) => {
                error!(company, error = %e, "Prospect serialization failed");
                return false;
            }
        };
        let backup_path = match self.deps.backup.save(prospect.id, payload) {
            Ok(path) => path,
            Err(e) => {
                error!(company, error = %e, "Backup write failed");
                shared.events.emit(ProgressEvent::warning(
                    run_id,
                    7,
                    Some(&company),
                    &format!("local backup failed: {e}"),
                ));
                return false;
            }
        };

        match self.deps.repo.insert_prospect(prospect).await {
            Ok(db_id) => {
                if let Err(e) = self.deps.backup.mark_uploaded(&backup_path, db_id) {
                    warn!(company, error = %e, "Failed to mark backup uploaded");
                }

                if let Some(project_id) = shared.options.project_id {
                    let meta = self.link_meta(shared, prospect);
                    if let Err(e) = self
                        .deps
                        .repo
                        .link_prospect_to_project(prospect.id, project_id, &meta)
                        .await
                    {
                        warn!(company, error = %e, "Project link failed");
                        shared.events.emit(ProgressEvent::warning(
                            run_id,
                            7,
                            Some(&company),
                            &format!("project link failed: {e}"),
                        ));
                    }
                }
                true
            }
            Err(e) => {
                if let Err(move_err) = self.deps.backup.mark_failed(&backup_path, &e.to_string()) {
                    error!(company, error = %move_err, "Failed to mark backup failed");
                }
                shared.events.emit(ProgressEvent::warning(
                    run_id,
                    7,
                    Some(&company),
                    &format!("persistence failed, prospect kept in local backup: {e}"),
                ));
                false
            }
        }
    }

    fn prospect_from_candidate(
        &self,
        shared: &RunShared<'_>,
        detailed: DetailedCandidate,
    ) -> Prospect {
        let c = detailed.candidate;
        let mut prospect = Prospect::new(&c.name, shared.run_id);
        prospect.google_place_id = Some(c.place_id);
        prospect.industry = shared.brief.industry.clone();
        prospect.address = c.address;
        prospect.city = c.city;
        prospect.state = c.state;
        prospect.website = c.website;
        prospect.contact_phone = c.phone;
        prospect.google_rating = c.rating;
        prospect.google_review_count = c.review_count;
        prospect.most_recent_review_date = detailed.recent_review_dates.into_iter().max();
        prospect.icp_brief_snapshot = shared.icp_snapshot.clone();
        prospect.prompts_snapshot = shared.prompts_snapshot.clone();
        prospect.model_selections_snapshot = shared.model_snapshot.clone();
        prospect
    }

    fn link_meta(&self, shared: &RunShared<'_>, prospect: &Prospect) -> LinkMeta {
        LinkMeta {
            run_id: shared.run_id,
            icp_brief_snapshot: shared.icp_snapshot.clone(),
            prompts_snapshot: shared.prompts_snapshot.clone(),
            model_selections_snapshot: shared.model_snapshot.clone(),
            relevance_reasoning: prospect.relevance_reasoning.clone(),
            discovery_cost_usd: prospect.discovery_cost_usd,
            discovery_time_ms: prospect.discovery_time_ms,
        }
    }

    /// Merge the project's stored brief into the request and apply the
    /// first-run config lock: null project fields are written exactly
    /// once, stored values always win afterwards — including the prompt
    /// set, which is rebuilt from the project when one is locked in.
    async fn resolve_effective_config(
        &self,
        mut brief: Brief,
        options: &RunOptions,
        gateway: &ProviderGateway,
    ) -> (
        Brief,
        Arc<PromptRegistry>,
        serde_json::Value,
        serde_json::Value,
        serde_json::Value,
    ) {
        let current_models = serde_json::json!({
            "text": gateway.text_model_name(),
            "vision": gateway.vision_model_name(),
        });

        let Some(project_id) = options.project_id else {
            let icp = serde_json::to_value(&brief).unwrap_or(serde_json::Value::Null);
            let prompts = self.deps.prompts.clone();
            let versions = prompts.versions();
            return (brief, prompts, icp, versions, current_models);
        };

        let config = match self.deps.repo.get_project_config(project_id).await {
            Ok(config) => config,
            Err(e) => {
                warn!(%project_id, error = %e, "Project config read failed");
                Default::default()
            }
        };

        if let Some(stored) = &config.icp_brief {
            if let Ok(stored_brief) = serde_json::from_value::<Brief>(stored.clone()) {
                if brief.industry.is_none() {
                    brief.industry = stored_brief.industry;
                }
                if brief.target.is_none() {
                    brief.target = stored_brief.target;
                }
                if brief.location.is_none() {
                    brief.location = stored_brief.location;
                }
            }
        }
        let icp_snapshot = serde_json::to_value(&brief).unwrap_or(serde_json::Value::Null);

        // The stored prompt set wins over the process registry.
        let prompts = config
            .prospecting_prompts
            .as_ref()
            .and_then(|stored| match PromptRegistry::from_json(stored) {
                Ok(registry) => Some(Arc::new(registry)),
                Err(e) => {
                    warn!(%project_id, error = %e, "Stored prompt set unusable, using current");
                    None
                }
            })
            .unwrap_or_else(|| self.deps.prompts.clone());

        let model_snapshot = config
            .prospecting_model_selections
            .clone()
            .unwrap_or_else(|| current_models.clone());

        if config.icp_brief.is_none() || config.prospecting_prompts.is_none() {
            if let Err(e) = self
                .deps
                .repo
                .save_project_icp_and_prompts(project_id, &icp_snapshot, &prompts.to_json())
                .await
            {
                warn!(%project_id, error = %e, "First-run config write failed");
            }
        }
        if config.prospecting_model_selections.is_none() {
            if let Err(e) = self
                .deps
                .repo
                .save_prospecting_config(project_id, &current_models)
                .await
            {
                warn!(%project_id, error = %e, "First-run model selection write failed");
            }
        }

        let versions = prompts.versions();
        (brief, prompts, icp_snapshot, versions, model_snapshot)
    }
}
