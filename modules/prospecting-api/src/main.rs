mod rest;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ai_client::{TextLlm, VisionLlm};
use browserless_client::BrowserlessClient;
use maps_client::MapsClient;
use prospecting_common::Config;
use prospecting_engine::{
    BackupStore, CostTable, CostTracker, EngineDeps, NoopWebSearcher, PromptRegistry,
    ProspectingEngine, ProviderSet, RateLimiter,
};
use prospecting_store::PostgresRepo;

pub(crate) struct AppState {
    pub engine: Arc<ProspectingEngine>,
    pub repo: Arc<PostgresRepo>,
}

const TEXT_MODEL: &str = "claude-haiku-4-5-20251001";
const VISION_MODEL: &str = "claude-haiku-4-5-20251001";

/// How long uploaded backup files are kept before the reaper deletes them.
const BACKUP_RETENTION_DAYS: i64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    let repo = Arc::new(PostgresRepo::new(pool));
    repo.migrate().await.context("Migrations failed")?;

    let prompts = Arc::new(
        PromptRegistry::load(&config.prompts_dir).context("Failed to load prompt registry")?,
    );
    let cost_table = match &config.cost_table_path {
        Some(path) => CostTable::load(path).context("Failed to load cost table")?,
        None => CostTable::default(),
    };

    let providers = ProviderSet {
        maps: Arc::new(MapsClient::new(&config.maps_api_key)),
        text: Arc::new(TextLlm::new(&config.text_llm_api_key, TEXT_MODEL)),
        vision: Arc::new(VisionLlm::new(&config.vision_llm_api_key, VISION_MODEL)),
        browser: Arc::new(BrowserlessClient::new(
            &config.browserless_url,
            config.browserless_token.as_deref(),
        )),
        search: Arc::new(NoopWebSearcher),
    };

    let backup = Arc::new(BackupStore::new(&config.backup_root)?);
    spawn_backup_reaper(backup.clone());

    let engine = Arc::new(ProspectingEngine::new(EngineDeps {
        providers,
        repo: repo.clone(),
        backup,
        prompts,
        limiter: Arc::new(RateLimiter::standard(
            config.maps_rate_per_sec,
            config.llm_rate_per_sec,
            config.vision_rate_per_sec,
            config.browser_rate_per_sec,
        )),
        costs: Arc::new(CostTracker::new()),
        cost_table,
        debug_audit: std::env::var("PROSPECTING_CALL_AUDIT").is_ok(),
    }));

    let state = Arc::new(AppState { engine, repo });
    let app = rest::router(state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.web_host, config.web_port);
    info!(addr, "Prospecting API listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("Server failed")?;

    Ok(())
}

/// Periodically delete uploaded backup files past the retention window.
/// Pending and failed files are never touched.
fn spawn_backup_reaper(backup: Arc<BackupStore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(6 * 3600));
        loop {
            ticker.tick().await;
            match backup.archive(BACKUP_RETENTION_DAYS) {
                Ok(0) => {}
                Ok(deleted) => info!(deleted, "Backup reaper archived uploaded files"),
                Err(e) => error!(error = %e, "Backup reaper failed"),
            }
        }
    });
}
