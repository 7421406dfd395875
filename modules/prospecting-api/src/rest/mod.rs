//! HTTP surface: the run trigger with its SSE progress stream, and the
//! synchronous prospect query endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{sse::Event, IntoResponse, Json, Sse},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use prospecting_common::{Brief, RunOptions};
use prospecting_engine::{channel, ProspectFilters, ProspectRepo};

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/prospecting/runs", post(start_run))
        .route("/api/prospects", get(list_prospects))
        .route("/api/prospects/stats", get(prospect_stats))
        .route("/api/prospects/{id}", get(get_prospect))
        .route("/api/health", get(health))
        .with_state(state)
}

// --- Run trigger + SSE stream ---

#[derive(Debug, Deserialize)]
struct RunRequest {
    brief: Brief,
    #[serde(default)]
    options: Option<RunOptions>,
}

async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> axum::response::Response {
    if let Err(e) = request.brief.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response();
    }

    let options = request.options.unwrap_or_default();
    let (tx, mut rx) = channel(prospecting_engine::progress::DEFAULT_CAPACITY);
    let cancel = CancellationToken::new();

    let engine = state.engine.clone();
    let brief = request.brief;
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.run(brief, options, tx, run_cancel).await {
            error!(error = %e, "Prospecting run failed");
        }
    });

    info!("Prospecting run started, streaming progress");

    // One `data: <json>` frame per event; the stream ends after the
    // terminal `complete` or `error` frame. Dropping the response cancels
    // the run.
    let stream = async_stream::stream! {
        let _cancel_on_drop = cancel.drop_guard();
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Progress event serialization failed");
                    continue;
                }
            };
            yield Ok::<_, Infallible>(Event::default().data(json));
            if terminal {
                break;
            }
        }
    };

    Sse::new(stream).into_response()
}

// --- Query endpoints ---

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    status: Option<String>,
    city: Option<String>,
    industry: Option<String>,
    min_rating: Option<f32>,
    project_id: Option<Uuid>,
    run_id: Option<Uuid>,
    recently_reviewed_within_months: Option<u32>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_prospects(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> axum::response::Response {
    let filters = ProspectFilters {
        status: params.status,
        city: params.city,
        industry: params.industry,
        min_rating: params.min_rating,
        project_id: params.project_id,
        run_id: params.run_id,
        recently_reviewed_within_months: params.recently_reviewed_within_months,
        limit: params.limit.unwrap_or(50).min(100),
        offset: params.offset.unwrap_or(0),
    };

    match state.repo.list_prospects(&filters).await {
        Ok(page) => Json(serde_json::json!({
            "prospects": page.items,
            "total_count": page.total_count,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "Prospect listing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "listing failed" })),
            )
                .into_response()
        }
    }
}

async fn get_prospect(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    match state.repo.get_prospect(id).await {
        Ok(Some(prospect)) => Json(prospect).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "prospect not found" })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Prospect lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "lookup failed" })),
            )
                .into_response()
        }
    }
}

async fn prospect_stats(State(state): State<Arc<AppState>>) -> axum::response::Response {
    match state.repo.aggregate_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!(error = %e, "Stats aggregation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "stats failed" })),
            )
                .into_response()
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now(),
    }))
}
