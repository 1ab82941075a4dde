//! iac-ci HTTP routes: webhooks, check-build, run lookup.

pub mod api;
pub mod webhook;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;

use crate::clock::RunContext;
use crate::config::IacCiConfig;
use crate::models::RunRecord;
use crate::services::check_build::BuildChecker;
use crate::services::trigger_build::BuildTrigger;
use crate::store::{RunStore, SettingsStore};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: IacCiConfig,
    pub ctx: RunContext,
    pub runs: Arc<dyn RunStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub trigger: Arc<BuildTrigger>,
    pub checker: Arc<BuildChecker>,
}

pub fn iac_ci_router(state: AppState) -> Router {
    Router::new()
        // Webhook
        .route("/webhook", post(repo_webhook_handler))
        .route("/webhook/{trigger_id}", post(webhook_handler))
        // Build checks
        .route("/check_build", post(check_build_handler))
        // Run API
        .route("/api/runs/{run_id}", get(get_run))
        .with_state(state)
}

fn event_type(headers: &HeaderMap) -> &str {
    headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
}

// ── Webhook ──

async fn webhook_handler(
    State(state): State<AppState>,
    Path(trigger_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), StatusCode> {
    crate::metrics::webhook_received(event_type(&headers));
    webhook::handle_webhook(&state, &trigger_id, &headers, body).await
}

async fn repo_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), StatusCode> {
    crate::metrics::webhook_received(event_type(&headers));
    webhook::handle_repo_webhook(&state, &headers, body).await
}

// ── Build checks ──

async fn check_build_handler(
    State(state): State<AppState>,
    Json(event): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    api::check_build(&state, event).await.map(Json)
}

// ── Run API ──

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunRecord>, StatusCode> {
    match state.runs.get_run(&run_id).await {
        Ok(Some(run)) => Ok(Json(run)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(run_id = %run_id, "Run lookup failed: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
