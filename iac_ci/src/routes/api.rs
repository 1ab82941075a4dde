//! Check-build endpoint and its orchestrator-facing response.

use axum::http::StatusCode;
use serde_json::{json, Value};

use crate::error::IacCiError;
use crate::events::normalize_event;
use crate::routes::webhook::error_status;
use crate::routes::AppState;
use crate::services::check_build::{CheckBuildRequest, CheckOutcome};

/// Wraps an outcome the way a step-function task expects it.
pub fn outcome_json(outcome: &CheckOutcome) -> Result<Value, serde_json::Error> {
    let response = outcome.response();
    Ok(json!({
        "statusCode": 200,
        "continue": response.should_continue,
        "next": outcome.transition(),
        "body": serde_json::to_string(response)?,
    }))
}

pub async fn run_check(state: &AppState, event: Value) -> Result<CheckOutcome, IacCiError> {
    let event = normalize_event(event)?;
    let req: CheckBuildRequest =
        serde_json::from_value(event).map_err(|e| IacCiError::InvalidEvent(e.to_string()))?;
    state.checker.check(&state.ctx, &req).await
}

pub async fn check_build(state: &AppState, event: Value) -> Result<Value, StatusCode> {
    let outcome = run_check(state, event).await.map_err(|e| {
        tracing::error!("Check build failed: {e}");
        error_status(&e)
    })?;
    outcome_json(&outcome).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
