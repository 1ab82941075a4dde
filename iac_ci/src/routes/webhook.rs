//! GitHub webhook handler: verifies, decides and triggers builds.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use serde_json::{json, Value};

use crate::error::IacCiError;
use crate::models::TriggerSettings;
use crate::routes::AppState;
use crate::services::github_service;
use crate::services::trigger_build::{decide, TriggerDecision};
use crate::store::find_triggers_by_repo;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn signature_ok(trigger: &TriggerSettings, body: &[u8], headers: &HeaderMap) -> bool {
    github_service::validate_signature(
        trigger.webhook_secret.as_deref().unwrap_or_default(),
        body,
        header(headers, "x-hub-signature-256"),
    )
}

pub fn error_status(err: &IacCiError) -> StatusCode {
    match err {
        IacCiError::Dispatch(_) => StatusCode::BAD_GATEWAY,
        IacCiError::BuildFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        IacCiError::TriggerNotFound(_) | IacCiError::RunNotFound(_) => StatusCode::NOT_FOUND,
        IacCiError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
        IacCiError::Store(_) | IacCiError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handle a webhook addressed to one trigger.
pub async fn handle_webhook(
    state: &AppState,
    trigger_id: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let trigger = match state.settings.get_trigger(trigger_id).await {
        Ok(Some(trigger)) => trigger,
        Ok(None) => {
            tracing::warn!(trigger_id, "Webhook for unknown trigger");
            return Err(StatusCode::NOT_FOUND);
        }
        Err(e) => {
            tracing::error!(trigger_id, "Trigger lookup failed: {e}");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    if !signature_ok(&trigger, &body, headers) {
        tracing::warn!(trigger_id, "Webhook signature validation failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let event_type = header(headers, "x-github-event");
    if event_type == "ping" {
        tracing::info!(trigger_id, "Received GitHub ping webhook");
        return Ok((StatusCode::OK, Json(json!({ "ping": true }))));
    }

    let payload: Value = serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    run_trigger(state, &trigger, event_type, &payload).await
}

/// Handle a webhook without a trigger id: every trigger configured for the
/// repository whose secret matches gets a chance to build.
pub async fn handle_repo_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let payload: Value = serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    let repo_name = payload["repository"]["name"].as_str().unwrap_or_default();
    if repo_name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let triggers = find_triggers_by_repo(
        state.settings.as_ref(),
        &state.ctx,
        state.config.lookup_retry(),
        repo_name,
    )
    .await;
    let verified: Vec<_> = triggers
        .into_iter()
        .filter(|trigger| signature_ok(trigger, &body, headers))
        .collect();
    if verified.is_empty() {
        tracing::warn!(repo_name, "No trigger accepted the webhook");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let event_type = header(headers, "x-github-event");
    let mut results = Vec::with_capacity(verified.len());
    for trigger in &verified {
        let (status, Json(result)) = match run_trigger(state, trigger, event_type, &payload).await {
            Ok(answer) => answer,
            Err(status) => (status, Json(json!({ "error": status.as_u16() }))),
        };
        results.push(json!({
            "trigger_id": trigger.trigger_id,
            "status": status.as_u16(),
            "result": result,
        }));
    }
    Ok((StatusCode::OK, Json(Value::Array(results))))
}

async fn run_trigger(
    state: &AppState,
    trigger: &TriggerSettings,
    event_type: &str,
    payload: &Value,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let webhook = match decide(trigger, event_type, payload) {
        TriggerDecision::Build(webhook) => webhook,
        TriggerDecision::Ignore(reason) => {
            tracing::debug!(trigger_id = %trigger.trigger_id, "Ignoring webhook: {reason}");
            return Ok((StatusCode::OK, Json(json!({ "ignored": reason }))));
        }
    };

    match state.trigger.trigger(&state.ctx, trigger, webhook).await {
        Ok(triggered) => {
            tracing::info!(trigger_id = %trigger.trigger_id, run_id = %triggered.run_id, "Build triggered from webhook");
            Ok((
                StatusCode::CREATED,
                Json(json!({ "run_id": triggered.run_id, "result": triggered.response })),
            ))
        }
        Err(IacCiError::BuildFailed {
            exit_code,
            message,
            run_id,
            response,
        }) => {
            tracing::error!(trigger_id = %trigger.trigger_id, run_id = %run_id, exit_code = exit_code.code(), "Build failed: {message}");
            Ok((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "run_id": run_id,
                    "status": false,
                    "exitcode": exit_code.code(),
                    "failed_message": message,
                    "close": response.close,
                    "result": response,
                })),
            ))
        }
        Err(e) => {
            tracing::error!(trigger_id = %trigger.trigger_id, "Trigger failed: {e}");
            Err(error_status(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rstest::rstest;

    use crate::backends::memory::{MemoryLogStore, ScriptedBuildBackend, ScriptedFunctionBackend};
    use crate::backends::FunctionInvocation;
    use crate::clock::{ManualClock, RunContext};
    use crate::config::IacCiConfig;
    use crate::services::check_build::BuildChecker;
    use crate::services::dispatcher::BuildDispatcher;
    use crate::services::log_retriever::{LogRetriever, LogWindow};
    use crate::services::notify::memory::RecordingChat;
    use crate::services::poller::{PollLimits, StatusPoller};
    use crate::services::reporter::RunReporter;
    use crate::services::trigger_build::BuildTrigger;
    use crate::store::InMemoryStore;

    fn state(function: ScriptedFunctionBackend) -> AppState {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBuildBackend::new("plan", "logs"));
        let reporter = || RunReporter::new(store.clone(), None, Arc::new(RecordingChat::new()));
        let dispatcher = BuildDispatcher::new(backend.clone(), Arc::new(function), "iac-ci");
        let checker = BuildChecker::new(
            store.clone(),
            store.clone(),
            StatusPoller::new(backend, PollLimits::default()),
            LogRetriever::new(Arc::new(MemoryLogStore::new()), LogWindow::default()),
            reporter(),
        );
        AppState {
            config: IacCiConfig::from_env(),
            ctx: RunContext::manual(&ManualClock::at_epoch(0)),
            runs: store.clone(),
            settings: store.clone(),
            trigger: Arc::new(BuildTrigger::new(store.clone(), dispatcher, None, reporter())),
            checker: Arc::new(checker),
        }
    }

    fn lambda_trigger() -> TriggerSettings {
        serde_json::from_value(json!({
            "_id": "trg-1",
            "repo_name": "infra",
            "owner": "acme",
            "backend": "lambda",
            "project_name": "plan",
            "build_commands": ["terraform plan"]
        }))
        .unwrap()
    }

    fn opened_pr() -> Value {
        json!({
            "action": "opened",
            "number": 7,
            "pull_request": {
                "base": { "ref": "main" },
                "head": { "ref": "feature", "sha": "f00dbeef" }
            },
            "repository": { "name": "infra", "owner": { "login": "acme" } }
        })
    }

    #[rstest]
    #[case(500, json!({}), "78", "lambda function failed")]
    #[case(
        200,
        json!({ "body": json!({"status": false, "exitcode": 1}).to_string() }),
        "79",
        "execution of cmd in lambda function failed"
    )]
    #[tokio::test]
    async fn failed_function_build_reports_exit_code(
        #[case] status_code: u16,
        #[case] payload: Value,
        #[case] exit_code: &str,
        #[case] message: &str,
    ) {
        let state = state(ScriptedFunctionBackend::answering(FunctionInvocation {
            status_code,
            payload: serde_json::to_vec(&payload).unwrap(),
            log_tail_b64: None,
        }));

        let (status, Json(body)) = run_trigger(&state, &lambda_trigger(), "pull_request", &opened_pr())
            .await
            .unwrap();

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], json!(false));
        assert_eq!(body["exitcode"], exit_code);
        assert_eq!(body["failed_message"], message);
        assert_eq!(body["close"], json!(true));
        assert_eq!(body["result"]["status"], "failed");

        let run_id = body["run_id"].as_str().unwrap();
        let run = state.runs.get_run(run_id).await.unwrap().unwrap();
        assert!(run.is_terminal());
    }
}
