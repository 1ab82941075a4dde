//! Webhook to build: decide, dispatch, record the run.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::clock::RunContext;
use crate::error::IacCiError;
use crate::models::{
    BuildBackend, BuildStatus, CheckResponse, Notify, RunRecord, TriggerSettings, WebhookInfo,
};
use crate::services::dispatcher::BuildDispatcher;
use crate::services::notify::CommentService;
use crate::services::reporter::{pr_target, RunReporter};
use crate::store::RunStore;

const PR_ACTIONS: [&str; 3] = ["opened", "synchronize", "reopened"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    Build(WebhookInfo),
    Ignore(String),
}

/// Whether a GitHub event should start a build for `trigger`.
pub fn decide(trigger: &TriggerSettings, event_type: &str, payload: &Value) -> TriggerDecision {
    let repo_name = payload["repository"]["name"].as_str().unwrap_or_default();
    if repo_name != trigger.repo_name {
        return TriggerDecision::Ignore(format!("repository {repo_name} is not {}", trigger.repo_name));
    }
    let owner = payload["repository"]["owner"]["login"]
        .as_str()
        .or_else(|| payload["repository"]["owner"]["name"].as_str())
        .unwrap_or(&trigger.owner)
        .to_string();

    let branch_allowed = |branch: &str| match trigger.branch.as_deref() {
        Some(wanted) => wanted == branch,
        None => true,
    };

    match event_type {
        "push" => {
            let branch = payload["ref"]
                .as_str()
                .unwrap_or_default()
                .strip_prefix("refs/heads/")
                .unwrap_or_default();
            let commit = payload["after"].as_str().unwrap_or_default();
            if payload["deleted"].as_bool().unwrap_or(false) || commit.trim_matches('0').is_empty() {
                return TriggerDecision::Ignore("branch deletion".to_string());
            }
            if branch.is_empty() || !branch_allowed(branch) {
                return TriggerDecision::Ignore(format!("push to unwatched branch {branch:?}"));
            }
            TriggerDecision::Build(WebhookInfo {
                commit_hash: Some(commit.to_string()),
                owner: Some(owner),
                repo_name: Some(repo_name.to_string()),
                pr_number: None,
                event_type: Some("push".to_string()),
                branch: Some(branch.to_string()),
            })
        }
        "pull_request" => {
            let action = payload["action"].as_str().unwrap_or_default();
            if !PR_ACTIONS.contains(&action) {
                return TriggerDecision::Ignore(format!("pull_request action {action}"));
            }
            let base = payload["pull_request"]["base"]["ref"].as_str().unwrap_or_default();
            if !branch_allowed(base) {
                return TriggerDecision::Ignore(format!("pull_request into unwatched branch {base:?}"));
            }
            let commit = payload["pull_request"]["head"]["sha"].as_str().unwrap_or_default();
            let head = payload["pull_request"]["head"]["ref"].as_str().unwrap_or_default();
            let Some(pr_number) = payload["number"].as_i64() else {
                return TriggerDecision::Ignore("pull_request without number".to_string());
            };
            if commit.is_empty() {
                return TriggerDecision::Ignore("pull_request without head commit".to_string());
            }
            TriggerDecision::Build(WebhookInfo {
                commit_hash: Some(commit.to_string()),
                owner: Some(owner),
                repo_name: Some(repo_name.to_string()),
                pr_number: Some(pr_number),
                event_type: Some("pull_request".to_string()),
                branch: Some(head.to_string()),
            })
        }
        other => TriggerDecision::Ignore(format!("event {other}")),
    }
}

/// A run that was created for a webhook.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredRun {
    pub run_id: String,
    pub response: CheckResponse,
}

pub struct BuildTrigger {
    runs: Arc<dyn RunStore>,
    dispatcher: BuildDispatcher,
    comments: Option<Arc<dyn CommentService>>,
    reporter: RunReporter,
}

impl BuildTrigger {
    pub fn new(
        runs: Arc<dyn RunStore>,
        dispatcher: BuildDispatcher,
        comments: Option<Arc<dyn CommentService>>,
        reporter: RunReporter,
    ) -> Self {
        Self {
            runs,
            dispatcher,
            comments,
            reporter,
        }
    }

    pub async fn trigger(
        &self,
        ctx: &RunContext,
        trigger: &TriggerSettings,
        webhook: WebhookInfo,
    ) -> Result<TriggeredRun, IacCiError> {
        match trigger.backend {
            BuildBackend::Codebuild => self.trigger_managed(ctx, trigger, webhook).await,
            BuildBackend::Lambda => self.trigger_function(ctx, trigger, webhook).await,
        }
    }

    /// Submits to the managed build service. Polling happens later through
    /// check-build; the response carries `continue = true`.
    pub async fn trigger_managed(
        &self,
        ctx: &RunContext,
        trigger: &TriggerSettings,
        webhook: WebhookInfo,
    ) -> Result<TriggeredRun, IacCiError> {
        let mut run = RunRecord::new(&trigger.trigger_id, webhook);
        let env = build_env(&run);

        let dispatched = match self.dispatcher.dispatch_managed(ctx, trigger, &env).await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                tracing::error!(trigger_id = %trigger.trigger_id, run_id = %run.run_id, "Dispatch failed: {e}");
                self.reporter
                    .finalize(run, Some(trigger), None, Some(Notify::default()), "")
                    .await?;
                return Err(e.into());
            }
        };

        run.build_id = Some(dispatched.build_id.clone());
        run.build_expire_at = Some(dispatched.build_expire_at);
        run.build_status = BuildStatus::InProgress;
        run.status_comment_id = self.post_status_comment(&run).await;
        self.runs.put_run(&run).await?;

        tracing::info!(
            run_id = %run.run_id,
            build_id = %dispatched.build_id,
            build_expire_at = dispatched.build_expire_at,
            "Run created"
        );

        Ok(TriggeredRun {
            run_id: run.run_id,
            response: CheckResponse {
                should_continue: true,
                build_id: Some(dispatched.build_id),
                ..Default::default()
            },
        })
    }

    /// Runs the build through the function backend and finalizes at once.
    /// A failed build is reported and then returned as
    /// [`IacCiError::BuildFailed`].
    pub async fn trigger_function(
        &self,
        ctx: &RunContext,
        trigger: &TriggerSettings,
        webhook: WebhookInfo,
    ) -> Result<TriggeredRun, IacCiError> {
        let mut run = RunRecord::new(&trigger.trigger_id, webhook);
        let build_id = format!("{}:{}", self.dispatcher.function_name(), uuid::Uuid::new_v4());
        run.build_id = Some(build_id.clone());
        run.build_status = BuildStatus::InProgress;
        run.chk_t0 = Some(ctx.now());
        run.chk_count = 1;
        run.status_comment_id = self.post_status_comment(&run).await;
        self.runs.put_run(&run).await?;

        let is_push = run.webhook.is_push();
        let run_id = run.run_id.clone();
        let env = build_env(&run);

        let outcome = match self.dispatcher.invoke_function(trigger, &env).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(run_id = %run_id, build_id = %build_id, "Function dispatch failed: {e}");
                self.reporter
                    .finalize(run, Some(trigger), Some(BuildStatus::Failed), Some(Notify::default()), "")
                    .await?;
                return Err(e.into());
            }
        };

        let observed = if outcome.succeeded {
            BuildStatus::Successful
        } else {
            BuildStatus::Failed
        };
        let notify = Notify {
            message: is_push.then(|| "iac-ci completed with event_type push".to_string()),
            ..Default::default()
        };

        let response = self
            .reporter
            .finalize(run, Some(trigger), Some(observed), Some(notify), &outcome.output)
            .await?;

        if !outcome.succeeded {
            let message = outcome.failed_message.unwrap_or_default();
            tracing::error!(
                run_id = %run_id,
                exit_code = outcome.exit_code.code(),
                status_code = outcome.status_code,
                "{message}"
            );
            return Err(IacCiError::BuildFailed {
                exit_code: outcome.exit_code,
                message,
                run_id,
                response: Box::new(response),
            });
        }

        Ok(TriggeredRun { run_id, response })
    }

    /// Posts the transient "build in progress" comment. Failures only cost
    /// the comment.
    async fn post_status_comment(&self, run: &RunRecord) -> Option<i64> {
        let target = pr_target(run)?;
        let comments = self.comments.as_ref()?;
        let body = format!(
            ":hourglass: iac-ci build in progress\n+ trigger_id {}\n+ build_id {}",
            run.trigger_id,
            run.build_id.as_deref().unwrap_or_default()
        );
        match comments.create_comment(&target, &body).await {
            Ok(comment) => Some(comment.id),
            Err(e) => {
                tracing::warn!(run_id = %run.run_id, "Status comment failed: {e}");
                None
            }
        }
    }
}

fn build_env(run: &RunRecord) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("IAC_CI_RUN_ID".to_string(), run.run_id.clone()),
        ("IAC_CI_TRIGGER_ID".to_string(), run.trigger_id.clone()),
    ]);
    let webhook = &run.webhook;
    if let Some(commit) = &webhook.commit_hash {
        env.insert("IAC_CI_COMMIT_HASH".to_string(), commit.clone());
    }
    if let Some(branch) = &webhook.branch {
        env.insert("IAC_CI_BRANCH".to_string(), branch.clone());
    }
    if let Some(pr) = webhook.pr_number {
        env.insert("IAC_CI_PR_NUMBER".to_string(), pr.to_string());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{ScriptedBuildBackend, ScriptedFunctionBackend};
    use crate::backends::FunctionInvocation;
    use crate::clock::ManualClock;
    use crate::services::notify::memory::{RecordingChat, RecordingComments};
    use crate::store::InMemoryStore;
    use rstest::rstest;
    use serde_json::json;

    fn settings(backend: &str, branch: Option<&str>) -> TriggerSettings {
        serde_json::from_value(json!({
            "_id": "trg-1",
            "repo_name": "infra",
            "owner": "acme",
            "branch": branch,
            "backend": backend,
            "project_name": "plan",
            "build_commands": ["terraform plan"],
            "build_timeout": 1200
        }))
        .unwrap()
    }

    fn push(branch: &str) -> Value {
        json!({
            "ref": format!("refs/heads/{branch}"),
            "after": "a1b2c3d4e5f6",
            "repository": { "name": "infra", "owner": { "login": "acme" } }
        })
    }

    fn pull_request(action: &str, base: &str) -> Value {
        json!({
            "action": action,
            "number": 7,
            "pull_request": {
                "base": { "ref": base },
                "head": { "ref": "feature", "sha": "f00dbeef" }
            },
            "repository": { "name": "infra", "owner": { "login": "acme" } }
        })
    }

    #[rstest]
    #[case("push", push("main"), true)]
    #[case("push", push("feature"), false)]
    #[case("pull_request", pull_request("opened", "main"), true)]
    #[case("pull_request", pull_request("synchronize", "main"), true)]
    #[case("pull_request", pull_request("reopened", "main"), true)]
    #[case("pull_request", pull_request("closed", "main"), false)]
    #[case("pull_request", pull_request("opened", "develop"), false)]
    #[case("issues", json!({"repository": {"name": "infra"}}), false)]
    fn decision_follows_event_and_branch(#[case] event: &str, #[case] payload: Value, #[case] builds: bool) {
        let decision = decide(&settings("codebuild", Some("main")), event, &payload);
        assert_eq!(matches!(decision, TriggerDecision::Build(_)), builds, "{decision:?}");
    }

    #[test]
    fn pull_request_linkage_is_captured() {
        let TriggerDecision::Build(info) =
            decide(&settings("codebuild", None), "pull_request", &pull_request("opened", "main"))
        else {
            panic!("expected a build");
        };
        assert_eq!(info.pr_number, Some(7));
        assert_eq!(info.commit_hash.as_deref(), Some("f00dbeef"));
        assert_eq!(info.owner.as_deref(), Some("acme"));
    }

    #[test]
    fn branch_deletion_is_ignored() {
        let mut payload = push("main");
        payload["after"] = json!("0000000000000000000000000000000000000000");
        payload["deleted"] = json!(true);
        assert!(matches!(
            decide(&settings("codebuild", None), "push", &payload),
            TriggerDecision::Ignore(_)
        ));
    }

    fn build_trigger(
        store: &Arc<InMemoryStore>,
        managed: ScriptedBuildBackend,
        function: ScriptedFunctionBackend,
        comments: &Arc<RecordingComments>,
    ) -> BuildTrigger {
        let dispatcher = BuildDispatcher::new(Arc::new(managed), Arc::new(function), "iac-ci");
        let reporter = RunReporter::new(store.clone(), Some(comments.clone()), Arc::new(RecordingChat::new()));
        BuildTrigger::new(store.clone(), dispatcher, Some(comments.clone()), reporter)
    }

    fn pr_webhook() -> WebhookInfo {
        WebhookInfo {
            commit_hash: Some("f00dbeef".to_string()),
            owner: Some("acme".to_string()),
            repo_name: Some("infra".to_string()),
            pr_number: Some(7),
            event_type: Some("pull_request".to_string()),
            branch: Some("feature".to_string()),
        }
    }

    #[tokio::test]
    async fn managed_trigger_records_in_progress_run() {
        let clock = ManualClock::at_epoch(5_000);
        let ctx = RunContext::manual(&clock);
        let store = Arc::new(InMemoryStore::new());
        let comments = Arc::new(RecordingComments::new());
        let trigger = build_trigger(
            &store,
            ScriptedBuildBackend::new("plan", "logs"),
            ScriptedFunctionBackend::unreachable("unused"),
            &comments,
        );

        let triggered = trigger
            .trigger(&ctx, &settings("codebuild", None), pr_webhook())
            .await
            .unwrap();

        assert!(triggered.response.should_continue);
        let run = store.get_run(&triggered.run_id).await.unwrap().unwrap();
        assert_eq!(run.build_status, BuildStatus::InProgress);
        assert_eq!(run.build_expire_at, Some(5_600));
        assert!(run.status_comment_id.is_some());
        assert_eq!(comments.created_count(), 1);
    }

    #[tokio::test]
    async fn failed_submit_finalizes_as_never_triggered() {
        let ctx = RunContext::manual(&ManualClock::at_epoch(0));
        let store = Arc::new(InMemoryStore::new());
        let comments = Arc::new(RecordingComments::new());
        let trigger = build_trigger(
            &store,
            ScriptedBuildBackend::new("plan", "logs").failing_submit("AccessDenied"),
            ScriptedFunctionBackend::unreachable("unused"),
            &comments,
        );

        let err = trigger
            .trigger(&ctx, &settings("codebuild", None), pr_webhook())
            .await
            .unwrap_err();

        assert!(matches!(err, IacCiError::Dispatch(_)));
        assert_eq!(store.run_writes(), 1);
        assert!(comments.bodies()[0].contains("#iac-ci-trg-1-pr7"));
    }

    #[tokio::test]
    async fn function_push_success_closes_and_notifies() {
        let ctx = RunContext::manual(&ManualClock::at_epoch(0));
        let store = Arc::new(InMemoryStore::new());
        let comments = Arc::new(RecordingComments::new());
        let body = json!({ "body": json!({"status": true, "exitcode": 0}).to_string() });
        let trigger = build_trigger(
            &store,
            ScriptedBuildBackend::new("plan", "logs"),
            ScriptedFunctionBackend::answering(FunctionInvocation {
                status_code: 200,
                payload: serde_json::to_vec(&body).unwrap(),
                log_tail_b64: None,
            }),
            &comments,
        );
        let webhook = WebhookInfo {
            event_type: Some("push".to_string()),
            branch: Some("main".to_string()),
            ..Default::default()
        };

        let triggered = trigger
            .trigger(&ctx, &settings("lambda", None), webhook)
            .await
            .unwrap();

        assert!(triggered.response.close);
        assert_eq!(
            triggered.response.notify.and_then(|n| n.message).as_deref(),
            Some("iac-ci completed with event_type push")
        );
        let run = store.get_run(&triggered.run_id).await.unwrap().unwrap();
        assert_eq!(run.build_status, BuildStatus::Successful);
        assert!(run.build_id.unwrap().starts_with("iac-ci:"));
    }
}
