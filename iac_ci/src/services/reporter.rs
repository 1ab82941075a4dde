//! Final status reconciliation: run record, PR comment, chat notification.
//!
//! A run is finalized once. Reporting on a run that is already terminal
//! returns the stored result and touches nothing.

use std::sync::Arc;

use crate::metrics;
use crate::models::{
    BuildStatus, CheckResponse, Link, Notify, ReportedStatus, RunRecord, TriggerSettings,
};
use crate::services::notify::{
    ChatMessage, ChatNotifier, CommentService, NotifyError, PrComment, PrTarget,
};
use crate::services::slack_service;
use crate::store::{RunStore, StoreResult};

/// Summary line block for a finished run. Pure: the status it prints is the
/// observed one, the stored status comes from [`decide_final_status`].
pub fn build_summary(observed: Option<BuildStatus>, trigger_id: &str, build_id: Option<&str>) -> String {
    match (observed, build_id) {
        (Some(BuildStatus::Successful), _) => format!(
            "# Successful \n# trigger_id {trigger_id} \n# build_id {}",
            build_id.unwrap_or_default()
        ),
        (Some(BuildStatus::TimedOut), _) => format!(
            "# Timed out \n# trigger_id {trigger_id} \n# build_id {}",
            build_id.unwrap_or_default()
        ),
        (_, None) => format!("# Never Triggered \n# trigger_id {trigger_id}"),
        (_, Some(build_id)) => format!("# Failed \n# trigger_id {trigger_id} \n# build_id {build_id}"),
    }
}

/// Status persisted for a finished run. Anything that never got a build id,
/// or ended neither successful nor timed out, is a failure.
pub fn decide_final_status(observed: Option<BuildStatus>, build_id: Option<&str>) -> BuildStatus {
    match (observed, build_id) {
        (_, None) => BuildStatus::Failed,
        (Some(BuildStatus::Successful), Some(_)) => BuildStatus::Successful,
        (Some(BuildStatus::TimedOut), Some(_)) => BuildStatus::TimedOut,
        _ => BuildStatus::Failed,
    }
}

pub fn notification_emoji(status: ReportedStatus) -> &'static str {
    match status {
        ReportedStatus::Unset
        | ReportedStatus::Resolved(BuildStatus::Failed | BuildStatus::TimedOut) => ":x:",
        ReportedStatus::Resolved(BuildStatus::Successful) => ":white_check_mark:",
        ReportedStatus::Resolved(_) => ":information_source:",
    }
}

/// Tag marking the iac-ci comment of one trigger on one PR.
pub fn search_tag(trigger_id: &str, pr_number: i64) -> String {
    format!("iac-ci-{trigger_id}-pr{pr_number}")
}

pub fn pr_target(run: &RunRecord) -> Option<PrTarget> {
    let webhook = &run.webhook;
    Some(PrTarget {
        owner: webhook.owner.clone()?,
        repo: webhook.repo_name.clone()?,
        pr_number: webhook.pr_number?,
    })
}

/// Markdown block appended to the PR comment for one run.
pub fn run_info_section(run: &RunRecord) -> String {
    let webhook = &run.webhook;
    let mut content = format!(
        "\n##  Run(s) Info\n+ Executed By iac-ci\n    + owner: {}\n    + repo: {}\n    + pr_number: {}\n+ {}\n",
        webhook.owner.as_deref().unwrap_or_default(),
        webhook.repo_name.as_deref().unwrap_or_default(),
        webhook.pr_number.map(|n| n.to_string()).unwrap_or_default(),
        webhook.commit_hash.as_deref().unwrap_or_default(),
    );
    if let Some(url) = &run.console_url {
        content.push_str(&format!("\n+ [ci pipeline]({url})"));
    }
    if let Some(url) = &run.build_url {
        content.push_str(&format!("\n+ [execution details]({url})"));
    }
    if let Some(url) = &run.report_url {
        content.push_str(&format!("\n+ [IaC-CI summary]({url})"));
    }
    content
}

/// Caller links first, then commit, pipeline, execution and summary links.
pub fn notification_links(caller: &[Link], run: &RunRecord) -> Vec<Link> {
    let mut links = caller.to_vec();
    if let (Some(label), Some(url)) = (run.webhook.commit_label(), run.webhook.commit_url()) {
        links.push(Link::new(label, url));
    }
    if let Some(url) = &run.console_url {
        links.push(Link::new("ci pipeline", url));
    }
    if let Some(url) = &run.build_url {
        links.push(Link::new("execution details", url));
    }
    if let Some(url) = &run.report_url {
        links.push(Link::new("IaC-CI summary", url));
    }
    links
}

/// Result of an already-finalized run, rebuilt from the stored record.
pub fn stored_result(run: &RunRecord) -> CheckResponse {
    let status = run.is_terminal().then_some(run.build_status);
    CheckResponse {
        should_continue: false,
        status: status.into(),
        build_id: run.build_id.clone(),
        chk_t0: run.chk_t0.unwrap_or_default(),
        chk_count: run.chk_count,
        close: run.is_terminal(),
        msg: Some(build_summary(status, &run.trigger_id, run.build_id.as_deref())),
        ..Default::default()
    }
}

pub struct RunReporter {
    runs: Arc<dyn RunStore>,
    comments: Option<Arc<dyn CommentService>>,
    chat: Arc<dyn ChatNotifier>,
    dashboard_url: Option<String>,
}

impl RunReporter {
    pub fn new(
        runs: Arc<dyn RunStore>,
        comments: Option<Arc<dyn CommentService>>,
        chat: Arc<dyn ChatNotifier>,
    ) -> Self {
        Self {
            runs,
            comments,
            chat,
            dashboard_url: None,
        }
    }

    /// Base URL used for the `IaC-CI summary` link.
    pub fn with_dashboard_url(mut self, url: Option<String>) -> Self {
        self.dashboard_url = url.map(|u| u.trim_end_matches('/').to_string());
        self
    }

    /// Finalizes `run` with the observed status: PR comment, then chat
    /// notification (when `notify` is given), then one store write.
    /// Comment and chat failures are logged and swallowed. The posted PR
    /// comment is linked from the notification.
    pub async fn finalize(
        &self,
        mut run: RunRecord,
        trigger: Option<&TriggerSettings>,
        observed: Option<BuildStatus>,
        notify: Option<Notify>,
        log: &str,
    ) -> StoreResult<CheckResponse> {
        if run.is_terminal() {
            tracing::info!(run_id = %run.run_id, status = %run.build_status, "Run already finalized");
            return Ok(stored_result(&run));
        }

        let build_id = run.build_id.clone();
        let summary = build_summary(observed, &run.trigger_id, build_id.as_deref());
        let status = decide_final_status(observed, build_id.as_deref());
        run.build_status = status;
        if run.report_url.is_none() {
            run.report_url = self
                .dashboard_url
                .as_ref()
                .map(|base| format!("{base}/api/runs/{}", run.run_id));
        }

        tracing::info!(
            run_id = %run.run_id,
            trigger_id = %run.trigger_id,
            build_id = build_id.as_deref().unwrap_or("none"),
            status = %status,
            "Finalizing run"
        );
        tracing::info!(build_id = build_id.as_deref().unwrap_or("none"), "Build log:\n{log}");

        let comment = self.comment_on_pr(&run).await;

        let reported = ReportedStatus::Resolved(status);
        let notify = match notify {
            Some(mut requested) => {
                if let Some(url) = comment.and_then(|c| c.url) {
                    requested.links.push(Link::new("github comment", url));
                }
                Some(self.notify(&run, trigger, reported, requested).await)
            }
            None => None,
        };
        run.notified = notify.is_some();

        self.runs.put_run(&run).await?;
        metrics::build_status_changed(status.as_str());

        Ok(CheckResponse {
            should_continue: false,
            status: reported,
            build_id,
            chk_t0: run.chk_t0.unwrap_or_default(),
            chk_count: run.chk_count,
            notify,
            close: true,
            update: true,
            msg: Some(summary),
        })
    }

    async fn comment_on_pr(&self, run: &RunRecord) -> Option<PrComment> {
        let target = pr_target(run)?;
        let Some(comments) = &self.comments else {
            tracing::warn!(run_id = %run.run_id, "PR comments unavailable, skipping");
            return None;
        };

        let tag = search_tag(&run.trigger_id, target.pr_number);
        let posted = match reconcile_pr_comment(comments.as_ref(), &target, &tag, &run_info_section(run)).await {
            Ok(comment) => Some(comment),
            Err(e) => {
                metrics::notification_failed("github");
                tracing::error!(run_id = %run.run_id, pr = target.pr_number, "PR comment failed: {e}");
                None
            }
        };

        if let Some(status_comment_id) = run.status_comment_id {
            if let Err(e) = comments.delete_comment(&target, status_comment_id).await {
                tracing::debug!(status_comment_id, "Status comment not removed: {e}");
            }
        }
        posted
    }

    async fn notify(
        &self,
        run: &RunRecord,
        trigger: Option<&TriggerSettings>,
        status: ReportedStatus,
        requested: Notify,
    ) -> Notify {
        let emoji = notification_emoji(status);
        let filled = Notify {
            message: Some(requested.message.unwrap_or_else(|| {
                format!(
                    "codebuild with build_id: {}",
                    run.build_id.as_deref().unwrap_or("none")
                )
            })),
            title: Some(
                requested
                    .title
                    .unwrap_or_else(|| format!("{emoji} - iac-ci report")),
            ),
            links: notification_links(&requested.links, run),
        };

        let Some(encoded) = trigger.and_then(|t| t.slack_webhook_b64.as_deref()) else {
            tracing::warn!(trigger_id = %run.trigger_id, "Slack webhook not configured, skipping notification");
            return filled;
        };

        let message = ChatMessage {
            message: filled.message.clone().unwrap_or_default(),
            emoji: emoji.to_string(),
            title: filled.title.clone().unwrap_or_default(),
            links: filled.links.clone(),
            channel: trigger.and_then(|t| t.slack_channel.clone()),
        };

        let sent = match slack_service::decode_webhook_url(encoded) {
            Ok(url) => self.chat.send(&url, &message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            metrics::notification_failed("slack");
            tracing::error!(trigger_id = %run.trigger_id, "Slack notification failed: {e}");
        }
        filled
    }
}

/// Replaces the tagged comment with its old content plus `section`, or
/// creates a fresh one.
async fn reconcile_pr_comment(
    comments: &dyn CommentService,
    target: &PrTarget,
    tag: &str,
    section: &str,
) -> Result<PrComment, NotifyError> {
    let existing = comments.list_comments(target, tag).await?;

    let body = match existing.first() {
        Some(old) => {
            let prior = old.body.replace(&format!("#{tag}"), "");
            comments.delete_comment(target, old.id).await?;
            format!("{}\n{section}", prior.trim())
        }
        None => section.to_string(),
    };

    let created = comments
        .create_comment(target, &format!("{body}\n\n#{tag}"))
        .await?;
    tracing::info!(pr = target.pr_number, comment_id = created.id, "PR comment posted");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WebhookInfo;
    use crate::services::notify::memory::{RecordingChat, RecordingComments};
    use crate::store::InMemoryStore;
    use base64::Engine;
    use rstest::{fixture, rstest};

    struct Harness {
        store: Arc<InMemoryStore>,
        comments: Arc<RecordingComments>,
        chat: Arc<RecordingChat>,
        reporter: RunReporter,
    }

    #[fixture]
    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let comments = Arc::new(RecordingComments::new());
        let chat = Arc::new(RecordingChat::new());
        let reporter = RunReporter::new(store.clone(), Some(comments.clone()), chat.clone())
            .with_dashboard_url(Some("https://ci.example/".to_string()));
        Harness {
            store,
            comments,
            chat,
            reporter,
        }
    }

    fn pr_run() -> RunRecord {
        let mut run = RunRecord::new(
            "trg-1",
            WebhookInfo {
                commit_hash: Some("a1b2c3d4e5".to_string()),
                owner: Some("acme".to_string()),
                repo_name: Some("infra".to_string()),
                pr_number: Some(7),
                event_type: Some("pull_request".to_string()),
                branch: Some("main".to_string()),
            },
        );
        run.build_id = Some("plan:0b9d".to_string());
        run.build_status = BuildStatus::InProgress;
        run.chk_t0 = Some(1_000);
        run.chk_count = 2;
        run.console_url = Some("https://console.example/plan".to_string());
        run
    }

    fn trigger_with_slack() -> TriggerSettings {
        serde_json::from_value(serde_json::json!({
            "_id": "trg-1",
            "repo_name": "infra",
            "owner": "acme",
            "project_name": "plan",
            "slack_webhook_b64": base64::engine::general_purpose::STANDARD
                .encode("https://hooks.slack.example/T/B/x"),
            "slack_channel": "#infra"
        }))
        .unwrap()
    }

    #[rstest]
    #[case(Some(BuildStatus::Successful), Some("p:1"), "# Successful \n# trigger_id t \n# build_id p:1")]
    #[case(Some(BuildStatus::TimedOut), Some("p:1"), "# Timed out \n# trigger_id t \n# build_id p:1")]
    #[case(Some(BuildStatus::Failed), None, "# Never Triggered \n# trigger_id t")]
    #[case(None, Some("p:1"), "# Failed \n# trigger_id t \n# build_id p:1")]
    fn summaries(#[case] observed: Option<BuildStatus>, #[case] build_id: Option<&str>, #[case] expected: &str) {
        assert_eq!(build_summary(observed, "t", build_id), expected);
    }

    #[rstest]
    #[case(Some(BuildStatus::Successful), Some("p:1"), BuildStatus::Successful)]
    #[case(Some(BuildStatus::TimedOut), Some("p:1"), BuildStatus::TimedOut)]
    #[case(Some(BuildStatus::Successful), None, BuildStatus::Failed)]
    #[case(Some(BuildStatus::InProgress), Some("p:1"), BuildStatus::Failed)]
    #[case(None, Some("p:1"), BuildStatus::Failed)]
    fn final_status(#[case] observed: Option<BuildStatus>, #[case] build_id: Option<&str>, #[case] expected: BuildStatus) {
        assert_eq!(decide_final_status(observed, build_id), expected);
    }

    #[rstest]
    #[case(ReportedStatus::Unset, ":x:")]
    #[case(ReportedStatus::Resolved(BuildStatus::TimedOut), ":x:")]
    #[case(ReportedStatus::Resolved(BuildStatus::Successful), ":white_check_mark:")]
    #[case(ReportedStatus::Resolved(BuildStatus::InProgress), ":information_source:")]
    fn emojis(#[case] status: ReportedStatus, #[case] emoji: &str) {
        assert_eq!(notification_emoji(status), emoji);
    }

    #[rstest]
    #[tokio::test]
    async fn finalize_comments_notifies_and_persists_once(harness: Harness) {
        let response = harness
            .reporter
            .finalize(
                pr_run(),
                Some(&trigger_with_slack()),
                Some(BuildStatus::Successful),
                Some(Notify::default()),
                "Apply complete!",
            )
            .await
            .unwrap();

        assert_eq!(response.status, ReportedStatus::Resolved(BuildStatus::Successful));
        assert!(!response.should_continue);
        assert!(response.close);
        assert!(response.update);
        assert_eq!(response.chk_count, 2);
        assert_eq!(harness.comments.created_count(), 1);
        assert_eq!(harness.store.run_writes(), 1);

        let sent = harness.chat.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "https://hooks.slack.example/T/B/x");
        assert_eq!(sent[0].1.title, ":white_check_mark: - iac-ci report");
        assert_eq!(sent[0].1.message, "codebuild with build_id: plan:0b9d");
        let labels: Vec<_> = sent[0].1.links.iter().map(|l| l.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["github comment", "commit - a1b2c3", "ci pipeline", "IaC-CI summary"]
        );
        assert_eq!(
            sent[0].1.links[0].url,
            "https://github.com/acme/infra/pull/7#issuecomment-1"
        );

        let body = &harness.comments.bodies()[0];
        assert!(body.contains("+ [ci pipeline](https://console.example/plan)"));
        assert!(body.ends_with("\n\n#iac-ci-trg-1-pr7"));
    }

    #[rstest]
    #[tokio::test]
    async fn finalize_twice_is_a_no_op(harness: Harness) {
        let first = harness
            .reporter
            .finalize(pr_run(), None, Some(BuildStatus::Failed), Some(Notify::default()), "")
            .await
            .unwrap();
        let stored = harness
            .store
            .get_run(&pr_run_id(&harness).await)
            .await
            .unwrap()
            .unwrap();

        let second = harness
            .reporter
            .finalize(stored, None, Some(BuildStatus::Successful), Some(Notify::default()), "")
            .await
            .unwrap();

        assert_eq!(harness.comments.created_count(), 1);
        assert_eq!(harness.store.run_writes(), 1);
        assert_eq!(second.status, first.status);
        assert!(second.notify.is_none());
    }

    async fn pr_run_id(harness: &Harness) -> String {
        harness
            .store
            .query_runs_by_build_id("plan:0b9d")
            .await
            .unwrap()
            .remove(0)
            .run_id
    }

    #[rstest]
    #[tokio::test]
    async fn existing_tagged_comment_is_replaced(harness: Harness) {
        let run = pr_run();
        let target = pr_target(&run).unwrap();
        let old = harness
            .comments
            .seed(&target, "\n##  Run(s) Info\n+ previous run\n\n#iac-ci-trg-1-pr7");
        let status_comment = harness.comments.seed(&target, "build in progress");
        let mut run = run;
        run.status_comment_id = Some(status_comment);

        harness
            .reporter
            .finalize(run, None, Some(BuildStatus::TimedOut), None, "")
            .await
            .unwrap();

        assert_eq!(harness.comments.deleted(), vec![old, status_comment]);
        let bodies = harness.comments.bodies();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].starts_with("##  Run(s) Info\n+ previous run\n"));
        assert_eq!(bodies[0].matches("#iac-ci-trg-1-pr7").count(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn notification_failures_do_not_escalate() {
        let store = Arc::new(InMemoryStore::new());
        let comments = Arc::new(RecordingComments::new().failing_deletes());
        let reporter = RunReporter::new(store.clone(), Some(comments.clone()), Arc::new(RecordingChat::failing()));
        let mut run = pr_run();
        run.status_comment_id = Some(99);

        let response = reporter
            .finalize(run, Some(&trigger_with_slack()), None, Some(Notify::default()), "")
            .await
            .unwrap();

        assert_eq!(response.status, ReportedStatus::Resolved(BuildStatus::Failed));
        assert_eq!(
            response.notify.and_then(|n| n.title).as_deref(),
            Some(":x: - iac-ci report")
        );
        assert_eq!(store.run_writes(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn never_triggered_run_is_failed(harness: Harness) {
        let mut run = pr_run();
        run.build_id = None;

        let response = harness
            .reporter
            .finalize(run, None, None, None, "")
            .await
            .unwrap();

        assert_eq!(response.status, ReportedStatus::Resolved(BuildStatus::Failed));
        assert_eq!(response.msg.as_deref(), Some("# Never Triggered \n# trigger_id trg-1"));
        assert!(harness.chat.sent().is_empty());
    }
}
