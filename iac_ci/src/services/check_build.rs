//! One check-build invocation: resume polling, then finalize or hand back a
//! checkpoint.

use std::sync::Arc;

use serde::Deserialize;

use crate::clock::RunContext;
use crate::error::IacCiError;
use crate::models::{BuildStatus, CheckResponse, Notify, RunRecord, StepTransition, TriggerSettings};
use crate::services::dispatcher::MAX_BUILD_TIMEOUT_SECS;
use crate::services::log_retriever::{unavailable_placeholder, LogLocation, LogRetriever};
use crate::services::poller::{PollOutcome, StatusPoller};
use crate::services::reporter::{stored_result, RunReporter};
use crate::store::{find_run_by_build_id, LookupRetry, RunStore, SettingsStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CheckBuildRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub build_id: Option<String>,
    #[serde(default)]
    pub chk_t0: Option<i64>,
    #[serde(default)]
    pub chk_count: Option<i64>,
    /// State pushed by a build state-change event, if that is what woke us.
    #[serde(default)]
    pub build_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Not terminal yet; invoke again with the checkpoint in the response.
    Continue(CheckResponse),
    Terminal(CheckResponse),
}

impl CheckOutcome {
    pub fn response(&self) -> &CheckResponse {
        match self {
            Self::Continue(response) | Self::Terminal(response) => response,
        }
    }

    pub fn into_response(self) -> CheckResponse {
        match self {
            Self::Continue(response) | Self::Terminal(response) => response,
        }
    }

    pub fn transition(&self) -> StepTransition {
        match self {
            Self::Continue(_) => StepTransition::Continue,
            Self::Terminal(response) => match response.status.resolved() {
                Some(BuildStatus::Successful) => StepTransition::Discontinue,
                _ => StepTransition::Failed,
            },
        }
    }
}

pub struct BuildChecker {
    runs: Arc<dyn RunStore>,
    settings: Arc<dyn SettingsStore>,
    poller: StatusPoller,
    logs: LogRetriever,
    reporter: RunReporter,
    lookup: LookupRetry,
    log_bucket: String,
}

impl BuildChecker {
    pub fn new(
        runs: Arc<dyn RunStore>,
        settings: Arc<dyn SettingsStore>,
        poller: StatusPoller,
        logs: LogRetriever,
        reporter: RunReporter,
    ) -> Self {
        Self {
            runs,
            settings,
            poller,
            logs,
            reporter,
            lookup: LookupRetry::default(),
            log_bucket: String::new(),
        }
    }

    pub fn with_lookup(mut self, lookup: LookupRetry) -> Self {
        self.lookup = lookup;
        self
    }

    /// Bucket used when the backend reports no log location.
    pub fn with_log_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.log_bucket = bucket.into();
        self
    }

    pub async fn check(&self, ctx: &RunContext, req: &CheckBuildRequest) -> Result<CheckOutcome, IacCiError> {
        let mut run = self.load_run(ctx, req).await?;

        if run.is_terminal() {
            tracing::info!(run_id = %run.run_id, status = %run.build_status, "Run already terminal");
            return Ok(CheckOutcome::Terminal(stored_result(&run)));
        }

        let Some(build_id) = run.build_id.clone().or_else(|| req.build_id.clone()) else {
            tracing::warn!(run_id = %run.run_id, "Run was never triggered");
            let trigger = self.trigger_for(&run).await;
            let response = self
                .reporter
                .finalize(run, trigger.as_ref(), None, Some(Notify::default()), "")
                .await?;
            return Ok(CheckOutcome::Terminal(response));
        };
        run.build_id = Some(build_id.clone());

        if let Some(pushed) = &req.build_status {
            tracing::debug!(build_id = %build_id, pushed = %pushed, "Woken by build state change");
        }

        let chk_t0 = req.chk_t0.filter(|t| *t > 0).or(run.chk_t0);
        let chk_count = req.chk_count.unwrap_or(0).max(run.chk_count);
        let build_expire_at = run
            .build_expire_at
            .unwrap_or_else(|| chk_t0.unwrap_or_else(|| ctx.now()) + MAX_BUILD_TIMEOUT_SECS as i64);

        let report = self
            .poller
            .poll(ctx, &build_id, chk_t0, chk_count, build_expire_at)
            .await;
        run.apply_checkpoint(&report.checkpoint);
        if run.build_status == BuildStatus::Pending {
            run.build_status = BuildStatus::InProgress;
        }

        let status = match report.outcome {
            PollOutcome::Continue => {
                self.runs.put_run(&run).await?;
                return Ok(CheckOutcome::Continue(CheckResponse {
                    should_continue: true,
                    build_id: Some(build_id),
                    chk_t0: report.checkpoint.chk_t0,
                    chk_count: report.checkpoint.chk_count,
                    ..Default::default()
                }));
            }
            PollOutcome::Terminal { status, cause } => {
                tracing::info!(build_id = %build_id, status = %status, ?cause, "Poll pass finished");
                status
            }
        };

        let reported_location = report.last_seen.as_ref().and_then(|info| info.log_location.as_deref());
        let log = match LogLocation::for_build(&build_id, reported_location, &self.log_bucket) {
            Some(location) => self.logs.fetch(ctx, &location).await.text_or_placeholder(&build_id),
            None => unavailable_placeholder(&build_id),
        };

        let trigger = self.trigger_for(&run).await;
        let response = self
            .reporter
            .finalize(run, trigger.as_ref(), Some(status), Some(Notify::default()), &log)
            .await?;
        Ok(CheckOutcome::Terminal(response))
    }

    async fn load_run(&self, ctx: &RunContext, req: &CheckBuildRequest) -> Result<RunRecord, IacCiError> {
        if let Some(run_id) = &req.run_id {
            return self
                .runs
                .get_run(run_id)
                .await?
                .ok_or_else(|| IacCiError::RunNotFound(run_id.clone()));
        }
        let Some(build_id) = &req.build_id else {
            return Err(IacCiError::InvalidEvent("neither run_id nor build_id given".to_string()));
        };
        find_run_by_build_id(self.runs.as_ref(), ctx, self.lookup, build_id)
            .await
            .ok_or_else(|| IacCiError::RunNotFound(build_id.clone()))
    }

    /// Trigger settings for notification; missing settings only cost the
    /// chat message.
    async fn trigger_for(&self, run: &RunRecord) -> Option<TriggerSettings> {
        match self.settings.get_trigger(&run.trigger_id).await {
            Ok(trigger) => trigger,
            Err(e) => {
                tracing::warn!(trigger_id = %run.trigger_id, "Trigger lookup failed: {e}");
                None
            }
        }
    }
}
