//! `iac_ci.runs`: one record per build execution attempt.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::webhook::WebhookInfo;

/// Lifecycle of a run as persisted in the run store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    InProgress,
    Successful,
    Failed,
    TimedOut,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    /// Terminal runs are never polled, finalized, or notified again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown build status: {0}")]
pub struct UnknownBuildStatus(pub String);

impl FromStr for BuildStatus {
    type Err = UnknownBuildStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "successful" | "success" => Ok(Self::Successful),
            "failed" | "failure" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(UnknownBuildStatus(other.to_string())),
        }
    }
}

/// Minimal state needed to resume polling in a later invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Epoch seconds of the very first status check.
    pub chk_t0: i64,
    /// Number of poll passes so far, including the current one.
    pub chk_count: i64,
    /// Absolute deadline computed at dispatch time.
    pub build_expire_at: i64,
}

impl Checkpoint {
    /// Opens a new poll pass.
    ///
    /// `chk_t0` is only ever set once: a missing (or zero) value becomes
    /// `now`, anything already recorded is carried forward untouched.
    pub fn resume(chk_t0: Option<i64>, chk_count: i64, build_expire_at: i64, now: i64) -> Self {
        let chk_t0 = match chk_t0 {
            Some(t0) if t0 > 0 => t0,
            _ => now,
        };
        Self {
            chk_t0,
            chk_count: chk_count.max(0) + 1,
            build_expire_at,
        }
    }
}

/// A run record. `_id` is the store key; `build_id` is the secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(rename = "_id")]
    pub run_id: String,
    pub trigger_id: String,
    /// Backend-assigned identifier, `<project>:<uuid>`.
    pub build_id: Option<String>,
    pub build_status: BuildStatus,
    pub chk_t0: Option<i64>,
    #[serde(default)]
    pub chk_count: i64,
    pub build_expire_at: Option<i64>,
    /// Transient "build in progress" PR comment, removed on finalize.
    pub status_comment_id: Option<i64>,
    #[serde(default)]
    pub webhook: WebhookInfo,
    pub console_url: Option<String>,
    pub build_url: Option<String>,
    pub report_url: Option<String>,
    /// Set once the terminal notification went out.
    #[serde(default)]
    pub notified: bool,
}

impl RunRecord {
    /// New pending run for a trigger. The id combines the trigger, the
    /// branch (when known) and a random suffix.
    pub fn new(trigger_id: &str, webhook: WebhookInfo) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let run_id = match webhook.branch.as_deref() {
            Some(branch) if !branch.is_empty() => format!("{trigger_id}-{branch}-{}", &suffix[..12]),
            _ => format!("{trigger_id}-{suffix}"),
        };

        Self {
            run_id,
            trigger_id: trigger_id.to_string(),
            build_id: None,
            build_status: BuildStatus::Pending,
            chk_t0: None,
            chk_count: 0,
            build_expire_at: None,
            status_comment_id: None,
            webhook,
            console_url: None,
            build_url: None,
            report_url: None,
            notified: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.build_status.is_terminal()
    }

    /// Part of the build id after the `<project>:` prefix.
    pub fn build_id_suffix(&self) -> Option<&str> {
        self.build_id
            .as_deref()
            .and_then(|id| id.split_once(':'))
            .map(|(_, suffix)| suffix)
    }

    /// Records the checkpoint of a poll pass on the run.
    pub fn apply_checkpoint(&mut self, checkpoint: &Checkpoint) {
        self.chk_t0 = Some(checkpoint.chk_t0);
        self.chk_count = checkpoint.chk_count;
        self.build_expire_at = Some(checkpoint.build_expire_at);
    }
}
