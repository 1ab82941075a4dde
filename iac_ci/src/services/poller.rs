//! Bounded status polling for managed builds.
//!
//! One pass polls until the build is terminal or one of three deadlines
//! fires:
//!
//! * total: `now - chk_t0 > total_maxtime` forces `timed_out`
//! * run: `now - run_t0 > run_maxtime` ends the pass without a status so the
//!   caller can re-invoke with the checkpoint
//! * build: `now > build_expire_at` forces `timed_out`
//!
//! Once a deadline forces `timed_out` the backend is not queried again.

use std::sync::Arc;
use std::time::Duration;

use crate::backends::{BuildInfo, ManagedBuildBackend};
use crate::clock::RunContext;
use crate::metrics;
use crate::models::{BuildStatus, Checkpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollLimits {
    /// Seconds this invocation may spend polling.
    pub run_maxtime: i64,
    /// Seconds since the first check after which the build is abandoned.
    pub total_maxtime: i64,
    pub interval: Duration,
}

impl Default for PollLimits {
    fn default() -> Self {
        Self {
            run_maxtime: 800,
            total_maxtime: 1800,
            interval: Duration::from_secs(5),
        }
    }
}

/// Why a pass ended with a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCause {
    Backend,
    TotalDeadline,
    BuildDeadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Invocation ceiling reached; poll again with the checkpoint.
    Continue,
    Terminal {
        status: BuildStatus,
        cause: TerminalCause,
    },
}

impl PollOutcome {
    pub fn status(&self) -> Option<BuildStatus> {
        match self {
            Self::Continue => None,
            Self::Terminal { status, .. } => Some(*status),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollReport {
    pub outcome: PollOutcome,
    pub checkpoint: Checkpoint,
    /// Last successful backend answer, if any.
    pub last_seen: Option<BuildInfo>,
    pub queries: usize,
}

pub struct StatusPoller {
    backend: Arc<dyn ManagedBuildBackend>,
    limits: PollLimits,
}

impl StatusPoller {
    pub fn new(backend: Arc<dyn ManagedBuildBackend>, limits: PollLimits) -> Self {
        Self { backend, limits }
    }

    pub fn limits(&self) -> PollLimits {
        self.limits
    }

    /// Runs one poll pass. The checkpoint is resumed from the previous pass
    /// (`chk_t0` kept, `chk_count` bumped) before anything else happens.
    pub async fn poll(
        &self,
        ctx: &RunContext,
        build_id: &str,
        chk_t0: Option<i64>,
        chk_count: i64,
        build_expire_at: i64,
    ) -> PollReport {
        let run_t0 = ctx.now();
        let checkpoint = Checkpoint::resume(chk_t0, chk_count, build_expire_at, run_t0);
        tracing::info!(
            build_id,
            chk_t0 = checkpoint.chk_t0,
            chk_count = checkpoint.chk_count,
            build_expire_at,
            "Polling build status"
        );

        let mut queries = 0;
        let mut last_seen = None;
        let mut current = self.query(build_id, &mut queries, &mut last_seen).await;

        let outcome = loop {
            if let Some(status) = current {
                break PollOutcome::Terminal {
                    status,
                    cause: TerminalCause::Backend,
                };
            }

            let now = ctx.now();
            if now - checkpoint.chk_t0 > self.limits.total_maxtime {
                tracing::warn!(build_id, elapsed = now - checkpoint.chk_t0, "Total poll time exceeded");
                break PollOutcome::Terminal {
                    status: BuildStatus::TimedOut,
                    cause: TerminalCause::TotalDeadline,
                };
            }
            if now - run_t0 > self.limits.run_maxtime {
                tracing::info!(build_id, chk_count = checkpoint.chk_count, "Invocation ceiling reached");
                break PollOutcome::Continue;
            }
            if now > checkpoint.build_expire_at {
                tracing::warn!(build_id, build_expire_at, "Build expired");
                break PollOutcome::Terminal {
                    status: BuildStatus::TimedOut,
                    cause: TerminalCause::BuildDeadline,
                };
            }

            ctx.sleep(self.limits.interval).await;
            current = self.query(build_id, &mut queries, &mut last_seen).await;
        };

        if let PollOutcome::Terminal { status, .. } = outcome {
            metrics::build_wait(ctx.now() - checkpoint.chk_t0);
            tracing::info!(build_id, status = %status, queries, "Build reached terminal status");
        }

        PollReport {
            outcome,
            checkpoint,
            last_seen,
            queries,
        }
    }

    /// Terminal status from one backend query. Errors read as "still running".
    async fn query(
        &self,
        build_id: &str,
        queries: &mut usize,
        last_seen: &mut Option<BuildInfo>,
    ) -> Option<BuildStatus> {
        *queries += 1;
        metrics::poll_iteration();
        match self.backend.get_status(build_id).await {
            Ok(info) => {
                tracing::debug!(build_id, state = info.state.as_str(), "Build status");
                let status = info.state.terminal_status();
                *last_seen = Some(info);
                status
            }
            Err(e) => {
                tracing::warn!(build_id, "Build status query failed: {e}");
                None
            }
        }
    }
}
