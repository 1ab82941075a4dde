//! Key-value run store over the `runs` and `settings` record families.
//!
//! Both families support get-by-key, lookup by a secondary index and
//! upsert. Secondary-index reads can lag writes, so the lookups here retry
//! for a bounded number of attempts.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::clock::RunContext;
use crate::models::{RunRecord, TriggerSettings};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("record encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Persistence for run records.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get_run(&self, run_id: &str) -> StoreResult<Option<RunRecord>>;

    /// Secondary-index read on `build_id`; may lag recent writes.
    async fn query_runs_by_build_id(&self, build_id: &str) -> StoreResult<Vec<RunRecord>>;

    /// Insert or replace, keyed by `run_id`.
    async fn put_run(&self, run: &RunRecord) -> StoreResult<()>;
}

/// Persistence for trigger settings. Read-only to the build path.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_trigger(&self, trigger_id: &str) -> StoreResult<Option<TriggerSettings>>;

    async fn query_triggers_by_repo(&self, repo_name: &str) -> StoreResult<Vec<TriggerSettings>>;

    async fn put_trigger(&self, trigger: &TriggerSettings) -> StoreResult<()>;
}

/// Retry budget for secondary-index lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupRetry {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for LookupRetry {
    fn default() -> Self {
        Self {
            attempts: 24,
            interval: Duration::from_secs(5),
        }
    }
}

/// Finds the run for `build_id`, retrying while the index has not caught
/// up. Query errors count as misses. `None` once the budget is spent.
pub async fn find_run_by_build_id(
    store: &dyn RunStore,
    ctx: &RunContext,
    retry: LookupRetry,
    build_id: &str,
) -> Option<RunRecord> {
    for attempt in 1..=retry.attempts {
        match store.query_runs_by_build_id(build_id).await {
            Ok(mut runs) if !runs.is_empty() => {
                tracing::debug!(build_id, attempt, "Found run by build_id");
                return Some(runs.swap_remove(0));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(build_id, attempt, "Run lookup failed: {e}"),
        }
        if attempt < retry.attempts {
            ctx.sleep(retry.interval).await;
        }
    }

    tracing::warn!(build_id, attempts = retry.attempts, "Could not find run for build_id");
    None
}

/// Triggers configured for `repo_name`. Only query errors are retried: an
/// empty answer is a real answer.
pub async fn find_triggers_by_repo(
    store: &dyn SettingsStore,
    ctx: &RunContext,
    retry: LookupRetry,
    repo_name: &str,
) -> Vec<TriggerSettings> {
    for attempt in 1..=retry.attempts {
        match store.query_triggers_by_repo(repo_name).await {
            Ok(triggers) => return triggers,
            Err(e) => tracing::warn!(repo_name, attempt, "Trigger lookup failed: {e}"),
        }
        if attempt < retry.attempts {
            ctx.sleep(retry.interval).await;
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::WebhookInfo;

    use mockall::mock;

    mock! {
        Runs {}

        #[async_trait]
        impl RunStore for Runs {
            async fn get_run(&self, run_id: &str) -> StoreResult<Option<RunRecord>>;
            async fn query_runs_by_build_id(&self, build_id: &str) -> StoreResult<Vec<RunRecord>>;
            async fn put_run(&self, run: &RunRecord) -> StoreResult<()>;
        }
    }

    fn run_with_build(build_id: &str) -> RunRecord {
        let mut run = RunRecord::new("trg", WebhookInfo::default());
        run.build_id = Some(build_id.to_string());
        run
    }

    #[tokio::test]
    async fn lookup_retries_until_index_catches_up() {
        let clock = ManualClock::at_epoch(0);
        let ctx = RunContext::manual(&clock);
        let mut seq = mockall::Sequence::new();
        let mut store = MockRuns::new();
        store
            .expect_query_runs_by_build_id()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Vec::new()));
        store
            .expect_query_runs_by_build_id()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| Ok(vec![run_with_build(id)]));

        let found = find_run_by_build_id(&store, &ctx, LookupRetry::default(), "p:1").await;

        assert_eq!(found.and_then(|r| r.build_id).as_deref(), Some("p:1"));
        assert_eq!(clock.sleep_count(), 2);
        assert_eq!(clock.epoch(), 10);
    }

    #[tokio::test]
    async fn lookup_gives_up_after_budget() {
        let clock = ManualClock::at_epoch(0);
        let ctx = RunContext::manual(&clock);
        let mut store = MockRuns::new();
        store
            .expect_query_runs_by_build_id()
            .times(24)
            .returning(|_| Err(StoreError::Pool("down".to_string())));

        let found = find_run_by_build_id(&store, &ctx, LookupRetry::default(), "p:1").await;

        assert!(found.is_none());
        assert_eq!(clock.sleep_count(), 23);
    }
}
