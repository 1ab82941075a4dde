//! In-memory run and settings store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{RunStore, SettingsStore, StoreResult};
use crate::models::{RunRecord, TriggerSettings};

/// Thread-safe in-memory store covering both record families.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<InMemoryState>>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    runs: HashMap<String, RunRecord>,
    settings: HashMap<String, TriggerSettings>,
    run_writes: usize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryState> {
        self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryState> {
        self.state.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of `put_run` calls so far.
    pub fn run_writes(&self) -> usize {
        self.read().run_writes
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn get_run(&self, run_id: &str) -> StoreResult<Option<RunRecord>> {
        Ok(self.read().runs.get(run_id).cloned())
    }

    async fn query_runs_by_build_id(&self, build_id: &str) -> StoreResult<Vec<RunRecord>> {
        Ok(self
            .read()
            .runs
            .values()
            .filter(|run| run.build_id.as_deref() == Some(build_id))
            .cloned()
            .collect())
    }

    async fn put_run(&self, run: &RunRecord) -> StoreResult<()> {
        let mut state = self.write();
        state.runs.insert(run.run_id.clone(), run.clone());
        state.run_writes += 1;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for InMemoryStore {
    async fn get_trigger(&self, trigger_id: &str) -> StoreResult<Option<TriggerSettings>> {
        Ok(self.read().settings.get(trigger_id).cloned())
    }

    async fn query_triggers_by_repo(&self, repo_name: &str) -> StoreResult<Vec<TriggerSettings>> {
        Ok(self
            .read()
            .settings
            .values()
            .filter(|trigger| trigger.repo_name == repo_name)
            .cloned()
            .collect())
    }

    async fn put_trigger(&self, trigger: &TriggerSettings) -> StoreResult<()> {
        self.write()
            .settings
            .insert(trigger.trigger_id.clone(), trigger.clone());
        Ok(())
    }
}
