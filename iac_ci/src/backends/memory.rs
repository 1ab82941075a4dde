//! Scripted in-memory backends for tests and dry runs.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::{
    BackendBuildState, BackendError, BuildInfo, BuildSubmission, FunctionBackend,
    FunctionInvocation, LogStore, ManagedBuildBackend,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Managed build backend that replays a fixed sequence of states.
///
/// Each status query pops the next scripted answer; once the script runs
/// out the last state repeats (or `IN_PROGRESS` if nothing was scripted).
#[derive(Debug)]
pub struct ScriptedBuildBackend {
    project_name: String,
    log_bucket: String,
    state: Mutex<ScriptState>,
}

#[derive(Debug, Default)]
struct ScriptState {
    script: VecDeque<Result<BackendBuildState, String>>,
    steady: Option<BackendBuildState>,
    submissions: Vec<BuildSubmission>,
    fail_submit: Option<String>,
    queries: usize,
}

impl ScriptedBuildBackend {
    pub fn new(project_name: &str, log_bucket: &str) -> Self {
        Self {
            project_name: project_name.to_string(),
            log_bucket: log_bucket.to_string(),
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Queues states answered by successive status queries.
    pub fn with_states(self, states: impl IntoIterator<Item = BackendBuildState>) -> Self {
        lock(&self.state).script.extend(states.into_iter().map(Ok));
        self
    }

    /// Queues a transport failure for the next unanswered status query.
    pub fn with_query_error(self, message: &str) -> Self {
        lock(&self.state).script.push_back(Err(message.to_string()));
        self
    }

    pub fn failing_submit(self, message: &str) -> Self {
        lock(&self.state).fail_submit = Some(message.to_string());
        self
    }

    pub fn submissions(&self) -> Vec<BuildSubmission> {
        lock(&self.state).submissions.clone()
    }

    pub fn query_count(&self) -> usize {
        lock(&self.state).queries
    }

    fn log_location(&self, build_id: &str) -> Option<String> {
        let (_, suffix) = build_id.split_once(':')?;
        Some(format!("{}/codebuild/logs/{suffix}.gz", self.log_bucket))
    }
}

#[async_trait]
impl ManagedBuildBackend for ScriptedBuildBackend {
    async fn submit(&self, submission: &BuildSubmission) -> Result<String, BackendError> {
        let mut state = lock(&self.state);
        if let Some(message) = &state.fail_submit {
            return Err(BackendError::Transport(message.clone()));
        }
        state.submissions.push(submission.clone());
        Ok(format!("{}:{}", submission.project_name, uuid::Uuid::new_v4()))
    }

    async fn get_status(&self, build_id: &str) -> Result<BuildInfo, BackendError> {
        let next = {
            let mut state = lock(&self.state);
            state.queries += 1;
            match state.script.pop_front() {
                Some(Ok(found)) => {
                    state.steady = Some(found);
                    Ok(found)
                }
                Some(Err(message)) => Err(message),
                None => Ok(state.steady.unwrap_or(BackendBuildState::InProgress)),
            }
        };

        let found = next.map_err(BackendError::Transport)?;
        Ok(BuildInfo {
            build_id: build_id.to_string(),
            project_name: self.project_name.clone(),
            state: found,
            log_location: self.log_location(build_id),
        })
    }
}

/// Function backend returning one canned invocation result.
#[derive(Debug)]
pub struct ScriptedFunctionBackend {
    answer: Mutex<Result<FunctionInvocation, String>>,
    calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl ScriptedFunctionBackend {
    pub fn answering(invocation: FunctionInvocation) -> Self {
        Self {
            answer: Mutex::new(Ok(invocation)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable(message: &str) -> Self {
        Self {
            answer: Mutex::new(Err(message.to_string())),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl FunctionBackend for ScriptedFunctionBackend {
    async fn invoke(
        &self,
        function_name: &str,
        payload: &serde_json::Value,
    ) -> Result<FunctionInvocation, BackendError> {
        lock(&self.calls).push((function_name.to_string(), payload.clone()));
        lock(&self.answer).clone().map_err(BackendError::Transport)
    }
}

/// Blob store whose objects only become visible after a number of misses.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    misses_before_visible: Mutex<usize>,
    reads: Mutex<usize>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every read before the `n`th fails with `NotFound`.
    pub fn visible_after(self, misses: usize) -> Self {
        *lock(&self.misses_before_visible) = misses;
        self
    }

    pub fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        lock(&self.objects).insert((bucket.to_string(), key.to_string()), bytes);
    }

    /// Stores `text` gzip-compressed, the way build logs are written.
    pub fn put_gzipped(&self, bucket: &str, key: &str, text: &str) -> std::io::Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes())?;
        self.put(bucket, key, encoder.finish()?);
        Ok(())
    }

    pub fn read_count(&self) -> usize {
        *lock(&self.reads)
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BackendError> {
        let read = {
            let mut reads = lock(&self.reads);
            *reads += 1;
            *reads
        };

        let not_found = || BackendError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };

        if read <= *lock(&self.misses_before_visible) {
            return Err(not_found());
        }

        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(not_found)
    }
}
