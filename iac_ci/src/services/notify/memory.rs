//! Recording notifiers used by tests and local runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{ChatMessage, ChatNotifier, CommentService, NotifyError, PrComment, PrTarget};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// PR comment service that keeps comments in memory.
#[derive(Debug, Default)]
pub struct RecordingComments {
    state: Mutex<CommentState>,
}

#[derive(Debug, Default)]
struct CommentState {
    next_id: i64,
    comments: BTreeMap<i64, (PrTarget, String)>,
    created: usize,
    deleted: Vec<i64>,
    fail_deletes: bool,
}

impl RecordingComments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delete call fails; lists and creates still work.
    pub fn failing_deletes(self) -> Self {
        lock(&self.state).fail_deletes = true;
        self
    }

    /// Seeds an existing comment and returns its id.
    pub fn seed(&self, target: &PrTarget, body: &str) -> i64 {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state.comments.insert(id, (target.clone(), body.to_string()));
        id
    }

    pub fn created_count(&self) -> usize {
        lock(&self.state).created
    }

    pub fn deleted(&self) -> Vec<i64> {
        lock(&self.state).deleted.clone()
    }

    /// Bodies of the comments still present, oldest first.
    pub fn bodies(&self) -> Vec<String> {
        lock(&self.state)
            .comments
            .values()
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl CommentService for RecordingComments {
    async fn list_comments(
        &self,
        target: &PrTarget,
        search_tag: &str,
    ) -> Result<Vec<PrComment>, NotifyError> {
        let needle = format!("#{search_tag}");
        Ok(lock(&self.state)
            .comments
            .iter()
            .filter(|(_, (t, body))| t == target && body.contains(&needle))
            .map(|(id, (_, body))| PrComment {
                id: *id,
                url: None,
                body: body.clone(),
            })
            .collect())
    }

    async fn create_comment(&self, target: &PrTarget, body: &str) -> Result<PrComment, NotifyError> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        state.created += 1;
        let id = state.next_id;
        state.comments.insert(id, (target.clone(), body.to_string()));
        Ok(PrComment {
            id,
            url: Some(format!(
                "https://github.com/{}/pull/{}#issuecomment-{id}",
                target.full_repo(),
                target.pr_number
            )),
            body: body.to_string(),
        })
    }

    async fn delete_comment(&self, _target: &PrTarget, comment_id: i64) -> Result<(), NotifyError> {
        let mut state = lock(&self.state);
        if state.fail_deletes {
            return Err(NotifyError::Rejected {
                service: "github",
                status: 404,
                body: "Not Found".to_string(),
            });
        }
        state.comments.remove(&comment_id);
        state.deleted.push(comment_id);
        Ok(())
    }
}

/// Chat notifier that records every message.
#[derive(Debug, Default)]
pub struct RecordingChat {
    sent: Mutex<Vec<(String, ChatMessage)>>,
    fail: bool,
}

impl RecordingChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<(String, ChatMessage)> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl ChatNotifier for RecordingChat {
    async fn send(&self, webhook_url: &str, message: &ChatMessage) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Rejected {
                service: "slack",
                status: 500,
                body: "internal_error".to_string(),
            });
        }
        lock(&self.sent).push((webhook_url.to_string(), message.clone()));
        Ok(())
    }
}
