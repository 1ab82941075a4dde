//! Outbound notification ports: PR comments and chat messages.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Link;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} answered {status}: {body}")]
    Rejected {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("invalid webhook reference: {0}")]
    InvalidWebhook(String),
}

/// The pull request a comment belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrTarget {
    pub owner: String,
    pub repo: String,
    pub pr_number: i64,
}

impl PrTarget {
    pub fn full_repo(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrComment {
    pub id: i64,
    pub url: Option<String>,
    pub body: String,
}

#[async_trait]
pub trait CommentService: Send + Sync {
    /// Comments on the PR whose body carries `#<search_tag>`.
    async fn list_comments(
        &self,
        target: &PrTarget,
        search_tag: &str,
    ) -> Result<Vec<PrComment>, NotifyError>;

    async fn create_comment(&self, target: &PrTarget, body: &str) -> Result<PrComment, NotifyError>;

    async fn delete_comment(&self, target: &PrTarget, comment_id: i64) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub message: String,
    pub emoji: String,
    pub title: String,
    pub links: Vec<Link>,
    pub channel: Option<String>,
}

#[async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn send(&self, webhook_url: &str, message: &ChatMessage) -> Result<(), NotifyError>;
}
