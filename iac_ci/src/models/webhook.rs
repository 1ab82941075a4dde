//! Webhook linkage carried on a run: which commit / PR caused it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookInfo {
    pub commit_hash: Option<String>,
    pub owner: Option<String>,
    pub repo_name: Option<String>,
    pub pr_number: Option<i64>,
    pub event_type: Option<String>,
    pub branch: Option<String>,
}

impl WebhookInfo {
    /// `owner/repo`, when both halves are known.
    pub fn full_repo(&self) -> Option<String> {
        match (self.owner.as_deref(), self.repo_name.as_deref()) {
            (Some(owner), Some(repo)) => Some(format!("{owner}/{repo}")),
            _ => None,
        }
    }

    pub fn commit_url(&self) -> Option<String> {
        let repo = self.full_repo()?;
        let commit = self.commit_hash.as_deref()?;
        Some(format!("https://github.com/{repo}/commit/{commit}"))
    }

    /// Short label for the commit: the first six characters of the hash.
    pub fn commit_label(&self) -> Option<String> {
        let commit = self.commit_hash.as_deref()?;
        let short: String = commit.chars().take(6).collect();
        Some(format!("commit - {short}"))
    }

    pub fn is_push(&self) -> bool {
        self.event_type.as_deref() == Some("push")
    }
}
