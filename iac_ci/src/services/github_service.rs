//! GitHub integration: webhook validation and PR comments.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::ConfigError;
use crate::services::notify::{CommentService, NotifyError, PrComment, PrTarget};

type HmacSha256 = Hmac<Sha256>;

const USER_AGENT: &str = "iac-ci";
/// Upper bound on comment pages read for one PR.
const MAX_COMMENT_PAGES: usize = 50;

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// The `rel="next"` target of a `Link` response header.
pub fn next_page_url(link: &str) -> Option<String> {
    link.split(',').find_map(|entry| {
        let mut parts = entry.split(';').map(str::trim);
        let url = parts.next()?.strip_prefix('<')?.strip_suffix('>')?;
        parts
            .any(|param| param == r#"rel="next""#)
            .then(|| url.to_string())
    })
}

#[derive(Debug, Deserialize)]
struct IssueComment {
    id: i64,
    html_url: Option<String>,
    #[serde(default)]
    body: Option<String>,
}

impl From<IssueComment> for PrComment {
    fn from(comment: IssueComment) -> Self {
        Self {
            id: comment.id,
            url: comment.html_url,
            body: comment.body.unwrap_or_default(),
        }
    }
}

/// PR comments through the GitHub REST API.
#[derive(Clone)]
pub struct GitHubComments {
    client: reqwest::Client,
    token: String,
    api_url: String,
}

impl GitHubComments {
    pub fn new(token: &str, api_url: &str) -> Result<Self, ConfigError> {
        if token.is_empty() {
            return Err(ConfigError::MissingGithubToken);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            token: token.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, NotifyError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(NotifyError::Rejected {
            service: "github",
            status,
            body,
        })
    }
}

#[async_trait]
impl CommentService for GitHubComments {
    async fn list_comments(
        &self,
        target: &PrTarget,
        search_tag: &str,
    ) -> Result<Vec<PrComment>, NotifyError> {
        let mut url = Some(format!(
            "{}/repos/{}/issues/{}/comments?per_page=100",
            self.api_url,
            target.full_repo(),
            target.pr_number
        ));
        let needle = format!("#{search_tag}");
        let mut found = Vec::new();

        for _ in 0..MAX_COMMENT_PAGES {
            let Some(page) = url.take() else {
                break;
            };
            let resp = Self::check(self.request(reqwest::Method::GET, &page).send().await?).await?;
            url = resp
                .headers()
                .get(reqwest::header::LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_page_url);
            let comments: Vec<IssueComment> = resp.json().await?;
            found.extend(
                comments
                    .into_iter()
                    .map(PrComment::from)
                    .filter(|comment| comment.body.contains(&needle)),
            );
        }

        if url.is_some() {
            tracing::warn!(repo = %target.full_repo(), pr = target.pr_number, "Stopped reading comments after {MAX_COMMENT_PAGES} pages");
        }
        Ok(found)
    }

    async fn create_comment(&self, target: &PrTarget, body: &str) -> Result<PrComment, NotifyError> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_url,
            target.full_repo(),
            target.pr_number
        );
        let payload = serde_json::json!({ "body": body });
        let resp = Self::check(
            self.request(reqwest::Method::POST, &url)
                .json(&payload)
                .send()
                .await?,
        )
        .await?;
        let created: IssueComment = resp.json().await?;
        tracing::debug!(repo = %target.full_repo(), pr = target.pr_number, comment_id = created.id, "PR comment created");
        Ok(created.into())
    }

    async fn delete_comment(&self, target: &PrTarget, comment_id: i64) -> Result<(), NotifyError> {
        let url = format!(
            "{}/repos/{}/issues/comments/{comment_id}",
            self.api_url,
            target.full_repo()
        );
        Self::check(self.request(reqwest::Method::DELETE, &url).send().await?).await?;
        Ok(())
    }
}
