//! iac-ci configuration, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::services::log_retriever::LogWindow;
use crate::services::poller::PollLimits;
use crate::store::LookupRetry;

#[derive(Clone, Debug)]
pub struct IacCiConfig {
    /// Application name; prefixes resources such as the function name.
    pub app_name: String,
    /// PostgreSQL URL for the run store. In-memory store when unset.
    pub database_url: Option<String>,
    /// GitHub token for PR comments.
    pub github_token: String,
    /// GitHub REST API base URL.
    pub github_api_url: String,
    /// Per-invocation poll ceiling, kept under the function's hard limit.
    pub run_maxtime_secs: i64,
    /// Total wall-clock ceiling across all poll invocations of one build.
    pub total_maxtime_secs: i64,
    /// Seconds between build status checks.
    pub poll_interval_secs: u64,
    /// How long to keep looking for a build log after completion.
    pub log_window_secs: i64,
    /// Seconds between build log fetch attempts.
    pub log_interval_secs: u64,
    /// Attempts for secondary-index lookups.
    pub lookup_attempts: u32,
    /// Seconds between secondary-index lookup attempts.
    pub lookup_interval_secs: u64,
    /// Function invoked for function-backend builds.
    pub function_name: String,
    /// Scratch directory for local builds.
    pub workspace_dir: PathBuf,
    /// Root of the local blob store holding build logs.
    pub log_store_dir: PathBuf,
    /// Bucket the build logs are written to.
    pub log_bucket: String,
    /// Base URL for run links in comments and notifications.
    pub dashboard_url: Option<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl IacCiConfig {
    pub fn from_env() -> Self {
        let app_name = std::env::var("IAC_CI_APP_NAME").unwrap_or_else(|_| "iac-ci".to_string());
        let database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());
        let github_token = std::env::var("IAC_CI_GITHUB_TOKEN").unwrap_or_default();
        let github_api_url = std::env::var("IAC_CI_GITHUB_API_URL")
            .unwrap_or_else(|_| "https://api.github.com".to_string());
        let function_name =
            std::env::var("IAC_CI_FUNCTION_NAME").unwrap_or_else(|_| app_name.clone());
        let workspace_dir = std::env::var("IAC_CI_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("iac-ci"));
        let log_store_dir = std::env::var("IAC_CI_LOG_STORE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace_dir.join("blobs"));
        let log_bucket =
            std::env::var("IAC_CI_LOG_BUCKET").unwrap_or_else(|_| format!("{app_name}-logs"));
        let dashboard_url = std::env::var("IAC_CI_DASHBOARD_URL").ok();

        if github_token.is_empty() {
            tracing::warn!("IAC_CI_GITHUB_TOKEN not set -- PR comments unavailable");
        }
        if database_url.is_none() {
            tracing::warn!("DATABASE_URL not set -- runs are kept in memory only");
        }

        Self {
            app_name,
            database_url,
            github_token,
            github_api_url,
            run_maxtime_secs: env_or("IAC_CI_RUN_MAXTIME", 800),
            total_maxtime_secs: env_or("IAC_CI_TOTAL_MAXTIME", 1800),
            poll_interval_secs: env_or("IAC_CI_POLL_INTERVAL", 5),
            log_window_secs: env_or("IAC_CI_LOG_WINDOW", 30),
            log_interval_secs: env_or("IAC_CI_LOG_INTERVAL", 2),
            lookup_attempts: env_or("IAC_CI_LOOKUP_ATTEMPTS", 24),
            lookup_interval_secs: env_or("IAC_CI_LOOKUP_INTERVAL", 5),
            function_name,
            workspace_dir,
            log_store_dir,
            log_bucket,
            dashboard_url,
        }
    }

    pub fn poll_limits(&self) -> PollLimits {
        PollLimits {
            run_maxtime: self.run_maxtime_secs,
            total_maxtime: self.total_maxtime_secs,
            interval: Duration::from_secs(self.poll_interval_secs),
        }
    }

    pub fn log_window(&self) -> LogWindow {
        LogWindow {
            max_wait: self.log_window_secs,
            interval: Duration::from_secs(self.log_interval_secs),
        }
    }

    pub fn lookup_retry(&self) -> LookupRetry {
        LookupRetry {
            attempts: self.lookup_attempts,
            interval: Duration::from_secs(self.lookup_interval_secs),
        }
    }
}
