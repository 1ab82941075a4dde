//! Build log retrieval from the blob store.
//!
//! Logs land in the store some time after the build finishes, so fetches
//! retry inside a short window before giving up.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;

use crate::backends::LogStore;
use crate::clock::RunContext;
use crate::metrics;

const LOG_PREFIX: &str = "/codebuild/logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogWindow {
    /// Seconds to keep retrying after the first attempt.
    pub max_wait: i64,
    pub interval: Duration,
}

impl Default for LogWindow {
    fn default() -> Self {
        Self {
            max_wait: 30,
            interval: Duration::from_secs(2),
        }
    }
}

/// Where a build's log object lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLocation {
    pub build_id: String,
    pub bucket: String,
    pub key: String,
}

impl LogLocation {
    /// Key is `codebuild/logs/<uuid>.gz`; the bucket comes from the location
    /// the backend reported, or `default_bucket` when it reported none.
    pub fn for_build(
        build_id: &str,
        reported_location: Option<&str>,
        default_bucket: &str,
    ) -> Option<Self> {
        let (_, suffix) = build_id.split_once(':')?;
        let bucket = reported_location
            .and_then(|location| location.split(LOG_PREFIX).next())
            .map(|bucket| bucket.trim_start_matches("arn:aws:s3:::"))
            .filter(|bucket| !bucket.is_empty())
            .unwrap_or(default_bucket);

        Some(Self {
            build_id: build_id.to_string(),
            bucket: bucket.to_string(),
            key: format!("codebuild/logs/{suffix}.gz"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrievedLog {
    Available(String),
    Unavailable,
}

impl RetrievedLog {
    pub fn text_or_placeholder(&self, build_id: &str) -> String {
        match self {
            Self::Available(text) => text.clone(),
            Self::Unavailable => unavailable_placeholder(build_id),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

pub fn unavailable_placeholder(build_id: &str) -> String {
    format!("failed to retrieved log \nbuild_id \"{build_id}\"")
}

/// Gunzips a log object and decodes it as (lossy) UTF-8.
pub fn decode_gzip_log(bytes: &[u8]) -> std::io::Result<String> {
    let mut decoder = GzDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

pub struct LogRetriever {
    store: Arc<dyn LogStore>,
    window: LogWindow,
}

impl LogRetriever {
    pub fn new(store: Arc<dyn LogStore>, window: LogWindow) -> Self {
        Self { store, window }
    }

    pub async fn fetch(&self, ctx: &RunContext, location: &LogLocation) -> RetrievedLog {
        let started = ctx.now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.store.get_object(&location.bucket, &location.key).await {
                Ok(bytes) => match decode_gzip_log(&bytes) {
                    Ok(text) => {
                        metrics::log_fetch("found");
                        tracing::debug!(build_id = %location.build_id, attempt, bytes = bytes.len(), "Build log retrieved");
                        return RetrievedLog::Available(text);
                    }
                    Err(e) => {
                        tracing::error!(build_id = %location.build_id, "Build log is not valid gzip: {e}");
                        break;
                    }
                },
                Err(e) => {
                    tracing::debug!(build_id = %location.build_id, attempt, "Build log not ready: {e}");
                }
            }

            if ctx.now() - started >= self.window.max_wait {
                break;
            }
            ctx.sleep(self.window.interval).await;
        }

        metrics::log_fetch("missing");
        tracing::warn!(
            build_id = %location.build_id,
            bucket = %location.bucket,
            key = %location.key,
            "Build log unavailable"
        );
        RetrievedLog::Unavailable
    }
}
