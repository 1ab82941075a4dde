//! Compute and blob-storage backends the orchestrator talks to.
//!
//! Two build backends exist: a managed build service (submit, then poll by
//! build id) and a function-invocation service (one blocking call that
//! returns status and a log tail). Build logs live in a blob store as
//! gzip objects.

pub mod local;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::BuildStatus;

/// Build state as reported by the managed build service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendBuildState {
    InProgress,
    Succeeded,
    Failed,
    Fault,
    Stopped,
    TimedOut,
}

impl BackendBuildState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Fault => "FAULT",
            Self::Stopped => "STOPPED",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IN_PROGRESS" => Some(Self::InProgress),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "FAULT" => Some(Self::Fault),
            "STOPPED" => Some(Self::Stopped),
            "TIMED_OUT" => Some(Self::TimedOut),
            _ => None,
        }
    }

    /// Run status for a terminal backend state; `None` while still running.
    pub fn terminal_status(self) -> Option<BuildStatus> {
        match self {
            Self::InProgress => None,
            Self::Succeeded => Some(BuildStatus::Successful),
            Self::Failed | Self::Fault | Self::Stopped => Some(BuildStatus::Failed),
            Self::TimedOut => Some(BuildStatus::TimedOut),
        }
    }
}

/// One status lookup on the managed build service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub build_id: String,
    pub project_name: String,
    pub state: BackendBuildState,
    /// Blob location of the build logs, `<bucket>/codebuild/logs/...`.
    pub log_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSubmission {
    pub project_name: String,
    pub commands: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub timeout_secs: u64,
}

/// Raw result of a function invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInvocation {
    pub status_code: u16,
    pub payload: Vec<u8>,
    /// Base64 tail of the invocation's captured output.
    pub log_tail_b64: Option<String>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("unknown build: {0}")]
    UnknownBuild(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Managed build service: submit returns at once with a build id.
#[async_trait]
pub trait ManagedBuildBackend: Send + Sync {
    async fn submit(&self, submission: &BuildSubmission) -> Result<String, BackendError>;

    async fn get_status(&self, build_id: &str) -> Result<BuildInfo, BackendError>;
}

/// Function-invocation service: the call blocks until the build is done.
#[async_trait]
pub trait FunctionBackend: Send + Sync {
    async fn invoke(
        &self,
        function_name: &str,
        payload: &serde_json::Value,
    ) -> Result<FunctionInvocation, BackendError>;
}

/// Blob store holding compressed build logs.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BackendError>;
}
