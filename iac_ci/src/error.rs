//! Top-level error type for the orchestration entry points.

use thiserror::Error;

use crate::models::CheckResponse;
use crate::services::dispatcher::{DispatchError, ExitCode};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("github token is required for PR comments")]
    MissingGithubToken,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum IacCiError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("run not found for {0}")]
    RunNotFound(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The build ran and failed; the exit code tells transport failures
    /// apart from command failures. `response` is the finalized result.
    #[error("build failed (exit {}): {message}", exit_code.code())]
    BuildFailed {
        exit_code: ExitCode,
        message: String,
        run_id: String,
        response: Box<CheckResponse>,
    },
}
