//! Local backends that run build commands as shell processes on this host.
//!
//! [`ShellBuildRunner`] honours the managed-build contract: `submit` spawns
//! the commands in the background and returns a build id, status is read
//! back by id, and the gzip log lands in a [`FsLogStore`] under
//! `<bucket>/codebuild/logs/<uuid>.gz`. Build state is kept in the same
//! store under `<bucket>/codebuild/state/<uuid>.json`, so any process
//! sharing the store can read it. [`LocalFunctionRunner`] honours the
//! function contract: one blocking call that returns the build result.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::{
    BackendBuildState, BackendError, BuildInfo, BuildSubmission, FunctionBackend,
    FunctionInvocation, LogStore, ManagedBuildBackend,
};

/// Output kept per build, from the end.
const MAX_OUTPUT_BYTES: usize = 65536;
/// Size of the log tail a function invocation hands back.
const LOG_TAIL_BYTES: usize = 4096;
/// Outer ceiling of one function invocation.
pub const FUNCTION_TIMEOUT: Duration = Duration::from_secs(900);

/// Result of running a command list.
#[derive(Debug, Clone)]
pub struct CommandRun {
    pub exit_code: i32,
    pub output: String,
    pub timed_out: bool,
}

impl CommandRun {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

fn keep_tail(text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = text.len() - limit;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    format!("...truncated...\n{}", &text[cut..])
}

/// Runs `commands` one after another with `bash -c`, stopping at the first
/// failure. The whole sequence shares one timeout.
pub async fn run_commands(
    commands: &[String],
    env_vars: &BTreeMap<String, String>,
    work_dir: &Path,
    timeout: Duration,
) -> CommandRun {
    let sequence = async {
        let mut output = String::new();
        for command in commands {
            output.push_str(&format!("$ {command}\n"));
            let result = Command::new("bash")
                .args(["-c", command])
                .current_dir(work_dir)
                .env("CI", "true")
                .envs(env_vars)
                .kill_on_drop(true)
                .output()
                .await;

            match result {
                Ok(done) => {
                    output.push_str(&String::from_utf8_lossy(&done.stdout));
                    output.push_str(&String::from_utf8_lossy(&done.stderr));
                    let code = done.status.code().unwrap_or(-1);
                    if code != 0 {
                        return (code, output);
                    }
                }
                Err(e) => {
                    output.push_str(&format!("Failed to execute command: {e}\n"));
                    return (-1, output);
                }
            }
        }
        (0, output)
    };

    match tokio::time::timeout(timeout, sequence).await {
        Ok((exit_code, output)) => CommandRun {
            exit_code,
            output: keep_tail(output, MAX_OUTPUT_BYTES),
            timed_out: false,
        },
        Err(_) => CommandRun {
            exit_code: -1,
            output: format!("Build timed out after {}s", timeout.as_secs()),
            timed_out: true,
        },
    }
}

fn gzip(text: &str) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    encoder.finish()
}

/// Blob store laid out on disk as `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct FsLogStore {
    root: PathBuf,
}

impl FsLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Writes through a temporary file, so readers see the old object or
    /// the new one, never a partial write.
    pub async fn put_object(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), BackendError> {
        let path = self.root.join(bucket).join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl LogStore for FsLogStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BackendError> {
        let path = self.root.join(bucket).join(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackendError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Persisted form of one local build's state.
#[derive(Debug, Serialize, Deserialize)]
struct BuildStateRecord {
    build_id: String,
    project_name: String,
    state: String,
    log_location: Option<String>,
}

impl From<&BuildInfo> for BuildStateRecord {
    fn from(info: &BuildInfo) -> Self {
        Self {
            build_id: info.build_id.clone(),
            project_name: info.project_name.clone(),
            state: info.state.as_str().to_string(),
            log_location: info.log_location.clone(),
        }
    }
}

impl BuildStateRecord {
    fn into_info(self) -> Result<BuildInfo, BackendError> {
        let state = BackendBuildState::parse(&self.state).ok_or_else(|| {
            BackendError::Transport(format!("unknown state {} for {}", self.state, self.build_id))
        })?;
        Ok(BuildInfo {
            build_id: self.build_id,
            project_name: self.project_name,
            state,
            log_location: self.log_location,
        })
    }
}

fn state_key(build_id: &str) -> Option<String> {
    let (_, suffix) = build_id.split_once(':')?;
    (!suffix.is_empty() && !suffix.contains('/')).then(|| format!("codebuild/state/{suffix}.json"))
}

/// Managed-build backend that runs builds as background shell processes.
#[derive(Debug, Clone)]
pub struct ShellBuildRunner {
    workspace_dir: PathBuf,
    log_bucket: String,
    logs: FsLogStore,
}

impl ShellBuildRunner {
    pub fn new(workspace_dir: impl Into<PathBuf>, logs: FsLogStore, log_bucket: &str) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            log_bucket: log_bucket.to_string(),
            logs,
        }
    }

    async fn save_state(&self, info: &BuildInfo) -> Result<(), BackendError> {
        let key = state_key(&info.build_id)
            .ok_or_else(|| BackendError::UnknownBuild(info.build_id.clone()))?;
        let bytes = serde_json::to_vec(&BuildStateRecord::from(info))
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        self.logs.put_object(&self.log_bucket, &key, &bytes).await
    }
}

#[async_trait]
impl ManagedBuildBackend for ShellBuildRunner {
    async fn submit(&self, submission: &BuildSubmission) -> Result<String, BackendError> {
        let suffix = uuid::Uuid::new_v4().to_string();
        let build_id = format!("{}:{suffix}", submission.project_name);
        let log_key = format!("codebuild/logs/{suffix}.gz");
        let work_dir = self.workspace_dir.join(&suffix);
        tokio::fs::create_dir_all(&work_dir).await?;

        let mut info = BuildInfo {
            build_id: build_id.clone(),
            project_name: submission.project_name.clone(),
            state: BackendBuildState::InProgress,
            log_location: Some(format!("{}/{log_key}", self.log_bucket)),
        };
        self.save_state(&info).await?;

        tracing::info!(build_id = %build_id, commands = submission.commands.len(), "Local build submitted");

        let runner = self.clone();
        let submission = submission.clone();
        let id = build_id.clone();
        tokio::spawn(async move {
            let timeout = Duration::from_secs(submission.timeout_secs);
            let run = run_commands(&submission.commands, &submission.env_vars, &work_dir, timeout).await;

            let state = if run.timed_out {
                BackendBuildState::TimedOut
            } else if run.succeeded() {
                BackendBuildState::Succeeded
            } else {
                BackendBuildState::Failed
            };

            match gzip(&run.output) {
                Ok(bytes) => {
                    if let Err(e) = runner.logs.put_object(&runner.log_bucket, &log_key, &bytes).await {
                        tracing::error!(build_id = %id, "Failed to store build log: {e}");
                    }
                }
                Err(e) => tracing::error!(build_id = %id, "Failed to compress build log: {e}"),
            }

            info.state = state;
            if let Err(e) = runner.save_state(&info).await {
                tracing::error!(build_id = %id, "Failed to record build state: {e}");
            }
            let _ = tokio::fs::remove_dir_all(&work_dir).await;

            tracing::info!(build_id = %id, state = state.as_str(), exit_code = run.exit_code, "Local build finished");
        });

        Ok(build_id)
    }

    async fn get_status(&self, build_id: &str) -> Result<BuildInfo, BackendError> {
        let key = state_key(build_id).ok_or_else(|| BackendError::UnknownBuild(build_id.to_string()))?;
        let bytes = match self.logs.get_object(&self.log_bucket, &key).await {
            Ok(bytes) => bytes,
            Err(BackendError::NotFound { .. }) => {
                return Err(BackendError::UnknownBuild(build_id.to_string()))
            }
            Err(e) => return Err(e),
        };
        let record: BuildStateRecord =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::Transport(e.to_string()))?;
        record.into_info()
    }
}

/// Function backend that executes the payload's commands in-process.
///
/// The payload carries `cmds_b64` and `env_vars_b64`, each base64-encoded
/// JSON. A payload that cannot be decoded is answered the way a crashed
/// function is: `errorMessage` plus `stackTrace`.
#[derive(Debug, Clone)]
pub struct LocalFunctionRunner {
    workspace_dir: PathBuf,
}

impl LocalFunctionRunner {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }
}

fn decode_field<T: serde::de::DeserializeOwned>(
    payload: &serde_json::Value,
    field: &str,
) -> Result<T, String> {
    let encoded = payload[field]
        .as_str()
        .ok_or_else(|| format!("missing {field}"))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| format!("{field}: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("{field}: {e}"))
}

#[async_trait]
impl FunctionBackend for LocalFunctionRunner {
    async fn invoke(
        &self,
        function_name: &str,
        payload: &serde_json::Value,
    ) -> Result<FunctionInvocation, BackendError> {
        let decoded = decode_field::<Vec<String>>(payload, "cmds_b64").and_then(|cmds| {
            decode_field::<BTreeMap<String, String>>(payload, "env_vars_b64").map(|env| (cmds, env))
        });

        let (commands, env_vars) = match decoded {
            Ok(parts) => parts,
            Err(message) => {
                let body = serde_json::json!({
                    "errorMessage": message,
                    "stackTrace": [format!("{function_name}: {message}")],
                });
                return Ok(FunctionInvocation {
                    status_code: 200,
                    payload: serde_json::to_vec(&body)
                        .map_err(|e| BackendError::Transport(e.to_string()))?,
                    log_tail_b64: None,
                });
            }
        };

        let work_dir = self.workspace_dir.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&work_dir).await?;
        let run = run_commands(&commands, &env_vars, &work_dir, FUNCTION_TIMEOUT).await;
        let _ = tokio::fs::remove_dir_all(&work_dir).await;

        let inner = serde_json::json!({
            "status": run.succeeded(),
            "exitcode": run.exit_code,
        });
        let body = serde_json::json!({ "body": inner.to_string() });
        let tail = keep_tail(run.output, LOG_TAIL_BYTES);

        Ok(FunctionInvocation {
            status_code: 200,
            payload: serde_json::to_vec(&body).map_err(|e| BackendError::Transport(e.to_string()))?,
            log_tail_b64: Some(base64::engine::general_purpose::STANDARD.encode(tail)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_tail_truncates_from_the_front() {
        let text = "x".repeat(10) + "tail";
        let kept = keep_tail(text, 4);
        assert_eq!(kept, "...truncated...\ntail");
    }

    #[tokio::test]
    async fn fs_log_store_reports_missing_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLogStore::new(dir.path());

        let missing = store.get_object("bucket", "codebuild/logs/a.gz").await;
        assert!(matches!(missing, Err(BackendError::NotFound { .. })));

        store.put_object("bucket", "codebuild/logs/a.gz", b"abc").await.unwrap();
        assert_eq!(store.get_object("bucket", "codebuild/logs/a.gz").await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn commands_stop_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let commands = vec![
            "echo first".to_string(),
            "exit 3".to_string(),
            "echo never".to_string(),
        ];

        let run = run_commands(&commands, &BTreeMap::new(), dir.path(), Duration::from_secs(30)).await;

        assert_eq!(run.exit_code, 3);
        assert!(run.output.contains("first"));
        assert!(!run.output.contains("never\n"));
    }

    #[tokio::test]
    async fn shell_runner_writes_gzip_log_and_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let logs = FsLogStore::new(dir.path().join("blobs"));
        let runner = ShellBuildRunner::new(dir.path().join("work"), logs.clone(), "build-logs");

        let build_id = runner
            .submit(&BuildSubmission {
                project_name: "plan".to_string(),
                commands: vec!["echo hello-from-build".to_string()],
                env_vars: BTreeMap::new(),
                timeout_secs: 30,
            })
            .await
            .unwrap();

        let mut info = runner.get_status(&build_id).await.unwrap();
        for _ in 0..100 {
            if info.state != BackendBuildState::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            info = runner.get_status(&build_id).await.unwrap();
        }

        assert_eq!(info.state, BackendBuildState::Succeeded);
        let suffix = build_id.split_once(':').unwrap().1;
        let key = format!("codebuild/logs/{suffix}.gz");
        assert_eq!(info.log_location.as_deref(), Some(format!("build-logs/{key}").as_str()));
        assert!(!logs.get_object("build-logs", &key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn build_state_is_visible_to_another_runner() {
        let dir = tempfile::tempdir().unwrap();
        let submitter = ShellBuildRunner::new(
            dir.path().join("work"),
            FsLogStore::new(dir.path().join("blobs")),
            "build-logs",
        );
        let checker = ShellBuildRunner::new(
            dir.path().join("work"),
            FsLogStore::new(dir.path().join("blobs")),
            "build-logs",
        );

        let build_id = submitter
            .submit(&BuildSubmission {
                project_name: "plan".to_string(),
                commands: vec!["exit 4".to_string()],
                env_vars: BTreeMap::new(),
                timeout_secs: 30,
            })
            .await
            .unwrap();

        let mut info = checker.get_status(&build_id).await.unwrap();
        for _ in 0..100 {
            if info.state != BackendBuildState::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            info = checker.get_status(&build_id).await.unwrap();
        }

        assert_eq!(info.build_id, build_id);
        assert_eq!(info.state, BackendBuildState::Failed);
    }

    #[tokio::test]
    async fn status_of_unknown_build_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellBuildRunner::new(dir.path(), FsLogStore::new(dir.path()), "build-logs");

        for build_id in ["plan:never-submitted", "no-prefix", "plan:../escape"] {
            let err = runner.get_status(build_id).await.unwrap_err();
            assert!(matches!(err, BackendError::UnknownBuild(_)), "{build_id}: {err}");
        }
    }

    #[tokio::test]
    async fn function_runner_answers_bad_payload_like_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalFunctionRunner::new(dir.path());

        let invocation = runner
            .invoke("iac-ci", &serde_json::json!({ "cmds_b64": "???" }))
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&invocation.payload).unwrap();

        assert_eq!(invocation.status_code, 200);
        assert!(body["stackTrace"].is_array());
    }
}
