//! Build dispatch to the managed build service or the function backend.
//!
//! Dispatch never touches the run record; callers persist what comes back.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use serde_json::Value;
use thiserror::Error;

use crate::backends::{BackendError, BuildSubmission, FunctionBackend, ManagedBuildBackend};
use crate::clock::RunContext;
use crate::metrics;
use crate::models::{BuildMethod, TriggerSettings};

/// Upper bound on a managed build's lifetime, in seconds.
pub const MAX_BUILD_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("backend unreachable: {0}")]
    Transport(#[source] BackendError),

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),
}

/// Synthetic exit codes for function-backend results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    /// The invocation itself failed (non-200).
    TransportFailure,
    /// The invocation ran but the build commands failed.
    CommandFailure,
}

impl ExitCode {
    pub fn code(self) -> &'static str {
        match self {
            Self::Success => "0",
            Self::TransportFailure => "78",
            Self::CommandFailure => "79",
        }
    }

    fn generic_message(self) -> &'static str {
        match self {
            Self::Success => "",
            Self::TransportFailure => "lambda function failed",
            Self::CommandFailure => "execution of cmd in lambda function failed",
        }
    }
}

/// Effective timeout for a managed build. Absent, non-numeric and
/// non-positive requests fall back to the ceiling; larger ones are clamped.
pub fn effective_build_timeout(requested: Option<&Value>) -> u64 {
    let secs = match requested {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match secs {
        Some(s) if s.is_finite() && s >= 1.0 => (s as u64).min(MAX_BUILD_TIMEOUT_SECS),
        _ => MAX_BUILD_TIMEOUT_SECS,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedDispatch {
    pub build_id: String,
    pub build_expire_at: i64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionOutcome {
    pub succeeded: bool,
    pub status_code: u16,
    pub exit_code: ExitCode,
    pub failed_message: Option<String>,
    /// Decoded log tail; empty when the backend sent none.
    pub output: String,
}

/// Hands builds to whichever backend the trigger selects.
#[derive(Clone)]
pub struct BuildDispatcher {
    managed: Arc<dyn ManagedBuildBackend>,
    function: Arc<dyn FunctionBackend>,
    function_name: String,
}

impl BuildDispatcher {
    pub fn new(
        managed: Arc<dyn ManagedBuildBackend>,
        function: Arc<dyn FunctionBackend>,
        function_name: impl Into<String>,
    ) -> Self {
        Self {
            managed,
            function,
            function_name: function_name.into(),
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Submits to the managed build service and computes the absolute
    /// build deadline.
    pub async fn dispatch_managed(
        &self,
        ctx: &RunContext,
        trigger: &TriggerSettings,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<ManagedDispatch, DispatchError> {
        let timeout_secs = effective_build_timeout(trigger.build_timeout.as_ref());
        let submission = BuildSubmission {
            project_name: trigger.project_name.clone(),
            commands: trigger.build_commands.clone(),
            env_vars: merged_env(trigger, extra_env),
            timeout_secs,
        };

        let build_id = self
            .managed
            .submit(&submission)
            .await
            .map_err(DispatchError::Transport)?;
        if !build_id.contains(':') {
            return Err(DispatchError::MalformedResponse(format!(
                "build id without project prefix: {build_id}"
            )));
        }

        metrics::build_dispatched("codebuild");
        tracing::info!(
            trigger_id = %trigger.trigger_id,
            build_id = %build_id,
            timeout_secs,
            "Build submitted"
        );

        Ok(ManagedDispatch {
            build_id,
            build_expire_at: ctx.now() + timeout_secs as i64,
            timeout_secs,
        })
    }

    /// Runs the build through the function backend and waits for it.
    pub async fn invoke_function(
        &self,
        trigger: &TriggerSettings,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<FunctionOutcome, DispatchError> {
        let payload = function_payload(&trigger.build_commands, &merged_env(trigger, extra_env))?;

        let invocation = self
            .function
            .invoke(&self.function_name, &payload)
            .await
            .map_err(DispatchError::Transport)?;
        metrics::build_dispatched("lambda");

        let output = invocation
            .log_tail_b64
            .as_deref()
            .and_then(|tail| base64::engine::general_purpose::STANDARD.decode(tail).ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();

        if invocation.status_code != 200 {
            tracing::error!(
                function = %self.function_name,
                status_code = invocation.status_code,
                "Function invocation failed"
            );
            return Ok(failure(
                ExitCode::TransportFailure,
                invocation.status_code,
                trigger.method,
                None,
                output,
            ));
        }

        let body: Value = serde_json::from_slice(&invocation.payload)
            .map_err(|e| DispatchError::MalformedResponse(e.to_string()))?;

        if let Some(inner) = body.get("body").and_then(Value::as_str) {
            let inner: Value = serde_json::from_str(inner)
                .map_err(|e| DispatchError::MalformedResponse(e.to_string()))?;
            let succeeded = inner.get("status").and_then(Value::as_bool).unwrap_or(false);
            if succeeded {
                return Ok(FunctionOutcome {
                    succeeded: true,
                    status_code: invocation.status_code,
                    exit_code: ExitCode::Success,
                    failed_message: None,
                    output,
                });
            }
            return Ok(failure(
                ExitCode::CommandFailure,
                invocation.status_code,
                trigger.method,
                None,
                output,
            ));
        }

        if let Some(trace) = body.get("stackTrace") {
            let trace = match trace {
                Value::Array(lines) => lines
                    .iter()
                    .map(|line| line.as_str().map_or_else(|| line.to_string(), str::to_string))
                    .collect::<Vec<_>>()
                    .join(" "),
                other => other.to_string(),
            };
            return Ok(failure(
                ExitCode::CommandFailure,
                invocation.status_code,
                trigger.method,
                Some(trace),
                output,
            ));
        }

        Err(DispatchError::MalformedResponse(
            "payload has neither body nor stackTrace".to_string(),
        ))
    }
}

fn merged_env(
    trigger: &TriggerSettings,
    extra_env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = trigger.env_vars.clone();
    env.extend(extra_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

fn function_payload(
    commands: &[String],
    env_vars: &BTreeMap<String, String>,
) -> Result<Value, DispatchError> {
    let encode = |value: Vec<u8>| base64::engine::general_purpose::STANDARD.encode(value);
    let cmds = serde_json::to_vec(commands)
        .map_err(|e| DispatchError::MalformedResponse(e.to_string()))?;
    let env = serde_json::to_vec(env_vars)
        .map_err(|e| DispatchError::MalformedResponse(e.to_string()))?;
    Ok(serde_json::json!({
        "cmds_b64": encode(cmds),
        "env_vars_b64": encode(env),
    }))
}

/// Failure outcome. The method's own message wins over `detail` (a joined
/// stack trace), which wins over the exit code's generic message.
fn failure(
    exit_code: ExitCode,
    status_code: u16,
    method: BuildMethod,
    detail: Option<String>,
    output: String,
) -> FunctionOutcome {
    let message = method
        .failure_message()
        .map(str::to_string)
        .or(detail)
        .unwrap_or_else(|| exit_code.generic_message().to_string());
    FunctionOutcome {
        succeeded: false,
        status_code,
        exit_code,
        failed_message: Some(message),
        output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{ScriptedBuildBackend, ScriptedFunctionBackend};
    use crate::backends::FunctionInvocation;
    use crate::clock::ManualClock;
    use rstest::rstest;
    use serde_json::json;

    fn trigger(method: BuildMethod, timeout: Option<Value>) -> TriggerSettings {
        serde_json::from_value(json!({
            "_id": "trg-1",
            "repo_name": "infra",
            "owner": "acme",
            "project_name": "plan",
            "method": method,
            "build_commands": ["terraform plan"],
            "build_timeout": timeout,
        }))
        .unwrap()
    }

    fn dispatcher(function: ScriptedFunctionBackend) -> BuildDispatcher {
        BuildDispatcher::new(
            Arc::new(ScriptedBuildBackend::new("plan", "logs")),
            Arc::new(function),
            "iac-ci",
        )
    }

    fn answered(status_code: u16, payload: Value, tail: Option<&str>) -> ScriptedFunctionBackend {
        ScriptedFunctionBackend::answering(FunctionInvocation {
            status_code,
            payload: serde_json::to_vec(&payload).unwrap(),
            log_tail_b64: tail.map(|t| base64::engine::general_purpose::STANDARD.encode(t)),
        })
    }

    #[rstest]
    #[case(Some(json!(900)), 600)]
    #[case(Some(json!(300)), 300)]
    #[case(Some(json!("450")), 450)]
    #[case(Some(json!("forever")), 600)]
    #[case(Some(json!(0)), 600)]
    #[case(Some(json!(-5)), 600)]
    #[case(None, 600)]
    fn timeout_is_clamped(#[case] requested: Option<Value>, #[case] expected: u64) {
        assert_eq!(effective_build_timeout(requested.as_ref()), expected);
    }

    #[rstest]
    #[case(Some(json!(900)))]
    #[case(Some(json!("n/a")))]
    #[case(None)]
    #[tokio::test]
    async fn managed_dispatch_expires_within_ceiling(#[case] requested: Option<Value>) {
        let clock = ManualClock::at_epoch(10_000);
        let ctx = RunContext::manual(&clock);
        let dispatcher = dispatcher(ScriptedFunctionBackend::unreachable("unused"));

        let dispatched = dispatcher
            .dispatch_managed(&ctx, &trigger(BuildMethod::Ci, requested), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(dispatched.build_expire_at, 10_600);
        assert!(dispatched.build_id.starts_with("plan:"));
    }

    #[tokio::test]
    async fn submit_failure_is_a_dispatch_error() {
        let ctx = RunContext::manual(&ManualClock::at_epoch(0));
        let dispatcher = BuildDispatcher::new(
            Arc::new(ScriptedBuildBackend::new("plan", "logs").failing_submit("throttled")),
            Arc::new(ScriptedFunctionBackend::unreachable("unused")),
            "iac-ci",
        );

        let err = dispatcher
            .dispatch_managed(&ctx, &trigger(BuildMethod::Ci, None), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
    }

    #[tokio::test]
    async fn non_200_is_a_transport_failure() {
        let dispatcher = dispatcher(answered(502, json!({}), None));
        let outcome = dispatcher
            .invoke_function(&trigger(BuildMethod::Ci, None), &BTreeMap::new())
            .await
            .unwrap();

        assert!(!outcome.succeeded);
        assert_eq!(outcome.exit_code.code(), "78");
        assert_eq!(outcome.failed_message.as_deref(), Some("lambda function failed"));
    }

    #[rstest]
    #[case(BuildMethod::Ci, "execution of cmd in lambda function failed")]
    #[case(BuildMethod::Validate, "the resources have drifted")]
    #[case(BuildMethod::Destroy, "destroying of resources have failed")]
    #[tokio::test]
    async fn failed_commands_use_method_message(#[case] method: BuildMethod, #[case] message: &str) {
        let body = json!({ "body": json!({"status": false, "exitcode": 1}).to_string() });
        let dispatcher = dispatcher(answered(200, body, Some("Error: drift")));

        let outcome = dispatcher
            .invoke_function(&trigger(method, None), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, ExitCode::CommandFailure);
        assert_eq!(outcome.failed_message.as_deref(), Some(message));
        assert_eq!(outcome.output, "Error: drift");
    }

    #[rstest]
    #[case(BuildMethod::Apply, "applying of resources have failed")]
    #[case(BuildMethod::Create, "creation of resources have failed")]
    #[case(BuildMethod::Ci, "line one line two")]
    #[tokio::test]
    async fn stack_trace_yields_to_method_message(#[case] method: BuildMethod, #[case] message: &str) {
        let body = json!({ "errorMessage": "boom", "stackTrace": ["line one", "line two"] });
        let dispatcher = dispatcher(answered(200, body, None));

        let outcome = dispatcher
            .invoke_function(&trigger(method, None), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(outcome.exit_code.code(), "79");
        assert_eq!(outcome.failed_message.as_deref(), Some(message));
    }

    #[tokio::test]
    async fn success_carries_payload_and_log_tail() {
        let body = json!({ "body": json!({"status": true, "exitcode": 0}).to_string() });
        let backend = Arc::new(answered(200, body, Some("Apply complete!")));
        let dispatcher = BuildDispatcher::new(
            Arc::new(ScriptedBuildBackend::new("plan", "logs")),
            backend.clone(),
            "iac-ci",
        );

        let outcome = dispatcher
            .invoke_function(&trigger(BuildMethod::Ci, None), &BTreeMap::new())
            .await
            .unwrap();
        assert!(outcome.succeeded);
        assert_eq!(outcome.output, "Apply complete!");

        let calls = backend.calls();
        assert_eq!(calls[0].0, "iac-ci");
        let cmds = base64::engine::general_purpose::STANDARD
            .decode(calls[0].1["cmds_b64"].as_str().unwrap())
            .unwrap();
        assert_eq!(serde_json::from_slice::<Vec<String>>(&cmds).unwrap(), vec!["terraform plan"]);
    }

    #[tokio::test]
    async fn unrecognised_payload_is_malformed() {
        let dispatcher = dispatcher(answered(200, json!({"ok": true}), None));
        let err = dispatcher
            .invoke_function(&trigger(BuildMethod::Ci, None), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MalformedResponse(_)));
    }
}
