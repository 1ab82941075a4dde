//! Inbound event normalization.
//!
//! Events arrive directly, wrapped in an SNS envelope, as an API-gateway
//! request with a JSON `body` string, or as a build state-change
//! notification. All of them collapse to the flat JSON the entry points
//! read.

use serde_json::{json, Value};

use crate::error::IacCiError;

pub const CHECK_BUILD_PHASE: &str = "check_build";

/// Unwraps envelopes and rewrites build state-change events.
pub fn normalize_event(event: Value) -> Result<Value, IacCiError> {
    let event = unwrap_sns(event)?;
    let event = unwrap_body(event)?;
    Ok(rewrite_state_change(event))
}

fn unwrap_sns(event: Value) -> Result<Value, IacCiError> {
    match event.pointer("/Records/0/Sns/Message").and_then(Value::as_str) {
        Some(message) => serde_json::from_str(message)
            .map_err(|e| IacCiError::InvalidEvent(format!("sns message: {e}"))),
        None => Ok(event),
    }
}

fn unwrap_body(event: Value) -> Result<Value, IacCiError> {
    match event.get("body").and_then(Value::as_str) {
        Some(body) => {
            serde_json::from_str(body).map_err(|e| IacCiError::InvalidEvent(format!("body: {e}")))
        }
        None => Ok(event),
    }
}

fn rewrite_state_change(event: Value) -> Value {
    let Some(detail) = event.get("detail") else {
        return event;
    };
    let (Some(status), Some(arn)) = (
        detail.get("build-status").and_then(Value::as_str),
        detail.get("build-id").and_then(Value::as_str),
    ) else {
        return event;
    };

    let build_id = arn.rsplit('/').next().unwrap_or(arn);
    tracing::debug!(build_id, status, "Build state-change event");
    json!({
        "phase": CHECK_BUILD_PHASE,
        "build_status": status,
        "build_id": build_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_events_pass_through() {
        let event = json!({"build_id": "plan:1", "chk_count": 2});
        assert_eq!(normalize_event(event.clone()).unwrap(), event);
    }

    #[test]
    fn sns_message_is_unwrapped() {
        let event = json!({
            "Records": [{ "Sns": { "Message": "{\"run_id\":\"trg-main-abc\"}" } }]
        });
        assert_eq!(normalize_event(event).unwrap(), json!({"run_id": "trg-main-abc"}));
    }

    #[test]
    fn state_change_becomes_check_build() {
        let event = json!({
            "detail-type": "CodeBuild Build State Change",
            "detail": {
                "build-status": "SUCCEEDED",
                "build-id": "arn:aws:codebuild:us-east-1:123456789012:build/plan:0b9d1e6e"
            }
        });
        assert_eq!(
            normalize_event(event).unwrap(),
            json!({"phase": "check_build", "build_status": "SUCCEEDED", "build_id": "plan:0b9d1e6e"})
        );
    }

    #[test]
    fn state_change_inside_sns_is_rewritten() {
        let inner = json!({"detail": {"build-status": "FAILED", "build-id": "build/plan:1"}});
        let event = json!({"Records": [{"Sns": {"Message": inner.to_string()}}]});
        assert_eq!(normalize_event(event).unwrap()["build_id"], "plan:1");
    }

    #[test]
    fn gateway_body_is_parsed() {
        let event = json!({"body": "{\"build_id\":\"plan:2\"}", "headers": {}});
        assert_eq!(normalize_event(event).unwrap(), json!({"build_id": "plan:2"}));
    }

    #[test]
    fn broken_sns_message_is_rejected() {
        let event = json!({"Records": [{"Sns": {"Message": "not json"}}]});
        assert!(matches!(normalize_event(event), Err(IacCiError::InvalidEvent(_))));
    }
}
