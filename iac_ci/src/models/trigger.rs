//! `iac_ci.settings`: one record per configured repository integration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which compute backend runs the build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildBackend {
    /// Managed build service: submit now, poll later.
    #[default]
    Codebuild,
    /// Function invocation: one blocking call.
    Lambda,
}

/// What the build is asked to do; drives the failure wording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMethod {
    #[default]
    Ci,
    Validate,
    Check,
    PreCreate,
    Apply,
    Create,
    Destroy,
}

impl BuildMethod {
    /// Failure message reported when a build for this method fails.
    pub fn failure_message(self) -> Option<&'static str> {
        match self {
            Self::Ci => None,
            Self::Validate => Some("the resources have drifted"),
            Self::Check => Some("the resources failed check"),
            Self::PreCreate => Some("the resources failed pre-create"),
            Self::Apply => Some("applying of resources have failed"),
            Self::Create => Some("creation of resources have failed"),
            Self::Destroy => Some("destroying of resources have failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSettings {
    #[serde(rename = "_id")]
    pub trigger_id: String,
    pub repo_name: String,
    pub owner: String,
    /// Only events on this branch trigger builds; any branch when unset.
    pub branch: Option<String>,
    #[serde(default)]
    pub backend: BuildBackend,
    #[serde(default)]
    pub method: BuildMethod,
    /// Managed-build project name; also the build id prefix.
    pub project_name: String,
    #[serde(default)]
    pub build_commands: Vec<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    /// Requested build timeout in seconds. Kept raw: callers may send a
    /// number, a numeric string, or nothing.
    pub build_timeout: Option<serde_json::Value>,
    pub webhook_secret: Option<String>,
    /// Base64-encoded Slack incoming-webhook URL.
    pub slack_webhook_b64: Option<String>,
    pub slack_channel: Option<String>,
}
