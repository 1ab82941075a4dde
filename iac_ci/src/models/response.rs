//! Response contract returned to the invoking orchestrator.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::models::run::BuildStatus;

/// `status` on the wire: a terminal status string, or `false` while the
/// build has not resolved (or never could).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportedStatus {
    #[default]
    Unset,
    Resolved(BuildStatus),
}

impl ReportedStatus {
    pub fn resolved(self) -> Option<BuildStatus> {
        match self {
            Self::Unset => None,
            Self::Resolved(status) => Some(status),
        }
    }
}

impl From<Option<BuildStatus>> for ReportedStatus {
    fn from(status: Option<BuildStatus>) -> Self {
        status.map_or(Self::Unset, Self::Resolved)
    }
}

impl Serialize for ReportedStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unset => serializer.serialize_bool(false),
            Self::Resolved(status) => serializer.serialize_str(status.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for ReportedStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Text(String),
        }

        match Option::<Raw>::deserialize(deserializer)? {
            None | Some(Raw::Flag(false)) => Ok(Self::Unset),
            Some(Raw::Flag(true)) => Ok(Self::Resolved(BuildStatus::Successful)),
            Some(Raw::Text(text)) => text
                .parse()
                .map(Self::Resolved)
                .map_err(de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub label: String,
    pub url: String,
}

impl Link {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

/// Notification request attached to a result. Its presence is what asks
/// for a chat notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    /// `true` asks the caller to invoke the check again.
    #[serde(rename = "continue")]
    pub should_continue: bool,
    pub status: ReportedStatus,
    pub build_id: Option<String>,
    pub chk_t0: i64,
    pub chk_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<Notify>,
    #[serde(default)]
    pub close: bool,
    #[serde(default)]
    pub update: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

/// Next state for a step-function style scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTransition {
    Continue,
    Failed,
    Discontinue,
}

impl StepTransition {
    pub fn state_name(self) -> &'static str {
        match self {
            Self::Continue => "check_codebuild/_continue",
            Self::Failed => "check_codebuild/_failed",
            Self::Discontinue => "check_codebuild/_discontinue",
        }
    }
}

impl Serialize for StepTransition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.state_name())
    }
}
