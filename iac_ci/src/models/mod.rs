//! iac-ci data models: run records, trigger settings and the response contract.

pub mod response;
pub mod run;
pub mod trigger;
pub mod webhook;

pub use response::{CheckResponse, Link, Notify, ReportedStatus, StepTransition};
pub use run::{BuildStatus, Checkpoint, RunRecord};
pub use trigger::{BuildBackend, BuildMethod, TriggerSettings};
pub use webhook::WebhookInfo;
