//! iac-ci services: dispatch, polling, logs, reporting and the two entry
//! flows built on them.

pub mod check_build;
pub mod dispatcher;
pub mod github_service;
pub mod log_retriever;
pub mod notify;
pub mod poller;
pub mod reporter;
pub mod slack_service;
pub mod trigger_build;
