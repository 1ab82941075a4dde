//! iac-ci: webhook-driven build orchestration for infrastructure pipelines.
//!
//! GitHub events trigger builds on a managed build service or a function
//! backend. Managed builds are polled in bounded passes that hand back a
//! checkpoint between invocations; finished runs are reported to the pull
//! request and to Slack.

pub mod backends;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod schema;
pub mod services;
pub mod store;

pub use error::IacCiError;
