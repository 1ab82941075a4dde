//! Prometheus metrics for build orchestration.

use metrics::{counter, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook received event.
pub fn webhook_received(event_type: &str) {
    counter!("iac_ci_webhooks_received_total", "event" => event_type.to_string()).increment(1);
}

/// Record a build handed to a backend.
pub fn build_dispatched(backend: &str) {
    counter!("iac_ci_builds_dispatched_total", "backend" => backend.to_string()).increment(1);
}

/// Record a run status transition.
pub fn build_status_changed(status: &str) {
    counter!("iac_ci_builds_total", "status" => status.to_string()).increment(1);
}

/// Record one backend status query.
pub fn poll_iteration() {
    counter!("iac_ci_poll_iterations_total").increment(1);
}

/// Record wall-clock seconds from first check to terminal status.
pub fn build_wait(seconds: i64) {
    histogram!("iac_ci_build_wait_seconds").record(seconds.max(0) as f64);
}

/// Record a build log fetch outcome (`found` / `missing`).
pub fn log_fetch(outcome: &str) {
    counter!("iac_ci_log_fetch_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a swallowed comment or chat failure.
pub fn notification_failed(channel: &str) {
    counter!("iac_ci_notification_failures_total", "channel" => channel.to_string()).increment(1);
}
