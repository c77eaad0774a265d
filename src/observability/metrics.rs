//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): admitted requests by outcome, status
//! - `gateway_request_duration_seconds` (histogram): end to end latency
//! - `gateway_routing_miss_total` (counter): unknown host or no route
//! - `waf_hits_total` (counter): flood and group policy hits by action
//! - `background_tasks_dropped_total` / `background_task_failures_total`
//! - `replication_calls_total`, `replication_auth_rejected_total`
//! - `kernel_blocklist_updates_total`
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until the
//!   Prometheus recorder is installed

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(outcome: &'static str, status: u16, elapsed: Duration) {
    metrics::counter!("gateway_requests_total", "outcome" => outcome, "status" => status.to_string()).increment(1);
    metrics::histogram!("gateway_request_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_routing_miss(reason: &'static str) {
    metrics::counter!("gateway_routing_miss_total", "reason" => reason).increment(1);
}

pub fn record_waf_hit(kind: &'static str, action: &'static str) {
    metrics::counter!("waf_hits_total", "kind" => kind, "action" => action).increment(1);
}

pub fn record_task_dropped(kind: &'static str) {
    metrics::counter!("background_tasks_dropped_total", "kind" => kind).increment(1);
}

pub fn record_task_failure(kind: &'static str) {
    metrics::counter!("background_task_failures_total", "kind" => kind).increment(1);
}

pub fn record_replication_call(action: &'static str, result: &'static str) {
    metrics::counter!("replication_calls_total", "action" => action, "result" => result).increment(1);
}

pub fn record_auth_rejected(reason: &'static str) {
    metrics::counter!("replication_auth_rejected_total", "reason" => reason).increment(1);
}

pub fn record_blocklist_update(result: &'static str) {
    metrics::counter!("kernel_blocklist_updates_total", "result" => result).increment(1);
}
