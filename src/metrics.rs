//! Process metrics, exported in Prometheus text format on `/metrics`.

use ::metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "stormgate_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "stormgate_connections_active";
    pub const MESSAGES_TOTAL: &str = "stormgate_messages_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "stormgate_publish_failures_total";
    pub const RATE_LIMITED_TOTAL: &str = "stormgate_rate_limited_total";
    pub const PERSIST_TASKS_TOTAL: &str = "stormgate_persist_tasks_total";
}

pub fn init_metrics() {
    ::metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Streaming connections accepted since start, by transport"
    );
    ::metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Streaming connections currently open, by transport"
    );
    ::metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Messages relayed between clients and the bus, by direction"
    );
    ::metrics::describe_counter!(
        names::PUBLISH_FAILURES_TOTAL,
        "Bus publish attempts that failed"
    );
    ::metrics::describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Requests rejected by the per-address rate limiter"
    );
    ::metrics::describe_counter!(
        names::PERSIST_TASKS_TOTAL,
        "Persistence tasks by outcome (ok, failed, dropped)"
    );

    info!("metrics initialized");
}

/// Installs the global Prometheus recorder. Only one can exist per process.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    init_metrics();
    Ok(handle)
}

/// Counts a connection for as long as the guard lives.
pub struct ConnectionMetricsGuard {
    transport: &'static str,
}

impl ConnectionMetricsGuard {
    #[must_use]
    pub fn new(transport: &'static str) -> Self {
        counter!(names::CONNECTIONS_TOTAL, "transport" => transport).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE, "transport" => transport).increment(1.0);
        Self { transport }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE, "transport" => self.transport).decrement(1.0);
    }
}

pub fn record_message(direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
}

pub fn record_publish_failure() {
    counter!(names::PUBLISH_FAILURES_TOTAL).increment(1);
}

pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

pub fn record_persist(outcome: &'static str) {
    counter!(names::PERSIST_TASKS_TOTAL, "outcome" => outcome).increment(1);
}
