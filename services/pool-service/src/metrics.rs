//! Prometheus metrics exposition
//!
//! The library crates emit their own counters through the `metrics` facade:
//!
//! - `pool_allocations_total` (counter): label `outcome`
//! - `pool_token_refresh_total` (counter): label `outcome`
//! - `pool_replenish_runs_total` (counter): label `outcome`
//! - `pool_aging_reset_accounts_total` (counter)
//!
//! The service adds its own request metrics for the admin API:
//!
//! - `admin_requests_total` (counter): labels `route`, `status`
//! - `admin_request_duration_seconds` (histogram): label `route`

use anyhow::Context;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Admin request latency buckets, 5ms to 30s.
const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("admin_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("setting histogram buckets")
}

/// Install the Prometheus recorder globally and return a handle for
/// rendering `/metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = builder()?
        .install_recorder()
        .context("installing Prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!(
        "pool_allocations_total",
        "Allocation attempts by outcome (allocated, empty, contended)"
    );
    metrics::describe_counter!(
        "pool_token_refresh_total",
        "Token refreshes on allocation by outcome (renewed, unchanged, failed)"
    );
    metrics::describe_counter!(
        "pool_replenish_runs_total",
        "Replenishment runs by outcome (added, duplicate, failed)"
    );
    metrics::describe_counter!(
        "pool_aging_reset_accounts_total",
        "Accounts returned to available by the aging job"
    );
    metrics::describe_counter!("admin_requests_total", "Admin API requests");
    metrics::describe_histogram!(
        "admin_request_duration_seconds",
        metrics::Unit::Seconds,
        "Admin API request latency"
    );
}

/// Record a completed admin request.
pub fn record_request(route: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "admin_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("admin_request_duration_seconds", "route" => route.to_string())
        .record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request("/api/stats", 200, 0.01);
    }

    /// Isolated recorder/handle pair; only one global recorder can exist per
    /// process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("/api/account", 200, 0.042);
        record_request("/api/account", 404, 0.002);

        let output = handle.render();
        assert!(output.contains("admin_requests_total"));
        assert!(output.contains("route=\"/api/account\""));
        assert!(output.contains("status=\"404\""));
        assert!(
            output.contains("admin_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"30\""));
    }
}
