//! Prometheus metrics exposition
//!
//! The pool crate emits its metrics through the `metrics` facade; this
//! module installs the recorder that makes them visible:
//!
//! - `pool_selections_total` (counter): label `partition`
//!   (normal / degraded / auto / none)
//! - `pool_outcome_reports_total` (counter): label `outcome`
//! - `pool_probe_outcomes_total` (counter): label `outcome`
//! - `pool_probe_duration_seconds` (histogram): label `outcome`

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Configures `pool_probe_duration_seconds` with explicit buckets so it
/// renders as a Prometheus histogram (with `_bucket` lines usable by
/// `histogram_quantile()`) rather than the default summary. Bucket
/// boundaries cover 5ms to 60s, the plausible range of a capability probe
/// up to its configurable timeout.
///
/// The handle's `render()` method produces the text exposition format
/// served on the `/metrics` endpoint.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("pool_probe_duration_seconds".to_string()),
            &[
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
