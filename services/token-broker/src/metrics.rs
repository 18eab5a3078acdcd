//! Prometheus metrics exposition
//!
//! Installs the process-wide recorder. Besides the acquisition metrics emitted
//! by the `acquisition` crate, the broker records its own HTTP traffic:
//!
//! - `broker_requests_total` (counter): labels `route`, `status`
//! - `broker_request_duration_seconds` (histogram): label `route`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const REQUEST_DURATION: &str = "broker_request_duration_seconds";

const REQUEST_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(REQUEST_DURATION.to_string()),
            REQUEST_DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
        .set_buckets_for_metric(
            Matcher::Full(acquisition::metrics::ACQUISITION_DURATION.to_string()),
            acquisition::metrics::ACQUISITION_DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Both duration metrics get explicit buckets so they render as Prometheus
/// histograms rather than summaries.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed API request.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("broker_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    metrics::histogram!(REQUEST_DURATION, "route" => route).record(duration_secs);
}

#[cfg(test)]
pub fn test_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_without_recorder_is_noop() {
        record_request("tokens", 200, 0.01);
    }

    #[test]
    fn record_request_renders_counter_and_histogram() {
        let (recorder, handle) = test_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("tokens", 200, 0.042);
        record_request("tokens", 504, 61.0);

        let output = handle.render();
        assert!(output.contains("broker_requests_total"));
        assert!(output.contains("route=\"tokens\""));
        assert!(output.contains("status=\"504\""));
        assert!(
            output.contains("broker_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"600\""));
    }
}
