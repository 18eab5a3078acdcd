//! Acquisition metrics
//!
//! Emitted through the `metrics` facade; the host process decides whether a
//! recorder is installed.
//!
//! - `token_acquisitions_total` (counter): labels `method`, `outcome`
//! - `token_acquisition_duration_seconds` (histogram): label `outcome`
//! - `login_attempts_total` (counter): label `outcome`
//! - `resource_queue_timeouts_total` (counter): label `stage`
//! - `history_write_failures_total` (counter)

use std::time::Duration;

use portal::ErrorKind;

use crate::error::TimeoutStage;
use crate::model::AcquisitionMethod;

pub const ACQUISITION_DURATION: &str = "token_acquisition_duration_seconds";

/// Histogram buckets for `token_acquisition_duration_seconds`, from cache hits
/// to logins that ran into the orchestration deadline.
pub const ACQUISITION_DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

/// Record a finished acquisition. `method` is `None` for failures.
pub fn record_acquisition(method: Option<AcquisitionMethod>, success: bool, duration: Duration) {
    let outcome = if success { "success" } else { "failure" };
    let method = method.map_or("none", |m| m.as_str());
    metrics::counter!("token_acquisitions_total", "method" => method, "outcome" => outcome)
        .increment(1);
    metrics::histogram!(ACQUISITION_DURATION, "outcome" => outcome)
        .record(duration.as_secs_f64());
}

/// Record one portal attempt; failures are labelled with their kind.
pub fn record_login_attempt(error: Option<ErrorKind>) {
    let outcome = error.map_or("success", |kind| kind.as_str());
    metrics::counter!("login_attempts_total", "outcome" => outcome).increment(1);
}

/// Record a coordinator or deadline timeout.
pub fn record_timeout(stage: TimeoutStage) {
    metrics::counter!("resource_queue_timeouts_total", "stage" => stage.as_str()).increment(1);
}

pub fn record_history_write_failure() {
    metrics::counter!("history_write_failures_total").increment(1);
}
