//! Prometheus metrics for the admission pipeline.
//!
//! Recording goes through the `metrics` facade, so every function here is a
//! no-op until [`init_metrics`] installs the Prometheus recorder.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `turnstile_admissions_total` - Rate limiter decisions (label: outcome)
//! - `turnstile_auth_failures_total` - Rejected credentials (label: reason)
//! - `turnstile_auth_lockouts_total` - Requests refused by the failed-auth lockout
//! - `turnstile_deadline_exceeded_total` - Requests answered with a timeout
//! - `turnstile_late_completions_total` - Inner results discarded after a timeout
//! - `turnstile_faults_recovered_total` - Panics caught by the fault barrier
//!
//! ## Histograms
//! - `turnstile_request_duration_seconds` - Request duration (labels: method, status)
//!
//! ## Gauges
//! - `turnstile_buckets` - Live rate limit buckets
//! - `turnstile_abandoned_tasks` - Inner tasks still running after their deadline

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const ADMISSIONS_TOTAL: &str = "turnstile_admissions_total";
    pub const AUTH_FAILURES_TOTAL: &str = "turnstile_auth_failures_total";
    pub const AUTH_LOCKOUTS_TOTAL: &str = "turnstile_auth_lockouts_total";
    pub const DEADLINE_EXCEEDED_TOTAL: &str = "turnstile_deadline_exceeded_total";
    pub const LATE_COMPLETIONS_TOTAL: &str = "turnstile_late_completions_total";
    pub const FAULTS_RECOVERED_TOTAL: &str = "turnstile_faults_recovered_total";
    pub const REQUEST_DURATION_SECONDS: &str = "turnstile_request_duration_seconds";
    pub const BUCKETS: &str = "turnstile_buckets";
    pub const ABANDONED_TASKS: &str = "turnstile_abandoned_tasks";
}

/// Install the Prometheus exporter listening on `metrics_addr`.
///
/// # Errors
///
/// Returns a message if the recorder or listener cannot be installed (for
/// example when a recorder is already set or the port is taken).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::ADMISSIONS_TOTAL,
        "Rate limiter decisions by outcome (admitted, rejected)"
    );
    describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Rejected credentials by reason code"
    );
    describe_counter!(
        names::AUTH_LOCKOUTS_TOTAL,
        "Requests refused because the caller failed authentication too often"
    );
    describe_counter!(
        names::DEADLINE_EXCEEDED_TOTAL,
        "Requests answered with a timeout response"
    );
    describe_counter!(
        names::LATE_COMPLETIONS_TOTAL,
        "Inner results that arrived after the deadline and were discarded"
    );
    describe_counter!(
        names::FAULTS_RECOVERED_TOTAL,
        "Panics caught and converted into internal error responses"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Request duration through the pipeline in seconds"
    );

    describe_gauge!(names::BUCKETS, "Live rate limit buckets");
    describe_gauge!(
        names::ABANDONED_TASKS,
        "Inner tasks still running after their deadline expired"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counters
// =============================================================================

/// Record a rate limiter decision.
pub fn record_admission(admitted: bool) {
    let outcome = if admitted { "admitted" } else { "rejected" };
    counter!(names::ADMISSIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a rejected credential.
pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// Record a request refused by the failed-auth lockout.
pub fn record_auth_lockout() {
    counter!(names::AUTH_LOCKOUTS_TOTAL).increment(1);
}

/// Record a deadline expiry.
pub fn record_deadline_exceeded() {
    counter!(names::DEADLINE_EXCEEDED_TOTAL).increment(1);
}

/// Record an inner result discarded because the deadline already fired.
pub fn record_late_completion() {
    counter!(names::LATE_COMPLETIONS_TOTAL).increment(1);
}

/// Record a panic caught by the fault barrier.
pub fn record_fault_recovered() {
    counter!(names::FAULTS_RECOVERED_TOTAL).increment(1);
}

// =============================================================================
// Histograms
// =============================================================================

/// Record request duration.
pub fn record_request_duration(method: &str, status: u16, duration_secs: f64) {
    histogram!(
        names::REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .record(duration_secs);
}

// =============================================================================
// Gauges
// =============================================================================

/// Update the live bucket gauge.
pub fn set_bucket_count(count: usize) {
    // Precision loss only above 2^53 buckets.
    #[allow(clippy::cast_precision_loss)]
    gauge!(names::BUCKETS).set(count as f64);
}

/// An inner task outlived its deadline.
pub fn increment_abandoned_tasks() {
    gauge!(names::ABANDONED_TASKS).increment(1.0);
}

/// An abandoned inner task finished.
pub fn decrement_abandoned_tasks() {
    gauge!(names::ABANDONED_TASKS).decrement(1.0);
}
