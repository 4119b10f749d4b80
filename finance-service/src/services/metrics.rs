//! Prometheus metrics for finance-service.
//!
//! HTTP request metrics from the shared middleware go through the `metrics`
//! facade and are rendered by the installed recorder; domain metrics live in
//! the default prometheus registry. `/metrics` serves both.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "finance_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for accepted payments by kind (direct, milestone) and resulting status.
pub static PAYMENTS_RECORDED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finance_payments_recorded_total",
        "Total number of recorded payments",
        &["kind", "status"]
    )
    .expect("Failed to register PAYMENTS_RECORDED")
});

/// Counter for finance student re-aggregations by outcome.
pub static CASCADE_UPDATES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finance_student_cascade_total",
        "Total number of finance student summary recomputations",
        &["outcome"]
    )
    .expect("Failed to register CASCADE_UPDATES")
});

/// Counter for formula evaluation failures by mode.
pub static FORMULA_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finance_formula_failures_total",
        "Total number of fee-line formula evaluation failures",
        &["mode"]
    )
    .expect("Failed to register FORMULA_FAILURES")
});

/// Counter for imported fee-sheet rows by outcome.
pub static IMPORT_ROWS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finance_import_rows_total",
        "Total number of fee data rows processed by imports",
        &["outcome"]
    )
    .expect("Failed to register IMPORT_ROWS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finance_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Installs the global recorder once and forces the lazy statics. Safe to
/// call more than once.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    });
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&PAYMENTS_RECORDED);
    Lazy::force(&CASCADE_UPDATES);
    Lazy::force(&FORMULA_FAILURES);
    Lazy::force(&IMPORT_ROWS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return output;
    }
    if let Ok(custom) = String::from_utf8(buffer) {
        output.push_str(&custom);
    }
    output
}

pub fn record_payment(kind: &str, status: &str) {
    PAYMENTS_RECORDED.with_label_values(&[kind, status]).inc();
}

pub fn record_cascade(outcome: &str) {
    CASCADE_UPDATES.with_label_values(&[outcome]).inc();
}

pub fn record_formula_failures(mode: &str, count: usize) {
    FORMULA_FAILURES
        .with_label_values(&[mode])
        .inc_by(count as f64);
}

pub fn record_import_row(outcome: &str) {
    IMPORT_ROWS.with_label_values(&[outcome]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
