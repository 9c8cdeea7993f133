//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,granite=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Test-friendly variant: ignores the error when a subscriber is already set.
pub fn try_init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

/// Initialize the Prometheus metrics exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tablet metrics
// ---------------------------------------------------------------------------

/// Record a tablet lifecycle state as its numeric code.
pub fn record_tablet_state(tablet_id: &str, state_code: u8) {
    metrics::gauge!("granite_tablet_state", "tablet" => tablet_id.to_string())
        .set(state_code as f64);
}

/// Record one finished operation. `op_type` is the operation kind name,
/// `outcome` is "ok" or an error code.
pub fn record_operation(op_type: &'static str, outcome: &'static str, latency_us: u64) {
    metrics::counter!(
        "granite_operations_total",
        "type" => op_type,
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("granite_operation_latency_us", "type" => op_type)
        .record(latency_us as f64);
}

pub fn record_in_flight_operations(tablet_id: &str, count: usize) {
    metrics::gauge!("granite_in_flight_operations", "tablet" => tablet_id.to_string())
        .set(count as f64);
}

pub fn record_log_gc(tablet_id: &str, segments_reclaimed: usize) {
    metrics::counter!("granite_log_gc_segments", "tablet" => tablet_id.to_string())
        .increment(segments_reclaimed as u64);
}

pub fn record_safe_time_wait_us(wait_us: u64) {
    metrics::histogram!("granite_safe_time_wait_us").record(wait_us as f64);
}

// ---------------------------------------------------------------------------
// Compaction scheduler metrics
// ---------------------------------------------------------------------------

/// Publish the task/file/byte triple of one scheduler state
/// (`"active"`, `"paused"` or `"queued"`).
pub fn record_compaction_gauges(state: &'static str, tasks: u64, files: u64, bytes: u64) {
    metrics::gauge!("granite_compaction_tasks", "state" => state).set(tasks as f64);
    metrics::gauge!("granite_compaction_files", "state" => state).set(files as f64);
    metrics::gauge!("granite_compaction_bytes", "state" => state).set(bytes as f64);
}

pub fn record_compaction_finished(files_in: usize, entries_dropped: usize) {
    metrics::counter!("granite_compactions_total").increment(1);
    metrics::counter!("granite_compaction_input_files_total").increment(files_in as u64);
    metrics::counter!("granite_compaction_entries_dropped_total")
        .increment(entries_dropped as u64);
}

// ---------------------------------------------------------------------------
// Tablet service metrics
// ---------------------------------------------------------------------------

/// Record one tablet service call. `outcome` is "ok" or an error code.
pub fn record_rpc(method: &'static str, outcome: &'static str, latency_us: u64) {
    metrics::counter!("granite_rpc_total", "method" => method, "outcome" => outcome).increment(1);
    metrics::histogram!("granite_rpc_latency_us", "method" => method).record(latency_us as f64);
}

pub fn record_hosted_tablets(count: usize) {
    metrics::gauge!("granite_hosted_tablets").set(count as f64);
}
