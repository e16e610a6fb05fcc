use std::sync::OnceLock;

use anyhow::Result;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use swapboard_domain::realtime::RealtimeStats;

const DOCUMENT_OPS_TOTAL: &str = "swapboard_document_operations_total";
const DOCUMENT_OP_DURATION_MS: &str = "swapboard_document_operation_duration_ms";
const TELEMETRY_EVENTS_TOTAL: &str = "swapboard_telemetry_events_total";
const REALTIME_DELIVERIES_GAUGE: &str = "swapboard_realtime_deliveries";
const REALTIME_ERRORS_GAUGE: &str = "swapboard_realtime_subscriber_errors";
const REALTIME_LISTENERS_GAUGE: &str = "swapboard_realtime_active_listeners";
const SWEEPS_TOTAL: &str = "swapboard_worker_sweeps_total";
const TRADES_AUTO_COMPLETED_TOTAL: &str = "swapboard_worker_trades_auto_completed_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn register_document_op(collection: &str, op: &'static str, result: &'static str, duration_ms: f64) {
    counter!(
        DOCUMENT_OPS_TOTAL,
        "collection" => collection.to_string(),
        "op" => op,
        "result" => result
    )
    .increment(1);

    histogram!(DOCUMENT_OP_DURATION_MS, "op" => op).record(duration_ms.max(0.0));
}

pub fn register_telemetry_event(name: &str) {
    counter!(TELEMETRY_EVENTS_TOTAL, "event" => name.to_string()).increment(1);
}

pub fn set_realtime_stats(stats: &RealtimeStats) {
    gauge!(REALTIME_DELIVERIES_GAUGE).set(stats.deliveries as f64);
    gauge!(REALTIME_ERRORS_GAUGE).set(stats.errors as f64);
    gauge!(REALTIME_LISTENERS_GAUGE).set(stats.active_listeners as f64);
}

pub fn register_sweep(result: &'static str, completed: usize) {
    counter!(SWEEPS_TOTAL, "result" => result).increment(1);
    counter!(TRADES_AUTO_COMPLETED_TOTAL).increment(completed as u64);
}
