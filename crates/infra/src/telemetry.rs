use swapboard_domain::ports::BoxFuture;
use swapboard_domain::ports::telemetry::{TelemetryError, TelemetryEvent, TelemetrySink};

use crate::observability::register_telemetry_event;

/// Counts product events in the metrics registry and logs them at debug.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsTelemetrySink;

impl TelemetrySink for MetricsTelemetrySink {
    fn record(&self, event: TelemetryEvent) -> BoxFuture<'_, Result<(), TelemetryError>> {
        Box::pin(async move {
            if event.name.trim().is_empty() {
                return Err(TelemetryError::Rejected("event name is empty".into()));
            }
            register_telemetry_event(&event.name);
            tracing::debug!(
                event = %event.name,
                actor_id = event.actor_id.as_deref().unwrap_or("-"),
                entity_id = event.entity_id.as_deref().unwrap_or("-"),
                properties = ?event.properties,
                "telemetry event"
            );
            Ok(())
        })
    }
}
