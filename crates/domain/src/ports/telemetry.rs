use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry sink unavailable: {0}")]
    Unavailable(String),
    #[error("telemetry event rejected: {0}")]
    Rejected(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEvent {
    pub name: String,
    pub actor_id: Option<String>,
    pub entity_id: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub occurred_at_ms: i64,
}

impl TelemetryEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actor_id: None,
            entity_id: None,
            properties: BTreeMap::new(),
            occurred_at_ms: crate::util::now_ms(),
        }
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent) -> BoxFuture<'_, Result<(), TelemetryError>>;
}

/// Best-effort telemetry: failures are logged and never reach the caller.
#[derive(Clone, Default)]
pub struct Telemetry {
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn track(&self, event: TelemetryEvent) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };
        let name = event.name.clone();
        if let Err(err) = sink.record(event).await {
            tracing::debug!(event = %name, error = %err, "telemetry dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    impl TelemetrySink for FailingSink {
        fn record(&self, _event: TelemetryEvent) -> BoxFuture<'_, Result<(), TelemetryError>> {
            Box::pin(async { Err(TelemetryError::Unavailable("offline".into())) })
        }
    }

    #[tokio::test]
    async fn sink_failures_are_swallowed() {
        let telemetry = Telemetry::new(Arc::new(FailingSink));
        telemetry
            .track(TelemetryEvent::new("trade_created").actor("u1"))
            .await;
    }
}
