//! Metrics for the flow engine.

use std::collections::BTreeMap;
use std::sync::Mutex;

use accord_core::domain::events::DomainEvent;
use accord_core::{CoreError, DomainEventHandler};
use async_trait::async_trait;
use tracing::trace;

/// Names of the metrics emitted by the engine
pub struct FlowMetrics;

impl FlowMetrics {
    /// Counter of domain events, labelled by `event_type`
    pub const EVENTS_TOTAL: &'static str = "accord_flow_events_total";
    /// Counter of finished flows, labelled by `outcome`
    pub const FINISHED_TOTAL: &'static str = "accord_flows_finished_total";

    /// Record one domain event
    pub fn record_event(event_type: &'static str) {
        metrics::counter!(Self::EVENTS_TOTAL, 1, "event_type" => event_type);
        match event_type {
            "flow.completed" => {
                metrics::counter!(Self::FINISHED_TOTAL, 1, "outcome" => "completed");
            }
            "flow.failed" => {
                metrics::counter!(Self::FINISHED_TOTAL, 1, "outcome" => "failed");
            }
            _ => {}
        }
    }
}

/// Domain event handler feeding [`FlowMetrics`].
///
/// Also keeps a local tally per event type, readable with
/// [`snapshot`](Self::snapshot) when no metrics recorder is installed.
#[derive(Debug, Default)]
pub struct MetricsEventHandler {
    tally: Mutex<BTreeMap<&'static str, u64>>,
}

impl MetricsEventHandler {
    /// Create a new handler
    pub fn new() -> Self {
        Self::default()
    }

    /// Events seen so far, per event type
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.tally
            .lock()
            .map(|tally| tally.clone())
            .unwrap_or_default()
    }

    /// Number of events of one type seen so far
    pub fn count(&self, event_type: &str) -> u64 {
        self.snapshot().get(event_type).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DomainEventHandler for MetricsEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
        let event_type = event.event_type();
        FlowMetrics::record_event(event_type);

        let mut tally = self
            .tally
            .lock()
            .map_err(|_| CoreError::Other("Metrics tally lock poisoned".to_string()))?;
        *tally.entry(event_type).or_insert(0) += 1;
        trace!(flow_id = %event.flow_id(), event_type, "Recorded flow metric");
        Ok(())
    }
}
