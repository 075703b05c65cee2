//! In-process event fan-out and the durable-event recording helper.
//!
//! The bus is a process-local broadcast layered on top of the durable event
//! log: every persisted `RunEvent` is also published to live subscribers.
//! Clients that miss live messages can always recover history from the
//! persisted events. A multi-instance deployment would feed an external
//! pub/sub through the same seam.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::model::{Actor, NewEvent, RunEvent, RunId};
use crate::repository::RunRepository;

const BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RunEvent) {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Appends events to the durable log and mirrors them onto the bus.
///
/// Recording is a best-effort side effect: failures are logged and never
/// propagate into the primary state transition.
pub struct EventRecorder {
    repository: Arc<dyn RunRepository>,
    bus: EventBus,
}

impl EventRecorder {
    pub fn new(repository: Arc<dyn RunRepository>, bus: EventBus) -> Self {
        Self { repository, bus }
    }

    pub async fn record(
        &self,
        run_id: &RunId,
        event_type: &str,
        actor: Actor,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) {
        let event = NewEvent {
            run_id: run_id.clone(),
            event_type: event_type.to_string(),
            actor,
            message: message.into(),
            payload,
        };

        match self.repository.append_event(event).await {
            Ok(persisted) => self.bus.publish(persisted),
            Err(e) => warn!(
                "Failed to record event {} for run {}: {}",
                event_type, run_id, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;

    #[tokio::test]
    async fn test_record_persists_and_broadcasts() {
        let repository = Arc::new(InMemoryRepository::new());
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let recorder = EventRecorder::new(repository.clone(), bus);

        let run_id = RunId::from("run-1");
        recorder
            .record(
                &run_id,
                "run.created",
                Actor::System,
                "run created",
                serde_json::json!({"repository": "acme/api"}),
            )
            .await;

        let live = rx.recv().await.unwrap();
        assert_eq!(live.event_type, "run.created");
        assert_eq!(live.run_id, run_id);

        let persisted = repository.events_for_run(&run_id, 10).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].event_type, "run.created");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        let repository = Arc::new(InMemoryRepository::new());
        let recorder = EventRecorder::new(repository, bus);
        recorder
            .record(
                &RunId::from("run-1"),
                "run.queued",
                Actor::System,
                "",
                serde_json::json!({}),
            )
            .await;
    }
}
