//! Distribution of execution lifecycle events.
//!
//! The engine reports progress as `WorkflowEvent`s over a `tokio` broadcast
//! channel so status UIs and audit sinks can follow along without touching
//! engine state. Publishing never blocks execution: with no subscribers an
//! event is dropped, and a subscriber that falls behind observes
//! `RecvError::Lagged` instead of applying backpressure.

use caseflow_types::event::WorkflowEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Publish/subscribe handle for engine lifecycle events.
///
/// Clones share one channel, so any engine component holding a clone can
/// publish into the same stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// New receiver observing every event published from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event; dropped when nobody is subscribed.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.tx.send(event);
    }

    // -----------------------------------------------------------------------
    // Step-level publishers
    // -----------------------------------------------------------------------

    pub fn step_started(&self, execution_id: Uuid, step_id: &str, attempt: u32) {
        self.publish(WorkflowEvent::StepStarted {
            execution_id,
            step_id: step_id.to_string(),
            attempt,
        });
    }

    pub fn step_completed(&self, execution_id: Uuid, step_id: &str, duration_ms: u64) {
        self.publish(WorkflowEvent::StepCompleted {
            execution_id,
            step_id: step_id.to_string(),
            duration_ms,
        });
    }

    pub fn step_failed(&self, execution_id: Uuid, step_id: &str, error: &str, will_retry: bool) {
        self.publish(WorkflowEvent::StepFailed {
            execution_id,
            step_id: step_id.to_string(),
            error: error.to_string(),
            will_retry,
        });
    }

    pub fn step_skipped(&self, execution_id: Uuid, step_id: &str) {
        self.publish(WorkflowEvent::StepSkipped {
            execution_id,
            step_id: step_id.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_gets_its_own_copy() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.step_skipped(Uuid::now_v7(), "triage");

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                WorkflowEvent::StepSkipped { step_id, .. } => assert_eq!(step_id, "triage"),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn step_publishers_carry_their_fields() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let id = Uuid::now_v7();

        bus.step_started(id, "collect", 2);
        bus.step_failed(id, "collect", "backend unreachable", true);
        bus.step_completed(id, "collect", 42);

        assert!(matches!(
            rx.recv().await.unwrap(),
            WorkflowEvent::StepStarted { attempt: 2, .. }
        ));
        match rx.recv().await.unwrap() {
            WorkflowEvent::StepFailed {
                error, will_retry, ..
            } => {
                assert_eq!(error, "backend unreachable");
                assert!(will_retry);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            WorkflowEvent::StepCompleted {
                duration_ms: 42,
                ..
            }
        ));
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(8);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(WorkflowEvent::ExecutionCancelled {
            execution_id: Uuid::now_v7(),
        });
    }

    #[tokio::test]
    async fn clones_publish_into_the_same_channel() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.clone().step_completed(Uuid::now_v7(), "collect", 1);

        assert!(rx.recv().await.is_ok());
    }
}
