//! Pipeline event system for observability.
//!
//! The runner emits [`PipelineEvent`]s on a [`tokio::sync::broadcast`]
//! channel so progress displays and log sinks can follow a batch without
//! coupling to the runner itself.

use serde::{Deserialize, Serialize};

/// Events emitted while a batch runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    BatchStarted {
        items: usize,
        steps: Vec<String>,
        parallel: bool,
    },
    BatchCompleted {
        items: usize,
        successful_items: usize,
        duration_ms: u64,
    },
    ItemStarted {
        item: String,
    },
    ItemCompleted {
        item: String,
        success: bool,
        steps_recorded: usize,
    },
    StepStarted {
        item: String,
        step: String,
    },
    StepSkipped {
        item: String,
        step: String,
    },
    StepCompleted {
        item: String,
        step: String,
        duration_ms: u64,
    },
    StepFailed {
        item: String,
        step: String,
        error: String,
        critical: bool,
    },
    StepNotRegistered {
        step: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_step_events() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(PipelineEvent::StepFailed {
            item: "001".into(),
            step: "eddy".into(),
            error: "bet exited with code 1".into(),
            critical: true,
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::StepFailed {
                item,
                step,
                critical,
                ..
            } => {
                assert_eq!(item, "001");
                assert_eq!(step, "eddy");
                assert!(critical);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let emitter = EventEmitter::default();
        emitter.emit(PipelineEvent::StepNotRegistered {
            step: "unknown".into(),
        });
    }

    #[test]
    fn events_serialize_with_variant_tag() {
        let event = PipelineEvent::ItemStarted { item: "002".into() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["ItemStarted"]["item"], "002");
    }
}
