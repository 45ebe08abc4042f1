//! Event system for underwriting invocations
//!
//! Provides typed event emission for runtime events

use super::invocation::Step;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

pub const EVENT_VERSION: u32 = 1;

/// Runtime event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FlowEvent {
    InvocationStarted {
        person_id: String,
    },
    StepStarted {
        step: Step,
    },
    StepCompleted {
        step: Step,
        success: bool,
        duration_ms: u64,
    },
    JoinReleased {
        join: String,
        poisoned: bool,
    },
    InvocationCompleted {
        approved: bool,
        duration_ms: u64,
    },
    InvocationFailed {
        category: String,
        error: String,
    },
    ResultDiscarded {
        source: String,
        reason: String,
    },
}

/// Event envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEventEnvelope {
    pub version: u32,
    pub sequence: u64,
    pub invocation_id: Uuid,
    pub timestamp: i64,
    pub event: FlowEvent,
}

impl FlowEventEnvelope {
    pub fn new(invocation_id: Uuid, event: FlowEvent) -> Self {
        Self {
            version: EVENT_VERSION,
            sequence: next_sequence(),
            invocation_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            event,
        }
    }
}

/// Event sink trait for emitting events
pub trait EventSink: Send + Sync {
    /// Emit an event
    fn emit(&self, envelope: &FlowEventEnvelope);
}

/// A simple logging event sink
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &FlowEventEnvelope) {
        tracing::debug!("Event: {:?}", envelope);
    }
}

/// A buffering event sink that collects events
#[derive(Clone, Default)]
pub struct BufferingEventSink {
    events: Arc<RwLock<Vec<FlowEventEnvelope>>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<FlowEventEnvelope> {
        match self.events.read() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Events of one invocation, in emission order
    pub fn events_for(&self, invocation_id: Uuid) -> Vec<FlowEvent> {
        let mut envelopes: Vec<_> = self
            .get_events()
            .into_iter()
            .filter(|envelope| envelope.invocation_id == invocation_id)
            .collect();
        envelopes.sort_by_key(|envelope| envelope.sequence);
        envelopes.into_iter().map(|envelope| envelope.event).collect()
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &FlowEventEnvelope) {
        match self.events.write() {
            Ok(mut events) => events.push(envelope.clone()),
            Err(poisoned) => poisoned.into_inner().push(envelope.clone()),
        }
    }
}

/// Global sequence counter for events
static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Get the next event sequence number
pub fn next_sequence() -> u64 {
    EVENT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffering_sink_orders_by_sequence() {
        let sink = BufferingEventSink::new();
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();

        sink.emit(&FlowEventEnvelope::new(
            id,
            FlowEvent::StepStarted {
                step: Step::FetchAssets,
            },
        ));
        sink.emit(&FlowEventEnvelope::new(
            other,
            FlowEvent::InvocationStarted {
                person_id: "p".to_string(),
            },
        ));
        sink.emit(&FlowEventEnvelope::new(
            id,
            FlowEvent::JoinReleased {
                join: "credit_inputs".to_string(),
                poisoned: false,
            },
        ));

        let events = sink.events_for(id);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], FlowEvent::StepStarted { .. }));
        assert!(matches!(events[1], FlowEvent::JoinReleased { .. }));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = FlowEvent::StepCompleted {
            step: Step::ScoreHealth,
            success: true,
            duration_ms: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StepCompleted");
        assert_eq!(json["step"], "score_health");
    }
}
