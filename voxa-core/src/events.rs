//! Host-facing events and the bounded observer queue.
//!
//! The engine never calls into the host. It pushes typed events onto an
//! `EventBus` the host polls on its own cadence (`pop_all`), which keeps
//! host code off the engine task entirely. The queue is bounded at
//! [`EventBus::CAPACITY`]; when full, the oldest event is dropped.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::iot::Value;

/// Coarse conversation state shown to observers.
///
/// A projection of the engine's internal state machine: the engine emits a
/// `StateChanged` event only when this projection actually changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    /// Engine created but `start()` not yet called, or shut down.
    Idle,
    /// Provisioning against the config endpoint (or parked on activation).
    Initializing,
    /// Provisioned and waiting for a trigger or wake word.
    Standby,
    /// Opening the realtime channel / waiting for the server handshake.
    Connecting,
    /// Capturing and streaming the user's voice.
    Listening,
    /// Rendering server speech.
    Speaking,
}

/// Who said a chat line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// Everything the engine reports to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// The observable conversation state changed.
    StateChanged { old: ChatState, new: ChatState },
    /// A transcribed user utterance or an assistant sentence.
    ChatMessage { role: ChatRole, text: String },
    /// Server-reported emotion tag for the current reply.
    Emotion { emotion: String },
    /// The server demands device activation before it will converse.
    /// `code` is the human-readable code to display.
    Activation { code: String, message: String },
    /// The server invoked a method on a registered IoT entity. The host
    /// performs the side effect and then updates the entity's state.
    IotInvocation {
        entity: String,
        method: String,
        parameters: HashMap<String, Value>,
    },
}

/// Bounded single-consumer event queue.
///
/// FIFO with drop-oldest overflow; `pop_all` returns and clears the queue
/// in one atomic step. There are no notifications — the host polls.
#[derive(Default)]
pub struct EventBus {
    queue: Mutex<VecDeque<Event>>,
}

impl EventBus {
    /// Maximum queued events; pushing beyond this drops the oldest.
    pub const CAPACITY: usize = 10;

    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, evicting the oldest if the queue is full.
    pub fn push(&self, event: Event) {
        let mut queue = self.queue.lock();
        if queue.len() >= Self::CAPACITY {
            queue.pop_front();
        }
        queue.push_back(event);
    }

    /// Drain every queued event in arrival order.
    pub fn pop_all(&self) -> VecDeque<Event> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Number of events currently queued.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(text: &str) -> Event {
        Event::ChatMessage {
            role: ChatRole::User,
            text: text.to_string(),
        }
    }

    #[test]
    fn pop_all_drains_in_fifo_order() {
        let bus = EventBus::new();
        bus.push(chat("a"));
        bus.push(chat("b"));
        bus.push(chat("c"));

        let events: Vec<Event> = bus.pop_all().into();
        assert_eq!(events, vec![chat("a"), chat("b"), chat("c")]);
        assert!(bus.is_empty());
    }

    #[test]
    fn overflow_drops_the_oldest() {
        let bus = EventBus::new();
        for i in 0..EventBus::CAPACITY + 3 {
            bus.push(chat(&format!("m{i}")));
        }

        assert_eq!(bus.len(), EventBus::CAPACITY);
        let events = bus.pop_all();
        // m0..m2 were evicted; m3 is now the oldest.
        assert_eq!(events.front(), Some(&chat("m3")));
        assert_eq!(
            events.back(),
            Some(&chat(&format!("m{}", EventBus::CAPACITY + 2)))
        );
    }

    #[test]
    fn pop_all_on_empty_bus_returns_empty() {
        let bus = EventBus::new();
        assert!(bus.pop_all().is_empty());
    }

    #[test]
    fn state_changed_serializes_with_lowercase_states() {
        let event = Event::StateChanged {
            old: ChatState::Standby,
            new: ChatState::Connecting,
        };

        let json = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(json["kind"], "state_changed");
        assert_eq!(json["old"], "standby");
        assert_eq!(json["new"], "connecting");

        let round_trip: Event = serde_json::from_value(json).expect("deserialize event");
        assert_eq!(round_trip, event);
    }

    #[test]
    fn iot_invocation_round_trips_parameter_values() {
        let mut parameters = HashMap::new();
        parameters.insert("volume".to_string(), Value::Int(30));
        parameters.insert("muted".to_string(), Value::Bool(false));
        parameters.insert("source".to_string(), Value::Text("aux".into()));

        let event = Event::IotInvocation {
            entity: "Speaker".into(),
            method: "SetVolume".into(),
            parameters,
        };

        let json = serde_json::to_value(&event).expect("serialize event");
        let round_trip: Event = serde_json::from_value(json).expect("deserialize event");
        assert_eq!(round_trip, event);
    }
}
