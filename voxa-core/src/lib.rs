//! # voxa-core
//!
//! Device-side runtime of a voice-assistant endpoint: couples a
//! microphone and a speaker to a remote conversational backend over one
//! TLS WebSocket, streams Opus both ways, applies local wake-word
//! detection, and mediates a registry of locally-controlled IoT entities.
//!
//! ## Architecture
//!
//! ```text
//!            ┌─ wake feeder/fetcher ─ WakeModel ──┐ WakeUp
//! AudioInput ┤                                    ├──► ConversationEngine ──► EventBus ─ host
//!            └─ CaptureEngine ─ Opus ─ transmit ──┤                │
//!                                                 │ binary      text│
//! AudioOutput ◄─ PlaybackEngine ◄─ Opus ◄─────────┴── Transport ◄──┘
//! ```
//!
//! Every conversation-state mutation runs on the engine's own task; the
//! periodic audio paths each run on a named task queue of their own. The
//! host polls the event bus — no callback ever crosses into host code.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod iot;
pub mod provision;
pub mod taskq;
pub mod transport;
pub mod wake;

// Convenience re-exports for downstream crates
pub use config::{EngineConfig, Identity};
pub use engine::{ConversationEngine, SessionContext, TransportFactory};
pub use error::VoxaError;
pub use events::{ChatRole, ChatState, Event, EventBus};
pub use iot::{Entity, Method, MethodParam, Property, Value, ValueType};
pub use provision::{Activation, Provisioner, ProvisionResponse};
pub use transport::{Transport, TransportEvent};
pub use wake::{EnergyWakeModel, WakeModel, WakeWordDetector};
