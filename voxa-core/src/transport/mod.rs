//! Bidirectional control + audio channel to the realtime backend.
//!
//! One transport carries two frame kinds: text frames are UTF-8 JSON
//! control messages, binary frames are single Opus packets. The engine
//! consumes a `Transport` trait object so tests (and alternate carriers)
//! can substitute a scripted implementation; the production implementation
//! is [`ws::WsTransport`].
//!
//! Inbound traffic and lifecycle changes surface through a callback sink
//! installed at construction. The engine's sink does nothing but enqueue a
//! typed message onto its own task, so transport I/O threads never touch
//! engine state.

pub mod ws;

use std::sync::Arc;

use crate::error::Result;

/// What a transport reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel is open and both sides may send.
    Opened,
    /// The channel closed — cleanly or not. Also reported when an async
    /// `connect` attempt fails.
    Closed,
    /// One complete text frame.
    Text(String),
    /// One complete binary frame (one Opus packet).
    Binary(Vec<u8>),
}

/// Receives transport events; called from transport-owned threads.
pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// A reliable, single-connection, dual-opcode message channel.
///
/// Sends are callable from multiple tasks concurrently (the engine task
/// sends control text while the transmit task sends audio); implementations
/// serialise internally.
pub trait Transport: Send + Sync {
    /// Begin connecting. Completion is reported through the sink:
    /// `Opened` on success, `Closed` on failure.
    fn connect(&self) -> Result<()>;

    /// Close the channel. Idempotent; a `Closed` event may still arrive
    /// from the reader afterwards.
    fn disconnect(&self);

    /// Send one text frame. Blocks at most the send deadline.
    fn send_text(&self, text: &str) -> Result<()>;

    /// Send one binary frame. Blocks at most the send deadline.
    fn send_binary(&self, data: &[u8]) -> Result<()>;

    fn is_connected(&self) -> bool;
}
