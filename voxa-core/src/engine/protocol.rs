//! Control-frame shapes for the realtime channel.
//!
//! Text frames are JSON objects with a mandatory `type` field. Outbound
//! frames are built here as single serde trees; inbound frames decode into
//! [`ServerMessage`]. Unknown `type` values are logged and dropped —
//! the protocol grows by addition, never by removal.

use serde::Deserialize;
use serde_json::json;
use tracing::warn;

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Client handshake, sent once per connection.
pub fn hello(frame_duration_ms: u32) -> String {
    json!({
        "type": "hello",
        "version": 1,
        "transport": "websocket",
        "audio_params": {
            "format": "opus",
            "sample_rate": 16_000,
            "channels": 1,
            "frame_duration": frame_duration_ms,
        },
    })
    .to_string()
}

/// Begin a listening turn in automatic (server-VAD) mode.
pub fn listen_start(session_id: &str) -> String {
    json!({
        "session_id": session_id,
        "type": "listen",
        "state": "start",
        "mode": "auto",
    })
    .to_string()
}

/// Wake hint: tells the server which phrase opened the session.
pub fn wake_hint(session_id: &str, phrase: &str) -> String {
    json!({
        "session_id": session_id,
        "type": "listen",
        "state": "detect",
        "text": phrase,
    })
    .to_string()
}

/// Close the session.
pub fn goodbye(session_id: &str) -> String {
    json!({
        "session_id": session_id,
        "type": "goodbye",
    })
    .to_string()
}

/// Interrupt in-flight server speech, optionally saying why.
pub fn abort(session_id: &str, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => json!({
            "session_id": session_id,
            "type": "abort",
            "reason": reason,
        }),
        None => json!({
            "session_id": session_id,
            "type": "abort",
        }),
    }
    .to_string()
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Audio parameters the server may echo in its hello.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerAudioParams {
    pub sample_rate: Option<u32>,
    pub frame_duration: Option<u32>,
}

/// Every control frame the engine consumes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        transport: Option<String>,
        #[serde(default)]
        audio_params: Option<ServerAudioParams>,
    },
    Goodbye {
        #[serde(default)]
        session_id: Option<String>,
    },
    Tts {
        state: String,
        #[serde(default)]
        text: Option<String>,
    },
    Stt {
        #[serde(default)]
        text: Option<String>,
    },
    Llm {
        #[serde(default)]
        emotion: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    Iot {
        #[serde(default)]
        commands: serde_json::Value,
    },
}

/// Decode one inbound text frame. Returns `None` (after logging) for
/// frames that are not JSON objects, lack a `type`, or carry an unknown
/// type.
pub fn parse_server_message(raw: &str) -> Option<ServerMessage> {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("discarding unparseable control frame: {e}");
            return None;
        }
    };

    let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
        warn!("discarding control frame without a type field");
        return None;
    };

    match serde_json::from_value::<ServerMessage>(value.clone()) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(kind, "discarding control frame: {e}");
            None
        }
    }
}
