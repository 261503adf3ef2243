//! `ConversationEngine` — the protocol state machine.
//!
//! ## Lifecycle
//!
//! ```text
//! ConversationEngine::new()
//!     └─► configure() / register_iot() / set_observer()   (pre-start only)
//!         └─► start(audio_in, audio_out)  → engine task spawned, provisioning begins
//!             └─► trigger() / wake word   → session turns
//!                 └─► stop()              → transport closed, task joined, Idle
//! ```
//!
//! ## Threading
//!
//! Every mutation of conversation state runs on one named engine thread
//! draining a typed message channel. External stimuli — host calls,
//! transport callbacks, wake detection, the playback drain marker — do
//! nothing but enqueue a message, so observers always see transitions in
//! issue order and no lock guards any state the machine owns.
//!
//! ## State graph
//!
//! | From | Event | To |
//! |------|-------|----|
//! | `Idle` | `start` | `Initialized` |
//! | `Initialized` | provisioning ok | `Standby` |
//! | `Initialized` | activation challenge / transient failure | `Initialized` |
//! | `Standby` | trigger / wake word | `Connecting` / `ConnectingAfterWake` |
//! | `Connecting*` | transport open | `Connected*` |
//! | `Connected*` | server hello | `Listening` |
//! | `Listening` | server `tts start` | `Speaking` |
//! | `Speaking` | playback drained after `tts stop` | `Listening` |
//! | `Listening` | trigger | `Standby` |
//! | any connected state | transport closed | `Standby` |

pub mod protocol;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::capture::{CaptureEngine, PacketSink};
use crate::audio::playback::PlaybackEngine;
use crate::audio::{AudioInput, AudioOutput};
use crate::config::{EngineConfig, Identity};
use crate::error::{Result, VoxaError};
use crate::events::{ChatRole, ChatState, Event, EventBus};
use crate::iot::{Entity, Registry};
use crate::provision::{HttpProvisioner, Provisioner};
use crate::taskq::TaskQueue;
use crate::transport::ws::WsTransport;
use crate::transport::{EventSink, Transport, TransportEvent};
use crate::wake::{WakeModel, WakeWordDetector};

/// Maximum provisioning retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Pending-send threshold beyond which low-power captures drop frames.
const TRANSMIT_BACKLOG_LIMIT: usize = 5;

/// Builds the transport once the engine can hand it an event sink.
/// Injected by tests and embedders with alternate carriers.
pub type TransportFactory =
    Box<dyn FnOnce(EventSink) -> Result<Arc<dyn Transport>> + Send + 'static>;

/// Per-session metadata from the server handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Opaque id assigned by the server; embedded in every control
    /// message that requires a live session.
    pub session_id: String,
    pub frame_duration_ms: u32,
    pub sample_rate_in: u32,
    pub sample_rate_out: u32,
    pub channels: u8,
}

impl SessionContext {
    fn new(session_id: String, frame_duration_ms: u32) -> Self {
        Self {
            session_id,
            frame_duration_ms,
            sample_rate_in: 16_000,
            sample_rate_out: 24_000,
            channels: 1,
        }
    }
}

/// Internal machine states. Observers see the [`ChatState`] projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Initialized,
    LoadingProtocol,
    Connecting,
    ConnectingAfterWake,
    Connected,
    ConnectedAfterWake,
    Standby,
    Listening,
    Speaking,
}

fn project(state: State) -> ChatState {
    match state {
        State::Idle => ChatState::Idle,
        State::Initialized | State::LoadingProtocol => ChatState::Initializing,
        State::Connecting
        | State::ConnectingAfterWake
        | State::Connected
        | State::ConnectedAfterWake => ChatState::Connecting,
        State::Standby => ChatState::Standby,
        State::Listening => ChatState::Listening,
        State::Speaking => ChatState::Speaking,
    }
}

/// Typed inputs of the engine task.
enum EngineMsg {
    Trigger,
    WakeUp,
    LoadProtocol,
    TransportOpened,
    TransportClosed,
    TextFrame(String),
    BinaryFrame(Vec<u8>),
    PlaybackDrained,
    Shutdown,
}

/// Pre-start wiring, consumed by `start()`.
struct Setup {
    config: EngineConfig,
    bus: Option<Arc<EventBus>>,
    entities: Vec<Arc<Entity>>,
    wake_model: Option<Box<dyn WakeModel>>,
    transport_factory: Option<TransportFactory>,
    provisioner: Option<Arc<dyn Provisioner>>,
}

struct Running {
    tx: Sender<EngineMsg>,
    thread: Option<JoinHandle<()>>,
}

/// The public engine handle.
///
/// All methods take `&self`; wrap in `Arc` to share with button glue and
/// the host event loop. Configuration methods fail with `InvalidState`
/// once `start()` has been called.
pub struct ConversationEngine {
    setup: Mutex<Option<Setup>>,
    running: Mutex<Option<Running>>,
}

impl ConversationEngine {
    pub fn new() -> Self {
        Self {
            setup: Mutex::new(Some(Setup {
                config: EngineConfig::default(),
                bus: None,
                entities: Vec::new(),
                wake_model: None,
                transport_factory: None,
                provisioner: None,
            })),
            running: Mutex::new(None),
        }
    }

    fn with_setup(&self, apply: impl FnOnce(&mut Setup)) -> Result<()> {
        let mut setup = self.setup.lock();
        match setup.as_mut() {
            Some(setup) => {
                apply(setup);
                Ok(())
            }
            None => Err(VoxaError::InvalidState(
                "configuration is frozen once the engine has started",
            )),
        }
    }

    /// Set endpoints, headers and tuning. Pre-start only.
    pub fn configure(&self, config: EngineConfig) -> Result<()> {
        self.with_setup(|setup| setup.config = config)
    }

    /// Expose an IoT entity to the backend. Pre-start only; entities are
    /// never unregistered.
    pub fn register_iot(&self, entity: Arc<Entity>) -> Result<()> {
        self.with_setup(|setup| setup.entities.push(entity))
    }

    /// Install the observer queue the host will poll. Pre-start only.
    pub fn set_observer(&self, bus: Arc<EventBus>) -> Result<()> {
        self.with_setup(|setup| setup.bus = Some(bus))
    }

    /// Install a wake-word model. Without one the engine runs button-only.
    /// Pre-start only.
    pub fn set_wake_model(&self, model: Box<dyn WakeModel>) -> Result<()> {
        self.with_setup(|setup| setup.wake_model = Some(model))
    }

    /// Replace the default WebSocket transport. Pre-start only.
    pub fn set_transport(&self, factory: TransportFactory) -> Result<()> {
        self.with_setup(|setup| setup.transport_factory = Some(factory))
    }

    /// Replace the default HTTPS provisioner. Pre-start only.
    pub fn set_provisioner(&self, provisioner: Arc<dyn Provisioner>) -> Result<()> {
        self.with_setup(|setup| setup.provisioner = Some(provisioner))
    }

    /// Spawn the engine task and begin provisioning. Returns immediately.
    ///
    /// # Errors
    /// `InvalidState` when already started or the configuration is
    /// invalid; transport/provisioner construction errors pass through.
    pub fn start(
        &self,
        audio_in: Arc<dyn AudioInput>,
        audio_out: Arc<dyn AudioOutput>,
    ) -> Result<()> {
        let setup = self
            .setup
            .lock()
            .take()
            .ok_or(VoxaError::InvalidState("engine already started"))?;
        setup.config.validate()?;

        let identity = Identity::from_config(&setup.config);
        info!(
            mac = %identity.mac_address,
            client_id = %identity.client_id,
            "starting conversation engine"
        );

        let (tx, rx) = crossbeam_channel::unbounded::<EngineMsg>();

        let sink_tx = tx.clone();
        let sink: EventSink = Arc::new(move |event| {
            let msg = match event {
                TransportEvent::Opened => EngineMsg::TransportOpened,
                TransportEvent::Closed => EngineMsg::TransportClosed,
                TransportEvent::Text(text) => EngineMsg::TextFrame(text),
                TransportEvent::Binary(data) => EngineMsg::BinaryFrame(data),
            };
            let _ = sink_tx.send(msg);
        });

        let transport: Arc<dyn Transport> = match setup.transport_factory {
            Some(factory) => factory(sink)?,
            None => {
                let headers = merged_headers(&setup.config, &identity);
                Arc::new(WsTransport::new(setup.config.ws_url.clone(), headers, sink)?)
            }
        };

        let provisioner: Arc<dyn Provisioner> = match setup.provisioner {
            Some(provisioner) => provisioner,
            None => Arc::new(HttpProvisioner::new(
                setup.config.ota_url.clone(),
                identity.clone(),
            )?),
        };

        let wake = setup.wake_model.map(|model| {
            let wake_tx = tx.clone();
            WakeWordDetector::new(model, move || {
                let _ = wake_tx.send(EngineMsg::WakeUp);
            })
        });

        let mut registry = Registry::new();
        for entity in setup.entities {
            registry.register(entity);
        }

        let core = EngineCore {
            state: State::Idle,
            chat_state: ChatState::Idle,
            config: setup.config,
            bus: setup.bus,
            registry,
            transport,
            provisioner,
            audio_in,
            audio_out,
            wake,
            capture: None,
            playback: None,
            transmit: None,
            session: None,
            retry_attempt: 0,
            timer: TaskQueue::new("engine-timer"),
            tx: tx.clone(),
        };

        let thread = std::thread::Builder::new()
            .name("voxa-engine".into())
            .spawn(move || core.run(rx))
            .map_err(|e| VoxaError::Other(anyhow::anyhow!("engine thread spawn: {e}")))?;

        let _ = tx.send(EngineMsg::LoadProtocol);

        *self.running.lock() = Some(Running {
            tx,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Inject a `Triggered` edge (button glue calls this).
    pub fn trigger(&self) -> Result<()> {
        self.send(EngineMsg::Trigger)
    }

    /// Tear down to `Idle`: close the session and transport, stop every
    /// engine component, join the engine task.
    pub fn stop(&self) -> Result<()> {
        let mut running = self.running.lock();
        let Some(run) = running.as_mut() else {
            return Err(VoxaError::InvalidState("engine not started"));
        };
        let _ = run.tx.send(EngineMsg::Shutdown);
        if let Some(thread) = run.thread.take() {
            let _ = thread.join();
        }
        *running = None;
        Ok(())
    }

    fn send(&self, msg: EngineMsg) -> Result<()> {
        match self.running.lock().as_ref() {
            Some(run) => {
                let _ = run.tx.send(msg);
                Ok(())
            }
            None => Err(VoxaError::InvalidState("engine not started")),
        }
    }
}

impl Default for ConversationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConversationEngine {
    fn drop(&mut self) {
        let mut running = self.running.lock();
        if let Some(run) = running.as_mut() {
            let _ = run.tx.send(EngineMsg::Shutdown);
            if let Some(thread) = run.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

/// The engine-managed transport headers, merged over application ones.
fn merged_headers(config: &EngineConfig, identity: &Identity) -> Vec<(String, String)> {
    const MANAGED: [&str; 3] = ["Protocol-Version", "Device-Id", "Client-Id"];

    let mut headers: Vec<(String, String)> = config
        .ws_headers
        .iter()
        .filter(|(name, _)| !MANAGED.iter().any(|m| m.eq_ignore_ascii_case(name)))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    headers.push(("Protocol-Version".into(), "1".into()));
    headers.push(("Device-Id".into(), identity.mac_address.clone()));
    headers.push(("Client-Id".into(), identity.client_id.clone()));
    headers
}

// ---------------------------------------------------------------------------
// Engine task
// ---------------------------------------------------------------------------

struct EngineCore {
    state: State,
    chat_state: ChatState,
    config: EngineConfig,
    bus: Option<Arc<EventBus>>,
    registry: Registry,
    transport: Arc<dyn Transport>,
    provisioner: Arc<dyn Provisioner>,
    audio_in: Arc<dyn AudioInput>,
    audio_out: Arc<dyn AudioOutput>,
    wake: Option<WakeWordDetector>,
    capture: Option<CaptureEngine>,
    playback: Option<PlaybackEngine>,
    transmit: Option<TaskQueue>,
    session: Option<SessionContext>,
    retry_attempt: u32,
    /// Schedules delayed self-posts (provisioning retry backoff).
    timer: TaskQueue,
    tx: Sender<EngineMsg>,
}

impl EngineCore {
    fn run(mut self, rx: Receiver<EngineMsg>) {
        self.change_state(State::Initialized);

        while let Ok(msg) = rx.recv() {
            if !self.handle(msg) {
                break;
            }
        }

        self.shutdown();
    }

    /// Returns `false` when the engine should exit.
    fn handle(&mut self, msg: EngineMsg) -> bool {
        match msg {
            EngineMsg::Trigger => self.on_triggered(),
            EngineMsg::WakeUp => self.on_wake_up(),
            EngineMsg::LoadProtocol => self.on_load_protocol(),
            EngineMsg::TransportOpened => self.on_transport_opened(),
            EngineMsg::TransportClosed => self.on_transport_closed(),
            EngineMsg::TextFrame(text) => self.on_text_frame(&text),
            EngineMsg::BinaryFrame(data) => self.on_binary_frame(data),
            EngineMsg::PlaybackDrained => self.on_playback_drained(),
            EngineMsg::Shutdown => return false,
        }
        true
    }

    // -- stimuli ------------------------------------------------------------

    fn on_triggered(&mut self) {
        debug!(state = ?self.state, "triggered");
        match self.state {
            State::Initialized => self.on_load_protocol(),
            State::Standby => {
                if let Err(e) = self.transport.connect() {
                    warn!("transport connect failed: {e}");
                    return;
                }
                self.change_state(State::Connecting);
            }
            State::Listening => self.close_session(),
            State::Speaking => self.send_control(&protocol::abort(self.session_id(), None)),
            // A trigger while a connect is in flight is idempotent.
            State::Connecting | State::ConnectingAfterWake => {}
            _ => {}
        }
    }

    fn on_wake_up(&mut self) {
        debug!(state = ?self.state, "wake word");
        match self.state {
            State::Standby => {
                if let Err(e) = self.transport.connect() {
                    warn!("transport connect failed: {e}");
                    return;
                }
                self.change_state(State::ConnectingAfterWake);
            }
            State::Speaking => self.send_control(&protocol::abort(
                self.session_id(),
                Some("wake_word_detected"),
            )),
            _ => {}
        }
    }

    fn on_load_protocol(&mut self) {
        if self.state != State::Initialized {
            debug!(state = ?self.state, "load protocol ignored");
            return;
        }
        self.change_state(State::LoadingProtocol);

        let response = match self.provisioner.fetch() {
            Ok(response) => response,
            Err(e) => {
                let delay = self.next_retry_delay();
                warn!(retry_in_secs = delay.as_secs(), "provisioning failed: {e}");
                self.change_state(State::Initialized);
                let tx = self.tx.clone();
                self.timer.enqueue_at(Instant::now() + delay, move || {
                    let _ = tx.send(EngineMsg::LoadProtocol);
                });
                return;
            }
        };
        self.retry_attempt = 0;

        if let Some(activation) = response.activation_required() {
            info!(code = %activation.code, "server demands activation");
            self.emit(Event::Activation {
                code: activation.code.clone(),
                message: activation.message.clone(),
            });
            self.change_state(State::Initialized);
            return;
        }

        self.start_wake_detector();
        self.change_state(State::Standby);
    }

    fn on_transport_opened(&mut self) {
        match self.state {
            State::Connecting => self.change_state(State::Connected),
            State::ConnectingAfterWake => self.change_state(State::ConnectedAfterWake),
            _ => {
                warn!(state = ?self.state, "unexpected transport open");
                return;
            }
        }
        self.send_control(&protocol::hello(self.config.frame_duration_ms));
    }

    fn on_transport_closed(&mut self) {
        match self.state {
            State::Connecting
            | State::ConnectingAfterWake
            | State::Connected
            | State::ConnectedAfterWake
            | State::Listening
            | State::Speaking => {
                info!(state = ?self.state, "transport closed, dropping session");
                self.drop_session_engines();
                self.session = None;
                self.start_wake_detector();
                self.change_state(State::Standby);
            }
            // Late close events after a deliberate disconnect land here.
            _ => debug!(state = ?self.state, "transport close ignored"),
        }
    }

    fn on_binary_frame(&mut self, data: Vec<u8>) {
        // Outside Speaking the playback path may be mid-teardown; racing
        // the decoder against it is worse than losing the frame.
        if self.state != State::Speaking {
            return;
        }
        if let Some(playback) = &self.playback {
            playback.write(data);
        }
    }

    fn on_playback_drained(&mut self) {
        if self.state != State::Speaking {
            debug!(state = ?self.state, "drain marker ignored");
            return;
        }
        for envelope in self.registry.updated_json(false) {
            self.send_control(&envelope);
        }
        self.start_listening();
    }

    // -- control frames -----------------------------------------------------

    fn on_text_frame(&mut self, raw: &str) {
        let Some(message) = protocol::parse_server_message(raw) else {
            return;
        };

        match message {
            protocol::ServerMessage::Hello {
                session_id,
                audio_params,
                ..
            } => self.on_server_hello(session_id, audio_params),
            protocol::ServerMessage::Goodbye { session_id } => self.on_goodbye(session_id),
            protocol::ServerMessage::Tts { state, text } => self.on_tts(&state, text),
            protocol::ServerMessage::Stt { text } => {
                if let Some(text) = text {
                    info!(">> {text}");
                    self.emit(Event::ChatMessage {
                        role: ChatRole::User,
                        text,
                    });
                }
            }
            protocol::ServerMessage::Llm { emotion, .. } => {
                if let Some(emotion) = emotion {
                    self.emit(Event::Emotion { emotion });
                }
            }
            protocol::ServerMessage::Iot { commands } => {
                for command in Registry::decode_commands(&commands) {
                    self.emit(Event::IotInvocation {
                        entity: command.entity,
                        method: command.method,
                        parameters: command.parameters,
                    });
                }
            }
        }
    }

    fn on_server_hello(
        &mut self,
        session_id: Option<String>,
        audio_params: Option<protocol::ServerAudioParams>,
    ) {
        if self.state != State::Connected && self.state != State::ConnectedAfterWake {
            warn!(state = ?self.state, "server hello ignored");
            return;
        }
        let after_wake = self.state == State::ConnectedAfterWake;

        // The server's echoed frame duration wins over our offer.
        let frame_duration = audio_params
            .and_then(|p| p.frame_duration)
            .unwrap_or(self.config.frame_duration_ms);
        let session_id = session_id.unwrap_or_default();
        info!(%session_id, frame_duration, "session established");
        self.session = Some(SessionContext::new(session_id, frame_duration));

        for envelope in self.registry.descriptors_json() {
            self.send_control(&envelope);
        }
        for envelope in self.registry.updated_json(true) {
            self.send_control(&envelope);
        }

        self.start_listening();

        if after_wake {
            let phrase = self
                .wake
                .as_ref()
                .map(|w| w.phrase())
                .unwrap_or_else(|| self.config.wake_phrase.clone());
            self.send_control(&protocol::wake_hint(self.session_id(), &phrase));
        }
    }

    fn on_goodbye(&mut self, session_id: Option<String>) {
        let current = self.session.as_ref().map(|s| s.session_id.as_str());
        match (session_id.as_deref(), current) {
            // A goodbye for a stale session is ignored.
            (Some(stale), Some(live)) if stale != live => {
                debug!(stale, live, "stale goodbye ignored");
            }
            _ => {
                info!("server goodbye, closing session");
                self.close_session();
            }
        }
    }

    fn on_tts(&mut self, tts_state: &str, text: Option<String>) {
        match tts_state {
            "start" => {
                if self.state == State::Speaking {
                    debug!("tts start while already speaking");
                    return;
                }
                if self.state != State::Listening {
                    warn!(state = ?self.state, "tts start ignored");
                    return;
                }

                // Release the input device before the wake detector takes
                // it: barge-in detection runs while the server speaks.
                self.capture = None;
                self.transmit = None;
                self.start_wake_detector();

                let frame_duration = self
                    .session
                    .as_ref()
                    .map(|s| s.frame_duration_ms)
                    .unwrap_or(self.config.frame_duration_ms);
                let playback =
                    match PlaybackEngine::new(Arc::clone(&self.audio_out), frame_duration) {
                        Ok(playback) => playback,
                        Err(e) => panic!("audio output device failure: {e}"),
                    };
                self.playback = Some(playback);
                self.change_state(State::Speaking);
            }
            "stop" => {
                if let Some(playback) = &self.playback {
                    let tx = self.tx.clone();
                    playback.notify_data_end(move || {
                        let _ = tx.send(EngineMsg::PlaybackDrained);
                    });
                }
            }
            "sentence_start" => {
                if let Some(text) = text {
                    info!("<< {text}");
                    self.emit(Event::ChatMessage {
                        role: ChatRole::Assistant,
                        text,
                    });
                }
            }
            "sentence_end" => {}
            other => debug!(state = other, "unhandled tts state"),
        }
    }

    // -- session plumbing ---------------------------------------------------

    /// Send `listen start`, hand the input device to capture, and enter
    /// `Listening`. Valid from `Connected*` (fresh session) and `Speaking`
    /// (next turn after drain).
    fn start_listening(&mut self) {
        if !matches!(
            self.state,
            State::Connected | State::ConnectedAfterWake | State::Speaking
        ) {
            warn!(state = ?self.state, "start listening ignored");
            return;
        }

        self.send_control(&protocol::listen_start(self.session_id()));

        self.playback = None;
        self.stop_wake_detector();

        let transmit = TaskQueue::new("transmit");
        let transmit_handle = transmit.handle();
        let transport = Arc::clone(&self.transport);
        let low_power = self.config.low_power;

        let sink: PacketSink = Box::new(move |packet| {
            // Back-pressure: drop at the sink so the capture clock never
            // stalls behind a slow network.
            if low_power && transmit_handle.pending() > TRANSMIT_BACKLOG_LIMIT {
                return;
            }
            let transport = Arc::clone(&transport);
            transmit_handle.enqueue(move || {
                if !transport.is_connected() {
                    return;
                }
                if let Err(e) = transport.send_binary(&packet) {
                    warn!("audio frame send failed: {e}");
                }
            });
        });

        let frame_duration = self
            .session
            .as_ref()
            .map(|s| s.frame_duration_ms)
            .unwrap_or(self.config.frame_duration_ms);
        let capture = match CaptureEngine::new(
            Arc::clone(&self.audio_in),
            frame_duration,
            self.config.low_power,
            sink,
        ) {
            Ok(capture) => capture,
            Err(e) => panic!("audio input device failure: {e}"),
        };

        self.transmit = Some(transmit);
        self.capture = Some(capture);
        self.change_state(State::Listening);
    }

    /// Deliberate session close: tear down engines, resume wake watch,
    /// close the transport, return to `Standby`.
    fn close_session(&mut self) {
        self.drop_session_engines();
        self.session = None;
        self.start_wake_detector();
        self.transport.disconnect();
        self.change_state(State::Standby);
    }

    /// Capture stops before transmit so no tick enqueues onto a dead queue;
    /// playback last.
    fn drop_session_engines(&mut self) {
        self.capture = None;
        self.transmit = None;
        self.playback = None;
    }

    fn start_wake_detector(&mut self) {
        if let Some(wake) = &mut self.wake {
            if let Err(e) = wake.start(Arc::clone(&self.audio_in)) {
                panic!("audio input device failure: {e}");
            }
        }
    }

    fn stop_wake_detector(&mut self) {
        if let Some(wake) = &mut self.wake {
            wake.stop();
        }
    }

    fn shutdown(&mut self) {
        info!("engine shutting down");
        self.drop_session_engines();
        self.stop_wake_detector();
        if self.transport.is_connected() {
            if let Some(session) = &self.session {
                let _ = self
                    .transport
                    .send_text(&protocol::goodbye(&session.session_id));
            }
            self.transport.disconnect();
        }
        self.session = None;
        self.change_state(State::Idle);
    }

    // -- helpers ------------------------------------------------------------

    fn session_id(&self) -> &str {
        self.session.as_ref().map_or("", |s| s.session_id.as_str())
    }

    fn send_control(&self, text: &str) {
        debug!(frame = text, "sending control frame");
        if let Err(e) = self.transport.send_text(text) {
            warn!("control frame send failed: {e}");
        }
    }

    fn next_retry_delay(&mut self) -> Duration {
        let delay = Duration::from_secs(1 << self.retry_attempt.min(6));
        self.retry_attempt = self.retry_attempt.saturating_add(1);
        delay.min(MAX_RETRY_DELAY)
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.push(event);
        }
    }

    fn change_state(&mut self, new_state: State) {
        let new_chat_state = project(new_state);
        if new_chat_state != self.chat_state {
            self.emit(Event::StateChanged {
                old: self.chat_state,
                new: new_chat_state,
            });
        }
        if new_state != self.state {
            debug!(from = ?self.state, to = ?new_state, "state transition");
        }
        self.state = new_state;
        self.chat_state = new_chat_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::audio::null::{NullAudioInput, NullAudioOutput};
    use crate::provision::ProvisionResponse;

    /// Transport that records control frames and never opens on its own —
    /// tests feed `TransportOpened` by hand.
    struct RecordingTransport {
        sent: Mutex<Vec<String>>,
        binary_frames: AtomicUsize,
        connects: AtomicUsize,
        connected: AtomicBool,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                binary_frames: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                connected: AtomicBool::new(false),
            })
        }

        fn sent_types(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter_map(|raw| {
                    serde_json::from_str::<serde_json::Value>(raw)
                        .ok()
                        .and_then(|v| v["type"].as_str().map(str::to_string))
                })
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn send_text(&self, text: &str) -> Result<()> {
            self.sent.lock().push(text.to_string());
            Ok(())
        }

        fn send_binary(&self, _data: &[u8]) -> Result<()> {
            self.binary_frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    struct ReadyProvisioner;

    impl Provisioner for ReadyProvisioner {
        fn fetch(&self) -> Result<ProvisionResponse> {
            Ok(ProvisionResponse::default())
        }
    }

    /// An `EngineCore` wired to fakes, driven synchronously via `handle`.
    fn test_core() -> (
        EngineCore,
        Receiver<EngineMsg>,
        Arc<RecordingTransport>,
        Arc<EventBus>,
    ) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let transport = RecordingTransport::new();
        let bus = Arc::new(EventBus::new());

        let mut config = EngineConfig::default();
        config.frame_duration_ms = 20;

        let core = EngineCore {
            state: State::Idle,
            chat_state: ChatState::Idle,
            config,
            bus: Some(Arc::clone(&bus)),
            registry: Registry::new(),
            transport: Arc::clone(&transport) as Arc<dyn Transport>,
            provisioner: Arc::new(ReadyProvisioner),
            audio_in: Arc::new(NullAudioInput::new()),
            audio_out: Arc::new(NullAudioOutput::new()),
            wake: None,
            capture: None,
            playback: None,
            transmit: None,
            session: None,
            retry_attempt: 0,
            timer: TaskQueue::new("test-engine-timer"),
            tx,
        };
        (core, rx, transport, bus)
    }

    fn server_hello(core: &mut EngineCore, session_id: &str) {
        core.handle(EngineMsg::TextFrame(
            serde_json::json!({
                "type": "hello",
                "session_id": session_id,
                "audio_params": {"frame_duration": 20},
            })
            .to_string(),
        ));
    }

    fn state_changes(bus: &EventBus) -> Vec<(ChatState, ChatState)> {
        bus.pop_all()
            .into_iter()
            .filter_map(|e| match e {
                Event::StateChanged { old, new } => Some((old, new)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn full_turn_walks_the_documented_state_graph() {
        let (mut core, rx, transport, bus) = test_core();

        core.change_state(State::Initialized);
        core.handle(EngineMsg::LoadProtocol);
        core.handle(EngineMsg::Trigger);
        core.handle(EngineMsg::TransportOpened);
        server_hello(&mut core, "s1");

        core.handle(EngineMsg::TextFrame(
            serde_json::json!({"type": "tts", "state": "start"}).to_string(),
        ));
        core.handle(EngineMsg::TextFrame(
            serde_json::json!({"type": "tts", "state": "stop"}).to_string(),
        ));

        // The drain marker comes back through the engine channel.
        let drained = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("drain marker");
        assert!(matches!(drained, EngineMsg::PlaybackDrained));
        core.handle(drained);

        assert_eq!(
            state_changes(&bus),
            vec![
                (ChatState::Idle, ChatState::Initializing),
                (ChatState::Initializing, ChatState::Standby),
                (ChatState::Standby, ChatState::Connecting),
                (ChatState::Connecting, ChatState::Listening),
                (ChatState::Listening, ChatState::Speaking),
                (ChatState::Speaking, ChatState::Listening),
            ]
        );

        // hello, then listen start for each Listening entry.
        assert_eq!(
            transport.sent_types(),
            vec!["hello", "listen", "listen"]
        );
        drop(core);
    }

    #[test]
    fn trigger_while_connecting_is_idempotent() {
        let (mut core, _rx, transport, _bus) = test_core();
        core.change_state(State::Initialized);
        core.handle(EngineMsg::LoadProtocol);
        core.handle(EngineMsg::Trigger);
        assert_eq!(core.state, State::Connecting);

        core.handle(EngineMsg::Trigger);
        core.handle(EngineMsg::Trigger);
        assert_eq!(core.state, State::Connecting);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn server_hello_outside_connected_states_is_dropped() {
        let (mut core, _rx, _transport, _bus) = test_core();
        core.change_state(State::Initialized);
        core.handle(EngineMsg::LoadProtocol);
        assert_eq!(core.state, State::Standby);

        server_hello(&mut core, "s1");
        assert_eq!(core.state, State::Standby);
        assert!(core.session.is_none());
    }

    #[test]
    fn binary_frames_outside_speaking_are_discarded() {
        let (mut core, _rx, _transport, _bus) = test_core();
        core.change_state(State::Initialized);
        core.handle(EngineMsg::LoadProtocol);
        core.handle(EngineMsg::Trigger);
        core.handle(EngineMsg::TransportOpened);
        server_hello(&mut core, "s1");
        assert_eq!(core.state, State::Listening);

        // No playback path exists; the frame must be dropped silently.
        core.handle(EngineMsg::BinaryFrame(vec![0xde, 0xad]));
        assert_eq!(core.state, State::Listening);
        drop(core);
    }

    #[test]
    fn transport_loss_during_listening_falls_back_to_standby() {
        let (mut core, _rx, _transport, bus) = test_core();
        core.change_state(State::Initialized);
        core.handle(EngineMsg::LoadProtocol);
        core.handle(EngineMsg::Trigger);
        core.handle(EngineMsg::TransportOpened);
        server_hello(&mut core, "s1");

        core.handle(EngineMsg::TransportClosed);
        assert_eq!(core.state, State::Standby);
        assert!(core.session.is_none());
        assert!(core.capture.is_none());
        assert!(core.transmit.is_none());

        let changes = state_changes(&bus);
        assert_eq!(
            changes.last(),
            Some(&(ChatState::Listening, ChatState::Standby))
        );
    }

    #[test]
    fn late_close_in_standby_is_ignored() {
        let (mut core, _rx, _transport, bus) = test_core();
        core.change_state(State::Initialized);
        core.handle(EngineMsg::LoadProtocol);
        let _ = bus.pop_all();

        core.handle(EngineMsg::TransportClosed);
        assert_eq!(core.state, State::Standby);
        assert!(state_changes(&bus).is_empty());
    }

    #[test]
    fn speaking_trigger_aborts_without_reason() {
        let (mut core, _rx, transport, _bus) = test_core();
        core.change_state(State::Initialized);
        core.handle(EngineMsg::LoadProtocol);
        core.handle(EngineMsg::Trigger);
        core.handle(EngineMsg::TransportOpened);
        server_hello(&mut core, "s1");
        core.handle(EngineMsg::TextFrame(
            serde_json::json!({"type": "tts", "state": "start"}).to_string(),
        ));
        assert_eq!(core.state, State::Speaking);

        core.handle(EngineMsg::Trigger);
        assert_eq!(core.state, State::Speaking);

        let last = transport.sent.lock().last().cloned().unwrap();
        let frame: serde_json::Value = serde_json::from_str(&last).unwrap();
        assert_eq!(frame["type"], "abort");
        assert_eq!(frame["session_id"], "s1");
        assert!(frame.get("reason").is_none());
        drop(core);
    }

    #[test]
    fn unknown_control_frames_change_nothing() {
        let (mut core, _rx, _transport, bus) = test_core();
        core.change_state(State::Initialized);
        core.handle(EngineMsg::LoadProtocol);
        let _ = bus.pop_all();

        core.handle(EngineMsg::TextFrame("{\"type\":\"mcu\"}".to_string()));
        core.handle(EngineMsg::TextFrame("not json".to_string()));
        assert_eq!(core.state, State::Standby);
        assert!(bus.pop_all().is_empty());
    }

    #[test]
    fn projection_collapses_connect_phases() {
        assert_eq!(project(State::Connecting), ChatState::Connecting);
        assert_eq!(project(State::ConnectingAfterWake), ChatState::Connecting);
        assert_eq!(project(State::Connected), ChatState::Connecting);
        assert_eq!(project(State::ConnectedAfterWake), ChatState::Connecting);
        assert_eq!(project(State::Initialized), ChatState::Initializing);
        assert_eq!(project(State::LoadingProtocol), ChatState::Initializing);
    }

    #[test]
    fn managed_headers_cannot_be_overridden() {
        let mut config = EngineConfig::default();
        config
            .ws_headers
            .insert("Authorization".into(), "Bearer token".into());
        config
            .ws_headers
            .insert("device-id".into(), "spoofed".into());

        let identity = Identity::with_mac("aa:bb:cc:dd:ee:ff");
        let headers = merged_headers(&config, &identity);

        let device_ids: Vec<&str> = headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("Device-Id"))
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(device_ids, ["aa:bb:cc:dd:ee:ff"]);

        assert!(headers
            .iter()
            .any(|(name, value)| name == "Authorization" && value == "Bearer token"));
        assert!(headers
            .iter()
            .any(|(name, value)| name == "Protocol-Version" && value == "1"));
        assert!(headers
            .iter()
            .any(|(name, value)| name == "Client-Id" && *value == identity.client_id));
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        let mut attempt = 0u32;
        let mut delays = Vec::new();
        for _ in 0..8 {
            let delay = Duration::from_secs(1 << attempt.min(6));
            attempt += 1;
            delays.push(delay.min(MAX_RETRY_DELAY));
        }
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[5], Duration::from_secs(32));
        assert_eq!(delays[6], Duration::from_secs(60));
        assert_eq!(delays[7], Duration::from_secs(60));
    }

    #[test]
    fn pre_start_setters_fail_after_start_consumes_the_setup() {
        let engine = ConversationEngine::new();
        // Simulate the freeze without spawning anything.
        engine.setup.lock().take();

        assert!(engine.configure(EngineConfig::default()).is_err());
        assert!(engine.set_observer(Arc::new(EventBus::new())).is_err());
        assert!(engine.trigger().is_err());
        assert!(engine.stop().is_err());
    }
}
