//! Voxa terminal host.
//!
//! Wires audio devices to the conversation engine, drains the event bus to
//! the terminal, and maps the Enter key to the push-button trigger. This is
//! the reference embedding of the SDK's host surface:
//!
//! `configure → register_iot → set_observer → start → trigger/events`.

mod settings;

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use voxa_core::audio::null::{NullAudioInput, NullAudioOutput};
use voxa_core::audio::{AudioInput, AudioOutput};
use voxa_core::{
    ChatRole, ConversationEngine, EnergyWakeModel, Entity, Event, EventBus, Method, MethodParam,
    Property, Value, ValueType,
};

use settings::{default_settings_path, load_settings};

/// How often the host drains the event bus.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn build_devices(
    settings: &settings::AppSettings,
) -> (Arc<dyn AudioInput>, Arc<dyn AudioOutput>) {
    #[cfg(feature = "audio-cpal")]
    if settings.use_hardware_audio {
        use voxa_core::audio::hardware::{CpalAudioInput, CpalAudioOutput};
        info!("using cpal audio devices");
        return (
            Arc::new(CpalAudioInput::new(settings.preferred_input_device.clone())),
            Arc::new(CpalAudioOutput::new()),
        );
    }

    if settings.use_hardware_audio {
        warn!("built without the audio-cpal feature, using synthetic devices");
    }
    (Arc::new(NullAudioInput::new()), Arc::new(NullAudioOutput::new()))
}

/// The demo entity: the backend can ask about and set playback volume.
fn speaker_entity(initial_volume: u8) -> Arc<Entity> {
    Arc::new(Entity::new(
        "Speaker",
        "The device speaker",
        vec![Property::new(
            "volume",
            "Current playback volume (0-100)",
            ValueType::Number,
            i64::from(initial_volume),
        )],
        vec![Method::new(
            "SetVolume",
            "Set the playback volume",
            vec![MethodParam::required(
                "volume",
                "Target volume (0-100)",
                ValueType::Number,
            )],
        )],
    ))
}

#[cfg(feature = "audio-cpal")]
fn print_devices() {
    use voxa_core::audio::hardware::{list_input_devices, list_output_devices};
    println!("input devices:");
    for name in list_input_devices() {
        println!("  {name}");
    }
    println!("output devices:");
    for name in list_output_devices() {
        println!("  {name}");
    }
}

#[cfg(not(feature = "audio-cpal"))]
fn print_devices() {
    println!("built without the audio-cpal feature; no hardware devices");
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxa=info,voxa_core=info".parse().expect("valid filter")),
        )
        .init();

    if std::env::args().nth(1).as_deref() == Some("devices") {
        print_devices();
        return Ok(());
    }

    let settings_path = default_settings_path();
    let app_settings = load_settings(&settings_path);
    info!(
        settings_path = ?settings_path,
        ota_url = %app_settings.engine.ota_url,
        ws_url = %app_settings.engine.ws_url,
        wake_enabled = app_settings.wake.enabled,
        "settings loaded"
    );

    let (audio_in, audio_out) = build_devices(&app_settings);

    let engine = Arc::new(ConversationEngine::new());
    let bus = Arc::new(EventBus::new());
    let speaker = speaker_entity(audio_out.volume());

    engine.configure(app_settings.engine.clone())?;
    engine.set_observer(Arc::clone(&bus))?;
    engine.register_iot(Arc::clone(&speaker))?;
    if app_settings.wake.enabled {
        engine.set_wake_model(Box::new(EnergyWakeModel::new(
            app_settings.wake.phrase.clone(),
            app_settings.wake.threshold,
            app_settings.wake.chunks,
        )))?;
    }

    engine.start(Arc::clone(&audio_in), Arc::clone(&audio_out))?;
    println!("voxa ready — press Enter to talk, 'q' + Enter to quit");

    // Enter = push-button trigger, on its own thread so event polling
    // never blocks on the terminal.
    let trigger_engine = Arc::clone(&engine);
    let (quit_tx, quit_rx) = std::sync::mpsc::channel::<()>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) if line.trim() == "q" => {
                    let _ = quit_tx.send(());
                    break;
                }
                Ok(_) => {
                    if let Err(e) = trigger_engine.trigger() {
                        warn!("trigger failed: {e}");
                    }
                }
                Err(_) => {
                    let _ = quit_tx.send(());
                    break;
                }
            }
        }
    });

    loop {
        if quit_rx.try_recv().is_ok() {
            break;
        }

        for event in bus.pop_all() {
            render_event(&event, &speaker, audio_out.as_ref());
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    engine.stop()?;
    info!("voxa shut down");
    Ok(())
}

fn render_event(event: &Event, speaker: &Arc<Entity>, audio_out: &dyn AudioOutput) {
    match event {
        Event::StateChanged { old, new } => {
            println!("[state] {old:?} -> {new:?}");
        }
        Event::ChatMessage { role, text } => match role {
            ChatRole::User => println!(">> {text}"),
            ChatRole::Assistant => println!("<< {text}"),
        },
        Event::Emotion { emotion } => println!("[emotion] {emotion}"),
        Event::Activation { code, message } => {
            println!("[activation] {message}");
            println!("[activation] code: {code}");
        }
        Event::IotInvocation {
            entity,
            method,
            parameters,
        } => {
            println!("[iot] {entity}.{method}({parameters:?})");
            // The runtime never dispatches side effects; the host does,
            // then publishes the observable state back.
            if entity == "Speaker" && method == "SetVolume" {
                if let Some(Value::Int(volume)) = parameters.get("volume") {
                    let volume = (*volume).clamp(0, 100) as u8;
                    audio_out.set_volume(volume);
                    speaker.update("volume", i64::from(volume));
                    println!("[iot] speaker volume set to {volume}");
                }
            }
        }
    }
}
