//! Persistent application settings (JSON file next to the binary or at an
//! explicit path).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use voxa_core::EngineConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Engine endpoints and tuning; missing fields take the SDK defaults.
    pub engine: EngineConfig,
    /// Energy-heuristic wake word (no model files required).
    pub wake: WakeSettings,
    /// Capture from real hardware instead of the synthetic devices.
    /// Only honoured when built with the `audio-cpal` feature.
    pub use_hardware_audio: bool,
    pub preferred_input_device: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeSettings {
    pub enabled: bool,
    pub phrase: String,
    /// RMS threshold in [0, 1].
    pub threshold: f32,
    /// Consecutive loud 80 ms chunks required to fire.
    pub chunks: u32,
}

impl Default for WakeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            phrase: "hey voxa".into(),
            threshold: 0.05,
            chunks: 3,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.wake.threshold = self.wake.threshold.clamp(0.001, 0.9);
        self.wake.chunks = self.wake.chunks.clamp(1, 50);
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
    }
}

pub fn default_settings_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("voxa.json"))
}

/// Load settings, falling back to defaults when the file is missing or
/// unreadable (a fresh install has no settings file).
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<AppSettings>(&raw) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(?path, "settings file unparseable, using defaults: {e}");
                AppSettings::default()
            }
        },
        Err(_) => AppSettings::default(),
    };
    settings.normalize();
    settings
}
