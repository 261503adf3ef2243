//! Engine configuration and device identity.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default provisioning endpoint.
pub const DEFAULT_OTA_URL: &str = "https://api.tenclass.net/xiaozhi/ota/";

/// Default realtime endpoint.
pub const DEFAULT_WS_URL: &str = "wss://api.tenclass.net/xiaozhi/v1/";

/// Configuration for [`ConversationEngine`](crate::engine::ConversationEngine).
///
/// All fields must be set before `start()`; post-start mutation is
/// rejected with `InvalidState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Provisioning endpoint (one-shot HTTPS POST).
    pub ota_url: String,
    /// Realtime endpoint (TLS WebSocket).
    pub ws_url: String,
    /// Application headers merged into the transport header set.
    /// `Protocol-Version`, `Device-Id` and `Client-Id` are engine-managed
    /// and cannot be overridden here.
    pub ws_headers: HashMap<String, String>,
    /// Negotiated Opus frame length in milliseconds. Must be 20 or 60.
    pub frame_duration_ms: u32,
    /// Phrase reported in the wake hint after a wake-word connect.
    pub wake_phrase: String,
    /// RAM-constrained profile: capture encodes at complexity 0 / 8 kb/s
    /// and frames are dropped when more than 5 sends are pending.
    pub low_power: bool,
    /// Device MAC override (`aa:bb:cc:dd:ee:ff`). When unset, a stable
    /// locally-administered address is generated per process.
    pub device_mac: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ota_url: DEFAULT_OTA_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            ws_headers: HashMap::new(),
            frame_duration_ms: 60,
            wake_phrase: "hey voxa".to_string(),
            low_power: false,
            device_mac: None,
        }
    }
}

impl EngineConfig {
    /// Validate field ranges. Called by the engine at `start()`.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.frame_duration_ms != 20 && self.frame_duration_ms != 60 {
            return Err(crate::error::VoxaError::InvalidState(
                "frame_duration_ms must be 20 or 60",
            ));
        }
        Ok(())
    }
}

/// Stable per-process device identity sent with every provisioning call
/// and transport connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Lowercase colon-separated MAC address.
    pub mac_address: String,
    /// UUID v4, generated once per process.
    pub client_id: String,
}

impl Identity {
    /// Build from an explicit MAC (normalised to lowercase).
    pub fn with_mac(mac: &str) -> Self {
        Self {
            mac_address: mac.trim().to_ascii_lowercase(),
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Generate a locally-administered unicast MAC plus a fresh client id.
    /// Used when the host supplies no hardware address.
    pub fn generate() -> Self {
        use rand::Rng;

        let mut octets = [0u8; 6];
        rand::thread_rng().fill(&mut octets);
        // Locally administered, unicast.
        octets[0] = (octets[0] | 0x02) & 0xfe;

        let mac = octets
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");

        Self {
            mac_address: mac,
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Resolve identity from config: explicit MAC when present, generated
    /// otherwise.
    pub fn from_config(config: &EngineConfig) -> Self {
        match &config.device_mac {
            Some(mac) => Self::with_mac(mac),
            None => Self::generate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_endpoints() {
        let config = EngineConfig::default();
        assert_eq!(config.ota_url, DEFAULT_OTA_URL);
        assert_eq!(config.ws_url, DEFAULT_WS_URL);
        assert_eq!(config.frame_duration_ms, 60);
        assert!(!config.low_power);
    }

    #[test]
    fn validate_rejects_unsupported_frame_durations() {
        let mut config = EngineConfig::default();
        config.frame_duration_ms = 40;
        assert!(config.validate().is_err());

        config.frame_duration_ms = 20;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_deserializes_with_partial_fields() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"ota_url": "http://localhost:9000/ota/", "low_power": true}"#,
        )
        .unwrap();
        assert_eq!(config.ota_url, "http://localhost:9000/ota/");
        assert!(config.low_power);
        assert_eq!(config.frame_duration_ms, 60);
    }

    #[test]
    fn explicit_mac_is_normalised_to_lowercase() {
        let identity = Identity::with_mac("AA:BB:CC:00:11:22");
        assert_eq!(identity.mac_address, "aa:bb:cc:00:11:22");
    }

    #[test]
    fn generated_mac_is_locally_administered_unicast() {
        let identity = Identity::generate();
        let first_octet =
            u8::from_str_radix(&identity.mac_address[..2], 16).expect("hex octet");
        assert_eq!(first_octet & 0x02, 0x02, "locally administered bit unset");
        assert_eq!(first_octet & 0x01, 0x00, "multicast bit set");
        assert_eq!(identity.mac_address.split(':').count(), 6);
    }

    #[test]
    fn client_id_parses_as_uuid_v4() {
        let identity = Identity::generate();
        let parsed = uuid::Uuid::parse_str(&identity.client_id).expect("valid uuid");
        assert_eq!(parsed.get_version_num(), 4);
    }
}
