//! Session provisioning against the config endpoint.
//!
//! One HTTPS POST carrying a device self-description; the response either
//! clears the device for service or returns an *activation challenge* (a
//! human-readable code the user must enter out-of-band). Everything that
//! can go wrong here — connect, non-2xx status, unparseable body — is one
//! transient error kind; the engine retries with backoff.
//!
//! The response's `mqtt` block is parsed and preserved for forward
//! compatibility but unused on the WebSocket path.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Identity;
use crate::error::{Result, VoxaError};

/// Connection-level deadline for the provisioning POST.
const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Seam for the provisioning call; tests substitute a scripted one.
pub trait Provisioner: Send + Sync {
    fn fetch(&self) -> Result<ProvisionResponse>;
}

// ---------------------------------------------------------------------------
// Request body
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ChipInfo {
    pub model: u32,
    pub cores: u32,
    pub revision: u32,
    pub features: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationInfo {
    pub name: String,
    pub version: String,
    pub compile_time: String,
    pub idf_version: String,
    pub elf_sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionInfo {
    pub label: String,
    #[serde(rename = "type")]
    pub partition_type: u32,
    pub subtype: u32,
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoardInfo {
    #[serde(rename = "type")]
    pub board_type: String,
    pub mac: String,
}

/// Device self-description posted to the config endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub version: u32,
    pub flash_size: u64,
    pub minimum_free_heap_size: u64,
    pub mac_address: String,
    pub uuid: String,
    pub chip_model_name: String,
    pub chip_info: ChipInfo,
    pub application: ApplicationInfo,
    pub partition_table: Vec<PartitionInfo>,
    pub board: BoardInfo,
}

impl DeviceReport {
    /// A report describing this process as a board-less runtime.
    pub fn for_identity(identity: &Identity) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        Self {
            version: 2,
            flash_size: 0,
            minimum_free_heap_size: 0,
            mac_address: identity.mac_address.clone(),
            uuid: identity.client_id.clone(),
            chip_model_name: std::env::consts::ARCH.to_string(),
            chip_info: ChipInfo {
                model: 0,
                cores,
                revision: 0,
                features: 0,
            },
            application: ApplicationInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                compile_time: String::new(),
                idf_version: String::new(),
                elf_sha256: String::new(),
            },
            partition_table: Vec::new(),
            board: BoardInfo {
                board_type: std::env::consts::OS.to_string(),
                mac: identity.mac_address.clone(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// The `mqtt` block — carried through untouched on the WebSocket path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub endpoint: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub publish_topic: String,
    pub subscribe_topic: String,
}

/// The `activation` block. A non-empty `code` means the server refuses
/// service until the user activates the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Activation {
    pub code: String,
    pub message: String,
}

/// Parsed provisioning verdict.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvisionResponse {
    pub mqtt: Option<MqttConfig>,
    pub activation: Option<Activation>,
}

impl ProvisionResponse {
    /// The activation challenge, when the server demands one.
    pub fn activation_required(&self) -> Option<&Activation> {
        self.activation.as_ref().filter(|a| !a.code.is_empty())
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Blocking HTTPS provisioner. Runs on the engine task — provisioning
/// happens before any session exists, so blocking it is harmless.
pub struct HttpProvisioner {
    url: String,
    identity: Identity,
    report: DeviceReport,
    client: reqwest::blocking::Client,
}

impl HttpProvisioner {
    pub fn new(url: String, identity: Identity) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| VoxaError::Provisioning(format!("http client: {e}")))?;
        let report = DeviceReport::for_identity(&identity);
        Ok(Self {
            url,
            identity,
            report,
            client,
        })
    }
}

impl Provisioner for HttpProvisioner {
    fn fetch(&self) -> Result<ProvisionResponse> {
        debug!(url = %self.url, "provisioning request");

        let response = self
            .client
            .post(&self.url)
            .header("Device-Id", &self.identity.mac_address)
            .header("Client-Id", &self.identity.client_id)
            .json(&self.report)
            .send()
            .map_err(|e| VoxaError::Provisioning(format!("request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VoxaError::Provisioning(format!("http status {status}")));
        }

        response
            .json::<ProvisionResponse>()
            .map_err(|e| VoxaError::Provisioning(format!("parse: {e}")))
    }
}
