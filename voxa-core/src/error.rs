use thiserror::Error;

/// All errors produced by voxa-core.
#[derive(Debug, Error)]
pub enum VoxaError {
    /// Lifecycle misuse: a pre-start setter was called after `start()`,
    /// or `start()`/`stop()` in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Provisioning failed transiently (connect, HTTP status, or parse).
    /// The engine retries these with backoff.
    #[error("provisioning error: {0}")]
    Provisioning(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Outbound send exceeded its deadline.
    #[error("transport send timed out after {0} ms")]
    SendTimeout(u64),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxaError>;
