//! Audio device capabilities and the capture/playback engines.
//!
//! The runtime never talks to audio hardware directly: it consumes the
//! [`AudioInput`] and [`AudioOutput`] capability traits. Hardware-specific
//! types (I²S codecs on embedded boards, cpal on desktops) implement them;
//! the engines are polymorphic over `Arc<dyn AudioInput>` /
//! `Arc<dyn AudioOutput>`.
//!
//! # Sharing
//!
//! The input device is shared between the capture engine and the wake-word
//! detector, but never read by both at once — the conversation engine
//! sequences `stop → start` so exactly one reader holds it at any time.
//! Implementations use interior mutability and must be `Send + Sync`.

pub mod capture;
pub mod null;
pub mod playback;
pub mod resample;

#[cfg(feature = "audio-cpal")]
pub mod hardware;

use crate::error::Result;

/// Capture capability.
///
/// `read` blocks until the buffer is filled or an internal timeout
/// (≈1 s) expires; on timeout it zero-fills and returns the sample count
/// anyway, keeping downstream clocks ticking through device stalls.
pub trait AudioInput: Send + Sync {
    /// Open the device, requesting `sample_rate`. The device may settle on
    /// a different rate; callers check [`AudioInput::sample_rate`] and
    /// resample as needed.
    fn open(&self, sample_rate: u32) -> Result<()>;

    fn close(&self);

    /// Fill `buf` with captured PCM; returns the number of samples written.
    fn read(&self, buf: &mut [i16]) -> Result<usize>;

    /// The rate the device actually runs at (valid while open).
    fn sample_rate(&self) -> u32;
}

/// Playback capability.
pub trait AudioOutput: Send + Sync {
    /// Open the device, requesting `sample_rate` (see [`AudioInput::open`]).
    fn open(&self, sample_rate: u32) -> Result<()>;

    fn close(&self);

    /// Write PCM to the device; returns the number of samples accepted.
    fn write(&self, pcm: &[i16]) -> Result<usize>;

    /// Set output volume, 0..=100.
    fn set_volume(&self, volume: u8);

    fn volume(&self) -> u8;

    /// The rate the device actually runs at (valid while open).
    fn sample_rate(&self) -> u32;
}
