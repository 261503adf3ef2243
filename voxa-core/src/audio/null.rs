//! Synthetic audio devices.
//!
//! `NullAudioInput` produces silence paced at the device clock rate;
//! `NullAudioOutput` swallows PCM at the same pace. They let the whole
//! runtime — engines, wake detector, tests, the demo host — run on
//! machines with no usable audio hardware, and give tests a device whose
//! timing they control.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{AudioInput, AudioOutput};
use crate::error::{Result, VoxaError};

/// Silence source. `read` zero-fills and sleeps for the real-time duration
/// of the requested samples, so consumers tick at the same cadence a
/// hardware microphone would impose.
pub struct NullAudioInput {
    /// Rate the "hardware" runs at; `None` adopts whatever `open` requests.
    native_rate: Option<u32>,
    state: Mutex<Option<u32>>,
}

impl NullAudioInput {
    pub fn new() -> Self {
        Self {
            native_rate: None,
            state: Mutex::new(None),
        }
    }

    /// A device that insists on `rate` regardless of what `open` asks for,
    /// forcing consumers through the resampling path.
    pub fn with_native_rate(rate: u32) -> Self {
        Self {
            native_rate: Some(rate),
            state: Mutex::new(None),
        }
    }

    fn open_rate(&self) -> Result<u32> {
        self.state
            .lock()
            .ok_or(VoxaError::AudioDevice("input device not open".into()))
    }
}

impl Default for NullAudioInput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioInput for NullAudioInput {
    fn open(&self, sample_rate: u32) -> Result<()> {
        let rate = self.native_rate.unwrap_or(sample_rate);
        *self.state.lock() = Some(rate);
        Ok(())
    }

    fn close(&self) {
        *self.state.lock() = None;
    }

    fn read(&self, buf: &mut [i16]) -> Result<usize> {
        let rate = self.open_rate()?;
        buf.fill(0);
        let micros = buf.len() as u64 * 1_000_000 / u64::from(rate);
        std::thread::sleep(Duration::from_micros(micros));
        Ok(buf.len())
    }

    fn sample_rate(&self) -> u32 {
        self.state.lock().unwrap_or(16_000)
    }
}

/// PCM sink. Accepts every write, tracks the total sample count, and
/// sleeps for the real-time duration of each block to model the device
/// draining its buffer.
pub struct NullAudioOutput {
    native_rate: Option<u32>,
    state: Mutex<Option<u32>>,
    volume: AtomicU8,
    samples_written: AtomicUsize,
}

impl NullAudioOutput {
    pub fn new() -> Self {
        Self {
            native_rate: None,
            state: Mutex::new(None),
            volume: AtomicU8::new(70),
            samples_written: AtomicUsize::new(0),
        }
    }

    /// A device pinned to `rate` (see [`NullAudioInput::with_native_rate`]).
    pub fn with_native_rate(rate: u32) -> Self {
        Self {
            native_rate: Some(rate),
            ..Self::new()
        }
    }

    /// Total samples accepted since construction.
    pub fn samples_written(&self) -> usize {
        self.samples_written.load(Ordering::Relaxed)
    }
}

impl Default for NullAudioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for NullAudioOutput {
    fn open(&self, sample_rate: u32) -> Result<()> {
        let rate = self.native_rate.unwrap_or(sample_rate);
        *self.state.lock() = Some(rate);
        Ok(())
    }

    fn close(&self) {
        *self.state.lock() = None;
    }

    fn write(&self, pcm: &[i16]) -> Result<usize> {
        let rate = self
            .state
            .lock()
            .ok_or(VoxaError::AudioDevice("output device not open".into()))?;
        self.samples_written.fetch_add(pcm.len(), Ordering::Relaxed);
        let micros = pcm.len() as u64 * 1_000_000 / u64::from(rate);
        std::thread::sleep(Duration::from_micros(micros));
        Ok(pcm.len())
    }

    fn set_volume(&self, volume: u8) {
        self.volume.store(volume.min(100), Ordering::Relaxed);
    }

    fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    fn sample_rate(&self) -> u32 {
        self.state.lock().unwrap_or(24_000)
    }
}
