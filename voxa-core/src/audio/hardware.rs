//! cpal-backed audio devices (feature `audio-cpal`).
//!
//! # Design constraints
//!
//! The cpal callbacks run on OS audio threads at elevated priority and
//! must not allocate, block on a lock, or perform I/O. Both directions
//! therefore hand samples through lock-free SPSC ring buffers: the input
//! callback pushes captured PCM, `read` drains it; `write` pushes playback
//! PCM, the output callback drains it (zero-filling on underrun).
//!
//! `cpal::Stream` is `!Send` on Windows/macOS, so each open device parks a
//! dedicated thread that builds, owns, and finally drops the stream.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{error, info, warn};

use super::{AudioInput, AudioOutput};
use crate::error::{Result, VoxaError};

/// Ring capacity: 2^16 samples ≈ 1.4 s at 48 kHz. Enough to ride out
/// scheduling hiccups without masking a stalled consumer.
const RING_CAPACITY: usize = 1 << 16;

/// Blocking read deadline; expiry zero-fills the remainder.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// List available input device names. Empty when the host has none.
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    }
}

/// List available output device names.
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            warn!("failed to enumerate output devices: {e}");
            Vec::new()
        }
    }
}

fn mix_to_mono(data: &[f32], channels: usize, out: &mut Vec<i16>) {
    out.clear();
    for frame in data.chunks_exact(channels) {
        let sum: f32 = frame.iter().sum();
        let sample = (sum / channels as f32).clamp(-1.0, 1.0);
        out.push((sample * 32767.0) as i16);
    }
}

struct OpenInput {
    sample_rate: u32,
    consumer: HeapCons<i16>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Microphone capture through the default (or named) cpal input device.
pub struct CpalAudioInput {
    preferred: Option<String>,
    state: Mutex<Option<OpenInput>>,
}

impl CpalAudioInput {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self {
            preferred: preferred_device,
            state: Mutex::new(None),
        }
    }
}

impl AudioInput for CpalAudioInput {
    fn open(&self, _sample_rate: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }

        let (producer, consumer) = HeapRb::<i16>::new(RING_CAPACITY).split();
        let stop = Arc::new(AtomicBool::new(false));
        let (open_tx, open_rx) = mpsc::channel::<Result<u32>>();

        let thread_stop = Arc::clone(&stop);
        let preferred = self.preferred.clone();
        let thread = std::thread::Builder::new()
            .name("cpal-input".into())
            .spawn(move || input_thread(preferred, producer, thread_stop, open_tx))
            .map_err(|e| VoxaError::AudioDevice(format!("input thread spawn: {e}")))?;

        match open_rx.recv() {
            Ok(Ok(rate)) => {
                info!(rate, "cpal input open");
                *state = Some(OpenInput {
                    sample_rate: rate,
                    consumer,
                    stop,
                    thread: Some(thread),
                });
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoxaError::AudioDevice("input thread died".into())),
        }
    }

    fn close(&self) {
        if let Some(mut open) = self.state.lock().take() {
            open.stop.store(true, Ordering::SeqCst);
            if let Some(thread) = open.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn read(&self, buf: &mut [i16]) -> Result<usize> {
        let mut state = self.state.lock();
        let open = state
            .as_mut()
            .ok_or(VoxaError::AudioDevice("input device not open".into()))?;

        let deadline = Instant::now() + READ_TIMEOUT;
        let mut filled = 0;
        while filled < buf.len() {
            filled += open.consumer.pop_slice(&mut buf[filled..]);
            if filled == buf.len() {
                break;
            }
            if Instant::now() >= deadline {
                buf[filled..].fill(0);
                filled = buf.len();
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(filled)
    }

    fn sample_rate(&self) -> u32 {
        self.state.lock().as_ref().map_or(16_000, |o| o.sample_rate)
    }
}

impl Drop for CpalAudioInput {
    fn drop(&mut self) {
        self.close();
    }
}

fn input_thread(
    preferred: Option<String>,
    mut producer: HeapProd<i16>,
    stop: Arc<AtomicBool>,
    open_tx: mpsc::Sender<Result<u32>>,
) {
    let host = cpal::default_host();
    let device = match preferred {
        Some(ref name) => host
            .input_devices()
            .ok()
            .and_then(|mut devices| {
                devices.find(|d| d.name().map(|n| n == *name).unwrap_or(false))
            })
            .or_else(|| host.default_input_device()),
        None => host.default_input_device(),
    };
    let Some(device) = device else {
        let _ = open_tx.send(Err(VoxaError::AudioDevice("no input device".into())));
        return;
    };

    let supported = match device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = open_tx.send(Err(VoxaError::AudioDevice(e.to_string())));
            return;
        }
    };
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let ch = channels as usize;

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            let mut mono = Vec::new();
            device.build_input_stream(
                &config,
                move |data: &[f32], _info| {
                    mix_to_mono(data, ch, &mut mono);
                    let written = producer.push_slice(&mono);
                    if written < mono.len() {
                        warn!("input ring full: dropped {} samples", mono.len() - written);
                    }
                },
                |err| error!("input stream error: {err}"),
                None,
            )
        }
        SampleFormat::I16 => {
            let mut mono: Vec<i16> = Vec::new();
            device.build_input_stream(
                &config,
                move |data: &[i16], _info| {
                    mono.clear();
                    for frame in data.chunks_exact(ch) {
                        let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
                        mono.push((sum / ch as i32) as i16);
                    }
                    let written = producer.push_slice(&mono);
                    if written < mono.len() {
                        warn!("input ring full: dropped {} samples", mono.len() - written);
                    }
                },
                |err| error!("input stream error: {err}"),
                None,
            )
        }
        fmt => {
            let _ = open_tx.send(Err(VoxaError::AudioDevice(format!(
                "unsupported input sample format: {fmt:?}"
            ))));
            return;
        }
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = open_tx.send(Err(VoxaError::AudioDevice(e.to_string())));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = open_tx.send(Err(VoxaError::AudioDevice(e.to_string())));
        return;
    }
    let _ = open_tx.send(Ok(sample_rate));

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }
    // Stream drops here, on the thread that created it.
}

struct OpenOutput {
    sample_rate: u32,
    producer: HeapProd<i16>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Speaker playback through the default cpal output device.
pub struct CpalAudioOutput {
    volume: Arc<AtomicU8>,
    state: Mutex<Option<OpenOutput>>,
}

impl CpalAudioOutput {
    pub fn new() -> Self {
        Self {
            volume: Arc::new(AtomicU8::new(70)),
            state: Mutex::new(None),
        }
    }
}

impl Default for CpalAudioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for CpalAudioOutput {
    fn open(&self, _sample_rate: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }

        let (producer, consumer) = HeapRb::<i16>::new(RING_CAPACITY).split();
        let stop = Arc::new(AtomicBool::new(false));
        let (open_tx, open_rx) = mpsc::channel::<Result<u32>>();

        let thread_stop = Arc::clone(&stop);
        let volume = Arc::clone(&self.volume);
        let thread = std::thread::Builder::new()
            .name("cpal-output".into())
            .spawn(move || output_thread(consumer, volume, thread_stop, open_tx))
            .map_err(|e| VoxaError::AudioDevice(format!("output thread spawn: {e}")))?;

        match open_rx.recv() {
            Ok(Ok(rate)) => {
                info!(rate, "cpal output open");
                *state = Some(OpenOutput {
                    sample_rate: rate,
                    producer,
                    stop,
                    thread: Some(thread),
                });
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoxaError::AudioDevice("output thread died".into())),
        }
    }

    fn close(&self) {
        if let Some(mut open) = self.state.lock().take() {
            open.stop.store(true, Ordering::SeqCst);
            if let Some(thread) = open.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn write(&self, pcm: &[i16]) -> Result<usize> {
        let mut state = self.state.lock();
        let open = state
            .as_mut()
            .ok_or(VoxaError::AudioDevice("output device not open".into()))?;

        // Block while the ring is full so callers stay paced to the device.
        let mut written = 0;
        while written < pcm.len() {
            written += open.producer.push_slice(&pcm[written..]);
            if written < pcm.len() {
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        Ok(written)
    }

    fn set_volume(&self, volume: u8) {
        self.volume.store(volume.min(100), Ordering::Relaxed);
    }

    fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    fn sample_rate(&self) -> u32 {
        self.state.lock().as_ref().map_or(24_000, |o| o.sample_rate)
    }
}

impl Drop for CpalAudioOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn output_thread(
    mut consumer: HeapCons<i16>,
    volume: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    open_tx: mpsc::Sender<Result<u32>>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        let _ = open_tx.send(Err(VoxaError::AudioDevice("no output device".into())));
        return;
    };

    let supported = match device.default_output_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = open_tx.send(Err(VoxaError::AudioDevice(e.to_string())));
            return;
        }
    };
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let ch = channels as usize;

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _info| {
                let gain = f32::from(volume.load(Ordering::Relaxed)) / 100.0;
                for frame in data.chunks_exact_mut(ch) {
                    let mut sample = 0i16;
                    let got = consumer.pop_slice(std::slice::from_mut(&mut sample));
                    let value = if got == 1 {
                        f32::from(sample) / 32768.0 * gain
                    } else {
                        0.0
                    };
                    frame.fill(value);
                }
            },
            |err| error!("output stream error: {err}"),
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _info| {
                let gain = i32::from(volume.load(Ordering::Relaxed));
                for frame in data.chunks_exact_mut(ch) {
                    let mut sample = 0i16;
                    let got = consumer.pop_slice(std::slice::from_mut(&mut sample));
                    let value = if got == 1 {
                        (i32::from(sample) * gain / 100) as i16
                    } else {
                        0
                    };
                    frame.fill(value);
                }
            },
            |err| error!("output stream error: {err}"),
            None,
        ),
        fmt => {
            let _ = open_tx.send(Err(VoxaError::AudioDevice(format!(
                "unsupported output sample format: {fmt:?}"
            ))));
            return;
        }
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = open_tx.send(Err(VoxaError::AudioDevice(e.to_string())));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = open_tx.send(Err(VoxaError::AudioDevice(e.to_string())));
        return;
    }
    let _ = open_tx.send(Ok(sample_rate));

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }
}
