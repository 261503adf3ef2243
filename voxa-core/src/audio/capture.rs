//! Capture engine: device → resample → Opus encode → packet sink.
//!
//! One engine instance owns the input device for its whole lifetime.
//! Construction opens the device at 16 kHz and spawns a cooperative tick
//! loop on a dedicated task queue; each tick reads exactly one frame's
//! worth of device samples, so the loop is paced by the device clock, not
//! a timer. Dropping the engine stops the loop, joins it, and closes the
//! device.
//!
//! Encode failures are logged and the frame dropped — the pipeline keeps
//! running. A hard device read error is unrecoverable (there is no local
//! fallback for lost audio hardware) and aborts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};

use super::resample::RateConverter;
use super::AudioInput;
use crate::error::{Result, VoxaError};
use crate::taskq::{TaskQueue, TaskQueueHandle};

/// Canonical capture rate the backend expects.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Upper bound for one encoded Opus packet.
const MAX_PACKET_BYTES: usize = 1500;

/// Receives each encoded packet.
pub type PacketSink = Box<dyn FnMut(Vec<u8>) + Send>;

/// Periodic read → resample → encode → deliver loop.
pub struct CaptureEngine {
    running: Arc<AtomicBool>,
    queue: Option<TaskQueue>,
    device: Arc<dyn AudioInput>,
}

struct TickCtx {
    device: Arc<dyn AudioInput>,
    encoder: opus::Encoder,
    resampler: Option<RateConverter>,
    running: Arc<AtomicBool>,
    sink: PacketSink,
    /// Samples read from the device per tick.
    device_frame: usize,
    /// Samples per encoded frame at 16 kHz.
    frame_samples: usize,
    read_buf: Vec<i16>,
    /// 16 kHz PCM awaiting a full frame (the resampler emits uneven blocks).
    pending: Vec<i16>,
    packet_buf: Vec<u8>,
}

impl CaptureEngine {
    /// Open the device and start capturing.
    ///
    /// `frame_duration_ms` must be a valid Opus frame length (20 or 60
    /// here). With `low_power`, the encoder runs at complexity 0 and
    /// 8 kb/s; otherwise complexity 5.
    pub fn new(
        device: Arc<dyn AudioInput>,
        frame_duration_ms: u32,
        low_power: bool,
        sink: PacketSink,
    ) -> Result<Self> {
        device.open(CAPTURE_SAMPLE_RATE)?;
        let device_rate = device.sample_rate();

        let mut encoder = opus::Encoder::new(
            CAPTURE_SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Voip,
        )
        .map_err(|e| VoxaError::Codec(format!("encoder create: {e}")))?;
        encoder
            .set_vbr(true)
            .map_err(|e| VoxaError::Codec(format!("encoder vbr: {e}")))?;
        // DTX collapses silent frames to keepalive packets.
        encoder
            .set_dtx(true)
            .map_err(|e| VoxaError::Codec(format!("encoder dtx: {e}")))?;
        encoder
            .set_complexity(if low_power { 0 } else { 5 })
            .map_err(|e| VoxaError::Codec(format!("encoder complexity: {e}")))?;
        if low_power {
            encoder
                .set_bitrate(opus::Bitrate::Bits(8_000))
                .map_err(|e| VoxaError::Codec(format!("encoder bitrate: {e}")))?;
        }

        let device_frame = (device_rate / 1000 * frame_duration_ms) as usize;
        let frame_samples = (CAPTURE_SAMPLE_RATE / 1000 * frame_duration_ms) as usize;

        let resampler = if device_rate != CAPTURE_SAMPLE_RATE {
            debug!(device_rate, "capture resampling to {CAPTURE_SAMPLE_RATE} Hz");
            Some(RateConverter::new(
                device_rate,
                CAPTURE_SAMPLE_RATE,
                device_frame,
            )?)
        } else {
            None
        };

        let running = Arc::new(AtomicBool::new(true));
        let queue = TaskQueue::new("capture");

        let ctx = TickCtx {
            device: Arc::clone(&device),
            encoder,
            resampler,
            running: Arc::clone(&running),
            sink,
            device_frame,
            frame_samples,
            read_buf: vec![0i16; device_frame],
            pending: Vec::with_capacity(frame_samples * 2),
            packet_buf: vec![0u8; MAX_PACKET_BYTES],
        };
        pump(queue.handle(), ctx);

        info!(device_rate, frame_duration_ms, low_power, "capture started");

        Ok(Self {
            running,
            queue: Some(queue),
            device,
        })
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Joining the queue guarantees no tick is mid-read before close.
        self.queue.take();
        self.device.close();
        info!("capture stopped");
    }
}

fn pump(handle: TaskQueueHandle, mut ctx: TickCtx) {
    let next = handle.clone();
    handle.enqueue(move || {
        if !ctx.running.load(Ordering::Relaxed) {
            return;
        }
        ctx.tick();
        pump(next, ctx);
    });
}

impl TickCtx {
    fn tick(&mut self) {
        let n = self
            .device
            .read(&mut self.read_buf[..self.device_frame])
            .unwrap_or_else(|e| panic!("audio input device failure: {e}"));
        if n == 0 {
            return;
        }

        match self.resampler {
            Some(ref mut resampler) => {
                let resampled = resampler.process(&self.read_buf[..n]);
                self.pending.extend_from_slice(&resampled);
            }
            None => self.pending.extend_from_slice(&self.read_buf[..n]),
        }

        while self.pending.len() >= self.frame_samples {
            let frame: Vec<i16> = self.pending.drain(..self.frame_samples).collect();
            match self.encoder.encode(&frame, &mut self.packet_buf) {
                Ok(len) => {
                    let packet = self.packet_buf[..len].to_vec();
                    (self.sink)(packet);
                }
                Err(e) => {
                    error!("opus encode failed, frame dropped: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::null::NullAudioInput;

    use std::sync::mpsc;
    use std::time::Duration;

    fn collecting_sink() -> (PacketSink, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        let sink: PacketSink = Box::new(move |packet| {
            let _ = tx.send(packet);
        });
        (sink, rx)
    }

    #[test]
    fn produces_packets_that_decode_to_one_frame() {
        let device = Arc::new(NullAudioInput::new());
        let (sink, rx) = collecting_sink();
        let engine = CaptureEngine::new(device, 60, false, sink).unwrap();

        let packet = rx.recv_timeout(Duration::from_secs(2)).expect("a packet");
        drop(engine);

        assert!(!packet.is_empty());

        // One packet must decode to exactly one 60 ms frame at 16 kHz.
        let mut decoder = opus::Decoder::new(16_000, opus::Channels::Mono).unwrap();
        let mut pcm = vec![0i16; 16_000 / 1000 * 60];
        let decoded = decoder.decode(&packet, &mut pcm, false).unwrap();
        assert_eq!(decoded, 960);
    }

    #[test]
    fn resamples_when_the_device_runs_faster() {
        let device = Arc::new(NullAudioInput::with_native_rate(48_000));
        let (sink, rx) = collecting_sink();
        let engine = CaptureEngine::new(device, 20, false, sink).unwrap();

        let packet = rx.recv_timeout(Duration::from_secs(2)).expect("a packet");
        drop(engine);

        let mut decoder = opus::Decoder::new(16_000, opus::Channels::Mono).unwrap();
        let mut pcm = vec![0i16; 320];
        let decoded = decoder.decode(&packet, &mut pcm, false).unwrap();
        assert_eq!(decoded, 320);
    }

    #[test]
    fn drop_stops_the_loop_and_closes_the_device() {
        let device = Arc::new(NullAudioInput::new());
        let (sink, rx) = collecting_sink();
        let input: Arc<dyn AudioInput> = device.clone();
        let engine = CaptureEngine::new(input, 20, false, sink).unwrap();

        let _ = rx.recv_timeout(Duration::from_secs(2)).expect("a packet");
        drop(engine);

        // Device is closed: no further packets after the queue drains.
        while rx.recv_timeout(Duration::from_millis(100)).is_ok() {}
        let mut buf = [0i16; 8];
        assert!(device.read(&mut buf).is_err(), "device still open");
    }
}
