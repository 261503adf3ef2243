//! Playback engine: packet FIFO → Opus decode → resample → device.
//!
//! Construction opens the output device at 24 kHz and creates a mono
//! decoder; packets queue onto a dedicated task queue and are decoded and
//! written strictly in arrival order. `notify_data_end` enqueues a marker
//! behind everything already queued — when it runs, every prior packet has
//! been written to the device. That marker is how the conversation engine
//! learns that server speech has fully drained.
//!
//! Decode failures are logged and the packet dropped. A hard device write
//! error aborts (lost audio hardware has no local recovery).

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::resample::RateConverter;
use super::AudioOutput;
use crate::error::{Result, VoxaError};
use crate::taskq::TaskQueue;

/// Canonical playback rate the backend sends at.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// FIFO decoder/writer for server speech.
pub struct PlaybackEngine {
    queue: Option<TaskQueue>,
    ctx: Arc<Mutex<DecodeCtx>>,
    device: Arc<dyn AudioOutput>,
}

struct DecodeCtx {
    decoder: opus::Decoder,
    resampler: Option<RateConverter>,
    device: Arc<dyn AudioOutput>,
    /// Samples per decoded frame at 24 kHz.
    frame_samples: usize,
    pcm_buf: Vec<i16>,
}

impl PlaybackEngine {
    /// Open the device and start the consumer.
    pub fn new(device: Arc<dyn AudioOutput>, frame_duration_ms: u32) -> Result<Self> {
        device.open(PLAYBACK_SAMPLE_RATE)?;
        let device_rate = device.sample_rate();

        let decoder = opus::Decoder::new(PLAYBACK_SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| VoxaError::Codec(format!("decoder create: {e}")))?;

        let frame_samples = (PLAYBACK_SAMPLE_RATE / 1000 * frame_duration_ms) as usize;

        let resampler = if device_rate != PLAYBACK_SAMPLE_RATE {
            debug!(device_rate, "playback resampling from {PLAYBACK_SAMPLE_RATE} Hz");
            Some(RateConverter::new(
                PLAYBACK_SAMPLE_RATE,
                device_rate,
                frame_samples,
            )?)
        } else {
            None
        };

        let ctx = Arc::new(Mutex::new(DecodeCtx {
            decoder,
            resampler,
            device: Arc::clone(&device),
            frame_samples,
            pcm_buf: vec![0i16; frame_samples],
        }));

        info!(device_rate, frame_duration_ms, "playback started");

        Ok(Self {
            queue: Some(TaskQueue::new("playback")),
            ctx,
            device,
        })
    }

    /// Enqueue one Opus packet for decode and playback.
    pub fn write(&self, packet: Vec<u8>) {
        let ctx = Arc::clone(&self.ctx);
        if let Some(queue) = &self.queue {
            queue.enqueue(move || ctx.lock().process(packet));
        }
    }

    /// Enqueue a drain marker: `callback` runs once every packet written
    /// before this call has been decoded and pushed to the device.
    pub fn notify_data_end(&self, callback: impl FnOnce() + Send + 'static) {
        if let Some(queue) = &self.queue {
            queue.enqueue(callback);
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        // Queue drop drains the remaining packets, then joins.
        self.queue.take();
        self.device.close();
        info!("playback stopped");
    }
}

impl DecodeCtx {
    fn process(&mut self, packet: Vec<u8>) {
        let decoded = match self
            .decoder
            .decode(&packet, &mut self.pcm_buf[..self.frame_samples], false)
        {
            Ok(n) => n,
            Err(e) => {
                warn!("opus decode failed, packet dropped: {e}");
                return;
            }
        };
        if decoded == 0 {
            return;
        }

        let written = match self.resampler {
            Some(ref mut resampler) => {
                let out = resampler.process(&self.pcm_buf[..decoded]);
                if out.is_empty() {
                    return;
                }
                self.device.write(&out)
            }
            None => self.device.write(&self.pcm_buf[..decoded]),
        };

        if let Err(e) = written {
            panic!("audio output device failure: {e}");
        }
    }
}
