//! Local wake-word detection.
//!
//! The `WakeModel` trait is the keyword-spotting seam: swap in
//! `EnergyWakeModel` (default heuristic), a neural spotter, or a scripted
//! model in tests without touching the detector. The detector itself runs
//! two cooperative tasks against the shared input device:
//!
//! - a **feeder** that reads fixed-size chunks and pushes them into the
//!   model, paced by the device clock;
//! - a **fetcher** that polls the model and invokes the engine's wake
//!   callback at most once per detection.
//!
//! The detector and the capture engine never hold the input device at the
//! same time; the conversation engine sequences `stop()` before capture
//! starts and vice versa.

pub mod energy;

pub use energy::EnergyWakeModel;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::audio::resample::RateConverter;
use crate::audio::AudioInput;
use crate::error::Result;
use crate::taskq::{TaskQueue, TaskQueueHandle};

/// Rate the model consumes PCM at.
pub const WAKE_SAMPLE_RATE: u32 = 16_000;

/// Poll cadence of the fetcher task.
const FETCH_INTERVAL: Duration = Duration::from_millis(20);

/// A keyword-spotting model.
///
/// Implementations may be stateful (ring buffers, RNN hidden states).
/// `poll` must report each detection exactly once — the detector turns
/// every `true` into one wake callback.
pub trait WakeModel: Send + 'static {
    /// Feeder read size in samples at 16 kHz.
    fn chunk_samples(&self) -> usize;

    /// Push one chunk of 16 kHz mono PCM into the model.
    fn feed(&mut self, pcm: &[i16]);

    /// True exactly once per completed detection since the last call.
    fn poll(&mut self) -> bool;

    /// Clear internal state (between detector activations).
    fn reset(&mut self);

    /// The phrase this model spots, reported to the backend as the wake
    /// hint after a wake-triggered connect.
    fn phrase(&self) -> &str;
}

struct Active {
    running: Arc<AtomicBool>,
    // Order matters on drop: queues join before the device closes.
    _feed: TaskQueue,
    _fetch: TaskQueue,
    device: Arc<dyn AudioInput>,
}

/// Runs a `WakeModel` against the input device and fires a callback on
/// detection.
pub struct WakeWordDetector {
    model: Arc<Mutex<Box<dyn WakeModel>>>,
    handler: Arc<dyn Fn() + Send + Sync>,
    active: Option<Active>,
}

impl WakeWordDetector {
    pub fn new(model: Box<dyn WakeModel>, handler: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            handler: Arc::new(handler),
            active: None,
        }
    }

    /// The wake phrase of the underlying model.
    pub fn phrase(&self) -> String {
        self.model.lock().phrase().to_string()
    }

    /// Whether the detector currently holds the input device.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Open the device at 16 kHz and start the feeder and fetcher.
    /// Idempotent: a second `start` while active is a no-op.
    pub fn start(&mut self, device: Arc<dyn AudioInput>) -> Result<()> {
        if self.active.is_some() {
            debug!("wake detector already started");
            return Ok(());
        }

        device.open(WAKE_SAMPLE_RATE)?;
        let device_rate = device.sample_rate();

        let chunk = self.model.lock().chunk_samples();
        let device_chunk = (chunk as u64 * u64::from(device_rate)
            / u64::from(WAKE_SAMPLE_RATE)) as usize;

        let resampler = if device_rate != WAKE_SAMPLE_RATE {
            Some(RateConverter::new(device_rate, WAKE_SAMPLE_RATE, device_chunk)?)
        } else {
            None
        };

        let running = Arc::new(AtomicBool::new(true));
        let feed = TaskQueue::new("wake-feed");
        let fetch = TaskQueue::new("wake-fetch");

        let feed_ctx = FeedCtx {
            device: Arc::clone(&device),
            model: Arc::clone(&self.model),
            resampler,
            running: Arc::clone(&running),
            read_buf: vec![0i16; device_chunk],
        };
        pump_feed(feed.handle(), feed_ctx);

        let fetch_ctx = FetchCtx {
            model: Arc::clone(&self.model),
            handler: Arc::clone(&self.handler),
            running: Arc::clone(&running),
        };
        pump_fetch(fetch.handle(), fetch_ctx);

        info!(device_rate, chunk, "wake detector started");

        self.active = Some(Active {
            running,
            _feed: feed,
            _fetch: fetch,
            device,
        });
        Ok(())
    }

    /// Halt both tasks, close the device, and reset the model.
    /// Idempotent: a `stop` while inactive is a no-op.
    pub fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.running.store(false, Ordering::SeqCst);
        drop(active._feed);
        drop(active._fetch);
        active.device.close();
        self.model.lock().reset();
        info!("wake detector stopped");
    }
}

impl Drop for WakeWordDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FeedCtx {
    device: Arc<dyn AudioInput>,
    model: Arc<Mutex<Box<dyn WakeModel>>>,
    resampler: Option<RateConverter>,
    running: Arc<AtomicBool>,
    read_buf: Vec<i16>,
}

fn pump_feed(handle: TaskQueueHandle, mut ctx: FeedCtx) {
    let next = handle.clone();
    handle.enqueue(move || {
        if !ctx.running.load(Ordering::Relaxed) {
            return;
        }

        let n = ctx
            .device
            .read(&mut ctx.read_buf)
            .unwrap_or_else(|e| panic!("audio input device failure: {e}"));
        if n > 0 {
            match ctx.resampler {
                Some(ref mut resampler) => {
                    let pcm = resampler.process(&ctx.read_buf[..n]);
                    if !pcm.is_empty() {
                        ctx.model.lock().feed(&pcm);
                    }
                }
                None => ctx.model.lock().feed(&ctx.read_buf[..n]),
            }
        }

        pump_feed(next, ctx);
    });
}

struct FetchCtx {
    model: Arc<Mutex<Box<dyn WakeModel>>>,
    handler: Arc<dyn Fn() + Send + Sync>,
    running: Arc<AtomicBool>,
}

fn pump_fetch(handle: TaskQueueHandle, ctx: FetchCtx) {
    let next = handle.clone();
    handle.enqueue_at(Instant::now() + FETCH_INTERVAL, move || {
        if !ctx.running.load(Ordering::Relaxed) {
            return;
        }

        if ctx.model.lock().poll() {
            info!("wake word detected");
            (ctx.handler)();
        }

        pump_fetch(next, ctx);
    });
}
