//! Full audio round trip: capture → Opus packets → playback → device.
//!
//! Uses the synthetic devices, so the only codecs in play are the real
//! Opus encoder and decoder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use voxa_core::audio::capture::{CaptureEngine, PacketSink};
use voxa_core::audio::null::{NullAudioInput, NullAudioOutput};
use voxa_core::audio::playback::PlaybackEngine;

#[test]
fn captured_packets_play_back_at_the_playback_rate() {
    let input = Arc::new(NullAudioInput::new());
    let output = Arc::new(NullAudioOutput::new());

    let out_device: Arc<dyn voxa_core::audio::AudioOutput> = output.clone();
    let playback = Arc::new(PlaybackEngine::new(out_device, 20).expect("playback"));
    let forwarded = Arc::new(AtomicUsize::new(0));

    let sink_playback = Arc::clone(&playback);
    let sink_count = Arc::clone(&forwarded);
    let sink: PacketSink = Box::new(move |packet| {
        sink_count.fetch_add(1, Ordering::SeqCst);
        sink_playback.write(packet);
    });

    let in_device: Arc<dyn voxa_core::audio::AudioInput> = input.clone();
    let capture = CaptureEngine::new(in_device, 20, false, sink).expect("capture");

    // Let a handful of 20 ms frames flow, then stop the source.
    std::thread::sleep(Duration::from_millis(300));
    drop(capture);

    let packets = forwarded.load(Ordering::SeqCst);
    assert!(packets >= 5, "expected several packets, got {packets}");

    // Drain marker runs after every forwarded packet has been written.
    let (tx, rx) = mpsc::channel();
    playback.notify_data_end(move || {
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(5)).expect("drain marker");

    // 16 kHz capture frames decode as 20 ms of 24 kHz playback audio.
    assert_eq!(output.samples_written(), packets * 480);
}

#[test]
fn low_power_capture_still_produces_decodable_packets() {
    let input = Arc::new(NullAudioInput::new());
    let (tx, rx) = mpsc::channel();
    let sink: PacketSink = Box::new(move |packet| {
        let _ = tx.send(packet);
    });

    let capture = CaptureEngine::new(input, 60, true, sink).expect("capture");
    let packet = rx.recv_timeout(Duration::from_secs(2)).expect("a packet");
    drop(capture);

    let mut decoder = opus::Decoder::new(16_000, opus::Channels::Mono).unwrap();
    let mut pcm = vec![0i16; 960];
    assert_eq!(decoder.decode(&packet, &mut pcm, false).unwrap(), 960);
}
