mod common;

use audio::LoopbackBackend;
use audio_protocol::AudioPacket;
use common::{tts_end, tts_start, StalledSink};
use control_protocol::{InboundMessage, TtsAudioChunk};
use howdy_edge::app::Dispatcher;
use howdy_edge::control::ControlSink;
use howdy_edge::ui::{RecordingUi, UiIntent};
use howdy_edge::{ConversationState, EdgeConfig, EdgeRuntime};
use serial_test::serial;
use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    done()
}

fn loopback_config(server: &UdpSocket) -> EdgeConfig {
    let mut config = EdgeConfig::default();
    config.http.enabled = false;
    config.discovery.enabled = false;
    config.server = Some(server.local_addr().unwrap().to_string());
    config
}

#[test_log::test]
#[serial]
fn test_runtime_streams_after_activation() {
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    server
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();

    let ui = Arc::new(RecordingUi::new());
    let mut runtime = EdgeRuntime::build(loopback_config(&server), ui.clone()).unwrap();
    assert!(runtime.loopback().is_some());
    runtime.start().unwrap();

    let handle = runtime.handle();
    assert_eq!(handle.state(), ConversationState::Waiting);
    assert_eq!(
        runtime.session().current().map(|s| s.audio_addr()),
        Some(server.local_addr().unwrap())
    );

    let stats = Arc::clone(runtime.stats());
    assert!(wait_until(Duration::from_secs(3), || {
        stats.capture().snapshot().frames_captured >= 30
    }));

    handle.intent(UiIntent::Activate);
    assert!(wait_until(Duration::from_secs(2), || {
        handle.state() == ConversationState::Listening
    }));

    let mut buf = [0u8; 2048];
    let mut sequences = Vec::new();
    while sequences.len() < 5 {
        let (len, _) = server.recv_from(&mut buf).expect("audio packets");
        assert_eq!(len, 652);
        sequences.push(AudioPacket::parse(&buf[..len]).unwrap().header.sequence);
    }
    assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1));

    runtime.shutdown(Duration::from_secs(2));

    let states = ui.states();
    assert_eq!(states[0], ConversationState::Waiting);
    assert!(states.contains(&ConversationState::Listening));
}

#[test]
#[serial]
fn test_runtime_refuses_second_start() {
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let ui = Arc::new(RecordingUi::new());
    let mut runtime = EdgeRuntime::build(loopback_config(&server), ui).unwrap();

    runtime.start().unwrap();
    assert!(runtime.start().is_err());
    runtime.shutdown(Duration::from_secs(2));
}

#[test]
fn test_invalid_config_is_refused() {
    let mut config = EdgeConfig::default();
    config.audio.frame_ms = 0;
    let ui = Arc::new(RecordingUi::new());
    assert!(EdgeRuntime::build(config, ui).is_err());
}

#[test]
#[serial]
fn test_speaker_volume_applied_once() {
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut config = loopback_config(&server);
    config.audio.speaker_volume = 0.5;

    let (backend, loopback) = LoopbackBackend::unpaced();
    let ui = Arc::new(RecordingUi::new());
    let mut runtime =
        EdgeRuntime::with_backend(config, Box::new(backend), Some(loopback.clone()), ui).unwrap();
    assert_eq!(runtime.device().volume(), 1.0);
    runtime.start().unwrap();

    let dispatcher = Dispatcher::new(Arc::clone(runtime.tts()), runtime.handle());
    dispatcher.on_message(tts_start("gain", 10));
    for seq in 0..10 {
        dispatcher.on_message(InboundMessage::TtsAudioChunk(TtsAudioChunk::from_samples(
            "gain",
            seq,
            &[10_000i16; 320],
            seq == 9,
        )));
    }
    dispatcher.on_message(tts_end("gain", 10));

    // Buffering and underrun frames reach the speaker as zeros.
    let mut real = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while real.len() < 3200 && Instant::now() < deadline {
        real.extend(loopback.take_speaker(4096).into_iter().filter(|&s| s != 0));
        thread::sleep(Duration::from_millis(5));
    }
    runtime.shutdown(Duration::from_secs(2));

    assert_eq!(real.len(), 3200);
    assert!(real.iter().all(|&s| s == 5_000), "speaker got {:?}", &real[..8]);
}

/// Run a paced loopback runtime into `sink` while Listening and return the
/// capture counters gathered after warm-up.
fn capture_with_sink(sink: Arc<StalledSink>) -> howdy_edge::stats::CaptureStats {
    let mut config = EdgeConfig::default();
    config.http.enabled = false;
    config.discovery.enabled = false;
    let frame_ms = config.audio.frame_ms as u64;

    let (backend, loopback) = LoopbackBackend::paced();
    let mut runtime = EdgeRuntime::with_frame_sink(
        config,
        Box::new(backend),
        Some(loopback),
        Arc::new(RecordingUi::new()),
        sink.clone(),
    )
    .unwrap();
    runtime.start().unwrap();

    let handle = runtime.handle();
    let stats = Arc::clone(runtime.stats());
    assert!(wait_until(Duration::from_secs(3), || {
        stats.capture().snapshot().frames_captured >= 10
    }));
    handle.intent(UiIntent::Activate);
    assert!(wait_until(Duration::from_secs(2), || sink.attempts() > 0));

    // Measure cadence only while the sink is failing.
    stats.capture().max_read_gap_us.store(0, std::sync::atomic::Ordering::Relaxed);
    let before = stats.capture().snapshot().frames_captured;
    thread::sleep(Duration::from_millis(60 * frame_ms));
    let capture = stats.capture().snapshot();
    assert_eq!(handle.state(), ConversationState::Listening);
    runtime.shutdown(Duration::from_secs(2));

    assert!(capture.frames_captured - before >= 40, "{capture:?}");
    assert!(capture.max_read_gap_ms <= 2 * frame_ms, "{capture:?}");
    capture
}

#[test]
#[serial]
fn test_capture_keeps_cadence_while_sends_fail() {
    let sink = Arc::new(StalledSink::new(Duration::ZERO));
    let capture = capture_with_sink(Arc::clone(&sink));

    // The processor keeps up, so nothing is dropped at capture.
    assert_eq!(capture.frames_dropped, 0);
    assert!(sink.attempts() >= 40);
}

#[test]
#[serial]
fn test_capture_drops_frames_behind_a_blocked_sender() {
    // Every send holds the processor for five frame periods.
    let sink = Arc::new(StalledSink::new(Duration::from_millis(100)));
    let capture = capture_with_sink(Arc::clone(&sink));

    assert!(capture.frames_dropped > 0, "{capture:?}");
    assert!(sink.attempts() < 20);
}
