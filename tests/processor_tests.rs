mod common;

use common::{tts_chunk, tts_end, tts_start, Rig};
use control_protocol::{InboundMessage, ThresholdUpdate, WakeWordValidation};
use howdy_edge::control::ControlSink;
use howdy_edge::processor::state::RemoteState;
use howdy_edge::processor::ControlEvent;
use howdy_edge::streamer::FrameSink;
use howdy_edge::tts::{FrameSource, PlaybackPhase};
use howdy_edge::ui::{UiEvent, UiIntent};
use howdy_edge::{ConversationState, EdgeConfig};
use std::time::Duration;
use wakeword::test_utils::hey_howdy_clip;
use wakeword::WakeWordState;

fn assert_legal_path(states: &[ConversationState]) {
    for pair in states.windows(2) {
        assert!(
            pair[0].can_transition(pair[1]),
            "illegal edge {} -> {} in {:?}",
            pair[0],
            pair[1],
            states
        );
    }
}

#[test]
fn test_cold_boot_is_waiting() {
    let rig = Rig::new(EdgeConfig::default());

    assert_eq!(rig.handle.state(), ConversationState::Waiting);
    assert!(!rig.sink.is_streaming());
    assert_eq!(rig.worker.playback().depth(), 0);
    assert_eq!(rig.ui.states(), vec![ConversationState::Waiting]);
}

#[test_log::test]
fn test_wake_word_happy_path() {
    let mut rig = Rig::new(EdgeConfig::default());

    let state = rig.feed(&hey_howdy_clip(50, 30));

    let detections = rig.outbound.detections();
    assert_eq!(detections.len(), 1, "{detections:?}");
    let detection = &detections[0];
    assert!(detection.confidence >= 0.65);
    assert_eq!(detection.device_id, "howdy-edge-01");
    assert_eq!(state, ConversationState::Listening);
    assert_eq!(rig.sink.starts(), 1);
    assert!(rig
        .ui
        .events()
        .iter()
        .any(|e| matches!(e, UiEvent::WakeWord(_, phrase) if phrase == "hey howdy")));

    let before = rig.processor.detector().adaptive_threshold();
    rig.dispatcher
        .on_message(InboundMessage::WakeWordValidation(WakeWordValidation {
            detection_id: detection.detection_id,
            validated: true,
            confidence: Some(0.93),
            processing_time_ms: Some(120),
        }));
    rig.processor.drain_events();

    let detector = rig.processor.detector();
    assert_eq!(detector.state(), WakeWordState::Confirmed);
    let after = detector.adaptive_threshold();
    assert!(after < before);
    assert!((before - after) / before <= 0.02);
    assert_eq!(detector.stats().true_positives, 1);
}

#[test]
fn test_partial_frame_is_refused() {
    let mut rig = Rig::new(EdgeConfig::default());
    rig.handle.intent(UiIntent::Activate);
    rig.silence(1);

    assert!(rig.processor.process(&[0i16; 100]).is_err());
    assert!(rig.processor.process(&[0i16; 321]).is_err());

    assert_eq!(rig.processor.stats().frames_rejected, 2);
    assert_eq!(rig.processor.stats().frames_processed, 1);
    assert!(rig.sink.frames().iter().all(|f| f.len() == 320));
}

#[test]
fn test_unanswered_detection_is_counted_once() {
    let mut rig = Rig::new(EdgeConfig::default());
    rig.feed(&hey_howdy_clip(50, 30));
    assert_eq!(rig.outbound.detections().len(), 1);

    // No verdict within 3 s (150 frames).
    rig.silence(160);
    assert_eq!(rig.processor.stats().detections_expired, 1);
    assert_eq!(rig.processor.detector().stats().timed_out, 1);
    rig.silence(10);
    assert_eq!(rig.processor.stats().detections_expired, 1);
}

#[test]
fn test_listen_timeout_returns_to_waiting() {
    let mut rig = Rig::new(EdgeConfig::default());
    rig.handle.intent(UiIntent::Activate);
    assert_eq!(rig.silence(1), ConversationState::Listening);

    // 8 s of silence is 400 frames; the timer fires after it is exceeded.
    assert_eq!(rig.silence(399), ConversationState::Listening);
    assert_eq!(rig.silence(2), ConversationState::Waiting);
    assert!(!rig.sink.is_streaming());
    assert_eq!(rig.sink.stops(), 1);
}

#[test]
fn test_recording_ends_on_sustained_silence() {
    let mut rig = Rig::new(EdgeConfig::default());
    rig.enter_recording();
    assert!(rig.sink.is_streaming());

    // Speech end needs 15 silent frames, the end-of-utterance gate 800 ms.
    assert_eq!(rig.silence(40), ConversationState::Recording);
    assert_eq!(rig.silence(2), ConversationState::Processing);
    assert!(!rig.sink.is_streaming());

    // No answer from the server: give up after the processing timeout.
    assert_eq!(rig.silence(749), ConversationState::Processing);
    assert_eq!(rig.silence(1), ConversationState::Ending);
    assert_eq!(rig.silence(1), ConversationState::Waiting);
    assert_legal_path(&rig.ui.states());
}

#[test]
fn test_recording_cap_wins() {
    let mut config = EdgeConfig::default();
    config.processor.max_recording_ms = 1000;
    let mut rig = Rig::new(config);
    rig.enter_recording();

    assert_eq!(rig.voice(50), ConversationState::Recording);
    assert_eq!(rig.voice(1), ConversationState::Processing);
    assert_eq!(rig.processor.stats().recording_timeouts, 1);
}

#[test_log::test]
fn test_tts_round_trip() {
    let mut rig = Rig::new(EdgeConfig::default());
    rig.enter_recording();
    rig.silence(45);
    assert_eq!(rig.processor.state(), ConversationState::Processing);

    rig.server(tts_start("s1", 3));
    for seq in 0..3 {
        rig.server(tts_chunk("s1", seq, seq == 2));
    }
    assert_eq!(rig.silence(1), ConversationState::Speaking);

    let playback = rig.worker.playback().clone();
    assert!(playback.depth() >= 2);

    let mut frame = vec![0i16; 320];
    let mut real = 0;
    loop {
        match playback.next_frame(&mut frame) {
            FrameSource::Real => real += frame.len(),
            FrameSource::Underrun => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(real, 3 * 320);
    assert_eq!(rig.silence(1), ConversationState::Speaking);

    rig.server(tts_end("s1", 3));
    assert_eq!(playback.next_frame(&mut frame), FrameSource::Idle);
    assert_eq!(playback.phase(), PlaybackPhase::Finished);

    assert_eq!(rig.silence(1), ConversationState::Ending);
    assert_eq!(rig.silence(1), ConversationState::Waiting);

    let states = rig.ui.states();
    let tail: Vec<_> = states.iter().rev().take(4).rev().copied().collect();
    assert_eq!(
        tail,
        vec![
            ConversationState::Processing,
            ConversationState::Speaking,
            ConversationState::Ending,
            ConversationState::Waiting
        ]
    );
    assert_legal_path(&states);
    assert_eq!(playback.stats().sessions_completed, 1);
}

#[test]
fn test_tts_start_reaches_speaking_from_every_state() {
    type Setup = fn(&mut Rig);
    let setups: [(ConversationState, Setup); 6] = [
        (ConversationState::Waiting, |_| {}),
        (ConversationState::Listening, |rig| {
            rig.handle.intent(UiIntent::Activate);
            rig.silence(1);
        }),
        (ConversationState::Recording, |rig| rig.enter_recording()),
        (ConversationState::Processing, |rig| {
            rig.enter_recording();
            rig.silence(45);
        }),
        (ConversationState::Ending, |rig| {
            rig.enter_recording();
            rig.silence(45);
            rig.handle.intent(UiIntent::Cancel);
            rig.silence(1);
        }),
        (ConversationState::Speaking, |rig| {
            rig.server(tts_start("earlier", 5));
            rig.silence(1);
        }),
    ];

    for (expected, setup) in setups {
        let mut rig = Rig::new(EdgeConfig::default());
        setup(&mut rig);
        assert_eq!(rig.processor.state(), expected);

        rig.server(tts_start("answer", 2));
        assert_eq!(rig.silence(1), ConversationState::Speaking, "from {expected}");
        assert_legal_path(&rig.ui.states());
        assert_eq!(rig.processor.stats().illegal_transitions, 0);
    }
}

#[test]
fn test_tts_start_beats_wake_word_in_same_frame() {
    let clip = hey_howdy_clip(50, 30);

    let mut probe = Rig::new(EdgeConfig::default());
    let trigger = clip
        .iter()
        .position(|frame| {
            probe.processor.process(frame).unwrap();
            !probe.outbound.detections().is_empty()
        })
        .expect("clip triggers");

    let mut rig = Rig::new(EdgeConfig::default());
    rig.feed(&clip[..trigger]);
    assert_eq!(rig.processor.state(), ConversationState::Waiting);

    rig.server(tts_start("now", 1));
    let state = rig.processor.process(&clip[trigger]).unwrap();

    assert_eq!(state, ConversationState::Speaking);
    assert_eq!(rig.outbound.detections().len(), 1);
    assert!(!rig.ui.states().contains(&ConversationState::Listening));
    assert_eq!(rig.sink.starts(), 0);
}

#[test]
fn test_server_loss_cancels_playback() {
    let mut rig = Rig::new(EdgeConfig::default());
    rig.server(tts_start("s1", 4));
    rig.server(tts_chunk("s1", 0, false));
    assert_eq!(rig.silence(1), ConversationState::Speaking);

    rig.dispatcher.on_disconnected(Some(Duration::from_millis(1500)));
    assert_eq!(rig.silence(1), ConversationState::Ending);
    assert_eq!(rig.silence(1), ConversationState::Waiting);

    assert_eq!(
        rig.ui.errors(),
        vec![("control".to_string(), "disconnected".to_string(), 2)]
    );
    let stats = rig.worker.playback().stats();
    assert_eq!(stats.sessions_cancelled, 1);
    assert_eq!(rig.worker.playback().depth(), 0);

    // Frames keep flowing through the processor.
    rig.silence(10);
    assert_eq!(rig.processor.stats().frames_processed, 13);
}

#[test]
fn test_ui_cancel_and_volume() {
    let mut rig = Rig::new(EdgeConfig::default());
    rig.server(tts_start("s1", 4));
    rig.silence(1);

    rig.handle.intent(UiIntent::VolumeDown);
    rig.handle.intent(UiIntent::MuteToggle);
    rig.handle.intent(UiIntent::Cancel);
    assert_eq!(rig.silence(1), ConversationState::Ending);

    let snapshot = rig.worker.playback().snapshot();
    assert!(snapshot.muted);
    assert!((snapshot.master_volume - 0.9).abs() < 1e-6);
    assert_eq!(rig.worker.playback().stats().sessions_cancelled, 1);
}

#[test]
fn test_remote_state_pushes() {
    let mut rig = Rig::new(EdgeConfig::default());

    rig.handle.remote_state(RemoteState::Listening, None);
    assert_eq!(rig.silence(1), ConversationState::Listening);

    rig.handle.remote_state(RemoteState::Thinking, None);
    assert_eq!(rig.silence(1), ConversationState::Processing);

    rig.handle
        .remote_state(RemoteState::Speaking, Some("Howdy".to_string()));
    assert_eq!(rig.silence(1), ConversationState::Processing);

    rig.handle.remote_state(RemoteState::Waiting, None);
    assert_eq!(rig.silence(1), ConversationState::Ending);
    assert_eq!(rig.silence(1), ConversationState::Waiting);

    assert_legal_path(&rig.ui.states());
}

#[test]
fn test_threshold_update_from_server() {
    let mut rig = Rig::new(EdgeConfig::default());

    rig.dispatcher
        .on_message(InboundMessage::ThresholdUpdate(ThresholdUpdate {
            energy_threshold: Some(2800),
            confidence_threshold: Some(0.7),
            reason: Some("noisy room".to_string()),
        }));
    rig.processor.drain_events();
    assert_eq!(rig.processor.detector().base_threshold(), 2800.0);

    // Out of range: nothing changes.
    rig.handle
        .control(ControlEvent::ThresholdUpdate(ThresholdUpdate {
            energy_threshold: Some(0),
            confidence_threshold: None,
            reason: None,
        }));
    rig.processor.drain_events();
    assert_eq!(rig.processor.detector().base_threshold(), 2800.0);
}

#[test]
fn test_silence_suppression_spacing() {
    let mut config = EdgeConfig::default();
    config.udp.silence_suppression = true;
    config.udp.silence_packet_interval_ms = 1000;
    let mut rig = Rig::new(config);

    rig.handle.intent(UiIntent::Activate);
    rig.silence(150);
    // One frame per second of silence: t = 0, 1000, 2000 ms.
    assert_eq!(rig.sink.frame_count(), 3);
    assert_eq!(rig.processor.stats().frames_suppressed, 147);

    // Speech goes out on its first frame.
    rig.voice(1);
    assert_eq!(rig.sink.frame_count(), 4);
}
