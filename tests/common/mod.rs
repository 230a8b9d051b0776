#![allow(dead_code)]

use control_protocol::{
    InboundMessage, OutboundMessage, TtsAudioChunk, TtsAudioEnd, TtsAudioStart, TtsPlaybackActions,
    TtsPlaybackConfig, TtsSessionInfo, TtsSessionSummary, WakeWordDetection,
};
use howdy_edge::app::Dispatcher;
use howdy_edge::control::{ControlSink, OutboundSink};
use howdy_edge::error::{EdgeError, Result};
use howdy_edge::processor::{AudioProcessor, ProcessorDeps, ProcessorHandle};
use howdy_edge::streamer::FrameSink;
use howdy_edge::tts::{TtsPlayback, TtsWorker};
use howdy_edge::ui::RecordingUi;
use howdy_edge::{ConversationState, EdgeConfig};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wakeword::test_utils::{sine_frame, silence_frame};

/// Keeps everything posted for the server.
#[derive(Default)]
pub struct RecordingOutbound {
    messages: Mutex<Vec<OutboundMessage>>,
}

impl RecordingOutbound {
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn detections(&self) -> Vec<WakeWordDetection> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                OutboundMessage::WakeWordDetection(d) => Some(d),
                _ => None,
            })
            .collect()
    }
}

impl OutboundSink for RecordingOutbound {
    fn send(&self, message: OutboundMessage) -> bool {
        self.messages.lock().unwrap().push(message);
        true
    }
}

/// Frame sink that keeps what it is sent while streaming.
#[derive(Default)]
pub struct RecordingSink {
    streaming: AtomicBool,
    starts: AtomicU32,
    stops: AtomicU32,
    frames: Mutex<Vec<Vec<i16>>>,
}

impl RecordingSink {
    pub fn frames(&self) -> Vec<Vec<i16>> {
        self.frames.lock().unwrap().clone()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

impl FrameSink for RecordingSink {
    fn start_stream(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.streaming.store(true, Ordering::SeqCst);
    }

    fn stop_stream(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.streaming.store(false, Ordering::SeqCst);
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn send_frame(&self, samples: &[i16]) -> Result<()> {
        if !self.is_streaming() {
            return Err(EdgeError::InvalidState("not streaming".into()));
        }
        self.frames.lock().unwrap().push(samples.to_vec());
        Ok(())
    }
}

/// Frame sink whose sends always end in `Busy`, optionally after blocking
/// the caller for `delay`.
pub struct StalledSink {
    delay: Duration,
    streaming: AtomicBool,
    attempts: AtomicU32,
}

impl StalledSink {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            streaming: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl FrameSink for StalledSink {
    fn start_stream(&self) {
        self.streaming.store(true, Ordering::SeqCst);
    }

    fn stop_stream(&self) {
        self.streaming.store(false, Ordering::SeqCst);
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn send_frame(&self, _samples: &[i16]) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Err(EdgeError::Busy("stalled sink"))
    }
}

/// A processor with recording collaborators and a dispatcher in front of
/// its TTS worker. Nothing runs on background threads.
pub struct Rig {
    pub processor: AudioProcessor,
    pub handle: ProcessorHandle,
    pub ui: Arc<RecordingUi>,
    pub outbound: Arc<RecordingOutbound>,
    pub sink: Arc<RecordingSink>,
    pub worker: Arc<TtsWorker>,
    pub dispatcher: Dispatcher,
}

impl Rig {
    pub fn new(config: EdgeConfig) -> Self {
        Self::with_sink(config, Arc::new(RecordingSink::default()))
    }

    pub fn with_sink(config: EdgeConfig, sink: Arc<RecordingSink>) -> Self {
        let (rig, _) = Self::build(config, sink.clone(), sink);
        rig
    }

    /// Build around an arbitrary frame sink; `sink` is still returned for
    /// convenience when it is the same object.
    pub fn build(
        config: EdgeConfig,
        frame_sink: Arc<dyn FrameSink>,
        sink: Arc<RecordingSink>,
    ) -> (Self, Arc<TtsPlayback>) {
        let ui = Arc::new(RecordingUi::new());
        let outbound = Arc::new(RecordingOutbound::default());
        let playback = Arc::new(
            TtsPlayback::new(
                config.frame_samples(),
                config.audio.sample_rate,
                config.jitter.clone(),
                1.0,
                config.vad.echo_suppression_db,
            )
            .unwrap(),
        );
        let worker = TtsWorker::new(
            Arc::clone(&playback),
            outbound.clone(),
            config.device.device_id.clone(),
            config.tts.queue_capacity,
            Duration::from_millis(config.tts.status_interval_ms),
        );
        let (processor, handle) = AudioProcessor::new(
            &config,
            ProcessorDeps {
                sink: frame_sink,
                outbound: outbound.clone(),
                ui: ui.clone(),
                tts: Arc::clone(&worker),
                stats: None,
            },
        )
        .unwrap();
        let dispatcher = Dispatcher::new(Arc::clone(&worker), handle.clone());
        (
            Self {
                processor,
                handle,
                ui,
                outbound,
                sink,
                worker,
                dispatcher,
            },
            playback,
        )
    }

    pub fn feed(&mut self, frames: &[Vec<i16>]) -> ConversationState {
        let mut state = self.processor.state();
        for frame in frames {
            state = self.processor.process(frame).unwrap();
        }
        state
    }

    pub fn silence(&mut self, frames: usize) -> ConversationState {
        let frames: Vec<_> = (0..frames).map(|_| silence_frame()).collect();
        self.feed(&frames)
    }

    pub fn voice(&mut self, frames: usize) -> ConversationState {
        let frames: Vec<_> = (0..frames).map(|_| sine_frame(4000.0, 400.0)).collect();
        self.feed(&frames)
    }

    pub fn server(&self, message: InboundMessage) {
        self.dispatcher.on_message(message);
        self.worker.drain();
    }

    /// Activate, then speak until Recording.
    pub fn enter_recording(&mut self) {
        self.silence(20);
        self.handle.intent(howdy_edge::ui::UiIntent::Activate);
        self.silence(1);
        assert_eq!(self.processor.state(), ConversationState::Listening);
        assert_eq!(self.voice(10), ConversationState::Recording);
    }
}

pub fn tts_start(session_id: &str, chunks: u32) -> InboundMessage {
    InboundMessage::TtsAudioStart(TtsAudioStart {
        session_info: TtsSessionInfo {
            session_id: session_id.to_string(),
            response_text: Some("Howdy partner".to_string()),
            estimated_duration_ms: Some(chunks * 20),
            total_chunks_expected: chunks,
        },
        audio_format: Default::default(),
        playback_config: TtsPlaybackConfig::default(),
    })
}

pub fn tts_chunk(session_id: &str, sequence: u32, is_final: bool) -> InboundMessage {
    let samples: Vec<i16> = (0..320).map(|i| ((i % 64) as i16 - 32) * 200).collect();
    InboundMessage::TtsAudioChunk(TtsAudioChunk::from_samples(
        session_id, sequence, &samples, is_final,
    ))
}

pub fn tts_end(session_id: &str, chunks: u32) -> InboundMessage {
    InboundMessage::TtsAudioEnd(TtsAudioEnd {
        session_summary: TtsSessionSummary {
            session_id: session_id.to_string(),
            total_chunks_sent: chunks,
            total_audio_bytes: chunks as u64 * 640,
            actual_duration_ms: chunks * 20,
            transmission_time_ms: 5,
        },
        playback_actions: TtsPlaybackActions::default(),
    })
}
