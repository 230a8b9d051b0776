//! Continuous audio processor.
//!
//! Every captured frame passes through [`AudioProcessor::process`] exactly
//! once, on one thread, in capture order:
//!
//! ```text
//!   frame ──▶ drain events ──▶ VAD ──▶ wake word ──▶ state machine ──▶ stream?
//!                 ▲                                        │
//!   control / UI / HTTP events                      UI level updates
//! ```
//!
//! All timers run on stream time (frames × frame_ms), so the state machine is
//! deterministic for a given frame sequence and event order. The processor is
//! the only writer of the conversation state; other threads read the
//! published copy through [`ProcessorHandle::state`].
//!
//! Events queued since the previous frame are applied before the frame is
//! analysed, which gives a server `tts_audio_start` precedence over a wake
//! word heard in the same frame.

pub mod annotate;
pub mod silence;
pub mod state;

use crate::config::EdgeConfig;
use crate::control::OutboundSink;
use crate::error::{EdgeError, ErrorKind, Result};
use crate::stats::{FrameSideStats, StatsHub};
use crate::streamer::FrameSink;
use crate::tts::{PlaybackPhase, TtsWorker};
use crate::ui::{level_from_rms, UiIntent, UiSurface};
use control_protocol::{unix_millis, OutboundMessage, ThresholdUpdate, WakeWordDetection, WakeWordValidation};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, info, trace, warn};
use serde::Serialize;
use silence::SilenceGate;
use state::{ConversationState, RemoteState, StateCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wakeword::{ConversationContext, EnhancedVad, VadResult, WakeWordDetector, WakeWordResult, WakeWordState};

const EVENT_QUEUE: usize = 128;
const WAKE_PHRASE: &str = "hey howdy";

/// What the control dispatcher tells the processor.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// A TTS session was opened on the playback side.
    TtsStarted {
        session_id: String,
        interrupt_recording: bool,
    },
    Validation(WakeWordValidation),
    ThresholdUpdate(ThresholdUpdate),
    Connected,
    Disconnected { retry_in: Option<Duration> },
}

#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    Control(ControlEvent),
    Ui(UiIntent),
    /// State pushed by the server over HTTP.
    RemoteState {
        state: RemoteState,
        text: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessorStats {
    pub frames_processed: u64,
    pub frames_rejected: u64,
    pub frames_streamed: u64,
    pub frames_suppressed: u64,
    pub stream_errors: u64,
    pub stream_busy: u64,
    pub detections_sent: u64,
    pub detections_unsent: u64,
    /// Detections the server never answered in time
    pub detections_expired: u64,
    pub transitions: u64,
    pub illegal_transitions: u64,
    pub recording_timeouts: u64,
    pub events_handled: u64,
    pub events_dropped: u64,
    pub average_process_us: u32,
    pub max_process_us: u32,
}

/// Cheap clonable access to a running processor.
#[derive(Clone)]
pub struct ProcessorHandle {
    events: Sender<ProcessorEvent>,
    state: Arc<StateCell>,
}

impl ProcessorHandle {
    pub fn state(&self) -> ConversationState {
        self.state.get()
    }

    /// Queue an event for the next frame boundary.
    pub fn post(&self, event: ProcessorEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!("⚠️ Processor event queue full, dropped {:?}", event);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn control(&self, event: ControlEvent) -> bool {
        self.post(ProcessorEvent::Control(event))
    }

    pub fn intent(&self, intent: UiIntent) -> bool {
        self.post(ProcessorEvent::Ui(intent))
    }

    pub fn remote_state(&self, state: RemoteState, text: Option<String>) -> bool {
        self.post(ProcessorEvent::RemoteState { state, text })
    }
}

/// Collaborators the processor drives.
pub struct ProcessorDeps {
    pub sink: Arc<dyn FrameSink>,
    pub outbound: Arc<dyn OutboundSink>,
    pub ui: Arc<dyn UiSurface>,
    pub tts: Arc<TtsWorker>,
    pub stats: Option<Arc<StatsHub>>,
}

pub struct AudioProcessor {
    device_id: String,
    frame_samples: usize,
    frame_ms: u64,
    listen_timeout_ms: u64,
    max_recording_ms: u64,
    end_silence_ms: u64,
    processing_timeout_ms: u64,
    refresh_frames: u64,

    vad: EnhancedVad,
    detector: WakeWordDetector,
    gate: SilenceGate,

    state: ConversationState,
    shared_state: Arc<StateCell>,
    stream_ms: u64,
    entered_at_ms: u64,
    speech_seen: bool,
    speech_ended: bool,
    silence_run_ms: u64,
    tts_started_this_frame: bool,

    deps: ProcessorDeps,
    events: Receiver<ProcessorEvent>,
    stats: ProcessorStats,
    process_us_total: u64,
}

impl AudioProcessor {
    pub fn new(config: &EdgeConfig, deps: ProcessorDeps) -> Result<(Self, ProcessorHandle)> {
        let vad = EnhancedVad::new(config.vad.clone())?;
        let detector = WakeWordDetector::new(config.wake_word.clone())?;
        let (tx, rx) = bounded(EVENT_QUEUE);
        let shared_state = Arc::new(StateCell::new(ConversationState::Waiting));
        let frame_ms = config.audio.frame_ms.max(1) as u64;

        let processor = Self {
            device_id: config.device.device_id.clone(),
            frame_samples: config.frame_samples(),
            frame_ms,
            listen_timeout_ms: config.processor.listen_timeout_ms,
            max_recording_ms: config.processor.max_recording_ms,
            end_silence_ms: config.processor.end_silence_ms,
            processing_timeout_ms: config.processor.processing_timeout_ms,
            refresh_frames: (config.stats.refresh_interval_ms / frame_ms).max(1),
            vad,
            detector,
            gate: SilenceGate::new(
                config.udp.silence_suppression,
                config.udp.silence_packet_interval_ms,
            ),
            state: ConversationState::Waiting,
            shared_state: Arc::clone(&shared_state),
            stream_ms: 0,
            entered_at_ms: 0,
            speech_seen: false,
            speech_ended: false,
            silence_run_ms: 0,
            tts_started_this_frame: false,
            deps,
            events: rx,
            stats: ProcessorStats::default(),
            process_us_total: 0,
        };
        processor.deps.ui.set_state(ConversationState::Waiting);
        info!("🎛️ Audio processor ready ({} samples per frame)", processor.frame_samples);

        Ok((
            processor,
            ProcessorHandle {
                events: tx,
                state: shared_state,
            },
        ))
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn stream_time_ms(&self) -> u64 {
        self.stream_ms
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    pub fn detector(&self) -> &WakeWordDetector {
        &self.detector
    }

    pub fn vad(&self) -> &EnhancedVad {
        &self.vad
    }

    /// Handle one captured frame. Frames of the wrong size are refused whole.
    pub fn process(&mut self, frame: &[i16]) -> Result<ConversationState> {
        if frame.len() != self.frame_samples {
            self.stats.frames_rejected += 1;
            return Err(EdgeError::InvalidArgument(format!(
                "frame of {} samples, expected {}",
                frame.len(),
                self.frame_samples
            )));
        }

        let started = Instant::now();
        self.stream_ms += self.frame_ms;
        self.tts_started_this_frame = false;
        self.drain_events();

        let vad = self.vad.process(frame);
        let wake = self.detector.process(frame, &vad);
        self.handle_wake_word(&wake, &vad);
        self.advance(&vad);
        self.stream(frame, &vad, &wake);
        self.update_ui(&vad);

        self.stats.frames_processed += 1;
        let elapsed_us = started.elapsed().as_micros() as u64;
        self.process_us_total += elapsed_us;
        self.stats.max_process_us = self.stats.max_process_us.max(elapsed_us as u32);
        self.stats.average_process_us =
            (self.process_us_total / self.stats.frames_processed) as u32;

        if self.stats.frames_processed % self.refresh_frames == 0 {
            self.publish_stats();
        }
        Ok(self.state)
    }

    /// Apply queued events without a frame, e.g. while capture is stalled.
    pub fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.stats.events_handled += 1;
            self.handle_event(event);
        }
    }

    /// Consume frames until `stop`, handing every buffer back for reuse.
    pub fn run(mut self, frames: Receiver<Vec<i16>>, recycle: Sender<Vec<i16>>, stop: Arc<AtomicBool>) {
        info!("🎛️ Audio processor running");
        while !stop.load(Ordering::Acquire) {
            match frames.recv_timeout(Duration::from_millis(100)) {
                Ok(frame) => {
                    if let Err(e) = self.process(&frame) {
                        warn!("⚠️ Frame refused: {}", e);
                    }
                    let _ = recycle.try_send(frame);
                }
                Err(RecvTimeoutError::Timeout) => self.drain_events(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.publish_stats();
        info!(
            "👋 Audio processor stopped after {} frames",
            self.stats.frames_processed
        );
    }

    fn publish_stats(&self) {
        if let Some(hub) = &self.deps.stats {
            hub.update_frame_side(FrameSideStats {
                state: self.state,
                vad: self.vad.stats(),
                wake_word: self.detector.stats(),
                processor: self.stats.clone(),
            });
        }
    }

    fn elapsed_in_state(&self) -> u64 {
        self.stream_ms - self.entered_at_ms
    }

    fn transition(&mut self, to: ConversationState) -> bool {
        let from = self.state;
        if !from.can_transition(to) {
            self.stats.illegal_transitions += 1;
            warn!("⚠️ Ignoring illegal transition {} -> {}", from, to);
            return false;
        }

        if from.streams_audio() && !to.streams_audio() {
            self.deps.sink.stop_stream();
            self.gate.reset();
        }

        match to {
            ConversationState::Listening => {
                self.deps.tts.cancel("new turn");
                self.speech_seen = false;
                if !from.streams_audio() {
                    self.deps.sink.start_stream();
                }
            }
            ConversationState::Recording => {
                self.speech_seen = true;
                self.speech_ended = false;
                self.silence_run_ms = 0;
            }
            _ => {}
        }

        self.state = to;
        self.shared_state.set(to);
        self.entered_at_ms = self.stream_ms;
        self.apply_vad_context();
        self.stats.transitions += 1;

        if from != to {
            info!("🔀 {} -> {}", from, to);
            self.deps.ui.set_state(to);
        } else {
            debug!("🔀 {} restarted", to);
        }
        true
    }

    fn apply_vad_context(&mut self) {
        let context = match self.state {
            ConversationState::Listening | ConversationState::Recording => ConversationContext::Listening,
            ConversationState::Speaking => ConversationContext::Speaking,
            _ => ConversationContext::Idle,
        };
        self.vad.set_conversation_state(context);
        let echo = self.state == ConversationState::Speaking
            && self.deps.tts.playback().echo_cancellation();
        self.vad.set_echo_cancellation(echo);
    }

    fn handle_event(&mut self, event: ProcessorEvent) {
        match event {
            ProcessorEvent::Control(event) => self.handle_control(event),
            ProcessorEvent::Ui(intent) => self.handle_intent(intent),
            ProcessorEvent::RemoteState { state, text } => self.handle_remote(state, text),
        }
    }

    fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::TtsStarted {
                session_id,
                interrupt_recording,
            } => {
                debug!("🔊 Speech {} starting in {}", session_id, self.state);
                if self.state == ConversationState::Recording && !interrupt_recording {
                    // Close the utterance before answering.
                    self.transition(ConversationState::Processing);
                }
                self.transition(ConversationState::Speaking);
                self.tts_started_this_frame = true;
            }
            ControlEvent::Validation(validation) => {
                match self.detector.validate(
                    validation.detection_id,
                    validation.validated,
                    validation.processing_time_ms,
                ) {
                    Some(state) => debug!("🎯 Detection {} -> {:?}", validation.detection_id, state),
                    None => debug!("🎯 Late validation for {}", validation.detection_id),
                }
            }
            ControlEvent::ThresholdUpdate(update) => {
                if let Err(e) = self
                    .detector
                    .update_thresholds(update.energy_threshold, update.confidence_threshold)
                {
                    warn!("⚠️ Threshold update rejected: {}", e);
                } else if let Some(reason) = update.reason {
                    info!("🎯 Thresholds changed by server: {}", reason);
                }
            }
            ControlEvent::Connected => info!("✅ Control channel up"),
            ControlEvent::Disconnected { retry_in } => {
                let seconds = retry_in.map(|d| d.as_secs_f32().ceil() as u32).unwrap_or(0);
                self.deps.ui.show_error("control", "disconnected", seconds);
                self.deps.tts.cancel("control channel lost");
            }
        }
    }

    fn handle_intent(&mut self, intent: UiIntent) {
        debug!("👆 {:?} in {}", intent, self.state);
        match intent {
            UiIntent::Activate => {
                if self.state == ConversationState::Waiting {
                    self.transition(ConversationState::Listening);
                }
            }
            UiIntent::Cancel => match self.state {
                ConversationState::Speaking => {
                    self.deps.tts.cancel("cancelled by user");
                }
                ConversationState::Listening => {
                    self.transition(ConversationState::Waiting);
                }
                ConversationState::Recording => {
                    self.transition(ConversationState::Processing);
                    self.transition(ConversationState::Ending);
                }
                ConversationState::Processing => {
                    self.transition(ConversationState::Ending);
                }
                _ => {}
            },
            UiIntent::VolumeUp => {
                let volume = self.deps.tts.playback().volume_up();
                info!("🔊 Volume {:.0}%", volume * 100.0);
            }
            UiIntent::VolumeDown => {
                let volume = self.deps.tts.playback().volume_down();
                info!("🔉 Volume {:.0}%", volume * 100.0);
            }
            UiIntent::MuteToggle => {
                self.deps.tts.playback().toggle_mute();
            }
        }
    }

    fn handle_remote(&mut self, remote: RemoteState, text: Option<String>) {
        if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
            info!("💬 {}", text);
        }
        match remote {
            RemoteState::Listening => {
                if self.state == ConversationState::Waiting {
                    self.transition(ConversationState::Listening);
                }
            }
            RemoteState::Thinking => {
                if self.state == ConversationState::Listening {
                    self.transition(ConversationState::Recording);
                }
                if self.state == ConversationState::Recording {
                    self.transition(ConversationState::Processing);
                }
            }
            RemoteState::Speaking => {
                debug!("🔊 Server reports speaking; playback follows tts_audio_start");
            }
            RemoteState::Waiting | RemoteState::Ending => self.wind_down(),
        }
    }

    /// Head back to Waiting along legal edges.
    fn wind_down(&mut self) {
        match self.state {
            ConversationState::Listening => {
                self.transition(ConversationState::Waiting);
            }
            ConversationState::Recording => {
                self.transition(ConversationState::Processing);
                self.transition(ConversationState::Ending);
            }
            ConversationState::Processing => {
                self.transition(ConversationState::Ending);
            }
            ConversationState::Speaking if !self.deps.tts.playback().phase().is_active() => {
                self.transition(ConversationState::Ending);
            }
            _ => {}
        }
    }

    fn handle_wake_word(&mut self, wake: &WakeWordResult, vad: &VadResult) {
        match wake.state {
            WakeWordState::Triggered => {
                info!(
                    "🎯 Wake word {} (confidence {:.2}, {:?})",
                    wake.detection_id,
                    wake.confidence,
                    wake.level()
                );
                let message = OutboundMessage::WakeWordDetection(WakeWordDetection {
                    detection_id: wake.detection_id,
                    device_id: self.device_id.clone(),
                    timestamp: unix_millis(),
                    confidence: wake.confidence,
                    energy_level: wake.energy_level,
                    pattern_score: wake.pattern_score,
                    syllable_count: wake.syllable_count,
                    duration_ms: wake.duration_ms,
                    vad_active: vad.voice_detected || self.vad.is_speaking(),
                    snr_db: vad.snr_db,
                });
                if self.deps.outbound.send(message) {
                    self.stats.detections_sent += 1;
                } else {
                    self.stats.detections_unsent += 1;
                }
                self.deps.ui.show_wake_word(wake.confidence, WAKE_PHRASE);

                if self.state == ConversationState::Waiting && !self.tts_started_this_frame {
                    self.transition(ConversationState::Listening);
                }
            }
            WakeWordState::Rejected if wake.detection_id != 0 => {
                let expired = self.detector.last_expired();
                if expired.is_empty() {
                    trace!("🎯 Detection {} resolved as rejected", wake.detection_id);
                }
                for id in expired {
                    debug!("⏰ Detection {} expired without a verdict", id);
                }
                self.stats.detections_expired += expired.len() as u64;
            }
            _ => {}
        }
    }

    fn advance(&mut self, vad: &VadResult) {
        if vad.voice_detected {
            self.silence_run_ms = 0;
        } else {
            self.silence_run_ms += self.frame_ms;
        }

        match self.state {
            ConversationState::Waiting => {}
            ConversationState::Listening => {
                if vad.speech_started {
                    self.transition(ConversationState::Recording);
                } else if self.elapsed_in_state() > self.listen_timeout_ms {
                    info!("⏰ No speech within {} ms", self.listen_timeout_ms);
                    self.transition(ConversationState::Waiting);
                }
            }
            ConversationState::Recording => {
                if vad.speech_started {
                    self.speech_ended = false;
                }
                if vad.speech_ended {
                    self.speech_ended = true;
                }
                // The hard cap wins over end-of-speech.
                if self.elapsed_in_state() > self.max_recording_ms {
                    info!("⏰ Recording capped at {} ms", self.max_recording_ms);
                    self.stats.recording_timeouts += 1;
                    self.transition(ConversationState::Processing);
                } else if self.speech_ended && self.silence_run_ms > self.end_silence_ms {
                    self.transition(ConversationState::Processing);
                }
            }
            ConversationState::Processing => {
                if self.elapsed_in_state() > self.processing_timeout_ms {
                    warn!("⏰ No answer within {} ms", self.processing_timeout_ms);
                    self.transition(ConversationState::Ending);
                }
            }
            ConversationState::Speaking => match self.deps.tts.playback().phase() {
                PlaybackPhase::Finished => {
                    self.deps.tts.playback().release();
                    self.transition(ConversationState::Ending);
                }
                PlaybackPhase::Idle => {
                    self.transition(ConversationState::Ending);
                }
                _ => {}
            },
            ConversationState::Ending => {
                if self.elapsed_in_state() > 0 {
                    self.transition(ConversationState::Waiting);
                }
            }
        }
    }

    fn stream(&mut self, frame: &[i16], vad: &VadResult, wake: &WakeWordResult) {
        if !self.state.streams_audio() {
            return;
        }
        let voice = vad.voice_detected || vad.speech_started || self.vad.is_speaking();
        if !self.gate.admit(self.stream_ms, voice) {
            self.stats.frames_suppressed += 1;
            return;
        }
        let extension = annotate::header_extension(vad, wake);
        match self.deps.sink.send_annotated(frame, &extension) {
            Ok(()) => self.stats.frames_streamed += 1,
            Err(e) if e.kind() == ErrorKind::Busy => {
                self.stats.stream_busy += 1;
                trace!("📡 Frame dropped, sender busy");
            }
            Err(e) => {
                self.stats.stream_errors += 1;
                trace!("📡 Frame not sent: {}", e);
            }
        }
    }

    fn update_ui(&mut self, vad: &VadResult) {
        let ui = &self.deps.ui;
        ui.set_mic_level(level_from_rms(vad.rms), vad.confidence);
        if self.state == ConversationState::Speaking {
            let (level, progress) = self.deps.tts.playback().level();
            ui.set_tts_level(level, progress);
        }
        ui.flush();
    }
}
