//! TTS playback: session bookkeeping around the jitter buffer.
//!
//! The dispatcher opens a session synchronously when `tts_audio_start`
//! arrives. Chunks and the end marker travel through [`TtsWorker`], which
//! decodes base64 off the control thread into reused buffers. The speaker
//! thread pulls one frame per period with [`TtsPlayback::next_frame`].
//!
//! Playback waits until the jitter buffer holds `min_frames` (or the session
//! has ended) before the first frame leaves, then plays until the buffer runs
//! dry. After the end marker the last `fade_out_ms` of buffered audio is
//! ramped down, and `cooldown_period_ms` of silence follows before the session
//! reports finished.

use crate::control::OutboundSink;
use crate::error::{EdgeError, Result};
use crate::queue::{DropQueue, Droppable, PushOutcome};
use audio::{JitterBuffer, JitterConfig};
use control_protocol::{
    unix_millis, OutboundMessage, PlaybackPerformance, PlaybackStatusInfo, TtsAudioChunk,
    TtsAudioEnd, TtsAudioStart, TtsPlaybackConfig, TtsPlaybackStatus,
};
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const VOLUME_STEP: f32 = 0.1;
const MAX_TRACKED_CHUNKS: usize = 256;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackPhase {
    Idle,
    Buffering,
    Playing,
    /// End received, audio still queued.
    Draining,
    Cooldown,
    Finished,
}

impl PlaybackPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackPhase::Idle => "idle",
            PlaybackPhase::Buffering => "buffering",
            PlaybackPhase::Playing => "playing",
            PlaybackPhase::Draining => "draining",
            PlaybackPhase::Cooldown => "cooldown",
            PlaybackPhase::Finished => "completed",
        }
    }

    /// A session exists and has not finished.
    pub fn is_active(self) -> bool {
        !matches!(self, PlaybackPhase::Idle | PlaybackPhase::Finished)
    }
}

/// What [`TtsPlayback::next_frame`] wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// No session; silence.
    Idle,
    /// Prebuffering; silence, jitter buffer untouched.
    Buffering,
    Real,
    /// Buffer ran dry mid-session; silence.
    Underrun,
    Cooldown,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TtsStats {
    pub sessions_started: u32,
    pub sessions_completed: u32,
    pub sessions_cancelled: u32,
    pub sessions_rejected: u32,
    pub chunks_received: u64,
    pub chunks_dropped: u64,
    pub malformed_chunks: u64,
    pub sequence_gaps: u64,
    pub size_mismatches: u64,
    pub frames_played: u64,
    pub underruns: u64,
}

struct Session {
    id: String,
    started_at: Instant,
    first_frame_at: Option<Instant>,
    volume: f32,
    echo_cancellation: bool,
    interrupt_recording: bool,
    fade_in_samples: u64,
    fade_out_ms: u32,
    /// Sample position where the fade-out starts, and its length.
    fade_out: Option<(u64, u64)>,
    expected_chunks: u32,
    chunks_received: u32,
    chunks_played: u32,
    next_sequence: Option<u32>,
    /// Cumulative end offset of each queued chunk, in samples.
    chunk_ends: VecDeque<u64>,
    samples_received: u64,
    samples_played: u64,
    underruns: u32,
    dropouts: u32,
    started: bool,
    ended: bool,
    final_seen: bool,
    cooldown_frames: u32,
    finished: bool,
    last_level: u8,
}

impl Session {
    fn phase(&self) -> PlaybackPhase {
        if self.finished {
            PlaybackPhase::Finished
        } else if !self.started {
            PlaybackPhase::Buffering
        } else if self.ended {
            if self.samples_played < self.samples_received {
                PlaybackPhase::Draining
            } else {
                PlaybackPhase::Cooldown
            }
        } else {
            PlaybackPhase::Playing
        }
    }
}

struct Inner {
    jitter: JitterBuffer,
    session: Option<Session>,
    master_volume: f32,
    muted: bool,
    last_status: Option<Instant>,
    final_status_sent: bool,
    stats: TtsStats,
}

/// Snapshot for the UI and the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackSnapshot {
    pub phase: PlaybackPhase,
    pub session_id: Option<String>,
    pub chunks_received: u32,
    pub chunks_played: u32,
    pub expected_chunks: u32,
    pub buffer_depth: usize,
    pub buffer_level_ms: u32,
    pub master_volume: f32,
    pub muted: bool,
}

pub struct TtsPlayback {
    frame_samples: usize,
    sample_rate: u32,
    frame_ms: u32,
    echo_suppression_db: f32,
    inner: Mutex<Inner>,
}

impl TtsPlayback {
    pub fn new(
        frame_samples: usize,
        sample_rate: u32,
        jitter: JitterConfig,
        master_volume: f32,
        echo_suppression_db: f32,
    ) -> Result<Self> {
        let jitter = JitterBuffer::new(frame_samples, jitter)?;
        let frame_ms = (frame_samples as u64 * 1000 / sample_rate.max(1) as u64) as u32;
        Ok(Self {
            frame_samples,
            sample_rate,
            frame_ms: frame_ms.max(1),
            echo_suppression_db,
            inner: Mutex::new(Inner {
                jitter,
                session: None,
                master_volume: master_volume.clamp(0.0, 1.0),
                muted: false,
                last_status: None,
                final_status_sent: true,
                stats: TtsStats::default(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Open a session, cancelling any session still playing.
    pub fn begin_session(&self, start: &TtsAudioStart) -> Result<()> {
        let format = &start.audio_format;
        if format.sample_rate != self.sample_rate || format.channels != 1 || format.bits_per_sample != 16 {
            self.lock().stats.sessions_rejected += 1;
            return Err(EdgeError::InvalidArgument(format!(
                "unsupported TTS format {} Hz, {} ch, {} bit",
                format.sample_rate, format.channels, format.bits_per_sample
            )));
        }

        let mut inner = self.lock();
        if let Some(old) = inner.session.take() {
            if !old.finished {
                inner.stats.sessions_cancelled += 1;
                info!("⏹️ TTS session {} replaced by {}", old.id, start.session_info.session_id);
            }
        }
        inner.jitter.reset();

        let config: &TtsPlaybackConfig = &start.playback_config;
        inner.session = Some(Session {
            id: start.session_info.session_id.clone(),
            started_at: Instant::now(),
            first_frame_at: None,
            volume: config.volume.clamp(0.0, 1.0),
            echo_cancellation: config.echo_cancellation,
            interrupt_recording: config.interrupt_recording,
            fade_in_samples: self.ms_to_samples(config.fade_in_ms),
            fade_out_ms: config.fade_out_ms,
            fade_out: None,
            expected_chunks: start.session_info.total_chunks_expected,
            chunks_received: 0,
            chunks_played: 0,
            next_sequence: None,
            chunk_ends: VecDeque::with_capacity(MAX_TRACKED_CHUNKS),
            samples_received: 0,
            samples_played: 0,
            underruns: 0,
            dropouts: 0,
            started: false,
            ended: false,
            final_seen: false,
            cooldown_frames: 0,
            finished: false,
            last_level: 0,
        });
        inner.last_status = None;
        inner.final_status_sent = false;
        inner.stats.sessions_started += 1;

        info!(
            "🔊 TTS session {} started ({} chunks expected)",
            start.session_info.session_id, start.session_info.total_chunks_expected
        );
        Ok(())
    }

    /// Queue decoded chunk samples. Chunks for another session are dropped.
    pub fn push_chunk(
        &self,
        session_id: &str,
        sequence: u32,
        samples: &[i16],
        declared_bytes: usize,
        is_final: bool,
    ) -> Result<usize> {
        let mut inner = self.lock();
        let Inner { jitter, session, stats, .. } = &mut *inner;

        let session = match session.as_mut() {
            Some(s) if s.id == session_id && !s.finished => s,
            _ => {
                stats.chunks_dropped += 1;
                return Err(EdgeError::InvalidState(format!(
                    "no open TTS session '{session_id}'"
                )));
            }
        };
        if session.ended {
            stats.chunks_dropped += 1;
            return Err(EdgeError::InvalidState(format!(
                "chunk {sequence} after end of session '{session_id}'"
            )));
        }

        if let Some(expected) = session.next_sequence {
            if sequence != expected {
                warn!(
                    "⚠️ TTS chunk gap in {}: expected {}, got {}",
                    session_id, expected, sequence
                );
                stats.sequence_gaps += 1;
                session.dropouts += 1;
            }
        }
        session.next_sequence = Some(sequence.wrapping_add(1));

        if declared_bytes != 0 && declared_bytes != samples.len() * 2 {
            warn!(
                "⚠️ TTS chunk {} size mismatch: declared {} bytes, decoded {}",
                sequence,
                declared_bytes,
                samples.len() * 2
            );
            stats.size_mismatches += 1;
        }

        let dropped_before = jitter.stats().oldest_drops;
        jitter.push(samples);
        let dropped = jitter.stats().oldest_drops - dropped_before;
        if dropped > 0 {
            // Overwritten audio will never play; keep positions consistent.
            session.samples_played += dropped * self.frame_samples as u64;
            session.dropouts += dropped as u32;
        }

        session.samples_received += samples.len() as u64;
        if session.chunk_ends.len() == MAX_TRACKED_CHUNKS {
            session.chunk_ends.pop_front();
            session.chunks_played += 1;
        }
        session.chunk_ends.push_back(session.samples_received);
        session.chunks_received += 1;
        session.final_seen |= is_final;
        stats.chunks_received += 1;

        trace!(
            "🎵 Chunk {} ({} samples), depth {}",
            sequence,
            samples.len(),
            jitter.depth()
        );
        Ok(samples.len())
    }

    pub fn record_malformed_chunk(&self, session_id: &str) {
        let mut inner = self.lock();
        inner.stats.malformed_chunks += 1;
        if let Some(session) = inner.session.as_mut().filter(|s| s.id == session_id) {
            session.dropouts += 1;
        }
    }

    /// Mark the session complete; playback drains what is queued.
    pub fn end_session(&self, end: &TtsAudioEnd) -> bool {
        let mut inner = self.lock();
        let Inner { jitter, session, .. } = &mut *inner;
        let Some(session) = session.as_mut().filter(|s| s.id == end.session_summary.session_id) else {
            warn!(
                "⚠️ tts_audio_end for unknown session {}",
                end.session_summary.session_id
            );
            return false;
        };
        if session.ended {
            return false;
        }

        let partial = jitter.accumulated();
        if jitter.flush_partial() {
            // Padding counts as audio to play.
            session.samples_received += (self.frame_samples - partial) as u64;
        }
        session.ended = true;
        if !session.final_seen {
            debug!("🏁 Session {} ended without a final chunk", session.id);
        }

        let fade_ms = end.playback_actions.fade_out_ms.unwrap_or(session.fade_out_ms);
        let fade_len = self.ms_to_samples(fade_ms);
        if fade_len > 0 {
            let fade_start = session
                .samples_received
                .saturating_sub(fade_len)
                .max(session.samples_played);
            session.fade_out = Some((fade_start, session.samples_received - fade_start));
        }
        session.cooldown_frames = end.playback_actions.cooldown_period_ms.div_ceil(self.frame_ms);

        info!(
            "🏁 TTS session {} ended: {}/{} chunks, {} ms buffered",
            session.id,
            session.chunks_received,
            session.expected_chunks,
            self.buffer_level_ms(jitter)
        );
        inner.last_status = None;
        true
    }

    /// Drop the current session and empty the jitter buffer.
    pub fn cancel(&self, reason: &str) -> bool {
        let mut inner = self.lock();
        let session = inner.session.take();
        inner.jitter.reset();
        let Some(session) = session else {
            return false;
        };
        if session.finished {
            return false;
        }
        inner.stats.sessions_cancelled += 1;
        inner.final_status_sent = true;
        info!("⏹️ TTS session {} cancelled: {}", session.id, reason);
        true
    }

    /// Forget a finished session.
    pub fn release(&self) {
        let mut inner = self.lock();
        if inner.session.as_ref().is_some_and(|s| s.finished) {
            inner.session = None;
        }
    }

    /// Fill `out` with the next playback frame.
    pub fn next_frame(&self, out: &mut [i16]) -> FrameSource {
        let mut inner = self.lock();
        let Inner {
            jitter,
            session,
            master_volume,
            muted,
            stats,
            ..
        } = &mut *inner;

        let Some(session) = session.as_mut().filter(|s| !s.finished) else {
            out.fill(0);
            return FrameSource::Idle;
        };

        if !session.started {
            if jitter.is_ready() || (session.ended && jitter.depth() > 0) {
                session.started = true;
                debug!("▶️ TTS playout starts at depth {}", jitter.depth());
            } else if session.ended {
                // Nothing ever arrived.
                session.finished = true;
                stats.sessions_completed += 1;
                out.fill(0);
                return FrameSource::Idle;
            } else {
                out.fill(0);
                return FrameSource::Buffering;
            }
        }

        if jitter.pop_frame(out) {
            if session.first_frame_at.is_none() {
                session.first_frame_at = Some(Instant::now());
            }
            let gain = if *muted { 0.0 } else { session.volume * *master_volume };
            self.shape(session, out, gain);
            session.samples_played += out.len() as u64;
            while session
                .chunk_ends
                .front()
                .is_some_and(|&end| end <= session.samples_played)
            {
                session.chunk_ends.pop_front();
                session.chunks_played += 1;
            }
            session.last_level = level_of(out);
            stats.frames_played += 1;
            return FrameSource::Real;
        }

        session.last_level = 0;
        if !session.ended {
            session.underruns += 1;
            stats.underruns += 1;
            return FrameSource::Underrun;
        }
        if session.cooldown_frames > 0 {
            session.cooldown_frames -= 1;
            return FrameSource::Cooldown;
        }

        session.finished = true;
        stats.sessions_completed += 1;
        info!(
            "✅ TTS session {} finished: {} chunks played, {} underruns",
            session.id, session.chunks_played, session.underruns
        );
        FrameSource::Idle
    }

    fn shape(&self, session: &Session, out: &mut [i16], gain: f32) {
        let position = session.samples_played;
        for (i, sample) in out.iter_mut().enumerate() {
            let at = position + i as u64;
            let mut g = gain;
            if at < session.fade_in_samples {
                g *= at as f32 / session.fade_in_samples as f32;
            }
            if let Some((start, len)) = session.fade_out {
                if at >= start {
                    let left = (start + len).saturating_sub(at);
                    g *= left as f32 / len as f32;
                }
            }
            *sample = (*sample as f32 * g).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.lock()
            .session
            .as_ref()
            .map(Session::phase)
            .unwrap_or(PlaybackPhase::Idle)
    }

    pub fn is_finished(&self) -> bool {
        self.phase() == PlaybackPhase::Finished
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.id.clone())
    }

    /// Echo cancellation requested by the active session.
    pub fn echo_cancellation(&self) -> bool {
        self.lock()
            .session
            .as_ref()
            .is_some_and(|s| !s.finished && s.echo_cancellation)
    }

    pub fn interrupts_recording(&self) -> bool {
        self.lock()
            .session
            .as_ref()
            .map(|s| s.interrupt_recording)
            .unwrap_or(true)
    }

    pub fn depth(&self) -> usize {
        self.lock().jitter.depth()
    }

    pub fn jitter_stats(&self) -> audio::JitterStats {
        self.lock().jitter.stats()
    }

    pub fn stats(&self) -> TtsStats {
        self.lock().stats.clone()
    }

    /// Level 0..100 of the last played frame and progress 0..1.
    pub fn level(&self) -> (u8, f32) {
        let inner = self.lock();
        match &inner.session {
            Some(s) => {
                let progress = if s.expected_chunks > 0 {
                    (s.chunks_played as f32 / s.expected_chunks as f32).min(1.0)
                } else if s.samples_received > 0 {
                    (s.samples_played as f32 / s.samples_received as f32).min(1.0)
                } else {
                    0.0
                };
                (s.last_level, progress)
            }
            None => (0, 0.0),
        }
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let inner = self.lock();
        let session = inner.session.as_ref();
        PlaybackSnapshot {
            phase: session.map(Session::phase).unwrap_or(PlaybackPhase::Idle),
            session_id: session.map(|s| s.id.clone()),
            chunks_received: session.map(|s| s.chunks_received).unwrap_or(0),
            chunks_played: session.map(|s| s.chunks_played).unwrap_or(0),
            expected_chunks: session.map(|s| s.expected_chunks).unwrap_or(0),
            buffer_depth: inner.jitter.depth(),
            buffer_level_ms: self.buffer_level_ms(&inner.jitter),
            master_volume: inner.master_volume,
            muted: inner.muted,
        }
    }

    pub fn set_master_volume(&self, volume: f32) -> f32 {
        let mut inner = self.lock();
        inner.master_volume = volume.clamp(0.0, 1.0);
        inner.master_volume
    }

    pub fn volume_up(&self) -> f32 {
        let current = self.lock().master_volume;
        self.set_master_volume(current + VOLUME_STEP)
    }

    pub fn volume_down(&self) -> f32 {
        let current = self.lock().master_volume;
        self.set_master_volume(current - VOLUME_STEP)
    }

    pub fn toggle_mute(&self) -> bool {
        let mut inner = self.lock();
        inner.muted = !inner.muted;
        info!("🔇 Playback {}", if inner.muted { "muted" } else { "unmuted" });
        inner.muted
    }

    /// A status message if one is due: immediately after start and end,
    /// every `interval` while active, and once when the session finishes.
    pub fn take_status_due(&self, interval: Duration, device_id: &str) -> Option<TtsPlaybackStatus> {
        let mut inner = self.lock();
        let session = inner.session.as_ref()?;
        let now = Instant::now();

        if session.finished {
            if inner.final_status_sent {
                return None;
            }
            inner.final_status_sent = true;
        } else {
            let due = inner
                .last_status
                .map_or(true, |at| now.duration_since(at) >= interval);
            if !due {
                return None;
            }
        }
        inner.last_status = Some(now);
        Some(self.status_of(&inner, device_id))
    }

    fn status_of(&self, inner: &Inner, device_id: &str) -> TtsPlaybackStatus {
        let (info, performance) = match &inner.session {
            Some(s) => {
                let played_frames = s.samples_played / self.frame_samples as u64;
                let total = played_frames + s.underruns as u64;
                let quality = if total == 0 {
                    1.0
                } else {
                    played_frames as f32 / total as f32
                };
                (
                    PlaybackStatusInfo {
                        session_id: s.id.clone(),
                        playback_state: s.phase().as_str().to_string(),
                        chunks_received: s.chunks_received,
                        chunks_played: s.chunks_played,
                        buffer_level_ms: self.buffer_level_ms(&inner.jitter),
                        audio_quality: quality,
                    },
                    PlaybackPerformance {
                        playback_latency_ms: s
                            .first_frame_at
                            .map(|at| at.duration_since(s.started_at).as_millis() as u32)
                            .unwrap_or(0),
                        buffer_underruns: s.underruns,
                        audio_dropouts: s.dropouts,
                        echo_suppression_db: if s.echo_cancellation {
                            self.echo_suppression_db
                        } else {
                            0.0
                        },
                    },
                )
            }
            None => Default::default(),
        };
        TtsPlaybackStatus {
            device_id: device_id.to_string(),
            timestamp: unix_millis(),
            status_info: info,
            performance,
        }
    }

    fn buffer_level_ms(&self, jitter: &JitterBuffer) -> u32 {
        let samples = jitter.depth() * self.frame_samples + jitter.accumulated();
        audio::samples_to_ms(samples, self.sample_rate)
    }

    fn ms_to_samples(&self, ms: u32) -> u64 {
        ms as u64 * self.sample_rate as u64 / 1000
    }
}

fn level_of(frame: &[i16]) -> u8 {
    if frame.is_empty() {
        return 0;
    }
    let sum: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum / frame.len() as f64).sqrt();
    ((rms / 10_000.0) * 100.0).min(100.0) as u8
}

/// Work for the TTS thread.
#[derive(Debug)]
pub enum TtsCommand {
    Chunk(TtsAudioChunk),
    End(TtsAudioEnd),
}

impl Droppable for TtsCommand {
    fn drop_rank(&self) -> Option<u8> {
        match self {
            TtsCommand::Chunk(_) => Some(0),
            TtsCommand::End(_) => None,
        }
    }
}

/// Decodes chunks off the control thread and reports playback status.
pub struct TtsWorker {
    playback: Arc<TtsPlayback>,
    commands: DropQueue<TtsCommand>,
    outbound: Arc<dyn OutboundSink>,
    device_id: String,
    status_interval: Duration,
    stop: AtomicBool,
}

impl TtsWorker {
    pub fn new(
        playback: Arc<TtsPlayback>,
        outbound: Arc<dyn OutboundSink>,
        device_id: impl Into<String>,
        queue_capacity: usize,
        status_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            playback,
            commands: DropQueue::new(queue_capacity),
            outbound,
            device_id: device_id.into(),
            status_interval,
            stop: AtomicBool::new(false),
        })
    }

    pub fn playback(&self) -> &Arc<TtsPlayback> {
        &self.playback
    }

    /// Queue work. When full, the oldest chunk not yet decoded is dropped.
    pub fn submit(&self, command: TtsCommand) -> bool {
        match self.commands.push(command) {
            PushOutcome::Queued => true,
            PushOutcome::Evicted(old) => {
                warn!("⚠️ TTS queue full, dropped {}", kind_of(&old));
                true
            }
            PushOutcome::Rejected(command) => {
                warn!("⚠️ TTS queue full, {} rejected", kind_of(&command));
                false
            }
        }
    }

    /// Cancel playback and discard queued chunks.
    pub fn cancel(&self, reason: &str) -> bool {
        let discarded = self.commands.clear();
        if discarded > 0 {
            debug!("🗑️ Discarded {} queued TTS commands", discarded);
        }
        self.playback.cancel(reason)
    }

    pub fn pending(&self) -> usize {
        self.commands.len()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn spawn(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let worker = Arc::clone(self);
        thread::Builder::new()
            .name("tts-worker".to_string())
            .spawn(move || worker.run())
    }

    fn run(&self) {
        let mut bytes = Vec::with_capacity(8192);
        let mut samples = Vec::with_capacity(4096);
        let poll = self.status_interval.min(Duration::from_millis(50));

        while !self.stop.load(Ordering::Acquire) {
            if let Some(command) = self.commands.pop_timeout(poll) {
                self.handle(command, &mut bytes, &mut samples);
            }
            self.publish_status();
        }
        debug!("👋 TTS worker exiting");
    }

    /// Process everything queued right now. Used by tests and shutdown.
    pub fn drain(&self) {
        let mut bytes = Vec::new();
        let mut samples = Vec::new();
        while let Some(command) = self.commands.try_pop() {
            self.handle(command, &mut bytes, &mut samples);
        }
        self.publish_status();
    }

    fn handle(&self, command: TtsCommand, bytes: &mut Vec<u8>, samples: &mut Vec<i16>) {
        match command {
            TtsCommand::Chunk(chunk) => {
                let info = &chunk.chunk_info;
                if let Some(checksum) = info.checksum_value() {
                    trace!("🔢 Chunk {} checksum {:08x}", info.chunk_sequence, checksum);
                }
                match info.decode_audio_into(bytes, samples) {
                    Ok(_) => {
                        if let Err(e) = self.playback.push_chunk(
                            &info.session_id,
                            info.chunk_sequence,
                            samples,
                            info.chunk_size,
                            info.is_final,
                        ) {
                            debug!("🗑️ Chunk {} dropped: {}", info.chunk_sequence, e);
                        }
                    }
                    Err(e) => {
                        warn!("⚠️ Malformed TTS chunk {}: {}", info.chunk_sequence, e);
                        self.playback.record_malformed_chunk(&info.session_id);
                    }
                }
            }
            TtsCommand::End(end) => {
                self.playback.end_session(&end);
            }
        }
    }

    fn publish_status(&self) {
        if let Some(status) = self.playback.take_status_due(self.status_interval, &self.device_id) {
            trace!("📊 TTS status {}", status.status_info.playback_state);
            self.outbound.send(OutboundMessage::TtsPlaybackStatus(status));
        }
    }
}

fn kind_of(command: &TtsCommand) -> &'static str {
    match command {
        TtsCommand::Chunk(_) => "chunk",
        TtsCommand::End(_) => "end",
    }
}
