//! Device-wide statistics.
//!
//! Components that own their counters behind a lock (device, streamer,
//! control channel, playback) are read at snapshot time. The per-frame
//! processor owns VAD and wake-word state on its thread, so it pushes a copy
//! into the hub every refresh interval instead.

use crate::control::{ControlChannel, ControlStats, OutboundSink};
use crate::processor::state::ConversationState;
use crate::processor::ProcessorStats;
use crate::streamer::{StreamerStats, UdpAudioStreamer};
use crate::tts::{TtsPlayback, TtsStats};
use audio::{AudioDevice, DeviceStats, JitterStats};
use chrono::{DateTime, Utc};
use control_protocol::{
    unix_millis, DeviceStatistics, NetworkStatsReport, OutboundMessage, VadStatsReport,
    WakeWordStatsReport,
};
use log::{debug, trace};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use wakeword::{VadStats, WakeWordStats};

/// Counters bumped by the capture thread.
#[derive(Debug, Default)]
pub struct CaptureCounters {
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub read_errors: AtomicU64,
    pub short_reads: AtomicU64,
    pub max_read_gap_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub read_errors: u64,
    pub short_reads: u64,
    pub max_read_gap_ms: u64,
}

impl CaptureCounters {
    pub fn record_gap(&self, gap: Duration) {
        self.max_read_gap_us
            .fetch_max(gap.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
            max_read_gap_ms: self.max_read_gap_us.load(Ordering::Relaxed) / 1000,
        }
    }
}

/// What the processor thread reports.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameSideStats {
    pub state: ConversationState,
    pub vad: VadStats,
    pub wake_word: WakeWordStats,
    pub processor: ProcessorStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeStats {
    pub device_id: String,
    pub generated_at: DateTime<Utc>,
    pub uptime_s: u64,
    pub state: ConversationState,
    pub capture: CaptureStats,
    pub audio: Option<DeviceStats>,
    pub vad: VadStats,
    pub wake_word: WakeWordStats,
    pub processor: ProcessorStats,
    pub streamer: Option<StreamerStats>,
    pub control: Option<ControlStats>,
    pub tts: Option<TtsStats>,
    pub jitter: Option<JitterStats>,
    pub validation_accuracy: f32,
    pub average_packet_interval_ms: f32,
    pub connection_uptime_s: u64,
}

pub struct StatsHub {
    device_id: String,
    started: Instant,
    frame_side: Mutex<FrameSideStats>,
    capture: Arc<CaptureCounters>,
    device: Option<Arc<AudioDevice>>,
    streamer: Option<Arc<UdpAudioStreamer>>,
    control: Option<Arc<ControlChannel>>,
    playback: Option<Arc<TtsPlayback>>,
}

impl StatsHub {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            started: Instant::now(),
            frame_side: Mutex::new(FrameSideStats::default()),
            capture: Arc::new(CaptureCounters::default()),
            device: None,
            streamer: None,
            control: None,
            playback: None,
        }
    }

    pub fn with_device(mut self, device: Arc<AudioDevice>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_streamer(mut self, streamer: Arc<UdpAudioStreamer>) -> Self {
        self.streamer = Some(streamer);
        self
    }

    pub fn with_control(mut self, control: Arc<ControlChannel>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_playback(mut self, playback: Arc<TtsPlayback>) -> Self {
        self.playback = Some(playback);
        self
    }

    pub fn capture(&self) -> &Arc<CaptureCounters> {
        &self.capture
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn update_frame_side(&self, stats: FrameSideStats) {
        *self.frame_side.lock().unwrap_or_else(|e| e.into_inner()) = stats;
    }

    pub fn frame_side(&self) -> FrameSideStats {
        self.frame_side
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn snapshot(&self) -> EdgeStats {
        let frame_side = self.frame_side();
        let streamer = self.streamer.as_ref().map(|s| s.stats());
        let control = self.control.as_ref().map(|c| c.stats());

        let validation_accuracy = match &control {
            Some(c) if c.validations_received > 0 => c.validation_accuracy(),
            _ => frame_side.wake_word.accuracy(),
        };

        EdgeStats {
            device_id: self.device_id.clone(),
            generated_at: Utc::now(),
            uptime_s: self.started.elapsed().as_secs(),
            state: frame_side.state,
            capture: self.capture.snapshot(),
            audio: self.device.as_ref().map(|d| d.stats()),
            vad: frame_side.vad,
            wake_word: frame_side.wake_word,
            processor: frame_side.processor,
            average_packet_interval_ms: streamer
                .map(|s| s.average_packet_interval_ms)
                .unwrap_or(0.0),
            connection_uptime_s: control.as_ref().map(|c| c.connection_uptime_s).unwrap_or(0),
            streamer,
            control,
            tts: self.playback.as_ref().map(|p| p.stats()),
            jitter: self.playback.as_ref().map(|p| p.jitter_stats()),
            validation_accuracy,
        }
    }

    /// The `device_statistics` message for the server.
    pub fn device_statistics(&self) -> DeviceStatistics {
        let stats = self.snapshot();
        let ww = &stats.wake_word;
        DeviceStatistics {
            device_id: self.device_id.clone(),
            timestamp: unix_millis(),
            wake_word_stats: WakeWordStatsReport {
                total_detections: ww.total_detections,
                true_positives: ww.true_positives,
                false_positives: ww.false_positives,
                timed_out: ww.timed_out,
                avg_confidence: ww.average_confidence,
                current_threshold: ww.current_threshold,
            },
            vad_stats: VadStatsReport {
                voice_packets: stats.vad.voice_frames as u32,
                silence_packets: stats.vad.silence_frames as u32,
                avg_confidence: stats.vad.average_confidence,
            },
            network_stats: stats.streamer.map(|s| NetworkStatsReport {
                packets_sent: s.packets_sent,
                sequence_errors: s.sequence_errors,
                socket_errors: s.socket_errors,
                average_latency_ms: s.average_latency_ms,
                reconnections: stats.control.as_ref().map(|c| c.reconnections).unwrap_or(0),
                connection_uptime_s: stats.connection_uptime_s,
            }),
        }
    }

    /// Publish `device_statistics` every `interval` until `stop`.
    pub fn spawn_publisher(
        self: &Arc<Self>,
        outbound: Arc<dyn OutboundSink>,
        interval: Duration,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let hub = Arc::clone(self);
        thread::Builder::new()
            .name("stats".to_string())
            .spawn(move || {
                let mut next = Instant::now() + interval;
                while !stop.load(Ordering::Acquire) {
                    if Instant::now() >= next {
                        let message = hub.device_statistics();
                        trace!("📊 Publishing statistics");
                        if !outbound.send(OutboundMessage::DeviceStatistics(message)) {
                            debug!("📊 Statistics not queued");
                        }
                        next += interval;
                    }
                    thread::sleep(Duration::from_millis(50).min(interval));
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_counters() {
        let counters = CaptureCounters::default();
        counters.frames_captured.fetch_add(10, Ordering::Relaxed);
        counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
        counters.record_gap(Duration::from_millis(25));
        counters.record_gap(Duration::from_millis(21));

        let stats = counters.snapshot();
        assert_eq!(stats.frames_captured, 10);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.max_read_gap_ms, 25);
    }

    #[test]
    fn test_device_statistics_from_frame_side() {
        let hub = StatsHub::new("dev");
        hub.update_frame_side(FrameSideStats {
            state: ConversationState::Listening,
            vad: VadStats {
                voice_frames: 12,
                silence_frames: 88,
                average_confidence: 0.5,
                ..Default::default()
            },
            wake_word: WakeWordStats {
                total_detections: 3,
                true_positives: 2,
                false_positives: 1,
                current_threshold: 3400,
                ..Default::default()
            },
            processor: ProcessorStats::default(),
        });

        let message = hub.device_statistics();
        assert_eq!(message.device_id, "dev");
        assert_eq!(message.wake_word_stats.total_detections, 3);
        assert_eq!(message.wake_word_stats.current_threshold, 3400);
        assert_eq!(message.vad_stats.voice_packets, 12);
        assert!(message.network_stats.is_none());

        let snapshot = hub.snapshot();
        assert_eq!(snapshot.state, ConversationState::Listening);
        assert!((snapshot.validation_accuracy - 2.0 / 3.0).abs() < 1e-6);
    }
}
