//! UI command surface.
//!
//! The core only talks to a display through [`UiSurface`]. [`ThrottledUi`]
//! wraps any surface and limits each level meter to one update every 16 ms,
//! keeping the latest value of a suppressed update for the next flush.
//! State changes, wake word banners, server info and errors always go
//! straight through, in call order.
//! User input flows the other way as [`UiIntent`]s on a channel that the
//! processor drains at frame boundaries.

use crate::processor::state::ConversationState;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub trait UiSurface: Send + Sync {
    fn set_state(&self, state: ConversationState);
    fn set_mic_level(&self, level: u8, vad_confidence: f32);
    fn set_tts_level(&self, level: u8, progress: f32);
    fn set_wifi_strength(&self, strength: u8);
    fn show_wake_word(&self, confidence: f32, phrase: &str);
    fn set_server_info(&self, hostname: &str, protocol: &str);
    fn show_error(&self, kind: &str, message: &str, recovery_seconds: u32);

    /// Push out anything held back by rate limiting.
    fn flush(&self) {}
}

/// Edge-triggered user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiIntent {
    Activate,
    Cancel,
    VolumeUp,
    VolumeDown,
    MuteToggle,
}

/// Logs every update. The default surface on a headless device.
#[derive(Debug, Default)]
pub struct LoggingUi;

impl UiSurface for LoggingUi {
    fn set_state(&self, state: ConversationState) {
        info!("🖥️ State: {}", state.as_str());
    }

    fn set_mic_level(&self, level: u8, vad_confidence: f32) {
        log::trace!("🎙️ Mic level {} (vad {:.2})", level, vad_confidence);
    }

    fn set_tts_level(&self, level: u8, progress: f32) {
        log::trace!("🔊 TTS level {} ({:.0}%)", level, progress * 100.0);
    }

    fn set_wifi_strength(&self, strength: u8) {
        log::debug!("📶 Wi-Fi {}%", strength);
    }

    fn show_wake_word(&self, confidence: f32, phrase: &str) {
        info!("🎯 \"{}\" ({:.0}%)", phrase, confidence * 100.0);
    }

    fn set_server_info(&self, hostname: &str, protocol: &str) {
        info!("🖥️ Server {} via {}", hostname, protocol);
    }

    fn show_error(&self, kind: &str, message: &str, recovery_seconds: u32) {
        warn!("🚨 {} error: {} (retry in {} s)", kind, message, recovery_seconds);
    }
}

/// One recorded UI call.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    State(ConversationState),
    MicLevel(u8, f32),
    TtsLevel(u8, f32),
    WifiStrength(u8),
    WakeWord(f32, String),
    ServerInfo(String, String),
    Error(String, String, u32),
}

/// Keeps every call with its time, for tests and the HTTP status page.
#[derive(Debug, Default)]
pub struct RecordingUi {
    events: Mutex<Vec<(Instant, UiEvent)>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: UiEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((Instant::now(), event));
    }

    pub fn events(&self) -> Vec<UiEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn timed_events(&self) -> Vec<(Instant, UiEvent)> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn states(&self) -> Vec<ConversationState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::State(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<(String, String, u32)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Error(kind, message, secs) => Some((kind, message, secs)),
                _ => None,
            })
            .collect()
    }
}

impl UiSurface for RecordingUi {
    fn set_state(&self, state: ConversationState) {
        self.record(UiEvent::State(state));
    }

    fn set_mic_level(&self, level: u8, vad_confidence: f32) {
        self.record(UiEvent::MicLevel(level, vad_confidence));
    }

    fn set_tts_level(&self, level: u8, progress: f32) {
        self.record(UiEvent::TtsLevel(level, progress));
    }

    fn set_wifi_strength(&self, strength: u8) {
        self.record(UiEvent::WifiStrength(strength));
    }

    fn show_wake_word(&self, confidence: f32, phrase: &str) {
        self.record(UiEvent::WakeWord(confidence, phrase.to_string()));
    }

    fn set_server_info(&self, hostname: &str, protocol: &str) {
        self.record(UiEvent::ServerInfo(hostname.to_string(), protocol.to_string()));
    }

    fn show_error(&self, kind: &str, message: &str, recovery_seconds: u32) {
        self.record(UiEvent::Error(
            kind.to_string(),
            message.to_string(),
            recovery_seconds,
        ));
    }
}

/// Meters that are rate limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    MicLevel,
    TtsLevel,
    Wifi,
}

const KINDS: usize = 3;

impl Kind {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Default)]
struct Slots {
    last_sent: [Option<Instant>; KINDS],
    pending: [Option<UiEvent>; KINDS],
}

/// Meter rate limiter in front of a surface.
pub struct ThrottledUi<U: UiSurface> {
    inner: U,
    min_interval: Duration,
    slots: Mutex<Slots>,
}

impl<U: UiSurface> ThrottledUi<U> {
    pub fn new(inner: U, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn inner(&self) -> &U {
        &self.inner
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn offer(&self, kind: Kind, event: UiEvent) {
        let now = Instant::now();
        let mut slots = self.lock();
        let i = kind.index();
        let ready = slots.last_sent[i].map_or(true, |at| now.duration_since(at) >= self.min_interval);
        if ready {
            slots.last_sent[i] = Some(now);
            slots.pending[i] = None;
            drop(slots);
            self.deliver(event);
        } else {
            slots.pending[i] = Some(event);
        }
    }

    /// Deliver held-back updates whose interval has passed.
    fn flush_due(&self) {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut slots = self.lock();
            for i in 0..KINDS {
                if slots.pending[i].is_none() {
                    continue;
                }
                let ready = slots.last_sent[i]
                    .map_or(true, |at| now.duration_since(at) >= self.min_interval);
                if ready {
                    slots.last_sent[i] = Some(now);
                    if let Some(event) = slots.pending[i].take() {
                        due.push(event);
                    }
                }
            }
        }
        for event in due {
            self.deliver(event);
        }
    }

    fn deliver(&self, event: UiEvent) {
        match event {
            UiEvent::State(s) => self.inner.set_state(s),
            UiEvent::MicLevel(l, c) => self.inner.set_mic_level(l, c),
            UiEvent::TtsLevel(l, p) => self.inner.set_tts_level(l, p),
            UiEvent::WifiStrength(s) => self.inner.set_wifi_strength(s),
            UiEvent::WakeWord(c, phrase) => self.inner.show_wake_word(c, &phrase),
            UiEvent::ServerInfo(h, p) => self.inner.set_server_info(&h, &p),
            UiEvent::Error(k, m, s) => self.inner.show_error(&k, &m, s),
        }
    }
}

impl<U: UiSurface> UiSurface for ThrottledUi<U> {
    fn set_state(&self, state: ConversationState) {
        self.inner.set_state(state);
    }

    fn set_mic_level(&self, level: u8, vad_confidence: f32) {
        self.offer(Kind::MicLevel, UiEvent::MicLevel(level.min(100), vad_confidence));
    }

    fn set_tts_level(&self, level: u8, progress: f32) {
        self.offer(
            Kind::TtsLevel,
            UiEvent::TtsLevel(level.min(100), progress.clamp(0.0, 1.0)),
        );
    }

    fn set_wifi_strength(&self, strength: u8) {
        self.offer(Kind::Wifi, UiEvent::WifiStrength(strength.min(100)));
    }

    fn show_wake_word(&self, confidence: f32, phrase: &str) {
        self.inner.show_wake_word(confidence, phrase);
    }

    fn set_server_info(&self, hostname: &str, protocol: &str) {
        self.inner.set_server_info(hostname, protocol);
    }

    fn show_error(&self, kind: &str, message: &str, recovery_seconds: u32) {
        self.inner.show_error(kind, message, recovery_seconds);
    }

    fn flush(&self) {
        self.flush_due();
    }
}

impl<T: UiSurface + ?Sized> UiSurface for std::sync::Arc<T> {
    fn set_state(&self, state: ConversationState) {
        (**self).set_state(state)
    }

    fn set_mic_level(&self, level: u8, vad_confidence: f32) {
        (**self).set_mic_level(level, vad_confidence)
    }

    fn set_tts_level(&self, level: u8, progress: f32) {
        (**self).set_tts_level(level, progress)
    }

    fn set_wifi_strength(&self, strength: u8) {
        (**self).set_wifi_strength(strength)
    }

    fn show_wake_word(&self, confidence: f32, phrase: &str) {
        (**self).show_wake_word(confidence, phrase)
    }

    fn set_server_info(&self, hostname: &str, protocol: &str) {
        (**self).set_server_info(hostname, protocol)
    }

    fn show_error(&self, kind: &str, message: &str, recovery_seconds: u32) {
        (**self).show_error(kind, message, recovery_seconds)
    }

    fn flush(&self) {
        (**self).flush()
    }
}

/// Map an RMS value onto the 0..100 meter scale.
pub fn level_from_rms(rms: f32) -> u8 {
    ((rms / 10_000.0) * 100.0).clamp(0.0, 100.0) as u8
}
