//! # Energy-Pattern Wake Word Detector
//!
//! Detects "hey howdy" by the shape of its energy contour rather than with a
//! neural model. Each 20 ms frame contributes one energy value; a run of loud,
//! voiced frames becomes a candidate segment that is matched against a fixed
//! reference contour once the speaker pauses.
//!
//! ```text
//! frame → RMS → history (50) ──every 5 s──→ adaptive threshold
//!           │
//!           └─ above threshold & voiced? → candidate (≤30 normalized values)
//!                                             │ silence > 300 ms
//!                                             ▼
//!                      resample to 11 → Pearson vs reference → × syllable/VAD bonus
//!                                             │ ≥ confidence threshold
//!                                             ▼
//!                                   Triggered(detection_id) → pending FIFO
//! ```
//!
//! ## Server feedback
//!
//! Every trigger waits in a bounded FIFO for the server's verdict:
//!
//! - **confirmed**: the adaptive threshold drops by 1%
//! - **rejected**: two rejections in a row raise it by 5%
//! - **no answer** within the validation timeout: counted as timed out,
//!   reported as rejected, threshold untouched
//!
//! The threshold always stays within `[base / 3, base · 4]`, so neither a noisy
//! room nor a run of rejections can push the detector into always-on or
//! always-off.
//!
//! ## Time
//!
//! All timers run on stream time (frames processed × frame length), which keeps
//! the detector deterministic under test and immune to scheduling hiccups.

use crate::error::{Result, WakeWordError};
use crate::pattern::{count_syllables, pearson, resample_into, rms, HEY_HOWDY};
use crate::vad::VadResult;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const HISTORY_LEN: usize = 50;

/// Configuration for the wake word detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeWordConfig {
    /// Base RMS energy a frame must exceed to join a candidate
    pub energy_threshold: u32,
    /// Minimum confidence to emit a detection
    pub confidence_threshold: f32,
    /// Let server feedback move the threshold
    pub adaptation_enabled: bool,
    /// Pause that closes a candidate segment
    pub silence_timeout_ms: u32,
    /// Time the server has to validate a detection
    pub validation_timeout_ms: u32,
    /// Detections awaiting validation
    pub max_pending: usize,
    pub frame_ms: u32,
    /// How often the threshold follows the noise level
    pub adaptation_interval_ms: u32,
    pub noise_multiplier: f32,
    pub syllable_threshold: f32,
    pub min_pattern_frames: usize,
    pub max_pattern_frames: usize,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 3500,
            confidence_threshold: 0.65,
            adaptation_enabled: true,
            silence_timeout_ms: 300,
            validation_timeout_ms: 3000,
            max_pending: 8,
            frame_ms: 20,
            adaptation_interval_ms: 5000, // Follow the room every 5 s
            noise_multiplier: 2.5,        // Threshold sits 2.5x above average energy
            syllable_threshold: 0.4,
            min_pattern_frames: 10, // 200 ms is the shortest plausible phrase
            max_pattern_frames: 30, // 600 ms of contour is enough to match
        }
    }
}

impl WakeWordConfig {
    pub fn validate(&self) -> Result<()> {
        check_energy(self.energy_threshold)?;
        check_confidence(self.confidence_threshold)?;
        if self.frame_ms == 0 {
            return Err(WakeWordError::Configuration("frame_ms is zero".into()));
        }
        if self.max_pending == 0 {
            return Err(WakeWordError::Configuration("max_pending is zero".into()));
        }
        if self.min_pattern_frames < 2 || self.min_pattern_frames > self.max_pattern_frames {
            return Err(WakeWordError::Configuration(format!(
                "pattern frames {}..{} is not a usable range",
                self.min_pattern_frames, self.max_pattern_frames
            )));
        }
        Ok(())
    }
}

fn check_energy(energy: u32) -> Result<()> {
    if (1..32768).contains(&energy) {
        Ok(())
    } else {
        Err(WakeWordError::EnergyThresholdOutOfRange(energy))
    }
}

fn check_confidence(confidence: f32) -> Result<()> {
    if (0.1..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(WakeWordError::ConfidenceThresholdOutOfRange(confidence))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WakeWordState {
    #[default]
    Listening,
    Triggered,
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl From<f32> for ConfidenceLevel {
    fn from(confidence: f32) -> Self {
        if confidence >= 0.86 {
            ConfidenceLevel::VeryHigh
        } else if confidence >= 0.71 {
            ConfidenceLevel::High
        } else if confidence >= 0.41 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

/// Per-frame detector output. `detection_id` is zero while listening.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WakeWordResult {
    pub state: WakeWordState,
    pub confidence: f32,
    pub energy_level: u32,
    /// Correlation with the reference contour, 0..=1000
    pub pattern_score: u32,
    pub syllable_count: u8,
    pub duration_ms: u32,
    pub detection_id: u32,
}

impl WakeWordResult {
    pub fn is_triggered(&self) -> bool {
        self.state == WakeWordState::Triggered
    }

    pub fn level(&self) -> ConfidenceLevel {
        ConfidenceLevel::from(self.confidence)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WakeWordStats {
    pub total_detections: u32,
    pub true_positives: u32,
    pub false_positives: u32,
    pub timed_out: u32,
    pub average_confidence: f32,
    pub current_threshold: u32,
    pub base_threshold: u32,
    pub threshold_adaptations: u32,
    pub pending: u32,
    pub average_validation_ms: u32,
}

impl WakeWordStats {
    /// Share of answered detections the server confirmed.
    pub fn accuracy(&self) -> f32 {
        let answered = self.true_positives + self.false_positives;
        if answered == 0 {
            0.0
        } else {
            self.true_positives as f32 / answered as f32
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingValidation {
    pub detection_id: u32,
    pub emitted_at_ms: u64,
    pub confidence: f32,
}

#[derive(Debug, Default)]
struct Candidate {
    active: bool,
    values: Vec<f32>,
    voiced_len: usize,
    started_ms: u64,
    last_voice_ms: u64,
    peak_energy: f32,
    high_confidence_vad: bool,
}

impl Candidate {
    fn clear(&mut self) {
        self.active = false;
        self.values.clear();
        self.voiced_len = 0;
        self.started_ms = 0;
        self.last_voice_ms = 0;
        self.peak_energy = 0.0;
        self.high_confidence_vad = false;
    }
}

pub struct WakeWordDetector {
    config: WakeWordConfig,
    base_threshold: f32,
    adaptive_threshold: f32,
    history: VecDeque<f32>,
    last_adaptation_ms: u64,
    frames: u64,
    candidate: Candidate,
    resampled: [f32; HEY_HOWDY.len()],
    pending: VecDeque<PendingValidation>,
    expired: Vec<u32>,
    next_detection_id: u32,
    consecutive_rejections: u32,
    state: WakeWordState,
    stats: WakeWordStats,
    confidence_sum: f64,
    validation_ms_total: u64,
}

impl WakeWordDetector {
    pub fn new(config: WakeWordConfig) -> Result<Self> {
        config.validate()?;
        let base = config.energy_threshold as f32;

        info!(
            "🎯 Wake word detector ready: threshold={}, confidence>={:.2}, adaptation={}",
            config.energy_threshold, config.confidence_threshold, config.adaptation_enabled
        );

        Ok(Self {
            base_threshold: base,
            adaptive_threshold: base,
            history: VecDeque::with_capacity(HISTORY_LEN),
            last_adaptation_ms: 0,
            frames: 0,
            candidate: Candidate {
                values: Vec::with_capacity(config.max_pattern_frames),
                ..Default::default()
            },
            resampled: [0.0; HEY_HOWDY.len()],
            pending: VecDeque::with_capacity(config.max_pending),
            expired: Vec::new(),
            next_detection_id: 1,
            consecutive_rejections: 0,
            state: WakeWordState::Listening,
            stats: WakeWordStats {
                base_threshold: config.energy_threshold,
                current_threshold: config.energy_threshold,
                ..Default::default()
            },
            confidence_sum: 0.0,
            validation_ms_total: 0,
            config,
        })
    }

    pub fn config(&self) -> &WakeWordConfig {
        &self.config
    }

    /// Latest lifecycle state: the last trigger or verdict.
    pub fn state(&self) -> WakeWordState {
        self.state
    }

    pub fn adaptive_threshold(&self) -> f32 {
        self.adaptive_threshold
    }

    pub fn base_threshold(&self) -> f32 {
        self.base_threshold
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.config.confidence_threshold
    }

    pub fn stream_time_ms(&self) -> u64 {
        self.frames * self.config.frame_ms as u64
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingValidation> {
        self.pending.iter()
    }

    fn bounds(&self) -> (f32, f32) {
        (self.base_threshold / 3.0, self.base_threshold * 4.0)
    }

    fn clamp_threshold(&mut self) {
        let (lo, hi) = self.bounds();
        self.adaptive_threshold = self.adaptive_threshold.clamp(lo, hi);
        self.stats.current_threshold = self.adaptive_threshold.round() as u32;
    }

    /// Feed one frame together with its VAD verdict.
    pub fn process(&mut self, samples: &[i16], vad: &VadResult) -> WakeWordResult {
        self.frames += 1;
        let now = self.stream_time_ms();

        self.expired = self.expire_pending(now);

        let energy = rms(samples);
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(energy);

        if now.saturating_sub(self.last_adaptation_ms) >= self.config.adaptation_interval_ms as u64 {
            self.adapt_to_noise();
            self.last_adaptation_ms = now;
        }

        let normalized = (energy / (2.0 * self.adaptive_threshold)).min(1.0);
        let mut result = WakeWordResult {
            energy_level: energy.round() as u32,
            ..Default::default()
        };

        if energy > self.adaptive_threshold && vad.voice_detected {
            let candidate = &mut self.candidate;
            if !candidate.active {
                candidate.active = true;
                candidate.started_ms = now;
                debug!("🎯 Candidate opened at {}ms (energy {:.0})", now, energy);
            }
            if candidate.values.len() < self.config.max_pattern_frames {
                candidate.values.push(normalized);
            }
            candidate.voiced_len = candidate.values.len();
            candidate.last_voice_ms = now;
            candidate.peak_energy = candidate.peak_energy.max(energy);
            candidate.high_confidence_vad |= vad.high_confidence;
        } else if self.candidate.active {
            if self.candidate.values.len() < self.config.max_pattern_frames {
                self.candidate.values.push(normalized);
            }
            let silence = now.saturating_sub(self.candidate.last_voice_ms);
            if silence > self.config.silence_timeout_ms as u64 {
                if let Some(triggered) = self.evaluate(now) {
                    result = triggered;
                }
                self.candidate.clear();
            }
        }

        if !result.is_triggered() {
            if let Some(&id) = self.expired.last() {
                result.state = WakeWordState::Rejected;
                result.detection_id = id;
            }
        }
        result
    }

    fn evaluate(&mut self, now: u64) -> Option<WakeWordResult> {
        let segment_len = self.candidate.voiced_len;
        if segment_len < self.config.min_pattern_frames {
            debug!("🎯 Candidate too short ({} frames), discarded", segment_len);
            return None;
        }

        let segment = &self.candidate.values[..segment_len];
        resample_into(segment, &mut self.resampled);
        let correlation = pearson(&self.resampled, &HEY_HOWDY).max(0.0);
        let syllables = count_syllables(segment, self.config.syllable_threshold);

        let mut confidence = correlation;
        confidence *= match syllables {
            3 => 1.2,
            2..=4 => 1.1,
            _ => 0.8,
        };
        if self.candidate.high_confidence_vad {
            confidence *= 1.1;
        }
        let confidence = confidence.min(1.0);

        let duration_ms = (self.candidate.last_voice_ms - self.candidate.started_ms
            + self.config.frame_ms as u64) as u32;

        debug!(
            "🎯 Candidate evaluated: corr={:.3}, syllables={}, confidence={:.3}, {}ms",
            correlation, syllables, confidence, duration_ms
        );

        if confidence < self.config.confidence_threshold {
            return None;
        }

        let detection_id = self.next_detection_id;
        self.next_detection_id = self.next_detection_id.wrapping_add(1).max(1);

        if self.pending.len() >= self.config.max_pending {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(
                    "⚠️ Pending validations full, dropping detection {}",
                    dropped.detection_id
                );
                self.stats.timed_out += 1;
            }
        }
        self.pending.push_back(PendingValidation {
            detection_id,
            emitted_at_ms: now,
            confidence,
        });

        self.state = WakeWordState::Triggered;
        self.stats.total_detections += 1;
        self.confidence_sum += confidence as f64;
        self.stats.average_confidence =
            (self.confidence_sum / self.stats.total_detections as f64) as f32;
        self.stats.pending = self.pending.len() as u32;

        info!(
            "🎯 Wake word triggered: id={}, confidence={:.2} ({:?})",
            detection_id,
            confidence,
            ConfidenceLevel::from(confidence)
        );

        Some(WakeWordResult {
            state: WakeWordState::Triggered,
            confidence,
            energy_level: self.candidate.peak_energy.round() as u32,
            pattern_score: (correlation * 1000.0).round() as u32,
            syllable_count: syllables,
            duration_ms,
            detection_id,
        })
    }

    fn adapt_to_noise(&mut self) {
        if self.history.is_empty() {
            return;
        }
        let average = self.history.iter().sum::<f32>() / self.history.len() as f32;
        let target = average * self.config.noise_multiplier;
        let before = self.adaptive_threshold;
        self.adaptive_threshold = 0.9 * self.adaptive_threshold + 0.1 * target;
        self.clamp_threshold();
        self.stats.threshold_adaptations += 1;
        debug!(
            "🎯 Threshold follows noise: {:.0} -> {:.0} (avg energy {:.0})",
            before, self.adaptive_threshold, average
        );
    }

    /// Expire detections the server never answered. Returns every expired
    /// id, oldest first.
    pub fn expire_pending(&mut self, now_ms: u64) -> Vec<u32> {
        let timeout = self.config.validation_timeout_ms as u64;
        let mut expired = Vec::new();
        while let Some(front) = self.pending.front() {
            if now_ms.saturating_sub(front.emitted_at_ms) < timeout {
                break;
            }
            let id = front.detection_id;
            self.pending.pop_front();
            self.stats.timed_out += 1;
            self.state = WakeWordState::Rejected;
            warn!("⏰ Detection {} not validated within {}ms", id, timeout);
            expired.push(id);
        }
        self.stats.pending = self.pending.len() as u32;
        expired
    }

    /// Ids that expired while handling the latest frame.
    pub fn last_expired(&self) -> &[u32] {
        &self.expired
    }

    /// Apply the server's verdict on a detection. Unknown or already resolved
    /// ids are ignored and return `None`.
    pub fn validate(
        &mut self,
        detection_id: u32,
        validated: bool,
        response_time_ms: Option<u32>,
    ) -> Option<WakeWordState> {
        let index = self
            .pending
            .iter()
            .position(|p| p.detection_id == detection_id);
        let Some(index) = index else {
            debug!("🎯 Validation for unknown detection {} ignored", detection_id);
            return None;
        };
        let pending = self.pending.remove(index)?;
        self.stats.pending = self.pending.len() as u32;

        let elapsed = response_time_ms
            .map(u64::from)
            .unwrap_or_else(|| self.stream_time_ms().saturating_sub(pending.emitted_at_ms));
        self.validation_ms_total += elapsed;

        let state = if validated {
            self.stats.true_positives += 1;
            self.consecutive_rejections = 0;
            if self.config.adaptation_enabled {
                self.adaptive_threshold *= 0.99;
                self.clamp_threshold();
            }
            info!(
                "✅ Detection {} confirmed (threshold {:.0})",
                detection_id, self.adaptive_threshold
            );
            WakeWordState::Confirmed
        } else {
            self.stats.false_positives += 1;
            self.consecutive_rejections += 1;
            if self.config.adaptation_enabled && self.consecutive_rejections >= 2 {
                self.adaptive_threshold *= 1.05;
                self.clamp_threshold();
                self.consecutive_rejections = 0;
            }
            info!(
                "❌ Detection {} rejected (threshold {:.0})",
                detection_id, self.adaptive_threshold
            );
            WakeWordState::Rejected
        };

        let answered = self.stats.true_positives + self.stats.false_positives;
        self.stats.average_validation_ms = (self.validation_ms_total / answered as u64) as u32;
        self.state = state;
        Some(state)
    }

    /// Server-advised thresholds. Both values are checked before either is
    /// applied.
    pub fn update_thresholds(
        &mut self,
        energy_threshold: Option<u32>,
        confidence_threshold: Option<f32>,
    ) -> Result<()> {
        if let Some(energy) = energy_threshold {
            check_energy(energy)?;
        }
        if let Some(confidence) = confidence_threshold {
            check_confidence(confidence)?;
        }

        if let Some(energy) = energy_threshold {
            self.base_threshold = energy as f32;
            self.config.energy_threshold = energy;
            self.stats.base_threshold = energy;
            self.clamp_threshold();
        }
        if let Some(confidence) = confidence_threshold {
            self.config.confidence_threshold = confidence;
        }
        info!(
            "🎯 Thresholds updated: base={:.0}, adaptive={:.0}, confidence={:.2}",
            self.base_threshold, self.adaptive_threshold, self.config.confidence_threshold
        );
        Ok(())
    }

    pub fn stats(&self) -> WakeWordStats {
        self.stats
    }

    /// Drop any half-heard candidate and the energy history. Pending
    /// validations survive.
    pub fn reset(&mut self) {
        self.candidate.clear();
        self.history.clear();
        self.expired.clear();
        self.state = WakeWordState::Listening;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{hey_howdy_clip, sine_frame, silence_frame};
    use crate::vad::{EnhancedVad, VadConfig};

    fn run(
        detector: &mut WakeWordDetector,
        vad: &mut EnhancedVad,
        frames: &[Vec<i16>],
    ) -> Vec<WakeWordResult> {
        frames
            .iter()
            .map(|frame| {
                let v = vad.process(frame);
                detector.process(frame, &v)
            })
            .filter(|r| r.is_triggered())
            .collect()
    }

    fn fixtures() -> (WakeWordDetector, EnhancedVad) {
        (
            WakeWordDetector::new(WakeWordConfig::default()).unwrap(),
            EnhancedVad::new(VadConfig::default()).unwrap(),
        )
    }

    #[test]
    fn test_confidence_levels() {
        assert_eq!(ConfidenceLevel::from(0.2), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from(0.41), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from(0.71), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from(0.86), ConfidenceLevel::VeryHigh);
    }

    #[test]
    fn test_triggers_once_on_canned_phrase() {
        let (mut detector, mut vad) = fixtures();
        let triggers = run(&mut detector, &mut vad, &hey_howdy_clip(50, 30));

        assert_eq!(triggers.len(), 1);
        let hit = triggers[0];
        assert_eq!(hit.detection_id, 1);
        assert!(hit.confidence >= 0.65);
        assert_eq!(hit.syllable_count, 3);
        assert!(hit.pattern_score > 900);
        assert_eq!(hit.duration_ms, 300);
        assert_eq!(detector.state(), WakeWordState::Triggered);
        assert_eq!(detector.pending().count(), 1);
    }

    #[test]
    fn test_short_burst_is_discarded() {
        let (mut detector, mut vad) = fixtures();
        let mut frames: Vec<Vec<i16>> = (0..50).map(|_| silence_frame()).collect();
        frames.extend((0..5).map(|_| sine_frame(6000.0, 400.0)));
        frames.extend((0..30).map(|_| silence_frame()));

        assert!(run(&mut detector, &mut vad, &frames).is_empty());
        assert_eq!(detector.stats().total_detections, 0);
    }

    #[test]
    fn test_flat_tone_does_not_match() {
        let (mut detector, mut vad) = fixtures();
        let mut frames: Vec<Vec<i16>> = (0..50).map(|_| silence_frame()).collect();
        frames.extend((0..15).map(|_| sine_frame(5000.0, 400.0)));
        frames.extend((0..30).map(|_| silence_frame()));

        assert!(run(&mut detector, &mut vad, &frames).is_empty());
    }

    #[test]
    fn test_confirm_lowers_threshold_by_one_percent() {
        let (mut detector, mut vad) = fixtures();
        let id = run(&mut detector, &mut vad, &hey_howdy_clip(50, 30))[0].detection_id;

        let before = detector.adaptive_threshold();
        assert_eq!(detector.validate(id, true, Some(120)), Some(WakeWordState::Confirmed));
        let after = detector.adaptive_threshold();
        assert!((after / before - 0.99).abs() < 1e-5);
        assert_eq!(detector.state(), WakeWordState::Confirmed);

        // A second verdict for the same id is ignored.
        assert_eq!(detector.validate(id, false, None), None);
        assert_eq!(detector.stats().true_positives, 1);
        assert_eq!(detector.stats().false_positives, 0);
    }

    #[test]
    fn test_two_rejections_raise_threshold() {
        let (mut detector, mut vad) = fixtures();
        let clip = hey_howdy_clip(50, 30);
        let first = run(&mut detector, &mut vad, &clip)[0].detection_id;
        let second = run(&mut detector, &mut vad, &hey_howdy_clip(0, 30))[0].detection_id;
        assert_eq!(second, first + 1);

        let start = detector.adaptive_threshold();
        detector.validate(first, false, None);
        assert_eq!(detector.adaptive_threshold(), start);
        detector.validate(second, false, None);
        assert!((detector.adaptive_threshold() / start - 1.05).abs() < 1e-5);
        assert_eq!(detector.stats().false_positives, 2);
    }

    #[test]
    fn test_adaptation_disabled_keeps_threshold() {
        let config = WakeWordConfig {
            adaptation_enabled: false,
            ..Default::default()
        };
        let mut detector = WakeWordDetector::new(config).unwrap();
        let mut vad = EnhancedVad::new(VadConfig::default()).unwrap();
        let id = run(&mut detector, &mut vad, &hey_howdy_clip(50, 30))[0].detection_id;
        detector.validate(id, true, None);
        assert_eq!(detector.adaptive_threshold(), 3500.0);
    }

    #[test]
    fn test_unanswered_detection_times_out() {
        let (mut detector, mut vad) = fixtures();
        let id = run(&mut detector, &mut vad, &hey_howdy_clip(50, 30))[0].detection_id;

        // 3 s of silence at 20 ms per frame.
        let mut expired_at = None;
        for i in 0..160 {
            let frame = silence_frame();
            let v = vad.process(&frame);
            let r = detector.process(&frame, &v);
            if r.state == WakeWordState::Rejected {
                assert_eq!(r.detection_id, id);
                expired_at.get_or_insert(i);
            }
        }
        assert!(expired_at.is_some());

        let stats = detector.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(
            stats.true_positives + stats.false_positives + stats.timed_out,
            stats.total_detections
        );
        // Late verdicts are ignored.
        assert_eq!(detector.validate(id, true, None), None);
    }

    #[test]
    fn test_detections_expiring_together_are_all_reported() {
        let (mut detector, mut vad) = fixtures();
        let first = run(&mut detector, &mut vad, &hey_howdy_clip(50, 30))[0].detection_id;
        let second = run(&mut detector, &mut vad, &hey_howdy_clip(0, 30))[0].detection_id;
        let emitted = detector.pending().map(|p| p.emitted_at_ms).max().unwrap();

        // Jump past both deadlines at once.
        let expired = detector.expire_pending(emitted + 10_000);
        assert_eq!(expired, vec![first, second]);
        assert_eq!(detector.stats().timed_out, 2);
        assert_eq!(detector.pending().count(), 0);
        assert!(detector.expire_pending(emitted + 20_000).is_empty());
    }

    #[test]
    fn test_threshold_follows_noise_within_bounds() {
        let (mut detector, mut vad) = fixtures();
        // A minute of silence drags the threshold to its floor.
        for _ in 0..3000 {
            let frame = silence_frame();
            let v = vad.process(&frame);
            detector.process(&frame, &v);
        }
        assert!((detector.adaptive_threshold() - 3500.0 / 3.0).abs() < 1.0);

        // A minute of loud hum pushes it up but not past base * 4.
        let hum = sine_frame(20000.0, 400.0);
        for _ in 0..3000 {
            let v = vad.process(&hum);
            detector.process(&hum, &v);
        }
        assert!(detector.adaptive_threshold() <= 14000.0);
        assert!(detector.adaptive_threshold() > 10000.0);
        assert!(detector.stats().threshold_adaptations >= 24);
    }

    #[test]
    fn test_update_thresholds_validates_ranges() {
        let (mut detector, _) = fixtures();
        assert_eq!(
            detector.update_thresholds(Some(0), Some(0.5)),
            Err(WakeWordError::EnergyThresholdOutOfRange(0))
        );
        assert_eq!(
            detector.update_thresholds(Some(2000), Some(1.5)),
            Err(WakeWordError::ConfidenceThresholdOutOfRange(1.5))
        );
        // Nothing applied on error.
        assert_eq!(detector.base_threshold(), 3500.0);

        detector.update_thresholds(Some(1000), Some(0.7)).unwrap();
        assert_eq!(detector.base_threshold(), 1000.0);
        // Old adaptive value 3500 re-clamped to base * 4.
        assert_eq!(detector.adaptive_threshold(), 3500.0);
        assert_eq!(detector.confidence_threshold(), 0.7);

        detector.update_thresholds(Some(500), None).unwrap();
        assert_eq!(detector.adaptive_threshold(), 2000.0);
    }
}
