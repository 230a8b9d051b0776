use crate::error::{Result, WakeWordError};
use crate::pattern::rms;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Configuration for Voice Activity Detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Sample rate of incoming frames
    pub sample_rate: u32,
    /// Reference amplitude; a quarter of it is the lowest energy gate
    pub amplitude_threshold: f32,
    /// Initial noise floor as a fraction of `amplitude_threshold`
    pub initial_noise_ratio: f32,
    /// Noise floor EMA rate over silent frames
    pub noise_floor_alpha: f32,
    /// Energy must exceed the noise floor by this factor
    pub energy_multiplier: f32,
    /// Voice decision SNR gate (dB)
    pub snr_threshold_db: f32,
    /// Voiced run needed to report speech start (ms)
    pub min_voice_ms: u32,
    /// Silent run needed to report speech end (ms)
    pub min_silence_ms: u32,
    /// Zero crossings per frame considered speech-like
    pub zcr_min: u32,
    pub zcr_max: u32,
    /// Confidence at or above which a frame is high quality
    pub high_confidence_threshold: f32,
    /// Extra SNR required while TTS plays with echo cancellation (dB)
    pub echo_suppression_db: f32,
    pub idle_multiplier: f32,
    pub listening_multiplier: f32,
    pub speaking_multiplier: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            amplitude_threshold: 2000.0, // Floor of 500 on the energy gate
            initial_noise_ratio: 0.3,    // Start the floor at 600
            noise_floor_alpha: 0.05,     // 5% per silent frame
            energy_multiplier: 3.0,      // ~9.5 dB over the floor
            snr_threshold_db: 8.0,       // 8 dB SNR gate
            min_voice_ms: 200,           // 10 frames of voice to start
            min_silence_ms: 300,         // 15 frames of silence to end
            zcr_min: 5,
            zcr_max: 200,
            high_confidence_threshold: 0.8,
            echo_suppression_db: 15.0,
            idle_multiplier: 0.8,      // More sensitive while waiting for the wake word
            listening_multiplier: 1.0, // Normal sensitivity
            speaking_multiplier: 1.5,  // Less sensitive while TTS plays
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(WakeWordError::Configuration("VAD sample rate is zero".into()));
        }
        if !(0.0..=1.0).contains(&self.noise_floor_alpha) {
            return Err(WakeWordError::Configuration(format!(
                "noise_floor_alpha {} outside 0..1",
                self.noise_floor_alpha
            )));
        }
        if self.zcr_min > self.zcr_max {
            return Err(WakeWordError::Configuration(format!(
                "zcr band {}..{} is empty",
                self.zcr_min, self.zcr_max
            )));
        }
        Ok(())
    }
}

/// What the rest of the device is doing, as far as the VAD cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationContext {
    #[default]
    Idle,
    Listening,
    Speaking,
}

/// Per-frame VAD output
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VadResult {
    /// Raw decision for this frame.
    pub voice_detected: bool,
    pub confidence: f32,
    pub noise_floor: f32,
    pub rms: f32,
    pub max_amplitude: u16,
    pub zero_crossing_rate: u32,
    pub snr_db: f32,
    /// The voiced run just became long enough to count as speech.
    pub speech_started: bool,
    /// The silent run just became long enough to end speech.
    pub speech_ended: bool,
    pub high_confidence: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VadStats {
    pub frames_processed: u64,
    pub voice_frames: u64,
    pub silence_frames: u64,
    pub detection_count: u64,
    pub average_confidence: f32,
    pub current_noise_floor: f32,
    pub min_noise_floor: f32,
    pub max_noise_floor: f32,
    pub adaptations: u64,
    pub average_processing_us: u32,
    pub max_processing_us: u32,
}

/// Energy/SNR/zero-crossing voice detector with hysteresis.
pub struct EnhancedVad {
    config: VadConfig,
    noise_floor: f32,
    previous_voice: bool,
    in_speech: bool,
    voice_run: u32,
    silence_run: u32,
    context: ConversationContext,
    echo_cancellation: bool,
    stats: VadStats,
    confidence_sum: f64,
    processing_us_total: u64,
}

impl EnhancedVad {
    pub fn new(config: VadConfig) -> Result<Self> {
        config.validate()?;
        let noise_floor = config.amplitude_threshold * config.initial_noise_ratio;

        info!(
            "🎤 VAD initialized: snr_gate={}dB, start={}ms, end={}ms",
            config.snr_threshold_db, config.min_voice_ms, config.min_silence_ms
        );

        Ok(Self {
            noise_floor,
            previous_voice: false,
            in_speech: false,
            voice_run: 0,
            silence_run: 0,
            context: ConversationContext::Idle,
            echo_cancellation: false,
            stats: VadStats {
                current_noise_floor: noise_floor,
                min_noise_floor: noise_floor,
                max_noise_floor: noise_floor,
                ..Default::default()
            },
            confidence_sum: 0.0,
            processing_us_total: 0,
            config,
        })
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    pub fn is_speaking(&self) -> bool {
        self.in_speech
    }

    pub fn context(&self) -> ConversationContext {
        self.context
    }

    pub fn set_conversation_state(&mut self, context: ConversationContext) {
        if self.context != context {
            debug!("🎤 VAD context {:?} -> {:?}", self.context, context);
            self.context = context;
        }
    }

    /// Raise the SNR gate while TTS plays through the speaker.
    pub fn set_echo_cancellation(&mut self, active: bool) {
        self.echo_cancellation = active;
    }

    pub fn set_snr_threshold(&mut self, snr_db: f32) {
        self.config.snr_threshold_db = snr_db;
    }

    fn context_multiplier(&self) -> f32 {
        match self.context {
            ConversationContext::Idle => self.config.idle_multiplier,
            ConversationContext::Listening => self.config.listening_multiplier,
            ConversationContext::Speaking => self.config.speaking_multiplier,
        }
    }

    /// Current energy gate, including the conversation multiplier.
    pub fn energy_gate(&self) -> f32 {
        let floor_gate = self.noise_floor * self.config.energy_multiplier;
        floor_gate.max(self.config.amplitude_threshold / 4.0) * self.context_multiplier()
    }

    fn snr_gate(&self) -> f32 {
        if self.echo_cancellation && self.context == ConversationContext::Speaking {
            self.config.snr_threshold_db + self.config.echo_suppression_db
        } else {
            self.config.snr_threshold_db
        }
    }

    fn frame_ms(&self, samples: usize) -> u32 {
        (samples as u64 * 1000 / self.config.sample_rate as u64) as u32
    }

    pub fn process(&mut self, samples: &[i16]) -> VadResult {
        let started = Instant::now();

        let energy = rms(samples);
        let max_amplitude = samples
            .iter()
            .map(|s| s.unsigned_abs())
            .max()
            .unwrap_or(0)
            .min(i16::MAX as u16);
        let zcr = zero_crossings(samples);

        // Only frames the previous decision called silent feed the floor.
        if !self.previous_voice {
            let alpha = self.config.noise_floor_alpha;
            self.noise_floor = alpha * energy + (1.0 - alpha) * self.noise_floor;
            self.stats.adaptations += 1;
        }

        let snr_db = 20.0 * (energy.max(1.0) / self.noise_floor.max(1.0)).log10();
        let gate = self.energy_gate();
        let snr_gate = self.snr_gate();
        let spectral_ok = zcr >= self.config.zcr_min && zcr <= self.config.zcr_max;

        let voice = energy > gate && snr_db > snr_gate && spectral_ok;

        let snr_score = (snr_db / (snr_gate + 20.0)).clamp(0.0, 1.0);
        let margin_score = ((energy / gate.max(1.0) - 1.0) / 3.0).clamp(0.0, 1.0);
        let spectral_score = if spectral_ok { 1.0 } else { 0.0 };
        let confidence = (0.5 * snr_score + 0.3 * margin_score + 0.2 * spectral_score).clamp(0.0, 1.0);

        let frame_ms = self.frame_ms(samples.len());
        let mut speech_started = false;
        let mut speech_ended = false;

        if voice {
            self.voice_run = self.voice_run.saturating_add(1);
            self.silence_run = 0;
            if !self.in_speech && self.voice_run * frame_ms >= self.config.min_voice_ms {
                self.in_speech = true;
                speech_started = true;
                self.stats.detection_count += 1;
                debug!(
                    "🗣️ Speech started: rms={:.0}, snr={:.1}dB, conf={:.2}",
                    energy, snr_db, confidence
                );
            }
        } else {
            self.silence_run = self.silence_run.saturating_add(1);
            self.voice_run = 0;
            if self.in_speech && self.silence_run * frame_ms >= self.config.min_silence_ms {
                self.in_speech = false;
                speech_ended = true;
                debug!("🤫 Speech ended after {}ms of silence", self.silence_run * frame_ms);
            }
        }
        self.previous_voice = voice;

        let result = VadResult {
            voice_detected: voice,
            confidence,
            noise_floor: self.noise_floor,
            rms: energy,
            max_amplitude,
            zero_crossing_rate: zcr,
            snr_db,
            speech_started,
            speech_ended,
            high_confidence: confidence >= self.config.high_confidence_threshold,
        };

        self.record(&result, started.elapsed().as_micros() as u64);
        trace!(
            "🎤 VAD: voice={} conf={:.2} rms={:.0} floor={:.0} zcr={}",
            voice,
            confidence,
            energy,
            self.noise_floor,
            zcr
        );
        result
    }

    fn record(&mut self, result: &VadResult, processing_us: u64) {
        let stats = &mut self.stats;
        stats.frames_processed += 1;
        if result.voice_detected {
            stats.voice_frames += 1;
        } else {
            stats.silence_frames += 1;
        }
        self.confidence_sum += result.confidence as f64;
        stats.average_confidence = (self.confidence_sum / stats.frames_processed as f64) as f32;
        stats.current_noise_floor = self.noise_floor;
        stats.min_noise_floor = stats.min_noise_floor.min(self.noise_floor);
        stats.max_noise_floor = stats.max_noise_floor.max(self.noise_floor);

        self.processing_us_total += processing_us;
        stats.average_processing_us = (self.processing_us_total / stats.frames_processed) as u32;
        stats.max_processing_us = stats.max_processing_us.max(processing_us as u32);
    }

    pub fn stats(&self) -> VadStats {
        self.stats
    }

    /// Forget speech state and the learned floor.
    pub fn reset(&mut self) {
        self.noise_floor = self.config.amplitude_threshold * self.config.initial_noise_ratio;
        self.previous_voice = false;
        self.in_speech = false;
        self.voice_run = 0;
        self.silence_run = 0;
    }
}

fn zero_crossings(samples: &[i16]) -> u32 {
    samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0) != (pair[1] >= 0))
        .count() as u32
}
