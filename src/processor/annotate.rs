//! Per-frame analysis packed into the optional UDP header extension.

use audio_protocol::{vad_flags, wake_word_flags, HeaderExtension, VadExtension, WakeWordExtension};
use wakeword::{ConfidenceLevel, VadResult, WakeWordResult, WakeWordState};

/// SNR at which detection quality saturates.
const QUALITY_FULL_SCALE_DB: f32 = 30.0;

fn unit_to_byte(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub fn vad_extension(vad: &VadResult) -> VadExtension {
    let mut flags = 0;
    if vad.voice_detected {
        flags |= vad_flags::VOICE_ACTIVE;
    }
    if vad.speech_started {
        flags |= vad_flags::SPEECH_START;
    }
    if vad.speech_ended {
        flags |= vad_flags::SPEECH_END;
    }
    if vad.high_confidence {
        flags |= vad_flags::HIGH_CONFIDENCE;
    }
    if vad.zero_crossing_rate > 0 {
        flags |= vad_flags::SPECTRAL_VALID;
    }

    VadExtension {
        flags,
        confidence: unit_to_byte(vad.confidence),
        detection_quality: unit_to_byte(vad.snr_db / QUALITY_FULL_SCALE_DB),
        max_amplitude: vad.max_amplitude,
        noise_floor: vad.noise_floor.clamp(0.0, u16::MAX as f32) as u16,
        zero_crossing_rate: vad.zero_crossing_rate.min(u16::MAX as u32) as u16,
        snr_db_scaled: (vad.snr_db * 2.0).clamp(0.0, 255.0) as u8,
    }
}

/// VAD block always; the wake word block only while a detection is live.
pub fn header_extension(vad: &VadResult, wake: &WakeWordResult) -> HeaderExtension {
    let vad = vad_extension(vad);
    let mut flags = match wake.state {
        WakeWordState::Listening => return HeaderExtension::Vad(vad),
        WakeWordState::Triggered => wake_word_flags::DETECTED,
        WakeWordState::Confirmed => wake_word_flags::CONFIRMED,
        WakeWordState::Rejected => wake_word_flags::REJECTED,
    };
    if wake.level() >= ConfidenceLevel::High {
        flags |= wake_word_flags::HIGH_CONFIDENCE;
    }

    HeaderExtension::WakeWord {
        vad,
        wake_word: WakeWordExtension {
            detection_id: wake.detection_id,
            flags,
            confidence: unit_to_byte(wake.confidence),
            pattern_match_score: wake.pattern_score.min(1000) as u16,
            syllable_count: wake.syllable_count,
            detection_duration_ms: wake.duration_ms.min(255) as u8,
        },
    }
}
