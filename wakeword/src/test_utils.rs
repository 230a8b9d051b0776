//! Synthetic audio for detector tests
//!
//! Frames are 20 ms at 16 kHz. Tones sit at 400 Hz so every frame holds
//! exactly eight cycles and its RMS equals the requested value.

use crate::FRAME_SAMPLES;

/// Target frame RMS values of a synthetic "hey howdy" with the default
/// energy threshold (3500). Normalized, the contour tracks the reference
/// pattern with three syllable peaks.
pub const HEY_HOWDY_RMS: [f32; 15] = [
    4900.0, 5900.0, 5850.0, 5150.0, 4650.0, 4350.0, 4500.0, 5250.0, 6250.0, 6200.0, 5650.0,
    5900.0, 5350.0, 4700.0, 4200.0,
];

/// One frame of a sine tone with the given RMS.
pub fn sine_frame(rms: f32, frequency: f32) -> Vec<i16> {
    let amplitude = rms * std::f32::consts::SQRT_2;
    (0..FRAME_SAMPLES)
        .map(|i| {
            let t = i as f32 / 16000.0;
            // Small phase offset keeps samples off exact zero.
            let phase = 2.0 * std::f32::consts::PI * frequency * t + 0.1;
            (amplitude * phase.sin()).round().clamp(-32768.0, 32767.0) as i16
        })
        .collect()
}

pub fn silence_frame() -> Vec<i16> {
    vec![0i16; FRAME_SAMPLES]
}

/// Frames of a synthetic "hey howdy" utterance, no surrounding silence.
pub fn hey_howdy_frames() -> Vec<Vec<i16>> {
    HEY_HOWDY_RMS
        .iter()
        .map(|&rms| sine_frame(rms, 400.0))
        .collect()
}

/// Silence, utterance, silence: enough leading frames for the noise floor to
/// settle and enough trailing frames to close the candidate.
pub fn hey_howdy_clip(lead_frames: usize, trail_frames: usize) -> Vec<Vec<i16>> {
    let mut frames = Vec::with_capacity(lead_frames + HEY_HOWDY_RMS.len() + trail_frames);
    frames.extend((0..lead_frames).map(|_| silence_frame()));
    frames.extend(hey_howdy_frames());
    frames.extend((0..trail_frames).map(|_| silence_frame()));
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::rms;

    #[test]
    fn test_sine_frame_rms() {
        for target in [900.0, 4200.0, 6250.0] {
            let frame = sine_frame(target, 400.0);
            assert_eq!(frame.len(), FRAME_SAMPLES);
            assert!((rms(&frame) - target).abs() < 2.0, "{target}");
        }
    }

    #[test]
    fn test_clip_layout() {
        let clip = hey_howdy_clip(50, 30);
        assert_eq!(clip.len(), 95);
        assert!(clip[49].iter().all(|&s| s == 0));
        assert!(rms(&clip[50]) > 4000.0);
        assert!(clip[65].iter().all(|&s| s == 0));
    }
}
