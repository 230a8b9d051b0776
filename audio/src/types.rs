use serde::{Deserialize, Serialize};

/// Sample rate used on every audio path.
pub const SAMPLE_RATE: u32 = 16000;

/// Canonical frame duration.
pub const FRAME_MS: u32 = 20;

/// Samples in one canonical frame (20 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE * FRAME_MS / 1000) as usize;

pub fn frame_samples(sample_rate: u32, frame_ms: u32) -> usize {
    (sample_rate as u64 * frame_ms as u64 / 1000) as usize
}

pub fn samples_to_ms(samples: usize, sample_rate: u32) -> u32 {
    if sample_rate == 0 {
        return 0;
    }
    (samples as u64 * 1000 / sample_rate as u64) as u32
}

/// Which directions of the device are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    MicOnly,
    SpeakerOnly,
    #[default]
    Duplex,
}

impl AudioMode {
    pub fn has_mic(self) -> bool {
        matches!(self, AudioMode::MicOnly | AudioMode::Duplex)
    }

    pub fn has_speaker(self) -> bool {
        matches!(self, AudioMode::SpeakerOnly | AudioMode::Duplex)
    }
}

/// Which implementation drives the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process queues paced at real time; no hardware needed.
    #[default]
    Loopback,
    /// Default input/output devices through cpal.
    Cpal,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "loopback" => Ok(BackendKind::Loopback),
            "cpal" => Ok(BackendKind::Cpal),
            other => Err(format!("unknown audio backend '{other}'")),
        }
    }
}

/// Audio device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_ms: u32,
    pub mic_gain: f32,
    pub speaker_volume: f32,
    pub mode: AudioMode,
    pub backend: BackendKind,
    /// Speaker-side queue in the device, in frames.
    pub speaker_buffer_frames: usize,
    /// Input device name for the cpal backend (None = default device).
    pub input_device: Option<String>,
    /// Output device name for the cpal backend (None = default device).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE, // Fixed for wire compatibility
            frame_ms: FRAME_MS,       // 320 samples per frame
            mic_gain: 1.0,            // Unity gain after capture
            speaker_volume: 0.7,      // Comfortable default level
            mode: AudioMode::Duplex,
            backend: BackendKind::Loopback,
            speaker_buffer_frames: 4, // 80 ms of device-side queue
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    pub fn frame_samples(&self) -> usize {
        frame_samples(self.sample_rate, self.frame_ms)
    }
}

/// Apply a linear gain in place, saturating at the i16 range.
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples.iter_mut() {
        *sample = (*sample as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}
