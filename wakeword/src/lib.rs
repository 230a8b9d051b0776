// Copyright 2024 - HowdyTTS Edge Rust Port
// Licensed under the Apache License, Version 2.0

//! # Howdy Wake Word
//!
//! Lightweight voice activity and wake word detection for 16 kHz mono PCM in
//! 20 ms frames. No models, no allocation per frame: the VAD classifies each
//! frame from energy, SNR and zero crossings, and the wake word detector
//! matches the energy contour of "hey howdy" against a reference pattern.
//!
//! ```
//! use wakeword::{EnhancedVad, VadConfig, WakeWordConfig, WakeWordDetector};
//!
//! let mut vad = EnhancedVad::new(VadConfig::default()).unwrap();
//! let mut detector = WakeWordDetector::new(WakeWordConfig::default()).unwrap();
//!
//! let frame = [0i16; wakeword::FRAME_SAMPLES];
//! let voice = vad.process(&frame);
//! let wake = detector.process(&frame, &voice);
//! assert!(!wake.is_triggered());
//! ```

pub mod detector;
pub mod error;
pub mod pattern;
pub mod vad;

pub mod test_utils;

pub use detector::{
    ConfidenceLevel, PendingValidation, WakeWordConfig, WakeWordDetector, WakeWordResult,
    WakeWordState, WakeWordStats,
};
pub use error::*;
pub use vad::{ConversationContext, EnhancedVad, VadConfig, VadResult, VadStats};

/// Samples per 20 ms frame at 16 kHz
pub const FRAME_SAMPLES: usize = 320;
