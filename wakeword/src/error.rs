//! Error types for wake-word and VAD processing

use thiserror::Error;

/// Result type alias for detector operations
pub type Result<T> = std::result::Result<T, WakeWordError>;

#[derive(Error, Debug, PartialEq)]
pub enum WakeWordError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Energy threshold {0} outside 1..32768")]
    EnergyThresholdOutOfRange(u32),

    #[error("Confidence threshold {0} outside 0.1..=1.0")]
    ConfidenceThresholdOutOfRange(f32),
}
