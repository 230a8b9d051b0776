use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AudioError>;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio device not initialized")]
    NotInitialized,

    #[error("Audio direction not active")]
    NotActive,

    #[error("Audio mode switched during operation")]
    ModeSwitched,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AudioError {
    /// True for errors that leave the device usable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AudioError::NotActive | AudioError::ModeSwitched | AudioError::Io(_)
        )
    }
}
