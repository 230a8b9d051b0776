use thiserror::Error;

pub type Result<T> = std::result::Result<T, EdgeError>;

/// Coarse classification used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotInitialized,
    InvalidState,
    Timeout,
    Io,
    Oversized,
    MalformedMessage,
    NoMemory,
    Underrun,
    Overrun,
    Busy,
}

#[derive(Error, Debug)]
pub enum EdgeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of memory: {0}")]
    NoMemory(String),

    #[error("Underrun")]
    Underrun,

    #[error("Overrun: {0}")]
    Overrun(String),

    #[error("Resource busy: {0}")]
    Busy(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Audio error: {0}")]
    Audio(#[from] audio::AudioError),

    #[error("Wake word error: {0}")]
    WakeWord(#[from] wakeword::WakeWordError),

    #[error("Audio packet error: {0}")]
    Packet(#[from] audio_protocol::ProtocolError),

    #[error("Control channel error: {0}")]
    Control(#[from] control_protocol::ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

impl EdgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EdgeError::InvalidArgument(_) | EdgeError::Config(_) | EdgeError::Toml(_) => {
                ErrorKind::InvalidArgument
            }
            EdgeError::NotInitialized(_) => ErrorKind::NotInitialized,
            EdgeError::InvalidState(_) => ErrorKind::InvalidState,
            EdgeError::Timeout(_) => ErrorKind::Timeout,
            EdgeError::Io(_) | EdgeError::WebSocket(_) | EdgeError::Mdns(_) => ErrorKind::Io,
            EdgeError::NoMemory(_) => ErrorKind::NoMemory,
            EdgeError::Underrun => ErrorKind::Underrun,
            EdgeError::Overrun(_) => ErrorKind::Overrun,
            EdgeError::Busy(_) => ErrorKind::Busy,
            EdgeError::Json(_) => ErrorKind::MalformedMessage,
            EdgeError::Audio(e) => match e {
                audio::AudioError::NotInitialized => ErrorKind::NotInitialized,
                audio::AudioError::NotActive | audio::AudioError::ModeSwitched => {
                    ErrorKind::InvalidState
                }
                audio::AudioError::InvalidArgument(_) => ErrorKind::InvalidArgument,
                audio::AudioError::Device(_)
                | audio::AudioError::Stream(_)
                | audio::AudioError::Io(_) => ErrorKind::Io,
            },
            EdgeError::WakeWord(_) => ErrorKind::InvalidArgument,
            EdgeError::Packet(e) => match e {
                audio_protocol::ProtocolError::Oversized(_) => ErrorKind::Oversized,
                _ => ErrorKind::MalformedMessage,
            },
            EdgeError::Control(e) => match e {
                control_protocol::ProtocolError::Io(_)
                | control_protocol::ProtocolError::WebSocket(_)
                | control_protocol::ProtocolError::Closed => ErrorKind::Io,
                control_protocol::ProtocolError::Url(_) => ErrorKind::InvalidArgument,
                _ => ErrorKind::MalformedMessage,
            },
        }
    }

    /// Failures the caller should shrug off and retry on the next frame.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::NoMemory | ErrorKind::NotInitialized)
    }
}
