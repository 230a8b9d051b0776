//! # Audio
//!
//! The device side of the audio pipeline:
//! - [`AudioDevice`]: full-duplex 16 kHz PCM with mode switching, gain and
//!   counters, over a pluggable [`AudioBackend`]
//! - [`LoopbackBackend`]: in-process backend for tests and hardware-less runs
//! - `CpalBackend` (feature `cpal`): default input/output devices
//! - [`JitterBuffer`]: fixed-frame playout ring for TTS audio

pub mod backend;
#[cfg(feature = "cpal")]
pub mod cpal_backend;
pub mod device;
pub mod error;
pub mod jitter;
pub mod loopback;
mod ring;
pub mod types;

pub use backend::{AudioBackend, Direction};
#[cfg(feature = "cpal")]
pub use cpal_backend::CpalBackend;
pub use device::{AudioDevice, DeviceStats};
pub use error::{AudioError, Result};
pub use jitter::{JitterBuffer, JitterConfig, JitterStats};
pub use loopback::{LoopbackBackend, LoopbackConfig, LoopbackHandle};
pub use types::*;

/// Build the backend a config asks for.
pub fn backend_for(kind: BackendKind) -> Result<(Box<dyn AudioBackend>, Option<LoopbackHandle>)> {
    match kind {
        BackendKind::Loopback => {
            let (backend, handle) = LoopbackBackend::paced();
            Ok((Box::new(backend), Some(handle)))
        }
        #[cfg(feature = "cpal")]
        BackendKind::Cpal => Ok((Box::new(CpalBackend::new()), None)),
        #[cfg(not(feature = "cpal"))]
        BackendKind::Cpal => Err(AudioError::Device(
            "built without the `cpal` feature".to_string(),
        )),
    }
}
