use crate::error::Result;
use crate::types::{AudioConfig, AudioMode};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Mic,
    Speaker,
}

/// The hardware seam under [`crate::AudioDevice`].
///
/// Implementations move whole 16-bit samples only. Locking, mode bookkeeping,
/// gain and statistics live in the device; a backend just moves samples.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Route the directions of `mode`. Called with both directions stopped
    /// or with the directions leaving the mode already stopped.
    fn configure(&self, mode: AudioMode, config: &AudioConfig) -> Result<()>;

    fn start(&self, direction: Direction) -> Result<()>;

    fn stop(&self, direction: Direction);

    /// Read up to `buf.len()` samples, blocking at most `timeout`.
    fn read(&self, buf: &mut [i16], timeout: Duration) -> Result<usize>;

    /// Queue up to `buf.len()` samples, blocking at most `timeout` for room.
    /// A short count means back-pressure.
    fn write(&self, buf: &[i16], timeout: Duration) -> Result<usize>;

    /// Drop anything buffered in the given directions.
    fn clear(&self, mic: bool, speaker: bool);
}
