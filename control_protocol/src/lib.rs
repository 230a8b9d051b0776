//! # Control Protocol
//!
//! JSON messages exchanged with the HowdyTTS server over its WebSocket control
//! channel, and a blocking client to carry them.
//!
//! This crate provides:
//! - Typed device → server messages (detections, statistics, playback status)
//! - Typed server → device messages (validation, thresholds, TTS audio)
//! - A polling WebSocket client suited to a dedicated connection thread
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use control_protocol::{ControlClient, InboundMessage, OutboundMessage, Ping};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = ControlClient::connect(
//!     "ws://192.168.1.20:8001/vad_feedback",
//!     Duration::from_secs(3),
//!     Duration::from_millis(50),
//! )?;
//!
//! client.send(&OutboundMessage::Ping(Ping {
//!     device_id: "howdy-01".to_string(),
//!     timestamp: control_protocol::unix_millis(),
//! }))?;
//!
//! while let Some(message) = client.read_message()? {
//!     if let InboundMessage::WakeWordValidation(v) = message {
//!         println!("detection {} validated: {}", v.detection_id, v.validated);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod protocol;

// Re-export commonly used types
pub use client::ControlClient;
pub use protocol::*;
