//! # Howdy Edge
//!
//! Voice-assistant endpoint core. Captures 16 kHz mono audio, spots the
//! "Hey Howdy" wake word locally, streams speech to a HowdyTTS server over
//! UDP, and plays the server's synthesized answer from a WebSocket control
//! channel.
//!
//! - [`processor`]: per-frame VAD, wake word and conversation state machine
//! - [`streamer`]: UDP audio packetizer
//! - [`control`]: WebSocket control channel with reconnect and send queue
//! - [`tts`]: TTS session playback over a jitter buffer
//! - [`discovery`], [`mdns`] and [`session`]: finding a server and connecting to it
//! - [`http`]: local state-push and status endpoints
//! - [`app`]: threads and wiring

pub mod app;
pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod http;
pub mod mdns;
pub mod processor;
pub mod queue;
pub mod session;
pub mod stats;
pub mod streamer;
pub mod tts;
pub mod ui;

pub use app::EdgeRuntime;
pub use config::EdgeConfig;
pub use error::{EdgeError, ErrorKind, Result};
pub use processor::state::ConversationState;
