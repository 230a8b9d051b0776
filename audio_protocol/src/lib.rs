//! # Audio Protocol
//!
//! Wire formats shared between the edge device and the HowdyTTS server.
//!
//! This crate provides:
//! - The packed UDP audio header and payload codec
//! - The optional VAD and wake word header extensions
//! - The discovery strings exchanged over UDP broadcast
//!
//! ## Example Usage
//!
//! ```rust
//! use audio_protocol::{encode_packet, AudioPacket, PacketHeader};
//!
//! # fn main() -> Result<(), audio_protocol::ProtocolError> {
//! let samples = [0i16; 320];
//! let mut datagram = Vec::new();
//! encode_packet(&PacketHeader::pcm16(1, 320, 16000), &samples, &mut datagram)?;
//!
//! let packet = AudioPacket::parse(&datagram)?;
//! assert_eq!(packet.header.sequence, 1);
//! # Ok(())
//! # }
//! ```

pub mod discovery;
pub mod protocol;

// Re-export commonly used types
pub use discovery::{parse_server_response, ServerAnnouncement, DISCOVERY_REQUEST};
pub use protocol::{
    encode_enhanced, encode_packet, encode_raw, vad_flags, wake_word_flags, AudioPacket,
    HeaderExtension, PacketHeader, ProtocolError, VadExtension, WakeWordExtension, HEADER_SIZE,
    MAX_PACKET_SIZE, MAX_SAMPLES_PER_PACKET,
};
