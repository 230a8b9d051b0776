use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the packed header that precedes every audio payload.
pub const HEADER_SIZE: usize = 12;

/// Largest datagram we put on the wire (Ethernet MTU minus IP/UDP headers).
pub const MAX_PACKET_SIZE: usize = 1472;

/// Largest number of 16-bit samples that fit in one packet.
pub const MAX_SAMPLES_PER_PACKET: usize = (MAX_PACKET_SIZE - HEADER_SIZE) / 2;

/// Flag bit 0: payload is compressed. Reserved, must be zero on the wire.
pub const FLAG_COMPRESSED: u16 = 0x0001;

/// Version byte of an extension carrying VAD fields only.
pub const EXT_VERSION_VAD: u8 = 0x02;

/// Version byte of an extension carrying VAD and wake word fields.
pub const EXT_VERSION_WAKE_WORD: u8 = 0x03;

/// Bytes the VAD block adds after the basic header.
pub const VAD_EXTENSION_SIZE: usize = 12;

/// Bytes the wake word block adds after the VAD block.
pub const WAKE_WORD_EXTENSION_SIZE: usize = 12;

/// Bits of [`VadExtension::flags`].
pub mod vad_flags {
    pub const VOICE_ACTIVE: u8 = 0x01;
    pub const SPEECH_START: u8 = 0x02;
    pub const SPEECH_END: u8 = 0x04;
    pub const HIGH_CONFIDENCE: u8 = 0x08;
    pub const NOISE_UPDATED: u8 = 0x10;
    pub const SPECTRAL_VALID: u8 = 0x20;
    pub const ADAPTIVE_ACTIVE: u8 = 0x40;
}

/// Bits of [`WakeWordExtension::flags`].
pub mod wake_word_flags {
    pub const DETECTED: u8 = 0x01;
    pub const CONFIRMED: u8 = 0x02;
    pub const REJECTED: u8 = 0x04;
    pub const HIGH_CONFIDENCE: u8 = 0x08;
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Packet too short: {0} bytes")]
    Truncated(usize),

    #[error("Packet of {0} bytes exceeds the {MAX_PACKET_SIZE} byte limit")]
    Oversized(usize),

    #[error("Payload of {payload_len} bytes does not carry {sample_count} samples")]
    LengthMismatch {
        sample_count: u16,
        payload_len: usize,
    },

    #[error("Unsupported packet flags: {0:#06x}")]
    UnsupportedFlags(u16),

    #[error("Unknown header extension version {0:#04x}")]
    UnknownExtension(u8),
}

/// Header of a UDP audio packet.
///
/// Layout (all multi-byte fields little-endian):
///
/// ```text
/// offset size field
///   0     4   sequence
///   4     2   sample_count
///   6     2   sample_rate
///   8     1   channels
///   9     1   bits_per_sample
///  10     2   flags
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    pub sequence: u32,
    pub sample_count: u16,
    pub sample_rate: u16,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub flags: u16,
}

impl PacketHeader {
    /// Header for uncompressed mono 16-bit PCM.
    pub fn pcm16(sequence: u32, sample_count: u16, sample_rate: u16) -> Self {
        Self {
            sequence,
            sample_count,
            sample_rate,
            channels: 1,
            bits_per_sample: 16,
            flags: 0,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.sample_count as usize * 2
    }

    pub fn packet_len(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Serialize the header into its 12-byte wire form.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.sample_count.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.sample_rate.to_le_bytes());
        bytes[8] = self.channels;
        bytes[9] = self.bits_per_sample;
        bytes[10..12].copy_from_slice(&self.flags.to_le_bytes());
        bytes
    }

    /// Parse a header from the front of a datagram.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated(bytes.len()));
        }

        Ok(Self {
            sequence: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            sample_count: u16::from_le_bytes([bytes[4], bytes[5]]),
            sample_rate: u16::from_le_bytes([bytes[6], bytes[7]]),
            channels: bytes[8],
            bits_per_sample: bytes[9],
            flags: u16::from_le_bytes([bytes[10], bytes[11]]),
        })
    }
}

/// Per-frame voice activity summary carried after the basic header.
///
/// Layout (version byte first, multi-byte fields little-endian):
///
/// ```text
/// offset size field
///   0     1   version (0x02, or 0x03 when a wake word block follows)
///   1     1   flags
///   2     1   confidence (0..=255)
///   3     1   detection_quality
///   4     2   max_amplitude
///   6     2   noise_floor
///   8     2   zero_crossing_rate
///  10     1   snr_db_scaled (dB * 2)
///  11     1   reserved
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VadExtension {
    pub flags: u8,
    pub confidence: u8,
    pub detection_quality: u8,
    pub max_amplitude: u16,
    pub noise_floor: u16,
    pub zero_crossing_rate: u16,
    pub snr_db_scaled: u8,
}

impl VadExtension {
    fn write(&self, version: u8, out: &mut Vec<u8>) {
        out.extend_from_slice(&[version, self.flags, self.confidence, self.detection_quality]);
        out.extend_from_slice(&self.max_amplitude.to_le_bytes());
        out.extend_from_slice(&self.noise_floor.to_le_bytes());
        out.extend_from_slice(&self.zero_crossing_rate.to_le_bytes());
        out.extend_from_slice(&[self.snr_db_scaled, 0]);
    }

    fn read(bytes: &[u8]) -> Self {
        Self {
            flags: bytes[1],
            confidence: bytes[2],
            detection_quality: bytes[3],
            max_amplitude: u16::from_le_bytes([bytes[4], bytes[5]]),
            noise_floor: u16::from_le_bytes([bytes[6], bytes[7]]),
            zero_crossing_rate: u16::from_le_bytes([bytes[8], bytes[9]]),
            snr_db_scaled: bytes[10],
        }
    }
}

/// Wake word block that follows the VAD block in version 0x03 headers.
///
/// ```text
/// offset size field
///   0     4   detection_id
///   4     1   flags
///   5     1   confidence (0..=255)
///   6     2   pattern_match_score (0..=1000)
///   8     1   syllable_count
///   9     1   detection_duration_ms (saturated)
///  10     2   reserved
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeWordExtension {
    pub detection_id: u32,
    pub flags: u8,
    pub confidence: u8,
    pub pattern_match_score: u16,
    pub syllable_count: u8,
    pub detection_duration_ms: u8,
}

impl WakeWordExtension {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.detection_id.to_le_bytes());
        out.extend_from_slice(&[self.flags, self.confidence]);
        out.extend_from_slice(&self.pattern_match_score.to_le_bytes());
        out.extend_from_slice(&[self.syllable_count, self.detection_duration_ms, 0, 0]);
    }

    fn read(bytes: &[u8]) -> Self {
        Self {
            detection_id: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            flags: bytes[4],
            confidence: bytes[5],
            pattern_match_score: u16::from_le_bytes([bytes[6], bytes[7]]),
            syllable_count: bytes[8],
            detection_duration_ms: bytes[9],
        }
    }
}

/// Optional block between the basic header and the payload.
///
/// The basic `flags` field is left untouched; receivers tell the forms apart
/// by the bytes left over once `sample_count * 2` payload bytes are accounted
/// for, and by the version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "version", rename_all = "snake_case")]
pub enum HeaderExtension {
    Vad(VadExtension),
    WakeWord {
        vad: VadExtension,
        wake_word: WakeWordExtension,
    },
}

impl HeaderExtension {
    pub fn version(&self) -> u8 {
        match self {
            HeaderExtension::Vad(_) => EXT_VERSION_VAD,
            HeaderExtension::WakeWord { .. } => EXT_VERSION_WAKE_WORD,
        }
    }

    /// Bytes this extension occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            HeaderExtension::Vad(_) => VAD_EXTENSION_SIZE,
            HeaderExtension::WakeWord { .. } => VAD_EXTENSION_SIZE + WAKE_WORD_EXTENSION_SIZE,
        }
    }

    pub fn vad(&self) -> &VadExtension {
        match self {
            HeaderExtension::Vad(vad) | HeaderExtension::WakeWord { vad, .. } => vad,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            HeaderExtension::Vad(vad) => vad.write(EXT_VERSION_VAD, out),
            HeaderExtension::WakeWord { vad, wake_word } => {
                vad.write(EXT_VERSION_WAKE_WORD, out);
                wake_word.write(out);
            }
        }
    }

    /// Parse the bytes between the basic header and the payload.
    fn parse(bytes: &[u8]) -> Result<Option<Self>, ProtocolError> {
        const WAKE_WORD_TOTAL: usize = VAD_EXTENSION_SIZE + WAKE_WORD_EXTENSION_SIZE;
        match (bytes.len(), bytes.first().copied()) {
            (0, _) => Ok(None),
            (VAD_EXTENSION_SIZE, Some(EXT_VERSION_VAD)) => Ok(Some(HeaderExtension::Vad(VadExtension::read(bytes)))),
            (WAKE_WORD_TOTAL, Some(EXT_VERSION_WAKE_WORD)) => Ok(Some(HeaderExtension::WakeWord {
                vad: VadExtension::read(bytes),
                wake_word: WakeWordExtension::read(&bytes[VAD_EXTENSION_SIZE..]),
            })),
            (VAD_EXTENSION_SIZE | WAKE_WORD_TOTAL, Some(version)) => Err(ProtocolError::UnknownExtension(version)),
            (extra, _) => Err(ProtocolError::LengthMismatch {
                sample_count: 0,
                payload_len: extra,
            }),
        }
    }
}

/// Encode a header and its samples into `out`, reusing its capacity.
///
/// Returns the packet length. `out` is cleared first, so callers can keep one
/// buffer for the lifetime of a socket.
pub fn encode_packet(
    header: &PacketHeader,
    samples: &[i16],
    out: &mut Vec<u8>,
) -> Result<usize, ProtocolError> {
    check_outbound(header, 0, samples.len() * 2)?;

    out.clear();
    out.extend_from_slice(&header.to_bytes());
    push_samples(samples, out);

    Ok(out.len())
}

/// Encode a header, an extension block and the samples into `out`.
pub fn encode_enhanced(
    header: &PacketHeader,
    extension: &HeaderExtension,
    samples: &[i16],
    out: &mut Vec<u8>,
) -> Result<usize, ProtocolError> {
    check_outbound(header, extension.wire_len(), samples.len() * 2)?;

    out.clear();
    out.extend_from_slice(&header.to_bytes());
    extension.write(out);
    push_samples(samples, out);

    Ok(out.len())
}

fn push_samples(samples: &[i16], out: &mut Vec<u8>) {
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
}

/// Encode a header followed by an already little-endian payload.
pub fn encode_raw(
    header: &PacketHeader,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> Result<usize, ProtocolError> {
    check_outbound(header, 0, payload.len())?;

    out.clear();
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);

    Ok(out.len())
}

fn check_outbound(header: &PacketHeader, extension_len: usize, payload_len: usize) -> Result<(), ProtocolError> {
    let total = HEADER_SIZE + extension_len + payload_len;
    if total > MAX_PACKET_SIZE {
        return Err(ProtocolError::Oversized(total));
    }
    if header.payload_len() != payload_len {
        return Err(ProtocolError::LengthMismatch {
            sample_count: header.sample_count,
            payload_len,
        });
    }
    if header.is_compressed() {
        return Err(ProtocolError::UnsupportedFlags(header.flags));
    }
    Ok(())
}

/// A received datagram, validated and borrowed.
#[derive(Debug, Clone, Copy)]
pub struct AudioPacket<'a> {
    pub header: PacketHeader,
    pub extension: Option<HeaderExtension>,
    payload: &'a [u8],
}

impl<'a> AudioPacket<'a> {
    /// Validate a datagram: header present, an optional extension block, and
    /// exactly `sample_count * 2` payload bytes.
    pub fn parse(datagram: &'a [u8]) -> Result<Self, ProtocolError> {
        if datagram.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::Oversized(datagram.len()));
        }

        let header = PacketHeader::from_bytes(datagram)?;
        let rest = &datagram[HEADER_SIZE..];
        let mismatch = ProtocolError::LengthMismatch {
            sample_count: header.sample_count,
            payload_len: rest.len(),
        };

        if rest.len() < header.payload_len() {
            return Err(mismatch);
        }
        let (extension, payload) = rest.split_at(rest.len() - header.payload_len());
        let extension = match HeaderExtension::parse(extension) {
            Err(ProtocolError::LengthMismatch { .. }) => return Err(mismatch),
            other => other?,
        };

        Ok(Self {
            header,
            extension,
            payload,
        })
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn samples(&self) -> impl Iterator<Item = i16> + 'a {
        self.payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }

    /// Copy samples into `out`, returning how many were written.
    pub fn copy_samples(&self, out: &mut [i16]) -> usize {
        let mut written = 0;
        for (slot, sample) in out.iter_mut().zip(self.samples()) {
            *slot = sample;
            written += 1;
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_wire_layout() {
        let header = PacketHeader {
            sequence: 0x0403_0201,
            sample_count: 320,
            sample_rate: 16000,
            channels: 1,
            bits_per_sample: 16,
            flags: 0,
        };

        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..6], &320u16.to_le_bytes());
        assert_eq!(&bytes[6..8], &16000u16.to_le_bytes());
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes[9], 16);
        assert_eq!(&bytes[10..12], &[0, 0]);
    }

    #[test]
    fn test_canonical_frame_is_652_bytes() {
        let samples = vec![123i16; 320];
        let mut out = Vec::with_capacity(MAX_PACKET_SIZE);
        let len = encode_packet(&PacketHeader::pcm16(7, 320, 16000), &samples, &mut out).unwrap();

        assert_eq!(len, 652);
        assert_eq!(out.len(), 652);
    }

    #[test]
    fn test_round_trip_preserves_extremes() {
        let samples: Vec<i16> = vec![i16::MIN, -1, 0, 1, i16::MAX];
        let header = PacketHeader::pcm16(u32::MAX, samples.len() as u16, 16000);
        let mut out = Vec::new();
        encode_packet(&header, &samples, &mut out).unwrap();

        let packet = AudioPacket::parse(&out).unwrap();
        assert_eq!(packet.header, header);
        assert_eq!(packet.samples().collect::<Vec<_>>(), samples);
    }

    #[test]
    fn test_largest_packet_fits() {
        let samples = vec![0i16; MAX_SAMPLES_PER_PACKET];
        let header = PacketHeader::pcm16(0, MAX_SAMPLES_PER_PACKET as u16, 16000);
        let mut out = Vec::new();

        assert_eq!(MAX_SAMPLES_PER_PACKET, 730);
        assert_eq!(encode_packet(&header, &samples, &mut out).unwrap(), MAX_PACKET_SIZE);
    }

    fn sample_vad() -> VadExtension {
        VadExtension {
            flags: vad_flags::VOICE_ACTIVE | vad_flags::SPEECH_START,
            confidence: 204,
            detection_quality: 180,
            max_amplitude: 12_000,
            noise_floor: 350,
            zero_crossing_rate: 41,
            snr_db_scaled: 36,
        }
    }

    #[test]
    fn test_vad_extension_round_trip() {
        let samples = vec![-7i16; 320];
        let header = PacketHeader::pcm16(9, 320, 16000);
        let extension = HeaderExtension::Vad(sample_vad());
        let mut out = Vec::new();

        let len = encode_enhanced(&header, &extension, &samples, &mut out).unwrap();
        assert_eq!(len, HEADER_SIZE + VAD_EXTENSION_SIZE + 640);
        assert_eq!(out[HEADER_SIZE], EXT_VERSION_VAD);
        assert_eq!(&out[HEADER_SIZE + 4..HEADER_SIZE + 6], &12_000u16.to_le_bytes());
        assert_eq!(out[HEADER_SIZE + 11], 0);

        let packet = AudioPacket::parse(&out).unwrap();
        assert_eq!(packet.header, header);
        assert_eq!(packet.extension, Some(extension));
        assert_eq!(packet.samples().collect::<Vec<_>>(), samples);
    }

    #[test]
    fn test_wake_word_extension_round_trip() {
        let samples = vec![3i16; 320];
        let header = PacketHeader::pcm16(10, 320, 16000);
        let extension = HeaderExtension::WakeWord {
            vad: sample_vad(),
            wake_word: WakeWordExtension {
                detection_id: 0x0102_0304,
                flags: wake_word_flags::DETECTED | wake_word_flags::HIGH_CONFIDENCE,
                confidence: 230,
                pattern_match_score: 870,
                syllable_count: 2,
                detection_duration_ms: 255,
            },
        };
        let mut out = Vec::new();

        let len = encode_enhanced(&header, &extension, &samples, &mut out).unwrap();
        assert_eq!(len, 36 + 640);
        assert_eq!(out[HEADER_SIZE], EXT_VERSION_WAKE_WORD);
        assert_eq!(&out[24..28], &[0x04, 0x03, 0x02, 0x01]);

        let packet = AudioPacket::parse(&out).unwrap();
        assert_eq!(packet.extension, Some(extension));
        assert_eq!(packet.extension.map(|e| e.version()), Some(EXT_VERSION_WAKE_WORD));
        assert_eq!(packet.samples().collect::<Vec<_>>(), samples);
    }

    #[test]
    fn test_largest_enhanced_packet_fits() {
        let extension = HeaderExtension::WakeWord {
            vad: VadExtension::default(),
            wake_word: WakeWordExtension::default(),
        };
        let fits = (MAX_PACKET_SIZE - HEADER_SIZE - extension.wire_len()) / 2;
        let mut out = Vec::new();

        let header = PacketHeader::pcm16(0, fits as u16, 16000);
        assert_eq!(
            encode_enhanced(&header, &extension, &vec![0i16; fits], &mut out).unwrap(),
            MAX_PACKET_SIZE
        );

        let header = PacketHeader::pcm16(0, fits as u16 + 1, 16000);
        assert!(matches!(
            encode_enhanced(&header, &extension, &vec![0i16; fits + 1], &mut out),
            Err(ProtocolError::Oversized(_))
        ));
    }

    #[test]
    fn test_plain_packet_has_no_extension() {
        let mut out = Vec::new();
        encode_packet(&PacketHeader::pcm16(1, 4, 16000), &[1, 2, 3, 4], &mut out).unwrap();
        assert_eq!(AudioPacket::parse(&out).unwrap().extension, None);
    }

    #[test]
    fn test_unknown_extension_version_rejected() {
        let mut out = Vec::new();
        encode_enhanced(
            &PacketHeader::pcm16(1, 4, 16000),
            &HeaderExtension::Vad(sample_vad()),
            &[0; 4],
            &mut out,
        )
        .unwrap();
        out[HEADER_SIZE] = 0x07;

        assert_eq!(
            AudioPacket::parse(&out).unwrap_err(),
            ProtocolError::UnknownExtension(0x07)
        );
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let samples = vec![0i16; MAX_SAMPLES_PER_PACKET + 1];
        let header = PacketHeader::pcm16(0, samples.len() as u16, 16000);
        let mut out = Vec::new();

        assert_eq!(
            encode_packet(&header, &samples, &mut out),
            Err(ProtocolError::Oversized(HEADER_SIZE + samples.len() * 2))
        );
    }

    #[test]
    fn test_mismatched_sample_count_rejected() {
        let header = PacketHeader::pcm16(0, 10, 16000);
        let mut out = Vec::new();
        assert!(matches!(
            encode_packet(&header, &[0i16; 9], &mut out),
            Err(ProtocolError::LengthMismatch { .. })
        ));

        let mut datagram = header.to_bytes().to_vec();
        datagram.extend_from_slice(&[0u8; 19]);
        assert!(matches!(
            AudioPacket::parse(&datagram),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert_eq!(
            AudioPacket::parse(&[1, 2, 3]).unwrap_err(),
            ProtocolError::Truncated(3)
        );
    }

    #[test]
    fn test_compressed_flag_reserved() {
        let mut header = PacketHeader::pcm16(0, 1, 16000);
        header.flags = FLAG_COMPRESSED;
        let mut out = Vec::new();

        assert_eq!(
            encode_raw(&header, &[0, 0], &mut out),
            Err(ProtocolError::UnsupportedFlags(FLAG_COMPRESSED))
        );
    }

    #[test]
    fn test_header_serializes_for_diagnostics() {
        let header = PacketHeader::pcm16(3, 320, 16000);
        let json = serde_json::to_value(header).unwrap();
        assert_eq!(json["sequence"], 3);
        assert_eq!(json["bits_per_sample"], 16);
    }
}
