use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Message has no type field")]
    MissingType,

    #[error("Malformed {kind} message: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("Invalid base64 audio: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Connection closed")]
    Closed,
}

impl ProtocolError {
    /// Errors that concern one message only; the connection is still usable.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ProtocolError::Json(_)
                | ProtocolError::MissingType
                | ProtocolError::Malformed { .. }
                | ProtocolError::Base64(_)
        )
    }
}

pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Device → server
// ---------------------------------------------------------------------------

/// Sent once per `Triggered` wake-word detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WakeWordDetection {
    pub detection_id: u32,
    pub device_id: String,
    pub timestamp: u64,
    pub confidence: f32,
    pub energy_level: u32,
    /// Pattern correlation scaled to 0..=1000.
    pub pattern_score: u32,
    pub syllable_count: u8,
    pub duration_ms: u32,
    pub vad_active: bool,
    pub snr_db: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WakeWordStatsReport {
    pub total_detections: u32,
    pub true_positives: u32,
    pub false_positives: u32,
    pub timed_out: u32,
    pub avg_confidence: f32,
    pub current_threshold: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VadStatsReport {
    pub voice_packets: u32,
    pub silence_packets: u32,
    pub avg_confidence: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkStatsReport {
    pub packets_sent: u64,
    pub sequence_errors: u64,
    pub socket_errors: u64,
    pub average_latency_ms: f32,
    pub reconnections: u32,
    pub connection_uptime_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatistics {
    pub device_id: String,
    pub timestamp: u64,
    pub wake_word_stats: WakeWordStatsReport,
    pub vad_stats: VadStatsReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_stats: Option<NetworkStatsReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    pub device_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlaybackStatusInfo {
    pub session_id: String,
    pub playback_state: String,
    pub chunks_received: u32,
    pub chunks_played: u32,
    pub buffer_level_ms: u32,
    pub audio_quality: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlaybackPerformance {
    pub playback_latency_ms: u32,
    pub buffer_underruns: u32,
    pub audio_dropouts: u32,
    pub echo_suppression_db: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TtsPlaybackStatus {
    pub device_id: String,
    pub timestamp: u64,
    pub status_info: PlaybackStatusInfo,
    pub performance: PlaybackPerformance,
}

/// Messages the device sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    WakeWordDetection(WakeWordDetection),
    DeviceStatistics(DeviceStatistics),
    Ping(Ping),
    TtsPlaybackStatus(TtsPlaybackStatus),
}

impl OutboundMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::WakeWordDetection(_) => "wake_word_detection",
            OutboundMessage::DeviceStatistics(_) => "device_statistics",
            OutboundMessage::Ping(_) => "ping",
            OutboundMessage::TtsPlaybackStatus(_) => "tts_playback_status",
        }
    }

    /// Playback status is keyed by `message_type`; everything else by `type`.
    fn type_key(&self) -> &'static str {
        match self {
            OutboundMessage::TtsPlaybackStatus(_) => "message_type",
            _ => "type",
        }
    }

    /// Detections and playback status must never be dropped silently.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            OutboundMessage::WakeWordDetection(_) | OutboundMessage::TtsPlaybackStatus(_)
        )
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let body = match self {
            OutboundMessage::WakeWordDetection(m) => serde_json::to_value(m)?,
            OutboundMessage::DeviceStatistics(m) => serde_json::to_value(m)?,
            OutboundMessage::Ping(m) => serde_json::to_value(m)?,
            OutboundMessage::TtsPlaybackStatus(m) => serde_json::to_value(m)?,
        };
        Ok(with_type(body, self.type_key(), self.type_name()).to_string())
    }

    /// Server-side parser, used by test servers and tooling.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let (kind, value) = split_type(text)?;
        let message = match kind.as_str() {
            "wake_word_detection" => {
                OutboundMessage::WakeWordDetection(typed("wake_word_detection", value)?)
            }
            "device_statistics" => {
                OutboundMessage::DeviceStatistics(typed("device_statistics", value)?)
            }
            "ping" => OutboundMessage::Ping(typed("ping", value)?),
            "tts_playback_status" => {
                OutboundMessage::TtsPlaybackStatus(typed("tts_playback_status", value)?)
            }
            _ => {
                return Err(ProtocolError::Malformed {
                    kind: "outbound",
                    reason: format!("unknown type '{kind}'"),
                })
            }
        };
        Ok(message)
    }
}

// ---------------------------------------------------------------------------
// Server → device
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WakeWordValidation {
    pub detection_id: u32,
    pub validated: bool,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub processing_time_ms: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThresholdUpdate {
    #[serde(default)]
    pub energy_threshold: Option<u32>,
    #[serde(default)]
    pub confidence_threshold: Option<f32>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TtsSessionInfo {
    pub session_id: String,
    #[serde(default)]
    pub response_text: Option<String>,
    #[serde(default)]
    pub estimated_duration_ms: Option<u32>,
    #[serde(default)]
    pub total_chunks_expected: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtsAudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub total_samples: u32,
}

impl Default for TtsAudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000, // The only rate the playback path runs at
            channels: 1,        // Mono
            bits_per_sample: 16,
            total_samples: 0, // Unknown until the session ends
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtsPlaybackConfig {
    pub volume: f32,
    pub fade_in_ms: u32,
    pub fade_out_ms: u32,
    pub interrupt_recording: bool,
    pub echo_cancellation: bool,
}

impl Default for TtsPlaybackConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            fade_in_ms: 0,
            fade_out_ms: 0,
            interrupt_recording: true,
            echo_cancellation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TtsAudioStart {
    pub session_info: TtsSessionInfo,
    #[serde(default)]
    pub audio_format: TtsAudioFormat,
    #[serde(default)]
    pub playback_config: TtsPlaybackConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TtsChunkInfo {
    pub session_id: String,
    #[serde(default)]
    pub chunk_sequence: u32,
    #[serde(default)]
    pub chunk_size: usize,
    #[serde(default)]
    pub is_final: bool,
    pub audio_data: String,
    #[serde(default)]
    pub checksum: Option<String>,
}

impl TtsChunkInfo {
    /// Decode the base64 payload into little-endian samples.
    ///
    /// Both buffers are cleared and refilled, so their capacity is reused
    /// across chunks. Returns the number of samples decoded.
    pub fn decode_audio_into(
        &self,
        bytes: &mut Vec<u8>,
        samples: &mut Vec<i16>,
    ) -> Result<usize, ProtocolError> {
        bytes.clear();
        samples.clear();
        STANDARD.decode_vec(self.audio_data.as_bytes(), bytes)?;

        if bytes.len() % 2 != 0 {
            return Err(ProtocolError::Malformed {
                kind: "tts_audio_chunk",
                reason: format!("odd payload length {}", bytes.len()),
            });
        }

        samples.extend(
            bytes
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        );
        Ok(samples.len())
    }

    pub fn checksum_value(&self) -> Option<u32> {
        self.checksum
            .as_deref()
            .and_then(|hex| u32::from_str_radix(hex.trim_start_matches("0x"), 16).ok())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TtsChunkTiming {
    #[serde(default)]
    pub chunk_start_time_ms: u32,
    #[serde(default)]
    pub chunk_duration_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TtsAudioChunk {
    pub chunk_info: TtsChunkInfo,
    #[serde(default)]
    pub timing: Option<TtsChunkTiming>,
}

impl TtsAudioChunk {
    /// Build a chunk message carrying `samples`, as a server would.
    pub fn from_samples(session_id: &str, chunk_sequence: u32, samples: &[i16], is_final: bool) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Self {
            chunk_info: TtsChunkInfo {
                session_id: session_id.to_string(),
                chunk_sequence,
                chunk_size: bytes.len(),
                is_final,
                audio_data: STANDARD.encode(&bytes),
                checksum: None,
            },
            timing: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TtsSessionSummary {
    pub session_id: String,
    #[serde(default)]
    pub total_chunks_sent: u32,
    #[serde(default)]
    pub total_audio_bytes: u64,
    #[serde(default)]
    pub actual_duration_ms: u32,
    #[serde(default)]
    pub transmission_time_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtsPlaybackActions {
    pub fade_out_ms: Option<u32>,
    pub return_to_listening: bool,
    pub cooldown_period_ms: u32,
}

impl Default for TtsPlaybackActions {
    fn default() -> Self {
        Self {
            fade_out_ms: None,
            return_to_listening: true,
            cooldown_period_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TtsAudioEnd {
    pub session_summary: TtsSessionSummary,
    #[serde(default)]
    pub playback_actions: TtsPlaybackActions,
}

/// Messages the server sends to the device.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    WakeWordValidation(WakeWordValidation),
    ThresholdUpdate(ThresholdUpdate),
    Pong,
    TtsAudioStart(TtsAudioStart),
    TtsAudioChunk(TtsAudioChunk),
    TtsAudioEnd(TtsAudioEnd),
    /// A type we do not know; logged and ignored by the receiver.
    Unknown(String),
}

impl InboundMessage {
    pub fn type_name(&self) -> &str {
        match self {
            InboundMessage::WakeWordValidation(_) => "wake_word_validation",
            InboundMessage::ThresholdUpdate(_) => "threshold_update",
            InboundMessage::Pong => "pong",
            InboundMessage::TtsAudioStart(_) => "tts_audio_start",
            InboundMessage::TtsAudioChunk(_) => "tts_audio_chunk",
            InboundMessage::TtsAudioEnd(_) => "tts_audio_end",
            InboundMessage::Unknown(kind) => kind,
        }
    }

    /// Parse one text frame. Accepts either `type` or `message_type` as the tag.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let (kind, value) = split_type(text)?;
        let message = match kind.as_str() {
            "wake_word_validation" => {
                InboundMessage::WakeWordValidation(typed("wake_word_validation", value)?)
            }
            "threshold_update" => {
                InboundMessage::ThresholdUpdate(typed("threshold_update", value)?)
            }
            "pong" => InboundMessage::Pong,
            "tts_audio_start" => InboundMessage::TtsAudioStart(typed("tts_audio_start", value)?),
            "tts_audio_chunk" => InboundMessage::TtsAudioChunk(typed("tts_audio_chunk", value)?),
            "tts_audio_end" => InboundMessage::TtsAudioEnd(typed("tts_audio_end", value)?),
            _ => InboundMessage::Unknown(kind),
        };
        Ok(message)
    }

    /// Server-side serializer, used by test servers and tooling.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let body = match self {
            InboundMessage::WakeWordValidation(m) => serde_json::to_value(m)?,
            InboundMessage::ThresholdUpdate(m) => serde_json::to_value(m)?,
            InboundMessage::Pong | InboundMessage::Unknown(_) => Value::Object(Default::default()),
            InboundMessage::TtsAudioStart(m) => serde_json::to_value(m)?,
            InboundMessage::TtsAudioChunk(m) => serde_json::to_value(m)?,
            InboundMessage::TtsAudioEnd(m) => serde_json::to_value(m)?,
        };
        Ok(with_type(body, "type", self.type_name()).to_string())
    }
}

fn with_type(body: Value, key: &str, name: &str) -> Value {
    match body {
        Value::Object(fields) => {
            let mut tagged = serde_json::Map::with_capacity(fields.len() + 1);
            tagged.insert(key.to_string(), Value::String(name.to_string()));
            tagged.extend(fields);
            Value::Object(tagged)
        }
        other => other,
    }
}

fn split_type(text: &str) -> Result<(String, Value), ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .or_else(|| value.get("message_type"))
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();
    Ok((kind, value))
}

fn typed<T: DeserializeOwned>(kind: &'static str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        kind,
        reason: e.to_string(),
    })
}
