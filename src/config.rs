//! Device configuration: TOML file, `.env`, then `HOWDY_*` overrides.

use crate::error::{EdgeError, Result};
use audio::{AudioConfig, BackendKind, JitterConfig};
use audio_protocol::discovery::{DEFAULT_AUDIO_PORT, DEFAULT_CONTROL_PORT, DEFAULT_DISCOVERY_PORT};
use audio_protocol::MAX_SAMPLES_PER_PACKET;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use wakeword::{VadConfig, WakeWordConfig};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EdgeConfig {
    pub device: DeviceConfig,
    pub audio: AudioConfig,
    pub jitter: JitterConfig,
    pub vad: VadConfig,
    pub wake_word: WakeWordConfig,
    pub udp: UdpConfig,
    pub control: ControlConfig,
    pub tts: TtsConfig,
    pub discovery: DiscoveryConfig,
    pub http: HttpConfig,
    pub processor: ProcessorConfig,
    pub stats: StatsConfig,
    /// Fixed server ("host" or "host:audio_port"); skips discovery
    pub server: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub device_name: String,
    pub room: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "howdy-edge-01".to_string(),
            device_name: "HowdyScreen".to_string(),
            room: "living_room".to_string(),
        }
    }
}

/// UDP audio streamer (outbound mic audio)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UdpConfig {
    pub server_port: u16,
    /// Local port for the audio socket, 0 for any
    pub local_port: u16,
    pub packet_ms: u32,
    pub send_lock_timeout_ms: u64,
    pub socket_timeout_ms: u64,
    pub silence_suppression: bool,
    pub silence_packet_interval_ms: u64,
    /// Prefix each payload with the VAD (and wake word) header extension
    pub enhanced_header: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_AUDIO_PORT,
            local_port: 0,
            packet_ms: 20,              // One mic frame per packet
            send_lock_timeout_ms: 10,   // Never hold up capture longer than this
            socket_timeout_ms: 100,     // Send/recv timeout on the socket
            silence_suppression: false, // Stream every frame by default
            silence_packet_interval_ms: 1000,
            enhanced_header: false,     // Plain 12-byte headers unless the server asks
        }
    }
}

/// Control channel (JSON over WebSocket)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    pub port: u16,
    pub path: String,
    pub keepalive_interval_ms: u64,
    /// Backoff ceiling between reconnect attempts
    pub reconnect_interval_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_reconnect_attempts: u32,
    pub queue_capacity: usize,
    pub connect_timeout_ms: u64,
    /// Poll interval of the connection thread
    pub read_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_CONTROL_PORT,
            path: "/vad_feedback".to_string(),
            keepalive_interval_ms: 10_000, // Ping every 10 s
            reconnect_interval_ms: 5_000,  // Backoff tops out at 5 s
            initial_backoff_ms: 500,
            max_reconnect_attempts: 10,
            queue_capacity: 32,
            connect_timeout_ms: 3_000,
            read_timeout_ms: 20, // One frame
        }
    }
}

/// TTS playback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtsConfig {
    /// Decoded-chunk queue between the control reader and the TTS worker
    pub queue_capacity: usize,
    pub status_interval_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            status_interval_ms: 500, // Status snapshot twice a second
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub port: u16,
    /// Overall discovery window
    pub timeout_ms: u64,
    /// Time between probe rounds (~2 Hz)
    pub interval_ms: u64,
    pub server_ttl_ms: u64,
    /// Netmask used to derive the subnet broadcast address
    pub netmask: String,
    /// Explicit probe targets ("ip:port"); empty means broadcast
    pub targets: Vec<String>,
    pub probe_reachability: bool,
    pub probe_timeout_ms: u64,
    /// Answer server probes with our own identity
    pub advertise: bool,
    /// Also browse for servers and advertise this client over mDNS
    pub mdns: bool,
    /// Service type servers register under
    pub mdns_service_type: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_DISCOVERY_PORT,
            timeout_ms: 30_000,
            interval_ms: 500,
            server_ttl_ms: 30_000,
            netmask: "255.255.255.0".to_string(),
            targets: Vec::new(),
            probe_reachability: true,
            probe_timeout_ms: 1_000,
            advertise: false,
            mdns: false,
            mdns_service_type: "_howdytts._tcp.local.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Conversation state machine timers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessorConfig {
    pub listen_timeout_ms: u64,
    pub max_recording_ms: u64,
    pub end_silence_ms: u64,
    pub processing_timeout_ms: u64,
    pub ui_update_interval_ms: u64,
    /// Frames buffered between capture and the processor
    pub frame_queue: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            listen_timeout_ms: 8_000,      // Back to waiting after 8 s without speech
            max_recording_ms: 30_000,      // Hard cap on one utterance
            end_silence_ms: 800,           // Silence after speech end that closes a turn
            processing_timeout_ms: 15_000, // Give the server 15 s to answer
            ui_update_interval_ms: 16,     // ~60 Hz
            frame_queue: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatsConfig {
    pub publish_interval_ms: u64,
    pub refresh_interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: 10_000,
            refresh_interval_ms: 1_000,
        }
    }
}

impl EdgeConfig {
    /// Load configuration from a TOML file. Missing sections use defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        info!("⚙️ Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `.env` and environment overrides.
    ///
    /// - `HOWDY_SERVER` → server
    /// - `HOWDY_DEVICE_ID` → device.device_id
    /// - `HOWDY_ROOM` → device.room
    /// - `HOWDY_BACKEND` → audio.backend
    /// - `HOWDY_HTTP_PORT` → http.port
    /// - `HOWDY_SILENCE_SUPPRESSION` → udp.silence_suppression
    pub fn with_env_overrides(mut self) -> Result<Self> {
        dotenvy::dotenv().ok();

        if let Some(server) = env_value("HOWDY_SERVER") {
            self.server = Some(server);
        }
        if let Some(device_id) = env_value("HOWDY_DEVICE_ID") {
            self.device.device_id = device_id;
        }
        if let Some(room) = env_value("HOWDY_ROOM") {
            self.device.room = room;
        }
        if let Some(backend) = env_value("HOWDY_BACKEND") {
            self.audio.backend = backend
                .parse::<BackendKind>()
                .map_err(|e| EdgeError::Config(format!("HOWDY_BACKEND: {e}")))?;
        }
        if let Some(port) = env_value("HOWDY_HTTP_PORT") {
            self.http.port = port
                .parse()
                .map_err(|_| EdgeError::Config(format!("HOWDY_HTTP_PORT '{port}' is not a port")))?;
        }
        if let Some(flag) = env_value("HOWDY_SILENCE_SUPPRESSION") {
            self.udp.silence_suppression = matches!(flag.as_str(), "1" | "true" | "yes" | "on");
        }
        debug!("⚙️ Environment overrides applied");
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate != 16000 {
            return Err(EdgeError::Config(format!(
                "sample_rate must be 16000, got {}",
                self.audio.sample_rate
            )));
        }
        let frame = self.audio.frame_samples();
        if frame == 0 || frame > MAX_SAMPLES_PER_PACKET {
            return Err(EdgeError::Config(format!(
                "frame of {frame} samples does not fit one UDP packet"
            )));
        }
        let packet = self.packet_samples();
        if packet == 0 || packet > MAX_SAMPLES_PER_PACKET {
            return Err(EdgeError::Config(format!(
                "packet of {packet} samples does not fit one UDP packet"
            )));
        }
        if self.jitter.min_frames > self.jitter.max_frames {
            return Err(EdgeError::Config(format!(
                "jitter.min_frames {} > jitter.max_frames {}",
                self.jitter.min_frames, self.jitter.max_frames
            )));
        }
        let confidence = self.wake_word.confidence_threshold;
        if !(confidence > 0.0 && confidence <= 1.0) {
            return Err(EdgeError::Config(format!(
                "wake_word.confidence_threshold {confidence} outside (0, 1]"
            )));
        }
        let gate = self.vad.high_confidence_threshold;
        if !(gate > 0.0 && gate <= 1.0) {
            return Err(EdgeError::Config(format!(
                "vad.high_confidence_threshold {gate} outside (0, 1]"
            )));
        }
        if !(0.0..=1.0).contains(&self.audio.speaker_volume) {
            return Err(EdgeError::Config(format!(
                "audio.speaker_volume {} outside [0, 1]",
                self.audio.speaker_volume
            )));
        }
        if self.discovery.mdns && !self.discovery.mdns_service_type.ends_with("._tcp.local.") {
            return Err(EdgeError::Config(format!(
                "discovery.mdns_service_type '{}' is not a _tcp.local. type",
                self.discovery.mdns_service_type
            )));
        }
        self.vad.validate()?;
        self.wake_word.validate()?;
        if let Some(server) = &self.server {
            self.server_endpoint(server)?;
        }
        Ok(())
    }

    pub fn frame_samples(&self) -> usize {
        self.audio.frame_samples()
    }

    pub fn packet_samples(&self) -> usize {
        audio::frame_samples(self.audio.sample_rate, self.udp.packet_ms)
    }

    /// Resolve a `server` string into the audio endpoint.
    pub fn server_endpoint(&self, server: &str) -> Result<SocketAddr> {
        if let Ok(addr) = server.parse::<SocketAddr>() {
            return Ok(addr);
        }
        server
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, self.udp.server_port))
            .map_err(|_| EdgeError::Config(format!("server '{server}' is not an IP address")))
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EdgeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.frame_samples(), 320);
        assert_eq!(config.packet_samples(), 320);
        assert_eq!(config.processor.listen_timeout_ms, 8000);
        assert_eq!(config.control.path, "/vad_feedback");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EdgeConfig::from_toml_str(
            r#"
            server = "192.168.1.20"

            [device]
            device_id = "kitchen-01"

            [udp]
            silence_suppression = true

            [wake_word]
            energy_threshold = 2800
            "#,
        )
        .unwrap();

        assert_eq!(config.device.device_id, "kitchen-01");
        assert_eq!(config.device.room, "living_room");
        assert!(config.udp.silence_suppression);
        assert_eq!(config.udp.silence_packet_interval_ms, 1000);
        assert!(!config.udp.enhanced_header);
        assert_eq!(config.wake_word.energy_threshold, 2800);
        assert_eq!(config.wake_word.confidence_threshold, 0.65);
        assert_eq!(
            config.server_endpoint("192.168.1.20").unwrap(),
            "192.168.1.20:8000".parse().unwrap()
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[http]\nport = 9090").unwrap();
        let config = EdgeConfig::load(file.path()).unwrap();
        assert_eq!(config.http.port, 9090);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EdgeConfig::default();
        config.audio.sample_rate = 48000;
        assert!(config.validate().is_err());

        let mut config = EdgeConfig::default();
        config.audio.frame_ms = 50; // 800 samples
        assert!(config.validate().is_err());

        let mut config = EdgeConfig::default();
        config.jitter.min_frames = 30;
        assert!(config.validate().is_err());

        let mut config = EdgeConfig::default();
        config.wake_word.confidence_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = EdgeConfig::default();
        config.audio.speaker_volume = 1.5;
        assert!(config.validate().is_err());

        let mut config = EdgeConfig::default();
        config.server = Some("not an address".into());
        assert!(config.validate().is_err());

        let mut config = EdgeConfig::default();
        config.discovery.mdns = true;
        config.discovery.mdns_service_type = "_howdytts._udp".into();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("HOWDY_SERVER", "10.0.0.5:9000");
        std::env::set_var("HOWDY_DEVICE_ID", "hall-02");
        std::env::set_var("HOWDY_SILENCE_SUPPRESSION", "true");

        let config = EdgeConfig::default().with_env_overrides().unwrap();
        assert_eq!(config.server.as_deref(), Some("10.0.0.5:9000"));
        assert_eq!(config.device.device_id, "hall-02");
        assert!(config.udp.silence_suppression);

        std::env::remove_var("HOWDY_SERVER");
        std::env::remove_var("HOWDY_DEVICE_ID");
        std::env::remove_var("HOWDY_SILENCE_SUPPRESSION");
    }

    #[test]
    #[serial]
    fn test_bad_backend_override_is_an_error() {
        std::env::set_var("HOWDY_BACKEND", "alsa-direct");
        let result = EdgeConfig::default().with_env_overrides();
        std::env::remove_var("HOWDY_BACKEND");
        assert!(result.is_err());
    }
}
