//! Tying a chosen server to the audio and control paths.

use crate::config::EdgeConfig;
use crate::control::ControlChannel;
use crate::discovery::{DiscoveredServer, ServerDiscovery, ServerRegistry};
use crate::error::Result;
use crate::streamer::UdpAudioStreamer;
use crate::ui::UiSurface;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const REDISCOVERY_DELAY: Duration = Duration::from_secs(5);

pub struct SessionManager {
    control_path: String,
    streamer: Arc<UdpAudioStreamer>,
    control: Arc<ControlChannel>,
    ui: Arc<dyn UiSurface>,
    registry: Arc<ServerRegistry>,
    current: Mutex<Option<DiscoveredServer>>,
}

impl SessionManager {
    pub fn new(
        config: &EdgeConfig,
        streamer: Arc<UdpAudioStreamer>,
        control: Arc<ControlChannel>,
        ui: Arc<dyn UiSurface>,
        registry: Arc<ServerRegistry>,
    ) -> Self {
        Self {
            control_path: config.control.path.clone(),
            streamer,
            control,
            ui,
            registry,
            current: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn current(&self) -> Option<DiscoveredServer> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Point the audio stream and the control channel at `server`.
    pub fn establish(&self, server: &DiscoveredServer) -> Result<()> {
        let url = control_url(server, &self.control_path);
        self.streamer.set_server(server.ip, server.audio_port);
        self.control.set_url(url.clone());
        self.ui.set_server_info(&server.display_name(), "udp+ws");
        info!(
            "🤝 Session with {} (audio {}, control {})",
            server.display_name(),
            server.audio_addr(),
            url
        );
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(server.clone());
        Ok(())
    }

    /// Establish with a fixed address, bypassing discovery.
    pub fn establish_static(&self, audio: SocketAddr, control_port: u16) -> Result<()> {
        let server = DiscoveredServer {
            ip: audio.ip(),
            hostname: None,
            audio_port: audio.port(),
            control_port,
            reachable: None,
            responses: 0,
            last_seen: Instant::now(),
        };
        self.registry
            .upsert(server.ip, None, server.audio_port, server.control_port);
        self.establish(&server)
    }

    /// Run discovery until a server is found, establish with it, then idle
    /// until `stop`.
    pub fn spawn_discovery(
        self: &Arc<Self>,
        discovery: ServerDiscovery,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let manager = Arc::clone(self);
        thread::Builder::new()
            .name("discovery".to_string())
            .spawn(move || manager.discover_loop(discovery, stop))
    }

    fn discover_loop(&self, discovery: ServerDiscovery, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Acquire) {
            match discovery.run() {
                Ok(Some(server)) => {
                    if let Err(e) = self.establish(&server) {
                        warn!("⚠️ Session setup with {} failed: {}", server.ip, e);
                    } else {
                        break;
                    }
                }
                Ok(None) => {
                    self.ui.show_error(
                        "discovery",
                        "no server found",
                        REDISCOVERY_DELAY.as_secs() as u32,
                    );
                }
                Err(e) => {
                    warn!("⚠️ Discovery failed: {}", e);
                    self.ui.show_error("discovery", &e.to_string(), REDISCOVERY_DELAY.as_secs() as u32);
                }
            }
            sleep_unless(&stop, REDISCOVERY_DELAY);
        }
    }
}

pub fn control_url(server: &DiscoveredServer, path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    match server.ip {
        std::net::IpAddr::V6(ip) => format!("ws://[{}]:{}{}", ip, server.control_port, path),
        ip => format!("ws://{}:{}{}", ip, server.control_port, path),
    }
}

fn sleep_unless(stop: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::Acquire) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControlConfig, UdpConfig};
    use crate::ui::{RecordingUi, UiEvent};

    fn server(ip: &str) -> DiscoveredServer {
        DiscoveredServer {
            ip: ip.parse().unwrap(),
            hostname: Some("studio".to_string()),
            audio_port: 8000,
            control_port: 8001,
            reachable: Some(true),
            responses: 1,
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn test_control_url() {
        assert_eq!(
            control_url(&server("192.168.1.5"), "/vad_feedback"),
            "ws://192.168.1.5:8001/vad_feedback"
        );
        assert_eq!(control_url(&server("::1"), "ws"), "ws://[::1]:8001/ws");
    }

    #[test]
    fn test_establish_wires_everything() {
        let config = EdgeConfig::default();
        let streamer = Arc::new(UdpAudioStreamer::init(UdpConfig::default(), 16000).unwrap());
        let control = ControlChannel::new(ControlConfig::default(), "dev");
        let ui = Arc::new(RecordingUi::new());
        let manager = SessionManager::new(
            &config,
            Arc::clone(&streamer),
            Arc::clone(&control),
            ui.clone(),
            Arc::new(ServerRegistry::new(Duration::from_secs(30))),
        );

        manager.establish(&server("127.0.0.1")).unwrap();

        assert_eq!(streamer.server(), Some("127.0.0.1:8000".parse().unwrap()));
        assert_eq!(control.url().as_deref(), Some("ws://127.0.0.1:8001/vad_feedback"));
        assert_eq!(
            ui.events(),
            vec![UiEvent::ServerInfo("studio".to_string(), "udp+ws".to_string())]
        );
        assert_eq!(manager.current().unwrap().ip.to_string(), "127.0.0.1");
    }
}
