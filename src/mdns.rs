//! Optional mDNS discovery next to the UDP broadcast path.
//!
//! Servers are browsed under the configured service type and resolved
//! instances are fed into the shared [`ServerRegistry`], where the broadcast
//! discovery picks them up. This device registers itself as
//! `_howdyclient._tcp` with its identity in TXT records.

use crate::config::DeviceConfig;
use crate::discovery::ServerRegistry;
use crate::error::Result;
use log::{debug, info, trace, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Service type this device registers under.
pub const CLIENT_SERVICE_TYPE: &str = "_howdyclient._tcp.local.";

const CAPABILITIES: &str = "audio,wake_word,tts";
const BROWSE_POLL: Duration = Duration::from_millis(100);

/// A server instance as resolved over mDNS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedServer {
    pub ip: IpAddr,
    pub hostname: Option<String>,
    pub port: u16,
    pub version: Option<String>,
}

/// Pull the address, host and port out of a resolved instance. IPv4 wins
/// when both families are announced.
pub fn resolved_server(info: &ServiceInfo) -> Option<ResolvedServer> {
    let ip = info
        .get_addresses()
        .iter()
        .copied()
        .min_by_key(|ip| (ip.is_ipv6(), *ip))?;
    let hostname = info
        .get_hostname()
        .trim_end_matches('.')
        .trim_end_matches(".local")
        .to_string();

    Some(ResolvedServer {
        ip,
        hostname: (!hostname.is_empty()).then_some(hostname),
        port: info.get_port(),
        version: info.get_property_val_str("version").map(str::to_string),
    })
}

/// Record a resolved instance. The announced port is the control port;
/// audio keeps the configured one. Returns true for a new server.
pub fn record_resolved(
    registry: &ServerRegistry,
    info: &ServiceInfo,
    audio_port: u16,
    default_control_port: u16,
) -> bool {
    let Some(server) = resolved_server(info) else {
        debug!("🔍 {} resolved without an address", info.get_fullname());
        return false;
    };
    let control_port = if server.port == 0 {
        default_control_port
    } else {
        server.port
    };
    let added = registry.upsert(server.ip, server.hostname.clone(), audio_port, control_port);
    if added {
        info!(
            "🎯 Found server {} ({}) over mDNS, version {}",
            server.ip,
            server.hostname.as_deref().unwrap_or("no name"),
            server.version.as_deref().unwrap_or("unknown")
        );
    }
    added
}

fn host_label(device_id: &str) -> String {
    let label: String = device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        "howdy-edge".to_string()
    } else {
        label.to_string()
    }
}

/// Registration for this device, with addresses filled in by the daemon.
pub fn client_service(device: &DeviceConfig, port: u16) -> Result<ServiceInfo> {
    let mut properties = HashMap::new();
    properties.insert("capabilities".to_string(), CAPABILITIES.to_string());
    properties.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
    properties.insert("device".to_string(), device.device_id.clone());
    properties.insert("room".to_string(), device.room.clone());

    let instance = format!("{} {}", device.device_name, device.device_id);
    let host = format!("{}.local.", host_label(&device.device_id));
    let service = ServiceInfo::new(CLIENT_SERVICE_TYPE, &instance, &host, "", port, properties)?;
    Ok(service.enable_addr_auto())
}

pub struct MdnsService {
    daemon: ServiceDaemon,
    registered: Mutex<Option<String>>,
}

impl MdnsService {
    pub fn new() -> Result<Self> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            registered: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register this device, replacing an earlier registration.
    pub fn advertise(&self, device: &DeviceConfig, port: u16) -> Result<()> {
        let service = client_service(device, port)?;
        let fullname = service.get_fullname().to_string();
        self.withdraw();
        self.daemon.register(service)?;
        info!("📣 Advertising {} on port {}", fullname, port);
        *self.lock() = Some(fullname);
        Ok(())
    }

    pub fn withdraw(&self) {
        if let Some(fullname) = self.lock().take() {
            match self.daemon.unregister(&fullname) {
                Ok(_) => debug!("📣 Withdrew {}", fullname),
                Err(e) => warn!("⚠️ Could not withdraw {}: {}", fullname, e),
            }
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.lock().is_some()
    }

    /// Browse `service_type` until `stop` is raised, feeding `registry`.
    pub fn spawn_browser(
        self: &Arc<Self>,
        service_type: String,
        registry: Arc<ServerRegistry>,
        audio_port: u16,
        default_control_port: u16,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        let events = self.daemon.browse(&service_type)?;
        let service = Arc::clone(self);
        let handle = thread::Builder::new().name("mdns-browser".to_string()).spawn(move || {
            info!("🔍 Browsing mDNS for {}", service_type);
            while !stop.load(Ordering::Acquire) {
                match events.recv_timeout(BROWSE_POLL) {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        record_resolved(&registry, &info, audio_port, default_control_port);
                    }
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                        debug!("🔍 {} left the network", fullname);
                    }
                    Ok(event) => trace!("mDNS event {:?}", event),
                    Err(_) if events.is_disconnected() => break,
                    Err(_) => {}
                }
            }
            if let Err(e) = service.daemon.stop_browse(&service_type) {
                trace!("mDNS browse stop: {}", e);
            }
        })?;
        Ok(handle)
    }
}

impl Drop for MdnsService {
    fn drop(&mut self) {
        self.withdraw();
        if let Err(e) = self.daemon.shutdown() {
            trace!("mDNS daemon shutdown: {}", e);
        }
    }
}
