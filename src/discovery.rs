//! Finding a server on the local network, and being found by one.
//!
//! Each round broadcasts `HOWDYTTS_DISCOVERY` to the limited broadcast address
//! and to the subnet broadcast derived from the local address, then listens
//! for `HOWDYTTS_SERVER[_hostname]` answers. Answers land in a
//! [`ServerRegistry`] keyed by IP; repeated answers refresh the entry.

use crate::config::DiscoveryConfig;
use crate::error::{EdgeError, Result};
use audio_protocol::discovery::{
    device_response, is_discovery_request, parse_server_response, DISCOVERY_REQUEST,
    REACHABILITY_PROBE,
};
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const RECV_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredServer {
    pub ip: IpAddr,
    pub hostname: Option<String>,
    pub audio_port: u16,
    pub control_port: u16,
    /// `None` until probed
    pub reachable: Option<bool>,
    pub responses: u32,
    #[serde(skip)]
    pub last_seen: Instant,
}

impl DiscoveredServer {
    pub fn audio_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.audio_port)
    }

    pub fn display_name(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| self.ip.to_string())
    }
}

/// Servers heard from recently.
pub struct ServerRegistry {
    servers: Mutex<Vec<DiscoveredServer>>,
    ttl: Duration,
}

impl ServerRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            servers: Mutex::new(Vec::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DiscoveredServer>> {
        self.servers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an answer. Returns true for a server not seen before.
    pub fn upsert(&self, ip: IpAddr, hostname: Option<String>, audio_port: u16, control_port: u16) -> bool {
        let mut servers = self.lock();
        if let Some(server) = servers.iter_mut().find(|s| s.ip == ip) {
            if hostname.is_some() {
                server.hostname = hostname;
            }
            server.responses += 1;
            server.last_seen = Instant::now();
            return false;
        }
        servers.push(DiscoveredServer {
            ip,
            hostname,
            audio_port,
            control_port,
            reachable: None,
            responses: 1,
            last_seen: Instant::now(),
        });
        true
    }

    pub fn set_reachable(&self, ip: IpAddr, reachable: bool) {
        if let Some(server) = self.lock().iter_mut().find(|s| s.ip == ip) {
            server.reachable = Some(reachable);
        }
    }

    /// Forget servers not heard from within the TTL.
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let mut servers = self.lock();
        let before = servers.len();
        servers.retain(|s| s.last_seen.elapsed() <= ttl);
        before - servers.len()
    }

    /// Freshest server not known to be unreachable.
    pub fn best(&self) -> Option<DiscoveredServer> {
        self.lock()
            .iter()
            .filter(|s| s.reachable != Some(false))
            .max_by_key(|s| s.last_seen)
            .cloned()
    }

    pub fn get(&self, ip: IpAddr) -> Option<DiscoveredServer> {
        self.lock().iter().find(|s| s.ip == ip).cloned()
    }

    pub fn list(&self) -> Vec<DiscoveredServer> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

pub fn subnet_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// The IPv4 address the OS would route external traffic from.
/// Connecting a UDP socket sends nothing.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Send `PING` to a server port and wait for any answer.
pub fn probe_reachability(addr: SocketAddr, timeout: Duration) -> bool {
    let attempt = || -> std::io::Result<bool> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        socket.connect(addr)?;
        socket.send(REACHABILITY_PROBE)?;
        let mut buf = [0u8; 64];
        Ok(socket.recv(&mut buf)? > 0)
    };
    match attempt() {
        Ok(answered) => {
            if answered {
                info!("✅ Server {} is reachable", addr);
            }
            answered
        }
        Err(e) => {
            debug!("📡 No answer from {}: {}", addr, e);
            false
        }
    }
}

pub struct ServerDiscovery {
    config: DiscoveryConfig,
    audio_port: u16,
    control_port: u16,
    registry: Arc<ServerRegistry>,
    stop: Arc<AtomicBool>,
}

impl ServerDiscovery {
    pub fn new(config: DiscoveryConfig, audio_port: u16, control_port: u16) -> Self {
        let registry = Arc::new(ServerRegistry::new(Duration::from_millis(config.server_ttl_ms)));
        Self {
            config,
            audio_port,
            control_port,
            registry,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share the registry with the session and HTTP surfaces.
    pub fn with_registry(mut self, registry: Arc<ServerRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Share a stop flag with the rest of the runtime.
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Flag that ends a running [`ServerDiscovery::run`] at its next poll.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Where probes go this round.
    pub fn targets(&self) -> Result<Vec<SocketAddr>> {
        if !self.config.targets.is_empty() {
            return self
                .config
                .targets
                .iter()
                .map(|t| parse_target(t, self.config.port))
                .collect();
        }

        let mut targets = vec![SocketAddr::from((Ipv4Addr::BROADCAST, self.config.port))];
        let netmask: Ipv4Addr = self
            .config
            .netmask
            .parse()
            .map_err(|_| EdgeError::Config(format!("netmask '{}'", self.config.netmask)))?;
        if let Some(local) = local_ipv4() {
            let subnet = subnet_broadcast(local, netmask);
            if subnet != Ipv4Addr::BROADCAST {
                targets.push(SocketAddr::from((subnet, self.config.port)));
            }
        }
        Ok(targets)
    }

    /// Probe until a usable server answers, the window closes or `stop`
    /// is raised. Returns the best server known at that point.
    pub fn run(&self) -> Result<Option<DiscoveredServer>> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(RECV_POLL))?;

        let targets = self.targets()?;
        let interval = Duration::from_millis(self.config.interval_ms.max(1));
        let deadline = Instant::now() + Duration::from_millis(self.config.timeout_ms);
        let mut next_round = Instant::now();
        let mut rounds = 0u32;
        let mut buf = [0u8; 256];

        info!("🔍 Discovering servers via {:?}", targets);

        while !self.stop.load(Ordering::Acquire) && Instant::now() < deadline {
            if Instant::now() >= next_round {
                // The mDNS browser feeds the same registry.
                if self.config.mdns {
                    if let Some(best) = self.registry.best() {
                        info!("🎯 Using {} from the registry", best.display_name());
                        return Ok(Some(best));
                    }
                }
                for target in &targets {
                    if let Err(e) = socket.send_to(DISCOVERY_REQUEST.as_bytes(), target) {
                        debug!("📡 Probe to {} failed: {}", target, e);
                    }
                }
                rounds += 1;
                next_round += interval;
                self.registry.sweep();
            }

            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    let Some(announcement) = parse_server_response(&buf[..len]) else {
                        trace!("Ignoring {} byte datagram from {}", len, from);
                        continue;
                    };
                    let ip = from.ip();
                    if self.registry.upsert(ip, announcement.hostname.clone(), self.audio_port, self.control_port) {
                        info!(
                            "🎯 Found server {} ({}) after {} rounds",
                            ip,
                            announcement.hostname.as_deref().unwrap_or("no name"),
                            rounds
                        );
                        if self.config.probe_reachability {
                            let reachable = probe_reachability(
                                SocketAddr::new(ip, self.audio_port),
                                Duration::from_millis(self.config.probe_timeout_ms),
                            );
                            self.registry.set_reachable(ip, reachable);
                        }
                    }
                    if self.registry.best().is_some() {
                        return Ok(self.registry.best());
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => {
                    warn!("⚠️ Discovery receive failed: {}", e);
                    thread::sleep(RECV_POLL);
                }
            }
        }

        let best = self.registry.best();
        if best.is_none() {
            info!("🔍 Discovery ended without a usable server after {} rounds", rounds);
        }
        Ok(best)
    }
}

fn parse_target(target: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }
    target
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| EdgeError::Config(format!("discovery target '{target}'")))
}

/// Answers server-side discovery probes with this device's identity.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    answer: String,
    stop: Arc<AtomicBool>,
}

impl DiscoveryResponder {
    pub fn bind(port: u16, device_id: &str, room: &str) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(RECV_POLL))?;
        Ok(Self {
            socket,
            answer: device_response(device_id, room),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("discovery-responder".to_string())
            .spawn(move || self.run())
    }

    fn run(&self) {
        info!("📣 Answering discovery probes as {}", self.answer);
        let mut buf = [0u8; 64];
        while !self.stop.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) if is_discovery_request(&buf[..len]) => {
                    debug!("📣 Probe from {}", from);
                    if let Err(e) = self.socket.send_to(self.answer.as_bytes(), from) {
                        warn!("⚠️ Discovery answer to {} failed: {}", from, e);
                    }
                }
                Ok(_) => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => {
                    warn!("⚠️ Responder receive failed: {}", e);
                    thread::sleep(RECV_POLL);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_broadcast() {
        let ip = Ipv4Addr::new(192, 168, 1, 42);
        assert_eq!(
            subnet_broadcast(ip, Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            subnet_broadcast(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 255, 0, 0)),
            Ipv4Addr::new(10, 1, 255, 255)
        );
    }

    #[test]
    fn test_registry_updates_in_place() {
        let registry = ServerRegistry::new(Duration::from_secs(30));
        let ip: IpAddr = "192.168.1.20".parse().unwrap();
        assert!(registry.upsert(ip, None, 8000, 8001));
        assert!(!registry.upsert(ip, Some("mac".to_string()), 8000, 8001));

        let server = registry.get(ip).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(server.responses, 2);
        assert_eq!(server.display_name(), "mac");
    }

    #[test]
    fn test_best_skips_unreachable() {
        let registry = ServerRegistry::new(Duration::from_secs(30));
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        registry.upsert(a, None, 8000, 8001);
        std::thread::sleep(Duration::from_millis(2));
        registry.upsert(b, None, 8000, 8001);
        assert_eq!(registry.best().unwrap().ip, b);

        registry.set_reachable(b, false);
        assert_eq!(registry.best().unwrap().ip, a);
        registry.set_reachable(a, false);
        assert!(registry.best().is_none());
    }

    #[test]
    fn test_sweep_drops_stale() {
        let registry = ServerRegistry::new(Duration::from_millis(10));
        registry.upsert("10.0.0.1".parse().unwrap(), None, 8000, 8001);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.sweep(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_explicit_targets() {
        let discovery = ServerDiscovery::new(
            DiscoveryConfig {
                targets: vec!["127.0.0.1".to_string(), "10.0.0.9:9999".to_string()],
                ..Default::default()
            },
            8000,
            8001,
        );
        assert_eq!(
            discovery.targets().unwrap(),
            vec![
                "127.0.0.1:8001".parse::<SocketAddr>().unwrap(),
                "10.0.0.9:9999".parse().unwrap()
            ]
        );
    }
}
