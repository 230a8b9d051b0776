use audio_protocol::discovery::{
    is_discovery_request, parse_device_response, server_response, DISCOVERY_REQUEST,
    REACHABILITY_PROBE,
};
use howdy_edge::config::DiscoveryConfig;
use howdy_edge::discovery::{DiscoveryResponder, ServerDiscovery, ServerRegistry};
use howdy_edge::mdns::record_resolved;
use mdns_sd::ServiceInfo;
use std::sync::Arc;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

fn local_socket(timeout_ms: u64) -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(timeout_ms)))
        .unwrap();
    socket
}

fn config_for(target: &UdpSocket) -> DiscoveryConfig {
    DiscoveryConfig {
        timeout_ms: 2_000,
        interval_ms: 100,
        targets: vec![target.local_addr().unwrap().to_string()],
        probe_timeout_ms: 500,
        ..Default::default()
    }
}

#[test_log::test]
fn test_finds_answering_server() {
    let server = local_socket(2_000);
    let audio = local_socket(2_000);
    let audio_port = audio.local_addr().unwrap().port();
    let config = config_for(&server);

    let responder = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (len, from) = server.recv_from(&mut buf).unwrap();
        assert!(is_discovery_request(&buf[..len]));
        server
            .send_to(server_response(Some("howdy-box")).as_bytes(), from)
            .unwrap();
    });
    let pinger = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (len, from) = audio.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], REACHABILITY_PROBE);
        audio.send_to(b"PONG", from).unwrap();
    });

    let discovery = ServerDiscovery::new(config, audio_port, 8001);
    let found = discovery.run().unwrap().expect("server found");

    assert_eq!(found.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(found.hostname.as_deref(), Some("howdy-box"));
    assert_eq!(found.audio_port, audio_port);
    assert_eq!(found.control_port, 8001);
    assert_eq!(found.reachable, Some(true));
    assert_eq!(found.display_name(), "howdy-box");
    assert_eq!(discovery.registry().len(), 1);

    responder.join().unwrap();
    pinger.join().unwrap();
}

#[test]
fn test_unreachable_server_is_not_chosen() {
    let server = local_socket(2_000);
    let mut config = config_for(&server);
    config.timeout_ms = 600;
    config.probe_timeout_ms = 100;
    // Nothing answers on the audio port.
    let silent_port = local_socket(10).local_addr().unwrap().port();

    let responder = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (_, from) = server.recv_from(&mut buf).unwrap();
        server.send_to(server_response(None).as_bytes(), from).unwrap();
    });

    let discovery = ServerDiscovery::new(config, silent_port, 8001);
    assert!(discovery.run().unwrap().is_none());
    let known = discovery.registry().list();
    assert_eq!(known.len(), 1);
    assert_eq!(known[0].reachable, Some(false));

    responder.join().unwrap();
}

#[test]
fn test_window_closes_without_answers() {
    let quiet = local_socket(10);
    let mut config = config_for(&quiet);
    config.timeout_ms = 300;

    let started = Instant::now();
    let discovery = ServerDiscovery::new(config, 8000, 8001);
    assert!(discovery.run().unwrap().is_none());
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(discovery.registry().is_empty());
}

#[test]
fn test_stop_ends_discovery_early() {
    let quiet = local_socket(10);
    let mut config = config_for(&quiet);
    config.timeout_ms = 30_000;

    let discovery = ServerDiscovery::new(config, 8000, 8001);
    let stop = discovery.stop_flag();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        stop.store(true, std::sync::atomic::Ordering::Release);
    });

    let started = Instant::now();
    assert!(discovery.run().unwrap().is_none());
    assert!(started.elapsed() < Duration::from_secs(5));
    stopper.join().unwrap();
}

#[test]
fn test_responder_answers_probes() {
    let responder = DiscoveryResponder::bind(0, "howdy-edge-07", "kitchen").unwrap();
    let port = responder.local_addr().unwrap().port();
    let stop = responder.stop_flag();
    let handle = responder.spawn().unwrap();

    let client = local_socket(1_000);
    let mut buf = [0u8; 128];

    client.send_to(b"HELLO", ("127.0.0.1", port)).unwrap();
    client.send_to(DISCOVERY_REQUEST.as_bytes(), ("127.0.0.1", port)).unwrap();
    let (len, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(
        parse_device_response(&buf[..len]),
        Some(("howdy-edge-07".to_string(), "kitchen".to_string()))
    );

    // Only the probe was answered.
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    assert!(client.recv_from(&mut buf).is_err());

    stop.store(true, std::sync::atomic::Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn test_mdns_resolved_server_ends_discovery() {
    // A target that never answers broadcasts.
    let silent = local_socket(10);
    let mut config = config_for(&silent);
    config.mdns = true;
    config.probe_reachability = false;

    let registry = Arc::new(ServerRegistry::new(Duration::from_secs(30)));
    let info = ServiceInfo::new(
        "_howdytts._tcp.local.",
        "den",
        "den-server.local.",
        "192.168.7.3",
        8001,
        std::collections::HashMap::<String, String>::new(),
    )
    .unwrap();
    assert!(record_resolved(&registry, &info, 8000, 8001));

    let discovery = ServerDiscovery::new(config, 8000, 8001).with_registry(registry);
    let started = Instant::now();
    let found = discovery.run().unwrap().expect("registry entry used");

    assert_eq!(found.hostname.as_deref(), Some("den-server"));
    assert_eq!(found.ip, "192.168.7.3".parse::<IpAddr>().unwrap());
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_registry_ignored_without_mdns() {
    let silent = local_socket(10);
    let mut config = config_for(&silent);
    config.timeout_ms = 300;

    let registry = Arc::new(ServerRegistry::new(Duration::from_secs(30)));
    registry.upsert("192.168.7.3".parse().unwrap(), None, 8000, 8001);

    let discovery = ServerDiscovery::new(config, 8000, 8001).with_registry(registry);
    let started = Instant::now();
    // Broadcast-only rounds wait for an answer before settling.
    assert!(discovery.run().unwrap().is_some());
    assert!(started.elapsed() >= Duration::from_millis(250));
}
