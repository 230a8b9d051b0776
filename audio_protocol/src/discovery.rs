//! Strings exchanged during UDP broadcast discovery.

/// Probe broadcast by a device looking for a server (and by servers looking for devices).
pub const DISCOVERY_REQUEST: &str = "HOWDYTTS_DISCOVERY";

/// Every server answer starts with this tag, optionally followed by `_<hostname>`.
pub const SERVER_RESPONSE_PREFIX: &str = "HOWDYTTS_SERVER";

/// Prefix of the answer a device sends when a server probes for devices.
pub const DEVICE_RESPONSE_PREFIX: &str = "HOWDYSCREEN_ESP32P4";

/// Payload of the UDP reachability probe sent to a server's audio port.
pub const REACHABILITY_PROBE: &[u8] = b"PING";

pub const DEFAULT_DISCOVERY_PORT: u16 = 8001;
pub const DEFAULT_AUDIO_PORT: u16 = 8000;
pub const DEFAULT_CONTROL_PORT: u16 = 8001;
pub const DEFAULT_HTTP_PORT: u16 = 8080;

const MAX_HOSTNAME_LEN: usize = 63;

/// What a server told us about itself in its discovery answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAnnouncement {
    pub hostname: Option<String>,
}

fn trimmed(datagram: &[u8]) -> Option<&str> {
    std::str::from_utf8(datagram)
        .ok()
        .map(|text| text.trim_end_matches(['\0', '\r', '\n', ' ']))
}

pub fn is_discovery_request(datagram: &[u8]) -> bool {
    trimmed(datagram) == Some(DISCOVERY_REQUEST)
}

/// Parse a server answer. Returns `None` for anything that is not one.
pub fn parse_server_response(datagram: &[u8]) -> Option<ServerAnnouncement> {
    let rest = trimmed(datagram)?.strip_prefix(SERVER_RESPONSE_PREFIX)?;

    if rest.is_empty() {
        return Some(ServerAnnouncement { hostname: None });
    }

    let hostname = rest.strip_prefix('_')?;
    if hostname.is_empty() {
        return Some(ServerAnnouncement { hostname: None });
    }

    let hostname: String = hostname.chars().take(MAX_HOSTNAME_LEN).collect();
    Some(ServerAnnouncement {
        hostname: Some(hostname),
    })
}

pub fn server_response(hostname: Option<&str>) -> String {
    match hostname {
        Some(name) => format!("{SERVER_RESPONSE_PREFIX}_{name}"),
        None => SERVER_RESPONSE_PREFIX.to_string(),
    }
}

/// Answer a device gives to a server probe.
pub fn device_response(device_id: &str, room: &str) -> String {
    format!("{DEVICE_RESPONSE_PREFIX}_{device_id}_ROOM_{room}")
}

/// Split a device answer back into `(device_id, room)`.
pub fn parse_device_response(datagram: &[u8]) -> Option<(String, String)> {
    let rest = trimmed(datagram)?
        .strip_prefix(DEVICE_RESPONSE_PREFIX)?
        .strip_prefix('_')?;
    let (device_id, room) = rest.rsplit_once("_ROOM_")?;
    Some((device_id.to_string(), room.to_string()))
}
