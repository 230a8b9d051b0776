//! Local HTTP surface.
//!
//! A secondary signalling path for the server (`/state`, `/speak`, POST
//! `/discover`) plus read-only device views (`/status`, `/health`,
//! GET `/discover`, `/stats`). Handlers never touch the audio path
//! directly; state pushes become processor events.

use crate::config::DeviceConfig;
use crate::processor::state::RemoteState;
use crate::processor::ProcessorHandle;
use crate::session::SessionManager;
use crate::stats::{CaptureStats, EdgeStats, StatsHub};
use audio::DeviceStats;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Device type reported to servers.
pub const DEVICE_TYPE: &str = "ESP32P4_HowdyScreen";

pub const CAPABILITIES: &[&str] = &[
    "wake_word",
    "vad",
    "udp_audio",
    "tts_playback",
    "display",
    "touch",
];

#[derive(Debug, Default)]
pub struct HttpCounters {
    pub state_requests: AtomicU64,
    pub speak_requests: AtomicU64,
    pub status_requests: AtomicU64,
    pub discovery_requests: AtomicU64,
}

pub struct HttpState {
    device: DeviceConfig,
    audio_port: u16,
    control_port: u16,
    processor: ProcessorHandle,
    stats: Arc<StatsHub>,
    session: Option<Arc<SessionManager>>,
    local_addr: OnceCell<SocketAddr>,
    counters: HttpCounters,
}

impl HttpState {
    pub fn new(
        device: DeviceConfig,
        audio_port: u16,
        control_port: u16,
        processor: ProcessorHandle,
        stats: Arc<StatsHub>,
    ) -> Self {
        Self {
            device,
            audio_port,
            control_port,
            processor,
            stats,
            session: None,
            local_addr: OnceCell::new(),
            counters: HttpCounters::default(),
        }
    }

    pub fn with_session(mut self, session: Arc<SessionManager>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn counters(&self) -> &HttpCounters {
        &self.counters
    }
}

#[derive(Debug, Deserialize)]
pub struct StateRequest {
    pub state: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SpeakRequest {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DiscoverRequest {
    pub server_ip: IpAddr,
    pub server_port: u16,
    #[serde(default)]
    pub control_port: Option<u16>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Ack {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    fn ok() -> Self {
        Self {
            status: "ok",
            message: None,
        }
    }

    fn ignored(message: impl Into<String>) -> Self {
        Self {
            status: "ignored",
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub device_id: String,
    pub device_name: String,
    pub device_type: &'static str,
    pub room: String,
    pub state: &'static str,
    pub capabilities: &'static [&'static str],
    pub server: Option<String>,
    pub uptime_s: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_s: u64,
    /// `MemAvailable` in KiB, where the platform reports it
    pub free_memory_kb: Option<u64>,
    pub capture: CaptureStats,
    pub audio: Option<DeviceStats>,
}

#[derive(Debug, Serialize)]
pub struct DiscoverResponse {
    pub device_id: String,
    pub device_name: String,
    pub device_type: &'static str,
    pub room: String,
    pub capabilities: &'static [&'static str],
    pub audio_port: u16,
    pub control_port: u16,
    pub http_port: Option<u16>,
}

pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/state", post(post_state))
        .route("/speak", post(post_speak))
        .route("/status", get(get_status))
        .route("/health", get(get_health))
        .route("/discover", get(get_discover).post(post_discover))
        .route("/stats", get(get_stats))
        .with_state(state)
}

async fn post_state(
    State(state): State<Arc<HttpState>>,
    Json(request): Json<StateRequest>,
) -> (StatusCode, Json<Ack>) {
    state.counters.state_requests.fetch_add(1, Ordering::Relaxed);
    match RemoteState::parse(&request.state) {
        Some(remote) => {
            debug!("🌐 State push: {:?}", remote);
            state.processor.remote_state(remote, request.text);
            (StatusCode::OK, Json(Ack::ok()))
        }
        None => {
            warn!("⚠️ Unknown state pushed: {}", request.state);
            (StatusCode::OK, Json(Ack::ignored(format!("unknown state {}", request.state))))
        }
    }
}

async fn post_speak(
    State(state): State<Arc<HttpState>>,
    Json(request): Json<SpeakRequest>,
) -> (StatusCode, Json<Ack>) {
    state.counters.speak_requests.fetch_add(1, Ordering::Relaxed);
    let remote = match request.state.as_deref() {
        None => RemoteState::Speaking,
        Some(name) => match RemoteState::parse(name) {
            Some(remote) => remote,
            None => {
                warn!("⚠️ Unknown state in speak push: {}", name);
                return (StatusCode::OK, Json(Ack::ignored(format!("unknown state {name}"))));
            }
        },
    };
    state.processor.remote_state(remote, request.text);
    (StatusCode::OK, Json(Ack::ok()))
}

async fn get_status(State(state): State<Arc<HttpState>>) -> Json<StatusResponse> {
    state.counters.status_requests.fetch_add(1, Ordering::Relaxed);
    let server = state
        .session
        .as_ref()
        .and_then(|s| s.current())
        .map(|s| s.audio_addr().to_string());
    Json(StatusResponse {
        device_id: state.device.device_id.clone(),
        device_name: state.device.device_name.clone(),
        device_type: DEVICE_TYPE,
        room: state.device.room.clone(),
        state: state.processor.state().as_str(),
        capabilities: CAPABILITIES,
        server,
        uptime_s: state.stats.uptime().as_secs(),
    })
}

async fn get_health(State(state): State<Arc<HttpState>>) -> Json<HealthResponse> {
    let snapshot = state.stats.snapshot();
    Json(HealthResponse {
        status: "ok",
        uptime_s: snapshot.uptime_s,
        free_memory_kb: available_memory_kb(),
        capture: snapshot.capture,
        audio: snapshot.audio,
    })
}

async fn get_discover(State(state): State<Arc<HttpState>>) -> Json<DiscoverResponse> {
    state.counters.discovery_requests.fetch_add(1, Ordering::Relaxed);
    Json(DiscoverResponse {
        device_id: state.device.device_id.clone(),
        device_name: state.device.device_name.clone(),
        device_type: DEVICE_TYPE,
        room: state.device.room.clone(),
        capabilities: CAPABILITIES,
        audio_port: state.audio_port,
        control_port: state.control_port,
        http_port: state.local_addr().map(|a| a.port()),
    })
}

/// A server announcing itself directly.
async fn post_discover(
    State(state): State<Arc<HttpState>>,
    Json(request): Json<DiscoverRequest>,
) -> (StatusCode, Json<Ack>) {
    state.counters.discovery_requests.fetch_add(1, Ordering::Relaxed);
    let Some(session) = &state.session else {
        return (StatusCode::OK, Json(Ack::ignored("no session manager")));
    };

    let control_port = request.control_port.unwrap_or(state.control_port);
    session.registry().upsert(
        request.server_ip,
        request.hostname.clone(),
        request.server_port,
        control_port,
    );
    let Some(server) = session.registry().get(request.server_ip) else {
        return (StatusCode::OK, Json(Ack::ignored("server expired")));
    };
    info!("🌐 Server announced itself: {}", server.audio_addr());
    match session.establish(&server) {
        Ok(()) => (StatusCode::OK, Json(Ack::ok())),
        Err(e) => {
            warn!("⚠️ Session with announced server failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Ack {
                    status: "error",
                    message: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn get_stats(State(state): State<Arc<HttpState>>) -> Json<EdgeStats> {
    Json(state.stats.snapshot())
}

/// `MemAvailable` from `/proc/meminfo`.
pub fn available_memory_kb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_available(&meminfo)
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// Serve on `bind:port` from a dedicated thread until `stop`.
pub fn spawn(
    state: Arc<HttpState>,
    bind: &str,
    port: u16,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    let addr = format!("{bind}:{port}");
    thread::Builder::new()
        .name("http".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!("❌ HTTP runtime failed: {}", e);
                    return;
                }
            };
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::bind(&addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        warn!("❌ HTTP bind on {} failed: {}", addr, e);
                        return;
                    }
                };
                if let Ok(local) = listener.local_addr() {
                    let _ = state.local_addr.set(local);
                    info!("🌐 HTTP surface on {}", local);
                }
                let shutdown = async move {
                    while !stop.load(Ordering::Acquire) {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                };
                if let Err(e) = axum::serve(listener, router(state))
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    warn!("❌ HTTP server error: {}", e);
                }
                info!("👋 HTTP surface stopped");
            });
        })
}
