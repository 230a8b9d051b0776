//! Control channel: the JSON message stream to the server.
//!
//! One thread owns the WebSocket. Producers never touch the socket; they push
//! onto a bounded [`DropQueue`] through [`OutboundSink`] and the thread drains
//! it between reads. Inbound messages are handed to a [`ControlSink`] on the
//! same thread, so the sink must not block (chunk decoding happens elsewhere).
//!
//! ```text
//!   detector / stats / tts ──push──▶ DropQueue ──▶ ┌──────────────┐ ──▶ server
//!                                                  │ control I/O  │
//!   dispatcher ◀──on_message── parse ◀──────────── └──────────────┘ ◀── server
//! ```
//!
//! On a lost connection the thread retries with exponential backoff capped at
//! `reconnect_interval_ms` and gives up after `max_reconnect_attempts` until a
//! new URL is set. Queued messages survive reconnects.

pub mod backoff;

use crate::config::ControlConfig;
use crate::queue::{DropQueue, PushOutcome, QueueStats};
use backoff::Backoff;
use control_protocol::{unix_millis, ControlClient, InboundMessage, OutboundMessage, Ping};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const IDLE_POLL: Duration = Duration::from_millis(20);

/// Receives connection events and inbound messages.
pub trait ControlSink: Send + Sync {
    fn on_connected(&self);

    /// `retry_in` is the delay before the next attempt, `None` once the
    /// channel has given up.
    fn on_disconnected(&self, retry_in: Option<Duration>);

    fn on_message(&self, message: InboundMessage);
}

/// Where components post messages for the server.
pub trait OutboundSink: Send + Sync {
    /// Returns false when the message could not be queued.
    fn send(&self, message: OutboundMessage) -> bool;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ControlStats {
    pub connected: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub connects: u32,
    pub reconnections: u32,
    pub connect_failures: u32,
    pub validations_received: u32,
    pub validations_positive: u32,
    pub validations_negative: u32,
    pub threshold_updates: u32,
    pub malformed_messages: u32,
    pub unknown_messages: u32,
    pub queue_overflows: u64,
    pub queue_depth: usize,
    pub connection_uptime_s: u64,
}

impl ControlStats {
    pub fn validation_accuracy(&self) -> f32 {
        if self.validations_received == 0 {
            return 0.0;
        }
        self.validations_positive as f32 / self.validations_received as f32
    }
}

#[derive(Default)]
struct StatsCell {
    stats: ControlStats,
    connected_at: Option<Instant>,
}

enum SessionEnd {
    /// Stop flag or URL change.
    Requested,
    Lost(String),
}

pub struct ControlChannel {
    config: ControlConfig,
    device_id: String,
    url: Mutex<Option<String>>,
    generation: AtomicU64,
    queue: DropQueue<OutboundMessage>,
    stats: Mutex<StatsCell>,
    connected: AtomicBool,
    stop: AtomicBool,
}

impl ControlChannel {
    pub fn new(config: ControlConfig, device_id: impl Into<String>) -> Arc<Self> {
        let queue = DropQueue::new(config.queue_capacity);
        Arc::new(Self {
            config,
            device_id: device_id.into(),
            url: Mutex::new(None),
            generation: AtomicU64::new(0),
            queue,
            stats: Mutex::new(StatsCell::default()),
            connected: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Point the channel at a server. Any open connection is closed and the
    /// retry budget starts over.
    pub fn set_url(&self, url: impl Into<String>) {
        let url = url.into();
        info!("🔗 Control channel target {}", url);
        *self.url.lock().unwrap_or_else(|e| e.into_inner()) = Some(url);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn url(&self) -> Option<String> {
        self.url.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn stats(&self) -> ControlStats {
        let cell = self.lock_stats();
        let mut stats = cell.stats.clone();
        stats.connected = self.is_connected();
        stats.connection_uptime_s = cell
            .connected_at
            .filter(|_| stats.connected)
            .map(|at| at.elapsed().as_secs())
            .unwrap_or(0);
        let queue = self.queue.stats();
        stats.queue_overflows = queue.overflows();
        stats.queue_depth = self.queue.len();
        stats
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn lock_stats(&self) -> MutexGuard<'_, StatsCell> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the connection thread.
    pub fn spawn(self: &Arc<Self>, sink: Arc<dyn ControlSink>) -> std::io::Result<JoinHandle<()>> {
        let channel = Arc::clone(self);
        thread::Builder::new()
            .name("control-io".to_string())
            .spawn(move || channel.run(sink.as_ref()))
    }

    fn run(&self, sink: &dyn ControlSink) {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.initial_backoff_ms),
            Duration::from_millis(self.config.reconnect_interval_ms),
            self.config.max_reconnect_attempts,
        );
        let mut seen_generation = self.generation.load(Ordering::Acquire);

        while !self.stopped() {
            let generation = self.generation.load(Ordering::Acquire);
            if generation != seen_generation {
                seen_generation = generation;
                backoff.reset();
            }

            let Some(url) = self.url() else {
                thread::sleep(IDLE_POLL);
                continue;
            };

            match ControlClient::connect(
                &url,
                Duration::from_millis(self.config.connect_timeout_ms),
                Duration::from_millis(self.config.read_timeout_ms.max(1)),
            ) {
                Ok(mut client) => {
                    backoff.reset();
                    self.mark_connected();
                    sink.on_connected();

                    let end = self.session(&mut client, sink, generation);
                    self.connected.store(false, Ordering::Release);

                    match end {
                        SessionEnd::Requested => {
                            client.close();
                            if !self.stopped() {
                                sink.on_disconnected(Some(Duration::ZERO));
                            }
                            continue;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!("🔌 Control channel lost: {}", reason);
                            sink.on_disconnected(Some(backoff.peek_delay()));
                        }
                    }
                }
                Err(e) => {
                    self.lock_stats().stats.connect_failures += 1;
                    debug!("📡 Control connect to {} failed: {}", url, e);
                }
            }

            match backoff.next_delay() {
                Some(delay) => {
                    info!(
                        "🔄 Reconnecting control channel in {} ms (attempt {})",
                        delay.as_millis(),
                        backoff.attempts()
                    );
                    self.sleep_unless_changed(delay, generation);
                }
                None => {
                    error!(
                        "❌ Control channel gave up after {} attempts",
                        backoff.attempts()
                    );
                    sink.on_disconnected(None);
                    while !self.stopped() && self.generation.load(Ordering::Acquire) == generation {
                        thread::sleep(IDLE_POLL);
                    }
                }
            }
        }
        debug!("👋 Control channel thread exiting");
    }

    fn mark_connected(&self) {
        let mut cell = self.lock_stats();
        cell.stats.connects += 1;
        if cell.stats.connects > 1 {
            cell.stats.reconnections += 1;
        }
        cell.connected_at = Some(Instant::now());
        drop(cell);
        self.connected.store(true, Ordering::Release);
    }

    fn sleep_unless_changed(&self, delay: Duration, generation: u64) {
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline {
            if self.stopped() || self.generation.load(Ordering::Acquire) != generation {
                return;
            }
            thread::sleep(IDLE_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    fn session(&self, client: &mut ControlClient, sink: &dyn ControlSink, generation: u64) -> SessionEnd {
        let keepalive = Duration::from_millis(self.config.keepalive_interval_ms.max(1));
        let liveness = keepalive * 3;
        let mut last_ping = Instant::now();
        let mut last_heard = Instant::now();

        loop {
            if self.stopped() || self.generation.load(Ordering::Acquire) != generation {
                return SessionEnd::Requested;
            }

            while let Some(message) = self.queue.try_pop() {
                match client.send(&message) {
                    Ok(bytes) => self.record_sent(bytes),
                    Err(e) => {
                        if let PushOutcome::Rejected(lost) = self.queue.requeue_front(message) {
                            warn!("⚠️ Dropped {} after failed send", lost.type_name());
                        }
                        return SessionEnd::Lost(e.to_string());
                    }
                }
            }

            if last_ping.elapsed() >= keepalive {
                let ping = OutboundMessage::Ping(Ping {
                    device_id: self.device_id.clone(),
                    timestamp: unix_millis(),
                });
                match client.send(&ping) {
                    Ok(bytes) => self.record_sent(bytes),
                    Err(e) => return SessionEnd::Lost(e.to_string()),
                }
                last_ping = Instant::now();
            }

            if last_heard.elapsed() > liveness {
                return SessionEnd::Lost(format!(
                    "nothing heard for {} ms",
                    liveness.as_millis()
                ));
            }

            match client.read_message() {
                Ok(Some(message)) => {
                    last_heard = Instant::now();
                    self.dispatch(message, sink);
                }
                Ok(None) => {}
                Err(e) if e.is_malformed() => {
                    last_heard = Instant::now();
                    self.lock_stats().stats.malformed_messages += 1;
                    warn!("⚠️ Malformed control message dropped: {}", e);
                }
                Err(e) => return SessionEnd::Lost(e.to_string()),
            }
        }
    }

    fn record_sent(&self, bytes: usize) {
        let mut cell = self.lock_stats();
        cell.stats.messages_sent += 1;
        cell.stats.bytes_sent += bytes as u64;
    }

    fn dispatch(&self, message: InboundMessage, sink: &dyn ControlSink) {
        {
            let mut cell = self.lock_stats();
            cell.stats.messages_received += 1;
            match &message {
                InboundMessage::WakeWordValidation(v) => {
                    cell.stats.validations_received += 1;
                    if v.validated {
                        cell.stats.validations_positive += 1;
                    } else {
                        cell.stats.validations_negative += 1;
                    }
                }
                InboundMessage::ThresholdUpdate(_) => cell.stats.threshold_updates += 1,
                InboundMessage::Unknown(_) => cell.stats.unknown_messages += 1,
                _ => {}
            }
        }

        match message {
            InboundMessage::Pong => trace!("🏓 Pong"),
            InboundMessage::Unknown(kind) => {
                warn!("⚠️ Ignoring unknown control message type '{}'", kind)
            }
            other => {
                debug!("📥 {}", other.type_name());
                sink.on_message(other);
            }
        }
    }
}

impl OutboundSink for ControlChannel {
    fn send(&self, message: OutboundMessage) -> bool {
        match self.queue.push(message) {
            PushOutcome::Queued => true,
            PushOutcome::Evicted(old) => {
                debug!("🗑️ Control queue full, dropped {}", old.type_name());
                true
            }
            PushOutcome::Rejected(message) => {
                warn!(
                    "⚠️ Control queue full of higher priority messages, {} not queued",
                    message.type_name()
                );
                false
            }
        }
    }
}
