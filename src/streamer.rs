//! UDP audio streamer: packetizes mic frames towards the server and,
//! optionally, receives audio packets on the same socket.

use crate::config::UdpConfig;
use crate::error::{EdgeError, Result};
use audio_protocol::{
    encode_enhanced, encode_packet, encode_raw, AudioPacket, HeaderExtension, PacketHeader, HEADER_SIZE,
    MAX_PACKET_SIZE, MAX_SAMPLES_PER_PACKET,
};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Where the per-frame processor sends audio while streaming.
pub trait FrameSink: Send + Sync {
    fn start_stream(&self);
    fn stop_stream(&self);
    fn is_streaming(&self) -> bool;
    /// Send one whole frame. Must not block the caller for more than a few ms.
    fn send_frame(&self, samples: &[i16]) -> Result<()>;

    /// Send a frame along with its analysis. Sinks that do not carry header
    /// extensions send the bare frame.
    fn send_annotated(&self, samples: &[i16], extension: &HeaderExtension) -> Result<()> {
        let _ = extension;
        self.send_frame(samples)
    }
}

/// Called with every valid packet received on the audio socket.
pub type ReceiveCallback = Box<dyn FnMut(&PacketHeader, &[i16]) + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StreamerStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub sequence_errors: u64,
    pub socket_errors: u64,
    pub malformed_packets: u64,
    pub busy_drops: u64,
    /// Mean time spent in `send_to`, in ms
    pub average_latency_ms: f32,
    /// Mean gap between consecutive packets, in ms
    pub average_packet_interval_ms: f32,
}

/// Largest extension block the streamer writes (VAD plus wake word).
const ENHANCED_EXTENSION_MAX: usize = 24;

struct SendState {
    sequence: u32,
    pending: Vec<i16>,
    packet: Vec<u8>,
    last_sent: Option<Instant>,
    /// Analysis of the latest frame, written into every packet it completes
    extension: Option<HeaderExtension>,
}

pub struct UdpAudioStreamer {
    config: UdpConfig,
    sample_rate: u32,
    samples_per_packet: usize,
    socket: UdpSocket,
    server: Mutex<Option<SocketAddr>>,
    send: Mutex<SendState>,
    streaming: AtomicBool,
    stats: Arc<Mutex<StreamerStats>>,
    receiver_stop: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpAudioStreamer {
    pub fn init(config: UdpConfig, sample_rate: u32) -> Result<Self> {
        let samples_per_packet = audio::frame_samples(sample_rate, config.packet_ms);
        let fits = if config.enhanced_header {
            (MAX_PACKET_SIZE - HEADER_SIZE - ENHANCED_EXTENSION_MAX) / 2
        } else {
            MAX_SAMPLES_PER_PACKET
        };
        if samples_per_packet == 0 || samples_per_packet > fits {
            return Err(EdgeError::InvalidArgument(format!(
                "{} ms packets at {} Hz do not fit one datagram",
                config.packet_ms, sample_rate
            )));
        }

        let socket = UdpSocket::bind(("0.0.0.0", config.local_port))?;
        let timeout = Duration::from_millis(config.socket_timeout_ms.max(1));
        socket.set_write_timeout(Some(timeout))?;
        socket.set_read_timeout(Some(timeout))?;

        info!(
            "📡 UDP audio socket bound to {} ({} samples per packet{})",
            socket.local_addr()?,
            samples_per_packet,
            if config.enhanced_header { ", enhanced header" } else { "" }
        );

        Ok(Self {
            sample_rate,
            samples_per_packet,
            socket,
            server: Mutex::new(None),
            send: Mutex::new(SendState {
                sequence: 0,
                pending: Vec::with_capacity(samples_per_packet * 2),
                packet: Vec::with_capacity(audio_protocol::MAX_PACKET_SIZE),
                last_sent: None,
                extension: None,
            }),
            streaming: AtomicBool::new(false),
            stats: Arc::new(Mutex::new(StreamerStats::default())),
            receiver_stop: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn samples_per_packet(&self) -> usize {
        self.samples_per_packet
    }

    pub fn set_server(&self, ip: IpAddr, port: u16) {
        let addr = SocketAddr::new(ip, port);
        *lock(&self.server) = Some(addr);
        info!("📡 Audio streaming target set to {}", addr);
    }

    pub fn server(&self) -> Option<SocketAddr> {
        *lock(&self.server)
    }

    /// Begin streaming. With a callback, also start the receive thread.
    pub fn start(&self, on_receive: Option<ReceiveCallback>) -> Result<()> {
        if let Some(callback) = on_receive {
            let mut receiver = lock(&self.receiver);
            if receiver.is_none() {
                self.receiver_stop.store(false, Ordering::SeqCst);
                let socket = self.socket.try_clone()?;
                let stop = Arc::clone(&self.receiver_stop);
                let stats = Arc::clone(&self.stats);
                let handle = thread::Builder::new()
                    .name("udp-receiver".to_string())
                    .spawn(move || receive_loop(socket, callback, stop, stats))?;
                *receiver = Some(handle);
            }
        }

        if !self.streaming.swap(true, Ordering::SeqCst) {
            debug!("📡 Streaming on");
        }
        Ok(())
    }

    /// Stop streaming. Buffered samples that never filled a packet are discarded.
    pub fn stop(&self) {
        if self.streaming.swap(false, Ordering::SeqCst) {
            debug!("📡 Streaming off");
        }
        if let Ok(mut state) = self.send.try_lock() {
            state.pending.clear();
            state.extension = None;
        }
    }

    /// Stop streaming and join the receive thread.
    pub fn shutdown(&self) {
        self.stop();
        self.receiver_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.receiver).take() {
            if handle.join().is_err() {
                error!("❌ UDP receiver thread panicked");
            }
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn lock_send(&self) -> Result<MutexGuard<'_, SendState>> {
        let deadline = Instant::now() + Duration::from_millis(self.config.send_lock_timeout_ms);
        loop {
            match self.send.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(std::sync::TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        lock(&self.stats).busy_drops += 1;
                        return Err(EdgeError::Busy("udp send"));
                    }
                    thread::sleep(Duration::from_micros(200));
                }
            }
        }
    }

    /// Queue samples and send every full packet they complete.
    pub fn send(&self, samples: &[i16]) -> Result<usize> {
        self.send_with(samples, None)
    }

    /// Like [`send`](Self::send), tagging the packets with `extension` when
    /// the enhanced header is enabled.
    pub fn send_with(&self, samples: &[i16], extension: Option<&HeaderExtension>) -> Result<usize> {
        if samples.len() > MAX_SAMPLES_PER_PACKET {
            return Err(audio_protocol::ProtocolError::Oversized(
                audio_protocol::HEADER_SIZE + samples.len() * 2,
            )
            .into());
        }
        if !self.is_streaming() {
            return Err(EdgeError::InvalidState("streamer is not streaming".into()));
        }
        let server = self.server().ok_or(EdgeError::NotInitialized("audio server address"))?;

        let mut guard = self.lock_send()?;
        let state = &mut *guard;
        state.pending.extend_from_slice(samples);
        if self.config.enhanced_header {
            if let Some(extension) = extension {
                state.extension = Some(*extension);
            }
        }

        let mut sent = 0;
        while state.pending.len() >= self.samples_per_packet {
            let header = PacketHeader::pcm16(
                state.sequence,
                self.samples_per_packet as u16,
                self.sample_rate as u16,
            );
            let chunk = &state.pending[..self.samples_per_packet];
            let encoded = match (self.config.enhanced_header, &state.extension) {
                (true, Some(extension)) => encode_enhanced(&header, extension, chunk, &mut state.packet),
                _ => encode_packet(&header, chunk, &mut state.packet),
            };
            let result = encoded
                .map_err(EdgeError::from)
                .and_then(|_| self.transmit(&state.packet, server, &mut state.last_sent));
            state.pending.drain(..self.samples_per_packet);
            result?;
            state.sequence = state.sequence.wrapping_add(1);
            sent += 1;
        }
        Ok(sent)
    }

    /// Send a caller-built packet as is.
    pub fn send_packet(&self, header: &PacketHeader, payload: &[u8]) -> Result<()> {
        let server = self.server().ok_or(EdgeError::NotInitialized("audio server address"))?;
        let mut guard = self.lock_send()?;
        let state = &mut *guard;
        encode_raw(header, payload, &mut state.packet)?;
        self.transmit(&state.packet, server, &mut state.last_sent)
    }

    fn transmit(&self, packet: &[u8], server: SocketAddr, last_sent: &mut Option<Instant>) -> Result<()> {
        let started = Instant::now();
        match self.socket.send_to(packet, server) {
            Ok(bytes) => {
                let elapsed_ms = started.elapsed().as_secs_f32() * 1000.0;
                let mut stats = lock(&self.stats);
                stats.packets_sent += 1;
                stats.bytes_sent += bytes as u64;
                let n = stats.packets_sent as f32;
                stats.average_latency_ms += (elapsed_ms - stats.average_latency_ms) / n;
                if let Some(previous) = last_sent.replace(started) {
                    let gap_ms = started.duration_since(previous).as_secs_f32() * 1000.0;
                    let gaps = stats.packets_sent.saturating_sub(1);
                    if gaps > 0 {
                        stats.average_packet_interval_ms +=
                            (gap_ms - stats.average_packet_interval_ms) / gaps as f32;
                    }
                }
                trace!("📤 {} bytes to {}", bytes, server);
                Ok(())
            }
            Err(e) => {
                lock(&self.stats).socket_errors += 1;
                warn!("❌ UDP send to {} failed: {}", server, e);
                Err(e.into())
            }
        }
    }

    /// Next sequence number to be sent.
    pub fn next_sequence(&self) -> u32 {
        lock(&self.send).sequence
    }

    pub fn stats(&self) -> StreamerStats {
        *lock(&self.stats)
    }

    pub fn reset_stats(&self) {
        // Same lock order as the send path.
        let mut send = lock(&self.send);
        send.last_sent = None;
        *lock(&self.stats) = StreamerStats::default();
    }
}

impl FrameSink for UdpAudioStreamer {
    fn start_stream(&self) {
        if let Err(e) = self.start(None) {
            warn!("⚠️ Could not start streaming: {}", e);
        }
    }

    fn stop_stream(&self) {
        self.stop();
    }

    fn is_streaming(&self) -> bool {
        UdpAudioStreamer::is_streaming(self)
    }

    fn send_frame(&self, samples: &[i16]) -> Result<()> {
        self.send(samples).map(|_| ())
    }

    fn send_annotated(&self, samples: &[i16], extension: &HeaderExtension) -> Result<()> {
        self.send_with(samples, Some(extension)).map(|_| ())
    }
}

impl Drop for UdpAudioStreamer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn receive_loop(
    socket: UdpSocket,
    mut callback: ReceiveCallback,
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<StreamerStats>>,
) {
    let mut datagram = [0u8; audio_protocol::MAX_PACKET_SIZE];
    let mut samples = vec![0i16; MAX_SAMPLES_PER_PACKET];
    let mut last_sequence: Option<u32> = None;

    info!("📥 UDP receiver started");
    while !stop.load(Ordering::SeqCst) {
        let len = match socket.recv_from(&mut datagram) {
            Ok((len, _from)) => len,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue
            }
            Err(e) => {
                lock(&stats).socket_errors += 1;
                warn!("❌ UDP receive failed: {}", e);
                thread::sleep(Duration::from_millis(10));
                continue;
            }
        };

        let packet = match AudioPacket::parse(&datagram[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                lock(&stats).malformed_packets += 1;
                debug!("📥 Dropped datagram of {} bytes: {}", len, e);
                continue;
            }
        };

        let sequence = packet.header.sequence;
        {
            let mut stats = lock(&stats);
            stats.packets_received += 1;
            stats.bytes_received += len as u64;
            if let Some(last) = last_sequence {
                if sequence != last.wrapping_add(1) {
                    stats.sequence_errors += 1;
                    debug!("📥 Sequence gap: expected {}, got {}", last.wrapping_add(1), sequence);
                }
            }
        }
        last_sequence = Some(sequence);

        let count = packet.copy_samples(&mut samples);
        callback(&packet.header, &samples[..count]);
    }
    info!("📥 UDP receiver stopped");
}
