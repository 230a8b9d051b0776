//! Wiring and thread lifecycle for a running endpoint.
//!
//! ```text
//!   mic ─▶ capture ─frames─▶ processor ─▶ UDP streamer ─▶ server
//!             ▲   ◀─pool─┘       ▲ events
//!             │                  │
//!   server ─▶ control-io ─▶ dispatcher ─▶ tts-worker ─▶ playback ─▶ speaker
//! ```
//!
//! Every loop watches one shared stop flag and wakes at least every 100 ms.

use crate::config::EdgeConfig;
use crate::control::{ControlChannel, ControlSink, OutboundSink};
use crate::discovery::{DiscoveryResponder, ServerDiscovery, ServerRegistry};
use crate::error::{EdgeError, Result};
use crate::http::{self, HttpState};
use crate::mdns::MdnsService;
use crate::processor::{AudioProcessor, ControlEvent, ProcessorDeps, ProcessorHandle};
use crate::session::SessionManager;
use crate::stats::{CaptureCounters, StatsHub};
use crate::streamer::{FrameSink, UdpAudioStreamer};
use crate::tts::{FrameSource, TtsCommand, TtsPlayback, TtsWorker};
use crate::ui::UiSurface;
use audio::{AudioBackend, AudioConfig, AudioDevice, AudioError, LoopbackHandle};
use control_protocol::InboundMessage;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MIC_READ_TIMEOUT: Duration = Duration::from_millis(100);
const SPEAKER_WRITE_TIMEOUT: Duration = Duration::from_millis(100);
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Routes control-channel traffic to playback and the processor.
pub struct Dispatcher {
    worker: Arc<TtsWorker>,
    processor: ProcessorHandle,
}

impl Dispatcher {
    pub fn new(worker: Arc<TtsWorker>, processor: ProcessorHandle) -> Self {
        Self { worker, processor }
    }
}

impl ControlSink for Dispatcher {
    fn on_connected(&self) {
        self.processor.control(ControlEvent::Connected);
    }

    fn on_disconnected(&self, retry_in: Option<Duration>) {
        self.worker.cancel("control channel lost");
        self.processor.control(ControlEvent::Disconnected { retry_in });
    }

    fn on_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::TtsAudioStart(start) => {
                // Open the session before any chunk can reach the worker.
                self.worker.cancel("superseded");
                match self.worker.playback().begin_session(&start) {
                    Ok(()) => {
                        self.processor.control(ControlEvent::TtsStarted {
                            session_id: start.session_info.session_id.clone(),
                            interrupt_recording: start.playback_config.interrupt_recording,
                        });
                    }
                    Err(e) => warn!(
                        "⚠️ TTS session {} refused: {}",
                        start.session_info.session_id, e
                    ),
                }
            }
            InboundMessage::TtsAudioChunk(chunk) => {
                self.worker.submit(TtsCommand::Chunk(chunk));
            }
            InboundMessage::TtsAudioEnd(end) => {
                self.worker.submit(TtsCommand::End(end));
            }
            InboundMessage::WakeWordValidation(validation) => {
                self.processor.control(ControlEvent::Validation(validation));
            }
            InboundMessage::ThresholdUpdate(update) => {
                self.processor.control(ControlEvent::ThresholdUpdate(update));
            }
            InboundMessage::Pong | InboundMessage::Unknown(_) => {}
        }
    }
}

pub struct EdgeRuntime {
    config: EdgeConfig,
    stop: Arc<AtomicBool>,
    device: Arc<AudioDevice>,
    loopback: Option<LoopbackHandle>,
    streamer: Arc<UdpAudioStreamer>,
    control: Arc<ControlChannel>,
    worker: Arc<TtsWorker>,
    stats: Arc<StatsHub>,
    session: Arc<SessionManager>,
    ui: Arc<dyn UiSurface>,
    processor: Option<AudioProcessor>,
    handle: ProcessorHandle,
    responder_stop: Option<Arc<AtomicBool>>,
    mdns: Option<Arc<MdnsService>>,
    threads: Vec<JoinHandle<()>>,
}

impl EdgeRuntime {
    /// Build with the backend named in the configuration.
    pub fn build(config: EdgeConfig, ui: Arc<dyn UiSurface>) -> Result<Self> {
        let (backend, loopback) = match audio::backend_for(config.audio.backend) {
            Ok(pair) => pair,
            Err(e) => {
                ui.show_error("audio", &e.to_string(), 0);
                return Err(e.into());
            }
        };
        Self::with_backend(config, backend, loopback, ui)
    }

    pub fn with_backend(
        config: EdgeConfig,
        backend: Box<dyn AudioBackend>,
        loopback: Option<LoopbackHandle>,
        ui: Arc<dyn UiSurface>,
    ) -> Result<Self> {
        Self::assemble(config, backend, loopback, ui, None)
    }

    /// Route processed frames to `sink` instead of the UDP streamer.
    pub fn with_frame_sink(
        config: EdgeConfig,
        backend: Box<dyn AudioBackend>,
        loopback: Option<LoopbackHandle>,
        ui: Arc<dyn UiSurface>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self> {
        Self::assemble(config, backend, loopback, ui, Some(sink))
    }

    fn assemble(
        config: EdgeConfig,
        backend: Box<dyn AudioBackend>,
        loopback: Option<LoopbackHandle>,
        ui: Arc<dyn UiSurface>,
        sink: Option<Arc<dyn FrameSink>>,
    ) -> Result<Self> {
        config.validate()?;
        let device_id = config.device.device_id.clone();

        // Speaker gain is applied once, by playback; the device writes at unity.
        let device_config = AudioConfig {
            speaker_volume: 1.0,
            ..config.audio.clone()
        };
        let device = match AudioDevice::init(device_config, backend) {
            Ok(device) => Arc::new(device),
            Err(e) => {
                ui.show_error("audio", &e.to_string(), 0);
                return Err(e.into());
            }
        };

        let streamer = Arc::new(UdpAudioStreamer::init(
            config.udp.clone(),
            config.audio.sample_rate,
        )?);
        let control = ControlChannel::new(config.control.clone(), device_id.clone());
        let outbound: Arc<dyn OutboundSink> = control.clone();

        let playback = Arc::new(TtsPlayback::new(
            config.frame_samples(),
            config.audio.sample_rate,
            config.jitter.clone(),
            config.audio.speaker_volume,
            config.vad.echo_suppression_db,
        )?);
        let worker = TtsWorker::new(
            Arc::clone(&playback),
            Arc::clone(&outbound),
            device_id.clone(),
            config.tts.queue_capacity,
            Duration::from_millis(config.tts.status_interval_ms),
        );

        let stats = Arc::new(
            StatsHub::new(device_id)
                .with_device(Arc::clone(&device))
                .with_streamer(Arc::clone(&streamer))
                .with_control(Arc::clone(&control))
                .with_playback(playback),
        );

        let registry = Arc::new(ServerRegistry::new(Duration::from_millis(
            config.discovery.server_ttl_ms,
        )));
        let session = Arc::new(SessionManager::new(
            &config,
            Arc::clone(&streamer),
            Arc::clone(&control),
            Arc::clone(&ui),
            registry,
        ));

        let (processor, handle) = AudioProcessor::new(
            &config,
            ProcessorDeps {
                sink: sink.unwrap_or_else(|| streamer.clone() as Arc<dyn FrameSink>),
                outbound,
                ui: Arc::clone(&ui),
                tts: Arc::clone(&worker),
                stats: Some(Arc::clone(&stats)),
            },
        )?;

        Ok(Self {
            config,
            stop: Arc::new(AtomicBool::new(false)),
            device,
            loopback,
            streamer,
            control,
            worker,
            stats,
            session,
            ui,
            processor: Some(processor),
            handle,
            responder_stop: None,
            mdns: None,
            threads: Vec::new(),
        })
    }

    pub fn handle(&self) -> ProcessorHandle {
        self.handle.clone()
    }

    pub fn loopback(&self) -> Option<&LoopbackHandle> {
        self.loopback.as_ref()
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stats(&self) -> &Arc<StatsHub> {
        &self.stats
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn control(&self) -> &Arc<ControlChannel> {
        &self.control
    }

    pub fn device(&self) -> &Arc<AudioDevice> {
        &self.device
    }

    pub fn tts(&self) -> &Arc<TtsWorker> {
        &self.worker
    }

    /// Start the device and every long-lived thread.
    pub fn start(&mut self) -> Result<()> {
        let processor = self
            .processor
            .take()
            .ok_or_else(|| EdgeError::InvalidState("runtime already started".into()))?;

        if let Err(e) = self.device.start() {
            self.ui.show_error("audio", &e.to_string(), 0);
            return Err(e.into());
        }

        let pool_size = self.config.processor.frame_queue.max(1) * 2;
        let frame_samples = self.config.frame_samples();
        let (frame_tx, frame_rx) = bounded::<Vec<i16>>(self.config.processor.frame_queue.max(1));
        let (pool_tx, pool_rx) = bounded::<Vec<i16>>(pool_size);
        for _ in 0..pool_size {
            let _ = pool_tx.try_send(vec![0i16; frame_samples]);
        }

        let stop = Arc::clone(&self.stop);
        let recycle = pool_tx.clone();
        self.threads.push(
            thread::Builder::new()
                .name("processor".to_string())
                .spawn(move || processor.run(frame_rx, recycle, stop))?,
        );

        let capture = CaptureLoop {
            device: Arc::clone(&self.device),
            frames: frame_tx,
            pool: pool_rx,
            recycle: pool_tx,
            counters: Arc::clone(self.stats.capture()),
            frame_samples,
            stop: Arc::clone(&self.stop),
        };
        self.threads.push(
            thread::Builder::new()
                .name("capture".to_string())
                .spawn(move || capture.run())?,
        );

        let speaker = SpeakerLoop {
            device: Arc::clone(&self.device),
            playback: Arc::clone(self.worker.playback()),
            frame_samples,
            frame: Duration::from_millis(self.config.audio.frame_ms as u64),
            stop: Arc::clone(&self.stop),
        };
        self.threads.push(
            thread::Builder::new()
                .name("speaker".to_string())
                .spawn(move || speaker.run())?,
        );

        self.threads.push(self.worker.spawn()?);

        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&self.worker), self.handle.clone()));
        self.threads.push(self.control.spawn(dispatcher)?);

        self.threads.push(self.stats.spawn_publisher(
            self.control.clone(),
            Duration::from_millis(self.config.stats.publish_interval_ms),
            Arc::clone(&self.stop),
        )?);

        self.threads
            .push(spawn_wifi_monitor(Arc::clone(&self.ui), Arc::clone(&self.stop))?);

        if self.config.discovery.mdns {
            self.start_mdns();
        }
        self.connect()?;

        if self.config.discovery.advertise {
            match DiscoveryResponder::bind(
                self.config.discovery.port,
                &self.config.device.device_id,
                &self.config.device.room,
            ) {
                Ok(responder) => {
                    self.responder_stop = Some(responder.stop_flag());
                    self.threads.push(responder.spawn()?);
                }
                Err(e) => warn!("⚠️ Discovery responder unavailable: {}", e),
            }
        }

        if self.config.http.enabled {
            let state = HttpState::new(
                self.config.device.clone(),
                self.config.udp.server_port,
                self.config.control.port,
                self.handle.clone(),
                Arc::clone(&self.stats),
            )
            .with_session(Arc::clone(&self.session));
            self.threads.push(http::spawn(
                Arc::new(state),
                &self.config.http.bind,
                self.config.http.port,
                Arc::clone(&self.stop),
            )?);
        }

        info!("🚀 Endpoint {} running", self.config.device.device_id);
        Ok(())
    }

    /// Advertise this device and, when a server still has to be found,
    /// browse for one. mDNS failures leave the broadcast path in charge.
    fn start_mdns(&mut self) {
        let mdns = match MdnsService::new() {
            Ok(mdns) => Arc::new(mdns),
            Err(e) => {
                warn!("⚠️ mDNS unavailable: {}", e);
                return;
            }
        };
        if let Err(e) = mdns.advertise(&self.config.device, self.config.http.port) {
            warn!("⚠️ mDNS advertisement failed: {}", e);
        }
        if self.config.server.is_none() && self.config.discovery.enabled {
            match mdns.spawn_browser(
                self.config.discovery.mdns_service_type.clone(),
                Arc::clone(self.session.registry()),
                self.config.udp.server_port,
                self.config.control.port,
                Arc::clone(&self.stop),
            ) {
                Ok(handle) => self.threads.push(handle),
                Err(e) => warn!("⚠️ mDNS browse failed: {}", e),
            }
        }
        self.mdns = Some(mdns);
    }

    pub fn is_advertising_mdns(&self) -> bool {
        self.mdns.as_ref().is_some_and(|m| m.is_advertising())
    }

    /// Reach a server: the configured one, or whatever discovery finds.
    fn connect(&mut self) -> Result<()> {
        if let Some(server) = self.config.server.clone() {
            let endpoint = self.config.server_endpoint(&server)?;
            return self.session.establish_static(endpoint, self.config.control.port);
        }
        if !self.config.discovery.enabled {
            warn!("⚠️ No server configured and discovery disabled");
            return Ok(());
        }
        let discovery = ServerDiscovery::new(
            self.config.discovery.clone(),
            self.config.udp.server_port,
            self.config.control.port,
        )
        .with_registry(Arc::clone(self.session.registry()))
        .with_stop(Arc::clone(&self.stop));
        self.threads
            .push(self.session.spawn_discovery(discovery, Arc::clone(&self.stop))?);
        Ok(())
    }

    /// Block until the stop flag is raised.
    pub fn wait(&self) {
        while !self.stop.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(100));
        }
    }

    /// Stop every loop and join threads, giving up after `grace`.
    pub fn shutdown(mut self, grace: Duration) {
        info!("🛑 Shutting down");
        self.stop.store(true, Ordering::Release);
        self.control.stop();
        self.worker.stop();
        self.worker.cancel("shutdown");
        if let Some(responder) = &self.responder_stop {
            responder.store(true, Ordering::Release);
        }
        if let Some(mdns) = &self.mdns {
            mdns.withdraw();
        }

        let deadline = Instant::now() + grace;
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("💥 Thread {} panicked", name);
                }
            } else {
                warn!("⏳ Thread {} did not stop within {:?}", name, grace);
            }
        }

        self.streamer.shutdown();
        self.device.stop();
        self.device.deinit();
        info!("👋 Endpoint stopped");
    }
}

struct CaptureLoop {
    device: Arc<AudioDevice>,
    frames: Sender<Vec<i16>>,
    pool: Receiver<Vec<i16>>,
    recycle: Sender<Vec<i16>>,
    counters: Arc<CaptureCounters>,
    frame_samples: usize,
    stop: Arc<AtomicBool>,
}

impl CaptureLoop {
    fn run(self) {
        info!("🎙️ Capture running");
        let mut spare = vec![0i16; self.frame_samples];
        let mut current: Option<Vec<i16>> = None;
        let mut filled = 0;
        let mut last_frame = Instant::now();

        while !self.stop.load(Ordering::Acquire) {
            let buf = current.get_or_insert_with(|| {
                self.pool
                    .try_recv()
                    .unwrap_or_else(|_| std::mem::take(&mut spare))
            });
            if buf.len() != self.frame_samples {
                buf.resize(self.frame_samples, 0);
            }

            match self.device.read_mic(&mut buf[filled..], MIC_READ_TIMEOUT) {
                Ok(0) => {
                    self.counters.short_reads.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Ok(count) => filled += count,
                Err(AudioError::ModeSwitched) => continue,
                Err(e) => {
                    self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                    trace!("🎙️ Read failed: {}", e);
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
            }
            if filled < self.frame_samples {
                continue;
            }

            filled = 0;
            let now = Instant::now();
            self.counters.record_gap(now.duration_since(last_frame));
            last_frame = now;
            self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);

            let Some(frame) = current.take() else { continue };
            match self.frames.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(frame)) => {
                    self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("🎙️ Processor behind, frame dropped");
                    self.give_back(frame, &mut spare);
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        info!("👋 Capture stopped");
    }

    fn give_back(&self, frame: Vec<i16>, spare: &mut Vec<i16>) {
        if spare.is_empty() {
            *spare = frame;
        } else {
            let _ = self.recycle.try_send(frame);
        }
    }
}

struct SpeakerLoop {
    device: Arc<AudioDevice>,
    playback: Arc<TtsPlayback>,
    frame_samples: usize,
    frame: Duration,
    stop: Arc<AtomicBool>,
}

impl SpeakerLoop {
    fn run(self) {
        info!("🔊 Speaker running");
        let mut buf = vec![0i16; self.frame_samples];
        let mut last_source = FrameSource::Idle;

        while !self.stop.load(Ordering::Acquire) {
            let source = self.playback.next_frame(&mut buf);
            if source != last_source {
                trace!("🔊 Speaker source {:?}", source);
                last_source = source;
            }
            if source == FrameSource::Idle {
                thread::sleep(IDLE_POLL);
                continue;
            }

            let mut written = 0;
            while written < buf.len() && !self.stop.load(Ordering::Acquire) {
                match self.device.write_speaker(&buf[written..], SPEAKER_WRITE_TIMEOUT) {
                    Ok(count) => written += count,
                    Err(AudioError::ModeSwitched) => continue,
                    Err(e) => {
                        debug!("🔊 Write failed: {}", e);
                        thread::sleep(self.frame);
                        break;
                    }
                }
            }
        }
        info!("👋 Speaker stopped");
    }
}

/// Wi-Fi link quality in percent from `/proc/net/wireless`.
pub fn wifi_strength() -> Option<u8> {
    let table = std::fs::read_to_string("/proc/net/wireless").ok()?;
    parse_wireless(&table)
}

fn parse_wireless(table: &str) -> Option<u8> {
    // Two header lines, then "iface: status link level noise ..."
    let line = table.lines().nth(2)?;
    let (_, fields) = line.split_once(':')?;
    let link: f32 = fields
        .split_whitespace()
        .nth(1)?
        .trim_end_matches('.')
        .parse()
        .ok()?;
    Some(((link / 70.0) * 100.0).clamp(0.0, 100.0) as u8)
}

fn spawn_wifi_monitor(ui: Arc<dyn UiSurface>, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("wifi-monitor".to_string())
        .spawn(move || {
            let mut last: Option<u8> = None;
            let mut next = Instant::now();
            while !stop.load(Ordering::Acquire) {
                if Instant::now() >= next {
                    let strength = wifi_strength();
                    match (last, strength) {
                        (_, Some(s)) => ui.set_wifi_strength(s),
                        (Some(_), None) => ui.show_error("wifi", "link lost", 5),
                        (None, None) => {}
                    }
                    last = strength;
                    next = Instant::now() + Duration::from_secs(5);
                }
                thread::sleep(Duration::from_millis(100));
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wireless() {
        let table = "Inter-| sta-|   Quality        |   Discarded packets               | Missed | WE\n face | tus | link level noise |  nwid  crypt   frag  retry   misc | beacon | 22\n wlan0: 0000   56.  -54.  -256        0      0      0      0     12        0\n";
        assert_eq!(parse_wireless(table), Some(80));
        assert_eq!(parse_wireless("header\nheader\n"), None);
    }
}
