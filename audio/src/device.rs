use crate::backend::{AudioBackend, Direction};
use crate::error::{AudioError, Result};
use crate::types::{apply_gain, AudioConfig, AudioMode};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

/// Largest block the speaker path scales at once.
const WRITE_BLOCK: usize = 512;

#[derive(Default)]
struct DeviceCounters {
    mic_reads: AtomicU64,
    samples_read: AtomicU64,
    mic_errors: AtomicU64,
    mic_timeouts: AtomicU64,
    read_latency_us: AtomicU64,
    speaker_writes: AtomicU64,
    samples_written: AtomicU64,
    partial_writes: AtomicU64,
    speaker_errors: AtomicU64,
    mode_switches: AtomicU64,
}

/// Snapshot of the device counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DeviceStats {
    pub mic_reads: u64,
    pub samples_read: u64,
    pub mic_errors: u64,
    pub mic_timeouts: u64,
    pub avg_read_latency_us: u64,
    pub speaker_writes: u64,
    pub samples_written: u64,
    pub partial_writes: u64,
    pub speaker_errors: u64,
    pub mode_switches: u64,
}

/// Full-duplex 16-bit PCM device.
///
/// One reader and one writer may use the device concurrently. A mode switch
/// waits for both to leave, and any read or write that starts while a switch
/// is pending fails with [`AudioError::ModeSwitched`].
pub struct AudioDevice {
    backend: Box<dyn AudioBackend>,
    config: AudioConfig,
    mode: RwLock<AudioMode>,
    switching: AtomicBool,
    initialized: AtomicBool,
    running: AtomicBool,
    volume_bits: AtomicU32,
    mic_gain_bits: AtomicU32,
    reader: Mutex<()>,
    writer: Mutex<Box<[i16]>>,
    counters: DeviceCounters,
}

impl AudioDevice {
    pub fn init(config: AudioConfig, backend: Box<dyn AudioBackend>) -> Result<Self> {
        if config.sample_rate == 0 || config.frame_samples() == 0 {
            return Err(AudioError::InvalidArgument(format!(
                "unusable format {} Hz / {} ms",
                config.sample_rate, config.frame_ms
            )));
        }
        if !(0.0..=1.0).contains(&config.speaker_volume) {
            return Err(AudioError::InvalidArgument(format!(
                "speaker volume {} outside 0..1",
                config.speaker_volume
            )));
        }

        backend.configure(config.mode, &config)?;

        info!(
            "🎛️ Audio device ready: {} backend, {:?}, {} Hz, {} samples/frame",
            backend.name(),
            config.mode,
            config.sample_rate,
            config.frame_samples()
        );

        Ok(Self {
            backend,
            mode: RwLock::new(config.mode),
            switching: AtomicBool::new(false),
            initialized: AtomicBool::new(true),
            running: AtomicBool::new(false),
            volume_bits: AtomicU32::new(config.speaker_volume.to_bits()),
            mic_gain_bits: AtomicU32::new(config.mic_gain.to_bits()),
            reader: Mutex::new(()),
            writer: Mutex::new(vec![0i16; WRITE_BLOCK].into_boxed_slice()),
            counters: DeviceCounters::default(),
            config,
        })
    }

    pub fn deinit(&self) {
        if self.initialized.swap(false, Ordering::AcqRel) {
            self.stop();
            info!("🎛️ Audio device released");
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn frame_samples(&self) -> usize {
        self.config.frame_samples()
    }

    pub fn mode(&self) -> AudioMode {
        *self.mode.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(AudioError::NotInitialized)
        }
    }

    /// Switch routing: stop the directions leaving, reconfigure, start the
    /// directions joining. Blocks until in-flight reads and writes finish.
    pub fn set_mode(&self, mode: AudioMode) -> Result<()> {
        self.ensure_initialized()?;

        self.switching.store(true, Ordering::Release);
        let result = {
            let mut current = self.mode.write().unwrap_or_else(|e| e.into_inner());
            let result = self.switch(*current, mode);
            if result.is_ok() {
                *current = mode;
            }
            result
        };
        self.switching.store(false, Ordering::Release);

        match &result {
            Ok(()) => {
                self.counters.mode_switches.fetch_add(1, Ordering::Relaxed);
                info!("🎛️ Audio mode switched to {:?}", mode);
            }
            Err(e) => error!("❌ Audio mode switch to {:?} failed: {}", mode, e),
        }
        result
    }

    fn switch(&self, from: AudioMode, to: AudioMode) -> Result<()> {
        let running = self.is_running();
        if running {
            if from.has_mic() && !to.has_mic() {
                self.backend.stop(Direction::Mic);
            }
            if from.has_speaker() && !to.has_speaker() {
                self.backend.stop(Direction::Speaker);
            }
        }

        self.backend.configure(to, &self.config)?;

        if running {
            if to.has_mic() && !from.has_mic() {
                self.backend.start(Direction::Mic)?;
            }
            if to.has_speaker() && !from.has_speaker() {
                self.backend.start(Direction::Speaker)?;
            }
        }
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.ensure_initialized()?;
        let mode = self.mode.write().unwrap_or_else(|e| e.into_inner());
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        if mode.has_mic() {
            self.backend.start(Direction::Mic)?;
        }
        if mode.has_speaker() {
            if let Err(e) = self.backend.start(Direction::Speaker) {
                self.backend.stop(Direction::Mic);
                return Err(e);
            }
        }
        self.running.store(true, Ordering::Release);
        info!("▶️ Audio device started ({:?})", *mode);
        Ok(())
    }

    pub fn stop(&self) {
        let mode = self.mode.write().unwrap_or_else(|e| e.into_inner());
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if mode.has_mic() {
            self.backend.stop(Direction::Mic);
        }
        if mode.has_speaker() {
            self.backend.stop(Direction::Speaker);
        }
        info!("⏹️ Audio device stopped");
    }

    /// Read up to `buf.len()` samples from the microphone.
    ///
    /// Returns the number of whole samples read; zero means the timeout
    /// expired with nothing captured.
    pub fn read_mic(&self, buf: &mut [i16], timeout: Duration) -> Result<usize> {
        self.ensure_initialized()?;
        if self.switching.load(Ordering::Acquire) {
            return Err(AudioError::ModeSwitched);
        }
        let mode = self.mode.read().unwrap_or_else(|e| e.into_inner());
        if self.switching.load(Ordering::Acquire) {
            return Err(AudioError::ModeSwitched);
        }
        if !self.is_running() || !mode.has_mic() {
            return Err(AudioError::NotActive);
        }

        let _reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        let started = Instant::now();
        let count = match self.backend.read(buf, timeout) {
            Ok(count) => count.min(buf.len()),
            Err(e) => {
                self.counters.mic_errors.fetch_add(1, Ordering::Relaxed);
                warn!("⚠️ Mic read failed: {}", e);
                return Err(e);
            }
        };

        apply_gain(&mut buf[..count], self.mic_gain());

        self.counters.mic_reads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .samples_read
            .fetch_add(count as u64, Ordering::Relaxed);
        self.counters
            .read_latency_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        if count == 0 {
            self.counters.mic_timeouts.fetch_add(1, Ordering::Relaxed);
        }
        Ok(count)
    }

    /// Queue samples for playback at the current volume.
    ///
    /// Returns how many samples were accepted. A short count is back-pressure:
    /// the accepted prefix is already queued and must not be sent again.
    pub fn write_speaker(&self, buf: &[i16], timeout: Duration) -> Result<usize> {
        self.ensure_initialized()?;
        if self.switching.load(Ordering::Acquire) {
            return Err(AudioError::ModeSwitched);
        }
        let mode = self.mode.read().unwrap_or_else(|e| e.into_inner());
        if self.switching.load(Ordering::Acquire) {
            return Err(AudioError::ModeSwitched);
        }
        if !self.is_running() || !mode.has_speaker() {
            return Err(AudioError::NotActive);
        }

        let mut scratch = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let volume = self.volume();
        let deadline = Instant::now() + timeout;
        let mut accepted = 0;

        for block in buf.chunks(scratch.len()) {
            let scaled = &mut scratch[..block.len()];
            scaled.copy_from_slice(block);
            apply_gain(scaled, volume);

            let remaining = deadline.saturating_duration_since(Instant::now());
            let written = match self.backend.write(scaled, remaining) {
                Ok(written) => written.min(block.len()),
                Err(e) => {
                    self.counters.speaker_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("⚠️ Speaker write failed after {} samples: {}", accepted, e);
                    if accepted > 0 {
                        break;
                    }
                    return Err(e);
                }
            };
            accepted += written;
            if written < block.len() {
                break;
            }
        }

        self.counters.speaker_writes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .samples_written
            .fetch_add(accepted as u64, Ordering::Relaxed);
        if accepted < buf.len() {
            self.counters.partial_writes.fetch_add(1, Ordering::Relaxed);
            debug!("🔊 Partial speaker write {}/{}", accepted, buf.len());
        }
        Ok(accepted)
    }

    /// Drop whatever is buffered in the backend for the selected directions.
    pub fn clear_dma(&self, mic: bool, speaker: bool) {
        self.backend.clear(mic, speaker);
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(AudioError::InvalidArgument(format!(
                "volume {volume} outside 0..1"
            )));
        }
        self.volume_bits.store(volume.to_bits(), Ordering::Relaxed);
        debug!("🔊 Speaker volume {:.2}", volume);
        Ok(())
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    pub fn set_mic_gain(&self, gain: f32) -> Result<()> {
        if !(0.0..=16.0).contains(&gain) {
            return Err(AudioError::InvalidArgument(format!(
                "mic gain {gain} outside 0..16"
            )));
        }
        self.mic_gain_bits.store(gain.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    pub fn mic_gain(&self) -> f32 {
        f32::from_bits(self.mic_gain_bits.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> DeviceStats {
        let c = &self.counters;
        let reads = c.mic_reads.load(Ordering::Relaxed);
        DeviceStats {
            mic_reads: reads,
            samples_read: c.samples_read.load(Ordering::Relaxed),
            mic_errors: c.mic_errors.load(Ordering::Relaxed),
            mic_timeouts: c.mic_timeouts.load(Ordering::Relaxed),
            avg_read_latency_us: c.read_latency_us.load(Ordering::Relaxed) / reads.max(1),
            speaker_writes: c.speaker_writes.load(Ordering::Relaxed),
            samples_written: c.samples_written.load(Ordering::Relaxed),
            partial_writes: c.partial_writes.load(Ordering::Relaxed),
            speaker_errors: c.speaker_errors.load(Ordering::Relaxed),
            mode_switches: c.mode_switches.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        self.deinit();
    }
}
