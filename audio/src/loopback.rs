//! In-process backend: the "microphone" is whatever gets fed through a
//! [`LoopbackHandle`], and the "speaker" is a bounded queue.
//!
//! In paced mode both directions run at the configured sample rate, so the
//! capture loop sees a strict frame cadence (silence when nothing is fed) and
//! speaker writes apply real back-pressure. Unpaced mode is for tests: reads
//! return fed samples as soon as they exist and the speaker only drains when
//! the test takes samples out.

use crate::backend::{AudioBackend, Direction};
use crate::error::{AudioError, Result};
use crate::ring::SampleQueue;
use crate::types::{AudioConfig, AudioMode, SAMPLE_RATE};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const MIC_QUEUE_SAMPLES: usize = SAMPLE_RATE as usize * 2;
const MAX_CLOCK_LAG: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Run both directions at real-time rate.
    pub paced: bool,
    /// Keep every sample that reaches the speaker for inspection.
    pub capture_speaker: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            paced: true,
            capture_speaker: false,
        }
    }
}

struct Shared {
    config: LoopbackConfig,
    sample_rate: AtomicU32,
    mic: SampleQueue,
    speaker: Mutex<Option<Arc<SampleQueue>>>,
    played: SampleQueue,
    mic_clock: Mutex<Option<Instant>>,
    speaker_clock: Mutex<Option<Instant>>,
    samples_played: AtomicU64,
    mic_running: AtomicBool,
    speaker_running: AtomicBool,
    fail_next_read: AtomicBool,
}

impl Shared {
    fn speaker_queue(&self) -> Option<Arc<SampleQueue>> {
        self.speaker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn samples_duration(&self, samples: usize) -> Duration {
        let rate = self.sample_rate.load(Ordering::Relaxed).max(1) as u64;
        Duration::from_micros(samples as u64 * 1_000_000 / rate)
    }

    fn elapsed_samples(&self, elapsed: Duration) -> usize {
        let rate = self.sample_rate.load(Ordering::Relaxed) as u128;
        (elapsed.as_micros() * rate / 1_000_000) as usize
    }

    /// Move whatever real time has consumed out of the speaker queue.
    fn drain_played(&self, queue: &SampleQueue) {
        let mut clock = self.speaker_clock.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let last = clock.unwrap_or(now);
        let due = self.elapsed_samples(now.saturating_duration_since(last));
        if due == 0 && clock.is_some() {
            return;
        }

        let mut moved = 0;
        if self.config.capture_speaker {
            let mut chunk = [0i16; 256];
            while moved < due {
                let want = (due - moved).min(chunk.len());
                let got = queue.pop_into(&mut chunk[..want], 0, Duration::ZERO);
                if got == 0 {
                    break;
                }
                self.played.push_overwrite(&chunk[..got]);
                moved += got;
            }
        } else {
            moved = queue.discard(due);
        }
        self.samples_played.fetch_add(moved as u64, Ordering::Relaxed);
        *clock = Some(now);
    }
}

/// Backend with no hardware behind it.
pub struct LoopbackBackend {
    shared: Arc<Shared>,
}

/// Test and demo access to a [`LoopbackBackend`] after it moved into a device.
#[derive(Clone)]
pub struct LoopbackHandle {
    shared: Arc<Shared>,
}

impl LoopbackBackend {
    pub fn new(config: LoopbackConfig) -> (Self, LoopbackHandle) {
        let shared = Arc::new(Shared {
            config,
            sample_rate: AtomicU32::new(SAMPLE_RATE),
            mic: SampleQueue::new(MIC_QUEUE_SAMPLES),
            speaker: Mutex::new(None),
            played: SampleQueue::new(MIC_QUEUE_SAMPLES * 4),
            mic_clock: Mutex::new(None),
            speaker_clock: Mutex::new(None),
            samples_played: AtomicU64::new(0),
            mic_running: AtomicBool::new(false),
            speaker_running: AtomicBool::new(false),
            fail_next_read: AtomicBool::new(false),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            LoopbackHandle { shared },
        )
    }

    pub fn paced() -> (Self, LoopbackHandle) {
        Self::new(LoopbackConfig::default())
    }

    pub fn unpaced() -> (Self, LoopbackHandle) {
        Self::new(LoopbackConfig {
            paced: false,
            capture_speaker: true,
        })
    }
}

impl LoopbackHandle {
    /// Queue samples for the microphone to return.
    pub fn feed_mic(&self, samples: &[i16]) {
        self.shared.mic.push_overwrite(samples);
    }

    pub fn mic_queued(&self) -> usize {
        self.shared.mic.len()
    }

    /// Fed samples discarded because nobody read them in time.
    pub fn mic_overflow(&self) -> u64 {
        self.shared.mic.dropped()
    }

    /// Samples waiting in the speaker queue.
    pub fn speaker_queued(&self) -> usize {
        self.shared.speaker_queue().map(|q| q.len()).unwrap_or(0)
    }

    /// Take up to `max` samples out of the speaker side.
    ///
    /// In unpaced mode this drains the speaker queue directly. In paced mode
    /// with `capture_speaker` it returns what real time has already played.
    pub fn take_speaker(&self, max: usize) -> Vec<i16> {
        let mut out = vec![0i16; max];
        let got = if self.shared.config.paced {
            if let Some(queue) = self.shared.speaker_queue() {
                self.shared.drain_played(&queue);
            }
            self.shared.played.pop_into(&mut out, 0, Duration::ZERO)
        } else {
            match self.shared.speaker_queue() {
                Some(queue) => {
                    let got = queue.pop_into(&mut out, 0, Duration::ZERO);
                    if got > 0 {
                        self.shared
                            .samples_played
                            .fetch_add(got as u64, Ordering::Relaxed);
                    }
                    got
                }
                None => 0,
            }
        };
        out.truncate(got);
        out
    }

    pub fn samples_played(&self) -> u64 {
        self.shared.samples_played.load(Ordering::Relaxed)
    }

    pub fn mic_running(&self) -> bool {
        self.shared.mic_running.load(Ordering::Relaxed)
    }

    pub fn speaker_running(&self) -> bool {
        self.shared.speaker_running.load(Ordering::Relaxed)
    }

    /// Make the next mic read fail with an I/O error.
    pub fn inject_read_error(&self) {
        self.shared.fail_next_read.store(true, Ordering::Relaxed);
    }
}

impl AudioBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn configure(&self, mode: AudioMode, config: &AudioConfig) -> Result<()> {
        if config.sample_rate == 0 {
            return Err(AudioError::InvalidArgument("sample rate is zero".into()));
        }
        self.shared
            .sample_rate
            .store(config.sample_rate, Ordering::Relaxed);

        let mut speaker = self.shared.speaker.lock().unwrap_or_else(|e| e.into_inner());
        if mode.has_speaker() {
            if speaker.is_none() {
                let capacity = config.speaker_buffer_frames.max(1) * config.frame_samples();
                *speaker = Some(Arc::new(SampleQueue::new(capacity)));
            }
        } else {
            *speaker = None;
        }

        debug!("🔁 Loopback routed for {:?}", mode);
        Ok(())
    }

    fn start(&self, direction: Direction) -> Result<()> {
        match direction {
            Direction::Mic => {
                *self.shared.mic_clock.lock().unwrap_or_else(|e| e.into_inner()) = None;
                self.shared.mic_running.store(true, Ordering::Relaxed);
            }
            Direction::Speaker => {
                *self
                    .shared
                    .speaker_clock
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = None;
                self.shared.speaker_running.store(true, Ordering::Relaxed);
            }
        }
        info!("🔁 Loopback {:?} started", direction);
        Ok(())
    }

    fn stop(&self, direction: Direction) {
        match direction {
            Direction::Mic => self.shared.mic_running.store(false, Ordering::Relaxed),
            Direction::Speaker => self.shared.speaker_running.store(false, Ordering::Relaxed),
        }
        debug!("🔁 Loopback {:?} stopped", direction);
    }

    fn read(&self, buf: &mut [i16], timeout: Duration) -> Result<usize> {
        if self.shared.fail_next_read.swap(false, Ordering::Relaxed) {
            return Err(std::io::Error::other("injected mic failure").into());
        }

        if !self.shared.config.paced {
            return Ok(self.shared.mic.pop_into(buf, buf.len(), timeout));
        }

        let mut clock = self.shared.mic_clock.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut due = clock.unwrap_or(now);
        if now.saturating_duration_since(due) > MAX_CLOCK_LAG {
            due = now;
        }
        if due > now {
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(0);
            }
            thread::sleep(wait);
        }

        let got = self.shared.mic.pop_into(buf, 0, Duration::ZERO);
        buf[got..].fill(0);
        *clock = Some(due + self.shared.samples_duration(buf.len()));
        Ok(buf.len())
    }

    fn write(&self, buf: &[i16], timeout: Duration) -> Result<usize> {
        let Some(queue) = self.shared.speaker_queue() else {
            return Err(AudioError::Device("speaker not routed".into()));
        };

        if !self.shared.config.paced {
            return Ok(queue.push_bounded(buf, timeout));
        }

        let deadline = Instant::now() + timeout;
        loop {
            self.shared.drain_played(&queue);
            let accepted = queue.try_push(buf);
            if accepted > 0 || buf.is_empty() {
                return Ok(accepted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            // Wait for roughly one frame of playout.
            let step = self.shared.samples_duration(buf.len().min(320)).max(Duration::from_millis(1));
            thread::sleep(step.min(deadline - now));
        }
    }

    fn clear(&self, mic: bool, speaker: bool) {
        if mic {
            self.shared.mic.clear();
        }
        if speaker {
            if let Some(queue) = self.shared.speaker_queue() {
                queue.clear();
            }
        }
    }
}
