//! Hardware backend on top of cpal.
//!
//! cpal streams are not `Send` on every platform, so a dedicated thread owns
//! them for as long as the routing stays the same. Callbacks exchange samples
//! with the device through split `ringbuf` halves: each callback owns its half
//! outright and never takes a lock.

use crate::backend::{AudioBackend, Direction};
use crate::error::{AudioError, Result};
use crate::types::{AudioConfig, AudioMode};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream};
use crossbeam::channel::{bounded, Sender};
use log::{debug, error, info, warn};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

const MIC_QUEUE_FRAMES: usize = 10;
const POLL: Duration = Duration::from_millis(2);

struct StreamThread {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// The device-thread halves of the rings. The callback halves live in the
/// stream closures.
struct Queues {
    mic: Mutex<HeapCons<i16>>,
    speaker: Mutex<HeapProd<i16>>,
}

/// Shared between the backend and the stream callbacks.
#[derive(Default)]
struct CallbackFlags {
    mic_enabled: AtomicBool,
    speaker_enabled: AtomicBool,
    /// Set by `clear`; the output callback empties its ring and resets it.
    flush_speaker: AtomicBool,
    output_underruns: AtomicU64,
    mic_overflow: AtomicU64,
}

pub struct CpalBackend {
    queues: Mutex<Option<Arc<Queues>>>,
    streams: Mutex<Option<StreamThread>>,
    flags: Arc<CallbackFlags>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(None),
            streams: Mutex::new(None),
            flags: Arc::new(CallbackFlags::default()),
        }
    }

    /// Callback-level underruns on the output stream.
    pub fn output_underruns(&self) -> u64 {
        self.flags.output_underruns.load(Ordering::Relaxed)
    }

    /// Mic samples the input callback could not queue.
    pub fn mic_overflow(&self) -> u64 {
        self.flags.mic_overflow.load(Ordering::Relaxed)
    }

    fn queues(&self) -> Result<Arc<Queues>> {
        lock(&self.queues).clone().ok_or(AudioError::NotInitialized)
    }

    /// Fresh rings for a new routing. Returns the halves the callbacks own.
    fn install_rings(&self, config: &AudioConfig) -> (HeapProd<i16>, HeapCons<i16>) {
        let frame = config.frame_samples().max(1);
        let (mic_prod, mic_cons) = HeapRb::<i16>::new(frame * MIC_QUEUE_FRAMES).split();
        let (speaker_prod, speaker_cons) =
            HeapRb::<i16>::new(frame * config.speaker_buffer_frames.max(1)).split();
        *lock(&self.queues) = Some(Arc::new(Queues {
            mic: Mutex::new(mic_cons),
            speaker: Mutex::new(speaker_prod),
        }));
        self.flags.flush_speaker.store(false, Ordering::Release);
        (mic_prod, speaker_cons)
    }

    fn shutdown_streams(&self) {
        if let Some(streams) = lock(&self.streams).take() {
            let _ = streams.stop.send(());
            if streams.handle.join().is_err() {
                error!("❌ cpal stream thread panicked");
            }
        }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.shutdown_streams();
    }
}

fn find_device(host: &cpal::Host, name: Option<&str>, input: bool) -> Result<Device> {
    match name {
        Some(wanted) => host
            .devices()
            .map_err(|e| AudioError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| AudioError::Device(format!("device not found: {wanted}"))),
        None if input => host
            .default_input_device()
            .ok_or_else(|| AudioError::Device("no default input device".into())),
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::Device("no default output device".into())),
    }
}

/// Pick a config that runs at exactly `rate`, preferring i16, then f32, then u16.
fn select_config(
    ranges: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
    rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(u8, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        if rate < range.min_sample_rate().0 || rate > range.max_sample_rate().0 {
            continue;
        }
        let rank = match range.sample_format() {
            SampleFormat::I16 => 0,
            SampleFormat::F32 => 1,
            SampleFormat::U16 => 2,
            _ => continue,
        };
        if best.as_ref().map(|(r, _)| rank < *r).unwrap_or(true) {
            best = Some((rank, range.with_sample_rate(cpal::SampleRate(rate))));
        }
    }
    best.map(|(_, config)| config)
        .ok_or_else(|| AudioError::Device(format!("no {rate} Hz stream config")))
}

fn build_input<T>(
    device: &Device,
    config: &cpal::StreamConfig,
    mut mic: HeapProd<i16>,
    flags: Arc<CallbackFlags>,
) -> Result<Stream>
where
    T: Sample + SizedSample + Send + 'static,
    i16: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut mono: Vec<i16> = Vec::with_capacity(4096);
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !flags.mic_enabled.load(Ordering::Relaxed) {
                    return;
                }
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| i16::from_sample(frame[0])));
                let queued = mic.push_slice(&mono);
                if queued < mono.len() {
                    flags
                        .mic_overflow
                        .fetch_add((mono.len() - queued) as u64, Ordering::Relaxed);
                }
            },
            |err| error!("❌ Input stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))
}

fn build_output<T>(
    device: &Device,
    config: &cpal::StreamConfig,
    mut speaker: HeapCons<i16>,
    flags: Arc<CallbackFlags>,
) -> Result<Stream>
where
    T: Sample + SizedSample + FromSample<i16> + Send + 'static,
{
    let channels = config.channels as usize;
    let mut mono: Vec<i16> = Vec::with_capacity(4096);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels.max(1);
                mono.resize(frames, 0);
                if flags.flush_speaker.swap(false, Ordering::AcqRel) {
                    speaker.clear();
                }
                let got = if flags.speaker_enabled.load(Ordering::Relaxed) {
                    speaker.pop_slice(&mut mono)
                } else {
                    0
                };
                if got < frames {
                    mono[got..].fill(0);
                    if got > 0 {
                        flags.output_underruns.fetch_add(1, Ordering::Relaxed);
                    }
                }
                for (frame, sample) in data.chunks_mut(channels).zip(mono.iter()) {
                    let value = T::from_sample(*sample);
                    frame.iter_mut().for_each(|slot| *slot = value);
                }
            },
            |err| error!("❌ Output stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))
}

fn open_streams(
    mode: AudioMode,
    config: &AudioConfig,
    mic: HeapProd<i16>,
    speaker: HeapCons<i16>,
    flags: &Arc<CallbackFlags>,
) -> Result<Vec<Stream>> {
    let host = cpal::default_host();
    info!("🎤 Opening cpal streams on host {:?}", host.id());
    let mut streams = Vec::new();

    if mode.has_mic() {
        let device = find_device(&host, config.input_device.as_deref(), true)?;
        let ranges = device
            .supported_input_configs()
            .map_err(|e| AudioError::Device(e.to_string()))?;
        let supported = select_config(ranges, config.sample_rate)?;
        let stream_config = supported.config();
        info!(
            "🎤 Input {:?}: {} ch {:?}",
            device.name().ok(),
            stream_config.channels,
            supported.sample_format()
        );
        let flags = Arc::clone(flags);
        let stream = match supported.sample_format() {
            SampleFormat::I16 => build_input::<i16>(&device, &stream_config, mic, flags)?,
            SampleFormat::F32 => build_input::<f32>(&device, &stream_config, mic, flags)?,
            SampleFormat::U16 => build_input::<u16>(&device, &stream_config, mic, flags)?,
            other => return Err(AudioError::Device(format!("unsupported format {other:?}"))),
        };
        streams.push(stream);
    }

    if mode.has_speaker() {
        let device = find_device(&host, config.output_device.as_deref(), false)?;
        let ranges = device
            .supported_output_configs()
            .map_err(|e| AudioError::Device(e.to_string()))?;
        let supported = select_config(ranges, config.sample_rate)?;
        let stream_config = supported.config();
        info!(
            "🔊 Output {:?}: {} ch {:?}",
            device.name().ok(),
            stream_config.channels,
            supported.sample_format()
        );
        let flags = Arc::clone(flags);
        let stream = match supported.sample_format() {
            SampleFormat::I16 => build_output::<i16>(&device, &stream_config, speaker, flags)?,
            SampleFormat::F32 => build_output::<f32>(&device, &stream_config, speaker, flags)?,
            SampleFormat::U16 => build_output::<u16>(&device, &stream_config, speaker, flags)?,
            other => return Err(AudioError::Device(format!("unsupported format {other:?}"))),
        };
        streams.push(stream);
    }

    for stream in &streams {
        stream
            .play()
            .map_err(|e| AudioError::Stream(e.to_string()))?;
    }
    Ok(streams)
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn configure(&self, mode: AudioMode, config: &AudioConfig) -> Result<()> {
        self.shutdown_streams();

        let (mic_prod, speaker_cons) = self.install_rings(config);

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let config = config.clone();
        let flags = Arc::clone(&self.flags);

        let handle = thread::Builder::new()
            .name("cpal-streams".into())
            .spawn(move || {
                let streams = match open_streams(mode, &config, mic_prod, speaker_cons, &flags) {
                    Ok(streams) => {
                        let _ = ready_tx.send(Ok(()));
                        streams
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Hold the streams until routing changes.
                let _ = stop_rx.recv();
                drop(streams);
                debug!("🎤 cpal streams closed");
            })?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                *lock(&self.streams) = Some(StreamThread {
                    stop: stop_tx,
                    handle,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                warn!("⚠️ cpal stream setup did not report back");
                let _ = stop_tx.send(());
                Err(AudioError::Device("stream setup timed out".into()))
            }
        }
    }

    fn start(&self, direction: Direction) -> Result<()> {
        match direction {
            Direction::Mic => self.flags.mic_enabled.store(true, Ordering::Relaxed),
            Direction::Speaker => self.flags.speaker_enabled.store(true, Ordering::Relaxed),
        }
        Ok(())
    }

    fn stop(&self, direction: Direction) {
        match direction {
            Direction::Mic => self.flags.mic_enabled.store(false, Ordering::Relaxed),
            Direction::Speaker => self.flags.speaker_enabled.store(false, Ordering::Relaxed),
        }
    }

    fn read(&self, buf: &mut [i16], timeout: Duration) -> Result<usize> {
        let queues = self.queues()?;
        let deadline = Instant::now() + timeout;
        let mut mic = lock(&queues.mic);
        while mic.occupied_len() < buf.len() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(POLL.min(deadline - now));
        }
        Ok(mic.pop_slice(buf))
    }

    fn write(&self, buf: &[i16], timeout: Duration) -> Result<usize> {
        let queues = self.queues()?;
        let deadline = Instant::now() + timeout;
        let mut speaker = lock(&queues.speaker);
        loop {
            let accepted = speaker.push_slice(buf);
            if accepted > 0 || buf.is_empty() {
                return Ok(accepted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            thread::sleep(POLL.min(deadline - now));
        }
    }

    fn clear(&self, mic: bool, speaker: bool) {
        let Ok(queues) = self.queues() else {
            return;
        };
        if mic {
            lock(&queues.mic).clear();
        }
        if speaker {
            self.flags.flush_speaker.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercises the device-side halves without opening hardware streams.
    #[test]
    fn test_rings_connect_device_and_callbacks() {
        let backend = CpalBackend::new();
        let config = AudioConfig::default();
        let frame = config.frame_samples();
        let (mut mic_cb, mut speaker_cb) = backend.install_rings(&config);

        assert_eq!(mic_cb.push_slice(&vec![9i16; frame]), frame);
        let mut buf = vec![0i16; frame];
        assert_eq!(backend.read(&mut buf, Duration::from_millis(50)).unwrap(), frame);
        assert!(buf.iter().all(|&s| s == 9));

        assert_eq!(backend.write(&vec![4i16; frame], Duration::ZERO).unwrap(), frame);
        let mut out = vec![0i16; frame];
        assert_eq!(speaker_cb.pop_slice(&mut out), frame);
        assert!(out.iter().all(|&s| s == 4));
    }

    #[test]
    fn test_read_times_out_short() {
        let backend = CpalBackend::new();
        let config = AudioConfig::default();
        let (mut mic_cb, _speaker_cb) = backend.install_rings(&config);
        mic_cb.push_slice(&[1i16; 100]);

        let mut buf = vec![0i16; config.frame_samples()];
        let started = Instant::now();
        assert_eq!(backend.read(&mut buf, Duration::from_millis(20)).unwrap(), 100);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_clear_flushes_through_callback_flag() {
        let backend = CpalBackend::new();
        let config = AudioConfig::default();
        let (_mic_cb, speaker_cb) = backend.install_rings(&config);
        backend.write(&[3i16; 64], Duration::ZERO).unwrap();

        backend.clear(false, true);
        assert!(backend.flags.flush_speaker.load(Ordering::Acquire));
        // The callback half still holds the samples until it runs.
        assert_eq!(speaker_cb.occupied_len(), 64);
    }

    #[test]
    fn test_unconfigured_backend_refuses_io() {
        let backend = CpalBackend::new();
        let mut buf = [0i16; 8];
        assert!(matches!(
            backend.read(&mut buf, Duration::ZERO),
            Err(AudioError::NotInitialized)
        ));
    }
}
