use anyhow::{bail, Context};
use audio::LoopbackHandle;
use clap::Parser;
use howdy_edge::ui::{LoggingUi, ThrottledUi, UiSurface};
use howdy_edge::{EdgeConfig, EdgeRuntime};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "howdy-edge")]
#[command(about = "HowdyTTS voice endpoint: wake word, UDP audio streaming and TTS playback")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server address ("ip" or "ip:audio_port"); skips discovery
    #[arg(short, long)]
    server: Option<String>,

    /// Device identifier reported to the server
    #[arg(long)]
    device_id: Option<String>,

    /// Audio backend: loopback or cpal
    #[arg(long)]
    backend: Option<String>,

    /// Port of the local HTTP surface
    #[arg(long)]
    http_port: Option<u16>,

    /// Do not broadcast for servers
    #[arg(long)]
    no_discovery: bool,

    /// Feed a 16 kHz mono WAV file into the loopback microphone
    #[arg(long)]
    mic_wav: Option<PathBuf>,

    /// Repeat the WAV file until stopped
    #[arg(long, requires = "mic_wav")]
    loop_wav: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = load_config(&args)?;
    info!(
        "🚀 Starting {} ({}) in {}",
        config.device.device_name, config.device.device_id, config.device.room
    );

    let ui: Arc<dyn UiSurface> = Arc::new(ThrottledUi::new(
        LoggingUi,
        Duration::from_millis(config.processor.ui_update_interval_ms),
    ));
    let grace = Duration::from_millis(config.control.connect_timeout_ms.max(1000));

    let mut runtime = EdgeRuntime::build(config, ui).context("building the endpoint")?;

    let stop = runtime.stop_flag();
    let signal_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        info!("🛑 Interrupt received");
        signal_stop.store(true, Ordering::Release);
    })
    .context("installing the Ctrl-C handler")?;

    runtime.start().context("starting the endpoint")?;

    let feeder = match &args.mic_wav {
        Some(path) => {
            let Some(loopback) = runtime.loopback().cloned() else {
                bail!("--mic-wav needs the loopback backend");
            };
            let samples = read_wav(path)?;
            let stop = Arc::clone(&stop);
            let repeat = args.loop_wav;
            Some(
                thread::Builder::new()
                    .name("wav-feeder".to_string())
                    .spawn(move || feed_mic(&loopback, &samples, repeat, &stop))
                    .context("spawning the WAV feeder")?,
            )
        }
        None => None,
    };

    runtime.wait();
    runtime.shutdown(grace);
    if let Some(feeder) = feeder {
        if feeder.join().is_err() {
            error!("💥 WAV feeder panicked");
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<EdgeConfig> {
    let mut config = match &args.config {
        Some(path) => EdgeConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EdgeConfig::default(),
    };
    config = config.with_env_overrides()?;

    if let Some(server) = &args.server {
        config.server = Some(server.clone());
    }
    if let Some(device_id) = &args.device_id {
        config.device.device_id = device_id.clone();
    }
    if let Some(backend) = &args.backend {
        config.audio.backend = backend.parse().map_err(anyhow::Error::msg)?;
    }
    if let Some(port) = args.http_port {
        config.http.port = port;
    }
    if args.no_discovery {
        config.discovery.enabled = false;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn read_wav(path: &Path) -> anyhow::Result<Vec<i16>> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_rate != 16000 || spec.channels != 1 || spec.bits_per_sample != 16 {
        bail!(
            "{} is {} Hz, {} channel(s), {} bit; need 16000 Hz mono 16 bit",
            path.display(),
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample
        );
    }
    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading {}", path.display()))?;
    info!("🎵 Loaded {} samples from {}", samples.len(), path.display());
    Ok(samples)
}

/// Push audio into the loopback microphone at real-time pace.
fn feed_mic(loopback: &LoopbackHandle, samples: &[i16], repeat: bool, stop: &AtomicBool) {
    const CHUNK: usize = 320;
    const CHUNK_TIME: Duration = Duration::from_millis(20);

    loop {
        let mut next = Instant::now();
        for chunk in samples.chunks(CHUNK) {
            if stop.load(Ordering::Acquire) {
                return;
            }
            loopback.feed_mic(chunk);
            next += CHUNK_TIME;
            thread::sleep(next.saturating_duration_since(Instant::now()));
        }
        if !repeat {
            break;
        }
    }
    if loopback.mic_overflow() > 0 {
        warn!("⚠️ Loopback microphone overflowed {} times", loopback.mic_overflow());
    }
    info!("🎵 WAV playback into microphone finished");
}
