use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use avsync_media::controls::KeyAction;
use avsync_media::frame_cache::FrameCache;
use avsync_media::playback::Playback;
use avsync_media::source::{spawn_ingest, Decoder, ToneDecoder};
use avsync_node::orchestrator::SyncOrchestrator;
use avsync_protocol::config::NetworkConfig;

/// Audio device period the null sink emulates
const SINK_PERIOD: Duration = Duration::from_millis(10);

#[derive(Parser, Debug)]
#[command(name = "avsync-node", about = "A/V sync playback node", version)]
struct Args {
    /// Path to configuration file (key=value, or TOML when it ends in .toml)
    #[arg(short, long, default_value = "config/node.conf")]
    config: PathBuf,

    /// Display name announced to peers
    #[arg(long)]
    name: Option<String>,

    /// Cueing port (listen and send)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable network sync at startup
    #[arg(long)]
    sync: bool,

    /// Send periodic sync cues for the current frame (implies --sync)
    #[arg(long)]
    master: bool,

    /// Frame rate of the generated test stream
    #[arg(long, default_value_t = 25.0)]
    fps: f64,

    /// Length of the generated test stream in seconds
    #[arg(long, default_value_t = 60.0)]
    duration: f64,

    /// Don't read key actions from stdin
    #[arg(long)]
    no_stdin: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(build = %avsync_protocol::build_info(), "avsync-node starting");

    let config = load_config(&args)?;

    // Decode the whole stream up front
    let decoder = ToneDecoder::new(args.duration, args.fps);
    let format = decoder.audio_format();
    let audio = Arc::new(FrameCache::new());
    let video = Arc::new(FrameCache::new());
    let ingest = spawn_ingest(decoder, Arc::clone(&audio), Arc::clone(&video))?;
    let report = tokio::task::spawn_blocking(move || ingest.join())
        .await?
        .map_err(|_| anyhow::anyhow!("ingest thread panicked"))?;
    if report.video_frames == 0 {
        anyhow::bail!("no video frames decoded");
    }

    let playback = Arc::new(Playback::new(video, audio, format));
    playback.start().context("failed to start audio feeder")?;

    let running = Arc::new(AtomicBool::new(true));
    let presenter = spawn_presenter(Arc::clone(&playback), args.fps, Arc::clone(&running))?;
    let sink = spawn_null_sink(Arc::clone(&playback), Arc::clone(&running))?;

    let orchestrator = Arc::new(SyncOrchestrator::new(config.clone()));
    wire_cue_handlers(&orchestrator, &playback);
    info!(
        id = orchestrator.local_id(),
        name = %orchestrator.local_name(),
        frames = playback.total_frames(),
        "Node ready"
    );

    if config.auto_sync_on_startup {
        if let Err(e) = orchestrator.enable().await {
            error!("Failed to enable network sync: {}", e);
        }
    }

    let master_handle = config.auto_master_on_startup.then(|| {
        let orchestrator = Arc::clone(&orchestrator);
        let playback = Arc::clone(&playback);
        let interval = config.sync_interval();
        tokio::spawn(async move { run_master(orchestrator, playback, interval).await })
    });

    let (key_tx, mut key_rx) = mpsc::unbounded_channel();
    if !args.no_stdin {
        spawn_key_reader(key_tx)?;
    }

    info!("Node running, press q + enter or ctrl-c to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                break;
            }
            Some(action) = key_rx.recv() => {
                if !handle_key(action, &orchestrator, &playback).await {
                    break;
                }
            }
        }
    }
    info!("Shutting down...");

    if let Some(handle) = master_handle {
        handle.abort();
    }
    orchestrator.disable().await;

    running.store(false, Ordering::Release);
    join_thread("presenter", presenter);
    join_thread("audio-sink", sink);
    playback.stop();

    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<NetworkConfig> {
    let mut config = if args.config.exists() {
        NetworkConfig::load(&args.config)?
    } else {
        info!(path = %args.config.display(), "No config file found, using defaults");
        NetworkConfig::default()
    };

    if let Some(name) = &args.name {
        config.client_name = name.clone();
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if args.sync || args.master {
        config.auto_sync_on_startup = true;
    }
    if args.master {
        config.auto_master_on_startup = true;
    }

    config.validate()?;
    Ok(config)
}

fn wire_cue_handlers(orchestrator: &SyncOrchestrator, playback: &Arc<Playback>) {
    let pb = Arc::clone(playback);
    orchestrator.on_sync_cue(move |frame| {
        pb.sync_to_frame(frame);
    });

    let pb = Arc::clone(playback);
    orchestrator.on_seek_cue(move |position| {
        pb.seek_to(position);
    });

    let pb = Arc::clone(playback);
    orchestrator.on_pause_cue(move || pb.pause());

    let pb = Arc::clone(playback);
    orchestrator.on_resume_cue(move || pb.resume());

    orchestrator.on_client_announced(|peer| {
        info!(peer_id = peer.id, name = %peer.name, ip = %peer.ip, "Peer announced");
    });
}

/// Paces `next_frame` at the stream rate. Stands in for the window's
/// render loop.
fn spawn_presenter(
    playback: Arc<Playback>,
    fps: f64,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    let period = Duration::from_secs_f64(1.0 / fps.max(1.0));
    let status_interval = status_every(fps);

    std::thread::Builder::new()
        .name("presenter".into())
        .spawn(move || {
            let mut deadline = Instant::now();
            let mut presented: u64 = 0;
            while running.load(Ordering::Acquire) {
                playback.next_frame();
                playback.resync_if_drifted();

                presented += 1;
                if presented % status_interval == 0 {
                    let status = playback.status();
                    debug!(
                        frame = status.frame,
                        video_time = status.video_time,
                        audio_clock = status.audio_clock,
                        buffered = status.buffered_bytes,
                        paused = status.paused,
                        "Playback status"
                    );
                }

                deadline += period;
                let now = Instant::now();
                if deadline > now {
                    std::thread::sleep(deadline - now);
                } else {
                    // fell behind, don't try to catch up
                    deadline = now;
                }
            }
        })
}

/// Frames between status lines, about five seconds' worth. Never zero.
fn status_every(fps: f64) -> u64 {
    // `as` saturates, and NaN lands on zero
    (fps.round() as u64).max(1).saturating_mul(5)
}

/// Pulls one device period from the output every `SINK_PERIOD` and discards
/// it. Keeps the audio path consuming when no sound device is attached.
fn spawn_null_sink(
    playback: Arc<Playback>,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    let output = playback.output();
    let period_bytes = output.format().bytes_per_second() * SINK_PERIOD.as_millis() as usize / 1000;

    std::thread::Builder::new()
        .name("audio-sink".into())
        .spawn(move || {
            let mut buf = vec![0u8; period_bytes];
            while running.load(Ordering::Acquire) {
                output.render(&mut buf);
                std::thread::sleep(SINK_PERIOD);
            }
        })
}

fn join_thread(name: &str, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        warn!(thread = name, "Thread panicked");
    }
}

async fn run_master(orchestrator: Arc<SyncOrchestrator>, playback: Arc<Playback>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_s = interval.as_secs_f64(), "Master sync running");

    loop {
        ticker.tick().await;
        if !orchestrator.is_enabled() || playback.is_paused() {
            continue;
        }
        let frame = playback.current_frame() as u32;
        if !orchestrator.send_sync(frame).await {
            debug!(frame = frame, "Master sync cue not fully delivered");
        }
    }
}

/// One key action per line of stdin. Blocking reads stay on their own
/// thread, which is left behind at exit.
fn spawn_key_reader(tx: mpsc::UnboundedSender<KeyAction>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("key-reader".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if let Some(action) = KeyAction::from_line(&line) {
                    if tx.send(action).is_err() {
                        break;
                    }
                }
            }
            debug!("stdin closed");
        })?;
    Ok(())
}

/// Apply a local key action and send the matching cue. False means quit.
async fn handle_key(action: KeyAction, orchestrator: &SyncOrchestrator, playback: &Playback) -> bool {
    match action {
        KeyAction::Quit => return false,
        KeyAction::TogglePause => {
            if playback.toggle_pause() {
                info!("Paused");
                orchestrator.send_pause().await;
            } else {
                info!("Resumed");
                orchestrator.send_resume().await;
            }
        }
        KeyAction::ToggleMute => {
            let muted = playback.toggle_mute();
            info!(muted = muted, "Mute toggled");
        }
        KeyAction::SeekPercent(percent) => {
            if playback.seek_to_percentage(percent as f64).is_some() {
                orchestrator.send_seek(playback.video_time()).await;
            }
        }
        KeyAction::SyncNow => {
            let frame = playback.current_frame() as u32;
            info!(frame = frame, "Sending sync cue");
            orchestrator.send_sync(frame).await;
        }
    }
    true
}
