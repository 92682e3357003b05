mod capture;
mod scenes;
mod terminal;

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Instant,
};

use clap::{Args, Parser, Subcommand};
use clift_core::{
    audio::spawn_test_signal,
    clock::{ClockSelector, ClockSource, NetworkClock},
    config::AppConfig,
    overlay::OverlayServer,
    scheduler::FrameScheduler,
    worker::StopSignal,
    Result,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref())?;

    match cli.command {
        Commands::Live(args) => run_live(args),
    }
}

fn run_live(args: LiveArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_path(path)?,
        None => AppConfig::live_defaults(),
    };
    args.apply(&mut config);
    if let Some((width, height)) = terminal::size() {
        config.scheduler.width = width;
        config.scheduler.height = height;
    }

    let mut use_test_signal = args.test_signal;
    if !use_test_signal {
        if let Err(error) = capture::detect_input(&mut config.audio) {
            warn!(%error, "no live audio input, feeding the test signal");
            use_test_signal = true;
        }
    }
    config.validate()?;
    info!(
        width = config.scheduler.width,
        height = config.scheduler.height,
        fps = config.scheduler.fps,
        bpm = config.clock.default_bpm,
        "starting live mode"
    );

    let now = Instant::now();
    let network: Option<Box<dyn ClockSource>> = if config.clock.network_available {
        match NetworkClock::spawn(&config.clock, now) {
            Ok(clock) => Some(Box::new(clock)),
            Err(error) => {
                warn!(%error, "network clock unavailable, local clock only");
                None
            }
        }
    } else {
        None
    };
    let clock = ClockSelector::new(&config.clock, network, now);
    let mut scheduler = FrameScheduler::new(&config, clock, Arc::new(scenes::registry()));

    let producer = scheduler.audio_producer();
    let capture = if use_test_signal {
        None
    } else {
        capture::spawn_capture(producer.clone())
            .map_err(|error| warn!(%error, "audio capture failed, feeding the test signal"))
            .ok()
    };
    let audio = match capture {
        Some(worker) => worker,
        None => spawn_test_signal(producer, &config.audio, config.clock.default_bpm as f32)?,
    };
    scheduler.add_worker(audio);

    if config.overlay.enabled {
        match OverlayServer::spawn(config.overlay.bind, scheduler.command_sender()) {
            Ok(server) => scheduler.add_worker(server.into_worker()),
            Err(error) => warn!(%error, addr = %config.overlay.bind, "overlay listener unavailable"),
        }
    }

    let quit = StopSignal::new();
    let mut sink = terminal::TerminalSink::enter()?;
    scheduler.add_worker(terminal::spawn_input(scheduler.command_sender(), quit.clone())?);

    let result = scheduler.run(&mut sink, &quit);
    let restored = sink.restore();
    info!("live mode finished");
    result.and(restored)
}

fn init_tracing(log: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // The terminal belongs to the frame output; logs go to stderr or a file.
    let _ = match log {
        Some(path) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(File::create(path)?))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-reactive terminal visuals for live performance", long_about = None)]
struct Cli {
    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render live on this terminal until `q` or Esc.
    Live(LiveArgs),
}

#[derive(Args, Debug)]
struct LiveArgs {
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Target frame rate.
    #[arg(long)]
    fps: Option<u32>,
    /// Starting tempo.
    #[arg(long)]
    bpm: Option<f64>,
    /// Port of the overlay WebSocket listener.
    #[arg(short, long)]
    port: Option<u16>,
    /// Start on the network clock.
    #[arg(long)]
    link: bool,
    /// Share start/stop with peers that also enable it.
    #[arg(long)]
    start_stop_sync: bool,
    /// Do not open the overlay listener.
    #[arg(long)]
    no_overlay: bool,
    /// Feed the synthetic test signal instead of capturing audio.
    #[arg(long)]
    test_signal: bool,
}

impl LiveArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(fps) = self.fps {
            config.scheduler.fps = fps;
        }
        if let Some(bpm) = self.bpm {
            config.clock.default_bpm = bpm;
        }
        if let Some(port) = self.port {
            config.overlay.bind.set_port(port);
        }
        if self.link {
            config.clock.network_available = true;
            config.clock.start_networked = true;
        }
        if self.start_stop_sync {
            config.clock.start_stop_sync = true;
        }
        if self.no_overlay {
            config.overlay.enabled = false;
        }
    }
}
