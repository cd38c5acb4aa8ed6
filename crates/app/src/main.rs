use std::{
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand, ValueEnum};
use scan_sonifier_core::{Color, HostHooks, MidiRegistry, Pipeline, PipelineConfig, Raster};
use tracing_subscriber::EnvFilter;

const CLIENT_NAME: &str = "scan-sonifier";
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STEP_INTERVAL: Duration = Duration::from_millis(250);

fn main() -> scan_sonifier_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play(args) => run_play(args),
        Commands::Ports => list_ports(),
        Commands::Preset => {
            println!("{}", PipelineConfig::default().to_json()?);
            Ok(())
        }
    }
}

fn load_config(args: &PlayArgs) -> scan_sonifier_core::Result<PipelineConfig> {
    let mut config = match &args.preset {
        Some(path) => PipelineConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => PipelineConfig::default(),
    };
    if let Some(bpm) = args.bpm {
        config.tempo.bpm = bpm;
    }
    if let Some(beats) = args.beats {
        config.tempo.loop_beats = beats;
    }
    if let Some(timeres) = args.timeres {
        config.tempo.timeres_ms = timeres;
    }
    if args.log_only {
        config = config.with_log_sinks();
    }
    config.validate()?;
    Ok(config)
}

fn run_play(args: PlayArgs) -> scan_sonifier_core::Result<()> {
    let config = load_config(&args)?;
    tracing::info!(
        width = args.width,
        height = args.height,
        pattern = ?args.pattern,
        mode = ?args.mode,
        bpm = config.tempo.bpm,
        "starting scan"
    );

    let raster = Arc::new(
        args.pattern
            .render(args.width, args.height)
            .with_read_ahead(config.raster_read_ahead),
    );
    let registry = MidiRegistry::new(CLIENT_NAME);
    let pipeline = Pipeline::from_config(
        &config,
        raster.clone(),
        raster,
        Arc::new(TerminalHooks),
        &registry,
    )?;

    match args.mode {
        Mode::Loop => pipeline.loop_scan()?,
        Mode::Once => pipeline.trigger_once()?,
        Mode::Step => {}
    }

    let deadline = Instant::now() + Duration::from_secs_f64(args.seconds.max(0.0));
    while Instant::now() < deadline {
        let pause = match args.mode {
            Mode::Step => {
                pipeline.step_once()?;
                STEP_INTERVAL
            }
            Mode::Once if !pipeline.snapshot()?.mode.is_active() => break,
            _ => POLL_INTERVAL,
        };
        if pipeline.take_changed()? {
            tracing::debug!(position = pipeline.snapshot()?.position, "scanline moved");
        }
        thread::sleep(pause);
    }

    pipeline.stop()?;
    pipeline.shutdown()
}

fn list_ports() -> scan_sonifier_core::Result<()> {
    let ports = MidiRegistry::new(CLIENT_NAME).list_ports()?;
    if ports.is_empty() {
        println!("no midi output ports");
    }
    for (id, name) in ports {
        println!("{id}: {name}");
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

struct TerminalHooks;

impl HostHooks for TerminalHooks {
    fn activated(&self) {
        tracing::info!("scanline activated");
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Play images as music along a moving scanline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan a generated image and play what the detectors find.
    Play(PlayArgs),
    /// List MIDI output ports and their device ids.
    Ports,
    /// Print the default pipeline preset as JSON.
    Preset,
}

#[derive(clap::Args, Debug)]
struct PlayArgs {
    #[arg(long, default_value_t = 64)]
    width: usize,
    #[arg(long, default_value_t = 32)]
    height: usize,
    /// Image to generate.
    #[arg(long, value_enum, default_value_t = Pattern::Wave)]
    pattern: Pattern,
    #[arg(long, value_enum, default_value_t = Mode::Loop)]
    mode: Mode,
    /// How long to play before stopping.
    #[arg(long, default_value_t = 8.0)]
    seconds: f64,
    /// JSON pipeline preset; see the `preset` command for the format.
    #[arg(short, long)]
    preset: Option<PathBuf>,
    #[arg(long)]
    bpm: Option<u32>,
    /// Beats per sweep of the image.
    #[arg(long)]
    beats: Option<u32>,
    /// Minimum tick length in milliseconds.
    #[arg(long)]
    timeres: Option<u64>,
    /// Log events instead of sending MIDI.
    #[arg(long)]
    log_only: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Loop,
    Once,
    Step,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Pattern {
    /// A dark sine wave with a red one in counter phase.
    Wave,
    /// A dark diagonal from the top left corner.
    Diagonal,
    /// Dark and red checker blocks.
    Checker,
}

const RED: Color = Color {
    r: 0.5,
    g: 0.05,
    b: 0.05,
};

impl Pattern {
    fn render(self, width: usize, height: usize) -> Raster {
        let w = width.max(1) as f32;
        let h = height as f32;
        Raster::from_fn(width, height, |x, y| {
            let (x, y) = (x as f32, y as f32);
            match self {
                Pattern::Wave => {
                    let phase = x / w * std::f32::consts::TAU;
                    let dark = h / 2.0 + phase.sin() * h / 3.0;
                    let red = h / 2.0 - phase.sin() * h / 3.0;
                    if (y - dark).abs() < 1.0 {
                        Color::black()
                    } else if (y - red).abs() < 1.0 {
                        RED
                    } else {
                        Color::white()
                    }
                }
                Pattern::Diagonal => {
                    if (y - x * h / w).abs() < 1.0 {
                        Color::black()
                    } else {
                        Color::white()
                    }
                }
                Pattern::Checker => {
                    let block = (height / 4).max(1) as f32;
                    match ((x / block) as usize + (y / block) as usize) % 3 {
                        0 => Color::black(),
                        1 => RED,
                        _ => Color::white(),
                    }
                }
            }
        })
    }
}
