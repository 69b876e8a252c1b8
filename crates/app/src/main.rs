use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::{Parser, Subcommand};
use garden_live_core::{
    highlight, validate, AppConfig, BarFrame, BarRenderer, BlockEvent, FrameLoop, GardenLiveError,
    PatternBlock, Recorder, RecordingSettings, RuntimeHandle, RuntimeLoader, ValidationResult,
    Visualizer,
};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

/// Longest run `play` and `render` accept.
const MAX_SECONDS: f64 = 86_400.0;

#[tokio::main]
async fn main() -> garden_live_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Highlight { file } => run_highlight(&file),
        Commands::Check { file } => run_check(&file),
        Commands::Play { file, seconds } => run_play(&config, &file, seconds).await,
        Commands::Render { file, seconds, out } => run_render(config, &file, seconds, out).await,
        Commands::Demo { frames } => run_demo(&config, frames).await,
    }
}

fn run_highlight(file: &Path) -> garden_live_core::Result<()> {
    let source = std::fs::read_to_string(file)?;
    println!("{}", highlight(&source));
    Ok(())
}

fn run_check(file: &Path) -> garden_live_core::Result<()> {
    let source = std::fs::read_to_string(file)?;
    match validate(&source) {
        ValidationResult::Safe => {
            println!("ok");
            Ok(())
        }
        rejected @ ValidationResult::Rejected { .. } => rejected.into_result(),
    }
}

async fn run_play(config: &AppConfig, file: &Path, seconds: f64) -> garden_live_core::Result<()> {
    let length = run_length(seconds)?;
    let source = std::fs::read_to_string(file)?;
    tracing::info!(?file, seconds, "playing pattern");

    let loader = RuntimeLoader::init_global(config);
    let block = PatternBlock::new(loader.clone(), source);
    let events = tokio::spawn(log_events(block.subscribe()));

    block.play().await?;
    let handle = loader
        .ready()
        .ok_or_else(|| GardenLiveError::msg("pattern runtime is not loaded"))?;

    let visualizer = Arc::new(Mutex::new(Visualizer::new(&config.visualizer)?));
    {
        let mut visualizer = lock(&visualizer)?;
        if let Some(analyser) = handle.analyser() {
            visualizer.attach(analyser);
        }
        visualizer.start();
    }

    let pump = tokio::spawn(pump_audio(handle.clone(), config.audio.block_size));
    let frame_loop = FrameLoop::spawn(visualizer.clone(), config.visualizer.frame_rate)?;
    let renderer = BarRenderer::default();

    let deadline = Instant::now() + length;
    let mut frames = frame_loop.frames();
    loop {
        tokio::select! {
            _ = time::sleep_until(deadline) => break,
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = frames.borrow_and_update().clone();
                draw(&renderer, &frame)?;
            }
        }
    }

    block.stop()?;
    lock(&visualizer)?.stop();
    draw(&renderer, &lock(&visualizer)?.frame())?;
    println!();

    frame_loop.cancel();
    pump.abort();
    drop(block);
    let _ = events.await;
    Ok(())
}

async fn run_render(
    config: AppConfig,
    file: &Path,
    seconds: f64,
    out: PathBuf,
) -> garden_live_core::Result<()> {
    let length = run_length(seconds)?;
    let source = std::fs::read_to_string(file)?;
    let block_size = config.audio.block_size;
    let sample_rate = config.audio.sample_rate;

    let loader = Arc::new(RuntimeLoader::with_tone_engine(config));
    let block = PatternBlock::new(loader.clone(), source);
    block.play().await?;
    let handle = loader
        .ready()
        .ok_or_else(|| GardenLiveError::msg("pattern runtime is not loaded"))?;

    let mut recorder = Recorder::new(RecordingSettings::new(out));
    recorder.start(handle.audio_context())?;

    let mut remaining = (length.as_secs_f64() * f64::from(sample_rate)).round() as usize;
    while remaining > 0 {
        let frames = remaining.min(block_size);
        handle.runtime().render(frames)?;
        remaining -= frames;
    }

    block.stop()?;
    let written = recorder.stop(handle.audio_context())?;
    tracing::info!(frames = written, "render finished");
    Ok(())
}

async fn run_demo(config: &AppConfig, frames: usize) -> garden_live_core::Result<()> {
    let visualizer = Arc::new(Mutex::new(Visualizer::new(&config.visualizer)?));
    lock(&visualizer)?.start();

    let frame_loop = FrameLoop::spawn(visualizer.clone(), config.visualizer.frame_rate)?;
    let renderer = BarRenderer::default();
    let mut updates = frame_loop.frames();

    for _ in 0..frames {
        if updates.changed().await.is_err() {
            break;
        }
        let frame = updates.borrow_and_update().clone();
        draw(&renderer, &frame)?;
    }

    lock(&visualizer)?.stop();
    println!();
    Ok(())
}

fn run_length(seconds: f64) -> garden_live_core::Result<Duration> {
    if !(0.0..=MAX_SECONDS).contains(&seconds) {
        return Err(GardenLiveError::InvalidInput(
            "seconds must be between 0 and 86400",
        ));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Feeds the runtime's output into the audio graph in real time.
async fn pump_audio(handle: Arc<RuntimeHandle>, block_size: usize) {
    let sample_rate = f64::from(handle.audio_context().sample_rate());
    let mut interval = time::interval(Duration::from_secs_f64(block_size as f64 / sample_rate));
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        interval.tick().await;
        if let Err(err) = handle.runtime().render(block_size) {
            tracing::warn!(error = %err, "audio render failed");
            break;
        }
    }
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<BlockEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            BlockEvent::Error { message, kind, .. } => {
                tracing::error!(?kind, %message, "pattern block error");
            }
            other => tracing::debug!(event = ?other, "pattern block event"),
        }
    }
}

fn draw(renderer: &BarRenderer, frame: &BarFrame) -> garden_live_core::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "\x1b[{}F\x1b[J{}", renderer.rows(), renderer.render(frame))?;
    stdout.flush()?;
    Ok(())
}

fn lock(
    visualizer: &Mutex<Visualizer>,
) -> garden_live_core::Result<std::sync::MutexGuard<'_, Visualizer>> {
    visualizer
        .lock()
        .map_err(|_| GardenLiveError::msg("visualizer state has been poisoned"))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live-coding pattern blocks for Garden", long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the highlighted markup for a pattern file.
    Highlight { file: PathBuf },
    /// Screen a pattern file without running it.
    Check { file: PathBuf },
    /// Play a pattern with a live bar visualizer in the terminal.
    Play {
        file: PathBuf,
        /// How long to play before stopping.
        #[arg(short, long, default_value_t = 8.0)]
        seconds: f64,
    },
    /// Render a pattern offline into a WAV file.
    Render {
        file: PathBuf,
        #[arg(short, long, default_value_t = 8.0)]
        seconds: f64,
        /// Output WAV path.
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Run the visualizer on its synthetic signal.
    Demo {
        #[arg(short, long, default_value_t = 240)]
        frames: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_length_accepts_ordinary_durations() {
        assert_eq!(run_length(0.0).unwrap(), Duration::ZERO);
        assert_eq!(run_length(8.0).unwrap(), Duration::from_secs(8));
        assert_eq!(run_length(MAX_SECONDS).unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn run_length_rejects_durations_that_cannot_be_scheduled() {
        for seconds in [f64::INFINITY, f64::NAN, -1.0, 1e300, MAX_SECONDS + 1.0] {
            assert!(
                matches!(run_length(seconds), Err(GardenLiveError::InvalidInput(_))),
                "{seconds} should be rejected"
            );
        }
    }

    #[test]
    fn cli_parses_render_arguments() {
        let cli = Cli::try_parse_from(["garden-live", "render", "beat.rhai", "-s", "2.5", "-o", "out.wav"])
            .unwrap();
        match cli.command {
            Commands::Render { file, seconds, out } => {
                assert_eq!(file, PathBuf::from("beat.rhai"));
                assert_eq!(seconds, 2.5);
                assert_eq!(out, PathBuf::from("out.wav"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
