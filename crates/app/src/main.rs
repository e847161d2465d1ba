use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use karaoke_core::{
    AppConfig, AudioBackend, AudioConfig, AudioEngine, Difficulty, KaraokeError, KaraokeSession,
    LyricTimeline, Song,
};
use tracing_subscriber::EnvFilter;

mod player;

use player::WallClockPlayer;

const TICK: Duration = Duration::from_millis(33);
const STOP_TIMEOUT: Duration = Duration::from_secs(2);
/// Time the headless player keeps going after the last lyric line.
const OUTRO_MS: f64 = 2000.0;

fn main() -> karaoke_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Lyrics { file } => print_lyrics(&file),
        Commands::Sing(args) => {
            let config = args.resolve_config()?;
            run_sing(backend(&config.audio), &args, config)
        }
    }
}

#[cfg(feature = "cpal")]
fn backend(_config: &AudioConfig) -> karaoke_core::CpalBackend {
    karaoke_core::CpalBackend::new()
}

#[cfg(not(feature = "cpal"))]
fn backend(config: &AudioConfig) -> karaoke_core::MockBackend {
    tracing::warn!("built without the `cpal` feature, using a simulated microphone");
    karaoke_core::MockBackend::new()
        .with_device("simulated microphone", 1200)
        .with_read_delay(config.chunk_duration())
}

fn list_devices() -> karaoke_core::Result<()> {
    let backend = backend(&AudioConfig::default());
    let devices = backend.input_devices()?;
    if devices.is_empty() {
        println!("no input devices found");
    }
    for device in devices {
        println!("{}: {}", device.index, device.name);
    }
    Ok(())
}

fn print_lyrics(file: &Path) -> karaoke_core::Result<()> {
    let timeline = LyricTimeline::load(file);
    if timeline.is_empty() {
        return Err(KaraokeError::msg(format!(
            "no lyric lines in `{}`",
            file.display()
        )));
    }
    for line in timeline.lines() {
        println!(
            "[{:>9.3}s - {:>9.3}s] {}",
            line.start_ms / 1000.0,
            line.end_ms / 1000.0,
            line.text
        );
    }
    Ok(())
}

fn run_sing<B: AudioBackend>(
    backend: B,
    args: &SingArgs,
    config: AppConfig,
) -> karaoke_core::Result<()> {
    let mut song = Song::from_dir(&args.song)?;
    if let Some(seconds) = args.duration {
        song = song.with_duration_ms(seconds * 1000.0);
    }
    if config.audio.mic1_device.is_none() && config.audio.mic2_device.is_none() {
        tracing::warn!("no microphone selected, the score will stay at 0");
    }

    tracing::info!(song = %song.title, difficulty = ?config.audio.difficulty, "starting session");
    let engine = AudioEngine::start(backend, config.audio)?;
    let mut session = KaraokeSession::new(engine, WallClockPlayer::new(), config.player);
    session.start(&song)?;

    let length_ms = song.duration_ms.or_else(|| {
        session
            .timeline()
            .lines()
            .last()
            .map(|line| line.end_ms + OUTRO_MS)
    });
    let Some(length_ms) = length_ms else {
        session.shutdown(STOP_TIMEOUT);
        return Err(KaraokeError::msg(
            "song has no lyrics and no --duration, cannot tell when it ends",
        ));
    };
    session
        .clock_mut()
        .player_mut()
        .set_length_ms(Some(length_ms));

    let mut shown = None;
    let mut in_break = false;
    let mut dots = 0;
    while !session.song_over() {
        let update = session.tick();
        if update.page_advanced {
            tracing::debug!(page = ?update.page_index, "page advanced");
        }
        if update.instrumental_break && !in_break {
            println!("~ instrumental ~");
        }
        in_break = update.instrumental_break;
        if update.cue_dots() != dots {
            dots = update.cue_dots();
            if dots > 0 {
                println!("{}", "o ".repeat(dots).trim_end());
            }
        }

        let display = session.display_line().map(|line| line.text.clone());
        if display.is_some() && display != shown {
            if let Some(text) = &display {
                println!("{text}");
            }
            shown = display;
        }

        std::thread::sleep(TICK);
    }

    let score = session.finish(STOP_TIMEOUT)?;
    println!("final score: {score}");
    session.shutdown(STOP_TIMEOUT);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Karaoke capture, scoring and lyric sync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List input devices usable as microphones.
    Devices,
    /// Parse a lyric script and print its lines.
    Lyrics {
        /// `lyrics_v1.json`, `lyrics_v2.json` or `.lrc` file.
        file: PathBuf,
    },
    /// Sing along to a song directory without a display.
    Sing(SingArgs),
}

#[derive(clap::Args, Debug)]
struct SingArgs {
    /// Directory holding the song's audio and lyric scripts.
    song: PathBuf,
    /// JSON configuration file. Command line options override it.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    mic1: Option<usize>,
    #[arg(long)]
    mic2: Option<usize>,
    /// easy, normal or hard.
    #[arg(short, long)]
    difficulty: Option<Difficulty>,
    /// Route the microphones to the default output device.
    #[arg(long)]
    monitor: bool,
    /// Frames read per cycle.
    #[arg(long)]
    chunk: Option<usize>,
    /// Song length in seconds, when it cannot be told from the lyrics.
    #[arg(long)]
    duration: Option<f64>,
}

impl SingArgs {
    fn resolve_config(&self) -> karaoke_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::from_path(path)?,
            None => AppConfig::default(),
        };
        let audio = &mut config.audio;
        if self.mic1.is_some() {
            audio.mic1_device = self.mic1;
        }
        if self.mic2.is_some() {
            audio.mic2_device = self.mic2;
        }
        if let Some(difficulty) = self.difficulty {
            audio.difficulty = difficulty;
        }
        if self.monitor {
            audio.monitoring_enabled = true;
        }
        if let Some(chunk) = self.chunk {
            audio.chunk_frames = chunk;
        }
        config.audio = config.audio.sanitized();
        Ok(config)
    }
}
