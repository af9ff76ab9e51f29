//! `plexio` — probe media containers, dump their structure, and run a
//! headless playback simulation.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use demux::{ByteSource, FileSource, MediaExtractor, TrackSource};
use isobmff::IsobmffExtractor;
use playback::actors::SoftwareOnly;
use playback::clock::SystemClock;
use playback::sim::SimFactory;
use playback::{Notification, Player, PlayerConfig, ResourceLimiter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "plexio", version, about = "Media container probe & playback tool")]
struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe a file and print its metadata and track registry.
    Probe {
        input: PathBuf,
    },
    /// Dump the container's box tree.
    Boxes {
        input: PathBuf,
    },
    /// Dump the first samples of one track.
    Samples {
        input: PathBuf,
        /// Track index in the registry.
        #[arg(short, long, default_value_t = 0)]
        track: usize,
        /// Number of samples to print.
        #[arg(short, long, default_value_t = 16)]
        count: usize,
    },
    /// Run a headless playback simulation and report timing statistics.
    Play {
        input: PathBuf,
        /// Optional seek target in milliseconds before playback starts.
        #[arg(long)]
        seek_ms: Option<i64>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();

    let result: Result<(), String> = match cli.command {
        Command::Probe { input } => cmd_probe(&input).map_err(|e| e.to_string()),
        Command::Boxes { input } => cmd_boxes(&input).map_err(|e| e.to_string()),
        Command::Samples {
            input,
            track,
            count,
        } => cmd_samples(&input, track, count).map_err(|e| e.to_string()),
        Command::Play { input, seek_ms } => cmd_play(&input, seek_ms).map_err(|e| e.to_string()),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn open_source(path: &PathBuf) -> Result<Arc<dyn ByteSource>, demux::DemuxError> {
    Ok(Arc::new(FileSource::open(path)?))
}

fn cmd_probe(input: &PathBuf) -> Result<(), demux::DemuxError> {
    let source = open_source(input)?;
    let extractor = IsobmffExtractor::read(source)?;

    let metadata = extractor.metadata();
    println!("container: {}", metadata.brand.as_deref().unwrap_or("?"));
    if let Some(duration) = metadata.duration_us {
        println!("duration:  {:.3}s", duration as f64 / 1e6);
    }
    if let Some(location) = &metadata.location {
        println!("location:  {location}");
    }
    for (key, value) in &metadata.tags {
        println!("tag:       {key} = {value}");
    }
    println!("fragmented: {}", extractor.is_fragmented());

    for (i, info) in extractor.tracks().iter().enumerate() {
        println!("track {i}: id={} {} ({})", info.id, info.mime, info.kind);
        if let Some(resolution) = info.resolution {
            let rotation = info.rotation.degrees();
            println!("  video: {resolution} rotation={rotation}");
        }
        if let Some(rate) = info.sample_rate {
            println!(
                "  audio: {rate} Hz, {} ch",
                info.channel_count.unwrap_or(0)
            );
        }
        if let Some(duration) = info.duration_us {
            println!("  duration: {:.3}s", duration as f64 / 1e6);
        }
        if let Some(language) = &info.language {
            println!("  language: {language}");
        }
        println!("  samples: {}", info.sample_count);
        if let Some(encryption) = &info.encryption {
            println!(
                "  encrypted: scheme={} iv_size={}",
                encryption.scheme, encryption.default_iv_size
            );
        }
        if let Some(thumbnail) = extractor.thumbnail_time_us(i) {
            println!("  thumbnail: {:.3}s", thumbnail as f64 / 1e6);
        }
    }
    Ok(())
}

fn cmd_boxes(input: &PathBuf) -> Result<(), demux::DemuxError> {
    let source = open_source(input)?;
    let mut stdout = std::io::stdout().lock();
    isobmff::dump::dump_boxes(&source, &mut stdout)
}

fn cmd_samples(input: &PathBuf, track: usize, count: usize) -> Result<(), demux::DemuxError> {
    let source = open_source(input)?;
    let extractor = IsobmffExtractor::read(source)?;
    let mut reader = TrackSource::open(&extractor, track)?;

    println!("{:>6} {:>12} {:>12} {:>8} {:>5}", "#", "dts(us)", "pts(us)", "size", "sync");
    for i in 0..count {
        match reader.read_sample(false) {
            Ok(sample) => println!(
                "{:>6} {:>12} {:>12} {:>8} {:>5}",
                i,
                sample.decode_time_us,
                sample.presentation_time_us,
                sample.data.len(),
                if sample.is_sync { "*" } else { "" }
            ),
            Err(e) if e.is_end_of_stream() => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn cmd_play(input: &PathBuf, seek_ms: Option<i64>) -> Result<(), playback::PlaybackError> {
    let factory = Arc::new(SimFactory::new(Arc::new(SystemClock::new())));
    let player = Player::with_config(
        PlayerConfig::default(),
        factory.clone(),
        Arc::new(SoftwareOnly),
        ResourceLimiter::new(1),
    );

    let (done_tx, done_rx) = mpsc::channel::<Result<(), String>>();
    let done_tx = std::sync::Mutex::new(done_tx);
    player.set_listener(Arc::new(move |notification| {
        tracing::info!(?notification, "player");
        let result = match notification {
            Notification::PlaybackComplete => Ok(()),
            Notification::Error { detail, .. } => Err(detail),
            _ => return,
        };
        if let Ok(tx) = done_tx.lock() {
            let _ = tx.send(result);
        }
    }));

    player.set_data_source_path(input)?;
    player.prepare()?;
    if let Some(seek_ms) = seek_ms {
        player.seek_to(seek_ms * 1000)?;
    }
    player.play()?;

    let duration = player.get_duration();
    let timeout = Duration::from_micros((duration as u64).saturating_mul(2)) + Duration::from_secs(10);
    match done_rx.recv_timeout(timeout) {
        Ok(Ok(())) => {}
        Ok(Err(detail)) => {
            return Err(playback::PlaybackError::Decoder(detail));
        }
        Err(_) => {
            eprintln!("playback did not finish within {timeout:?}");
        }
    }

    let render_stats = factory.render_stats();
    let render_stats = render_stats.lock();
    println!(
        "rendered {} frames, discarded {}",
        render_stats.rendered, render_stats.discarded
    );
    drop(render_stats);
    println!("{}", player.dump());
    Ok(())
}
