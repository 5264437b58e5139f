use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voxlink::session::BargeInTrigger;
use voxlink::voice::{
    AudioOutput, CpalFrameSource, FrameSource, PlaybackSink, WakeWordDetector, frame_period, tone,
};
use voxlink::{Config, Daemon};

/// voxlink - wake-word activated duplex voice assistant
#[derive(Parser)]
#[command(name = "voxlink", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (defaults to ~/.config/voxlink/config.toml)
    #[arg(short, long, env = "VOXLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Write every uploaded utterance to a WAV file in this directory
    #[arg(long)]
    record_dir: Option<PathBuf>,

    /// What lets the user interrupt the assistant
    #[arg(long, value_enum)]
    barge_in: Option<BargeInTrigger>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input and wake scoring
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Print the effective configuration
    Config {
        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voxlink=info",
        1 => "info,voxlink=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.record_dir {
        config.record_dir = Some(dir);
    }
    if let Some(trigger) = cli.barge_in {
        config.session.barge_in = trigger;
    }

    // Handle subcommands
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(&config, duration),
            Command::TestSpeaker => test_speaker(&config),
            Command::Config { json } => print_config(&config, json),
        };
    }

    if config.engine.api_key.is_none() {
        tracing::warn!("no API key configured, set VOXLINK_API_KEY or GEMINI_API_KEY");
    }

    tracing::info!(
        model = %config.engine.model,
        record_dir = ?config.record_dir,
        "starting voxlink"
    );
    tracing::debug!(?config, "loaded configuration");

    Daemon::new(config).run().await?;

    Ok(())
}

/// Test microphone input
fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone, or say the wake phrase!\n");

    let mut source =
        CpalFrameSource::open(config.audio.frame_samples, config.audio.capture_ring_frames)?;
    let mut detector = WakeWordDetector::energy(&config.wake)?;

    let period = frame_period(config.audio.frame_samples);
    let per_second = (Duration::from_secs(1).as_micros() / period.as_micros().max(1)).max(1);
    println!(
        "Frame: {} samples ({} ms)",
        config.audio.frame_samples,
        period.as_millis()
    );
    println!("---");

    for i in 0..duration {
        let started = Instant::now();
        let before = source.stats();
        let mut rms = 0.0f32;
        let mut peak_score = 0.0f32;
        let mut wakes = 0;

        for _ in 0..per_second {
            let frame = source.next_frame();
            rms = rms.max(frame.rms());
            let event = detector.observe(&frame);
            peak_score = peak_score.max(event.confidence);
            if event.triggered {
                wakes += 1;
            }
        }

        let after = source.stats();

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (rms * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] frames: {} | underruns: {} | RMS: {:.4} | wake: {:.2}{} | [{}]",
            i + 1,
            after.frames - before.frames,
            after.underruns - before.underruns,
            rms,
            peak_score,
            if wakes > 0 { " WAKE" } else { "" },
            meter
        );
        tracing::trace!(elapsed_ms = started.elapsed().as_millis(), "meter second");
    }

    source.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");
    println!("Current wake threshold: {:.2}", detector.threshold());

    Ok(())
}

/// Test speaker output with a sine wave
fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sink = PlaybackSink::with_capacity_ms(3_000);
    sink.set_volume(config.audio.speaker_volume);
    let output = AudioOutput::start(sink.clone(), |error| {
        eprintln!("playback error: {error}");
    })?;

    let chunk = tone(440.0, 2_000, 0.3);
    println!(
        "Playing {} samples on {} channel(s) at volume {}...",
        chunk.len(),
        output.channels(),
        config.audio.speaker_volume
    );
    sink.enqueue(chunk);

    let deadline = Instant::now() + Duration::from_secs(4);
    while !sink.is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    // let the device flush its own buffer
    std::thread::sleep(Duration::from_millis(200));
    drop(output);

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Print the effective configuration with secrets redacted
fn print_config(config: &Config, json: bool) -> anyhow::Result<()> {
    let rendered = if json {
        serde_json::to_string_pretty(config)?
    } else {
        toml::to_string_pretty(config)?
    };
    println!("{rendered}");
    Ok(())
}
