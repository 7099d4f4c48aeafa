// Example: Stream the microphone while tracking live stream statistics
//
// Prints a level meter from the per-frame callback, reports each silence
// interval as it ends, and dumps the final statistics as JSON.
//
// Usage: cargo run --example advanced_stats -- --duration 20 --silence-threshold 0.02

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use vocals::{handlers, StatsCallbacks, VocalsClient, VocalsConfig};

#[derive(Parser)]
#[command(name = "advanced_stats")]
#[command(about = "Stream the microphone and report stream statistics")]
struct Args {
    /// Seconds to record
    #[arg(short, long, default_value = "20")]
    duration: u64,

    /// Mean amplitude below which a frame counts as silence
    #[arg(short, long, default_value = "0.01")]
    silence_threshold: f32,

    /// Write the final statistics to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn meter(level: f32) -> String {
    let filled = ((level * 50.0).round() as usize).min(50);
    format!("{}{}", "#".repeat(filled), ".".repeat(50 - filled))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let args = Args::parse();
    let config = VocalsConfig::load(None)?;

    info!("Vocals - Stream Statistics Example");
    info!("Silence threshold: {}", args.silence_threshold);

    let client = VocalsClient::builder(config)
        .build()
        .context("failed to create client")?;
    client.on_error(handlers::error_logging_handler("advanced_stats"));
    client.on_audio_frame(handlers::silence_detector(
        args.silence_threshold,
        Duration::from_secs(3),
        || warn!("Three seconds of silence, is the microphone muted?"),
    ));

    // Print the meter at most every 250 ms
    let last_print = Arc::new(Mutex::new(Instant::now()));
    let callbacks = StatsCallbacks::new()
        .on_level(move |average, peak| {
            let mut last = last_print.lock();
            if last.elapsed() >= Duration::from_millis(250) {
                *last = Instant::now();
                info!("[{}] avg {:.3} peak {:.3}", meter(average), average, peak);
            }
        })
        .on_silence(|interval| info!("Silence ended after {:.2}s", interval.as_secs_f64()));

    client.connect().await.context("failed to connect")?;

    let stats = client
        .stream_microphone_with_stats(
            Duration::from_secs(args.duration),
            args.silence_threshold,
            callbacks,
        )
        .await;
    client.cleanup().await;
    let stats = stats?;

    info!("Samples:          {}", stats.total_samples);
    info!("Sample rate:      {:.0} Hz effective", stats.effective_sample_rate());
    info!("Throughput:       {:.0} B/s", stats.bytes_per_second());
    info!("RMS:              {:.4}", stats.rms);
    info!("Silence:          {:.1}s", stats.silence_duration_secs);
    info!("Voice activity:   {:.1}%", stats.voice_activity_percentage());
    info!("Packets sent:     {}", stats.packets_sent);
    info!("Reconnects:       {}", stats.reconnects);
    if stats.is_healthy() {
        info!("Quality score:    {:.2}", stats.quality_score());
    } else {
        warn!("Stream looks unhealthy: little or no voice was captured");
    }

    if let Some(path) = args.output {
        std::fs::write(&path, serde_json::to_string_pretty(&stats)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Statistics written to {}", path.display());
    }

    Ok(())
}
