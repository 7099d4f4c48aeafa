// Example: Stream the microphone to the voice service and play its replies
//
// Flow:
// 1. Load configuration from .env, VOCALS_* variables and an optional file
// 2. Connect and subscribe to transcriptions and responses
// 3. Stream the microphone for the requested duration
// 4. Wait for queued speech to finish, then clean up
//
// Usage: cargo run --example basic_recording -- --duration 15

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use vocals::{handlers, VocalsClient, VocalsConfig};

#[derive(Parser)]
#[command(name = "basic_recording")]
#[command(about = "Stream the microphone and play back synthesized speech")]
struct Args {
    /// Seconds to record
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log every inbound message
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let args = Args::parse();
    let config = VocalsConfig::load(args.config.as_deref())?;

    info!("Vocals - Basic Recording Example");
    info!("Endpoint: {}", config.ws_endpoint);
    info!("Recording for {} seconds", args.duration);

    let client = VocalsClient::builder(config)
        .build()
        .context("failed to create client")?;

    client.on_message(handlers::logging_handler(args.verbose));
    client.on_error(handlers::error_logging_handler("basic_recording"));
    client.on_message(handlers::transcription_handler(|text, is_final| {
        if is_final {
            info!("Transcript: {}", text);
        }
    }));
    client.on_message(handlers::tts_handler(|segment| {
        info!("Speech: \"{}\" ({:.1}s)", segment.text, segment.duration_seconds);
    }));

    client.connect().await.context("failed to connect")?;
    info!("Connected, speak now");

    let streamed = client
        .stream_microphone(Duration::from_secs(args.duration))
        .await;
    info!("Recording stopped, {} packets sent", client.packets_sent());

    // Give the service a moment to answer, then drain playback
    tokio::time::sleep(Duration::from_secs(2)).await;
    while client.queue_len() > 0 || client.current_segment().is_some() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    client.cleanup().await;
    streamed?;
    info!("Done");
    Ok(())
}
