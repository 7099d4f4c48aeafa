// Example: Inspect audio devices and test one for capture
//
// Lists input and output devices, checks that the chosen input accepts the
// capture format, then records a few seconds locally while printing levels.
// Nothing is sent to the service.
//
// Usage: cargo run --example device_management -- --device 1 --seconds 3

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use vocals::audio::AudioConfig;
use vocals::{handlers, AudioEngine, CpalBackend, DeviceInfo, DeviceManager, Direction, HandlerRegistry};

#[derive(Parser)]
#[command(name = "device_management")]
#[command(about = "List audio devices and test capture")]
struct Args {
    /// Input device index to test (default device if omitted)
    #[arg(short, long)]
    device: Option<usize>,

    /// Find the input device by name instead
    #[arg(short, long)]
    name: Option<String>,

    /// Seconds to test capture for
    #[arg(short, long, default_value = "3")]
    seconds: u64,
}

fn print_devices(title: &str, devices: &[DeviceInfo]) {
    info!("{}:", title);
    for device in devices {
        info!(
            "  [{}] {}{} ({} ch, {} Hz)",
            device.index,
            device.name,
            if device.is_default { " (default)" } else { "" },
            device.max_channels,
            device.default_sample_rate
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let args = Args::parse();
    let manager = DeviceManager::new();

    print_devices("Input devices", &manager.list_input_devices()?);
    print_devices("Output devices", &manager.list_output_devices()?);

    let chosen = match (args.device, args.name.as_deref()) {
        (Some(index), _) => manager.device_by_index(index, Direction::Input)?,
        (None, Some(name)) => manager.device_by_name(name, Direction::Input)?,
        (None, None) => manager.default_input_device()?,
    }
    .context("no matching input device")?;

    let config = AudioConfig {
        device_index: Some(chosen.index),
        ..AudioConfig::default()
    };
    manager
        .validate_device(chosen.index, config.channels, config.sample_rate, Direction::Input)
        .context("device cannot capture in the client's format")?;
    info!("Testing '{}' for {} seconds", chosen.name, args.seconds);

    let engine = AudioEngine::new(config, Arc::new(CpalBackend::new()), HandlerRegistry::new("error"))?;
    engine.on_frame(handlers::rms_visualizer(|rms| {
        let bars = ((rms * 200.0) as usize).min(40);
        info!("{:<40} {:.4}", "|".repeat(bars), rms);
    }));

    engine.start_recording(Box::new(|_| {}))?;
    tokio::time::sleep(Duration::from_secs(args.seconds)).await;
    engine.stop_recording();

    info!("Capture test finished");
    engine.cleanup();
    Ok(())
}
