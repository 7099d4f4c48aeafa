use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vocals::handlers;
use vocals::{ConnectionState, DeviceManager, StatsCallbacks, VocalsClient, VocalsConfig};

#[derive(Parser)]
#[command(name = "vocals")]
#[command(about = "Voice AI client: stream the microphone, play synthesized speech")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Developer API key (overrides VOCALS_DEV_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// WebSocket endpoint (overrides VOCALS_WS_ENDPOINT)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// User id embedded in signed tokens
    #[arg(long, global = true)]
    user_id: Option<String>,

    /// Configuration file layered under the environment
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an interactive demo
    Demo {
        #[command(subcommand)]
        demo: Demo,
    },
    /// List capture and playback devices
    Devices,
    /// Print the resolved configuration and any problems with it
    Setup,
}

#[derive(Subcommand)]
enum Demo {
    /// Stream the microphone and play back responses
    Record {
        /// Seconds to record
        #[arg(short, long, default_value = "10")]
        duration: f64,
    },
    /// Stream the microphone and report stream statistics
    Stats {
        #[arg(short, long, default_value = "10")]
        duration: f64,

        /// Mean amplitude below which a frame counts as silence
        #[arg(long, default_value = "0.01")]
        silence_threshold: f32,
    },
    /// Hold a spoken conversation with auto-interrupt
    Conversation {
        #[arg(short, long, default_value = "60")]
        duration: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = VocalsConfig::load(cli.config.as_deref())?;
    if let Some(key) = cli.api_key {
        config.dev_api_key = Some(key);
    }
    if let Some(endpoint) = cli.endpoint {
        config.ws_endpoint = endpoint;
    }
    if cli.user_id.is_some() {
        config.user_id = cli.user_id;
    }

    let level = if cli.verbose {
        "debug"
    } else {
        config.log_filter()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Command::Demo { demo } => run_demo(config, demo).await,
        Command::Devices => list_devices(),
        Command::Setup => {
            print_setup(&config);
            Ok(())
        }
    }
}

async fn run_demo(config: VocalsConfig, demo: Demo) -> Result<()> {
    let client = VocalsClient::builder(config)
        .build()
        .context("failed to create client")?;
    info!("Session {}", client.session_id());

    client.on_error(handlers::error_logging_handler("Vocals"));
    client.on_connection_change(handlers::connection_status_handler(None::<fn(ConnectionState)>));
    client.on_message(handlers::transcription_handler(|text, is_final| {
        if is_final {
            info!("You said: {}", text);
        }
    }));
    client.on_message(handlers::response_handler(|text| info!("AI: {}", text)));

    client.connect().await.context("failed to connect")?;

    let result = match demo {
        Demo::Record { duration } => client
            .stream_microphone(Duration::from_secs_f64(duration.max(0.0)))
            .await
            .map(|_| ()),
        Demo::Stats {
            duration,
            silence_threshold,
        } => {
            let callbacks = StatsCallbacks::new().on_silence(|interval| {
                info!("Silence ended after {:.1}s", interval.as_secs_f64());
            });
            client
                .stream_microphone_with_stats(
                    Duration::from_secs_f64(duration.max(0.0)),
                    silence_threshold,
                    callbacks,
                )
                .await
                .map(|stats| {
                    info!("Duration:          {:.1}s", stats.duration_secs);
                    info!("Samples:           {}", stats.total_samples);
                    info!("Packets sent:      {}", stats.packets_sent);
                    info!("Average amplitude: {:.4}", stats.average_amplitude);
                    info!("Peak amplitude:    {:.4}", stats.max_amplitude);
                    info!("Voice activity:    {:.1}%", stats.voice_activity_percentage());
                    info!("Healthy:           {}", stats.is_healthy());
                    info!("Quality score:     {:.2}", stats.quality_score());
                })
        }
        Demo::Conversation { duration } => {
            client.start_recording()?;
            info!("Speak now; talking over the AI interrupts it");
            tokio::time::sleep(Duration::from_secs_f64(duration.max(0.0))).await;
            client.stop_recording();

            for turn in client.conversation().history() {
                info!("{}: {}", turn.role, turn.content);
            }
            Ok(())
        }
    };

    // Let queued speech finish before tearing down
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while (client.queue_len() > 0 || client.current_segment().is_some())
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    client.cleanup().await;
    result?;
    Ok(())
}

fn list_devices() -> Result<()> {
    let manager = DeviceManager::new();

    println!("Input devices:");
    for device in manager.list_input_devices()? {
        println!(
            "  [{}] {}{} ({} ch, {} Hz)",
            device.index,
            device.name,
            if device.is_default { " (default)" } else { "" },
            device.max_channels,
            device.default_sample_rate
        );
    }

    println!("Output devices:");
    for device in manager.list_output_devices()? {
        println!(
            "  [{}] {}{} ({} ch, {} Hz)",
            device.index,
            device.name,
            if device.is_default { " (default)" } else { "" },
            device.max_channels,
            device.default_sample_rate
        );
    }
    Ok(())
}

fn print_setup(config: &VocalsConfig) {
    println!("WebSocket endpoint:     {}", config.ws_endpoint);
    println!(
        "Token endpoint:         {}",
        config.token_endpoint.as_deref().unwrap_or("(local signing)")
    );
    println!("API key:                {}", config.masked_api_key());
    println!("Token auth:             {}", config.use_token_auth);
    println!("Max reconnect attempts: {}", config.max_reconnect_attempts);
    println!("Reconnect delay:        {}s", config.reconnect_delay);
    println!("Token refresh buffer:   {}s", config.token_refresh_buffer);
    println!("Debug level:            {}", config.debug_level);

    let issues = config.validate();
    if issues.is_empty() {
        println!("\nConfiguration is valid");
    } else {
        println!("\nConfiguration issues:");
        for issue in issues {
            warn!("{}", issue);
            println!("  - {}", issue);
        }
    }
}
