use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nvr_bridge::api::ProtectClient;
use nvr_bridge::config::ConfigStore;
use nvr_bridge::events::{EventBus, UpdateListener};
use nvr_bridge::livestream::LivestreamManager;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// nvr-bridge command line arguments
#[derive(Parser, Debug)]
#[command(name = "nvr-bridge")]
#[command(version, about = "Bridge an NVR controller to a smart-home accessory platform", long_about = None)]
struct CliArgs {
    /// Controller address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// Controller API key (overrides config file)
    #[arg(short = 'k', long, value_name = "KEY")]
    api_key: Option<String>,

    /// Data directory path (default: /etc/nvr-bridge)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Initialize logging with CLI arguments
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting nvr-bridge v{}", env!("CARGO_PKG_VERSION"));

    // Determine data directory (CLI arg takes precedence)
    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    // Initialize configuration store
    let config_store = ConfigStore::new(&data_dir.join("bridge.json")).await?;
    let mut config = (*config_store.get()).clone();

    // Apply CLI argument overrides to config (only if explicitly specified)
    if let Some(address) = args.address {
        config.controller.address = address;
    }
    if let Some(api_key) = args.api_key {
        config.controller.api_key = api_key;
    }
    if config.controller.address.is_empty() {
        anyhow::bail!("no controller address configured; use --address or edit bridge.json");
    }

    let client = Arc::new(ProtectClient::new(&config.controller)?);
    let events = Arc::new(EventBus::new());
    let manager = LivestreamManager::new(client.clone(), config.livestream.clone());
    manager.set_event_bus(events.clone());

    // The update listener feeds the event bus from the controller's
    // realtime socket, reconnecting on its own
    let shutdown = CancellationToken::new();
    let listener = UpdateListener::new(
        format!("wss://{}/proxy/protect/ws/updates", config.controller.address),
        config.controller.api_key.clone(),
        events.clone(),
        config.livestream.clone(),
        shutdown.clone(),
    );
    let listener_task = tokio::spawn(listener.run());

    tracing::info!("Bridge is up, connected to {}", config.controller.address);

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!("Shutdown signal received");

    shutdown.cancel();
    manager.shutdown().await;
    let _ = listener_task.await;
    tracing::info!("Goodbye");

    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    // Build filter string based on effective level
    let filter = match effective_level {
        LogLevel::Error => "nvr_bridge=error",
        LogLevel::Warn => "nvr_bridge=warn",
        LogLevel::Info => "nvr_bridge=info",
        LogLevel::Verbose => "nvr_bridge=debug",
        LogLevel::Debug => "nvr_bridge=debug,tokio_tungstenite=debug",
        LogLevel::Trace => "nvr_bridge=trace,tokio_tungstenite=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    // Check environment variable first
    if let Ok(path) = std::env::var("NVR_BRIDGE_DATA_DIR") {
        return PathBuf::from(path);
    }

    // Default to system configuration directory
    PathBuf::from("/etc/nvr-bridge")
}
