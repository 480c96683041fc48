mod config_commands;
mod relay_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    courier_config::CourierConfig,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "courier", about = "Courier: ordered per-destination message delivery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to load instead of searching the standard locations.
    #[arg(long, global = true, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay `<destination> <text>` lines from stdin through delivery queues.
    Relay(relay_commands::RelayArgs),
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

/// Initialise tracing. `RUST_LOG` wins over `--log-level`.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries relayed messages.
    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Load the explicit config file if one was given, otherwise discover one.
fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<CourierConfig> {
    match path {
        Some(path) => {
            let mut config = courier_config::load_config(path)?;
            courier_config::apply_env_overrides(&mut config);
            Ok(config)
        },
        None => Ok(courier_config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "courier starting");

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Relay(args) => relay_commands::handle_relay(args, &config).await,
        Commands::Config { action } => {
            config_commands::handle_config(action, &config, cli.config.as_deref())
        },
    }
}
