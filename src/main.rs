//! suez-mqtt - Main Entry Point
//!
//! Exit codes: 0 on clean shutdown, 1 on a fatal startup failure (bad
//! configuration, unreachable broker) or a failed credential check.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use suez_mqtt::config::ServiceConfig;
use suez_mqtt::error::ServiceResult;
use suez_mqtt::observability::{init_default_logging, init_logging, logging, LogFormat};
use suez_mqtt::remote::{FetchAdapter, ToutSurMonEauClient, ToutSurMonEauConfig, WaterUsageApi};
use suez_mqtt::service::SuezService;
use suez_mqtt::transport::mqtt::MqttClient;
use tokio::signal;
use tracing::{error, info, Level};

/// Bridge between MQTT refresh commands and the Suez water-usage portal
#[derive(Parser)]
#[command(name = "suez-mqtt")]
#[command(about = "Publish Suez water consumption on MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML); the environment is used otherwise
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until SIGINT or SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration, secrets redacted
        #[arg(long)]
        show: bool,
    },
    /// Authenticate against the portal once and exit
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_observability(cli.verbose);

    info!("Starting suez-mqtt v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_service(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Check => check_credentials(&config).await.map_err(Into::into),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn init_observability(verbose: u8) {
    let level = match verbose {
        0 => {
            init_default_logging();
            return;
        }
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = std::env::var("LOG_SPANS")
        .map(|v| suez_mqtt::config::parse_flag(&v))
        .unwrap_or(false);
    init_logging(level, format, include_spans);
    tracing::debug!(filter = %logging::filter_directives(level), "Verbose logging enabled");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ServiceConfig, suez_mqtt::config::ConfigError> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ServiceConfig::load_from_file(path)
        }
        None => {
            info!("Loading configuration from environment");
            ServiceConfig::from_env()
        }
    }
}

fn build_api(config: &ServiceConfig) -> ServiceResult<Arc<dyn WaterUsageApi>> {
    let client = ToutSurMonEauClient::new(ToutSurMonEauConfig::from_account(&config.account))?;
    Ok(Arc::new(client))
}

async fn run_service(config: ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let api = build_api(&config)?;
    let transport = MqttClient::new("suez-mqtt", config.mqtt.clone());
    let mut service = SuezService::new(config, transport, api);

    service.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Bridge is running and waiting for refresh commands");

    service
        .run_until(async move {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully...");
                }
            }
        })
        .await?;

    Ok(())
}

fn handle_config_command(config: &ServiceConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Effective configuration:");
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn check_credentials(config: &ServiceConfig) -> ServiceResult<()> {
    let adapter = FetchAdapter::new(build_api(config)?, config.service.windows);
    adapter.check_credentials().await?;
    info!(meter_id = %config.account.meter_id, "Credentials accepted");
    Ok(())
}
