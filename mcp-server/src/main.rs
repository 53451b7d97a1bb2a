mod config;
mod setup;
mod telemetry;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use setup::{ensure_database_directory, initialize_app};
use telemetry::{init_telemetry, log_shutdown_info, log_startup_info};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "taskloom-mcp")]
#[command(about = "Multi-tenant task orchestration MCP server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value = "3000")]
    port: u16,

    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Database URL override
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Listen address override (default: 127.0.0.1)
    #[arg(long, env = "LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Log level override
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(config_file) => Config::from_file(config_file)?,
        None => Config::from_env()?,
    };

    if let Some(ref database_url) = cli.database_url {
        config.database.url = Some(database_url.clone());
    }
    if let Some(ref listen_addr) = cli.listen_addr {
        config.server.listen_addr = listen_addr.clone();
    }
    if let Some(ref log_level) = cli.log_level {
        config.logging.level = log_level.clone();
    }
    config.server.port = cli.port;

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = load_config(&cli).context("Failed to load configuration")?;

    init_telemetry(&config.logging).context("Failed to initialize telemetry")?;

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }

    log_startup_info(&config);
    ensure_database_directory(&config).context("Failed to create database directory")?;

    let server = initialize_app(&config)
        .await
        .context("Failed to initialize application")?;

    info!(address = %config.server_address(), "Taskloom MCP server ready");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM handler");
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                    .expect("Failed to register SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
            }
        }

        #[cfg(windows)]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for ctrl+c");
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        let _ = shutdown_tx.send(());
    });

    let server_addr = config.server_address();
    tokio::select! {
        result = server.serve(&server_addr) => {
            if let Err(e) = result {
                error!(error = %e, "MCP server error");
                std::process::exit(3);
            }
            Ok(())
        }
        _ = shutdown_rx => {
            log_shutdown_info();
            Ok(())
        }
    }
}
