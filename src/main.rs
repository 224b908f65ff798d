//! ClawRelay - WebSocket session bridge for a coding-assistant CLI
//!
//! Serves the REST facade and the CLI/browser WebSocket endpoints.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clawrelay::{
    agent::{launcher::resolve_cli_binary, AgentService, AgentState},
    api::build_app,
    config::RelayConfig,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "clawrelay")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "WebSocket session bridge between browsers and a coding-assistant CLI")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CLAWRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run diagnostics
    Doctor,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("clawrelay={},tower_http=info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = cli.config.or_else(|| default_config_path().filter(|p| p.exists()));
    let config = match config_path {
        Some(ref path) => RelayConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => RelayConfig::default(),
    };

    match cli.command {
        Commands::Serve { host, port } => {
            run_server(config, host, port).await?;
        }
        Commands::Doctor => {
            run_doctor(&config, config_path.as_deref());
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

async fn run_server(mut config: RelayConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.validate()?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let local_addr = listener.local_addr()?;
    // The dial-back URL must carry the real port (port 0 binds an ephemeral one)
    config.server.port = local_addr.port();

    let service = AgentService::new(&config);
    let app = build_app(
        AgentState {
            service: service.clone(),
        },
        &config.server.cors_origins,
    );

    tracing::info!(address = %local_addr, "ClawRelay is running. Press Ctrl+C to stop.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down...");
            // Close sockets first so upgraded connections do not hold the server open
            service.shutdown().await;
        })
        .await?;

    Ok(())
}

fn run_doctor(config: &RelayConfig, config_path: Option<&std::path::Path>) {
    println!("ClawRelay Doctor");
    println!();

    println!("Checking configuration...");
    match config_path {
        Some(path) => println!("  ✓ Configuration file: {}", path.display()),
        None => println!("  ℹ No configuration file found (using defaults)"),
    }
    match config.validate() {
        Ok(()) => println!("  ✓ Configuration is valid"),
        Err(e) => println!("  ✗ {}", e),
    }

    println!();
    println!("Checking CLI binary...");
    match resolve_cli_binary(config.cli.binary.as_deref()) {
        Ok(path) => println!("  ✓ Found: {}", path.display()),
        Err(e) => println!("  ✗ {}", e),
    }

    println!();
    println!("Doctor check complete!");
}

fn show_config(config: Option<&RelayConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}

/// `<config dir>/clawrelay/config.toml`
fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join("clawrelay").join("config.toml"))
}
