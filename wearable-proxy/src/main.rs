//! wearable-proxy: TCP proxy server for a wearable sensor device.
//!
//! A single remote client connects over TCP to control the device
//! (search, connect, configure) and receive its sensor stream.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

mod logging;
mod provider;
mod server;

use provider::{SimulatedProvider, SimulatorConfig};
use server::{ProxyServer, ServerConfig};

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "wearable-proxy.toml";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_RETENTION_DAYS: u64 = 7;

/// wearable-proxy - TCP proxy server for a wearable sensor device
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on [default: 0.0.0.0:38010]
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Server tick interval in milliseconds [default: 16]
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Directory where log files are stored [default: logs]
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files [default: 7]
    #[arg(long)]
    log_retention_days: Option<u64>,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default)]
    simulator: SimulatorConfig,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ServerSection {
    listen: Option<String>,
    tick_interval_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    receive_buffer_size: Option<usize>,
    transmit_buffer_size: Option<usize>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Merge command line and file settings; the command line wins.
fn build_server_config(
    args: &Args,
    file: &ServerSection,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let defaults = ServerConfig::default();

    let listen_addr = match (args.listen, file.listen.as_deref()) {
        (Some(addr), _) => addr,
        (None, Some(addr)) => addr
            .parse::<SocketAddr>()
            .map_err(|e| format!("Invalid listen address {:?}: {}", addr, e))?,
        (None, None) => defaults.listen_addr,
    };

    let config = ServerConfig {
        listen_addr,
        tick_interval: args
            .tick_ms
            .or(file.tick_interval_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.tick_interval),
        write_timeout: file
            .write_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.write_timeout),
        receive_buffer_size: file
            .receive_buffer_size
            .unwrap_or(defaults.receive_buffer_size),
        transmit_buffer_size: file
            .transmit_buffer_size
            .unwrap_or(defaults.transmit_buffer_size),
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Explicit path > auto-detect > defaults
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };

    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
    let log_retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(DEFAULT_RETENTION_DAYS);
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let config = match build_server_config(&args, &file_config.server) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e);
        }
    };

    let simulator = file_config.simulator;
    if let Err(e) = simulator.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }
    info!(
        "  Simulator: {} devices at {} Hz",
        simulator.devices.len(),
        simulator.sample_rate_hz
    );
    let mut server = ProxyServer::new(config, SimulatedProvider::new(simulator));

    let config = server.config();
    info!("wearable-proxy starting...");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Tick interval: {:?}", config.tick_interval);
    info!("  Write timeout: {:?}", config.write_timeout);
    info!(
        "  Buffers: receive {} bytes, transmit {} bytes",
        config.receive_buffer_size, config.transmit_buffer_size
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    if let Err(e) = server.run(shutdown).await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("wearable-proxy stopped");
    Ok(())
}
