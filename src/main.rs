//! Echobin Command Line Tool
//!
//! This binary is the command-line interface for the echobin test server.

use clap::Parser;
use log::{info, warn};

// Import our library
use echobin::common::{init_logger, parse_networks, parse_socket_addr, Result};
use echobin::config::ServerConfig;
use echobin::protocol::DetectMode;
use echobin::server::EchoServer;
use echobin::{APP_NAME, VERSION};

use std::path::Path;
use std::sync::Arc;

/// TCP echo and diagnostic server with transparent PROXY protocol detection
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Listen address
    #[clap(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// PROXY protocol versions to accept (none, v1, v2, both)
    #[clap(long, default_value = "both")]
    proxy_protocol: String,

    /// Maximum number of bytes read from one connection
    #[clap(long, default_value_t = 1024)]
    max_buffer_size: usize,

    /// Networks trusted to send correct PROXY protocol headers
    /// (comma-separated CIDRs)
    #[clap(long, value_delimiter = ',')]
    trusted_proxies: Option<Vec<String>>,

    /// Seconds to keep serving after a shutdown signal so load balancers
    /// can drain traffic
    #[clap(long, default_value_t = 2)]
    shutdown_delay: u64,

    /// Seconds to wait for in-flight connections during shutdown
    #[clap(long, default_value_t = 120)]
    graceful_timeout: u64,

    /// Log level
    #[clap(long, default_value = "info")]
    log_level: String,

    /// Load configuration from ECHOBIN_-prefixed environment variables
    #[clap(long)]
    from_env: bool,

    /// Load configuration from a file
    #[clap(long)]
    config_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logger
    init_logger(&args.log_level);

    info!("Starting {} v{}", APP_NAME, VERSION);

    // Create default configuration
    let mut config = ServerConfig::default();

    // Load from configuration file if specified
    if let Some(config_file) = args.config_file.clone() {
        if Path::new(&config_file).exists() {
            info!("Loading configuration from file: {}", config_file);
            config = config.merge(&ServerConfig::from_file(&config_file)?);
        } else {
            warn!("Configuration file not found: {}", config_file);
        }
    }

    if args.from_env {
        info!("Loading configuration from environment variables");
        config = config.merge(&ServerConfig::from_env()?);
    } else {
        info!("Loading configuration from command line arguments");
        config = config.merge(&config_from_args(&args)?);
    }

    // Validate the final configuration
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Listen address: {}", config.listen);
    info!("PROXY protocol mode: {}", config.proxy_protocol);
    info!("Max buffer size: {} bytes", config.max_buffer_size);

    // Create and start the echo server
    let server = EchoServer::new(Arc::new(config));

    info!("Echo service ready, press Ctrl+C to stop");

    server.run().await
}

fn config_from_args(args: &Args) -> Result<ServerConfig> {
    let mut config = ServerConfig {
        listen: parse_socket_addr(&args.listen)?,
        proxy_protocol: DetectMode::parse(&args.proxy_protocol)?,
        max_buffer_size: args.max_buffer_size,
        shutdown_delay_secs: args.shutdown_delay,
        graceful_timeout_secs: args.graceful_timeout,
        log_level: args.log_level.clone(),
        ..ServerConfig::default()
    };

    if let Some(values) = &args.trusted_proxies {
        config.trusted_proxies = parse_networks(values)?;
    }

    Ok(config)
}
