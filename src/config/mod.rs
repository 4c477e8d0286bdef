//! Configuration module
//!
//! This module handles application configuration, including loading from
//! different sources (files, environment variables, command line arguments)
//! and validating the configuration.

use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::common::{parse_networks, parse_socket_addr, EchoError, Result};
use crate::protocol::DetectMode;

/// Environment variable prefix for configuration options
pub const ENV_PREFIX: &str = "ECHOBIN_";

/// Echo server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the echo server
    pub listen: SocketAddr,

    /// Which PROXY protocol versions are accepted on the listener
    pub proxy_protocol: DetectMode,

    /// Maximum number of bytes read from one connection
    pub max_buffer_size: usize,

    /// Networks trusted to send correct PROXY protocol headers
    pub trusted_proxies: Vec<IpNet>,

    /// Seconds to keep serving after a shutdown signal so load balancers
    /// can remove this backend from rotation
    pub shutdown_delay_secs: u64,

    /// Seconds to wait for in-flight connections during shutdown
    pub graceful_timeout_secs: u64,

    /// Log level
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            proxy_protocol: DetectMode::default(),
            max_buffer_size: 1024,
            trusted_proxies: vec![
                IpNet::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).expect("valid prefix"),
                IpNet::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).expect("valid prefix"),
            ],
            shutdown_delay_secs: 2,
            graceful_timeout_secs: 120,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Merge another configuration into this one
    ///
    /// Fields in `other` that differ from the defaults take precedence.
    pub fn merge(&self, other: &ServerConfig) -> Self {
        let defaults = ServerConfig::default();

        fn pick<T: Clone + PartialEq>(default: &T, base: &T, overlay: &T) -> T {
            if overlay != default {
                overlay.clone()
            } else {
                base.clone()
            }
        }

        Self {
            listen: pick(&defaults.listen, &self.listen, &other.listen),
            proxy_protocol: pick(
                &defaults.proxy_protocol,
                &self.proxy_protocol,
                &other.proxy_protocol,
            ),
            max_buffer_size: pick(
                &defaults.max_buffer_size,
                &self.max_buffer_size,
                &other.max_buffer_size,
            ),
            trusted_proxies: pick(
                &defaults.trusted_proxies,
                &self.trusted_proxies,
                &other.trusted_proxies,
            ),
            shutdown_delay_secs: pick(
                &defaults.shutdown_delay_secs,
                &self.shutdown_delay_secs,
                &other.shutdown_delay_secs,
            ),
            graceful_timeout_secs: pick(
                &defaults.graceful_timeout_secs,
                &self.graceful_timeout_secs,
                &other.graceful_timeout_secs,
            ),
            log_level: pick(&defaults.log_level, &self.log_level, &other.log_level),
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            EchoError::Config(format!(
                "Failed to read configuration file {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            EchoError::Config(format!(
                "Failed to parse configuration file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Load configuration overrides from `ECHOBIN_`-prefixed environment
    /// variables
    pub fn from_env() -> Result<Self> {
        let get_env = |name: &str| -> Option<String> {
            env::var(format!("{}{}", ENV_PREFIX, name)).ok()
        };

        let mut config = ServerConfig::default();

        if let Some(listen) = get_env("LISTEN") {
            config.listen = parse_socket_addr(&listen)?;
        }

        if let Some(mode) = get_env("PROXY_PROTOCOL") {
            config.proxy_protocol = DetectMode::parse(&mode)?;
        }

        if let Some(size) = get_env("MAX_BUFFER_SIZE") {
            config.max_buffer_size = size.parse().map_err(|_| {
                EchoError::Config(format!("Invalid max buffer size: {}", size))
            })?;
        }

        if let Some(networks) = get_env("TRUSTED_PROXIES") {
            let values: Vec<String> = networks.split(',').map(|s| s.trim().to_string()).collect();
            config.trusted_proxies = parse_networks(&values)?;
        }

        if let Some(delay) = get_env("SHUTDOWN_DELAY_SECS") {
            config.shutdown_delay_secs = delay.parse().map_err(|_| {
                EchoError::Config(format!("Invalid shutdown delay: {}", delay))
            })?;
        }

        if let Some(timeout) = get_env("GRACEFUL_TIMEOUT_SECS") {
            config.graceful_timeout_secs = timeout.parse().map_err(|_| {
                EchoError::Config(format!("Invalid graceful timeout: {}", timeout))
            })?;
        }

        if let Some(level) = get_env("LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_size == 0 {
            return Err(EchoError::Config(
                "max_buffer_size must be greater than zero".to_string(),
            ));
        }

        if log::LevelFilter::from_str(&self.log_level).is_err() {
            return Err(EchoError::Config(format!(
                "Invalid log level: {}",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_secs(self.shutdown_delay_secs)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    /// Whether an address belongs to one of the trusted networks
    pub fn is_trusted(&self, addr: IpAddr) -> bool {
        self.trusted_proxies.iter().any(|net| net.contains(&addr))
    }
}
