//! Network utility functions
//!
//! This module provides utility functions for network operations.

use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use ipnet::IpNet;

use super::error::{EchoError, Result};

/// Parse a socket address
///
/// # Arguments
///
/// * `addr` - The address string to parse
///
/// # Returns
///
/// The parsed `SocketAddr`
pub fn parse_socket_addr(addr: &str) -> Result<SocketAddr> {
    // Try direct parsing first
    if let Ok(socket_addr) = SocketAddr::from_str(addr) {
        return Ok(socket_addr);
    }

    // Try using ToSocketAddrs trait
    match addr.to_socket_addrs() {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.next() {
                Ok(addr)
            } else {
                Err(EchoError::Config(format!("Failed to parse address: {}", addr)))
            }
        }
        Err(e) => Err(EchoError::Config(format!("Failed to parse address {}: {}", addr, e))),
    }
}

/// Parse a list of CIDR networks
///
/// Accepts bare addresses as well, treating them as host networks.
pub fn parse_networks(values: &[String]) -> Result<Vec<IpNet>> {
    values
        .iter()
        .map(|value| {
            value
                .parse::<IpNet>()
                .or_else(|_| value.parse::<std::net::IpAddr>().map(IpNet::from))
                .map_err(|e| EchoError::Config(format!("Failed to parse network {}: {}", value, e)))
        })
        .collect()
}
