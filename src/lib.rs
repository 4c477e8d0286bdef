//! Echobin: TCP echo and diagnostic server with transparent PROXY protocol detection
//!
//! This library implements a test server that describes incoming
//! connections back to their callers as JSON. Its core is a composable
//! PROXY protocol (v1/v2) decoder that sits in front of each
//! connection's byte stream: it recognizes an optional header a load
//! balancer prepended, extracts the original client and destination
//! addresses, strips exactly the header bytes, and passes the remaining
//! payload through unmodified.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use echobin::config::ServerConfig;
//! use echobin::server::EchoServer;
//! use echobin::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Arc::new(ServerConfig::default());
//!
//!     // Serve until ctrl-c or SIGTERM.
//!     EchoServer::new(config).run().await
//! }
//! ```
//!
//! The decoder stack can also be used on its own:
//!
//! ```
//! use echobin::protocol::{DetectMode, ProxyReader};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let stream = &b"PROXY TCP4 127.0.0.1 127.0.0.2 50000 8080\r\nBODY"[..];
//! let mut reader = ProxyReader::new(stream, DetectMode::Both);
//!
//! let descriptor = reader.descriptor().await.cloned();
//! assert_eq!(descriptor.unwrap().source_display().unwrap(), "127.0.0.1:50000");
//!
//! let mut payload = Vec::new();
//! reader.read_to_end(&mut payload).await.unwrap();
//! assert_eq!(payload, b"BODY");
//! # }
//! ```

// Public modules
pub mod common;
pub mod config;
pub mod protocol;
pub mod server;

// Re-export commonly used structures and functions for convenience
pub use common::{parse_socket_addr, EchoError, Result};
pub use protocol::{DetectMode, ProtocolDescriptor, ProxyReader};
pub use server::EchoServer;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
