//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use std::io;
use thiserror::Error;

/// Echobin error type
#[derive(Error, Debug)]
pub enum EchoError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server lifecycle error
    #[error("Server error: {0}")]
    Server(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `EchoError`.
pub type Result<T> = std::result::Result<T, EchoError>;
