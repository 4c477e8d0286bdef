//! Echo server module
//!
//! This module implements the TCP echo service: the accept loop with
//! graceful shutdown and the JSON response renderer that describes each
//! connection back to its caller.

pub mod response;
pub mod tcp;

pub use response::{build_response, EchoResponse};
pub use tcp::EchoServer;
