//! Logging utilities
//!
//! This module provides helpers for the logging system.

/// Initialize the logging system
///
/// The configured level is used unless `RUST_LOG` overrides it.
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default().filter_or("RUST_LOG", level);

    env_logger::init_from_env(env);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger() {
        // Initializes the global logger; we only check that it does not
        // panic.
        init_logger("debug");
    }
}
