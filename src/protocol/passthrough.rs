//! No-op decoder used when protocol detection is disabled.

use std::io;

use super::ByteSource;

/// Passes reads straight through to the source with no look-ahead
/// overhead; never reports a descriptor or an error.
pub struct Passthrough<S> {
    source: S,
}

impl<S> Passthrough<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: ByteSource> ByteSource for Passthrough<S> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.source.read(buf).await
    }
}
