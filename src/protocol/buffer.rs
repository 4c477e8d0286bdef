//! Lookahead buffer
//!
//! A byte-source wrapper that lets a decoder inspect the head of a stream
//! without losing it. Peeked bytes stay pending until the decoder marks
//! them consumed; a read always drains pending bytes before touching the
//! underlying source, so no byte is ever skipped or delivered twice.

use std::io;

use bytes::{Buf, BytesMut};

use super::ByteSource;

/// Buffers the head of another byte source.
///
/// Created per connection (or per decoder layer); the pending sequence
/// holds bytes that were peeked but not yet released to the caller.
pub struct LookaheadBuffer<S> {
    pending: BytesMut,
    source: S,
}

impl<S: ByteSource> LookaheadBuffer<S> {
    pub fn new(source: S) -> Self {
        Self {
            pending: BytesMut::new(),
            source,
        }
    }

    /// Pull up to `n` further bytes from the source without consuming
    /// them, returning the newly pulled bytes.
    ///
    /// Makes a single read call on the source, so fewer than `n` bytes
    /// may come back; an empty slice means the stream ended. Successive
    /// peeks walk forward through the stream, which lets a decoder read a
    /// header field by field without over-reading.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        let start = self.pending.len();
        self.pending.resize(start + n, 0);
        match self.source.read(&mut self.pending[start..]).await {
            Ok(got) => {
                self.pending.truncate(start + got);
                Ok(&self.pending[start..])
            }
            Err(err) => {
                self.pending.truncate(start);
                Err(err)
            }
        }
    }

    /// Peek a single byte, `None` when the stream ended.
    pub async fn peek_byte(&mut self) -> io::Result<Option<u8>> {
        let bytes = self.peek(1).await?;
        Ok(bytes.first().copied())
    }

    /// Drop the first `n` pending bytes.
    ///
    /// # Panics
    ///
    /// Panics when `n` exceeds the pending length; that is a decoder bug,
    /// not a data error.
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.pending.len(),
            "consumed {} bytes but only {} are pending",
            n,
            self.pending.len()
        );
        self.pending.advance(n);
    }

    /// Drop everything currently pending.
    pub fn consume_all(&mut self) {
        self.pending.clear();
    }

    /// Number of bytes currently pending.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn source_ref(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Read into `buf`, draining pending bytes first.
    ///
    /// Pending bytes and fresh source bytes are never mixed in one call;
    /// once the pending sequence is empty, reads go straight through to
    /// the source.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            return Ok(n);
        }
        self.source.read(buf).await
    }
}
