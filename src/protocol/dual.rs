//! v1-and-v2 layering combinator
//!
//! Stacks the two version decoders so one listener can accept either
//! header encoding: the v1 decoder wraps the raw source and the v2
//! decoder wraps the v1 decoder. Reads always enter through the outer
//! (v2) layer, so whichever header is present is stripped exactly once
//! and a stream carrying neither passes through untouched.

use std::io;

use super::{ByteSource, DetectError, ProtocolDescriptor, V1Decoder, V2Decoder};

/// Combined v1+v2 decoder for a single stream.
pub struct DualDecoder<S: ByteSource> {
    outer: V2Decoder<V1Decoder<S>>,
}

impl<S: ByteSource> DualDecoder<S> {
    pub fn new(source: S) -> Self {
        Self {
            outer: V2Decoder::new(V1Decoder::new(source)),
        }
    }

    /// Run detection once. Resolving the outer decoder reads through the
    /// inner one, which resolves it as a side effect.
    pub async fn resolve(&mut self) {
        self.outer.resolve().await;
    }

    /// The decoded header; the outer (v2) result wins when both layers
    /// produced one.
    pub fn descriptor(&self) -> Option<&ProtocolDescriptor> {
        self.outer
            .descriptor()
            .or_else(|| self.outer.source_ref().descriptor())
    }

    /// Error from a header that was recognized but malformed, from
    /// whichever layer recorded one. Signature mismatches stay silent;
    /// they just mean that version was not on the wire.
    pub fn detect_error(&self) -> Option<&DetectError> {
        self.outer
            .state()
            .failure()
            .or_else(|| self.outer.source_ref().state().failure())
    }
}

impl<S: ByteSource> ByteSource for DualDecoder<S> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.outer.read(buf).await
    }
}
