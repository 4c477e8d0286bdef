//! PROXY protocol v1 (text header) decoder
//!
//! The v1 header is a single human-readable line:
//! `PROXY <family> <src-addr> <dst-addr> <src-port> <dst-port>\r\n`, or
//! `PROXY UNKNOWN ...\r\n` when the proxy cannot describe the origin.
//! The whole line is at most 107 bytes including the terminator.
//!
//! Only a fully valid header advances the stream; any rejection leaves
//! every peeked byte unconsumed so the payload (or another decoder layer)
//! sees the stream from its original start.

use std::io;
use std::net::{IpAddr, SocketAddr};

use log::{debug, trace};

use super::buffer::LookaheadBuffer;
use super::{
    ByteSource, DetectError, DetectState, Endpoints, ProtocolDescriptor, ProtocolVersion, Transport,
};

/// Maximum legal v1 header length, terminator included.
const MAX_HEADER_LEN: usize = 107;

const SIGNATURE: &str = "PROXY";

/// Decoder for the v1 text header.
pub struct V1Decoder<S> {
    buffer: LookaheadBuffer<S>,
    state: DetectState,
}

impl<S: ByteSource> V1Decoder<S> {
    pub fn new(source: S) -> Self {
        Self {
            buffer: LookaheadBuffer::new(source),
            state: DetectState::Pending,
        }
    }

    /// Run header detection once; later calls are no-ops.
    pub async fn resolve(&mut self) {
        if !matches!(self.state, DetectState::Pending) {
            return;
        }
        let (state, consumed) = self.detect().await;
        self.buffer.consume(consumed);
        match &state {
            DetectState::Found(descriptor) => {
                debug!("v1 header found: {}", descriptor.transport);
            }
            DetectState::Failed(err) => debug!("malformed v1 header: {}", err),
            DetectState::Absent(err) => trace!("no v1 header: {}", err),
            DetectState::Pending => {}
        }
        self.state = state;
    }

    pub fn descriptor(&self) -> Option<&ProtocolDescriptor> {
        self.state.descriptor()
    }

    pub fn state(&self) -> &DetectState {
        &self.state
    }

    /// Any recorded detection error, signature mismatches included.
    pub fn detect_error(&self) -> Option<&DetectError> {
        match &self.state {
            DetectState::Absent(err) | DetectState::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Parse the header from the head of the stream. Returns the state to
    /// record and the number of bytes the header occupied; rejections
    /// always account for zero bytes.
    async fn detect(&mut self) -> (DetectState, usize) {
        let head = match self.buffer.peek(MAX_HEADER_LEN).await {
            Ok(bytes) => bytes,
            Err(err) => return (DetectState::Absent(DetectError::Io(err.to_string())), 0),
        };
        if head.is_empty() {
            return (DetectState::Absent(DetectError::UnexpectedEos), 0);
        }

        let lf = match head.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => return (DetectState::Absent(DetectError::MissingLineFeed), 0),
        };

        // A v1 header line is ASCII; anything else cannot be one.
        let line = match std::str::from_utf8(&head[..lf]) {
            Ok(line) => line,
            Err(_) => return (DetectState::Absent(DetectError::SignatureMismatch), 0),
        };

        let tokens: Vec<&str> = line.trim().split(' ').collect();
        if tokens.first().copied() != Some(SIGNATURE) {
            return (DetectState::Absent(DetectError::SignatureMismatch), 0);
        }

        // Signature recognized; everything below is a malformed header.
        if head[lf - 1] != b'\r' {
            return (DetectState::Failed(DetectError::MissingCarriageReturn), 0);
        }
        if tokens.len() < 2 {
            return (DetectState::Failed(DetectError::TooFewTokens), 0);
        }

        let header_len = lf + 1;

        match tokens[1] {
            // Extra tokens after UNKNOWN are tolerated and ignored.
            "UNKNOWN" => {
                let descriptor = ProtocolDescriptor {
                    version: ProtocolVersion::V1,
                    transport: Transport::Unknown,
                    endpoints: Endpoints::None,
                };
                (DetectState::Found(descriptor), header_len)
            }
            "TCP4" | "TCP6" => {
                if tokens.len() != 6 {
                    return (DetectState::Failed(DetectError::FieldCount(tokens.len())), 0);
                }

                let source_ip: IpAddr = match tokens[2].parse() {
                    Ok(ip) => ip,
                    Err(_) => return (DetectState::Failed(DetectError::BadSourceAddress), 0),
                };
                let destination_ip: IpAddr = match tokens[3].parse() {
                    Ok(ip) => ip,
                    Err(_) => return (DetectState::Failed(DetectError::BadDestinationAddress), 0),
                };
                let source_port: u16 = match tokens[4].parse() {
                    Ok(port) => port,
                    Err(_) => return (DetectState::Failed(DetectError::BadSourcePort), 0),
                };
                let destination_port: u16 = match tokens[5].parse() {
                    Ok(port) => port,
                    Err(_) => return (DetectState::Failed(DetectError::BadDestinationPort), 0),
                };

                let transport = if tokens[1] == "TCP4" {
                    Transport::Tcp4
                } else {
                    Transport::Tcp6
                };
                let descriptor = ProtocolDescriptor {
                    version: ProtocolVersion::V1,
                    transport,
                    endpoints: Endpoints::Inet {
                        source: SocketAddr::new(source_ip, source_port),
                        destination: SocketAddr::new(destination_ip, destination_port),
                    },
                };
                (DetectState::Found(descriptor), header_len)
            }
            other => (
                DetectState::Failed(DetectError::UnknownFamily(other.to_string())),
                0,
            ),
        }
    }
}

impl<S: ByteSource> ByteSource for V1Decoder<S> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.resolve().await;
        self.buffer.read(buf).await
    }
}
