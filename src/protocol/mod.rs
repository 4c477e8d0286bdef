//! PROXY protocol detection module
//!
//! This module implements transparent detection of the PROXY protocol
//! preamble (versions 1 and 2) that load balancers such as HAProxy or AWS
//! ELB prepend to forwarded connections. A decoder wraps a connection's
//! byte stream, inspects the first bytes without consuming anything it
//! cannot account for, strips a recognized header, and hands the rest of
//! the stream through unmodified.
//!
//! Decoders are composable: each one reads from a [`ByteSource`] and is a
//! `ByteSource` itself, so the v1-and-v2 combinator simply stacks the v2
//! decoder on top of the v1 decoder.

mod buffer;
mod dual;
mod passthrough;
mod v1;
mod v2;

pub use buffer::LookaheadBuffer;
pub use dual::DualDecoder;
pub use passthrough::Passthrough;
pub use v1::V1Decoder;
pub use v2::V2Decoder;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::common::EchoError;

/// A byte stream a decoder can read from.
///
/// Implemented by [`StreamSource`] for raw connections and by every
/// decoder, which is what allows decoders to be layered.
pub trait ByteSource: Send {
    /// Read into `buf`, returning the number of bytes read. `Ok(0)` means
    /// end of stream.
    #[allow(async_fn_in_trait)]
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Adapts any async byte stream to [`ByteSource`].
pub struct StreamSource<R> {
    inner: R,
}

impl<R> StreamSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: AsyncRead + Unpin + Send> ByteSource for StreamSource<R> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }
}

/// PROXY protocol header encoding version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V1 => write!(f, "v1"),
            ProtocolVersion::V2 => write!(f, "v2"),
        }
    }
}

/// Transport and address family carried in a decoded header.
///
/// `Unknown` is the v1 `UNKNOWN` family; the remaining v1 families are
/// `Tcp4`/`Tcp6`. The v2 families combine the address family nibble with
/// the transport nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Unknown,
    Tcp4,
    Tcp6,
    Unspec,
    TcpV4,
    UdpV4,
    TcpV6,
    UdpV6,
    UnixStream,
    UnixDatagram,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Transport::Unknown => "UNKNOWN",
            Transport::Tcp4 => "TCP4",
            Transport::Tcp6 => "TCP6",
            Transport::Unspec => "UNSPEC",
            Transport::TcpV4 => "TCPv4",
            Transport::UdpV4 => "UDPv4",
            Transport::TcpV6 => "TCPv6",
            Transport::UdpV6 => "UDPv6",
            Transport::UnixStream => "UNIXStream",
            Transport::UnixDatagram => "UNIXDatagram",
        };
        write!(f, "{}", label)
    }
}

/// Source and destination endpoints of a decoded header.
///
/// A closed set so that nonsensical combinations (a UNIX socket with a
/// port, an `UNKNOWN` family with addresses) cannot be represented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoints {
    /// No address information (`UNKNOWN`, `UNSPEC`).
    None,
    /// IPv4/IPv6 address and port pairs.
    Inet {
        source: SocketAddr,
        destination: SocketAddr,
    },
    /// UNIX socket filesystem paths.
    Unix {
        source: PathBuf,
        destination: PathBuf,
    },
}

/// A decoded PROXY protocol header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    pub version: ProtocolVersion,
    pub transport: Transport,
    pub endpoints: Endpoints,
}

impl ProtocolDescriptor {
    /// Source IP address, when the header carried internet endpoints.
    pub fn source_ip(&self) -> Option<IpAddr> {
        match &self.endpoints {
            Endpoints::Inet { source, .. } => Some(source.ip()),
            _ => None,
        }
    }

    /// Renders the source endpoint for display, `None` when the header
    /// carried no address information.
    pub fn source_display(&self) -> Option<String> {
        match &self.endpoints {
            Endpoints::None => None,
            Endpoints::Inet { source, .. } => Some(source.to_string()),
            Endpoints::Unix { source, .. } => Some(source.display().to_string()),
        }
    }

    /// Renders the destination endpoint for display.
    pub fn destination_display(&self) -> Option<String> {
        match &self.endpoints {
            Endpoints::None => None,
            Endpoints::Inet { destination, .. } => Some(destination.to_string()),
            Endpoints::Unix { destination, .. } => Some(destination.display().to_string()),
        }
    }
}

/// Why header detection rejected the stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetectError {
    #[error("error reading header: {0}")]
    Io(String),

    #[error("connection ended before a header could be read")]
    UnexpectedEos,

    #[error("header signature does not match")]
    SignatureMismatch,

    #[error("no line feed in the first 107 bytes of the header")]
    MissingLineFeed,

    #[error("header line is not terminated by CRLF")]
    MissingCarriageReturn,

    #[error("expected at least two tokens in the header line")]
    TooFewTokens,

    #[error("expected six space-separated fields, got {0}")]
    FieldCount(usize),

    #[error("unrecognized address family {0:?}")]
    UnknownFamily(String),

    #[error("could not parse source address")]
    BadSourceAddress,

    #[error("could not parse destination address")]
    BadDestinationAddress,

    #[error("could not parse source port")]
    BadSourcePort,

    #[error("could not parse destination port")]
    BadDestinationPort,

    #[error("header ended before the fixed fields were complete")]
    TruncatedHeader,

    #[error("unknown protocol version and command byte {0:#04x}")]
    UnknownCommand(u8),

    #[error("unknown address family and transport byte {0:#04x}")]
    UnknownTransport(u8),

    #[error("address block length {got} below the {min}-byte minimum for {family}")]
    AddressBlockTooShort {
        family: Transport,
        min: u16,
        got: u16,
    },

    #[error("UNSPEC headers must declare a zero-length address block")]
    UnspecWithPayload,

    #[error("address block ended after {got} of {expected} bytes")]
    TruncatedAddressBlock { expected: usize, got: usize },
}

/// Outcome of header detection on one stream.
///
/// `Absent` means the stream does not start with this version's signature
/// and was passed through untouched. `Failed` means the signature was
/// recognized but the header was structurally invalid; the stream is
/// still passed through from its original start so non-header traffic is
/// not corrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectState {
    Pending,
    Found(ProtocolDescriptor),
    Absent(DetectError),
    Failed(DetectError),
}

impl DetectState {
    pub fn descriptor(&self) -> Option<&ProtocolDescriptor> {
        match self {
            DetectState::Found(descriptor) => Some(descriptor),
            _ => None,
        }
    }

    /// Error from a header that was recognized but malformed.
    pub fn failure(&self) -> Option<&DetectError> {
        match self {
            DetectState::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Which PROXY protocol versions a listener accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectMode {
    /// No detection, the stream is passed through untouched.
    None,
    V1,
    V2,
    #[default]
    Both,
}

impl DetectMode {
    /// Parse a detect mode from its configuration string.
    pub fn parse(s: &str) -> crate::common::Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(DetectMode::None),
            "v1" => Ok(DetectMode::V1),
            "v2" => Ok(DetectMode::V2),
            "both" | "v1v2" => Ok(DetectMode::Both),
            _ => Err(EchoError::Config(format!(
                "Invalid proxy protocol mode: {} (expected none, v1, v2 or both)",
                s
            ))),
        }
    }
}

impl fmt::Display for DetectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectMode::None => write!(f, "none"),
            DetectMode::V1 => write!(f, "v1"),
            DetectMode::V2 => write!(f, "v2"),
            DetectMode::Both => write!(f, "both"),
        }
    }
}

/// A connection reader with PROXY protocol support.
///
/// Built once per connection from the configured [`DetectMode`]. The
/// first read or descriptor query triggers header detection; subsequent
/// reads stream the remaining payload untouched.
pub enum ProxyReader<R: AsyncRead + Unpin + Send> {
    Plain(Passthrough<StreamSource<R>>),
    V1(V1Decoder<StreamSource<R>>),
    V2(V2Decoder<StreamSource<R>>),
    Both(DualDecoder<StreamSource<R>>),
}

impl<R: AsyncRead + Unpin + Send> ProxyReader<R> {
    pub fn new(stream: R, mode: DetectMode) -> Self {
        let source = StreamSource::new(stream);
        match mode {
            DetectMode::None => ProxyReader::Plain(Passthrough::new(source)),
            DetectMode::V1 => ProxyReader::V1(V1Decoder::new(source)),
            DetectMode::V2 => ProxyReader::V2(V2Decoder::new(source)),
            DetectMode::Both => ProxyReader::Both(DualDecoder::new(source)),
        }
    }

    /// Read payload bytes, stripping a detected header first.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ProxyReader::Plain(r) => r.read(buf).await,
            ProxyReader::V1(r) => r.read(buf).await,
            ProxyReader::V2(r) => r.read(buf).await,
            ProxyReader::Both(r) => r.read(buf).await,
        }
    }

    /// Read the remaining payload to the end of the stream.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let mut total = 0;
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    /// The decoded header, if one was found. Runs detection on first use.
    pub async fn descriptor(&mut self) -> Option<&ProtocolDescriptor> {
        match self {
            ProxyReader::Plain(_) => None,
            ProxyReader::V1(r) => {
                r.resolve().await;
                r.descriptor()
            }
            ProxyReader::V2(r) => {
                r.resolve().await;
                r.descriptor()
            }
            ProxyReader::Both(r) => {
                r.resolve().await;
                r.descriptor()
            }
        }
    }

    /// Error from a header that was recognized but malformed.
    ///
    /// Plain signature mismatches are not reported here; they mean the
    /// stream simply carried no header.
    pub fn detect_error(&self) -> Option<&DetectError> {
        match self {
            ProxyReader::Plain(_) => None,
            ProxyReader::V1(r) => r.state().failure(),
            ProxyReader::V2(r) => r.state().failure(),
            ProxyReader::Both(r) => r.detect_error(),
        }
    }
}
