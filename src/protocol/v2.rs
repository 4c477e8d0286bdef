//! PROXY protocol v2 (binary header) decoder
//!
//! The v2 header is a 12-byte signature, one version/command byte, one
//! address-family/transport byte, a big-endian 16-bit length, and then
//! `length` bytes of address fields plus optional TLV extensions. All
//! multi-byte integers are big-endian.
//!
//! The decoder peeks field by field so malformed input beyond the
//! signature never forces reading bytes that do not belong to the header.
//! TLV bytes are pulled in for byte accounting but not interpreted.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use log::{debug, trace};

use super::buffer::LookaheadBuffer;
use super::{
    ByteSource, DetectError, DetectState, Endpoints, ProtocolDescriptor, ProtocolVersion, Transport,
};

const SIGNATURE: &[u8] = &[
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version/command byte: version 2 in the high nibble, LOCAL or PROXY in
/// the low nibble.
const COMMAND_LOCAL: u8 = 0x20;
const COMMAND_PROXY: u8 = 0x21;

/// Signature + command + family + length.
const FIXED_HEADER_LEN: usize = 16;

/// Fixed-width UNIX socket path field.
const UNIX_PATH_LEN: usize = 108;

/// Address family (high nibble) and transport (low nibble) groupings that
/// share a wire layout.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Family {
    Unspec,
    Inet4,
    Inet6,
    Unix,
}

impl Family {
    /// Minimum address block length the family requires.
    fn min_block_len(self) -> u16 {
        match self {
            Family::Unspec => 0,
            Family::Inet4 => 12,
            Family::Inet6 => 36,
            Family::Unix => 216,
        }
    }
}

/// Decoder for the v2 binary header.
pub struct V2Decoder<S> {
    buffer: LookaheadBuffer<S>,
    state: DetectState,
}

impl<S: ByteSource> V2Decoder<S> {
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
                debug!("v2 header found: {}", descriptor.transport);
            }
            DetectState::Failed(err) => debug!("malformed v2 header: {}", err),
            DetectState::Absent(err) => trace!("no v2 header: {}", err),
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

    pub fn source_ref(&self) -> &S {
        self.buffer.source_ref()
    }

    pub fn source_mut(&mut self) -> &mut S {
        self.buffer.source_mut()
    }

    /// Parse the header from the head of the stream. Returns the state to
    /// record and the number of bytes the header occupied; rejections
    /// always account for zero bytes.
    async fn detect(&mut self) -> (DetectState, usize) {
        match self.buffer.peek(SIGNATURE.len()).await {
            Ok(sig) if sig == SIGNATURE => {}
            Ok(sig) if sig.is_empty() => {
                return (DetectState::Absent(DetectError::UnexpectedEos), 0)
            }
            Ok(_) => return (DetectState::Absent(DetectError::SignatureMismatch), 0),
            Err(err) => return (DetectState::Absent(DetectError::Io(err.to_string())), 0),
        }

        // Signature recognized; everything below is a malformed header.
        let command = match self.buffer.peek_byte().await {
            Ok(Some(byte)) => byte,
            Ok(None) => return (DetectState::Failed(DetectError::TruncatedHeader), 0),
            Err(err) => return (DetectState::Failed(DetectError::Io(err.to_string())), 0),
        };
        if command != COMMAND_LOCAL && command != COMMAND_PROXY {
            return (DetectState::Failed(DetectError::UnknownCommand(command)), 0);
        }

        let family_byte = match self.buffer.peek_byte().await {
            Ok(Some(byte)) => byte,
            Ok(None) => return (DetectState::Failed(DetectError::TruncatedHeader), 0),
            Err(err) => return (DetectState::Failed(DetectError::Io(err.to_string())), 0),
        };
        let (transport, family) = match family_byte {
            0x00 => (Transport::Unspec, Family::Unspec),
            0x11 => (Transport::TcpV4, Family::Inet4),
            0x12 => (Transport::UdpV4, Family::Inet4),
            0x21 => (Transport::TcpV6, Family::Inet6),
            0x22 => (Transport::UdpV6, Family::Inet6),
            0x31 => (Transport::UnixStream, Family::Unix),
            0x32 => (Transport::UnixDatagram, Family::Unix),
            other => return (DetectState::Failed(DetectError::UnknownTransport(other)), 0),
        };

        let length = {
            let bytes = match self.buffer.peek(2).await {
                Ok(bytes) => bytes,
                Err(err) => return (DetectState::Failed(DetectError::Io(err.to_string())), 0),
            };
            if bytes.len() < 2 {
                return (DetectState::Failed(DetectError::TruncatedHeader), 0);
            }
            u16::from_be_bytes([bytes[0], bytes[1]])
        };

        // UNSPEC carries no address block; anything longer is malformed.
        if family == Family::Unspec {
            if length != 0 {
                return (DetectState::Failed(DetectError::UnspecWithPayload), 0);
            }
            let descriptor = ProtocolDescriptor {
                version: ProtocolVersion::V2,
                transport,
                endpoints: Endpoints::None,
            };
            return (DetectState::Found(descriptor), FIXED_HEADER_LEN);
        }

        let min = family.min_block_len();
        if length < min {
            return (
                DetectState::Failed(DetectError::AddressBlockTooShort {
                    family: transport,
                    min,
                    got: length,
                }),
                0,
            );
        }

        // The block is the fixed address prefix for the family plus any
        // TLV extension bytes, which are consumed but not interpreted.
        let endpoints = {
            let block = match self.buffer.peek(length as usize).await {
                Ok(block) => block,
                Err(err) => return (DetectState::Failed(DetectError::Io(err.to_string())), 0),
            };
            if block.len() != length as usize {
                return (
                    DetectState::Failed(DetectError::TruncatedAddressBlock {
                        expected: length as usize,
                        got: block.len(),
                    }),
                    0,
                );
            }

            match family {
                Family::Inet4 => inet4_endpoints(block),
                Family::Inet6 => inet6_endpoints(block),
                Family::Unix => unix_endpoints(block),
                Family::Unspec => Endpoints::None,
            }
        };

        let descriptor = ProtocolDescriptor {
            version: ProtocolVersion::V2,
            transport,
            endpoints,
        };
        (
            DetectState::Found(descriptor),
            FIXED_HEADER_LEN + length as usize,
        )
    }
}

impl<S: ByteSource> ByteSource for V2Decoder<S> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.resolve().await;
        self.buffer.read(buf).await
    }
}

/// 4-byte source IP, 4-byte destination IP, 2-byte ports, big-endian.
fn inet4_endpoints(block: &[u8]) -> Endpoints {
    let source_ip = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
    let destination_ip = Ipv4Addr::new(block[4], block[5], block[6], block[7]);
    let source_port = u16::from_be_bytes([block[8], block[9]]);
    let destination_port = u16::from_be_bytes([block[10], block[11]]);
    Endpoints::Inet {
        source: SocketAddr::new(source_ip.into(), source_port),
        destination: SocketAddr::new(destination_ip.into(), destination_port),
    }
}

/// 16-byte source IP, 16-byte destination IP, 2-byte ports, big-endian.
fn inet6_endpoints(block: &[u8]) -> Endpoints {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&block[0..16]);
    let source_ip = Ipv6Addr::from(octets);
    octets.copy_from_slice(&block[16..32]);
    let destination_ip = Ipv6Addr::from(octets);
    let source_port = u16::from_be_bytes([block[32], block[33]]);
    let destination_port = u16::from_be_bytes([block[34], block[35]]);
    Endpoints::Inet {
        source: SocketAddr::new(source_ip.into(), source_port),
        destination: SocketAddr::new(destination_ip.into(), destination_port),
    }
}

/// Two fixed 108-byte NUL-terminated path fields; a field without a NUL
/// spans its full width.
fn unix_endpoints(block: &[u8]) -> Endpoints {
    Endpoints::Unix {
        source: unix_path(&block[0..UNIX_PATH_LEN]),
        destination: unix_path(&block[UNIX_PATH_LEN..2 * UNIX_PATH_LEN]),
    }
}

fn unix_path(field: &[u8]) -> PathBuf {
    let end = field
        .iter()
        .position(|&byte| byte == 0)
        .unwrap_or(field.len());
    PathBuf::from(String::from_utf8_lossy(&field[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StreamSource;

    fn decoder(data: &[u8]) -> V2Decoder<StreamSource<&[u8]>> {
        V2Decoder::new(StreamSource::new(data))
    }

    async fn read_all<S: ByteSource>(source: &mut S) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = source.read(&mut chunk).await.unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    fn header(command: u8, family: u8, block: &[u8]) -> Vec<u8> {
        let mut out = SIGNATURE.to_vec();
        out.push(command);
        out.push(family);
        out.extend_from_slice(&(block.len() as u16).to_be_bytes());
        out.extend_from_slice(block);
        out
    }

    fn inet4_block(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut block = Vec::new();
        block.extend_from_slice(&src);
        block.extend_from_slice(&dst);
        block.extend_from_slice(&src_port.to_be_bytes());
        block.extend_from_slice(&dst_port.to_be_bytes());
        block
    }

    fn inet6_block(src: [u8; 16], dst: [u8; 16], src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut block = Vec::new();
        block.extend_from_slice(&src);
        block.extend_from_slice(&dst);
        block.extend_from_slice(&src_port.to_be_bytes());
        block.extend_from_slice(&dst_port.to_be_bytes());
        block
    }

    fn unix_block(src: &str, dst: &str) -> Vec<u8> {
        let mut block = vec![0u8; 216];
        block[..src.len()].copy_from_slice(src.as_bytes());
        block[108..108 + dst.len()].copy_from_slice(dst.as_bytes());
        block
    }

    #[tokio::test]
    async fn test_passthrough_without_header() {
        for input in [
            &b""[..],
            b"TEST",
            b"PROXY UNKNOWN\r\n",
            b"PROXY UNKNOWN kjk jkj\r\nGAGA",
            SIGNATURE,
        ] {
            let mut d = decoder(input);
            assert_eq!(read_all(&mut d).await, input);
            assert!(d.descriptor().is_none());
        }
    }

    #[tokio::test]
    async fn test_unspec_local_round_trip() {
        let input = header(COMMAND_LOCAL, 0x00, &[]);
        let mut d = decoder(&input);
        d.resolve().await;

        let descriptor = d.descriptor().expect("descriptor");
        assert_eq!(descriptor.version, ProtocolVersion::V2);
        assert_eq!(descriptor.transport, Transport::Unspec);
        assert_eq!(descriptor.endpoints, Endpoints::None);
        assert_eq!(read_all(&mut d).await, b"");
    }

    #[tokio::test]
    async fn test_tcpv4_round_trip() {
        let input = header(
            COMMAND_PROXY,
            0x11,
            &inet4_block([127, 0, 0, 1], [127, 0, 0, 2], 50000, 8080),
        );
        let mut d = decoder(&input);
        d.resolve().await;

        let descriptor = d.descriptor().expect("descriptor").clone();
        assert_eq!(descriptor.transport, Transport::TcpV4);
        assert_eq!(
            descriptor.endpoints,
            Endpoints::Inet {
                source: "127.0.0.1:50000".parse().unwrap(),
                destination: "127.0.0.2:8080".parse().unwrap(),
            }
        );
        assert_eq!(read_all(&mut d).await, b"");
    }

    #[tokio::test]
    async fn test_udpv4_round_trip_with_body() {
        let mut input = header(
            COMMAND_PROXY,
            0x12,
            &inet4_block([10, 0, 0, 1], [10, 0, 0, 2], 1234, 5678),
        );
        input.extend_from_slice(b"BODY");
        let mut d = decoder(&input);
        d.resolve().await;

        assert_eq!(d.descriptor().expect("descriptor").transport, Transport::UdpV4);
        assert_eq!(read_all(&mut d).await, b"BODY");
    }

    #[tokio::test]
    async fn test_tcpv6_round_trip() {
        let mut src = [0u8; 16];
        src[15] = 1;
        let mut dst = [0u8; 16];
        dst[15] = 2;
        let input = header(COMMAND_PROXY, 0x21, &inet6_block(src, dst, 50000, 7070));
        let mut d = decoder(&input);
        d.resolve().await;

        let descriptor = d.descriptor().expect("descriptor").clone();
        assert_eq!(descriptor.transport, Transport::TcpV6);
        assert_eq!(descriptor.transport.to_string(), "TCPv6");
        assert_eq!(
            descriptor.endpoints,
            Endpoints::Inet {
                source: "[::1]:50000".parse().unwrap(),
                destination: "[::2]:7070".parse().unwrap(),
            }
        );
        assert_eq!(read_all(&mut d).await, b"");
    }

    #[tokio::test]
    async fn test_udpv6_round_trip() {
        let mut src = [0u8; 16];
        src[15] = 1;
        let mut dst = [0u8; 16];
        dst[15] = 2;
        let input = header(COMMAND_PROXY, 0x22, &inet6_block(src, dst, 50000, 7070));
        let mut d = decoder(&input);
        d.resolve().await;

        assert_eq!(d.descriptor().expect("descriptor").transport, Transport::UdpV6);
        assert_eq!(read_all(&mut d).await, b"");
    }

    #[tokio::test]
    async fn test_unix_stream_round_trip() {
        let input = header(
            COMMAND_PROXY,
            0x31,
            &unix_block("/path/to/unix.sock", "/path/to/other.sock"),
        );
        let mut d = decoder(&input);
        d.resolve().await;

        let descriptor = d.descriptor().expect("descriptor").clone();
        assert_eq!(descriptor.transport, Transport::UnixStream);
        assert_eq!(
            descriptor.endpoints,
            Endpoints::Unix {
                source: PathBuf::from("/path/to/unix.sock"),
                destination: PathBuf::from("/path/to/other.sock"),
            }
        );
        assert_eq!(read_all(&mut d).await, b"");
    }

    #[tokio::test]
    async fn test_unix_datagram_round_trip() {
        let input = header(COMMAND_LOCAL, 0x32, &unix_block("/a.sock", "/b.sock"));
        let mut d = decoder(&input);
        d.resolve().await;

        assert_eq!(
            d.descriptor().expect("descriptor").transport,
            Transport::UnixDatagram
        );
    }

    #[tokio::test]
    async fn test_unix_path_without_terminator_spans_field() {
        let long = "x".repeat(108);
        let mut block = vec![0u8; 216];
        block[..108].copy_from_slice(long.as_bytes());
        block[108..114].copy_from_slice(b"/other");
        let input = header(COMMAND_PROXY, 0x31, &block);
        let mut d = decoder(&input);
        d.resolve().await;

        let descriptor = d.descriptor().expect("descriptor");
        assert_eq!(
            descriptor.endpoints,
            Endpoints::Unix {
                source: PathBuf::from(long),
                destination: PathBuf::from("/other"),
            }
        );
    }

    #[tokio::test]
    async fn test_tlv_bytes_consumed_but_ignored() {
        let mut block = inet4_block([127, 0, 0, 1], [127, 0, 0, 2], 50000, 8080);
        // one NOOP TLV: type 0x04, length 5, five bytes of padding
        block.extend_from_slice(&[0x04, 0x00, 0x05, 0, 0, 0, 0, 0]);
        let mut input = header(COMMAND_PROXY, 0x11, &block);
        input.extend_from_slice(b"BODY");

        let mut d = decoder(&input);
        d.resolve().await;

        assert_eq!(d.descriptor().expect("descriptor").transport, Transport::TcpV4);
        assert_eq!(read_all(&mut d).await, b"BODY");
    }

    #[tokio::test]
    async fn test_partial_length_rejected() {
        let input = header(COMMAND_PROXY, 0x11, &[0u8; 8]);
        let mut d = decoder(&input);
        d.resolve().await;

        assert_eq!(
            d.state(),
            &DetectState::Failed(DetectError::AddressBlockTooShort {
                family: Transport::TcpV4,
                min: 12,
                got: 8,
            })
        );
        assert_eq!(read_all(&mut d).await, input);
    }

    #[tokio::test]
    async fn test_unspec_with_nonzero_length_rejected() {
        let input = header(COMMAND_LOCAL, 0x00, &[0u8; 4]);
        let mut d = decoder(&input);
        d.resolve().await;

        assert!(matches!(
            d.state(),
            DetectState::Failed(DetectError::UnspecWithPayload)
        ));
        assert_eq!(read_all(&mut d).await, input);
    }

    #[tokio::test]
    async fn test_unknown_command_rejected() {
        let input = header(0x42, 0x11, &inet4_block([0; 4], [0; 4], 0, 0));
        let mut d = decoder(&input);
        d.resolve().await;

        assert!(matches!(
            d.state(),
            DetectState::Failed(DetectError::UnknownCommand(0x42))
        ));
        assert_eq!(read_all(&mut d).await, input);
    }

    #[tokio::test]
    async fn test_unknown_family_rejected() {
        let input = header(COMMAND_PROXY, 0x41, &[]);
        let mut d = decoder(&input);
        d.resolve().await;

        assert!(matches!(
            d.state(),
            DetectState::Failed(DetectError::UnknownTransport(0x41))
        ));
        assert_eq!(read_all(&mut d).await, input);
    }

    #[tokio::test]
    async fn test_truncated_after_signature() {
        let mut input = SIGNATURE.to_vec();
        input.push(COMMAND_PROXY);
        let mut d = decoder(&input);
        d.resolve().await;

        assert!(matches!(
            d.state(),
            DetectState::Failed(DetectError::TruncatedHeader)
        ));
        assert_eq!(read_all(&mut d).await, input);
    }

    #[tokio::test]
    async fn test_truncated_address_block() {
        let mut input = SIGNATURE.to_vec();
        input.push(COMMAND_PROXY);
        input.push(0x11);
        input.extend_from_slice(&12u16.to_be_bytes());
        input.extend_from_slice(&[0u8; 8]); // 8 of the declared 12 bytes

        let mut d = decoder(&input);
        d.resolve().await;

        assert_eq!(
            d.state(),
            &DetectState::Failed(DetectError::TruncatedAddressBlock {
                expected: 12,
                got: 8,
            })
        );
        assert_eq!(read_all(&mut d).await, input);
    }
}
