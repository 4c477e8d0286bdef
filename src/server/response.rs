//! Echo response rendering
//!
//! Builds the JSON document written back to callers: where the connection
//! came from (including any decoded PROXY protocol header) and what the
//! payload looked like, echoed as base64 plus JSON and HTTP/1.x
//! interpretations when the bytes parse as either.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;

use crate::config::ServerConfig;
use crate::protocol::{ProtocolDescriptor, ProxyReader};

/// Response document for one connection.
#[derive(Debug, Serialize)]
pub struct EchoResponse {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,

    pub origin: Origin,
}

/// Where the connection came from.
#[derive(Debug, Serialize)]
pub struct Origin {
    #[serde(rename = "client-ip", skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,

    #[serde(rename = "remote-ip", skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,

    #[serde(rename = "proxy-protocol", skip_serializing_if = "Option::is_none")]
    pub proxy_protocol: Option<ProxyProtocolInfo>,
}

/// Decoded PROXY protocol header, rendered for the response.
#[derive(Debug, Serialize)]
pub struct ProxyProtocolInfo {
    pub version: String,
    pub protocol: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

/// The connection payload, echoed in every form it parses as.
#[derive(Debug, Serialize)]
pub struct Payload {
    pub base64: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpPayload>,
}

/// Summary of an HTTP/1.x request head found in the payload.
#[derive(Debug, Serialize)]
pub struct HttpPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Vec<String>>,
}

/// Build the echo response for one connection's buffered bytes.
///
/// Runs the configured decoder over `data`, separating a PROXY protocol
/// header (if any) from the payload.
pub async fn build_response(
    config: &ServerConfig,
    remote: Option<SocketAddr>,
    data: &[u8],
    mut errors: Vec<String>,
) -> EchoResponse {
    let mut reader = ProxyReader::new(data, config.proxy_protocol);

    let mut body = Vec::new();
    if let Err(e) = reader.read_to_end(&mut body).await {
        errors.push(e.to_string());
    }

    let descriptor = reader.descriptor().await.cloned();
    if let Some(err) = reader.detect_error() {
        errors.push(err.to_string());
    }

    EchoResponse {
        errors,
        payload: build_payload(&body),
        origin: build_origin(config, remote, descriptor.as_ref()),
    }
}

fn build_origin(
    config: &ServerConfig,
    remote: Option<SocketAddr>,
    descriptor: Option<&ProtocolDescriptor>,
) -> Origin {
    let remote_ip = remote.map(|addr| addr.ip());
    let mut client_ip = remote_ip;

    // The address reported in the header wins over the peer address, but
    // only when the peer sending it is trusted.
    if let (Some(descriptor), Some(remote_ip)) = (descriptor, remote_ip) {
        if config.is_trusted(remote_ip) {
            if let Some(source_ip) = descriptor.source_ip() {
                client_ip = Some(source_ip);
            }
        }
    }

    Origin {
        client_ip: client_ip.map(|ip| ip.to_string()),
        remote_ip: remote_ip.map(|ip| ip.to_string()),
        proxy_protocol: descriptor.map(|d| ProxyProtocolInfo {
            version: d.version.to_string(),
            protocol: d.transport.to_string(),
            source: d.source_display(),
            destination: d.destination_display(),
        }),
    }
}

fn build_payload(data: &[u8]) -> Option<Payload> {
    if data.is_empty() {
        return None;
    }

    Some(Payload {
        base64: BASE64.encode(data),
        json: serde_json::from_slice(data).ok(),
        http: parse_http(data),
    })
}

/// Summarize the payload as an HTTP/1.x request when it parses as one.
fn parse_http(data: &[u8]) -> Option<HttpPayload> {
    let mut header_storage = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut header_storage);
    match request.parse(data) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }

    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for header in request.headers.iter() {
        headers
            .entry(header.name.to_string())
            .or_default()
            .push(String::from_utf8_lossy(header.value).into_owned());
    }

    Some(HttpPayload {
        method: request.method.map(str::to_string),
        url: request.path.map(str::to_string),
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DetectMode;

    fn config(mode: DetectMode) -> ServerConfig {
        ServerConfig {
            proxy_protocol: mode,
            ..ServerConfig::default()
        }
    }

    fn remote() -> Option<SocketAddr> {
        Some("192.0.2.7:40000".parse().unwrap())
    }

    #[tokio::test]
    async fn test_response_with_v1_header() {
        let data = b"PROXY TCP4 10.9.8.7 127.0.0.2 50000 8080\r\nHELLO";
        let response = build_response(&config(DetectMode::Both), remote(), data, Vec::new()).await;

        assert!(response.errors.is_empty());

        let info = response.origin.proxy_protocol.expect("proxy protocol");
        assert_eq!(info.version, "v1");
        assert_eq!(info.protocol, "TCP4");
        assert_eq!(info.source.as_deref(), Some("10.9.8.7:50000"));
        assert_eq!(info.destination.as_deref(), Some("127.0.0.2:8080"));

        // default config trusts everyone, so the header source wins
        assert_eq!(response.origin.client_ip.as_deref(), Some("10.9.8.7"));
        assert_eq!(response.origin.remote_ip.as_deref(), Some("192.0.2.7"));

        let payload = response.payload.expect("payload");
        assert_eq!(payload.base64, BASE64.encode(b"HELLO"));
        assert!(payload.json.is_none());
        assert!(payload.http.is_none());
    }

    #[tokio::test]
    async fn test_response_untrusted_peer_keeps_remote_ip() {
        let mut cfg = config(DetectMode::Both);
        cfg.trusted_proxies = vec!["10.0.0.0/8".parse().unwrap()];

        let data = b"PROXY TCP4 10.9.8.7 127.0.0.2 50000 8080\r\n";
        let response = build_response(&cfg, remote(), data, Vec::new()).await;

        assert!(response.origin.proxy_protocol.is_some());
        assert_eq!(response.origin.client_ip.as_deref(), Some("192.0.2.7"));
    }

    #[tokio::test]
    async fn test_response_without_header() {
        let response =
            build_response(&config(DetectMode::Both), remote(), b"HELLO", Vec::new()).await;

        assert!(response.origin.proxy_protocol.is_none());
        assert_eq!(response.origin.client_ip.as_deref(), Some("192.0.2.7"));
        assert_eq!(response.payload.expect("payload").base64, BASE64.encode(b"HELLO"));
    }

    #[tokio::test]
    async fn test_response_empty_connection() {
        let response = build_response(&config(DetectMode::Both), None, b"", Vec::new()).await;

        assert!(response.payload.is_none());
        assert!(response.origin.client_ip.is_none());
        assert!(response.origin.proxy_protocol.is_none());
    }

    #[tokio::test]
    async fn test_response_reports_malformed_header() {
        let data = b"PROXY TCP4 127.0.0.1 127.0.0.2 90000 8080\r\nBODY";
        let response = build_response(&config(DetectMode::Both), remote(), data, Vec::new()).await;

        assert!(response.origin.proxy_protocol.is_none());
        assert_eq!(response.errors, vec!["could not parse source port"]);
        // the stream is passed through untouched
        assert_eq!(
            response.payload.expect("payload").base64,
            BASE64.encode(data)
        );
    }

    #[tokio::test]
    async fn test_json_payload_is_echoed() {
        let response = build_response(
            &config(DetectMode::None),
            remote(),
            br#"{"hello": "world"}"#,
            Vec::new(),
        )
        .await;

        let payload = response.payload.expect("payload");
        assert_eq!(payload.json, Some(serde_json::json!({"hello": "world"})));
    }

    #[tokio::test]
    async fn test_http_payload_is_summarized() {
        let data = b"GET /status?x=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let response = build_response(&config(DetectMode::None), remote(), data, Vec::new()).await;

        let http = response.payload.expect("payload").http.expect("http");
        assert_eq!(http.method.as_deref(), Some("GET"));
        assert_eq!(http.url.as_deref(), Some("/status?x=1"));
        assert_eq!(http.headers["Host"], vec!["example.com"]);
    }

    #[tokio::test]
    async fn test_detection_disabled_leaves_header_in_payload() {
        let data = b"PROXY UNKNOWN\r\nBODY";
        let response = build_response(&config(DetectMode::None), remote(), data, Vec::new()).await;

        assert!(response.origin.proxy_protocol.is_none());
        assert_eq!(
            response.payload.expect("payload").base64,
            BASE64.encode(data)
        );
    }
}
