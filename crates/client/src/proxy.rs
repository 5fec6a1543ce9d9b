//! Outbound stream establishment, with optional system-proxy tunneling.
//!
//! When `use_system_proxy` is set, the standard proxy environment
//! variables are consulted and the socket is tunneled through the proxy
//! with an HTTP CONNECT handshake. Otherwise a direct TCP connection is
//! made.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tracing::{debug, warn};

use crate::types::ClientError;

/// Environment variables checked for the system proxy, in order.
const PROXY_ENV_VARS: [&str; 6] = [
    "HTTPS_PROXY",
    "https_proxy",
    "HTTP_PROXY",
    "http_proxy",
    "ALL_PROXY",
    "all_proxy",
];

/// Maximum bytes of CONNECT response headers read before giving up.
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Opens the TCP stream the WebSocket handshake will run over.
pub(crate) async fn establish_stream(
    request: &Request,
    use_system_proxy: bool,
) -> Result<TcpStream, ClientError> {
    let uri = request.uri();
    let host = uri
        .host()
        .ok_or_else(|| ClientError::Transport(format!("no host in url {uri}")))?;
    let port = uri
        .port_u16()
        .unwrap_or(if uri.scheme_str() == Some("wss") { 443 } else { 80 });

    if use_system_proxy {
        if let Some(proxy) = system_proxy() {
            debug!(%proxy, host, port, "connecting through system proxy");
            return connect_via_proxy(&proxy, host, port).await;
        }
        warn!("use_system_proxy set but no proxy configured in environment");
    }

    Ok(TcpStream::connect((host, port)).await?)
}

/// Returns the first usable `host:port` from the proxy environment.
fn system_proxy() -> Option<String> {
    let raw = PROXY_ENV_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))?;
    proxy_host_port(&raw)
}

/// Extracts `host:port` from a proxy URL, tolerating a scheme prefix and
/// a trailing slash. Proxies without an explicit port are rejected.
fn proxy_host_port(raw: &str) -> Option<String> {
    let rest = raw.split_once("://").map_or(raw, |(_, rest)| rest);
    let host_port = rest.trim_end_matches('/');
    if host_port.is_empty() || !host_port.contains(':') {
        warn!(proxy = raw, "ignoring proxy without host:port");
        return None;
    }
    Some(host_port.to_string())
}

/// Establishes an HTTP CONNECT tunnel to `host:port` through the proxy.
async fn connect_via_proxy(
    proxy: &str,
    host: &str,
    port: u16,
) -> Result<TcpStream, ClientError> {
    let mut stream = TcpStream::connect(proxy).await?;

    let connect = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    stream.write_all(connect.as_bytes()).await?;

    // Read until the end of the response headers.
    let mut response = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ClientError::Transport("proxy closed during CONNECT".into()));
        }
        response.extend_from_slice(&buf[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if response.len() > MAX_CONNECT_RESPONSE {
            return Err(ClientError::Transport("oversized CONNECT response".into()));
        }
    }

    let status_line = response
        .split(|&b| b == b'\r')
        .next()
        .map(|l| String::from_utf8_lossy(l).into_owned())
        .unwrap_or_default();
    if !connect_succeeded(&status_line) {
        return Err(ClientError::Transport(format!(
            "proxy CONNECT failed: {status_line}"
        )));
    }

    Ok(stream)
}

/// A CONNECT succeeded iff the status line carries a 2xx code.
fn connect_succeeded(status_line: &str) -> bool {
    status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code.starts_with('2'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_host_port_strips_scheme() {
        assert_eq!(
            proxy_host_port("http://proxy.local:3128"),
            Some("proxy.local:3128".into())
        );
        assert_eq!(
            proxy_host_port("http://proxy.local:3128/"),
            Some("proxy.local:3128".into())
        );
    }

    #[test]
    fn proxy_host_port_accepts_bare_hostport() {
        assert_eq!(
            proxy_host_port("10.0.0.1:8080"),
            Some("10.0.0.1:8080".into())
        );
    }

    #[test]
    fn proxy_without_port_is_rejected() {
        assert_eq!(proxy_host_port("http://proxy.local"), None);
        assert_eq!(proxy_host_port(""), None);
    }

    #[test]
    fn connect_status_parsing() {
        assert!(connect_succeeded("HTTP/1.1 200 Connection established"));
        assert!(connect_succeeded("HTTP/1.0 200 OK"));
        assert!(!connect_succeeded("HTTP/1.1 407 Proxy Authentication Required"));
        assert!(!connect_succeeded("garbage"));
    }
}
